use crate::paths::Paths;
use crate::protocol::{self, Request, Response};
use color_eyre::eyre::bail;
use owo_colors::OwoColorize;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

const CONNECT_RETRIES: u32 = 3;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Sends one command and prints the response stream: ok lines to stdout,
/// error lines in red to stderr. Returns true if the daemon reported any
/// error.
pub fn run(paths: &Paths, args: Vec<String>) -> color_eyre::Result<bool> {
    let mut stream = connect_with_retry(paths, CONNECT_RETRIES, CONNECT_DELAY)?;
    stream.write_all(&protocol::encode_request(&Request { args })?)?;

    let mut failed = false;
    for line in BufReader::new(&stream).lines() {
        match protocol::decode_response(&line?)? {
            Response::Ok { message } => print_message(&message),
            Response::Err { message } => {
                failed = true;
                eprintln!("{}", message.red());
            }
            Response::End => break,
        }
    }
    Ok(failed)
}

fn print_message(message: &str) {
    if message.ends_with('\n') {
        print!("{message}");
    } else {
        println!("{message}");
    }
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let mut attempt = 0;
    loop {
        match UnixStream::connect(socket) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                if attempt >= retries {
                    bail!(
                        "failed to connect to daemon at {} after {retries} attempts: {e}",
                        socket.display()
                    );
                }
                std::thread::sleep(delay);
            }
        }
    }
}

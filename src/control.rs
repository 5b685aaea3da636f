use crate::background::Background;
use crate::paths::APP_NAME;
use crate::protocol::{self, ProtocolError, Response};
use crate::registry::{Registry, Services};
use crate::service::{Service, ServiceState};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Accepted connections waiting for a handler. When full, accepting pauses.
pub const CONNECTION_BACKLOG: usize = 10;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const SOCKET_MODE: u32 = 0o775;
const HELP: &str = "valid commands are start, stop, restart, list and log";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    Stop(String),
    Restart(String),
    List,
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("no service named {0}")]
    NoSuchService(String),
    #[error("unknown command {0} - {help}", help = HELP)]
    UnknownCommand(String),
    #[error("command {0} requires exactly one argument")]
    InvalidArguments(String),
    #[error("{0} is already being monitored")]
    AlreadyMonitored(String),
    #[error("{app} is shutting down", app = APP_NAME)]
    ShuttingDown,
}

impl Command {
    /// Parses argv. Command names are case-insensitive.
    pub fn parse(args: &[String]) -> Result<Command, ControlError> {
        let Some((cmd, rest)) = args.split_first() else {
            return Err(ControlError::UnknownCommand(String::new()));
        };
        let cmd = cmd.to_lowercase();
        match cmd.as_str() {
            "start" => Ok(Command::Start(single_argument(&cmd, rest)?)),
            "stop" => Ok(Command::Stop(single_argument(&cmd, rest)?)),
            "restart" => Ok(Command::Restart(single_argument(&cmd, rest)?)),
            "log" => Ok(Command::Log(single_argument(&cmd, rest)?)),
            "list" => Ok(Command::List),
            _ => Err(ControlError::UnknownCommand(cmd)),
        }
    }
}

fn single_argument(cmd: &str, rest: &[String]) -> Result<String, ControlError> {
    match rest {
        [name] => Ok(name.clone()),
        _ => Err(ControlError::InvalidArguments(cmd.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Writes response frames to one client.
pub struct Responder<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> Responder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, response: &Response) -> Result<(), ProtocolError> {
        let encoded = protocol::encode_response(response)?;
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn ok(&mut self, message: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Response::ok(message)).await
    }

    pub async fn err(&mut self, message: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Response::err(message)).await
    }

    pub async fn end(&mut self) -> Result<(), ProtocolError> {
        self.send(&Response::End).await
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Serves one client: reads a single request, runs it and writes the
/// response stream. Once `token` is cancelled no new command touches the
/// registry; a command already holding the lock runs to completion.
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    registry: &Registry,
    token: &CancellationToken,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        read = reader.read_line(&mut line) => { read?; }
    }
    if line.is_empty() {
        return Ok(());
    }

    let request = protocol::decode_request(&line)?;
    let mut out = Responder::new(writer);
    if request.args.is_empty() {
        return out.end().await;
    }

    tracing::debug!(args = ?request.args, "control request");
    match Command::parse(&request.args) {
        Ok(Command::Log(name)) => return stream_log(&name, registry, token, reader, out).await,
        Ok(command) => execute(command, registry, token, &mut out).await?,
        Err(e) => out.err(e.to_string()).await?,
    }
    out.end().await
}

/// Runs a non-streaming command. The registry stays locked for the whole
/// command, so a restart's stop and start are never interleaved with other
/// registry changes.
async fn execute<W>(
    command: Command,
    registry: &Registry,
    token: &CancellationToken,
    out: &mut Responder<W>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let Some(mut services) = lock_unless_cancelled(registry, token).await else {
        return out.err(ControlError::ShuttingDown.to_string()).await;
    };
    match command {
        Command::List => {
            let rendered = render_list(&services);
            drop(services);
            out.ok(rendered).await
        }
        Command::Start(name) => {
            let Some(service) = services.find_mut(&name) else {
                return out.err(ControlError::NoSuchService(name).to_string()).await;
            };
            if service.state().is_active() {
                return out.err(ControlError::AlreadyRunning(name).to_string()).await;
            }
            start_service(service, out).await.map(|_| ())
        }
        Command::Stop(name) => {
            let Some(service) = services.find_mut(&name) else {
                return out.err(ControlError::NoSuchService(name).to_string()).await;
            };
            if !service.is_running() {
                return out.err(ControlError::NotRunning(name).to_string()).await;
            }
            stop_service(service, out).await.map(|_| ())
        }
        Command::Restart(name) => {
            let Some(service) = services.find_mut(&name) else {
                return out.err(ControlError::NoSuchService(name).to_string()).await;
            };
            if !service.is_running() {
                return out.err(ControlError::NotRunning(name).to_string()).await;
            }
            if stop_service(service, out).await? {
                start_service(service, out).await?;
            }
            Ok(())
        }
        // Streamed by handle_connection.
        Command::Log(_) => Ok(()),
    }
}

async fn start_service<W>(service: &mut Service, out: &mut Responder<W>) -> Result<bool, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let name = service.name().to_string();
    out.ok(format!("starting {name}")).await?;
    match service.start().await {
        Ok(()) => {
            out.ok(format!("started {name}")).await?;
            Ok(true)
        }
        Err(e) => {
            out.err(e.to_string()).await?;
            Ok(false)
        }
    }
}

async fn stop_service<W>(service: &mut Service, out: &mut Responder<W>) -> Result<bool, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let name = service.name().to_string();
    out.ok(format!("stopping {name}")).await?;
    match service.stop().await {
        Ok(()) => {
            out.ok(format!("stopped {name}")).await?;
            Ok(true)
        }
        Err(e) => {
            out.err(e.to_string()).await?;
            Ok(false)
        }
    }
}

/// Waits for the registry lock, giving up as soon as the server is stopping.
async fn lock_unless_cancelled<'a>(
    registry: &'a Registry,
    token: &CancellationToken,
) -> Option<Services<'a>> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        services = registry.lock() => Some(services),
    }
}

/// Streams a running service's output until the client sends anything,
/// hangs up or the server stops. No `End` frame is written on that path.
async fn stream_log<R, W>(
    name: &str,
    registry: &Registry,
    token: &CancellationToken,
    mut reader: BufReader<R>,
    mut out: Responder<W>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let subscribed = {
        let services = lock_unless_cancelled(registry, token).await;
        match services.as_ref().map(|services| services.find(name)) {
            None => Err(ControlError::ShuttingDown),
            Some(None) => Err(ControlError::NoSuchService(name.to_string())),
            Some(Some(service)) if !service.is_running() => {
                Err(ControlError::NotRunning(name.to_string()))
            }
            Some(Some(service)) => service
                .tap()
                .subscribe()
                .map_err(|_| ControlError::AlreadyMonitored(name.to_string())),
        }
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => {
            out.err(e.to_string()).await?;
            return out.end().await;
        }
    };

    tracing::debug!(service = %name, "log subscriber attached");
    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = subscription.recv() => {
                let Some(line) = line else { break };
                let sent = tokio::select! {
                    _ = token.cancelled() => break,
                    sent = out.ok(line.framed()) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            _ = reader.read(&mut byte) => break,
        }
    }

    // The tap slot has its own lock; the registry may be held by shutdown.
    drop(subscription);
    tracing::debug!(service = %name, "log subscriber detached");
    Ok(())
}

// ---------------------------------------------------------------------------
// List rendering
// ---------------------------------------------------------------------------

pub fn render_list(services: &Services<'_>) -> String {
    let mut out = String::from("SERVICE\tSTATUS\n");
    for service in services.iter() {
        let _ = writeln!(out, "{}\t{}", service.name(), status_line(service));
    }
    out.push('\n');
    out
}

pub fn status_line(service: &Service) -> String {
    match service.state() {
        ServiceState::Stopped => "STOPPED".to_string(),
        ServiceState::Stopping => "STOPPING".to_string(),
        ServiceState::Starting => "STARTING".to_string(),
        ServiceState::Started { since } => match service.restarts() {
            0 => format!("RUNNING since {}", format_time(since)),
            n => format!("RUNNING since {} - {n} restarts", format_time(since)),
        },
        ServiceState::Failed { error } => format!("FAILED - {error}"),
    }
}

fn format_time(time: &DateTime<Local>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct ControlServer {
    listener: UnixListener,
    socket: PathBuf,
    registry: Registry,
}

impl ControlServer {
    /// Binds the control socket, replacing any stale one, and restricts it to
    /// root and the service group when that group exists.
    pub fn bind(socket: &Path, registry: Registry) -> io::Result<Self> {
        remove_socket(socket)?;
        let listener = UnixListener::bind(socket)?;
        restrict_access(socket);
        Ok(Self {
            listener,
            socket: socket.to_path_buf(),
            registry,
        })
    }

    pub fn spawn(self) -> Background {
        Background::spawn("control-server", move |token| self.run(token))
    }

    async fn run(self, token: CancellationToken) {
        let Self {
            listener,
            socket,
            registry,
        } = self;
        tracing::info!(socket = %socket.display(), "control server listening");

        let (tx, mut conns) = mpsc::channel(CONNECTION_BACKLOG);
        let acceptor = tokio::spawn(accept_loop(listener, tx, token.clone()));
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(stream) = conns.recv() => {
                    let registry = registry.clone();
                    let token = token.clone();
                    handlers.spawn(async move {
                        if let Err(e) = serve(stream, &registry, &token).await {
                            tracing::warn!("error serving connection: {e}");
                        }
                    });
                }
                Some(joined) = handlers.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!("connection handler panicked: {e}");
                    }
                }
                else => break,
            }
        }

        let _ = acceptor.await;
        // Queued connections are dropped unserved. Handlers still running
        // bail out at their next lock or read, or finish the command they hold.
        drop(conns);
        while handlers.join_next().await.is_some() {}
        tracing::debug!("control handlers drained");
        if let Err(e) = remove_socket(&socket) {
            tracing::warn!(socket = %socket.display(), "failed to remove socket: {e}");
        }
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<UnixStream>, token: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    tracing::error!("error accepting connection: {e}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        tokio::select! {
            _ = token.cancelled() => return,
            sent = tx.send(stream) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn serve(
    stream: UnixStream,
    registry: &Registry,
    token: &CancellationToken,
) -> Result<(), ProtocolError> {
    let (reader, writer) = stream.into_split();
    handle_connection(reader, writer, registry, token).await
}

fn remove_socket(socket: &Path) -> io::Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn restrict_access(socket: &Path) {
    use nix::unistd::{Group, Uid, chown};
    use std::os::unix::fs::PermissionsExt;

    let group = match Group::from_name(APP_NAME) {
        Ok(Some(group)) => group,
        Ok(None) => {
            tracing::debug!("no {APP_NAME} group, control socket keeps default permissions");
            return;
        }
        Err(e) => {
            tracing::warn!("failed to look up group {APP_NAME}: {e}");
            return;
        }
    };
    if let Err(e) = chown(socket, Some(Uid::from_raw(0)), Some(group.gid)) {
        tracing::warn!(socket = %socket.display(), "failed to chown control socket: {e}");
        return;
    }
    if let Err(e) = std::fs::set_permissions(socket, std::fs::Permissions::from_mode(SOCKET_MODE)) {
        tracing::warn!(socket = %socket.display(), "failed to chmod control socket: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

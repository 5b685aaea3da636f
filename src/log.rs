use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 10 MB rotation threshold
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep up to 3 rotated files (.1, .2, .3)
pub const LOG_ROTATION_KEEP: u32 = 3;

/// Lines queued towards a log subscriber before the copier waits.
pub const LOG_TAP_CAPACITY: usize = 1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

impl LogLine {
    /// The line as shown to a client tailing the service.
    pub fn framed(&self) -> String {
        format!("[{}] {}", self.stream, self.text)
    }
}

// ---------------------------------------------------------------------------
// Log tap: at most one live subscriber per service
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("log output already has a subscriber")]
pub struct AlreadyMonitored;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogLine>,
}

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Delivery point for a service's output. Shared between the service and the
/// log copiers of whatever process currently runs for it.
#[derive(Clone, Default)]
pub struct LogTap {
    slot: Arc<Mutex<Option<Subscriber>>>,
}

impl LogTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Result<LogSubscription, AlreadyMonitored> {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|s| !s.tx.is_closed()) {
            return Err(AlreadyMonitored);
        }
        let id = NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LOG_TAP_CAPACITY);
        *slot = Some(Subscriber { id, tx });
        Ok(LogSubscription {
            id,
            tap: self.clone(),
            rx,
        })
    }

    pub fn is_monitored(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|s| !s.tx.is_closed())
    }

    /// Hands a line to the subscriber, if any. Waits while the subscriber's
    /// queue is full.
    pub async fn publish(&self, line: LogLine) {
        let tx = self.slot.lock().as_ref().map(|s| s.tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(line).await;
        }
    }
}

/// A live subscription. Dropping it frees the tap for the next subscriber.
pub struct LogSubscription {
    id: u64,
    tap: LogTap,
    rx: mpsc::Receiver<LogLine>,
}

impl LogSubscription {
    pub async fn recv(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        let mut slot = self.tap.slot.lock();
        if slot.as_ref().is_some_and(|s| s.id == self.id) {
            *slot = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

pub async fn rotate_log(path: &Path, max_rotations: u32) -> io::Result<()> {
    let oldest = rotated_path(path, max_rotations);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        tokio::fs::remove_file(&oldest).await?;
    }

    for i in (1..max_rotations).rev() {
        let from = rotated_path(path, i);
        let to = rotated_path(path, i + 1);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            tokio::fs::rename(&from, &to).await?;
        }
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, rotated_path(path, 1)).await?;
    }

    Ok(())
}

pub fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

// ---------------------------------------------------------------------------
// Log copier
// ---------------------------------------------------------------------------

pub fn spawn_log_copier(
    service: String,
    stream: LogStream,
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
    tap: LogTap,
) {
    tokio::spawn(async move {
        if let Err(e) = run_log_copier(stream, reader, &log_path, &tap).await {
            tracing::warn!(
                service = %service,
                %stream,
                path = %log_path.display(),
                "log copier stopped: {e}"
            );
        }
    });
}

async fn run_log_copier(
    stream: LogStream,
    reader: impl tokio::io::AsyncRead + Unpin,
    log_path: &Path,
    tap: &LogTap,
) -> io::Result<()> {
    let mut buf_reader = BufReader::new(reader);
    let mut file = open_append(log_path).await?;
    let mut byte_count = tokio::fs::metadata(log_path).await?.len();

    // Raw bytes: child output need not be UTF-8.
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = buf_reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break; // EOF, child exited
        }
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }

        if byte_count + line.len() as u64 > LOG_ROTATION_SIZE {
            file.flush().await?;
            drop(file);
            rotate_log(log_path, LOG_ROTATION_KEEP).await?;
            file = open_append(log_path).await?;
            byte_count = 0;
        }

        file.write_all(&line).await?;
        byte_count += line.len() as u64;

        tap.publish(LogLine {
            stream,
            text: String::from_utf8_lossy(&line).trim_end().to_string(),
        })
        .await;
    }

    file.flush().await?;
    Ok(())
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

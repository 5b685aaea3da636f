use crate::config::{RestartPolicy, ServiceConfig};
use crate::log::{self, LogStream, LogTap};
use crate::paths::Paths;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const BACKOFF_BASE_MS: u64 = 100;
pub const BACKOFF_CAP_MS: u64 = 30_000;
/// A run at least this long clears the crash streak.
pub const MIN_UPTIME: Duration = Duration::from_secs(1);

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SIGKILL_GRACE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("process exited before it could be tracked")]
    Untracked,
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("failed to signal process: {0}")]
    Signal(#[from] Errno),
}

// ---------------------------------------------------------------------------
// Command & signal parsing
// ---------------------------------------------------------------------------

pub fn parse_command(command: &str) -> Result<(String, Vec<String>), ProcessError> {
    let words = shell_words::split(command)
        .map_err(|e| ProcessError::InvalidCommand(format!("failed to parse: {e}")))?;

    let Some((program, args)) = words.split_first() else {
        return Err(ProcessError::InvalidCommand("command is empty".to_string()));
    };
    Ok((program.clone(), args.to_vec()))
}

pub fn parse_signal(name: &str) -> Result<Signal, ProcessError> {
    let normalized = if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&normalized).map_err(|_| ProcessError::InvalidSignal(name.to_string()))
}

// ---------------------------------------------------------------------------
// Running processes
// ---------------------------------------------------------------------------

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Sent by a process monitor when the child it waits on exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitNotice {
    pub run_id: u64,
    pub exit_code: Option<i32>,
}

/// One spawn of a service's command. `run_id` is unique for the daemon's
/// lifetime, so stale exit notices can be told apart from current ones.
#[derive(Debug)]
pub struct RunningProcess {
    pub run_id: u64,
    pub pid: u32,
    pub started: Instant,
}

/// A stop that has been committed to but not yet carried out. Owns the
/// process, so it can run detached from the service it came from.
#[derive(Debug)]
pub struct PendingStop {
    pub process: RunningProcess,
    pub signal: Signal,
    pub timeout: Duration,
}

/// A stop that could not signal the process; the process is handed back.
#[derive(Debug)]
pub struct StopFailure {
    pub process: RunningProcess,
    pub error: ProcessError,
}

impl PendingStop {
    pub async fn run(self) -> Result<(), StopFailure> {
        let pid = Pid::from_raw(self.process.pid as i32);

        match signal::kill(pid, self.signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(StopFailure {
                    process: self.process,
                    error: e.into(),
                });
            }
        }

        // Poll for exit; the monitor task reaps the child.
        let deadline = Instant::now() + self.timeout;
        while signal::kill(pid, None).is_ok() {
            if Instant::now() >= deadline {
                tracing::warn!(pid = self.process.pid, "stop timed out, sending SIGKILL");
                let _ = signal::kill(pid, Signal::SIGKILL);
                tokio::time::sleep(SIGKILL_GRACE).await;
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Spawns service commands and reports their exits on a single channel.
#[derive(Clone)]
pub struct Launcher {
    paths: Paths,
    exits: mpsc::UnboundedSender<ExitNotice>,
}

impl Launcher {
    pub fn new(paths: Paths) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exits, rx) = mpsc::unbounded_channel();
        (Self { paths, exits }, rx)
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub async fn spawn(
        &self,
        config: &ServiceConfig,
        tap: &LogTap,
    ) -> Result<RunningProcess, ProcessError> {
        let (program, args) = parse_command(&config.command)?;

        fs::create_dir_all(self.paths.log_dir()).await?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&config.env);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let Some(pid) = child.id() else {
            return Err(ProcessError::Untracked);
        };
        let run_id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);

        if let Some(stdout) = child.stdout.take() {
            log::spawn_log_copier(
                config.name.clone(),
                LogStream::Stdout,
                stdout,
                self.paths.stdout_log(&config.name),
                tap.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            log::spawn_log_copier(
                config.name.clone(),
                LogStream::Stderr,
                stderr,
                self.paths.stderr_log(&config.name),
                tap.clone(),
            );
        }

        let exits = self.exits.clone();
        let name = config.name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(service = %name, pid, "failed to wait for process: {e}");
                    None
                }
            };
            tracing::debug!(service = %name, pid, ?exit_code, "process exited");
            let _ = exits.send(ExitNotice { run_id, exit_code });
        });

        tracing::debug!(service = %config.name, pid, run_id, "spawned process");
        Ok(RunningProcess {
            run_id,
            pid,
            started: Instant::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Restart policy evaluation
// ---------------------------------------------------------------------------

/// Decides whether an unexpected exit is followed by a respawn. `streak` is
/// the number of back-to-back short-lived runs so far.
pub fn should_restart(config: &ServiceConfig, exit_code: Option<i32>, streak: u32) -> bool {
    if streak >= config.max_restarts {
        return false;
    }

    match config.restart {
        RestartPolicy::Never => false,
        RestartPolicy::Always => true,
        RestartPolicy::OnFailure => exit_code != Some(0),
    }
}

/// Compute exponential backoff delay: 100ms * 2^count, capped at 30s
pub fn compute_backoff(restart_count: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(restart_count));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn test_config(command: &str) -> ServiceConfig {
        config::parse("svc.toml", &format!("command = {command:?}")).unwrap()
    }

    fn process_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[test]
    fn test_parse_simple_command() {
        let (prog, args) = parse_command("node server.js").unwrap();
        assert_eq!(prog, "node");
        assert_eq!(args, vec!["server.js"]);
    }

    #[test]
    fn test_parse_command_quoted_args() {
        let (prog, args) = parse_command(r#"bash -c "echo hello""#).unwrap();
        assert_eq!(prog, "bash");
        assert_eq!(args, vec!["-c", "echo hello"]);
    }

    #[test]
    fn test_parse_empty_command() {
        assert!(matches!(
            parse_command("   "),
            Err(ProcessError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_parse_unbalanced_quotes() {
        assert!(matches!(
            parse_command("echo 'oops"),
            Err(ProcessError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_parse_signal_with_and_without_prefix() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("HUP").unwrap(), Signal::SIGHUP);
    }

    #[test]
    fn test_parse_signal_invalid() {
        assert!(matches!(
            parse_signal("BOGUS"),
            Err(ProcessError::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_should_restart_policies() {
        let mut config = test_config("x");

        config.restart = RestartPolicy::OnFailure;
        assert!(!should_restart(&config, Some(0), 0));
        assert!(should_restart(&config, Some(1), 0));
        assert!(should_restart(&config, None, 0));

        config.restart = RestartPolicy::Always;
        assert!(should_restart(&config, Some(0), 0));

        config.restart = RestartPolicy::Never;
        assert!(!should_restart(&config, Some(1), 0));
    }

    #[test]
    fn test_should_restart_respects_max_restarts() {
        let mut config = test_config("x");
        config.restart = RestartPolicy::Always;
        config.max_restarts = 2;
        assert!(should_restart(&config, Some(1), 1));
        assert!(!should_restart(&config, Some(1), 2));
    }

    #[test]
    fn test_compute_backoff() {
        assert_eq!(compute_backoff(0), Duration::from_millis(100));
        assert_eq!(compute_backoff(1), Duration::from_millis(200));
        assert_eq!(compute_backoff(3), Duration::from_millis(800));
        assert_eq!(compute_backoff(20), Duration::from_millis(BACKOFF_CAP_MS));
        assert_eq!(compute_backoff(u32::MAX), Duration::from_millis(BACKOFF_CAP_MS));
    }

    #[tokio::test]
    async fn test_spawn_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, mut exits) = Launcher::new(Paths::with_base(dir.path().to_path_buf()));

        let process = launcher
            .spawn(&test_config("sh -c 'exit 7'"), &LogTap::new())
            .await
            .unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), exits.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.run_id, process.run_id);
        assert_eq!(notice.exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, _exits) = Launcher::new(Paths::with_base(dir.path().to_path_buf()));

        let err = launcher
            .spawn(&test_config("/nonexistent/overseer-test-binary"), &LogTap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_spawn_writes_service_logs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let (launcher, mut exits) = Launcher::new(paths.clone());

        let mut config = test_config("sh -c 'echo out; echo err >&2'");
        config.name = "echoer".to_string();
        launcher.spawn(&config, &LogTap::new()).await.unwrap();
        exits.recv().await.unwrap();

        // Copiers may finish just after the exit notice.
        for _ in 0..50 {
            let out = std::fs::read_to_string(paths.stdout_log("echoer")).unwrap_or_default();
            let err = std::fs::read_to_string(paths.stderr_log("echoer")).unwrap_or_default();
            if out == "out\n" && err == "err\n" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("service logs were not written");
    }

    #[tokio::test]
    async fn test_binary_output_does_not_kill_process() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let (launcher, mut exits) = Launcher::new(paths.clone());

        let mut config =
            test_config(r#"sh -c 'printf "\377\n"; sleep 0.3; echo after; exit 0'"#);
        config.name = "binary".to_string();
        launcher.spawn(&config, &LogTap::new()).await.unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), exits.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.exit_code, Some(0));

        for _ in 0..50 {
            let out = std::fs::read(paths.stdout_log("binary")).unwrap_or_default();
            if out == b"\xff\nafter\n" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("binary output was not logged");
    }

    #[tokio::test]
    async fn test_pending_stop_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, _exits) = Launcher::new(Paths::with_base(dir.path().to_path_buf()));

        let process = launcher
            .spawn(&test_config("sleep 999"), &LogTap::new())
            .await
            .unwrap();
        let pid = process.pid;
        assert!(process_alive(pid));

        PendingStop {
            process,
            signal: Signal::SIGTERM,
            timeout: Duration::from_secs(5),
        }
        .run()
        .await
        .unwrap();
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_pending_stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, _exits) = Launcher::new(Paths::with_base(dir.path().to_path_buf()));

        let process = launcher
            .spawn(
                &test_config("sh -c \"trap '' TERM; while true; do sleep 0.1; done\""),
                &LogTap::new(),
            )
            .await
            .unwrap();
        let pid = process.pid;
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        PendingStop {
            process,
            signal: Signal::SIGTERM,
            timeout: Duration::from_millis(300),
        }
        .run()
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));

        for _ in 0..50 {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process survived SIGKILL");
    }
}

use crate::config::ServiceConfig;
use crate::log::LogTap;
use crate::process::{
    self, Launcher, PendingStop, ProcessError, RunningProcess, StopFailure, MIN_UPTIME,
};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started { since: DateTime<Local> },
    Stopping,
    Failed { error: String },
}

impl ServiceState {
    /// Starting, started or stopping: anything a new start must not race.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Started { .. } | ServiceState::Stopping
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("error starting {name}: {source}")]
    Start {
        name: String,
        #[source]
        source: ProcessError,
    },
    #[error("error stopping {name}: {source}")]
    Stop {
        name: String,
        #[source]
        source: ProcessError,
    },
}

/// What the exit handler should do after a service's process went away on
/// its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Respawn after `delay`, unless `id` was superseded in the meantime.
    Restart { id: u64, delay: Duration },
    Settled,
}

static NEXT_RESTART: AtomicU64 = AtomicU64::new(1);

/// One supervised unit. Only ever touched through the registry lock.
pub struct Service {
    config: ServiceConfig,
    state: ServiceState,
    restarts: u32,
    crash_streak: u32,
    pending_restart: Option<u64>,
    process: Option<RunningProcess>,
    last_started: Option<DateTime<Local>>,
    tap: LogTap,
    launcher: Launcher,
}

impl Service {
    pub fn new(config: ServiceConfig, launcher: Launcher) -> Self {
        Self {
            config,
            state: ServiceState::Stopped,
            restarts: 0,
            crash_streak: 0,
            pending_restart: None,
            process: None,
            last_started: None,
            tap: LogTap::new(),
            launcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ServiceState::Started { .. })
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        match self.state {
            ServiceState::Started { since } => Some(since),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            ServiceState::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    pub fn run_id(&self) -> Option<u64> {
        self.process.as_ref().map(|p| p.run_id)
    }

    pub fn pending_restart(&self) -> Option<u64> {
        self.pending_restart
    }

    pub fn tap(&self) -> &LogTap {
        &self.tap
    }

    pub async fn start(&mut self) -> Result<(), ServiceError> {
        if self.state.is_active() {
            return Err(ServiceError::AlreadyRunning(self.name().to_string()));
        }
        self.crash_streak = 0;
        self.launch().await
    }

    pub async fn stop(&mut self) -> Result<(), ServiceError> {
        let pending = self.begin_stop()?;
        let outcome = pending.run().await;
        self.finish_stop(outcome)
    }

    /// Stops, then starts again only if the stop went through.
    pub async fn restart(&mut self) -> Result<(), ServiceError> {
        self.stop().await?;
        self.start().await
    }

    /// Commits to stopping: validates the stop, moves to `Stopping` and hands
    /// the process over. Must be paired with [`Service::finish_stop`].
    pub fn begin_stop(&mut self) -> Result<PendingStop, ServiceError> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning(self.name().to_string()));
        }
        let signal = process::parse_signal(&self.config.kill_signal).map_err(|source| {
            ServiceError::Stop {
                name: self.name().to_string(),
                source,
            }
        })?;
        let Some(process) = self.process.take() else {
            // Nothing to signal; the child is already gone.
            self.state = ServiceState::Stopped;
            return Err(ServiceError::NotRunning(self.name().to_string()));
        };

        self.state = ServiceState::Stopping;
        Ok(PendingStop {
            process,
            signal,
            timeout: Duration::from_millis(self.config.kill_timeout),
        })
    }

    pub fn finish_stop(&mut self, outcome: Result<(), StopFailure>) -> Result<(), ServiceError> {
        match outcome {
            Ok(()) => {
                self.state = ServiceState::Stopped;
                tracing::info!(service = %self.name(), "stopped");
                Ok(())
            }
            Err(StopFailure { process, error }) => {
                // The process was never signalled; it keeps running.
                self.process = Some(process);
                self.state = ServiceState::Started {
                    since: self.last_started.unwrap_or_else(Local::now),
                };
                Err(ServiceError::Stop {
                    name: self.name().to_string(),
                    source: error,
                })
            }
        }
    }

    /// Swaps in a new configuration. The caller decides about stopping and
    /// starting around it, and re-sorts the registry.
    pub(crate) fn replace_config(&mut self, config: ServiceConfig) -> ServiceConfig {
        std::mem::replace(&mut self.config, config)
    }

    /// Starts again after a configuration change stopped the service.
    pub async fn start_reloaded(&mut self) -> Result<(), ServiceError> {
        self.start().await?;
        self.restarts += 1;
        Ok(())
    }

    /// Applies the restart policy to an exit of the current process. Exits of
    /// processes that were stopped or replaced are ignored.
    pub fn handle_exit(&mut self, run_id: u64, exit_code: Option<i32>) -> Option<ExitAction> {
        if self.run_id() != Some(run_id) {
            return None;
        }
        let process = self.process.take()?;

        if process.started.elapsed() >= MIN_UPTIME {
            self.crash_streak = 0;
        }

        if process::should_restart(&self.config, exit_code, self.crash_streak) {
            let delay = process::compute_backoff(self.crash_streak);
            self.crash_streak += 1;
            let id = NEXT_RESTART.fetch_add(1, Ordering::Relaxed);
            self.pending_restart = Some(id);
            self.state = ServiceState::Starting;
            tracing::warn!(
                service = %self.name(),
                ?exit_code,
                delay_ms = delay.as_millis() as u64,
                "process exited, restarting"
            );
            return Some(ExitAction::Restart { id, delay });
        }

        self.state = match exit_code {
            Some(0) => ServiceState::Stopped,
            Some(code) => ServiceState::Failed {
                error: format!("exited with code {code}"),
            },
            None => ServiceState::Failed {
                error: "killed by signal".to_string(),
            },
        };
        tracing::warn!(service = %self.name(), ?exit_code, "process exited");
        Some(ExitAction::Settled)
    }

    /// Carries out a restart scheduled by [`Service::handle_exit`]. Does
    /// nothing if that restart was cancelled or superseded.
    pub async fn resume_restart(&mut self, id: u64) -> Result<(), ServiceError> {
        if self.pending_restart != Some(id) {
            return Ok(());
        }
        self.pending_restart = None;
        self.launch().await?;
        self.restarts += 1;
        Ok(())
    }

    /// Abandons a scheduled restart, leaving the service stopped.
    pub fn cancel_restart(&mut self) -> bool {
        if self.pending_restart.take().is_none() {
            return false;
        }
        self.state = ServiceState::Stopped;
        true
    }

    async fn launch(&mut self) -> Result<(), ServiceError> {
        self.state = ServiceState::Starting;
        match self.launcher.spawn(&self.config, &self.tap).await {
            Ok(process) => {
                tracing::info!(service = %self.name(), pid = process.pid, "started");
                let since = Local::now();
                self.process = Some(process);
                self.last_started = Some(since);
                self.state = ServiceState::Started { since };
                Ok(())
            }
            Err(source) => {
                tracing::error!(service = %self.name(), "failed to start: {source}");
                self.state = ServiceState::Failed {
                    error: source.to_string(),
                };
                Err(ServiceError::Start {
                    name: self.name().to_string(),
                    source,
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_state(&mut self, state: ServiceState, restarts: u32) {
        self.state = state;
        self.restarts = restarts;
    }
}

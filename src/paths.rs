use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "overseer";

const SYSTEM_CONFIG_DIR: &str = "/etc/overseer/conf.d";
const SYSTEM_LOG_DIR: &str = "/var/log/overseer";
const SYSTEM_SOCKET: &str = "/run/overseer.sock";

/// Filesystem locations used by the daemon. Fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
    log_dir: PathBuf,
    socket: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        if let Ok(base) = std::env::var("OVERSEER_ROOT") {
            return Self::with_base(PathBuf::from(base));
        }
        Self {
            config_dir: PathBuf::from(SYSTEM_CONFIG_DIR),
            log_dir: PathBuf::from(SYSTEM_LOG_DIR),
            socket: PathBuf::from(SYSTEM_SOCKET),
        }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self {
            config_dir: base.join("conf.d"),
            log_dir: base.join("logs"),
            socket: base.join(format!("{APP_NAME}.sock")),
        }
    }

    pub fn with_config_dir(mut self, dir: PathBuf) -> Self {
        self.config_dir = dir;
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn socket_file(&self) -> &Path {
        &self.socket
    }

    pub fn stdout_log(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}-out.log"))
    }

    pub fn stderr_log(&self, name: &str) -> PathBuf {
        self.log_dir.join(format!("{name}-err.log"))
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

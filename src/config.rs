use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_MAX_RESTARTS: u32 = 15;
pub const DEFAULT_KILL_SIGNAL: &str = "SIGTERM";
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    #[default]
    OnFailure,
    Always,
    Never,
}

/// One service, as described by a single file in the config directory.
///
/// Values are never edited in place: a changed file produces a new
/// `ServiceConfig` which replaces the old one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// File name inside the config directory this service was read from.
    pub file: String,
    pub name: String,
    /// Lower values start first and stop last.
    pub priority: i32,
    pub command: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub restart: RestartPolicy,
    pub max_restarts: u32,
    pub kill_signal: String,
    pub kill_timeout: u64,
}

// Spelled out so that adding a field forces a decision about whether it
// participates in change detection.
impl PartialEq for ServiceConfig {
    fn eq(&self, other: &Self) -> bool {
        let Self {
            file,
            name,
            priority,
            command,
            cwd,
            env,
            restart,
            max_restarts,
            kill_signal,
            kill_timeout,
        } = self;
        *file == other.file
            && *name == other.name
            && *priority == other.priority
            && *command == other.command
            && *cwd == other.cwd
            && *env == other.env
            && *restart == other.restart
            && *max_restarts == other.max_restarts
            && *kill_signal == other.kill_signal
            && *kill_timeout == other.kill_timeout
    }
}

impl Eq for ServiceConfig {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServiceConfig {
    name: Option<String>,
    #[serde(default)]
    priority: i32,
    command: String,
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    restart: RestartPolicy,
    max_restarts: Option<u32>,
    kill_signal: Option<String>,
    kill_timeout: Option<u64>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{file}: {message}")]
    Io { file: String, message: String },
    #[error("{file}: TOML parse error: {message}")]
    TomlParse { file: String, message: String },
    #[error("{file}: invalid service name `{name}`")]
    InvalidName { file: String, name: String },
}

/// Reports whether a file in the config directory must never produce a
/// service: hidden files, backups and editor scratch files.
pub fn is_ignored_file(name: &str) -> bool {
    const IGNORED_SUFFIXES: &[&str] = &["~", ".swp", ".swo", ".swx", ".bak", ".orig", ".tmp"];

    name.is_empty()
        || name.starts_with('.')
        || (name.starts_with('#') && name.ends_with('#'))
        // vim writes this name to test that the directory is writable
        || name == "4913"
        || IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

pub fn load(dir: &Path, file: &str) -> Result<ServiceConfig, ConfigError> {
    let content = std::fs::read_to_string(dir.join(file)).map_err(|e| ConfigError::Io {
        file: file.to_string(),
        message: e.to_string(),
    })?;
    parse(file, &content)
}

pub fn parse(file: &str, content: &str) -> Result<ServiceConfig, ConfigError> {
    let raw: RawServiceConfig = toml::from_str(content).map_err(|e| ConfigError::TomlParse {
        file: file.to_string(),
        message: e.to_string(),
    })?;

    let name = raw.name.unwrap_or_else(|| default_name(file));
    if !is_valid_name(&name) {
        return Err(ConfigError::InvalidName {
            file: file.to_string(),
            name,
        });
    }

    Ok(ServiceConfig {
        file: file.to_string(),
        name,
        priority: raw.priority,
        command: raw.command,
        cwd: raw.cwd,
        env: raw.env,
        restart: raw.restart,
        max_restarts: raw.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
        kill_signal: raw
            .kill_signal
            .unwrap_or_else(|| DEFAULT_KILL_SIGNAL.to_string()),
        kill_timeout: raw.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT_MS),
    })
}

/// Loads every service file in `dir`, in file-name order. Files that fail to
/// parse are logged and skipped; an unreadable directory is an error.
pub fn load_dir(
    dir: &Path,
    ignore: fn(&str) -> bool,
) -> Result<Vec<ServiceConfig>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
        file: dir.display().to_string(),
        message: e.to_string(),
    })?;

    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !ignore(name))
        .collect();
    files.sort();

    let mut configs = Vec::with_capacity(files.len());
    for file in files {
        match load(dir, &file) {
            Ok(config) => configs.push(config),
            Err(e) => tracing::error!("skipping service file: {e}"),
        }
    }
    Ok(configs)
}

fn default_name(file: &str) -> String {
    match Path::new(file).file_stem() {
        Some(stem) => stem.to_string_lossy().into_owned(),
        None => file.to_string(),
    }
}

// Names end up in log file names and on the command line.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

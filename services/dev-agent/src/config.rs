//! Configuration for the dev agent.
//!
//! Two layers: [`AgentConfig`] comes from the environment once at startup,
//! while the project's `devsync.json` is re-read on every drain cycle so edits
//! to `dev.onUpdate` take effect without restarting dev mode.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Project settings file, looked up in the project root.
pub const PROJECT_CONFIG_FILE: &str = "devsync.json";

/// Default delay after a restart before the drain guard is released.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default bound on a single stop or restart command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(15_000);

// =============================================================================
// Errors
// =============================================================================

/// Errors from resolving project configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' (expected one of: {expected})")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Dev settings
// =============================================================================

/// What to do to the device after a batch of file operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RestartMode {
    /// Evict touched modules and re-import `boot` and `main` over the REPL.
    #[default]
    RestartScript,
    /// Soft reset (Ctrl-D) the interpreter.
    SoftRestartDevice,
    /// Hardware reset the board.
    HardRestartDevice,
}

impl RestartMode {
    const EXPECTED: &'static str = "restartScript, softRestartDevice, hardRestartDevice";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestartScript => "restartScript",
            Self::SoftRestartDevice => "softRestartDevice",
            Self::HardRestartDevice => "hardRestartDevice",
        }
    }
}

impl fmt::Display for RestartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restartScript" => Ok(Self::RestartScript),
            "softRestartDevice" => Ok(Self::SoftRestartDevice),
            "hardRestartDevice" => Ok(Self::HardRestartDevice),
            other => Err(ConfigError::InvalidValue {
                key: "dev.onUpdate",
                value: other.to_string(),
                expected: Self::EXPECTED,
            }),
        }
    }
}

/// When to push the whole project as dev mode starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UploadWhen {
    Always,
    #[default]
    OutOfSync,
}

impl UploadWhen {
    const EXPECTED: &'static str = "always, outOfSync";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OutOfSync => "outOfSync",
        }
    }
}

impl fmt::Display for UploadWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadWhen {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "outOfSync" => Ok(Self::OutOfSync),
            other => Err(ConfigError::InvalidValue {
                key: "dev.uploadOnDevStart",
                value: other.to_string(),
                expected: Self::EXPECTED,
            }),
        }
    }
}

/// Resolved dev-mode settings for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevConfig {
    pub on_update: RestartMode,
    pub upload_on_dev_start: UploadWhen,
}

/// The `dev` section of `devsync.json`, as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDevConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_on_dev_start: Option<String>,
}

impl RawDevConfig {
    /// Apply defaults and validate. Missing or empty values take the default.
    pub fn resolve(&self) -> Result<DevConfig, ConfigError> {
        let on_update = match non_empty(&self.on_update) {
            Some(value) => value.parse()?,
            None => RestartMode::default(),
        };
        let upload_on_dev_start = match non_empty(&self.upload_on_dev_start) {
            Some(value) => value.parse()?,
            None => UploadWhen::default(),
        };

        Ok(DevConfig {
            on_update,
            upload_on_dev_start,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Contents of `devsync.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub dev: RawDevConfig,
}

impl ProjectConfigFile {
    /// Load the settings file from a project root. A missing file yields the
    /// defaults.
    pub async fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(PROJECT_CONFIG_FILE);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

// =============================================================================
// Agent settings
// =============================================================================

/// Timing knobs for drain cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    /// Delay after a restart before the manager reports idle.
    pub settle_delay: Duration,

    /// Upper bound on stopping the program and on restarting.
    pub command_timeout: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Dev agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Local project directory being synced.
    pub project_dir: PathBuf,

    /// Directory the mirror device writes into.
    pub mirror_dir: PathBuf,

    /// Name of the mirror device.
    pub device_name: String,

    /// SQLite database recording per-device upload times.
    pub state_db: PathBuf,

    /// Drain timing.
    pub drain: DrainSettings,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let project_dir = match std::env::var("DEVSYNC_PROJECT_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => std::env::current_dir().context("failed to resolve current directory")?,
        };

        let device_name =
            std::env::var("DEVSYNC_DEVICE_NAME").unwrap_or_else(|_| "mirror".to_string());

        let data_dir = std::env::temp_dir().join("devsync");

        let mirror_dir = std::env::var("DEVSYNC_MIRROR_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join(&device_name));

        let state_db = std::env::var("DEVSYNC_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("state.db"));

        let settle_delay = env_millis("DEVSYNC_SETTLE_DELAY_MS").unwrap_or(DEFAULT_SETTLE_DELAY);
        let command_timeout =
            env_millis("DEVSYNC_COMMAND_TIMEOUT_MS").unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let log_level = std::env::var("DEVSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            project_dir,
            mirror_dir,
            device_name,
            state_db,
            drain: DrainSettings {
                settle_delay,
                command_timeout,
            },
            log_level,
        })
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
}

//! TOML-based configuration for ocr-bridge.
//!
//! Supports a config file (ocr-bridge.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [channel]
//! request_timeout = "30s"
//!
//! [channel.timeouts]
//! init = "60s"
//! load_models = "2m"
//!
//! [worker]
//! path = "${OCR_WORKER}"
//! args = ["--threads", "2"]
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{ChannelConfig, CommandKind, ProcessSpawner};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Unknown command in [channel.timeouts]: {0}")]
    UnknownCommand(String),

    #[error("Worker path not configured (set worker.path or pass --worker)")]
    MissingWorker,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Command channel timeouts.
    pub channel: ChannelSettings,

    /// Worker executable.
    pub worker: WorkerSettings,

    /// Log output.
    pub logging: LoggingSettings,
}

/// Command channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Default per-command timeout (e.g. "30s", "2m").
    pub request_timeout: String,

    /// Per-command overrides keyed by command (`init`, `load_models`, ...).
    pub timeouts: HashMap<String, String>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            request_timeout: "30s".to_string(),
            timeouts: HashMap::new(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker executable (supports ${ENV_VAR} expansion).
    pub path: Option<String>,

    /// Arguments passed to the worker.
    pub args: Vec<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence.
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `OCR_BRIDGE_CONFIG`
    /// 2. `./ocr-bridge.toml`
    /// 3. `~/.config/ocr-bridge/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("OCR_BRIDGE_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("ocr-bridge.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ocr-bridge").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Build the channel timeout configuration.
    pub fn channel_config(&self) -> Result<ChannelConfig, SettingsError> {
        let mut config =
            ChannelConfig::default().with_request_timeout(parse_duration(&self.channel.request_timeout)?);

        for (key, value) in &self.channel.timeouts {
            let kind: CommandKind = key
                .parse()
                .map_err(|_| SettingsError::UnknownCommand(key.clone()))?;
            config = config.with_timeout(kind, parse_duration(value)?);
        }
        Ok(config)
    }

    /// Get the worker executable path with environment variables expanded.
    pub fn worker_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.worker
            .path
            .as_deref()
            .map(|path| expand_env_vars(path).map(PathBuf::from))
            .transpose()
    }

    /// Build a spawner for the configured worker.
    pub fn spawner(&self) -> Result<ProcessSpawner, SettingsError> {
        let path = self.worker_path()?.ok_or(SettingsError::MissingWorker)?;
        let args = self
            .worker
            .args
            .iter()
            .map(|arg| expand_env_vars(arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProcessSpawner::new(path).with_args(args))
    }
}

/// Parse a duration such as `500ms`, `30s`, `5m` or `1h`. A bare number is
/// taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let invalid = || SettingsError::InvalidDuration(s.to_string());

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let seconds = |per_unit: u64| {
        value
            .checked_mul(per_unit)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    };

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        _ => Err(invalid()),
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.peek() == Some(&'{') {
            chars.next();
            chars.by_ref().take_while(|&ch| ch != '}').collect()
        } else {
            let mut name = String::new();
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                name.push(ch);
                chars.next();
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value = env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name))?;
        result.push_str(&value);
    }

    Ok(result)
}

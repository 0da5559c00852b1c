//! Configuration module for ocr-bridge.
//!
//! Handles the config file, environment variables, and duration parsing.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, ChannelSettings, LogFormat, LoggingSettings, Settings,
    SettingsError, WorkerSettings,
};

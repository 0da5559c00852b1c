//! Logging initialisation.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSettings};

/// Parse a configured level, falling back to `info`.
fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "off" | "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// command output. `RUST_LOG` overrides the configured level.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(settings: &LoggingSettings) -> bool {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_log_level(&settings.level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match settings.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.is_ok()
}

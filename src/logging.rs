//! Log output setup
//!
//! `LOG_LEVEL` picks the level (RUST_LOG, when set, wins) and `LOG_FORMAT`
//! picks one of three renderings: compact, timestamp (default) or json.

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Output rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `LEVEL message key=value` without timestamps
    Compact,
    #[default]
    Timestamp,
    Json,
}

impl LogFormat {
    /// Parse a format name (case-insensitive); unknown names yield `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(LogFormat::Compact),
            "timestamp" => Some(LogFormat::Timestamp),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Parse a level name (DEBUG, INFO, WARN, ERROR; case-insensitive)
pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

fn filter(level: Level, verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()))
}

/// Install the global subscriber; call once at startup
pub fn init(level: Level, format: LogFormat, verbose: bool) {
    let filter = filter(level, verbose);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout);

    match format {
        LogFormat::Compact => builder.with_target(false).without_time().compact().init(),
        LogFormat::Timestamp => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}

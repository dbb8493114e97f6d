//! Configuration for Lookout
//!
//! An optional `lookout.toml` supplies base values; environment variables
//! override them. Invalid environment values fall back to the default with a
//! warning so a typo never stops the watchdog from starting.

use crate::duration::{format_duration, parse_duration};
use crate::error::{Error, Result};
use crate::logging::{LogFormat, parse_level};
use crate::sickbay::unrestartable::DEFAULT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Config file picked up from the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "lookout.toml";

pub const DEFAULT_RECOVERY_COOLDOWN: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_INITIAL_DISCOVERY_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_DEPENDENT_RESTART_COOLDOWN: Duration = Duration::from_secs(90);
pub const DEFAULT_HEALTHY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Load configuration from a file
pub fn load(path: &Path) -> Result<LookoutConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: LookoutConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root of `lookout.toml`
#[derive(Debug, Default, Deserialize)]
pub struct LookoutConfig {
    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub compose: ComposeConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// `[watch]`: recovery timing and limits
#[derive(Debug, Default, Deserialize)]
pub struct WatchConfig {
    /// Minimum time between recoveries of the same parent ("2m")
    pub recovery_cooldown: Option<String>,

    /// Startup grace period before any recovery ("60s")
    pub initial_discovery_wait: Option<String>,

    /// Minimum time between restarts of the same dependent; "0" disables
    pub dependent_restart_cooldown: Option<String>,

    /// How long a restarted parent has to turn healthy ("5m")
    pub healthy_timeout: Option<String>,

    pub unrestartable_capacity: Option<i64>,

    /// This watchdog's own container name
    pub self_name: Option<String>,
}

/// `[compose]`
#[derive(Debug, Default, Deserialize)]
pub struct ComposeConfig {
    pub path: Option<PathBuf>,

    /// Run `docker compose up -d` for a parent whose container is gone
    #[serde(default)]
    pub auto_recreate: bool,
}

/// `[log]`
#[derive(Debug, Default, Deserialize)]
pub struct LogConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl LookoutConfig {
    /// Reject values in the file that can never be used
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("watch.recovery_cooldown", &self.watch.recovery_cooldown, true),
            ("watch.initial_discovery_wait", &self.watch.initial_discovery_wait, true),
            ("watch.dependent_restart_cooldown", &self.watch.dependent_restart_cooldown, false),
            ("watch.healthy_timeout", &self.watch.healthy_timeout, true),
        ];
        for (key, value, positive) in durations {
            let Some(value) = value else {
                continue;
            };
            let d = parse_duration(value)
                .map_err(|e| Error::ConfigValidation(format!("{}: {}", key, e)))?;
            if positive && d.is_zero() {
                return Err(Error::ConfigValidation(format!("{}: must be positive", key)));
            }
        }

        if let Some(level) = self.log.level.as_deref().filter(|l| parse_level(l).is_none()) {
            return Err(Error::ConfigValidation(format!(
                "log.level: unknown level '{}' (expected DEBUG, INFO, WARN or ERROR)",
                level
            )));
        }

        if let Some(format) = self.log.format.as_deref().filter(|f| LogFormat::parse(f).is_none()) {
            return Err(Error::ConfigValidation(format!(
                "log.format: unknown format '{}' (expected compact, timestamp or json)",
                format
            )));
        }

        Ok(())
    }
}

/// Effective settings after merging file, environment and defaults
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    #[serde(serialize_with = "serialize_duration")]
    pub recovery_cooldown: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub initial_discovery_wait: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub dependent_restart_cooldown: Duration,
    #[serde(serialize_with = "serialize_duration")]
    pub healthy_timeout: Duration,
    pub unrestartable_capacity: usize,
    pub self_name: Option<String>,
    pub compose_path: Option<PathBuf>,
    pub auto_recreate: bool,
    #[serde(serialize_with = "serialize_level")]
    pub log_level: Level,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recovery_cooldown: DEFAULT_RECOVERY_COOLDOWN,
            initial_discovery_wait: DEFAULT_INITIAL_DISCOVERY_WAIT,
            dependent_restart_cooldown: DEFAULT_DEPENDENT_RESTART_COOLDOWN,
            healthy_timeout: DEFAULT_HEALTHY_TIMEOUT,
            unrestartable_capacity: DEFAULT_CAPACITY,
            self_name: None,
            compose_path: None,
            auto_recreate: false,
            log_level: Level::INFO,
            log_format: LogFormat::Timestamp,
        }
    }
}

/// How a duration setting treats zero
#[derive(Clone, Copy)]
enum Zero {
    Rejected,
    Allowed,
}

impl Settings {
    /// Resolve settings from the process environment
    pub fn from_env(config: &LookoutConfig) -> Self {
        Self::resolve(config, |key| std::env::var(key).ok())
    }

    /// Resolve settings with `env` as the environment lookup
    pub fn resolve(config: &LookoutConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str, file: Option<&str>| -> Option<String> {
            env(key)
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file.map(str::to_string))
        };
        let watch = &config.watch;

        let recovery_cooldown = duration_setting(
            "RECOVERY_COOLDOWN",
            lookup("RECOVERY_COOLDOWN", watch.recovery_cooldown.as_deref()),
            DEFAULT_RECOVERY_COOLDOWN,
            Zero::Rejected,
        );
        let initial_discovery_wait = duration_setting(
            "WATCHDOG_INITIAL_DISCOVERY_WAIT",
            lookup("WATCHDOG_INITIAL_DISCOVERY_WAIT", watch.initial_discovery_wait.as_deref()),
            DEFAULT_INITIAL_DISCOVERY_WAIT,
            Zero::Rejected,
        );
        let dependent_restart_cooldown = duration_setting(
            "WATCHDOG_DEPENDENT_RESTART_COOLDOWN",
            lookup(
                "WATCHDOG_DEPENDENT_RESTART_COOLDOWN",
                watch.dependent_restart_cooldown.as_deref(),
            ),
            DEFAULT_DEPENDENT_RESTART_COOLDOWN,
            Zero::Allowed,
        );
        let healthy_timeout = duration_setting(
            "WATCHDOG_HEALTHY_TIMEOUT",
            lookup("WATCHDOG_HEALTHY_TIMEOUT", watch.healthy_timeout.as_deref()),
            DEFAULT_HEALTHY_TIMEOUT,
            Zero::Rejected,
        );

        let file_capacity = watch.unrestartable_capacity.map(|c| c.to_string());
        let unrestartable_capacity = match lookup("WATCHDOG_UNRESTARTABLE_CAPACITY", file_capacity.as_deref()) {
            None => DEFAULT_CAPACITY,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(n) if n > 0 => usize::try_from(n).unwrap_or(DEFAULT_CAPACITY),
                _ => {
                    tracing::warn!(value = %raw, default = DEFAULT_CAPACITY, "invalid WATCHDOG_UNRESTARTABLE_CAPACITY, using default");
                    DEFAULT_CAPACITY
                }
            },
        };

        let self_name = lookup("WATCHDOG_CONTAINER_NAME", watch.self_name.as_deref())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let compose_env = env("WATCHDOG_COMPOSE_PATH")
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                env("COMPOSE_FILE").and_then(|files| {
                    files
                        .split(':')
                        .map(str::trim)
                        .find(|f| !f.is_empty())
                        .map(str::to_string)
                })
            });
        let compose_path = compose_env
            .map(|p| PathBuf::from(p.trim()))
            .or_else(|| config.compose.path.clone());

        let auto_recreate = match env("WATCHDOG_AUTO_RECREATE") {
            Some(raw) if !raw.trim().is_empty() => is_truthy(&raw),
            _ => config.compose.auto_recreate,
        };

        let log_level = match lookup("LOG_LEVEL", config.log.level.as_deref()) {
            None => Level::INFO,
            Some(raw) => parse_level(&raw).unwrap_or(Level::INFO),
        };
        let log_format = lookup("LOG_FORMAT", config.log.format.as_deref())
            .and_then(|raw| LogFormat::parse(&raw))
            .unwrap_or_default();

        Self {
            recovery_cooldown,
            initial_discovery_wait,
            dependent_restart_cooldown,
            healthy_timeout,
            unrestartable_capacity,
            self_name,
            compose_path,
            auto_recreate,
            log_level,
            log_format,
        }
    }

    /// Warn about settings that quietly disable behavior; call after logging is up
    pub fn warn_unset(&self) {
        if self.self_name.is_none() {
            tracing::warn!("WATCHDOG_CONTAINER_NAME not set: self-last-restart behavior disabled");
        }
        if self.compose_path.is_none() {
            tracing::warn!("no compose file configured; set WATCHDOG_COMPOSE_PATH and mount the compose file");
        }
        if self.auto_recreate && self.compose_path.is_none() {
            tracing::warn!("WATCHDOG_AUTO_RECREATE is set but no compose file is configured; auto-recreate disabled");
        }
    }
}

fn duration_setting(key: &str, raw: Option<String>, default: Duration, zero: Zero) -> Duration {
    let Some(raw) = raw else {
        return default;
    };
    let reason = match (parse_duration(&raw), zero) {
        (Ok(d), Zero::Rejected) if d.is_zero() => "must be positive".to_string(),
        (Ok(d), _) => return d,
        (Err(e), _) => e.to_string(),
    };
    tracing::warn!(
        value = %raw,
        error = %reason,
        "invalid {}, using default {}",
        key,
        format_duration(default)
    );
    default
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

fn serialize_level<S: serde::Serializer>(level: &Level, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(level.as_str())
}

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collector::session::SessionConfig;

/// Minimum accepted realtime overlay tolerance.
const MIN_REALTIME_TOLERANCE: Duration = Duration::from_secs(10);

/// Top-level configuration. Loaded from an optional YAML file, then
/// overridden by environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Database and GeoIP file locations.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upstream collector session configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Cache-to-store flush configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Realtime overlay configuration.
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port. Default: 3001.
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Reserved for the collector's own WebSocket exposure. Default: 3002.
    #[serde(default = "default_collector_ws_port")]
    #[allow(dead_code)]
    pub collector_ws_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. Default: "./stats.db".
    #[serde(default = "default_db_path")]
    pub path: String,

    /// MaxMind GeoLite2 City database path. Default: "./GeoLite2-City.mmdb".
    #[serde(default = "default_geoip_path")]
    pub geoip_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Upstream handshake timeout. Default: 5s.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// First reconnect delay. Default: 1s.
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Reconnect delay ceiling. Default: 30s.
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Frame freshness window for session health. Default: 60s.
    #[serde(default = "default_frame_fresh", with = "humantime_serde")]
    pub frame_fresh: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Cache-to-store flush interval. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// A query window counts as "now-ish", and gets the hot overlay,
    /// when its end is within this tolerance of now. Default: 120s.
    #[serde(default = "default_realtime_tolerance", with = "humantime_serde")]
    pub range_end_tolerance: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_port() -> u16 {
    3001
}

fn default_collector_ws_port() -> u16 {
    3002
}

fn default_db_path() -> String {
    "./stats.db".to_string()
}

fn default_geoip_path() -> String {
    "./GeoLite2-City.mmdb".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_frame_fresh() -> Duration {
    Duration::from_secs(60)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_realtime_tolerance() -> Duration {
    Duration::from_secs(120)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            collector: CollectorConfig::default(),
            flush: FlushConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            collector_ws_port: default_collector_ws_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            geoip_path: default_geoip_path(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            frame_fresh: default_frame_fresh(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: default_flush_interval(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            range_end_tolerance: default_realtime_tolerance(),
        }
    }
}

// --- Loading, env overrides, validation ---

impl Config {
    /// Loads configuration: YAML file when given, defaults otherwise,
    /// then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&data)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env_overrides()
            .context("applying environment overrides")?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Recognized environment variables: `API_PORT`,
    /// `COLLECTOR_WS_PORT`, `DB_PATH`, `REALTIME_RANGE_END_TOLERANCE_MS`,
    /// `FLUSH_INTERVAL_MS`.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(port) = env_parse::<u16>("API_PORT")? {
            self.api.port = port;
        }
        if let Some(port) = env_parse::<u16>("COLLECTOR_WS_PORT")? {
            self.api.collector_ws_port = port;
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Some(ms) = env_parse::<u64>("REALTIME_RANGE_END_TOLERANCE_MS")? {
            self.realtime.range_end_tolerance = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FLUSH_INTERVAL_MS")? {
            self.flush.interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.port == 0 {
            bail!("api.port must be positive");
        }
        if self.database.path.is_empty() {
            bail!("database.path is required");
        }
        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }
        if self.realtime.range_end_tolerance < MIN_REALTIME_TOLERANCE {
            bail!(
                "realtime.range_end_tolerance must be at least {} ms",
                MIN_REALTIME_TOLERANCE.as_millis(),
            );
        }
        if self.collector.backoff_base.is_zero() || self.collector.backoff_max.is_zero() {
            bail!("collector backoff delays must be positive");
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: self.collector.handshake_timeout,
            backoff_base: self.collector.backoff_base,
            backoff_max: self.collector.backoff_max,
            frame_fresh: self.collector.frame_fresh,
        }
    }

    pub fn realtime_tolerance_ms(&self) -> i64 {
        self.realtime.range_end_tolerance.as_millis() as i64
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => match value.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => bail!("invalid {name}={value}: {e}"),
        },
        _ => Ok(None),
    }
}

//! Runtime configuration for posture-daemon.
//!
//! Settings come from an optional TOML file; a missing file means defaults.
//! Environment variables and CLI flags are layered on top by `main`.

use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".posture/daemon.toml";
const DEFAULT_DB_RELATIVE_PATH: &str = ".posture/reports.db";
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

pub const BIND_ADDR_ENV: &str = "POSTURE_BIND_ADDR";
pub const DB_PATH_ENV: &str = "POSTURE_DB_PATH";
pub const CONFIG_PATH_ENV: &str = "POSTURE_CONFIG";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub read_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            read_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Seconds of continuous bad posture before the alarm flag is raised.
    pub alarm_threshold_secs: i64,
    /// Seconds between flushes of in-memory totals to the store.
    pub flush_interval_secs: i64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            alarm_threshold_secs: 10,
            flush_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Maximum horizontal distance (px) between face center and frame center.
    pub center_tolerance_px: u32,
    /// Skin-tone pixels required before a region counts as a face.
    pub min_face_pixels: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            center_tolerance_px: 100,
            min_face_pixels: 400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: Option<PathBuf>,
    pub collection: String,
    /// Fixed offset used to compute the report date. Defaults to Asia/Colombo.
    pub utc_offset_minutes: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            collection: "posture_reports".to_string(),
            utc_offset_minutes: 330,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking.flush_interval_secs <= 0 {
            return Err(ConfigError::Invalid(
                "tracking.flush_interval_secs must be positive".to_string(),
            ));
        }
        if self.tracking.alarm_threshold_secs < 0 {
            return Err(ConfigError::Invalid(
                "tracking.alarm_threshold_secs must not be negative".to_string(),
            ));
        }
        if self.store.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "store.utc_offset_minutes must be within ±{}",
                MAX_UTC_OFFSET_MINUTES
            )));
        }
        if self.store.collection.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "store.collection must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn report_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.store.utc_offset_minutes * 60).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "invalid utc offset: {} minutes",
                self.store.utc_offset_minutes
            ))
        })
    }

    pub fn resolved_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.store.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(home_dir()?.join(DEFAULT_DB_RELATIVE_PATH)),
        }
    }

    /// Applies `POSTURE_*` environment overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup(BIND_ADDR_ENV).filter(|value| !value.trim().is_empty()) {
            self.server.bind_addr = addr;
        }
        if let Some(path) = lookup(DB_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            self.store.db_path = Some(PathBuf::from(path));
        }
    }
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::NoHomeDir)
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(home_dir()?.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|err| ConfigError::Parse {
        path: config_path.clone(),
        details: err.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

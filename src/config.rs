//! Run configuration, loaded from TOML and overridden from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::Roster;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub gauge: GaugeDefaults,
    pub sync: SyncConfig,
    pub acquisition: AcquisitionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path
    pub port: String,
    pub baud: u32,
    /// Reply deadline for one read, in milliseconds
    pub timeout_ms: u64,
    /// Resends of a whole command sequence after NAK/timeout/garbage
    pub max_retries: u32,
    /// Overall budget for one gauge operation including retries
    pub op_timeout_ms: Option<u64>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud: 9600,
            timeout_ms: 1000,
            max_retries: 3,
            op_timeout_ms: None,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings pushed to the controller at startup. Codes are the device's own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaugeDefaults {
    /// 0 fast, 1 medium, 2 slow
    pub filter: u8,
    /// Display digits, 2 or 3
    pub resolution: u8,
    /// Calibration factor per channel
    pub calibration: Option<[f64; 2]>,
    /// 0 mbar, 1 Torr, 2 Pa; left as-is when unset
    pub unit: Option<u8>,
}

impl Default for GaugeDefaults {
    fn default() -> Self {
        Self {
            filter: 1,
            resolution: 3,
            calibration: Some([1.0, 1.0]),
            unit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// This process's name on the roster
    pub identity: String,
    pub roster: Vec<String>,
    /// Shared rendezvous directory
    pub dir: PathBuf,
    pub poll_interval_ms: u64,
    /// Give up waiting for peers after this long and start unsynchronized
    pub wait_budget_ms: u64,
}

pub const DEFAULT_ROSTER: [&str; 5] = [
    "heater_controller",
    "gauge_controller",
    "pressure_array_controller",
    "waveform_controller",
    "thermal_camera_controller",
];

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity: "gauge_controller".into(),
            roster: DEFAULT_ROSTER.iter().map(|s| s.to_string()).collect(),
            dir: PathBuf::from("."),
            poll_interval_ms: 100,
            wait_budget_ms: 300_000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.wait_budget_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub interval_ms: u64,
    /// Gauge channel sampled by the run loop
    pub channel: u8,
    pub output_dir: PathBuf,
    /// Abort the run after this many failed samples in a row
    pub max_consecutive_failures: u32,
    /// Seconds between progress lines
    pub stats_interval_s: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            channel: 1,
            output_dir: PathBuf::from("."),
            max_consecutive_failures: 10,
            stats_interval_s: 10.0,
        }
    }
}

impl AcquisitionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.serial.port.is_empty() {
            return invalid("serial.port is empty".into());
        }
        if self.serial.baud == 0 {
            return invalid("serial.baud must be positive".into());
        }
        if self.serial.timeout_ms == 0 {
            return invalid("serial.timeout_ms must be positive".into());
        }
        if !matches!(self.acquisition.channel, 1 | 2) {
            return invalid(format!(
                "acquisition.channel must be 1 or 2, got {}",
                self.acquisition.channel
            ));
        }
        if self.acquisition.interval_ms == 0 {
            return invalid("acquisition.interval_ms must be positive".into());
        }
        if self.sync.enabled {
            if self.sync.poll_interval_ms == 0 {
                return invalid("sync.poll_interval_ms must be positive".into());
            }
            let roster = Roster::new(self.sync.roster.iter().cloned())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !roster.contains(&self.sync.identity) {
                return invalid(format!(
                    "sync.identity {:?} is not on the roster",
                    self.sync.identity
                ));
            }
        }
        Ok(())
    }
}

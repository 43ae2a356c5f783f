//! Rig Configuration using Figment
//!
//! Strongly-typed configuration for the acquisition engine. Values are layered
//! (lowest to highest precedence):
//! 1. Built-in defaults (serde defaults, see [`RigConfig::default`])
//! 2. TOML configuration file (default: `config/rig.toml`, optional)
//! 3. Environment variables prefixed with `SPIM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SPIM_APPLICATION__LOG_LEVEL=debug
//! SPIM_CALIBRATION__SLOPE_UM_PER_DEGREE=98.5
//! SPIM_COLLECTOR__INTER_FRAME_TIMEOUT_MS=2000
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spim_daq::config::RigConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RigConfig::load_from("config/rig.toml")?;
//!     println!("Camera: {}", config.devices.camera);
//!     println!("Clock: {} Hz", config.calibration.clock_hz);
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::acquisition::collector::CollectorConfig;
use crate::core::CalibrationConstants;
use crate::hardware::DeviceLabels;
use crate::timing::compiler::{LogicLayout, MIN_SLOPE_UM_PER_DEGREE};
use crate::timing::program::ScanGeometry;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),

    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level rig configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device labels
    pub devices: DeviceLabels,
    /// Scanner calibration and logic-card clock
    pub calibration: CalibrationConstants,
    /// Logic-card cell and port assignments
    pub logic: LogicLayout,
    /// Fixed scan geometry
    pub scan: ScanGeometry,
    /// Frame collector settings
    pub collector: CollectorSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "spim_daq".into(),
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

/// Frame collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Sleep between empty-buffer polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Wait for the first frame after the trigger in milliseconds
    #[serde(default = "default_first_frame_timeout")]
    pub first_frame_timeout_ms: u64,
    /// Wait between consecutive frames in milliseconds
    #[serde(default = "default_inter_frame_timeout")]
    pub inter_frame_timeout_ms: u64,
    /// Capacity of the frame channel handed to the consumer
    #[serde(default = "default_frame_channel_capacity")]
    pub frame_channel_capacity: usize,
    /// Physical cameras interleaved in the ring buffer
    #[serde(default = "default_camera_channels")]
    pub camera_channels: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            first_frame_timeout_ms: default_first_frame_timeout(),
            inter_frame_timeout_ms: default_inter_frame_timeout(),
            frame_channel_capacity: default_frame_channel_capacity(),
            camera_channels: default_camera_channels(),
        }
    }
}

impl CollectorSettings {
    /// Collector timing derived from these settings.
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            first_frame_timeout: Duration::from_millis(self.first_frame_timeout_ms),
            inter_frame_timeout: Duration::from_millis(self.inter_frame_timeout_ms),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_poll_interval() -> u64 {
    2
}

fn default_first_frame_timeout() -> u64 {
    10_000
}

fn default_inter_frame_timeout() -> u64 {
    5_000
}

fn default_frame_channel_capacity() -> usize {
    64
}

fn default_camera_channels() -> u32 {
    1
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref()).extract::<Self>()?.validated()
    }

    /// The layered provider chain, exposed for callers adding their own layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPIM_").split("__"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Calibration slope is non-zero and the clock positive
    /// - Collector poll interval and timeouts are non-zero
    /// - Camera channel count and frame channel capacity are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let calib = &self.calibration;
        if !calib.slope_um_per_degree.is_finite()
            || calib.slope_um_per_degree.abs() < MIN_SLOPE_UM_PER_DEGREE
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid slope_um_per_degree {}. Must be non-zero",
                calib.slope_um_per_degree
            )));
        }
        if !(calib.clock_hz.is_finite() && calib.clock_hz > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid clock_hz {}. Must be > 0",
                calib.clock_hz
            )));
        }

        let collector = &self.collector;
        for (name, value) in [
            ("poll_interval_ms", collector.poll_interval_ms),
            ("first_frame_timeout_ms", collector.first_frame_timeout_ms),
            ("inter_frame_timeout_ms", collector.inter_frame_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {} 0. Must be > 0",
                    name
                )));
            }
        }
        if collector.frame_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid frame_channel_capacity 0. Must be > 0".into(),
            ));
        }
        if collector.camera_channels == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid camera_channels 0. Must be > 0".into(),
            ));
        }

        if self.logic.camera_cell == self.logic.laser_cell {
            return Err(ConfigError::ValidationError(format!(
                "Camera and laser pulses share logic cell {}",
                self.logic.camera_cell
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::program::{CellId, OutputPort, SignalAddress};
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.calibration.clock_hz, 4000.0);
        assert_eq!(config.logic.camera_cell, CellId(11));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RigConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RigConfig::default());
    }

    #[test]
    fn test_toml_overrides_merge_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench rig"
log_level = "debug"

[calibration]
slope_um_per_degree = 98.5
offset_um = 1.5
clock_hz = 4000.0

[logic]
laser_cell = 4
trigger_input = {{ bnc_in = 3 }}
laser_port = {{ ttl = 2 }}
laser_preset = 12
save_to_card = false

[collector]
inter_frame_timeout_ms = 750
camera_channels = 2
"#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench rig");
        assert_eq!(config.calibration.slope_um_per_degree, 98.5);
        assert_eq!(config.logic.laser_cell, CellId(4));
        assert_eq!(config.logic.trigger_input, SignalAddress::BncIn(3));
        assert_eq!(config.logic.laser_port, OutputPort::Ttl(2));
        assert_eq!(config.logic.laser_preset, Some(12));
        assert!(!config.logic.save_to_card);
        // Untouched keys keep their defaults
        assert_eq!(config.logic.camera_cell, CellId(11));
        assert_eq!(config.collector.poll_interval_ms, 2);
        assert_eq!(config.collector.camera_channels, 2);
        assert_eq!(
            config.collector.collector_config().inter_frame_timeout,
            Duration::from_millis(750)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RigConfig::default();
        config.application.log_level = "verbose".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = RigConfig::default();
        config.calibration.slope_um_per_degree = 0.0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.collector.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.logic.laser_cell = config.logic.camera_cell;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let mut config = RigConfig::default();
        config.logic.trigger_input = SignalAddress::BncIn(3);
        config.collector.camera_channels = 2;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", config.to_toml().unwrap()).unwrap();
        assert_eq!(RigConfig::load_from(file.path()).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[collector]\npoll_interval_ms = \"fast\"").unwrap();
        assert!(matches!(
            RigConfig::load_from(file.path()),
            Err(ConfigError::LoadError(_))
        ));
    }
}

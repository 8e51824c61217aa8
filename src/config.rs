//! Layered configuration using Figment.
//!
//! Configuration is merged from, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file (`config/magdaq.toml` unless another path is given)
//! 3. Environment variables prefixed with `MAGDAQ_`, with `__` separating nested keys
//!
//! # Environment Variable Overrides
//!
//! ```text
//! MAGDAQ_APPLICATION__LOG_LEVEL=debug
//! MAGDAQ_ACQUISITION__MAX_CONSECUTIVE_TIMEOUTS=5
//! MAGDAQ_SEQUENCE__TRIGGER_INTERVAL=20ms
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "magnetometer"
//! log_level = "info"
//!
//! [acquisition]
//! camera_guard = "250ms"
//! max_consecutive_timeouts = 3
//!
//! [sequence]
//! trigger_count = 50
//! trigger_interval = "20ms"
//! pulse_width = "5us"
//! exposure = "5ms"
//! width = 640
//! height = 480
//! ```

use crate::acquisition::sequence::{validate, AcquisitionSequence, DeviceLimits, SequenceParams};
use crate::acquisition::worker::WorkerConfig;
use crate::error::{AppResult, DaqError, ValidationError};
use crate::hardware::mock::{SimulatedCamera, SimulatedRig, SimulatedStage, SimulatedTrigger};
use crate::notifications::DEFAULT_NOTIFICATION_CAPACITY;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File read by [`Settings::load`].
pub const DEFAULT_CONFIG_PATH: &str = "config/magdaq.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MAGDAQ_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Worker timeouts and failure policy
    pub acquisition: WorkerConfig,
    /// Capabilities of the attached hardware
    pub limits: DeviceLimits,
    /// Default run parameters
    pub sequence: SequenceParams,
    /// Simulated device parameters
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Messages retained in the controller's notification log
    pub notification_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "magnetometer".to_string(),
            log_level: "info".to_string(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

/// Parameters for the simulated rig used when no hardware is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Camera sensor width in pixels
    pub sensor_width: u32,
    /// Camera sensor height in pixels
    pub sensor_height: u32,
    /// Stage speed in position units per second
    pub stage_speed: f64,
    /// Stage position at power-up
    pub stage_start: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sensor_width: 1920,
            sensor_height: 1200,
            stage_speed: 360.0,
            stage_start: 0.0,
        }
    }
}

impl SimulationConfig {
    /// Build a fault-free simulated rig matching `limits`.
    pub fn build_rig(&self, limits: &DeviceLimits) -> SimulatedRig {
        SimulatedRig::from_devices(
            SimulatedTrigger::new(),
            SimulatedCamera::new(self.sensor_width, self.sensor_height)
                .with_exposure_range(limits.min_exposure, limits.max_exposure),
            SimulatedStage::new()
                .with_speed(self.stage_speed)
                .with_travel(limits.stage_min, limits.stage_max)
                .at_position(self.stage_start),
        )
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Self::figment(path.as_ref(), ENV_PREFIX).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path, env_prefix: &str) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Semantic checks that deserialization cannot express.
    ///
    /// The run sequence is checked separately by [`Settings::sequence`], so a config
    /// with a bad default sequence can still be loaded and corrected.
    pub fn validate(&self) -> AppResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.application.notification_capacity == 0 {
            return Err(DaqError::Configuration(
                "notification_capacity must be at least 1".into(),
            ));
        }

        self.acquisition
            .validate()
            .map_err(|reason| DaqError::Configuration(format!("acquisition: {reason}")))?;

        if self.limits.stage_min >= self.limits.stage_max {
            return Err(DaqError::Configuration(format!(
                "limits: stage_min {} must be below stage_max {}",
                self.limits.stage_min, self.limits.stage_max
            )));
        }
        if self.limits.min_exposure > self.limits.max_exposure {
            return Err(DaqError::Configuration(
                "limits: min_exposure exceeds max_exposure".into(),
            ));
        }

        if !(self.simulation.stage_speed > 0.0) {
            return Err(DaqError::Configuration(
                "simulation: stage_speed must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Validate the configured run parameters against the configured limits.
    pub fn sequence(&self) -> Result<AcquisitionSequence, Vec<ValidationError>> {
        validate(&self.sequence, &self.limits)
    }

    /// Render the merged configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|err| DaqError::Configuration(format!("cannot render configuration: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_test::{assert_err, assert_ok};

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = assert_ok!(Settings::load_from(dir.path().join("absent.toml")));

        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.acquisition.max_consecutive_timeouts, 3);
        assert_eq!(settings.acquisition.camera_guard, Duration::from_millis(500));
        assert_eq!(settings.application.notification_capacity, 100);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"

            [acquisition]
            camera_guard = "250ms"
            max_consecutive_timeouts = 5
            channel_capacity = 64

            [sequence]
            trigger_count = 5
            trigger_interval = "20ms"
            pulse_width = "5us"
            exposure = "2ms"
            width = 64
            height = 48
            "#,
        );

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.application.name, "magnetometer");
        assert_eq!(settings.acquisition.camera_guard, Duration::from_millis(250));
        assert_eq!(settings.acquisition.max_consecutive_timeouts, 5);
        assert_eq!(settings.acquisition.channel_capacity, Some(64));
        // Untouched keys keep their defaults
        assert_eq!(settings.acquisition.trigger_timeout, Duration::from_secs(1));

        let sequence = settings.sequence().unwrap();
        assert_eq!(sequence.trigger_count(), 5);
        assert_eq!(sequence.run_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config(
            r#"
            [acquisition]
            max_consecutive_timeouts = 5
            "#,
        );
        std::env::set_var("MAGDAQ_CFGTEST_ACQUISITION__MAX_CONSECUTIVE_TIMEOUTS", "7");
        std::env::set_var("MAGDAQ_CFGTEST_SEQUENCE__TRIGGER_INTERVAL", "40ms");

        let settings: Settings = Settings::figment(file.path(), "MAGDAQ_CFGTEST_")
            .extract()
            .unwrap();
        assert_eq!(settings.acquisition.max_consecutive_timeouts, 7);
        assert_eq!(settings.sequence.trigger_interval, Duration::from_millis(40));

        std::env::remove_var("MAGDAQ_CFGTEST_ACQUISITION__MAX_CONSECUTIVE_TIMEOUTS");
        std::env::remove_var("MAGDAQ_CFGTEST_SEQUENCE__TRIGGER_INTERVAL");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let file = write_config(
            r#"
            [application]
            log_level = "verbose"
            "#,
        );

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_zero_timeout_threshold_rejected() {
        let file = write_config(
            r#"
            [acquisition]
            max_consecutive_timeouts = 0
            "#,
        );

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("max_consecutive_timeouts"));
    }

    #[test]
    fn test_malformed_duration_is_load_error() {
        let file = write_config(
            r#"
            [acquisition]
            trigger_timeout = "soon"
            "#,
        );

        let err = assert_err!(Settings::load_from(file.path()));
        assert!(matches!(err, DaqError::Config(_)));
    }

    #[test]
    fn test_toml_rendering_reloads() {
        let settings = Settings::default();
        let rendered = settings.to_toml().unwrap();
        assert!(rendered.contains("[acquisition]"));

        let file = write_config(&rendered);
        let reloaded = Settings::load_from(file.path()).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn test_simulated_rig_follows_limits() {
        let settings = Settings::default();
        let rig = settings.simulation.build_rig(&settings.limits);
        assert_eq!(rig.counter().open_count(), 0);
    }
}

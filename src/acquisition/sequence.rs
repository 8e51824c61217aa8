//! Declarative description of one acquisition run, and its validation.
//!
//! [`SequenceParams`] is the raw, deserializable form produced from user or config
//! input. [`validate`] checks it against the attached hardware's [`DeviceLimits`] and
//! returns either an immutable [`AcquisitionSequence`] or every problem it found.
//! The worker trusts a validated sequence and never re-checks it.
//!
//! # Timeline
//!
//! ```text
//! offset:  0      T      2T     ...   (n-1)T       nT = run duration
//! index:   0      1      2      ...    n-1
//! ```
//!
//! A waypoint becomes due at the first trigger index whose offset is at or after the
//! waypoint's offset.

use crate::error::ValidationError;
use crate::hardware::{CameraSettings, PositionUnits, StageSettings, TriggerSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A scheduled stage position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Offset from the first trigger
    #[serde(with = "humantime_serde")]
    pub offset: Duration,
    /// Target position in the stage's units
    pub position: f64,
}

/// Raw run parameters, as entered by the operator or loaded from config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceParams {
    /// Number of trigger pulses (and expected frames)
    pub trigger_count: u32,
    /// Period between triggers
    #[serde(with = "humantime_serde")]
    pub trigger_interval: Duration,
    /// High time of each trigger pulse
    #[serde(with = "humantime_serde")]
    pub pulse_width: Duration,
    /// Trigger output channels
    #[serde(default = "default_channels")]
    pub trigger_channels: Vec<u8>,
    /// Camera exposure window per trigger
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Camera region width
    pub width: u32,
    /// Camera region height
    pub height: u32,
    /// Camera region origin, x
    #[serde(default)]
    pub offset_x: u32,
    /// Camera region origin, y
    #[serde(default)]
    pub offset_y: u32,
    /// Continuous camera gain adjustment
    #[serde(default)]
    pub auto_gain: bool,
    /// Home the stage while arming
    #[serde(default)]
    pub home_stage: bool,
    /// Stage waypoints, strictly increasing in offset
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
    /// How late a trigger or stage arrival may be before it counts as a timing violation
    #[serde(with = "humantime_serde", default = "default_late_tolerance")]
    pub late_trigger_tolerance: Duration,
}

fn default_channels() -> Vec<u8> {
    vec![0, 1, 2]
}

fn default_late_tolerance() -> Duration {
    Duration::from_millis(5)
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            trigger_count: 10,
            trigger_interval: Duration::from_millis(100),
            pulse_width: Duration::from_micros(5),
            trigger_channels: default_channels(),
            exposure: Duration::from_millis(5),
            width: 640,
            height: 480,
            offset_x: 0,
            offset_y: 0,
            auto_gain: true,
            home_stage: false,
            waypoints: Vec::new(),
            late_trigger_tolerance: default_late_tolerance(),
        }
    }
}

/// Capabilities of the attached hardware that a sequence must respect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Shortest supported trigger period
    #[serde(with = "humantime_serde")]
    pub min_trigger_interval: Duration,
    /// Shortest supported pulse
    #[serde(with = "humantime_serde")]
    pub min_pulse_width: Duration,
    /// Number of digital trigger outputs
    pub trigger_channels: u8,
    /// Shortest camera exposure
    #[serde(with = "humantime_serde")]
    pub min_exposure: Duration,
    /// Longest camera exposure
    #[serde(with = "humantime_serde")]
    pub max_exposure: Duration,
    /// Sensor width in pixels
    pub sensor_width: u32,
    /// Sensor height in pixels
    pub sensor_height: u32,
    /// Stage travel, lower bound
    pub stage_min: f64,
    /// Stage travel, upper bound
    pub stage_max: f64,
    /// Units of the stage travel
    #[serde(default)]
    pub stage_units: PositionUnits,
    /// Longest run the worker will schedule
    #[serde(default = "default_max_run_duration", with = "humantime_serde")]
    pub max_run_duration: Duration,
}

fn default_max_run_duration() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_trigger_interval: Duration::from_micros(10),
            min_pulse_width: Duration::from_nanos(10),
            trigger_channels: 16,
            min_exposure: Duration::from_millis(1),
            max_exposure: Duration::from_millis(100),
            sensor_width: 1920,
            sensor_height: 1200,
            stage_min: 0.0,
            stage_max: 360.0,
            stage_units: PositionUnits::Degrees,
            max_run_duration: default_max_run_duration(),
        }
    }
}

/// A validated, immutable run description.
///
/// Only [`validate`] constructs one; a new run gets a new sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionSequence {
    trigger_count: u32,
    trigger: TriggerSettings,
    camera: CameraSettings,
    stage: StageSettings,
    waypoints: Vec<Waypoint>,
    late_tolerance: Duration,
    run_duration: Duration,
}

impl AcquisitionSequence {
    /// Number of triggers (and expected frames).
    pub fn trigger_count(&self) -> u32 {
        self.trigger_count
    }

    /// Trigger period.
    pub fn trigger_interval(&self) -> Duration {
        self.trigger.interval
    }

    /// Exposure window per trigger.
    pub fn exposure(&self) -> Duration {
        self.camera.exposure
    }

    /// Settings for arming the trigger device.
    pub fn trigger_settings(&self) -> &TriggerSettings {
        &self.trigger
    }

    /// Settings for arming the camera.
    pub fn camera_settings(&self) -> &CameraSettings {
        &self.camera
    }

    /// Settings for arming the stage.
    pub fn stage_settings(&self) -> &StageSettings {
        &self.stage
    }

    /// Waypoints in increasing offset order.
    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    /// Allowed lateness before a trigger or stage arrival is a timing violation.
    pub fn late_tolerance(&self) -> Duration {
        self.late_tolerance
    }

    /// `trigger_interval x trigger_count`.
    pub fn run_duration(&self) -> Duration {
        self.run_duration
    }

    /// Scheduled offset of a trigger index from the first trigger.
    pub fn offset_of(&self, index: u32) -> Duration {
        self.trigger.interval * index
    }

    /// Trigger rate in Hz.
    pub fn trigger_rate_hz(&self) -> f64 {
        self.trigger.rate_hz()
    }
}

/// Check raw parameters against the hardware limits.
///
/// Collects every problem instead of stopping at the first one, so the operator can
/// fix them all in one pass.
pub fn validate(
    params: &SequenceParams,
    limits: &DeviceLimits,
) -> Result<AcquisitionSequence, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if params.trigger_count == 0 {
        errors.push(ValidationError::ZeroTriggerCount);
    }

    let interval = params.trigger_interval;
    if interval < limits.min_trigger_interval || interval.is_zero() {
        errors.push(ValidationError::IntervalBelowMinimum {
            interval,
            minimum: limits.min_trigger_interval,
        });
    }

    if params.pulse_width < limits.min_pulse_width
        || params.pulse_width.is_zero()
        || params.pulse_width >= interval
    {
        errors.push(ValidationError::PulseWidthOutOfRange {
            pulse_width: params.pulse_width,
            minimum: limits.min_pulse_width,
            interval,
        });
    }

    if params.trigger_channels.is_empty() {
        errors.push(ValidationError::NoTriggerChannels);
    }
    for &channel in &params.trigger_channels {
        if channel >= limits.trigger_channels {
            errors.push(ValidationError::TriggerChannelOutOfRange {
                channel,
                available: limits.trigger_channels,
            });
        }
    }

    if params.exposure < limits.min_exposure || params.exposure > limits.max_exposure {
        errors.push(ValidationError::ExposureOutOfRange {
            exposure: params.exposure,
            min: limits.min_exposure,
            max: limits.max_exposure,
        });
    }
    if params.exposure >= interval {
        errors.push(ValidationError::ExposureExceedsInterval {
            exposure: params.exposure,
            interval,
        });
    }

    let right = u64::from(params.offset_x) + u64::from(params.width);
    let bottom = u64::from(params.offset_y) + u64::from(params.height);
    if params.width == 0
        || params.height == 0
        || right > u64::from(limits.sensor_width)
        || bottom > u64::from(limits.sensor_height)
    {
        errors.push(ValidationError::RegionOutsideSensor {
            x: params.offset_x,
            y: params.offset_y,
            width: params.width,
            height: params.height,
            sensor_width: limits.sensor_width,
            sensor_height: limits.sensor_height,
        });
    }

    let run_duration = interval.checked_mul(params.trigger_count);
    if run_duration.is_none() {
        errors.push(ValidationError::RunDurationOverflow);
    }
    let duration = run_duration.unwrap_or(Duration::MAX);
    if run_duration.is_some_and(|duration| duration > limits.max_run_duration) {
        errors.push(ValidationError::RunTooLong {
            duration,
            maximum: limits.max_run_duration,
        });
    }

    let mut previous: Option<Duration> = None;
    for (index, waypoint) in params.waypoints.iter().enumerate() {
        if previous.is_some_and(|prev| waypoint.offset <= prev) {
            errors.push(ValidationError::WaypointOffsetsNotIncreasing {
                index,
                offset: waypoint.offset,
            });
        }
        if waypoint.offset > duration {
            errors.push(ValidationError::WaypointBeyondRunDuration {
                index,
                offset: waypoint.offset,
                duration,
            });
        }
        if !waypoint.position.is_finite()
            || waypoint.position < limits.stage_min
            || waypoint.position > limits.stage_max
        {
            errors.push(ValidationError::WaypointPositionOutOfRange {
                index,
                position: waypoint.position,
                min: limits.stage_min,
                max: limits.stage_max,
            });
        }
        previous = Some(waypoint.offset);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(AcquisitionSequence {
        trigger_count: params.trigger_count,
        trigger: TriggerSettings {
            pulse_width: params.pulse_width,
            interval,
            channels: params.trigger_channels.clone(),
        },
        camera: CameraSettings {
            exposure: params.exposure,
            width: params.width,
            height: params.height,
            offset_x: params.offset_x,
            offset_y: params.offset_y,
            auto_gain: params.auto_gain,
        },
        stage: StageSettings {
            home_on_arm: params.home_stage,
            units: limits.stage_units,
        },
        waypoints: params.waypoints.clone(),
        late_tolerance: params.late_trigger_tolerance,
        run_duration: duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SequenceParams {
        SequenceParams {
            trigger_count: 5,
            trigger_interval: Duration::from_millis(20),
            pulse_width: Duration::from_micros(5),
            exposure: Duration::from_millis(2),
            width: 64,
            height: 48,
            ..SequenceParams::default()
        }
    }

    fn waypoint(offset_ms: u64, position: f64) -> Waypoint {
        Waypoint {
            offset: Duration::from_millis(offset_ms),
            position,
        }
    }

    #[test]
    fn test_valid_sequence() {
        let mut raw = params();
        raw.waypoints = vec![waypoint(0, 0.0), waypoint(40, 45.0), waypoint(100, 90.0)];

        let sequence = validate(&raw, &DeviceLimits::default()).unwrap();
        assert_eq!(sequence.trigger_count(), 5);
        assert_eq!(sequence.run_duration(), Duration::from_millis(100));
        assert_eq!(sequence.offset_of(3), Duration::from_millis(60));
        assert_eq!(sequence.trigger_settings().channels, vec![0, 1, 2]);
        assert_eq!(sequence.camera_settings().width, 64);
        assert_eq!(sequence.waypoints().len(), 3);
        assert!((sequence.trigger_rate_hz() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_trigger_count_rejected() {
        let mut raw = params();
        raw.trigger_count = 0;

        let errors = validate(&raw, &DeviceLimits::default()).unwrap_err();
        assert!(errors.contains(&ValidationError::ZeroTriggerCount));
    }

    #[test]
    fn test_interval_below_device_minimum() {
        let limits = DeviceLimits {
            min_trigger_interval: Duration::from_millis(50),
            ..DeviceLimits::default()
        };

        let errors = validate(&params(), &limits).unwrap_err();
        assert!(matches!(
            errors[0],
            ValidationError::IntervalBelowMinimum { .. }
        ));
    }

    #[test]
    fn test_waypoint_offsets_must_increase() {
        let mut raw = params();
        raw.waypoints = vec![waypoint(40, 10.0), waypoint(40, 20.0), waypoint(20, 30.0)];

        let errors = validate(&raw, &DeviceLimits::default()).unwrap_err();
        let not_increasing: Vec<usize> = errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::WaypointOffsetsNotIncreasing { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(not_increasing, vec![1, 2]);
    }

    #[test]
    fn test_waypoint_beyond_run_duration() {
        let mut raw = params();
        raw.waypoints = vec![waypoint(101, 10.0)];

        let errors = validate(&raw, &DeviceLimits::default()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::WaypointBeyondRunDuration {
                index: 0,
                offset: Duration::from_millis(101),
                duration: Duration::from_millis(100),
            }]
        );
    }

    #[test]
    fn test_collects_every_problem() {
        let raw = SequenceParams {
            trigger_count: 0,
            trigger_interval: Duration::from_millis(2),
            pulse_width: Duration::from_millis(3),
            trigger_channels: vec![0, 99],
            exposure: Duration::from_millis(500),
            width: 4000,
            height: 10,
            waypoints: vec![waypoint(0, f64::NAN)],
            ..SequenceParams::default()
        };

        let errors = validate(&raw, &DeviceLimits::default()).unwrap_err();
        assert!(errors.contains(&ValidationError::ZeroTriggerCount));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::PulseWidthOutOfRange { .. })));
        assert!(errors.contains(&ValidationError::TriggerChannelOutOfRange {
            channel: 99,
            available: 16
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::ExposureOutOfRange { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::ExposureExceedsInterval { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::RegionOutsideSensor { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::WaypointPositionOutOfRange { .. })));
    }

    #[test]
    fn test_params_from_toml() {
        let raw: SequenceParams = toml::from_str(
            r#"
            trigger_count = 3
            trigger_interval = "50ms"
            pulse_width = "5us"
            exposure = "5ms"
            width = 320
            height = 240

            [[waypoints]]
            offset = "0s"
            position = 0.0

            [[waypoints]]
            offset = "100ms"
            position = 90.0
            "#,
        )
        .unwrap();

        assert_eq!(raw.trigger_channels, vec![0, 1, 2]);
        assert_eq!(raw.late_trigger_tolerance, Duration::from_millis(5));
        let sequence = validate(&raw, &DeviceLimits::default()).unwrap();
        assert_eq!(sequence.waypoints()[1].offset, Duration::from_millis(100));
    }

    #[test]
    fn test_run_longer_than_device_maximum_rejected() {
        let mut raw = params();
        raw.trigger_interval = Duration::from_secs(u64::MAX / 2);
        raw.trigger_count = 1;

        let errors = validate(&raw, &DeviceLimits::default()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::RunTooLong {
                duration: Duration::from_secs(u64::MAX / 2),
                maximum: Duration::from_secs(24 * 60 * 60),
            }]
        );

        raw.trigger_interval = Duration::from_secs(60);
        raw.trigger_count = 24 * 60;
        assert!(validate(&raw, &DeviceLimits::default()).is_ok());
    }
}

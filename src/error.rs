//! Custom error types for the acquisition core.
//!
//! Errors follow the taxonomy the acquisition core reports to its callers:
//!
//! - **Configuration** ([`ValidationError`]): an acquisition sequence that can never run on
//!   the attached hardware. Rejected before a run starts and never reaches the worker.
//! - **Device** ([`DeviceError`]): failures reported by a hardware adapter. `Timeout` is
//!   transient and recovered locally by the worker (dropped frame, timing violation);
//!   the other variants are fatal for the current run.
//! - **Run faults** ([`RunFault`]): the cause attached to a `Faulted` transition.
//! - **Start** ([`StartError`]): a `start()` request that could not begin a run.
//!
//! [`DaqError`] consolidates all of them, plus configuration loading and I/O, so the
//! controller and binary can use the `?` operator throughout.

use crate::core::{DeviceKind, WorkerState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failure reported by a hardware adapter.
///
/// Every variant names the device it came from so faults can be surfaced to the
/// operator with full context.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Link could not be established
    #[error("{device} unavailable: {reason}")]
    Unavailable { device: DeviceKind, reason: String },

    /// Device refused the arm parameters
    #[error("{device} rejected parameters: {reason}")]
    InvalidParameters { device: DeviceKind, reason: String },

    /// Device is held by another run
    #[error("{device} is busy (already armed by another run)")]
    Busy { device: DeviceKind },

    /// Call did not complete within its bound
    #[error("{device} {operation} timed out after {after:?}")]
    Timeout {
        device: DeviceKind,
        operation: &'static str,
        after: Duration,
    },

    /// Device reported a hardware or protocol fault
    #[error("{device} fault: {reason}")]
    Fault { device: DeviceKind, reason: String },
}

impl DeviceError {
    /// Device that reported the error.
    pub fn device(&self) -> DeviceKind {
        match self {
            DeviceError::Unavailable { device, .. }
            | DeviceError::InvalidParameters { device, .. }
            | DeviceError::Busy { device }
            | DeviceError::Timeout { device, .. }
            | DeviceError::Fault { device, .. } => *device,
        }
    }

    /// True for the transient `Timeout` variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. })
    }

    pub(crate) fn fault(device: DeviceKind, reason: impl Into<String>) -> Self {
        DeviceError::Fault {
            device,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(device: DeviceKind, reason: impl Into<String>) -> Self {
        DeviceError::InvalidParameters {
            device,
            reason: reason.into(),
        }
    }
}

/// A reason an acquisition sequence was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// No triggers requested
    #[error("trigger count must be at least 1")]
    ZeroTriggerCount,

    /// Trigger period faster than the device supports
    #[error("trigger interval {interval:?} is below the device minimum {minimum:?}")]
    IntervalBelowMinimum { interval: Duration, minimum: Duration },

    /// Pulse too short or not shorter than the period
    #[error("pulse width {pulse_width:?} must be at least {minimum:?} and shorter than the trigger interval {interval:?}")]
    PulseWidthOutOfRange {
        pulse_width: Duration,
        minimum: Duration,
        interval: Duration,
    },

    /// Empty output channel list
    #[error("no trigger output channels selected")]
    NoTriggerChannels,

    /// Output channel the device does not have
    #[error("trigger channel {channel} does not exist (device has {available} channels)")]
    TriggerChannelOutOfRange { channel: u8, available: u8 },

    /// Exposure outside the camera range
    #[error("exposure {exposure:?} outside the supported range {min:?}..={max:?}")]
    ExposureOutOfRange {
        exposure: Duration,
        min: Duration,
        max: Duration,
    },

    /// Exposure does not finish before the next trigger
    #[error("exposure {exposure:?} does not fit inside the trigger interval {interval:?}")]
    ExposureExceedsInterval { exposure: Duration, interval: Duration },

    /// Readout region extends past the sensor
    #[error("{width}x{height} region at ({x}, {y}) does not fit the {sensor_width}x{sensor_height} sensor")]
    RegionOutsideSensor {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        sensor_width: u32,
        sensor_height: u32,
    },

    /// Waypoints out of order or duplicated
    #[error("waypoint {index} offset {offset:?} is not after the previous waypoint")]
    WaypointOffsetsNotIncreasing { index: usize, offset: Duration },

    /// Waypoint scheduled after the last trigger
    #[error("waypoint {index} offset {offset:?} exceeds the run duration {duration:?}")]
    WaypointBeyondRunDuration {
        index: usize,
        offset: Duration,
        duration: Duration,
    },

    /// Waypoint outside stage travel
    #[error("waypoint {index} position {position} is outside stage travel {min}..={max}")]
    WaypointPositionOutOfRange {
        index: usize,
        position: f64,
        min: f64,
        max: f64,
    },

    /// Run duration does not fit in a `Duration`
    #[error("trigger interval x trigger count overflows the run duration")]
    RunDurationOverflow,

    /// Run longer than the device limit allows
    #[error("run duration {duration:?} exceeds the maximum {maximum:?}")]
    RunTooLong { duration: Duration, maximum: Duration },
}

/// Cause attached to a `Faulted` transition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunFault {
    /// A fatal device error, or the timeout that pushed consecutive drops over the threshold.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Run overran its overall deadline
    #[error("run exceeded its overall deadline of {limit:?}")]
    DeadlineExceeded { limit: Duration },

    /// Late trigger with `abort_on_timing_violation` set
    #[error("trigger {index} ran {late_by:?} behind schedule")]
    TimingViolation { index: u32, late_by: Duration },

    /// A driver or the run loop panicked
    #[error("acquisition run panicked: {reason}")]
    Internal { reason: String },
}

impl RunFault {
    /// True when the fault was caused by a device timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunFault::Device(err) if err.is_timeout())
    }
}

/// Reasons a `start()` request was refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    /// A run is already in progress
    #[error("worker is not idle (currently {0})")]
    NotIdle(WorkerState),

    /// No sequence to run
    #[error("no acquisition sequence has been configured")]
    NotConfigured,

    /// Previous run has not released the hardware yet
    #[error("hardware is still held by a previous run")]
    DevicesBusy,
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Sequence rejected by validation
    #[error("Invalid acquisition sequence: {}", join_validation(.0))]
    InvalidSequence(Vec<ValidationError>),

    /// Device error outside a run
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Start request refused
    #[error("Cannot start acquisition: {0}")]
    Start(#[from] StartError),

    /// Run ended in a fault
    #[error("Acquisition faulted: {0}")]
    Fault(#[from] RunFault),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker task is gone
    #[error("Acquisition worker task failed: {0}")]
    WorkerTask(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<Vec<ValidationError>> for DaqError {
    fn from(errors: Vec<ValidationError>) -> Self {
        DaqError::InvalidSequence(errors)
    }
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

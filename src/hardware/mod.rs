//! Hardware adapter contract (capability-based).
//!
//! The trigger DAQ, the camera SDK and the motor controller all speak different vendor
//! protocols. Each is wrapped in an implementation of [`HardwareAdapter`], which
//! normalizes them into the same four-step contract:
//!
//! | step        | trigger              | camera              | stage                      |
//! |-------------|----------------------|---------------------|----------------------------|
//! | `open`      | connect to the DAQ   | open the device     | connect to the controller  |
//! | `arm`       | load pulse train     | exposure + ROI      | optional homing            |
//! | `execute`   | fire one pulse       | read one frame      | move to / read position    |
//! | `close`     | stop + disconnect    | stop stream         | disconnect                 |
//!
//! The acquisition worker is written once against this trait. Timeouts are enforced by
//! the worker around every call, so a driver only has to report its own failures.
//!
//! `close()` must be idempotent and must succeed (or at least return) even after a fault.

pub mod elliptec;
pub mod mock;

use crate::core::{CameraImage, DeviceKind};
use crate::error::DeviceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Uniform command/response contract implemented by every device driver.
#[async_trait]
pub trait HardwareAdapter: Send {
    /// Per-run settings passed to [`arm`](HardwareAdapter::arm).
    type Settings: Send + Sync;
    /// Per-step command passed to [`execute`](HardwareAdapter::execute).
    type Command: Send;
    /// Typed result of one step.
    type Output: Send;

    /// Which subsystem this adapter drives.
    fn kind(&self) -> DeviceKind;

    /// Establish the vendor link.
    ///
    /// Fails with [`DeviceError::Unavailable`] if the device cannot be reached.
    async fn open(&mut self) -> Result<(), DeviceError>;

    /// Prepare the device for the upcoming run.
    ///
    /// Fails with [`DeviceError::InvalidParameters`] if a setting is outside the
    /// device's range, or [`DeviceError::Busy`] if another run holds the device.
    async fn arm(&mut self, settings: &Self::Settings) -> Result<(), DeviceError>;

    /// Perform one step and wait for it to complete.
    async fn execute(&mut self, command: Self::Command) -> Result<Self::Output, DeviceError>;

    /// Release the device. Idempotent.
    async fn close(&mut self) -> Result<(), DeviceError>;
}

// =============================================================================
// Per-device settings
// =============================================================================

/// Pulse train loaded into the trigger device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    /// High time of each pulse
    #[serde(with = "humantime_serde")]
    pub pulse_width: Duration,
    /// Period between pulses
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Digital output channels driven with the pulse train
    pub channels: Vec<u8>,
}

impl TriggerSettings {
    /// Repetition rate in Hz.
    pub fn rate_hz(&self) -> f64 {
        1.0 / self.interval.as_secs_f64()
    }
}

/// Camera exposure and region of interest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Exposure per trigger
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Region width in pixels
    pub width: u32,
    /// Region height in pixels
    pub height: u32,
    /// Region origin, x
    #[serde(default)]
    pub offset_x: u32,
    /// Region origin, y
    #[serde(default)]
    pub offset_y: u32,
    /// Let the camera adjust gain continuously
    #[serde(default)]
    pub auto_gain: bool,
}

/// Units a stage reports its position in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionUnits {
    /// Rotation mounts
    #[default]
    Degrees,
    /// Linear stages
    Millimeters,
}

/// Stage preparation for a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Find mechanical zero while arming
    #[serde(default)]
    pub home_on_arm: bool,
    /// Units used by waypoint positions
    #[serde(default)]
    pub units: PositionUnits,
}

// =============================================================================
// Commands and results
// =============================================================================

/// Trigger step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerCommand {
    /// Emit one pulse on every armed channel
    Fire,
}

/// Acknowledgement that a pulse left the trigger device.
#[derive(Clone, Copy, Debug)]
pub struct TriggerAck {
    /// When the pulse was sent
    pub fired_at: Instant,
    /// Running pulse count since arming
    pub pulse_number: u64,
}

/// Camera step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraCommand {
    /// Read the frame exposed by the most recent trigger
    ReadFrame,
}

/// Stage step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StageCommand {
    /// Move to an absolute position and wait for arrival
    MoveTo(f64),
    /// Query the current position
    ReadPosition,
}

/// Trigger adapter as held by the worker.
pub type TriggerAdapter =
    dyn HardwareAdapter<Settings = TriggerSettings, Command = TriggerCommand, Output = TriggerAck>;

/// Camera adapter as held by the worker.
pub type CameraAdapter =
    dyn HardwareAdapter<Settings = CameraSettings, Command = CameraCommand, Output = CameraImage>;

/// Stage adapter as held by the worker. `execute` returns the reached/current position.
pub type StageAdapter =
    dyn HardwareAdapter<Settings = StageSettings, Command = StageCommand, Output = f64>;

/// The three adapters a run drives.
///
/// Owned by the acquisition worker; a run takes exclusive access for its whole
/// lifetime, so a set is never shared by two runs at once.
pub struct DeviceSet {
    /// Trigger / DAQ
    pub trigger: Box<TriggerAdapter>,
    /// Camera
    pub camera: Box<CameraAdapter>,
    /// Motorized stage
    pub stage: Box<StageAdapter>,
}

impl DeviceSet {
    /// Bundle three adapters.
    pub fn new(
        trigger: Box<TriggerAdapter>,
        camera: Box<CameraAdapter>,
        stage: Box<StageAdapter>,
    ) -> Self {
        Self {
            trigger,
            camera,
            stage,
        }
    }
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("trigger", &self.trigger.kind())
            .field("camera", &self.camera.kind())
            .field("stage", &self.stage.kind())
            .finish()
    }
}

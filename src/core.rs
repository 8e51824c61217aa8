//! Core data types shared by the acquisition core.
//!
//! # Data Flow
//!
//! ```text
//! AcquisitionWorker --[AcquisitionFrame]--> ResultChannel ---> consumer (GUI / controller)
//!                   --[StateEvent]--------> broadcast::channel ---> status listeners
//! ```
//!
//! Frames are owned exclusively: the worker builds each [`AcquisitionFrame`], the
//! result channel holds it, and ownership moves to the consumer when it is popped.

use crate::error::RunFault;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Devices
// =============================================================================

/// The three hardware subsystems driven during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Trigger / DAQ pulse generator
    Trigger,
    /// Imaging camera
    Camera,
    /// Motorized stage
    Stage,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Trigger => "trigger",
            DeviceKind::Camera => "camera",
            DeviceKind::Stage => "stage",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Image data
// =============================================================================

/// Memory-efficient pixel buffer supporting multiple bit depths.
///
/// Camera sensors output 8-bit or 16-bit unsigned integers; storing them in their
/// native width avoids a 4-8x blow-up per frame.
#[derive(Clone, Debug, PartialEq)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the memory size in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
        }
    }

    /// Mean pixel value, used for quick-look status displays.
    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let sum: u64 = match self {
            PixelBuffer::U8(data) => data.iter().map(|&v| u64::from(v)).sum(),
            PixelBuffer::U16(data) => data.iter().map(|&v| u64::from(v)).sum(),
        };
        sum as f64 / self.len() as f64
    }
}

/// A raw image as read back from the camera.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraImage {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Pixel data in row-major order
    pub pixels: PixelBuffer,
    /// Camera-side timestamp relative to the start of streaming, if the SDK reports one
    pub hardware_timestamp: Option<Duration>,
}

impl CameraImage {
    /// Returns the total number of pixels (width x height).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// One captured camera image plus its acquisition metadata.
///
/// Deliberately not `Clone`: a frame is consumed exactly once by the channel reader.
#[derive(Debug)]
pub struct AcquisitionFrame {
    /// Trigger index within the run (0-based)
    pub index: u32,
    /// Run that produced this frame
    pub run_id: Uuid,
    /// Wall-clock time the frame arrived from the camera
    pub captured_at: DateTime<Utc>,
    /// Camera image, owned by the frame until consumed
    pub image: CameraImage,
    /// Last known stage position when the frame was captured
    pub stage_position: Option<f64>,
    /// Time from the trigger pulse to the frame read completing
    pub trigger_latency: Duration,
}

// =============================================================================
// Worker state
// =============================================================================

/// Lifecycle state of the acquisition worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// No run in progress; `start()` is permitted
    #[default]
    Idle,
    /// Opening and arming the adapters
    Arming,
    /// Executing the trigger loop
    Running,
    /// Finishing gracefully and releasing the adapters
    Stopping,
    /// Cancelling immediately and releasing the adapters
    Aborting,
    /// Run ended on a fatal error; adapters are being released
    Faulted,
}

impl WorkerState {
    /// True while a run holds the hardware (anything but `Idle`).
    pub fn is_active(self) -> bool {
        self != WorkerState::Idle
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "Idle",
            WorkerState::Arming => "Arming",
            WorkerState::Running => "Running",
            WorkerState::Stopping => "Stopping",
            WorkerState::Aborting => "Aborting",
            WorkerState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Push-style notification emitted on every worker state transition.
#[derive(Clone, Debug)]
pub struct StateEvent {
    /// New state
    pub state: WorkerState,
    /// Run the transition belongs to
    pub run_id: Uuid,
    /// Cause of the fault, set only when `state` is `Faulted`
    pub fault: Option<RunFault>,
    /// Run statistics, attached to the final `Idle` transition
    pub summary: Option<RunSummary>,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

/// Statistics for one completed run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: Uuid,
    /// Triggers requested by the sequence
    pub triggers_requested: u32,
    /// Frames successfully read and pushed to the result channel
    pub frames_captured: u32,
    /// Trigger indices abandoned after a trigger or camera timeout
    pub dropped_frames: u32,
    /// Late triggers and late or timed-out stage moves
    pub timing_violations: u32,
    /// Frames evicted from the result channel during this run
    pub channel_overflows: u64,
    /// Stage waypoints reached
    pub waypoints_reached: u32,
    /// Stage waypoints superseded by a later waypoint or never due
    pub waypoints_skipped: u32,
    /// Every state the worker passed through, starting with `Arming`
    pub transitions: Vec<WorkerState>,
    /// Fatal cause, if the run faulted
    pub fault: Option<RunFault>,
    /// True if `abort()` ended the run
    pub aborted: bool,
    /// True if `stop()` ended the run before the final trigger
    pub stopped_early: bool,
    /// Wall time from `start()` to release of the hardware
    pub elapsed: Duration,
}

impl RunSummary {
    /// True if every requested trigger produced a frame and nothing failed.
    pub fn is_complete(&self) -> bool {
        self.fault.is_none()
            && !self.aborted
            && !self.stopped_early
            && self.frames_captured == self.triggers_requested
    }
}

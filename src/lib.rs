//! Acquisition core for the magnetometer experiment.
//!
//! The crate coordinates three hardware subsystems during timed acquisition runs:
//! a trigger/DAQ device, an imaging camera and a motorized stage. Each trigger pulse
//! produces one camera frame, stage waypoints are executed between triggers, and
//! completed frames are handed to a consumer through a bounded, non-blocking channel.
//!
//! - [`hardware`]: the adapter contract, simulated devices and the Elliptec stage protocol
//! - [`acquisition`]: sequence validation, the worker state machine and the result channel
//! - [`controller`]: the façade a GUI or CLI drives
//! - [`config`]: layered configuration
//!
//! The presentation layer is not part of this crate; it only issues commands to the
//! [`controller::ExperimentController`] and reads status, notifications and frames back.

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod hardware;
pub mod notifications;

pub use acquisition::{AcquisitionSequence, AcquisitionWorker, ResultChannel, SequenceParams};
pub use controller::{ExperimentController, StatusSnapshot};
pub use core::{AcquisitionFrame, RunSummary, WorkerState};
pub use error::{AppResult, DaqError};

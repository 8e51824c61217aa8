//! Acquisition pipeline: sequence validation, the worker state machine, and the
//! result channel that hands frames to the consumer.

pub mod channel;
pub mod sequence;
pub mod worker;

pub use channel::ResultChannel;
pub use sequence::{validate, AcquisitionSequence, DeviceLimits, SequenceParams, Waypoint};
pub use worker::{AcquisitionWorker, CancelRequest, WorkerConfig};

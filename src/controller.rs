//! External-facing façade over the acquisition worker.
//!
//! The controller validates run parameters, owns at most one worker, forwards
//! start/stop/abort, and turns worker state events into operator notifications.
//! It never touches hardware itself.

use crate::acquisition::channel::ResultChannel;
use crate::acquisition::sequence::{validate, AcquisitionSequence, DeviceLimits, SequenceParams};
use crate::acquisition::worker::{AcquisitionWorker, WorkerConfig};
use crate::config::Settings;
use crate::core::{AcquisitionFrame, RunSummary, StateEvent, WorkerState};
use crate::error::{AppResult, DaqError, RunFault, StartError};
use crate::hardware::DeviceSet;
use crate::notifications::{
    Notification, NotificationLevel, NotificationLog, DEFAULT_NOTIFICATION_CAPACITY,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view of the acquisition core for display.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    /// Worker state
    pub state: WorkerState,
    /// Most recent run fault, if any run has faulted
    pub last_fault: Option<RunFault>,
    /// Statistics of the most recently finished run
    pub last_summary: Option<RunSummary>,
    /// Frames waiting in the result channel
    pub frames_pending: usize,
    /// True once a valid sequence has been configured
    pub configured: bool,
}

/// Orchestrates the acquisition worker's lifecycle.
pub struct ExperimentController {
    limits: DeviceLimits,
    worker: Option<AcquisitionWorker>,
    sequence: Option<AcquisitionSequence>,
    notifications: Arc<Mutex<NotificationLog>>,
    last_fault: Arc<Mutex<Option<RunFault>>>,
    listener: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("worker", &self.worker)
            .field("configured", &self.sequence.is_some())
            .finish()
    }
}

impl ExperimentController {
    /// Create a controller whose worker owns `devices`.
    pub fn new(devices: DeviceSet, worker_config: WorkerConfig, limits: DeviceLimits) -> Self {
        Self {
            limits,
            worker: Some(AcquisitionWorker::new(devices, worker_config)),
            sequence: None,
            notifications: Arc::new(Mutex::new(NotificationLog::with_capacity(
                DEFAULT_NOTIFICATION_CAPACITY,
            ))),
            last_fault: Arc::new(Mutex::new(None)),
            listener: None,
        }
    }

    /// Create a controller from loaded settings. The configured sequence is applied
    /// if it is valid; otherwise the controller starts unconfigured.
    pub fn from_settings(devices: DeviceSet, settings: &Settings) -> Self {
        let mut controller = Self::new(
            devices,
            settings.acquisition.clone(),
            settings.limits.clone(),
        );
        controller.set_notification_capacity(settings.application.notification_capacity);
        if let Err(err) = controller.configure(&settings.sequence) {
            warn!(error = %err, "configured sequence rejected");
        }
        controller
    }

    /// Validate `params` and make them the sequence for the next `start()`.
    ///
    /// On failure every validation problem is returned and the previous sequence,
    /// if any, stays in effect. A run already in progress is unaffected.
    pub fn configure(&mut self, params: &SequenceParams) -> AppResult<()> {
        match validate(params, &self.limits) {
            Ok(sequence) => {
                info!(
                    triggers = sequence.trigger_count(),
                    interval = ?sequence.trigger_interval(),
                    waypoints = sequence.waypoints().len(),
                    "sequence configured"
                );
                self.sequence = Some(sequence);
                Ok(())
            }
            Err(errors) => {
                let err = DaqError::InvalidSequence(errors);
                warn!(error = %err, "sequence rejected");
                self.notify(NotificationLevel::Error, format!("Configuration rejected: {err}"));
                Err(err)
            }
        }
    }

    /// Begin a run with the configured sequence.
    pub fn start(&mut self) -> AppResult<Uuid> {
        let sequence = self.sequence.clone().ok_or(StartError::NotConfigured)?;
        let worker = self.worker.as_mut().ok_or_else(|| {
            DaqError::WorkerTask("controller has been shut down".to_string())
        })?;

        if self.listener.as_ref().map_or(true, JoinHandle::is_finished) {
            self.listener = Some(tokio::spawn(listen(
                worker.subscribe(),
                self.notifications.clone(),
                self.last_fault.clone(),
            )));
        }

        match worker.start(sequence) {
            Ok(run_id) => Ok(run_id),
            Err(err) => {
                self.notify(NotificationLevel::Warning, format!("Start refused: {err}"));
                Err(err.into())
            }
        }
    }

    /// Finish the in-flight trigger/frame, then end the run. Ignored until the run is `Running`.
    pub fn stop(&self) {
        if let Some(worker) = &self.worker {
            worker.stop();
        }
    }

    /// End the run immediately.
    pub fn abort(&self) {
        if let Some(worker) = &self.worker {
            worker.abort();
        }
    }

    /// Snapshot for display.
    pub fn status(&self) -> StatusSnapshot {
        let (state, last_summary, frames_pending) = match &self.worker {
            Some(worker) => (
                worker.status(),
                worker.last_summary(),
                worker.channel().len(),
            ),
            None => (WorkerState::Idle, None, 0),
        };
        let last_fault = self
            .last_fault
            .lock()
            .clone()
            .or_else(|| last_summary.as_ref().and_then(|s| s.fault.clone()));
        StatusSnapshot {
            state,
            last_fault,
            last_summary,
            frames_pending,
            configured: self.sequence.is_some(),
        }
    }

    /// The sequence the next run will use.
    pub fn sequence(&self) -> Option<&AcquisitionSequence> {
        self.sequence.as_ref()
    }

    /// Drain every frame currently waiting, oldest first.
    pub fn frames(&self) -> Vec<AcquisitionFrame> {
        self.worker
            .as_ref()
            .map(|worker| worker.channel().drain())
            .unwrap_or_default()
    }

    /// Result channel, for consumers that poll on their own schedule.
    pub fn channel(&self) -> Option<Arc<ResultChannel>> {
        self.worker.as_ref().map(AcquisitionWorker::channel)
    }

    /// Raw state events, for consumers that want more than notifications.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StateEvent>> {
        self.worker.as_ref().map(AcquisitionWorker::subscribe)
    }

    /// Copy of the notification history, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().entries().cloned().collect()
    }

    /// Resize the notification history, trimming the oldest messages.
    pub fn set_notification_capacity(&self, capacity: usize) {
        self.notifications.lock().set_capacity(capacity);
    }

    /// Wait until the worker is idle. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        match &self.worker {
            Some(worker) => worker.wait_idle(timeout).await,
            None => true,
        }
    }

    /// Wait for the current run to finish and return its summary.
    pub async fn join(&mut self) -> Option<RunSummary> {
        match self.worker.as_mut() {
            Some(worker) => worker.join().await,
            None => None,
        }
    }

    /// Abort any active run, wait for the hardware to be released, destroy the worker
    /// and stop the notification listener.
    pub async fn shutdown(&mut self) -> Option<RunSummary> {
        let summary = match self.worker.as_mut() {
            Some(worker) => {
                worker.abort();
                worker.join().await
            }
            None => None,
        };
        // Dropping the worker closes the event stream, which ends the listener
        self.worker = None;
        if let Some(listener) = self.listener.take() {
            if let Err(err) = listener.await {
                warn!(error = %err, "notification listener failed");
            }
        }
        info!("experiment controller shut down");
        summary
    }

    fn notify(&self, level: NotificationLevel, message: String) {
        self.notifications
            .lock()
            .push(Notification::new(level, message));
    }
}

async fn listen(
    mut events: broadcast::Receiver<StateEvent>,
    notifications: Arc<Mutex<NotificationLog>>,
    last_fault: Arc<Mutex<Option<RunFault>>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(fault) = &event.fault {
                    *last_fault.lock() = Some(fault.clone());
                }
                if let Some(note) = Notification::from_event(&event) {
                    debug!(message = %note.message, "notification");
                    notifications.lock().push(note);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "notification listener fell behind");
                notifications.lock().push(Notification::new(
                    NotificationLevel::Warning,
                    format!("{missed} status updates missed"),
                ));
            }
            Err(RecvError::Closed) => break,
        }
    }
}

//! The acquisition worker: a finite-state machine that drives the trigger, camera and
//! stage through one run at a time.
//!
//! # State Machine
//!
//! ```text
//!          start()            all armed            last index / stop()
//!  Idle ───────────▶ Arming ───────────▶ Running ─────────────────────▶ Stopping ──┐
//!   ▲                  │                    │                                        │
//!   │                  │ device error       │ fatal error / too many timeouts        │
//!   │                  ▼                    ▼                                        │
//!   │               Faulted ◀───────────────┘                                        │
//!   │                  │                                                             │
//!   │                  │        abort() from Arming or Running ──▶ Aborting ──┐      │
//!   └──────────────────┴──────── adapters released ◀──────────────────────────┴──────┘
//! ```
//!
//! # Execution Model
//!
//! A run executes on its own Tokio task. Within a trigger index the steps are strictly
//! sequenced (stage move → trigger → frame read) and no two indices overlap. Every
//! adapter call is bounded by a timeout, and the whole run by an overall deadline.
//!
//! `stop()` and `abort()` set a cooperative cancellation flag. A stop is honoured between
//! trigger indices; an abort also interrupts the in-flight adapter call. Either way the
//! adapters are closed before the worker returns to `Idle`.

use crate::acquisition::channel::{ResultChannel, MIN_AUTO_CAPACITY};
use crate::acquisition::sequence::AcquisitionSequence;
use crate::core::{AcquisitionFrame, DeviceKind, RunSummary, StateEvent, WorkerState};
use crate::error::{DeviceError, RunFault, StartError};
use crate::hardware::{CameraCommand, DeviceSet, HardwareAdapter, StageCommand, TriggerCommand};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

/// Timeouts and failure policy for the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bound on `open()` for each adapter
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Bound on `arm()` for each adapter
    #[serde(with = "humantime_serde")]
    pub arm_timeout: Duration,
    /// Bound on one trigger pulse
    #[serde(with = "humantime_serde")]
    pub trigger_timeout: Duration,
    /// Added to the exposure window to bound each frame read
    #[serde(with = "humantime_serde")]
    pub camera_guard: Duration,
    /// Bound on one stage move or position query
    #[serde(with = "humantime_serde")]
    pub stage_move_timeout: Duration,
    /// Bound on `close()` for each adapter
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
    /// Consecutive trigger/camera timeouts that fault the run
    pub max_consecutive_timeouts: u32,
    /// Added to the sequence's run duration to form the overall run deadline
    #[serde(with = "humantime_serde")]
    pub run_deadline_margin: Duration,
    /// Fixed result channel capacity; sized from the trigger rate when unset
    pub channel_capacity: Option<usize>,
    /// Seconds of frames the channel holds when sized from the trigger rate
    pub channel_buffer_seconds: f64,
    /// Treat timing violations as fatal
    pub abort_on_timing_violation: bool,
    /// Buffered state events per subscriber
    pub event_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(2),
            arm_timeout: Duration::from_secs(2),
            trigger_timeout: Duration::from_secs(1),
            camera_guard: Duration::from_millis(500),
            stage_move_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            max_consecutive_timeouts: 3,
            run_deadline_margin: Duration::from_secs(10),
            channel_capacity: None,
            channel_buffer_seconds: 2.0,
            abort_on_timing_violation: false,
            event_capacity: 64,
        }
    }
}

impl WorkerConfig {
    /// Check the policy values for internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_consecutive_timeouts == 0 {
            return Err("max_consecutive_timeouts must be at least 1".into());
        }
        let timeouts = [
            ("open_timeout", self.open_timeout),
            ("arm_timeout", self.arm_timeout),
            ("trigger_timeout", self.trigger_timeout),
            ("stage_move_timeout", self.stage_move_timeout),
            ("close_timeout", self.close_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(format!("{name} must be non-zero"));
        }
        if self.channel_capacity == Some(0) {
            return Err("channel_capacity must be at least 1".into());
        }
        if !(self.channel_buffer_seconds > 0.0) {
            return Err("channel_buffer_seconds must be positive".into());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be at least 1".into());
        }
        Ok(())
    }

    /// Result channel capacity for a run of `sequence`.
    pub fn channel_capacity_for(&self, sequence: &AcquisitionSequence) -> usize {
        self.channel_capacity.unwrap_or_else(|| {
            ResultChannel::capacity_for_rate(sequence.trigger_rate_hz(), self.channel_buffer_seconds)
        })
    }

    /// Worst-case time for `abort()` to bring the worker back to `Idle`.
    pub fn release_bound(&self) -> Duration {
        self.close_timeout.saturating_mul(3)
    }
}

// =============================================================================
// Worker handle
// =============================================================================

/// Cooperative cancellation request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CancelRequest {
    /// Keep going
    #[default]
    None,
    /// Finish the in-flight trigger/frame, then stop
    Stop,
    /// Cancel immediately
    Abort,
}

/// Owns the hardware adapters and executes one acquisition run at a time.
///
/// The worker object outlives its runs: after a run ends (completed, stopped,
/// aborted or faulted) it is back in `Idle` and can be started again.
pub struct AcquisitionWorker {
    devices: Arc<Mutex<DeviceSet>>,
    config: WorkerConfig,
    channel: Arc<ResultChannel>,
    state: Arc<watch::Sender<WorkerState>>,
    events: broadcast::Sender<StateEvent>,
    cancel: Arc<watch::Sender<CancelRequest>>,
    last_summary: Arc<parking_lot::Mutex<Option<RunSummary>>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AcquisitionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionWorker")
            .field("state", &self.status())
            .field("channel", &self.channel)
            .finish()
    }
}

impl AcquisitionWorker {
    /// Create an idle worker that owns `devices`.
    pub fn new(devices: DeviceSet, config: WorkerConfig) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        let (cancel, _) = watch::channel(CancelRequest::None);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let channel = ResultChannel::with_capacity(config.channel_capacity.unwrap_or(MIN_AUTO_CAPACITY));
        Self {
            devices: Arc::new(Mutex::new(devices)),
            config,
            channel: Arc::new(channel),
            state: Arc::new(state),
            events,
            cancel: Arc::new(cancel),
            last_summary: Arc::new(parking_lot::Mutex::new(None)),
            task: None,
        }
    }

    /// Begin a run on a new Tokio task.
    ///
    /// Must be called from within a Tokio runtime. The worker is in `Arming` when this
    /// returns; the result channel is resized for the sequence's trigger rate.
    pub fn start(&mut self, sequence: AcquisitionSequence) -> Result<Uuid, StartError> {
        let current = self.status();
        if current != WorkerState::Idle {
            return Err(StartError::NotIdle(current));
        }
        let devices = self
            .devices
            .clone()
            .try_lock_owned()
            .map_err(|_| StartError::DevicesBusy)?;
        self.task = None;

        self.channel
            .set_capacity(self.config.channel_capacity_for(&sequence));
        self.cancel.send_replace(CancelRequest::None);

        let run_id = Uuid::new_v4();
        let mut publisher = StatePublisher {
            state: self.state.clone(),
            events: self.events.clone(),
            run_id,
            transitions: Vec::new(),
        };
        publisher.publish(WorkerState::Arming, None);

        let run = Run {
            run_id,
            stats: RunStats::new(sequence.trigger_count(), self.channel.overflow_count()),
            sequence,
            config: self.config.clone(),
            devices,
            channel: self.channel.clone(),
            cancel: self.cancel.subscribe(),
            publisher,
            last_summary: self.last_summary.clone(),
            opened: Opened::default(),
            stage_position: None,
            started: Instant::now(),
        };
        let span = info_span!("acquisition_run", %run_id);
        self.task = Some(tokio::spawn(run.execute().instrument(span)));
        Ok(run_id)
    }

    /// Request a graceful stop: the in-flight trigger/frame completes, then the run ends.
    ///
    /// Only a `Running` worker can be stopped. While `Arming` there is no frame to
    /// finish, so the request is ignored; use [`abort`](Self::abort) to cancel arming.
    pub fn stop(&self) {
        let state = self.status();
        if state != WorkerState::Running {
            debug!(%state, "stop ignored, worker is not running");
            return;
        }
        let requested = self.cancel.send_if_modified(|request| {
            if *request == CancelRequest::None {
                *request = CancelRequest::Stop;
                true
            } else {
                false
            }
        });
        if requested {
            info!("stop requested");
        }
    }

    /// Cancel immediately. In-flight adapter calls are abandoned; adapters are still closed.
    pub fn abort(&self) {
        if !self.status().is_active() {
            return;
        }
        if self.cancel.send_replace(CancelRequest::Abort) != CancelRequest::Abort {
            warn!("abort requested");
        }
    }

    /// Current state snapshot.
    pub fn status(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Push-style state notifications, including the fault cause.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Queue the consumer drains frames from.
    pub fn channel(&self) -> Arc<ResultChannel> {
        self.channel.clone()
    }

    /// Worker policy.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Statistics of the most recently finished run.
    pub fn last_summary(&self) -> Option<RunSummary> {
        self.last_summary.lock().clone()
    }

    /// Wait until the worker is `Idle`. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut state = self.state.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|state| *state == WorkerState::Idle),
        )
        .await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Wait for the current run's task to finish and return its summary.
    pub async fn join(&mut self) -> Option<RunSummary> {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                // The task died without running its release path
                error!(error = %err, "acquisition task failed");
                self.state.send_replace(WorkerState::Idle);
            }
        }
        self.last_summary()
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        // A detached run still releases its adapters
        if self.status().is_active() {
            self.cancel.send_replace(CancelRequest::Abort);
        }
    }
}

// =============================================================================
// Run execution
// =============================================================================

struct StatePublisher {
    state: Arc<watch::Sender<WorkerState>>,
    events: broadcast::Sender<StateEvent>,
    run_id: Uuid,
    transitions: Vec<WorkerState>,
}

impl StatePublisher {
    fn publish(&mut self, state: WorkerState, fault: Option<RunFault>) {
        self.publish_with_summary(state, fault, None);
    }

    fn publish_with_summary(
        &mut self,
        state: WorkerState,
        fault: Option<RunFault>,
        summary: Option<RunSummary>,
    ) {
        info!(%state, "worker state changed");
        self.transitions.push(state);
        self.state.send_replace(state);
        // No subscribers is fine
        let _ = self.events.send(StateEvent {
            state,
            run_id: self.run_id,
            fault,
            summary,
            at: Utc::now(),
        });
    }
}

#[derive(Debug)]
struct RunStats {
    triggers_requested: u32,
    frames_captured: u32,
    dropped_frames: u32,
    timing_violations: u32,
    waypoints_reached: u32,
    waypoints_skipped: u32,
    overflows_at_start: u64,
    stopped_early: bool,
}

impl RunStats {
    fn new(triggers_requested: u32, overflows_at_start: u64) -> Self {
        Self {
            triggers_requested,
            frames_captured: 0,
            dropped_frames: 0,
            timing_violations: 0,
            waypoints_reached: 0,
            waypoints_skipped: 0,
            overflows_at_start,
            stopped_early: false,
        }
    }
}

/// Adapters whose `open()` was attempted and which therefore must be closed.
#[derive(Debug, Default)]
struct Opened {
    trigger: bool,
    camera: bool,
    stage: bool,
}

enum Outcome {
    Completed,
    Stopped,
    Aborted,
    Faulted(RunFault),
}

impl From<RunFault> for Outcome {
    fn from(fault: RunFault) -> Self {
        Outcome::Faulted(fault)
    }
}

struct Run {
    run_id: Uuid,
    sequence: AcquisitionSequence,
    config: WorkerConfig,
    devices: OwnedMutexGuard<DeviceSet>,
    channel: Arc<ResultChannel>,
    cancel: watch::Receiver<CancelRequest>,
    publisher: StatePublisher,
    last_summary: Arc<parking_lot::Mutex<Option<RunSummary>>>,
    stats: RunStats,
    opened: Opened,
    stage_position: Option<f64>,
    started: Instant,
}

impl Run {
    async fn execute(mut self) {
        info!(
            triggers = self.sequence.trigger_count(),
            interval = ?self.sequence.trigger_interval(),
            exposure = ?self.sequence.exposure(),
            waypoints = self.sequence.waypoints().len(),
            "acquisition run starting"
        );
        // A panicking adapter must not skip the release path
        let outcome = AssertUnwindSafe(self.drive())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                error!(%reason, "acquisition run panicked");
                RunFault::Internal { reason }.into()
            });
        self.finish(outcome).await;
    }

    async fn drive(&mut self) -> Outcome {
        match self.arm_all().await {
            Ok(()) => {
                self.publisher.publish(WorkerState::Running, None);
                self.run_triggers().await
            }
            Err(outcome) => outcome,
        }
    }

    /// Open and arm trigger, camera and stage, in that order.
    async fn arm_all(&mut self) -> Result<(), Outcome> {
        self.opened.trigger = true;
        prepare(
            &mut *self.devices.trigger,
            self.sequence.trigger_settings(),
            &mut self.cancel,
            &self.config,
        )
        .await?;

        self.opened.camera = true;
        prepare(
            &mut *self.devices.camera,
            self.sequence.camera_settings(),
            &mut self.cancel,
            &self.config,
        )
        .await?;

        self.opened.stage = true;
        prepare(
            &mut *self.devices.stage,
            self.sequence.stage_settings(),
            &mut self.cancel,
            &self.config,
        )
        .await?;

        let position = unless_aborted(
            &mut self.cancel,
            bounded(
                DeviceKind::Stage,
                "read position",
                self.config.stage_move_timeout,
                self.devices.stage.execute(StageCommand::ReadPosition),
            ),
        )
        .await
        .ok_or(Outcome::Aborted)?;
        match position {
            Ok(position) => self.stage_position = Some(position),
            Err(err) => warn!(error = %err, "could not read initial stage position"),
        }
        Ok(())
    }

    async fn run_triggers(&mut self) -> Outcome {
        let count = self.sequence.trigger_count();
        let tolerance = self.sequence.late_tolerance();
        let camera_timeout = self.sequence.exposure().saturating_add(self.config.camera_guard);
        let limit = self
            .sequence
            .run_duration()
            .saturating_add(self.config.run_deadline_margin);
        let Some(deadline) = self.started.checked_add(limit) else {
            return RunFault::DeadlineExceeded { limit }.into();
        };
        let run_start = Instant::now();
        let mut next_waypoint = 0usize;
        let mut consecutive_timeouts = 0u32;

        for index in 0..count {
            let request = *self.cancel.borrow();
            match request {
                CancelRequest::Abort => return Outcome::Aborted,
                CancelRequest::Stop => {
                    self.stats.stopped_early = true;
                    return Outcome::Stopped;
                }
                CancelRequest::None => {}
            }
            if Instant::now() >= deadline {
                return RunFault::DeadlineExceeded { limit }.into();
            }

            let offset = self.sequence.offset_of(index);
            let Some(scheduled) = run_start.checked_add(offset) else {
                return RunFault::DeadlineExceeded { limit }.into();
            };

            // (a) stage waypoint, if one has come due
            let mut stage_late = false;
            if let Some(target) = self.due_waypoint(&mut next_waypoint, offset) {
                let moved = unless_aborted(
                    &mut self.cancel,
                    bounded(
                        DeviceKind::Stage,
                        "move",
                        self.config.stage_move_timeout,
                        self.devices.stage.execute(StageCommand::MoveTo(target)),
                    ),
                )
                .await;
                let late = match moved {
                    None => return Outcome::Aborted,
                    Some(Ok(reached)) => {
                        self.stage_position = Some(reached);
                        self.stats.waypoints_reached += 1;
                        debug!(index, position = target, reached, "waypoint reached");
                        Instant::now().saturating_duration_since(scheduled) > tolerance
                    }
                    Some(Err(err)) if err.is_timeout() => {
                        warn!(
                            index,
                            position = target,
                            error = %err,
                            "stage did not reach waypoint in time"
                        );
                        true
                    }
                    Some(Err(err)) => return RunFault::from(err).into(),
                };
                if late {
                    stage_late = true;
                    let late_by = Instant::now().saturating_duration_since(scheduled);
                    if let Err(fault) = self.timing_violation(index, late_by) {
                        return fault.into();
                    }
                }
            }

            // Pace to the scheduled offset; stop or abort may arrive while waiting
            let request = unless_cancelled(&mut self.cancel, tokio::time::sleep_until(scheduled)).await;
            match request {
                Some(CancelRequest::Abort) => return Outcome::Aborted,
                Some(_) => {
                    self.stats.stopped_early = true;
                    return Outcome::Stopped;
                }
                None => {}
            }
            let late_by = Instant::now().saturating_duration_since(scheduled);
            if !stage_late && late_by > tolerance {
                if let Err(fault) = self.timing_violation(index, late_by) {
                    return fault.into();
                }
            }

            // (b) trigger
            let fired = unless_aborted(
                &mut self.cancel,
                bounded(
                    DeviceKind::Trigger,
                    "fire",
                    self.config.trigger_timeout,
                    self.devices.trigger.execute(TriggerCommand::Fire),
                ),
            )
            .await;
            let ack = match fired {
                None => return Outcome::Aborted,
                Some(Ok(ack)) => ack,
                Some(Err(err)) if err.is_timeout() => {
                    if let Some(fault) = self.frame_dropped(index, err, &mut consecutive_timeouts) {
                        return fault.into();
                    }
                    continue;
                }
                Some(Err(err)) => return RunFault::from(err).into(),
            };

            // (c) frame read
            let read = unless_aborted(
                &mut self.cancel,
                bounded(
                    DeviceKind::Camera,
                    "read frame",
                    camera_timeout,
                    self.devices.camera.execute(CameraCommand::ReadFrame),
                ),
            )
            .await;
            let image = match read {
                None => return Outcome::Aborted,
                Some(Ok(image)) => image,
                Some(Err(err)) if err.is_timeout() => {
                    if let Some(fault) = self.frame_dropped(index, err, &mut consecutive_timeouts) {
                        return fault.into();
                    }
                    continue;
                }
                Some(Err(err)) => return RunFault::from(err).into(),
            };
            consecutive_timeouts = 0;

            // (d) hand off
            let frame = AcquisitionFrame {
                index,
                run_id: self.run_id,
                captured_at: Utc::now(),
                image,
                stage_position: self.stage_position,
                trigger_latency: ack.fired_at.elapsed(),
            };
            debug!(
                index,
                pulse = ack.pulse_number,
                latency = ?frame.trigger_latency,
                "frame captured"
            );
            self.stats.frames_captured += 1;
            self.channel.push(frame);
        }

        let never_due = self.sequence.waypoints().len().saturating_sub(next_waypoint);
        if never_due > 0 {
            debug!(never_due, "waypoints after the final trigger were not visited");
            self.stats.waypoints_skipped += never_due as u32;
        }
        Outcome::Completed
    }

    /// Latest waypoint whose offset has passed; earlier unvisited ones are skipped.
    fn due_waypoint(&mut self, cursor: &mut usize, offset: Duration) -> Option<f64> {
        let pending = self.sequence.waypoints().get(*cursor..).unwrap_or_default();
        let due = pending.iter().take_while(|wp| wp.offset <= offset).count();
        let target = pending.get(due.checked_sub(1)?)?.position;
        if due > 1 {
            debug!(skipped = due - 1, "superseded waypoints skipped");
            self.stats.waypoints_skipped += (due - 1) as u32;
        }
        *cursor += due;
        Some(target)
    }

    fn timing_violation(&mut self, index: u32, late_by: Duration) -> Result<(), RunFault> {
        self.stats.timing_violations += 1;
        warn!(index, late_by = ?late_by, "timing violation");
        if self.config.abort_on_timing_violation {
            return Err(RunFault::TimingViolation { index, late_by });
        }
        Ok(())
    }

    fn frame_dropped(
        &mut self,
        index: u32,
        err: DeviceError,
        consecutive: &mut u32,
    ) -> Option<RunFault> {
        self.stats.dropped_frames += 1;
        *consecutive += 1;
        warn!(
            index,
            consecutive = *consecutive,
            threshold = self.config.max_consecutive_timeouts,
            error = %err,
            "frame dropped"
        );
        if *consecutive >= self.config.max_consecutive_timeouts {
            return Some(RunFault::Device(err));
        }
        None
    }

    /// Close every adapter that was opened, last opened first. Never interrupted.
    async fn release(&mut self) {
        let limit = self.config.close_timeout;
        if self.opened.stage {
            close_quietly(&mut *self.devices.stage, limit).await;
        }
        if self.opened.camera {
            close_quietly(&mut *self.devices.camera, limit).await;
        }
        if self.opened.trigger {
            close_quietly(&mut *self.devices.trigger, limit).await;
        }
        self.opened = Opened::default();
    }

    async fn finish(mut self, outcome: Outcome) {
        let (terminal, fault, aborted) = match outcome {
            Outcome::Completed => {
                info!(frames = self.stats.frames_captured, "final trigger complete");
                (WorkerState::Stopping, None, false)
            }
            Outcome::Stopped => {
                info!(frames = self.stats.frames_captured, "run stopped on request");
                (WorkerState::Stopping, None, false)
            }
            Outcome::Aborted => {
                warn!(frames = self.stats.frames_captured, "run aborted");
                (WorkerState::Aborting, None, true)
            }
            Outcome::Faulted(fault) => {
                error!(fault = %fault, frames = self.stats.frames_captured, "run faulted");
                (WorkerState::Faulted, Some(fault), false)
            }
        };
        self.publisher.publish(terminal, fault.clone());
        self.release().await;

        let Run {
            run_id,
            devices,
            channel,
            mut publisher,
            last_summary,
            stats,
            started,
            ..
        } = self;

        let mut transitions = publisher.transitions.clone();
        transitions.push(WorkerState::Idle);
        let summary = RunSummary {
            run_id,
            triggers_requested: stats.triggers_requested,
            frames_captured: stats.frames_captured,
            dropped_frames: stats.dropped_frames,
            timing_violations: stats.timing_violations,
            channel_overflows: channel
                .overflow_count()
                .saturating_sub(stats.overflows_at_start),
            waypoints_reached: stats.waypoints_reached,
            waypoints_skipped: stats.waypoints_skipped,
            transitions,
            fault,
            aborted,
            stopped_early: stats.stopped_early,
            elapsed: started.elapsed(),
        };
        info!(
            frames = summary.frames_captured,
            dropped = summary.dropped_frames,
            timing_violations = summary.timing_violations,
            overflows = summary.channel_overflows,
            elapsed = ?summary.elapsed,
            "acquisition run finished"
        );
        *last_summary.lock() = Some(summary.clone());

        // Hardware must be free before anyone can observe Idle and start again
        drop(devices);
        publisher.publish_with_summary(WorkerState::Idle, None, Some(summary));
    }
}

// =============================================================================
// Bounded adapter calls
// =============================================================================

/// Run an adapter call with a timeout, reporting expiry as `DeviceError::Timeout`.
async fn bounded<T>(
    device: DeviceKind,
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, DeviceError>>,
) -> Result<T, DeviceError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            device,
            operation,
            after: limit,
        }),
    }
}

/// Wait until the cancellation flag satisfies `accept`.
async fn cancellation(
    cancel: &mut watch::Receiver<CancelRequest>,
    accept: fn(CancelRequest) -> bool,
) -> CancelRequest {
    loop {
        let request = *cancel.borrow_and_update();
        if accept(request) {
            return request;
        }
        if cancel.changed().await.is_err() {
            // Worker handle dropped without a request; nothing can cancel us now
            std::future::pending::<()>().await;
        }
    }
}

/// `None` if an abort arrives before `call` finishes.
async fn unless_aborted<T>(
    cancel: &mut watch::Receiver<CancelRequest>,
    call: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancellation(cancel, |r| r == CancelRequest::Abort) => None,
        value = call => Some(value),
    }
}

/// `Some(request)` if a stop or abort arrives before `wait` finishes.
async fn unless_cancelled(
    cancel: &mut watch::Receiver<CancelRequest>,
    wait: impl Future<Output = ()>,
) -> Option<CancelRequest> {
    tokio::select! {
        biased;
        request = cancellation(cancel, |r| r != CancelRequest::None) => Some(request),
        () = wait => None,
    }
}

/// Open then arm one adapter, mapping an open timeout to `Unavailable`.
async fn prepare<A>(
    adapter: &mut A,
    settings: &A::Settings,
    cancel: &mut watch::Receiver<CancelRequest>,
    config: &WorkerConfig,
) -> Result<(), Outcome>
where
    A: HardwareAdapter + ?Sized,
{
    let device = adapter.kind();
    let opened = unless_aborted(cancel, bounded(device, "open", config.open_timeout, adapter.open()))
        .await
        .ok_or(Outcome::Aborted)?;
    match opened {
        Ok(()) => {}
        Err(DeviceError::Timeout { after, .. }) => {
            return Err(RunFault::from(DeviceError::Unavailable {
                device,
                reason: format!("no response within {after:?}"),
            })
            .into())
        }
        Err(err) => return Err(RunFault::from(err).into()),
    }

    unless_aborted(cancel, bounded(device, "arm", config.arm_timeout, adapter.arm(settings)))
        .await
        .ok_or(Outcome::Aborted)?
        .map_err(|err| Outcome::Faulted(err.into()))?;
    debug!(%device, "armed");
    Ok(())
}

async fn close_quietly<A>(adapter: &mut A, limit: Duration)
where
    A: HardwareAdapter + ?Sized,
{
    let device = adapter.kind();
    match bounded(device, "close", limit, adapter.close()).await {
        Ok(()) => debug!(%device, "released"),
        Err(err) => warn!(%device, error = %err, "release failed"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

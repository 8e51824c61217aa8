//! Bounded log of user-facing messages produced from worker state events.

use crate::core::{RunSummary, StateEvent, WorkerState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Messages kept when no capacity is configured.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 100;

/// Severity of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NotificationLevel {
    /// Routine progress
    Info,
    /// Run ended early or lost data
    Warning,
    /// Run faulted
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotificationLevel::Info => "INFO",
            NotificationLevel::Warning => "WARN",
            NotificationLevel::Error => "ERROR",
        })
    }
}

/// One message for the operator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    /// Severity
    pub level: NotificationLevel,
    /// Text shown to the operator
    pub message: String,
    /// Run the message refers to
    pub run_id: Option<Uuid>,
    /// When the underlying event happened
    pub at: DateTime<Utc>,
}

impl Notification {
    /// Message not tied to a run.
    pub fn new(level: NotificationLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            run_id: None,
            at: Utc::now(),
        }
    }

    /// Operator-facing message for a state transition, if it warrants one.
    pub fn from_event(event: &StateEvent) -> Option<Self> {
        let (level, message) = match event.state {
            WorkerState::Arming => (NotificationLevel::Info, "Run started".to_string()),
            WorkerState::Running => (NotificationLevel::Info, "Hardware armed, acquiring".to_string()),
            WorkerState::Stopping => return None,
            WorkerState::Aborting => (NotificationLevel::Warning, "Aborting run".to_string()),
            WorkerState::Faulted => {
                let cause = event
                    .fault
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "unknown cause".to_string());
                (NotificationLevel::Error, format!("Fault: {cause}"))
            }
            WorkerState::Idle => summarize(event.summary.as_ref()?),
        };
        Some(Self {
            level,
            message,
            run_id: Some(event.run_id),
            at: event.at,
        })
    }
}

fn summarize(summary: &RunSummary) -> (NotificationLevel, String) {
    let frames = summary.frames_captured;
    if summary.fault.is_some() {
        return (
            NotificationLevel::Error,
            format!("Run failed after {frames} of {} frames", summary.triggers_requested),
        );
    }
    if summary.aborted {
        return (
            NotificationLevel::Warning,
            format!("Run aborted after {frames} frames"),
        );
    }
    if summary.stopped_early {
        return (
            NotificationLevel::Info,
            format!("Run stopped: {frames} of {} frames", summary.triggers_requested),
        );
    }
    if summary.dropped_frames > 0 || summary.channel_overflows > 0 {
        return (
            NotificationLevel::Warning,
            format!(
                "Run complete: {frames} frames ({} dropped, {} overwritten)",
                summary.dropped_frames, summary.channel_overflows
            ),
        );
    }
    (NotificationLevel::Info, format!("Run complete: {frames} frames"))
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.at.format("%H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}

/// Fixed-capacity message history; the oldest messages are trimmed first.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    entries: VecDeque<Notification>,
    capacity: usize,
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl NotificationLog {
    /// Log holding at most `capacity` messages (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a message, trimming the oldest if full.
    pub fn push(&mut self, notification: Notification) {
        self.entries.push_back(notification);
        self.trim();
    }

    /// Change the capacity at runtime, dropping the oldest messages that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.trim();
    }

    /// Maximum number of retained messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages currently retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent message.
    pub fn latest(&self) -> Option<&Notification> {
        self.entries.back()
    }

    /// Oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceKind, WorkerState};
    use crate::error::{DeviceError, RunFault};
    use std::time::Duration;

    fn event(state: WorkerState) -> StateEvent {
        StateEvent {
            state,
            run_id: Uuid::nil(),
            fault: None,
            summary: None,
            at: Utc::now(),
        }
    }

    fn summary(frames: u32) -> RunSummary {
        RunSummary {
            run_id: Uuid::nil(),
            triggers_requested: 5,
            frames_captured: frames,
            dropped_frames: 0,
            timing_violations: 0,
            channel_overflows: 0,
            waypoints_reached: 0,
            waypoints_skipped: 0,
            transitions: Vec::new(),
            fault: None,
            aborted: false,
            stopped_early: false,
            elapsed: Duration::from_millis(120),
        }
    }

    #[test]
    fn test_capacity_trims_oldest() {
        let mut log = NotificationLog::with_capacity(3);
        for i in 0..5 {
            log.push(Notification::new(NotificationLevel::Info, format!("message {i}")));
        }
        assert_eq!(log.len(), 3);
        let messages: Vec<&str> = log.entries().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["message 2", "message 3", "message 4"]);

        log.set_capacity(1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.latest().map(|n| n.message.as_str()), Some("message 4"));
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(NotificationLog::default().capacity(), DEFAULT_NOTIFICATION_CAPACITY);
        assert_eq!(NotificationLog::with_capacity(0).capacity(), 1);
    }

    #[test]
    fn test_event_messages() {
        let started = Notification::from_event(&event(WorkerState::Arming)).unwrap();
        assert_eq!(started.message, "Run started");
        assert!(Notification::from_event(&event(WorkerState::Stopping)).is_none());

        let mut done = event(WorkerState::Idle);
        done.summary = Some(summary(5));
        let done = Notification::from_event(&done).unwrap();
        assert_eq!(done.message, "Run complete: 5 frames");
        assert_eq!(done.level, NotificationLevel::Info);
    }

    #[test]
    fn test_fault_message_carries_cause() {
        let mut faulted = event(WorkerState::Faulted);
        faulted.fault = Some(RunFault::Device(DeviceError::Timeout {
            device: DeviceKind::Camera,
            operation: "read frame",
            after: Duration::from_millis(505),
        }));

        let note = Notification::from_event(&faulted).unwrap();
        assert_eq!(note.level, NotificationLevel::Error);
        assert_eq!(note.message, "Fault: camera read frame timed out after 505ms");
    }
}

//! Bounded hand-off queue from the acquisition worker to its consumer.
//!
//! # Overflow Policy
//!
//! `push` never blocks the worker. When the queue is full the oldest unread frame is
//! evicted and the overflow counter is incremented: acquisition keeps moving forward and
//! the display history is what gets sacrificed.
//!
//! # Thread Safety
//!
//! - **Writes**: the worker pushes under a short `parking_lot` critical section.
//! - **Reads**: single-reader contract. `pop`/`drain` hand out whole frames under the
//!   same lock, so a reader never observes a partially written frame.
//! - **Waiting**: `recv_timeout` parks on a `Notify` instead of polling.

use crate::core::AcquisitionFrame;
use parking_lot::Mutex;
use ringbuf::{ring_buffer::RbBase, HeapRb, Rb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Smallest capacity used when sizing from a trigger rate.
pub const MIN_AUTO_CAPACITY: usize = 16;
/// Largest capacity used when sizing from a trigger rate.
pub const MAX_AUTO_CAPACITY: usize = 4096;

/// Bounded FIFO of acquisition frames with drop-oldest overflow.
pub struct ResultChannel {
    ring: Mutex<HeapRb<AcquisitionFrame>>,
    overflows: AtomicU64,
    pushed: AtomicU64,
    notify: Notify,
}

impl std::fmt::Debug for ResultChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("ResultChannel")
            .field("capacity", &ring.capacity())
            .field("len", &ring.len())
            .field("overflows", &self.overflow_count())
            .finish()
    }
}

impl ResultChannel {
    /// Create a channel holding at most `capacity` frames (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            overflows: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Capacity that holds `seconds` of frames at `rate_hz`, clamped to
    /// [`MIN_AUTO_CAPACITY`]..=[`MAX_AUTO_CAPACITY`].
    pub fn capacity_for_rate(rate_hz: f64, seconds: f64) -> usize {
        let frames = (rate_hz * seconds).ceil();
        if !frames.is_finite() || frames <= MIN_AUTO_CAPACITY as f64 {
            return MIN_AUTO_CAPACITY;
        }
        (frames as usize).min(MAX_AUTO_CAPACITY)
    }

    /// Enqueue a frame without blocking.
    ///
    /// Returns the index of the evicted frame if the channel was full.
    pub fn push(&self, frame: AcquisitionFrame) -> Option<u32> {
        let evicted = {
            let mut ring = self.ring.lock();
            let evicted = if ring.is_full() { ring.pop() } else { None };
            if let Err(rejected) = ring.push(frame) {
                // Only reachable if the ring has zero usable slots
                drop(ring);
                let lost = 1 + u64::from(evicted.is_some());
                self.overflows.fetch_add(lost, Ordering::Relaxed);
                warn!(index = rejected.index, "result channel rejected frame");
                return Some(rejected.index);
            }
            evicted
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = &evicted {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            warn!(
                evicted = old.index,
                overflows = self.overflow_count(),
                "result channel full, dropped oldest frame"
            );
        }
        self.notify.notify_one();
        evicted.map(|frame| frame.index)
    }

    /// Dequeue the oldest frame, transferring ownership to the caller.
    pub fn pop(&self) -> Option<AcquisitionFrame> {
        self.ring.lock().pop()
    }

    /// Dequeue every frame currently queued, oldest first.
    pub fn drain(&self) -> Vec<AcquisitionFrame> {
        let mut ring = self.ring.lock();
        let mut frames = Vec::with_capacity(ring.len());
        while let Some(frame) = ring.pop() {
            frames.push(frame);
        }
        frames
    }

    /// Wait up to `timeout` for the next frame.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<AcquisitionFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// True if no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Maximum number of queued frames.
    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    /// Frames evicted (or rejected) since creation.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Frames pushed since creation.
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Resize the queue, keeping the newest frames that still fit.
    ///
    /// Frames that no longer fit count as overflows.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut ring = self.ring.lock();
        if ring.capacity() == capacity {
            return;
        }
        let mut frames = Vec::with_capacity(ring.len());
        while let Some(frame) = ring.pop() {
            frames.push(frame);
        }
        let excess = frames.len().saturating_sub(capacity);
        if excess > 0 {
            self.overflows.fetch_add(excess as u64, Ordering::Relaxed);
        }
        let mut resized = HeapRb::new(capacity);
        for frame in frames.into_iter().skip(excess) {
            // Fits by construction
            let _ = resized.push(frame);
        }
        *ring = resized;
    }
}

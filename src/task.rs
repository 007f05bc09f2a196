//! Shared accounting for long-running worker-thread tasks
//!
//! Hashing and delta resolution both run on a caller-chosen number of OS
//! threads and can take a while on large files, so they expose the same
//! small surface: a bytes-done counter fed by the workers, a cooperative
//! cancel flag polled at block boundaries, and completion/success checks
//! derived from the two.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Progress and cancellation state shared between a task handle and its
/// worker threads.
#[derive(Debug)]
pub struct TaskState {
    bytes_total: i64,
    bytes_done: AtomicI64,
    cancelled: AtomicBool,
}

impl TaskState {
    pub(crate) fn new(bytes_total: i64) -> Self {
        Self {
            bytes_total,
            bytes_done: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Total bytes this task will account for on success.
    pub fn bytes_total(&self) -> i64 {
        self.bytes_total
    }

    /// Bytes accounted for so far.
    pub fn bytes_done(&self) -> i64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    /// Completion percentage in `[0, 100]`.
    pub fn progress(&self) -> f32 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        100.0 * self.bytes_done() as f32 / self.bytes_total as f32
    }

    /// Request cooperative cancellation; workers observe it at block
    /// boundaries.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Whether the task has stopped doing work, successfully or not.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.bytes_done() == self.bytes_total
    }

    /// Whether the task ran to completion with every byte accounted for.
    pub fn succeeded(&self) -> bool {
        !self.is_cancelled() && self.bytes_done() == self.bytes_total
    }

    /// Block the calling thread, polling until the task is done.
    pub fn wait(&self) {
        while !self.is_done() {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub(crate) fn add_bytes(&self, bytes: i64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }
}

//! Cooperative stop and stop-at handles.
//!
//! Stop is boundary-aligned: the engine polls the signal after each task
//! completes and finishes the current task before returning. Cancellation is
//! the OS-style counterpart and propagates through the `CancellationToken`
//! handed to every action.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop flag, polled by the engine after every task.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Holds the id of a task after which the run should stop. Completion of a
/// task with the stored id requests a stop automatically.
#[derive(Debug, Clone, Default)]
pub struct StopAtTask {
    target: Arc<Mutex<Option<String>>>,
}

impl StopAtTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target task id; an empty id clears the tracker.
    pub fn set(&self, task_id: &str) {
        let mut target = self.target.lock();
        if task_id.is_empty() {
            *target = None;
        } else {
            *target = Some(task_id.to_string());
        }
    }

    pub fn get(&self) -> Option<String> {
        self.target.lock().clone()
    }

    pub fn matches(&self, task_id: &str) -> bool {
        self.target
            .lock()
            .as_deref()
            .map(|t| t == task_id)
            .unwrap_or(false)
    }
}

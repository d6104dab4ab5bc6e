//! Delayed-task scheduling capability.
//!
//! Components that need to run something later (the cache group's deferred
//! restart) receive a [`Scheduler`] instead of touching timers directly, so
//! tests can substitute [`ManualScheduler`](crate::ManualScheduler).

use std::time::Duration;
use tokio::runtime::Handle;

use crate::task_queue::Task;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run once `delay` has elapsed.
    fn schedule_after(&self, delay: Duration, task: Task);
}

/// Scheduler backed by tokio timers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Creates a scheduler spawning onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a scheduler for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) {
        tracing::trace!(delay_ms = delay.as_millis() as u64, "scheduling delayed task");
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.run();
        });
    }
}

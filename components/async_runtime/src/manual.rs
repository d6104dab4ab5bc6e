//! Manually driven scheduler.
//!
//! [`ManualScheduler`] keeps a virtual clock that only moves when the owner
//! calls [`advance`](ManualScheduler::advance). Tasks never run on the
//! scheduling thread; they run inside `advance` or `run_pending`, after the
//! internal lock has been released, so a task may schedule further tasks.

use parking_lot::Mutex;
use std::time::Duration;

use crate::scheduler::Scheduler;
use crate::task_queue::{DelayedTaskQueue, Task};

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    queue: DelayedTaskQueue,
}

/// Scheduler with a virtual clock.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Creates a scheduler whose clock starts at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of tasks not yet run.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Moves the clock forward by `by` and runs every task that became due.
    ///
    /// Tasks scheduled by a running task are run too when they fall inside
    /// the new time. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = {
            let mut state = self.state.lock();
            state.now += by;
            state.now
        };
        self.drain_due(target)
    }

    /// Runs every queued task regardless of its due time, moving the clock
    /// to the latest due time seen.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = {
                let mut state = self.state.lock();
                let Some(due) = state.queue.next_due() else {
                    break;
                };
                if due > state.now {
                    state.now = due;
                }
                let now = state.now;
                state.queue.pop_due(now)
            };
            match task {
                Some(task) => {
                    task.run();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    fn drain_due(&self, now: Duration) -> usize {
        let mut ran = 0;
        loop {
            let task = self.state.lock().queue.pop_due(now);
            let Some(task) = task else {
                break;
            };
            task.run();
            ran += 1;
        }
        if ran > 0 {
            tracing::trace!(ran, now_ms = now.as_millis() as u64, "ran due tasks");
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let due = state.now + delay;
        state.queue.push(due, task);
    }
}

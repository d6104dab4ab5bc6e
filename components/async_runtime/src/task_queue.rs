//! Tasks and the delayed task queue.
//!
//! A [`Task`] is a one-shot closure. [`DelayedTaskQueue`] orders tasks by
//! due time, breaking ties by insertion order so tasks scheduled for the same
//! instant run first-in first-out.

use std::collections::VecDeque;
use std::time::Duration;

/// A unit of deferred work.
pub struct Task {
    callback: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Creates a new Task from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Box::new(f),
        }
    }

    /// Executes the task.
    pub fn run(self) {
        (self.callback)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task {{ ... }}")
    }
}

#[derive(Debug)]
struct DelayedTask {
    due: Duration,
    seq: u64,
    task: Task,
}

/// Tasks ordered by due time on a virtual clock.
#[derive(Debug, Default)]
pub struct DelayedTaskQueue {
    queue: VecDeque<DelayedTask>,
    next_seq: u64,
}

impl DelayedTaskQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task due at `due`.
    pub fn push(&mut self, due: Duration, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let index = self
            .queue
            .iter()
            .position(|queued| (queued.due, queued.seq) > (due, seq))
            .unwrap_or(self.queue.len());
        self.queue.insert(index, DelayedTask { due, seq, task });
    }

    /// Removes the earliest task due at or before `now`.
    pub fn pop_due(&mut self, now: Duration) -> Option<Task> {
        if self.queue.front()?.due <= now {
            self.queue.pop_front().map(|delayed| delayed.task)
        } else {
            None
        }
    }

    /// Due time of the earliest task.
    pub fn next_due(&self) -> Option<Duration> {
        self.queue.front().map(|delayed| delayed.due)
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

//! Deferred task execution for the application cache.
//!
//! This crate provides the scheduling capability the update engine uses to
//! run work later, such as restarting an update for hosts that arrived while
//! the previous one was finishing.
//!
//! # Overview
//!
//! - [`Scheduler`] - run a [`Task`] after a delay
//! - [`TokioScheduler`] - production scheduler built on tokio timers
//! - [`ManualScheduler`] - virtual clock advanced explicitly by tests
//!
//! # Examples
//!
//! ```
//! use async_runtime::{ManualScheduler, Scheduler, Task};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let scheduler = ManualScheduler::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = hits.clone();
//! scheduler.schedule_after(Duration::from_secs(1), Task::new(move || {
//!     h.fetch_add(1, Ordering::SeqCst);
//! }));
//!
//! assert_eq!(scheduler.advance(Duration::from_millis(999)), 0);
//! assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manual;
pub mod scheduler;
pub mod task_queue;

pub use manual::ManualScheduler;
pub use scheduler::{Scheduler, TokioScheduler};
pub use task_queue::{DelayedTaskQueue, Task};

//! Contract tests: every scheduler honours the [`Scheduler`] contract.

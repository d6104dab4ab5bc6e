//! Prints host events as they arrive.

use appcache::{AppCacheEvent, AppCacheFrontend, LogLevel};
use core_types::HostId;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Frontend writing one line per event or console message.
///
/// Every printed line is also kept so callers can inspect the output, and
/// the last terminal event is remembered as the outcome of the update.
pub struct PrintingFrontend {
    out: Mutex<Box<dyn Write + Send>>,
    lines: Mutex<Vec<String>>,
    outcome: Mutex<Option<AppCacheEvent>>,
}

impl PrintingFrontend {
    /// Creates a frontend writing to `out`.
    pub fn new(out: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            out: Mutex::new(out),
            lines: Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
        })
    }

    /// Creates a frontend writing to standard output.
    pub fn stdout() -> Arc<Self> {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Writes `line`.
    pub fn print(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut out = self.out.lock();
            // A closed pipe must not abort an update in flight.
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
        self.lines.lock().push(line);
    }

    /// Lines printed so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Last terminal event received.
    pub fn outcome(&self) -> Option<AppCacheEvent> {
        self.outcome.lock().clone()
    }

    /// Forgets the recorded outcome.
    pub fn reset(&self) {
        *self.outcome.lock() = None;
    }
}

impl AppCacheFrontend for PrintingFrontend {
    fn on_event(&self, _host_ids: &[HostId], event: &AppCacheEvent) {
        if event.is_terminal() {
            *self.outcome.lock() = Some(event.clone());
        }
        self.print(event.to_string());
    }

    fn on_log_message(&self, _host_ids: &[HostId], level: LogLevel, message: &str) {
        let tag = match level {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        self.print(format!("[{}] {}", tag, message));
    }
}

//! Events delivered to hosts and the frontend seam they travel through.

use core_types::HostId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::host::AppCacheHost;

/// Progress notifications of an update, as seen by hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCacheEvent {
    /// The manifest is being fetched.
    Checking,
    /// Resources are being downloaded.
    Downloading,
    /// One resource finished, or all of them when `url` is `None`.
    Progress {
        /// Resource that finished.
        url: Option<Url>,
        /// Resources to download.
        total: usize,
        /// Resources finished before this one.
        completed: usize,
    },
    /// A new version is ready to be swapped in.
    UpdateReady,
    /// The first version was cached.
    Cached,
    /// The manifest did not change.
    NoUpdate,
    /// The manifest is gone; the group is obsolete.
    Obsolete,
    /// The update failed.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl AppCacheEvent {
    /// DOM-style event name.
    pub fn name(&self) -> &'static str {
        match self {
            AppCacheEvent::Checking => "checking",
            AppCacheEvent::Downloading => "downloading",
            AppCacheEvent::Progress { .. } => "progress",
            AppCacheEvent::UpdateReady => "updateready",
            AppCacheEvent::Cached => "cached",
            AppCacheEvent::NoUpdate => "noupdate",
            AppCacheEvent::Obsolete => "obsolete",
            AppCacheEvent::Error { .. } => "error",
        }
    }

    /// True for the events that end an update for a host.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppCacheEvent::UpdateReady
                | AppCacheEvent::Cached
                | AppCacheEvent::NoUpdate
                | AppCacheEvent::Obsolete
                | AppCacheEvent::Error { .. }
        )
    }
}

impl fmt::Display for AppCacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppCacheEvent::Progress {
                url: Some(url),
                total,
                completed,
            } => write!(f, "progress {}/{} {}", completed, total, url),
            AppCacheEvent::Progress {
                url: None,
                total,
                completed,
            } => write!(f, "progress {}/{}", completed, total),
            AppCacheEvent::Error { message } => write!(f, "error: {}", message),
            other => f.write_str(other.name()),
        }
    }
}

/// Severity of a console message sent to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Diagnostic detail.
    Info,
    /// Something unexpected that did not stop the update.
    Warning,
    /// The update failed.
    Error,
}

/// Receiver of events for a set of hosts.
///
/// One frontend usually serves many hosts; events for hosts sharing a
/// frontend arrive in a single call.
pub trait AppCacheFrontend: Send + Sync {
    /// Delivers `event` to every host in `host_ids`.
    fn on_event(&self, host_ids: &[HostId], event: &AppCacheEvent);

    /// Delivers a console message.
    fn on_log_message(&self, host_ids: &[HostId], level: LogLevel, message: &str) {
        let _ = (host_ids, level, message);
    }
}

type EventCall = (Vec<HostId>, AppCacheEvent);
type LogCall = (Vec<HostId>, LogLevel, String);

/// Frontend that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingFrontend {
    events: Mutex<Vec<EventCall>>,
    logs: Mutex<Vec<LogCall>>,
}

impl RecordingFrontend {
    /// Creates a new recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `on_event` call in arrival order.
    pub fn calls(&self) -> Vec<EventCall> {
        self.events.lock().clone()
    }

    /// Events delivered to `host_id`, in order.
    pub fn events_for(&self, host_id: HostId) -> Vec<AppCacheEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(ids, _)| ids.contains(&host_id))
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Names of the events delivered to `host_id`.
    pub fn event_names_for(&self, host_id: HostId) -> Vec<&'static str> {
        self.events_for(host_id).iter().map(AppCacheEvent::name).collect()
    }

    /// Every `on_log_message` call in arrival order.
    pub fn logs(&self) -> Vec<LogCall> {
        self.logs.lock().clone()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
        self.logs.lock().clear();
    }
}

impl AppCacheFrontend for RecordingFrontend {
    fn on_event(&self, host_ids: &[HostId], event: &AppCacheEvent) {
        self.events.lock().push((host_ids.to_vec(), event.clone()));
    }

    fn on_log_message(&self, host_ids: &[HostId], level: LogLevel, message: &str) {
        self.logs
            .lock()
            .push((host_ids.to_vec(), level, message.to_string()));
    }
}

/// Collects hosts and delivers one call per distinct frontend.
///
/// A host added twice is notified once. Dispatch happens on the caller's
/// thread; callers must not hold group or job locks while sending.
#[derive(Default)]
pub(crate) struct HostNotifier {
    batches: Vec<(Arc<dyn AppCacheFrontend>, Vec<HostId>)>,
    seen: HashSet<HostId>,
}

impl HostNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_host(&mut self, host: &AppCacheHost) {
        let host_id = host.host_id();
        if !self.seen.insert(host_id) {
            return;
        }
        let frontend = host.frontend();
        match self
            .batches
            .iter_mut()
            .find(|(existing, _)| same_frontend(existing, frontend))
        {
            Some((_, ids)) => ids.push(host_id),
            None => self.batches.push((frontend.clone(), vec![host_id])),
        }
    }

    pub(crate) fn add_hosts<'a, I>(&mut self, hosts: I)
    where
        I: IntoIterator<Item = &'a Arc<AppCacheHost>>,
    {
        for host in hosts {
            self.add_host(host);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn send_event(&self, event: &AppCacheEvent) {
        for (frontend, ids) in &self.batches {
            frontend.on_event(ids, event);
        }
    }

    pub(crate) fn send_log(&self, level: LogLevel, message: &str) {
        for (frontend, ids) in &self.batches {
            frontend.on_log_message(ids, level, message);
        }
    }
}

fn same_frontend(a: &Arc<dyn AppCacheFrontend>, b: &Arc<dyn AppCacheFrontend>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

//! A cache group: one manifest URL, its cache versions and its update.
//!
//! The group owns its caches. At most one update job runs per group;
//! starting an update while one runs joins it, unless the job is already
//! finishing, in which case the request is queued and replayed after a
//! short delay once the job ends.

use async_runtime::Task;
use core_types::{GroupId, GroupRecord, HostId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use url::Url;

use crate::cache::AppCache;
use crate::error::{AppCacheError, AppCacheResult};
use crate::event::{AppCacheEvent, HostNotifier};
use crate::host::AppCacheHost;
use crate::service::ServiceContext;
use crate::update_job::{InternalState, JobShared, JoinOutcome, UpdateJob};

/// Externally visible update state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// No update running.
    Idle,
    /// Fetching the manifest, or fetching master entries after no change.
    Checking,
    /// Fetching resources.
    Downloading,
}

struct JobHandle {
    shared: Arc<JobShared>,
    abort: AbortHandle,
}

struct QueuedUpdate {
    host: Weak<AppCacheHost>,
    new_master_url: Option<Url>,
}

struct GroupState {
    record: GroupRecord,
    newest_complete_cache: Option<Arc<AppCache>>,
    old_caches: Vec<Arc<AppCache>>,
    is_obsolete: bool,
    update_status: UpdateStatus,
    update_job: Option<JobHandle>,
    queued_updates: BTreeMap<HostId, QueuedUpdate>,
    active_observers: BTreeMap<HostId, Weak<AppCacheHost>>,
    queued_observers: BTreeMap<HostId, Weak<AppCacheHost>>,
    restart_generation: u64,
    restart_pending: bool,
}

/// All versions of the cache for one manifest URL.
pub struct AppCacheGroup {
    manifest_url: Url,
    group_id: GroupId,
    context: Arc<ServiceContext>,
    state: Mutex<GroupState>,
    status: watch::Sender<UpdateStatus>,
    weak_self: Weak<AppCacheGroup>,
}

impl AppCacheGroup {
    /// Creates a group with no caches.
    pub fn new(context: Arc<ServiceContext>, record: GroupRecord) -> Arc<Self> {
        let (status, _) = watch::channel(UpdateStatus::Idle);
        Arc::new_cyclic(|weak_self| Self {
            manifest_url: record.manifest_url.clone(),
            group_id: record.group_id,
            context,
            state: Mutex::new(GroupState {
                record,
                newest_complete_cache: None,
                old_caches: Vec::new(),
                is_obsolete: false,
                update_status: UpdateStatus::Idle,
                update_job: None,
                queued_updates: BTreeMap::new(),
                active_observers: BTreeMap::new(),
                queued_observers: BTreeMap::new(),
                restart_generation: 0,
                restart_pending: false,
            }),
            status,
            weak_self: weak_self.clone(),
        })
    }

    /// Manifest URL the group is keyed on.
    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    /// Group identity.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Stored record of the group.
    pub fn record(&self) -> GroupRecord {
        self.state.lock().record.clone()
    }

    /// Current update state.
    pub fn update_status(&self) -> UpdateStatus {
        self.state.lock().update_status
    }

    /// True once the manifest was found gone.
    pub fn is_obsolete(&self) -> bool {
        self.state.lock().is_obsolete
    }

    /// Newest complete cache.
    pub fn newest_complete_cache(&self) -> Option<Arc<AppCache>> {
        self.state.lock().newest_complete_cache.clone()
    }

    /// Older caches still used by hosts.
    pub fn old_caches(&self) -> Vec<Arc<AppCache>> {
        self.state.lock().old_caches.clone()
    }

    /// True when an update job exists.
    pub fn has_update_job(&self) -> bool {
        self.state.lock().update_job.is_some()
    }

    /// Internal state of the running job.
    pub fn job_state(&self) -> Option<InternalState> {
        self.state
            .lock()
            .update_job
            .as_ref()
            .map(|job| job.shared.internal_state())
    }

    /// True when updates are queued behind a finishing job.
    pub fn has_queued_updates(&self) -> bool {
        !self.state.lock().queued_updates.is_empty()
    }

    /// Hosts associated with any cache of the group.
    pub fn associated_hosts(&self) -> Vec<Arc<AppCacheHost>> {
        let caches: Vec<Arc<AppCache>> = {
            let state = self.state.lock();
            state
                .newest_complete_cache
                .iter()
                .chain(state.old_caches.iter())
                .cloned()
                .collect()
        };
        let mut seen = std::collections::HashSet::new();
        caches
            .iter()
            .flat_map(|cache| cache.associated_hosts())
            .filter(|host| seen.insert(host.host_id()))
            .collect()
    }

    /// Waits until no update is running.
    pub async fn wait_for_idle(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| *s == UpdateStatus::Idle).await;
    }

    /// Adds a complete cache to the group.
    ///
    /// A cache newer than the current newest replaces it; the replaced
    /// cache is kept while hosts use it and those hosts become swappable.
    /// An older cache is kept as an old cache.
    pub fn add_cache(&self, cache: Arc<AppCache>) {
        if let Some(group) = self.weak_self.upgrade() {
            cache.set_owning_group(&group);
        }
        let demoted = {
            let mut state = self.state.lock();
            match state.newest_complete_cache.clone() {
                Some(newest) if Arc::ptr_eq(&newest, &cache) => None,
                Some(newest) if !cache.is_version_newer_than(&newest) => {
                    state.old_caches.push(cache);
                    None
                }
                previous => {
                    state.newest_complete_cache = Some(cache);
                    if let Some(previous) = &previous {
                        if previous.has_associated_hosts() {
                            state.old_caches.push(previous.clone());
                        }
                    }
                    previous
                }
            }
        };

        if let Some(demoted) = demoted {
            tracing::debug!(
                manifest_url = %self.manifest_url,
                cache = %demoted.cache_id(),
                "newest cache replaced"
            );
            for host in demoted.associated_hosts() {
                host.set_swappable(true);
            }
        }
    }

    /// Removes a cache from the group.
    ///
    /// The newest cache can only be removed once no host uses it.
    pub fn remove_cache(&self, cache: &Arc<AppCache>) -> AppCacheResult<()> {
        let mut state = self.state.lock();
        if let Some(newest) = &state.newest_complete_cache {
            if Arc::ptr_eq(newest, cache) {
                if cache.has_associated_hosts() {
                    return Err(AppCacheError::CacheInUse(cache.cache_id()));
                }
                state.newest_complete_cache = None;
                return Ok(());
            }
        }
        state.old_caches.retain(|old| !Arc::ptr_eq(old, cache));
        Ok(())
    }

    pub(crate) fn on_cache_unused(&self, cache: &Arc<AppCache>) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.old_caches.len();
            state.old_caches.retain(|old| !Arc::ptr_eq(old, cache));
            before != state.old_caches.len()
        };
        if removed {
            tracing::debug!(cache = %cache.cache_id(), "old cache released");
        }
    }

    /// Starts an update, or joins the one in flight.
    ///
    /// `host` is notified of the update's progress; `new_master_url` asks
    /// for a master entry to be added for it. Ignored on obsolete groups.
    pub fn start_update(
        self: &Arc<Self>,
        host: Option<&Arc<AppCacheHost>>,
        new_master_url: Option<Url>,
    ) {
        // A joiner registers and gets its catch-up under the running job's
        // delivery lock. The lock is taken before the group lock.
        let running = self.state.lock().update_job.as_ref().map(|job| job.shared.clone());
        let delivery = running.as_ref().map(|shared| shared.hold_delivery());

        let mut catch_up = Vec::new();
        let mut run_queued = false;
        {
            let mut state = self.state.lock();
            let current = state.update_job.as_ref().map(|job| &job.shared);
            let unchanged = match (&running, current) {
                (Some(running), Some(current)) => Arc::ptr_eq(running, current),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                drop(state);
                drop(delivery);
                return self.start_update(host, new_master_url);
            }
            if state.is_obsolete {
                tracing::debug!(manifest_url = %self.manifest_url, "update ignored on obsolete group");
                return;
            }
            if let Some(host) = host {
                host.begin_update(self.clone(), new_master_url.clone());
            }

            let joined = state
                .update_job
                .as_ref()
                .map(|job| job.shared.try_join(host, new_master_url.clone()));
            match joined {
                Some(JoinOutcome::Joined { catch_up: events }) => {
                    catch_up = events;
                    if let Some(host) = host {
                        Self::observe(&mut state, host);
                    }
                }
                Some(JoinOutcome::Terminating) => {
                    if let Some(host) = host {
                        tracing::debug!(
                            manifest_url = %self.manifest_url,
                            host = %host.host_id(),
                            "update is finishing, queueing"
                        );
                        state.queued_updates.insert(
                            host.host_id(),
                            QueuedUpdate {
                                host: Arc::downgrade(host),
                                new_master_url,
                            },
                        );
                        Self::observe(&mut state, host);
                    }
                }
                None => {
                    let shared = JobShared::new(host, new_master_url);
                    let job = UpdateJob::new(
                        self,
                        self.context.clone(),
                        shared.clone(),
                        state.newest_complete_cache.clone(),
                    );
                    tracing::info!(
                        manifest_url = %self.manifest_url,
                        update_type = ?job.update_type(),
                        "starting update"
                    );
                    let handle = self.context.runtime.spawn(job.run());
                    state.update_job = Some(JobHandle {
                        shared,
                        abort: handle.abort_handle(),
                    });
                    state.update_status = UpdateStatus::Checking;
                    self.status.send_replace(UpdateStatus::Checking);
                    if let Some(host) = host {
                        Self::observe(&mut state, host);
                    }
                    if state.restart_pending {
                        state.restart_pending = false;
                        run_queued = true;
                    }
                }
            }
        }

        if let (Some(host), false) = (host, catch_up.is_empty()) {
            let mut notifier = HostNotifier::new();
            notifier.add_host(host);
            for event in &catch_up {
                notifier.send_event(event);
            }
        }
        drop(delivery);
        if run_queued {
            self.run_queued_updates();
        }
    }

    /// Registers `host` to be told when the update it waits on completes.
    ///
    /// Hosts queued behind a finishing job are kept apart so they are only
    /// told about the restarted job.
    pub fn add_update_observer(&self, host: &Arc<AppCacheHost>) {
        Self::observe(&mut self.state.lock(), host);
    }

    /// Forgets `host` as an observer of any update.
    pub fn remove_update_observer(&self, host_id: HostId) {
        let mut state = self.state.lock();
        state.active_observers.remove(&host_id);
        state.queued_observers.remove(&host_id);
        state.queued_updates.remove(&host_id);
    }

    fn observe(state: &mut GroupState, host: &Arc<AppCacheHost>) {
        let observers = if state.queued_updates.contains_key(&host.host_id()) {
            &mut state.queued_observers
        } else {
            &mut state.active_observers
        };
        observers.insert(host.host_id(), Arc::downgrade(host));
    }

    /// Stops any running update and forgets queued ones.
    ///
    /// No further events are delivered for the stopped job.
    pub fn detach(&self) {
        let job = {
            let mut state = self.state.lock();
            state.restart_pending = false;
            state.restart_generation += 1;
            state.queued_updates.clear();
            state.queued_observers.clear();
            state.active_observers.clear();
            state.update_status = UpdateStatus::Idle;
            state.update_job.take()
        };
        self.status.send_replace(UpdateStatus::Idle);
        if let Some(job) = job {
            tracing::debug!(manifest_url = %self.manifest_url, "cancelling update");
            self.cancel_job(job);
        }
    }

    /// Aborts `job` and dooms the responses it wrote for a cache that will
    /// never be stored.
    fn cancel_job(&self, job: JobHandle) {
        job.shared.set_detached();
        job.abort.abort();
        let abandoned = job.shared.take_abandoned_responses();
        if abandoned.is_empty() {
            return;
        }
        let storage = self.context.storage.clone();
        let manifest_url = self.manifest_url.clone();
        self.context.runtime.spawn(async move {
            if let Err(e) = storage.doom_responses(&manifest_url, &abandoned).await {
                tracing::warn!(manifest_url = %manifest_url, error = %e, "dooming responses of cancelled update failed");
            }
        });
    }

    pub(crate) fn set_update_status(&self, status: UpdateStatus) {
        self.state.lock().update_status = status;
        self.status.send_replace(status);
    }

    pub(crate) fn mark_obsolete(&self) {
        let mut state = self.state.lock();
        state.is_obsolete = true;
        if let Some(newest) = state.newest_complete_cache.take() {
            if newest.has_associated_hosts() {
                state.old_caches.push(newest);
            }
        }
    }

    pub(crate) fn update_job_finished(self: &Arc<Self>, shared: &Arc<JobShared>) {
        let (observers, restart) = {
            let mut state = self.state.lock();
            match &state.update_job {
                Some(job) if Arc::ptr_eq(&job.shared, shared) => {}
                _ => return,
            }
            state.update_job = None;
            state.update_status = UpdateStatus::Idle;

            let observers: Vec<Weak<AppCacheHost>> =
                std::mem::take(&mut state.active_observers).into_values().collect();
            let restart = if state.queued_updates.is_empty() {
                None
            } else {
                let queued = std::mem::take(&mut state.queued_observers);
                state.active_observers.extend(queued);
                state.restart_pending = true;
                state.restart_generation += 1;
                Some(state.restart_generation)
            };
            (observers, restart)
        };

        for host in observers.iter().filter_map(Weak::upgrade) {
            host.on_update_complete(self);
        }

        if let Some(generation) = restart {
            let group = Arc::downgrade(self);
            tracing::debug!(
                manifest_url = %self.manifest_url,
                delay_ms = self.context.config.restart_delay.as_millis() as u64,
                "scheduling queued updates"
            );
            self.context.scheduler.schedule_after(
                self.context.config.restart_delay,
                Task::new(move || {
                    if let Some(group) = group.upgrade() {
                        group.run_restart(generation);
                    }
                }),
            );
        }
        self.status.send_replace(self.update_status());
    }

    fn run_restart(self: &Arc<Self>, generation: u64) {
        {
            let state = self.state.lock();
            if !state.restart_pending
                || state.restart_generation != generation
                || state.update_job.is_some()
            {
                return;
            }
        }
        self.run_queued_updates();
    }

    fn run_queued_updates(self: &Arc<Self>) {
        let queued = {
            let mut state = self.state.lock();
            state.restart_pending = false;
            std::mem::take(&mut state.queued_updates)
        };
        for update in queued.into_values() {
            if let Some(host) = update.host.upgrade() {
                self.start_update(Some(&host), update.new_master_url);
            }
        }
    }
}

impl fmt::Debug for AppCacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AppCacheGroup")
            .field("manifest_url", &self.manifest_url.as_str())
            .field("group_id", &self.group_id)
            .field("status", &state.update_status)
            .field("obsolete", &state.is_obsolete)
            .field(
                "newest",
                &state.newest_complete_cache.as_ref().map(|c| c.cache_id()),
            )
            .finish()
    }
}

impl Drop for AppCacheGroup {
    fn drop(&mut self) {
        if let Some(job) = self.state.get_mut().update_job.take() {
            self.cancel_job(job);
        }
    }
}

/// Catch-up events a host joining mid-update receives.
pub(crate) fn catch_up_events(downloading: bool) -> Vec<AppCacheEvent> {
    let mut events = vec![AppCacheEvent::Checking];
    if downloading {
        events.push(AppCacheEvent::Downloading);
    }
    events
}

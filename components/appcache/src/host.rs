//! Consumers of a cache.

use core_types::HostId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::cache::AppCache;
use crate::event::AppCacheFrontend;
use crate::group::AppCacheGroup;

#[derive(Default)]
struct HostState {
    associated_cache: Option<Arc<AppCache>>,
    associated_group: Option<Arc<AppCacheGroup>>,
    group_being_updated: Option<Arc<AppCacheGroup>>,
    pending_master_url: Option<Url>,
    swappable: bool,
}

/// A document (or worker) using a cache, identified by [`HostId`].
///
/// A host is associated with at most one cache at a time. While associated
/// it keeps the owning group alive; while it waits on an update it keeps
/// that group alive too.
pub struct AppCacheHost {
    host_id: HostId,
    frontend: Arc<dyn AppCacheFrontend>,
    state: Mutex<HostState>,
}

impl AppCacheHost {
    /// Creates a host that receives events through `frontend`.
    pub fn new(host_id: HostId, frontend: Arc<dyn AppCacheFrontend>) -> Arc<Self> {
        Arc::new(Self {
            host_id,
            frontend,
            state: Mutex::new(HostState::default()),
        })
    }

    /// Host identity.
    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Event sink of this host.
    pub fn frontend(&self) -> &Arc<dyn AppCacheFrontend> {
        &self.frontend
    }

    /// Cache currently associated with the host.
    pub fn associated_cache(&self) -> Option<Arc<AppCache>> {
        self.state.lock().associated_cache.clone()
    }

    /// True when a newer complete cache than the associated one exists.
    pub fn is_swappable(&self) -> bool {
        self.state.lock().swappable
    }

    /// Master entry the host asked to be added by an update in flight.
    pub fn pending_master_url(&self) -> Option<Url> {
        self.state.lock().pending_master_url.clone()
    }

    /// Associates the host with `cache`, releasing any previous association.
    pub fn associate_cache(self: &Arc<Self>, cache: Option<Arc<AppCache>>) {
        let (previous, previous_group) = {
            let mut state = self.state.lock();
            let unchanged = match (&state.associated_cache, &cache) {
                (Some(current), Some(next)) => Arc::ptr_eq(current, next),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return;
            }
            state.swappable = false;
            let previous_group = std::mem::replace(
                &mut state.associated_group,
                cache.as_ref().and_then(|c| c.owning_group()),
            );
            (
                std::mem::replace(&mut state.associated_cache, cache.clone()),
                previous_group,
            )
        };

        if let Some(cache) = &cache {
            cache.associate_host(self);
        }
        if let Some(previous) = previous {
            previous.dissociate_host(self.host_id);
        }
        drop(previous_group);
    }

    /// Moves the host to the group's newest cache.
    ///
    /// On an obsolete group the association is dropped instead. Returns
    /// `false` when there was nothing to swap.
    pub fn swap_cache(self: &Arc<Self>) -> bool {
        let Some(cache) = self.associated_cache() else {
            return false;
        };
        let Some(group) = cache.owning_group() else {
            return false;
        };
        if group.is_obsolete() {
            self.associate_cache(None);
            return true;
        }
        match group.newest_complete_cache() {
            Some(newest) if !Arc::ptr_eq(&newest, &cache) => {
                self.associate_cache(Some(newest));
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_swappable(&self, swappable: bool) {
        self.state.lock().swappable = swappable;
    }

    pub(crate) fn begin_update(&self, group: Arc<AppCacheGroup>, master_url: Option<Url>) {
        let previous = {
            let mut state = self.state.lock();
            if master_url.is_some() {
                state.pending_master_url = master_url;
            }
            state.group_being_updated.replace(group)
        };
        drop(previous);
    }

    pub(crate) fn clear_pending_master(&self) {
        self.state.lock().pending_master_url = None;
    }

    /// Called by the group when the update this host waited on finished.
    pub(crate) fn on_update_complete(self: &Arc<Self>, group: &Arc<AppCacheGroup>) {
        let (master_url, updating) = {
            let mut state = self.state.lock();
            (
                state.pending_master_url.take(),
                state.group_being_updated.take(),
            )
        };

        if let Some(master_url) = master_url {
            if self.associated_cache().is_none() {
                if let Some(newest) = group.newest_complete_cache() {
                    if newest.entry(&master_url).is_some_and(|e| e.is_master()) {
                        tracing::debug!(
                            host = %self.host_id,
                            cache = %newest.cache_id(),
                            "associating host with its new master entry"
                        );
                        self.associate_cache(Some(newest));
                    }
                }
            }
        }
        drop(updating);
    }
}

impl fmt::Debug for AppCacheHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AppCacheHost")
            .field("host_id", &self.host_id)
            .field(
                "associated_cache",
                &state.associated_cache.as_ref().map(|c| c.cache_id()),
            )
            .field("swappable", &state.swappable)
            .finish()
    }
}

impl Drop for AppCacheHost {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(cache) = state.associated_cache.take() {
            cache.dissociate_host(self.host_id);
        }
        if let Some(group) = state.group_being_updated.take() {
            group.remove_update_observer(self.host_id);
        }
    }
}

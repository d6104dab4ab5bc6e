//! A complete cache snapshot and its host associations.

use core_types::{AppCacheEntry, CacheId, CacheRecord, EntryKind, HostId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use url::Url;

use crate::group::AppCacheGroup;
use crate::host::AppCacheHost;

/// One version of a group's cached resources.
///
/// Entries are fixed once the cache is complete; only the foreign flag of
/// an entry may still change.
pub struct AppCache {
    cache_id: CacheId,
    record: RwLock<CacheRecord>,
    complete: AtomicBool,
    owning_group: Mutex<Weak<AppCacheGroup>>,
    hosts: Mutex<BTreeMap<HostId, Weak<AppCacheHost>>>,
}

impl AppCache {
    /// Wraps a record as a not yet complete cache.
    pub fn new(record: CacheRecord) -> Arc<Self> {
        Arc::new(Self {
            cache_id: record.cache_id,
            record: RwLock::new(record),
            complete: AtomicBool::new(false),
            owning_group: Mutex::new(Weak::new()),
            hosts: Mutex::new(BTreeMap::new()),
        })
    }

    /// Wraps a record loaded from storage; stored caches are complete.
    pub fn from_stored(record: CacheRecord) -> Arc<Self> {
        let cache = Self::new(record);
        cache.mark_complete();
        cache
    }

    /// Cache identity.
    pub fn cache_id(&self) -> CacheId {
        self.cache_id
    }

    /// True once every entry has been fetched and stored.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Marks the cache complete. Returns `false` if it already was.
    pub fn mark_complete(&self) -> bool {
        !self.complete.swap(true, Ordering::AcqRel)
    }

    /// Snapshot of the underlying record.
    pub fn record(&self) -> CacheRecord {
        self.record.read().clone()
    }

    /// Entry for `url`.
    pub fn entry(&self, url: &Url) -> Option<AppCacheEntry> {
        self.record.read().entry(url).cloned()
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        self.record.read().entries.len()
    }

    /// Total stored body size.
    pub fn cache_size(&self) -> u64 {
        self.record.read().cache_size()
    }

    /// Flags the entry for `url` as foreign. Returns `false` when absent.
    pub fn mark_entry_as_foreign(&self, url: &Url) -> bool {
        let mut record = self.record.write();
        match record.entries.get_mut(url) {
            Some(entry) => {
                entry.add_kind(EntryKind::FOREIGN);
                true
            }
            None => false,
        }
    }

    /// True when this cache was produced after `other`.
    ///
    /// Update times decide; equal times fall back to the cache id.
    pub fn is_version_newer_than(&self, other: &AppCache) -> bool {
        let mine = self.record.read().update_time;
        let theirs = other.record.read().update_time;
        if mine == theirs {
            self.cache_id > other.cache_id
        } else {
            mine > theirs
        }
    }

    /// Group this cache belongs to.
    pub fn owning_group(&self) -> Option<Arc<AppCacheGroup>> {
        self.owning_group.lock().upgrade()
    }

    pub(crate) fn set_owning_group(&self, group: &Arc<AppCacheGroup>) {
        *self.owning_group.lock() = Arc::downgrade(group);
    }

    /// Hosts currently associated with this cache.
    pub fn associated_hosts(&self) -> Vec<Arc<AppCacheHost>> {
        let live: Vec<Weak<AppCacheHost>> = self.hosts.lock().values().cloned().collect();
        live.iter().filter_map(Weak::upgrade).collect()
    }

    /// True while at least one host is associated.
    pub fn has_associated_hosts(&self) -> bool {
        !self.hosts.lock().is_empty()
    }

    pub(crate) fn associate_host(&self, host: &Arc<AppCacheHost>) {
        self.hosts
            .lock()
            .insert(host.host_id(), Arc::downgrade(host));
    }

    pub(crate) fn dissociate_host(self: &Arc<Self>, host_id: HostId) {
        let now_unused = {
            let mut hosts = self.hosts.lock();
            hosts.remove(&host_id).is_some() && hosts.is_empty()
        };
        if now_unused {
            if let Some(group) = self.owning_group() {
                group.on_cache_unused(self);
            }
        }
    }
}

impl fmt::Debug for AppCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCache")
            .field("cache_id", &self.cache_id)
            .field("complete", &self.is_complete())
            .field("entries", &self.entry_count())
            .finish()
    }
}

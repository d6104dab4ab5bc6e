//! In-process storage.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use core_types::{
    AppCacheInfo, AppCacheInfoCollection, CacheId, CacheRecord, EntryKind, GroupId, GroupRecord,
    ResponseId, ResponseInfo,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::lookup::find_main_response;
use crate::traits::{LoadedGroup, MainResponse, ResponseReader, ResponseStorage, ResponseWriter};

#[derive(Debug, Clone)]
struct StoredResponse {
    info: ResponseInfo,
    body: Bytes,
}

#[derive(Debug, Default)]
struct MemoryState {
    groups: HashMap<GroupId, GroupRecord>,
    newest: HashMap<GroupId, CacheId>,
    caches: HashMap<CacheId, CacheRecord>,
    responses: HashMap<ResponseId, StoredResponse>,
    doomed: BTreeSet<ResponseId>,
    last_group_id: u64,
    last_cache_id: u64,
    last_response_id: u64,
    fail_store: bool,
    fail_make_obsolete: bool,
    yield_before_complete: bool,
}

impl MemoryState {
    fn group_by_url(&self, manifest_url: &Url) -> Option<&GroupRecord> {
        self.groups.values().find(|g| &g.manifest_url == manifest_url)
    }

    fn newest_cache(&self, group_id: GroupId) -> Option<&CacheRecord> {
        self.newest.get(&group_id).and_then(|id| self.caches.get(id))
    }
}

/// Storage kept entirely in memory.
///
/// Clones share one working set. Failure injection switches make the next
/// store or make-obsolete calls fail so error paths can be exercised.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `store_group_and_newest_cache` fail while set.
    pub fn set_fail_store(&self, fail: bool) {
        self.state.lock().fail_store = fail;
    }

    /// Makes `make_group_obsolete` fail while set.
    pub fn set_fail_make_obsolete(&self, fail: bool) {
        self.state.lock().fail_make_obsolete = fail;
    }

    /// Yields to the runtime before completing each operation.
    pub fn set_yield_before_complete(&self, enabled: bool) {
        self.state.lock().yield_before_complete = enabled;
    }

    /// Stores a response directly, returning its id.
    pub fn insert_response(&self, info: ResponseInfo, body: impl Into<Bytes>) -> ResponseId {
        let mut state = self.state.lock();
        state.last_response_id += 1;
        let id = ResponseId(state.last_response_id);
        let mut info = info;
        let body = body.into();
        info.body_size = body.len() as u64;
        state.responses.insert(id, StoredResponse { info, body });
        id
    }

    /// Stored group for `manifest_url`.
    pub fn stored_group(&self, manifest_url: &Url) -> Option<GroupRecord> {
        self.state.lock().group_by_url(manifest_url).cloned()
    }

    /// Newest stored cache of the group for `manifest_url`.
    pub fn stored_newest_cache(&self, manifest_url: &Url) -> Option<CacheRecord> {
        let state = self.state.lock();
        let group = state.group_by_url(manifest_url)?;
        state.newest_cache(group.group_id).cloned()
    }

    /// True when a response body is stored under `id`.
    pub fn has_response(&self, id: ResponseId) -> bool {
        self.state.lock().responses.contains_key(&id)
    }

    /// Responses scheduled for deletion.
    pub fn doomed_responses(&self) -> BTreeSet<ResponseId> {
        self.state.lock().doomed.clone()
    }

    /// Number of stored responses.
    pub fn response_count(&self) -> usize {
        self.state.lock().responses.len()
    }

    /// Deletes every doomed response. Returns how many were deleted.
    pub fn purge_doomed_responses(&self) -> usize {
        let mut state = self.state.lock();
        let doomed = std::mem::take(&mut state.doomed);
        doomed
            .iter()
            .filter(|id| state.responses.remove(id).is_some())
            .count()
    }

    async fn maybe_yield(&self) {
        let yield_now = self.state.lock().yield_before_complete;
        if yield_now {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ResponseStorage for MemoryStorage {
    async fn load_or_create_group(&self, manifest_url: &Url) -> StorageResult<LoadedGroup> {
        self.maybe_yield().await;
        let mut state = self.state.lock();
        if let Some(group_id) = state.group_by_url(manifest_url).map(|g| g.group_id) {
            let newest_cache = state.newest_cache(group_id).cloned();
            let group = state
                .groups
                .get_mut(&group_id)
                .ok_or_else(|| StorageError::not_found(group_id.to_string()))?;
            group.last_access_time = Utc::now();
            return Ok(LoadedGroup {
                group: group.clone(),
                newest_cache,
            });
        }

        state.last_group_id += 1;
        let group = GroupRecord::new(GroupId(state.last_group_id), manifest_url.clone());
        Ok(LoadedGroup {
            group,
            newest_cache: None,
        })
    }

    async fn load_cache(&self, cache_id: CacheId) -> StorageResult<Option<(GroupRecord, CacheRecord)>> {
        self.maybe_yield().await;
        let state = self.state.lock();
        let Some(cache) = state.caches.get(&cache_id) else {
            return Ok(None);
        };
        Ok(state
            .groups
            .get(&cache.group_id)
            .map(|group| (group.clone(), cache.clone())))
    }

    async fn store_group_and_newest_cache(
        &self,
        group: &GroupRecord,
        cache: &CacheRecord,
    ) -> StorageResult<()> {
        self.maybe_yield().await;
        let mut state = self.state.lock();
        if state.fail_store {
            return Err(StorageError::failed("store rejected"));
        }

        state.groups.insert(group.group_id, group.clone());
        let previous = state.newest.insert(group.group_id, cache.cache_id);
        state.caches.insert(cache.cache_id, cache.clone());

        if let Some(previous) = previous.filter(|id| *id != cache.cache_id) {
            if let Some(old) = state.caches.remove(&previous) {
                let keep: BTreeSet<ResponseId> = cache.response_ids().into_iter().collect();
                let doomed: Vec<ResponseId> = old
                    .response_ids()
                    .into_iter()
                    .filter(|id| !keep.contains(id))
                    .collect();
                state.doomed.extend(doomed);
            }
        }
        tracing::debug!(group = %group.group_id, cache = %cache.cache_id, "stored newest cache");
        Ok(())
    }

    async fn make_group_obsolete(&self, group_id: GroupId) -> StorageResult<()> {
        self.maybe_yield().await;
        let mut state = self.state.lock();
        if state.fail_make_obsolete {
            return Err(StorageError::failed("make obsolete rejected"));
        }
        state.groups.remove(&group_id);
        if let Some(cache_id) = state.newest.remove(&group_id) {
            if let Some(cache) = state.caches.remove(&cache_id) {
                let ids = cache.response_ids();
                state.doomed.extend(ids);
            }
        }
        Ok(())
    }

    async fn new_cache_id(&self) -> StorageResult<CacheId> {
        let mut state = self.state.lock();
        state.last_cache_id += 1;
        Ok(CacheId(state.last_cache_id))
    }

    async fn create_response_writer(&self, _manifest_url: &Url) -> StorageResult<Box<dyn ResponseWriter>> {
        let mut state = self.state.lock();
        state.last_response_id += 1;
        Ok(Box::new(MemoryResponseWriter {
            state: self.state.clone(),
            response_id: ResponseId(state.last_response_id),
            info: None,
            body: Vec::new(),
            finished: false,
        }))
    }

    async fn create_response_reader(
        &self,
        _manifest_url: &Url,
        response_id: ResponseId,
    ) -> StorageResult<Box<dyn ResponseReader>> {
        self.maybe_yield().await;
        let stored = self
            .state
            .lock()
            .responses
            .get(&response_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(response_id.to_string()))?;
        Ok(Box::new(MemoryResponseReader {
            response_id,
            stored,
            offset: 0,
        }))
    }

    async fn doom_responses(&self, _manifest_url: &Url, response_ids: &[ResponseId]) -> StorageResult<()> {
        self.state.lock().doomed.extend(response_ids.iter().copied());
        Ok(())
    }

    async fn find_response_for_main_request(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> StorageResult<Option<MainResponse>> {
        self.maybe_yield().await;
        let state = self.state.lock();
        let candidates = state.newest.iter().filter_map(|(group_id, cache_id)| {
            Some((state.groups.get(group_id)?, state.caches.get(cache_id)?))
        });
        Ok(find_main_response(url, preferred_manifest_url, candidates))
    }

    async fn mark_entry_as_foreign(&self, url: &Url, cache_id: CacheId) -> StorageResult<()> {
        let mut state = self.state.lock();
        let cache = state
            .caches
            .get_mut(&cache_id)
            .ok_or_else(|| StorageError::not_found(cache_id.to_string()))?;
        if let Some(entry) = cache.entries.get_mut(url) {
            entry.add_kind(EntryKind::FOREIGN);
        }
        Ok(())
    }

    async fn get_all_info(&self) -> StorageResult<AppCacheInfoCollection> {
        let state = self.state.lock();
        let mut collection = AppCacheInfoCollection::default();
        for group in state.groups.values() {
            let Some(cache) = state.newest_cache(group.group_id) else {
                continue;
            };
            collection.push(AppCacheInfo {
                manifest_url: group.manifest_url.clone(),
                group_id: group.group_id,
                cache_id: cache.cache_id,
                creation_time: group.creation_time,
                last_access_time: group.last_access_time,
                last_update_time: cache.update_time,
                size: cache.cache_size(),
            });
        }
        Ok(collection)
    }
}

struct MemoryResponseWriter {
    state: Arc<Mutex<MemoryState>>,
    response_id: ResponseId,
    info: Option<ResponseInfo>,
    body: Vec<u8>,
    finished: bool,
}

#[async_trait]
impl ResponseWriter for MemoryResponseWriter {
    fn response_id(&self) -> ResponseId {
        self.response_id
    }

    async fn write_info(&mut self, info: ResponseInfo) -> StorageResult<()> {
        self.info = Some(info);
        Ok(())
    }

    async fn write_data(&mut self, data: &[u8]) -> StorageResult<()> {
        if self.info.is_none() {
            return Err(StorageError::invalid_operation("data written before info"));
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> StorageResult<u64> {
        if self.finished {
            return Err(StorageError::invalid_operation("writer already finished"));
        }
        let mut info = self
            .info
            .take()
            .ok_or_else(|| StorageError::invalid_operation("finish before info"))?;
        let body = Bytes::from(std::mem::take(&mut self.body));
        let size = body.len() as u64;
        info.body_size = size;
        self.state
            .lock()
            .responses
            .insert(self.response_id, StoredResponse { info, body });
        self.finished = true;
        Ok(size)
    }
}

struct MemoryResponseReader {
    response_id: ResponseId,
    stored: StoredResponse,
    offset: usize,
}

#[async_trait]
impl ResponseReader for MemoryResponseReader {
    fn response_id(&self) -> ResponseId {
        self.response_id
    }

    async fn read_info(&mut self) -> StorageResult<ResponseInfo> {
        Ok(self.stored.info.clone())
    }

    async fn read_data(&mut self, max: usize) -> StorageResult<Bytes> {
        let end = (self.offset + max).min(self.stored.body.len());
        let chunk = self.stored.body.slice(self.offset..end);
        self.offset = end;
        Ok(chunk)
    }
}

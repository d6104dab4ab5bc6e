//! Directory-backed storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! index.json            groups, newest caches, id counters, doomed ids
//! responses/<id>.json   status line and headers of one response
//! responses/<id>.body   body of one response
//! ```
//!
//! Every file is replaced atomically (write to a temp file, then rename), so
//! a crash leaves either the old or the new version of each file.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use core_types::{
    AppCacheInfo, AppCacheInfoCollection, CacheId, CacheRecord, EntryKind, GroupId, GroupRecord,
    ResponseId, ResponseInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{StorageError, StorageResult};
use crate::lookup::find_main_response;
use crate::traits::{LoadedGroup, MainResponse, ResponseReader, ResponseStorage, ResponseWriter};

const INDEX_FILE: &str = "index.json";
const RESPONSES_DIR: &str = "responses";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct DiskIndex {
    last_group_id: u64,
    last_cache_id: u64,
    last_response_id: u64,
    groups: BTreeMap<GroupId, GroupRecord>,
    newest: BTreeMap<GroupId, CacheRecord>,
    doomed: BTreeSet<ResponseId>,
}

impl DiskIndex {
    fn group_id_for(&self, manifest_url: &Url) -> Option<GroupId> {
        self.groups
            .values()
            .find(|g| &g.manifest_url == manifest_url)
            .map(|g| g.group_id)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_extension("tmp");
    tokio::fs::write(&temp_path, bytes).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn info_path(responses_dir: &Path, id: ResponseId) -> PathBuf {
    responses_dir.join(format!("{}.json", id.get()))
}

fn body_path(responses_dir: &Path, id: ResponseId) -> PathBuf {
    responses_dir.join(format!("{}.body", id.get()))
}

/// Storage persisted in a directory.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
    index: Arc<Mutex<DiskIndex>>,
}

impl DiskStorage {
    /// Opens (or initialises) storage rooted at `root` and purges responses
    /// doomed before the last shutdown.
    pub async fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(RESPONSES_DIR)).await?;

        let index = match tokio::fs::read(root.join(INDEX_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DiskIndex::default(),
            Err(e) => return Err(e.into()),
        };

        let storage = Self {
            root,
            index: Arc::new(Mutex::new(index)),
        };
        let purged = storage.purge_doomed_responses().await?;
        tracing::debug!(root = %storage.root.display(), purged, "opened disk storage");
        Ok(storage)
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deletes the files of every doomed response. Returns how many were
    /// scheduled.
    pub async fn purge_doomed_responses(&self) -> StorageResult<usize> {
        let mut index = self.index.lock().await;
        let dir = self.responses_dir();
        for id in &index.doomed {
            remove_if_exists(&info_path(&dir, *id)).await?;
            remove_if_exists(&body_path(&dir, *id)).await?;
        }
        let mut next = index.clone();
        let purged = std::mem::take(&mut next.doomed).len();
        self.save(&next).await?;
        *index = next;
        Ok(purged)
    }

    /// Responses scheduled for deletion.
    pub async fn doomed_responses(&self) -> BTreeSet<ResponseId> {
        self.index.lock().await.doomed.clone()
    }

    fn responses_dir(&self) -> PathBuf {
        self.root.join(RESPONSES_DIR)
    }

    async fn save(&self, index: &DiskIndex) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.root.join(INDEX_FILE), &bytes).await
    }

    /// Applies `change` to a copy of the index and adopts the copy only once
    /// it is on disk. A failed change or save leaves the index untouched.
    async fn update<T>(&self, change: impl FnOnce(&mut DiskIndex) -> StorageResult<T>) -> StorageResult<T> {
        let mut index = self.index.lock().await;
        let mut next = index.clone();
        let out = change(&mut next)?;
        self.save(&next).await?;
        *index = next;
        Ok(out)
    }
}

#[async_trait]
impl ResponseStorage for DiskStorage {
    async fn load_or_create_group(&self, manifest_url: &Url) -> StorageResult<LoadedGroup> {
        self.update(|index| {
            if let Some(group_id) = index.group_id_for(manifest_url) {
                let newest_cache = index.newest.get(&group_id).cloned();
                let group = index
                    .groups
                    .get_mut(&group_id)
                    .ok_or_else(|| StorageError::not_found(group_id.to_string()))?;
                group.last_access_time = Utc::now();
                return Ok(LoadedGroup {
                    group: group.clone(),
                    newest_cache,
                });
            }

            index.last_group_id += 1;
            Ok(LoadedGroup {
                group: GroupRecord::new(GroupId(index.last_group_id), manifest_url.clone()),
                newest_cache: None,
            })
        })
        .await
    }

    async fn load_cache(&self, cache_id: CacheId) -> StorageResult<Option<(GroupRecord, CacheRecord)>> {
        let index = self.index.lock().await;
        Ok(index
            .newest
            .values()
            .find(|cache| cache.cache_id == cache_id)
            .and_then(|cache| {
                index
                    .groups
                    .get(&cache.group_id)
                    .map(|group| (group.clone(), cache.clone()))
            }))
    }

    async fn store_group_and_newest_cache(
        &self,
        group: &GroupRecord,
        cache: &CacheRecord,
    ) -> StorageResult<()> {
        self.update(|index| {
            index.groups.insert(group.group_id, group.clone());
            if let Some(previous) = index.newest.insert(group.group_id, cache.clone()) {
                let keep: BTreeSet<ResponseId> = cache.response_ids().into_iter().collect();
                let doomed: Vec<ResponseId> = previous
                    .response_ids()
                    .into_iter()
                    .filter(|id| !keep.contains(id))
                    .collect();
                index.doomed.extend(doomed);
            }
            Ok(())
        })
        .await?;
        tracing::debug!(group = %group.group_id, cache = %cache.cache_id, "stored newest cache on disk");
        Ok(())
    }

    async fn make_group_obsolete(&self, group_id: GroupId) -> StorageResult<()> {
        self.update(|index| {
            index.groups.remove(&group_id);
            if let Some(cache) = index.newest.remove(&group_id) {
                index.doomed.extend(cache.response_ids());
            }
            Ok(())
        })
        .await
    }

    async fn new_cache_id(&self) -> StorageResult<CacheId> {
        self.update(|index| {
            index.last_cache_id += 1;
            Ok(CacheId(index.last_cache_id))
        })
        .await
    }

    async fn create_response_writer(&self, _manifest_url: &Url) -> StorageResult<Box<dyn ResponseWriter>> {
        let response_id = self
            .update(|index| {
                index.last_response_id += 1;
                Ok(ResponseId(index.last_response_id))
            })
            .await?;
        Ok(Box::new(DiskResponseWriter {
            dir: self.responses_dir(),
            response_id,
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
        let dir = self.responses_dir();
        let info: ResponseInfo =
            serde_json::from_slice(&tokio::fs::read(info_path(&dir, response_id)).await?)?;
        let body = Bytes::from(tokio::fs::read(body_path(&dir, response_id)).await?);
        Ok(Box::new(DiskResponseReader {
            response_id,
            info,
            body,
            offset: 0,
        }))
    }

    async fn doom_responses(&self, _manifest_url: &Url, response_ids: &[ResponseId]) -> StorageResult<()> {
        self.update(|index| {
            index.doomed.extend(response_ids.iter().copied());
            Ok(())
        })
        .await
    }

    async fn find_response_for_main_request(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> StorageResult<Option<MainResponse>> {
        let index = self.index.lock().await;
        let candidates = index
            .newest
            .iter()
            .filter_map(|(group_id, cache)| Some((index.groups.get(group_id)?, cache)));
        Ok(find_main_response(url, preferred_manifest_url, candidates))
    }

    async fn mark_entry_as_foreign(&self, url: &Url, cache_id: CacheId) -> StorageResult<()> {
        self.update(|index| {
            let cache = index
                .newest
                .values_mut()
                .find(|cache| cache.cache_id == cache_id)
                .ok_or_else(|| StorageError::not_found(cache_id.to_string()))?;
            if let Some(entry) = cache.entries.get_mut(url) {
                entry.add_kind(EntryKind::FOREIGN);
            }
            Ok(())
        })
        .await
    }

    async fn get_all_info(&self) -> StorageResult<AppCacheInfoCollection> {
        let index = self.index.lock().await;
        let mut collection = AppCacheInfoCollection::default();
        for (group_id, cache) in &index.newest {
            let Some(group) = index.groups.get(group_id) else {
                continue;
            };
            collection.push(AppCacheInfo {
                manifest_url: group.manifest_url.clone(),
                group_id: *group_id,
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

struct DiskResponseWriter {
    dir: PathBuf,
    response_id: ResponseId,
    info: Option<ResponseInfo>,
    body: Vec<u8>,
    finished: bool,
}

#[async_trait]
impl ResponseWriter for DiskResponseWriter {
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
        let size = self.body.len() as u64;
        info.body_size = size;

        // Body first: an info file is only ever visible next to its body.
        write_atomic(&body_path(&self.dir, self.response_id), &self.body).await?;
        write_atomic(
            &info_path(&self.dir, self.response_id),
            &serde_json::to_vec(&info)?,
        )
        .await?;
        self.body = Vec::new();
        self.finished = true;
        Ok(size)
    }
}

struct DiskResponseReader {
    response_id: ResponseId,
    info: ResponseInfo,
    body: Bytes,
    offset: usize,
}

#[async_trait]
impl ResponseReader for DiskResponseReader {
    fn response_id(&self) -> ResponseId {
        self.response_id
    }

    async fn read_info(&mut self) -> StorageResult<ResponseInfo> {
        Ok(self.info.clone())
    }

    async fn read_data(&mut self, max: usize) -> StorageResult<Bytes> {
        let end = (self.offset + max).min(self.body.len());
        let chunk = self.body.slice(self.offset..end);
        self.offset = end;
        Ok(chunk)
    }
}

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use core_types::{
    AppCacheEntry, AppCacheInfoCollection, CacheId, CacheRecord, GroupId, GroupRecord,
    ResponseId, ResponseInfo,
};
use url::Url;

use crate::error::StorageResult;

/// A group as loaded from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedGroup {
    /// The group record. Fresh groups are not persisted until their first
    /// cache is stored.
    pub group: GroupRecord,
    /// The group's newest complete cache, if any.
    pub newest_cache: Option<CacheRecord>,
}

/// Where a main resource can be served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainResponse {
    /// Manifest URL of the cache holding the response.
    pub manifest_url: Url,
    /// Group holding the response.
    pub group_id: GroupId,
    /// Cache holding the response.
    pub cache_id: CacheId,
    /// URL of the entry to serve; the fallback target for namespace hits.
    pub entry_url: Url,
    /// The entry to serve.
    pub entry: AppCacheEntry,
    /// Matching fallback namespace, for namespace hits.
    pub namespace_url: Option<Url>,
}

impl MainResponse {
    /// True when served through a fallback namespace.
    pub fn is_fallback(&self) -> bool {
        self.namespace_url.is_some()
    }
}

/// Streams one new response into storage.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Id the response will be stored under.
    fn response_id(&self) -> ResponseId;

    /// Records the status line and headers.
    async fn write_info(&mut self, info: ResponseInfo) -> StorageResult<()>;

    /// Appends body bytes.
    async fn write_data(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Makes the response durable. Returns the body size.
    async fn finish(&mut self) -> StorageResult<u64>;
}

/// Streams one stored response out of storage.
#[async_trait]
pub trait ResponseReader: Send {
    /// Id of the response being read.
    fn response_id(&self) -> ResponseId;

    /// Reads the status line and headers.
    async fn read_info(&mut self) -> StorageResult<ResponseInfo>;

    /// Reads up to `max` body bytes; an empty result means end of body.
    async fn read_data(&mut self, max: usize) -> StorageResult<Bytes>;
}

/// Durable store for cache metadata and response bodies.
#[async_trait]
pub trait ResponseStorage: Send + Sync {
    /// Loads the group for `manifest_url`, or creates an unsaved one.
    async fn load_or_create_group(&self, manifest_url: &Url) -> StorageResult<LoadedGroup>;

    /// Loads a cache and its group by cache id.
    async fn load_cache(&self, cache_id: CacheId) -> StorageResult<Option<(GroupRecord, CacheRecord)>>;

    /// Stores `group` with `cache` as its newest cache, replacing the
    /// previous newest cache and dooming responses only it referenced.
    async fn store_group_and_newest_cache(
        &self,
        group: &GroupRecord,
        cache: &CacheRecord,
    ) -> StorageResult<()>;

    /// Deletes the group and its caches, dooming their responses.
    async fn make_group_obsolete(&self, group_id: GroupId) -> StorageResult<()>;

    /// Allocates a cache id.
    async fn new_cache_id(&self) -> StorageResult<CacheId>;

    /// Starts writing a new response for the group of `manifest_url`.
    async fn create_response_writer(&self, manifest_url: &Url) -> StorageResult<Box<dyn ResponseWriter>>;

    /// Opens a stored response.
    async fn create_response_reader(
        &self,
        manifest_url: &Url,
        response_id: ResponseId,
    ) -> StorageResult<Box<dyn ResponseReader>>;

    /// Schedules responses for deletion. The schedule survives restarts.
    async fn doom_responses(&self, manifest_url: &Url, response_ids: &[ResponseId]) -> StorageResult<()>;

    /// Finds a cached response able to serve a navigation to `url`.
    async fn find_response_for_main_request(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> StorageResult<Option<MainResponse>>;

    /// Flags the entry for `url` in `cache_id` as foreign.
    async fn mark_entry_as_foreign(&self, url: &Url, cache_id: CacheId) -> StorageResult<()>;

    /// Summaries of every stored group.
    async fn get_all_info(&self) -> StorageResult<AppCacheInfoCollection>;
}

/// Reads a whole body in chunks of `chunk_size` bytes.
pub async fn read_all(reader: &mut dyn ResponseReader, chunk_size: usize) -> StorageResult<Bytes> {
    let mut body = BytesMut::new();
    loop {
        let chunk = reader.read_data(chunk_size.max(1)).await?;
        if chunk.is_empty() {
            return Ok(body.freeze());
        }
        body.extend_from_slice(&chunk);
    }
}

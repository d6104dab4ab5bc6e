//! Service entry point and the shared context update jobs run with.

use async_runtime::{Scheduler, TokioScheduler};
use core_types::{
    origin_of, AppCacheInfoCollection, CacheId, DefaultManifestParser, HostId, ManifestError,
    ManifestParser, ResponseId,
};
use parking_lot::Mutex;
use resource_fetcher::ResourceFetcher;
use response_storage::{MainResponse, ResponseStorage};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use url::Url;

use crate::cache::AppCache;
use crate::config::UpdateConfig;
use crate::error::{AppCacheError, AppCacheResult};
use crate::event::AppCacheFrontend;
use crate::group::AppCacheGroup;
use crate::host::AppCacheHost;

/// Collaborators shared by every group and update job.
pub struct ServiceContext {
    /// Response and metadata store.
    pub storage: Arc<dyn ResponseStorage>,
    /// Network access.
    pub fetcher: Arc<dyn ResourceFetcher>,
    /// Manifest parser.
    pub parser: Arc<dyn ManifestParser>,
    /// Runs deferred restarts.
    pub scheduler: Arc<dyn Scheduler>,
    /// Runtime update jobs are spawned on.
    pub runtime: Handle,
    /// Job tuning.
    pub config: UpdateConfig,
}

impl ServiceContext {
    /// Starts building a context around `storage` and `fetcher`.
    pub fn builder(
        storage: Arc<dyn ResponseStorage>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> ServiceContextBuilder {
        ServiceContextBuilder {
            storage,
            fetcher,
            parser: None,
            scheduler: None,
            runtime: None,
            config: UpdateConfig::default(),
        }
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceContext`].
pub struct ServiceContextBuilder {
    storage: Arc<dyn ResponseStorage>,
    fetcher: Arc<dyn ResourceFetcher>,
    parser: Option<Arc<dyn ManifestParser>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    runtime: Option<Handle>,
    config: UpdateConfig,
}

impl ServiceContextBuilder {
    /// Replaces the manifest parser.
    pub fn parser(mut self, parser: Arc<dyn ManifestParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Replaces the restart scheduler.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Spawns jobs on `runtime` instead of the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets job tuning.
    pub fn config(mut self, config: UpdateConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the context.
    ///
    /// Without an explicit runtime the current one is used; outside a
    /// runtime this fails with [`AppCacheError::NoRuntime`].
    pub fn build(self) -> AppCacheResult<Arc<ServiceContext>> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| AppCacheError::NoRuntime)?,
        };
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new(runtime.clone())));
        Ok(Arc::new(ServiceContext {
            storage: self.storage,
            fetcher: self.fetcher,
            parser: self.parser.unwrap_or_else(|| Arc::new(DefaultManifestParser)),
            scheduler,
            runtime,
            config: self.config,
        }))
    }
}

/// Outcome of verifying one stored response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResponseResult {
    /// The response is readable and complete.
    ResponseOk,
    /// The group, or its newest cache, is gone or obsolete.
    ManifestOutOfDate,
    /// The response belongs to an older cache.
    ResponseOutOfDate,
    /// The newest cache has no entry for the response.
    EntryNotFound,
    /// The stored headers could not be read.
    ReadHeadersError,
    /// The stored body could not be read.
    ReadDataError,
    /// The stored body size disagrees with the recorded size.
    UnexpectedDataSize,
}

impl CheckResponseResult {
    /// True for results that mean the stored group is damaged.
    pub fn is_corruption(self) -> bool {
        matches!(
            self,
            CheckResponseResult::EntryNotFound
                | CheckResponseResult::ReadHeadersError
                | CheckResponseResult::ReadDataError
                | CheckResponseResult::UnexpectedDataSize
        )
    }
}

/// Entry point of the engine: hosts, groups, lookups and deletion.
///
/// Groups are registered weakly; a group lives while a host, a caller or
/// its own update keeps it.
pub struct AppCacheService {
    context: Arc<ServiceContext>,
    groups: Mutex<HashMap<Url, Weak<AppCacheGroup>>>,
    next_host_id: AtomicU64,
}

impl AppCacheService {
    /// Creates a service.
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self {
            context,
            groups: Mutex::new(HashMap::new()),
            next_host_id: AtomicU64::new(1),
        }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Creates a host with a fresh id.
    pub fn create_host(&self, frontend: Arc<dyn AppCacheFrontend>) -> Arc<AppCacheHost> {
        let host_id = HostId(self.next_host_id.fetch_add(1, Ordering::Relaxed));
        AppCacheHost::new(host_id, frontend)
    }

    /// Live group for `manifest_url`, if any.
    pub fn group(&self, manifest_url: &Url) -> Option<Arc<AppCacheGroup>> {
        self.groups
            .lock()
            .get(manifest_url)
            .and_then(Weak::upgrade)
            .filter(|group| !group.is_obsolete())
    }

    /// Returns the live group for `manifest_url`, loading it from storage
    /// (or creating an empty one) when needed.
    pub async fn load_or_create_group(&self, manifest_url: &Url) -> AppCacheResult<Arc<AppCacheGroup>> {
        check_manifest_url(manifest_url)?;
        if let Some(group) = self.group(manifest_url) {
            return Ok(group);
        }

        let loaded = self.context.storage.load_or_create_group(manifest_url).await?;
        let group = AppCacheGroup::new(self.context.clone(), loaded.group);
        if let Some(record) = loaded.newest_cache {
            group.add_cache(AppCache::from_stored(record));
        }

        let mut groups = self.groups.lock();
        if let Some(existing) = groups
            .get(manifest_url)
            .and_then(Weak::upgrade)
            .filter(|g| !g.is_obsolete())
        {
            return Ok(existing);
        }
        groups.retain(|_, weak| weak.strong_count() > 0);
        groups.insert(manifest_url.clone(), Arc::downgrade(&group));
        tracing::debug!(manifest_url = %manifest_url, group = %group.group_id(), "group loaded");
        Ok(group)
    }

    /// Starts or joins the update of the group for `manifest_url`.
    pub async fn start_update(
        &self,
        host: Option<&Arc<AppCacheHost>>,
        manifest_url: &Url,
        new_master_url: Option<Url>,
    ) -> AppCacheResult<Arc<AppCacheGroup>> {
        let group = self.load_or_create_group(manifest_url).await?;
        group.start_update(host, new_master_url);
        Ok(group)
    }

    /// Loads the cache with `cache_id`, through its live group when possible.
    pub async fn load_cache(&self, cache_id: CacheId) -> AppCacheResult<Option<Arc<AppCache>>> {
        let Some((group_record, _)) = self.context.storage.load_cache(cache_id).await? else {
            return Ok(None);
        };
        let group = self.load_or_create_group(&group_record.manifest_url).await?;
        let live = group
            .newest_complete_cache()
            .into_iter()
            .chain(group.old_caches())
            .find(|cache| cache.cache_id() == cache_id);
        Ok(live)
    }

    /// Finds a cached response able to serve a navigation to `url`.
    pub async fn find_main_response(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> AppCacheResult<Option<MainResponse>> {
        Ok(self
            .context
            .storage
            .find_response_for_main_request(url, preferred_manifest_url)
            .await?)
    }

    /// True when a navigation to `url` could be served from a cache.
    pub async fn can_handle_main_resource_offline(&self, url: &Url) -> AppCacheResult<bool> {
        Ok(self.find_main_response(url, None).await?.is_some())
    }

    /// Flags an entry as foreign, in storage and in the live cache.
    pub async fn mark_entry_as_foreign(&self, url: &Url, cache_id: CacheId) -> AppCacheResult<()> {
        self.context.storage.mark_entry_as_foreign(url, cache_id).await?;
        if let Some(cache) = self.load_cache(cache_id).await? {
            cache.mark_entry_as_foreign(url);
        }
        Ok(())
    }

    /// Summaries of every stored group.
    pub async fn get_all_info(&self) -> AppCacheResult<AppCacheInfoCollection> {
        Ok(self.context.storage.get_all_info().await?)
    }

    /// Deletes the group for `manifest_url`.
    ///
    /// A running update is cancelled without further events. Deleting a
    /// group that was never stored succeeds.
    pub async fn delete_group(&self, manifest_url: &Url) -> AppCacheResult<()> {
        let live = self.groups.lock().remove(manifest_url).and_then(|w| w.upgrade());
        let group_id = match &live {
            Some(group) => {
                group.detach();
                group.mark_obsolete();
                group.group_id()
            }
            None => {
                let loaded = self.context.storage.load_or_create_group(manifest_url).await?;
                if loaded.newest_cache.is_none() {
                    return Ok(());
                }
                loaded.group.group_id
            }
        };
        match self.context.storage.make_group_obsolete(group_id).await {
            Ok(()) => {
                tracing::info!(manifest_url = %manifest_url, "group deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every group whose manifest lives on `origin`.
    ///
    /// Returns how many groups were deleted.
    pub async fn delete_for_origin(&self, origin: &Url) -> AppCacheResult<usize> {
        let origin = origin_of(origin);
        let infos = self.get_all_info().await?;
        let mut deleted = 0;
        for info in infos.infos_by_origin.get(&origin).into_iter().flatten() {
            self.delete_group(&info.manifest_url).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Verifies that a stored response is intact.
    ///
    /// Results reporting corruption delete the whole group.
    pub async fn check_response(
        &self,
        manifest_url: &Url,
        cache_id: CacheId,
        response_id: ResponseId,
    ) -> AppCacheResult<CheckResponseResult> {
        let result = self.verify_response(manifest_url, cache_id, response_id).await?;
        if result.is_corruption() {
            tracing::warn!(
                manifest_url = %manifest_url,
                response = %response_id,
                result = ?result,
                "stored response is damaged, deleting group"
            );
            self.delete_group(manifest_url).await?;
        }
        Ok(result)
    }

    async fn verify_response(
        &self,
        manifest_url: &Url,
        cache_id: CacheId,
        response_id: ResponseId,
    ) -> AppCacheResult<CheckResponseResult> {
        let group = self.load_or_create_group(manifest_url).await?;
        let Some(cache) = group.newest_complete_cache() else {
            return Ok(CheckResponseResult::ManifestOutOfDate);
        };
        let record = cache.record();
        let Some((_, entry)) = record.entry_with_response_id(response_id) else {
            return Ok(if cache.cache_id() == cache_id {
                CheckResponseResult::EntryNotFound
            } else {
                CheckResponseResult::ResponseOutOfDate
            });
        };
        let expected_size = entry.response_size;

        let storage = &self.context.storage;
        let mut reader = match storage.create_response_reader(manifest_url, response_id).await {
            Ok(reader) => reader,
            Err(_) => return Ok(CheckResponseResult::ReadHeadersError),
        };
        let info = match reader.read_info().await {
            Ok(info) => info,
            Err(_) => return Ok(CheckResponseResult::ReadHeadersError),
        };
        let mut read = 0u64;
        loop {
            match reader.read_data(self.context.config.read_chunk_size).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => read += chunk.len() as u64,
                Err(_) => return Ok(CheckResponseResult::ReadDataError),
            }
        }
        if info.body_size != read || expected_size != read {
            return Ok(CheckResponseResult::UnexpectedDataSize);
        }
        Ok(CheckResponseResult::ResponseOk)
    }
}

impl fmt::Debug for AppCacheService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCacheService")
            .field("groups", &self.groups.lock().len())
            .finish()
    }
}

fn check_manifest_url(manifest_url: &Url) -> AppCacheResult<()> {
    match manifest_url.scheme() {
        "http" | "https" => Ok(()),
        _ => Err(ManifestError::unsupported_url(manifest_url.as_str()).into()),
    }
}

//! The update job: one run of the check, download and commit cycle.
//!
//! A job is spawned by its group and runs as a single task. It holds the
//! group weakly and never keeps it alive across a suspension point. State
//! that joining hosts touch lives in [`JobShared`], behind a short lock the
//! task never holds across an `.await`.
//!
//! Deliveries to hosts are serialised per job: the job and a joining host
//! both hold the job's delivery lock while picking recipients and calling
//! frontends, so a joiner's catch-up events always precede anything the
//! job sends it.

use bytes::Bytes;
use chrono::Utc;
use core_types::http::conditional_headers_for;
use core_types::{
    origin_of, AppCacheEntry, CacheRecord, EntryKind, GroupRecord, HostId, Manifest, ResponseId,
    ResponseInfo,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use resource_fetcher::{
    FetchError, FetchRequest, FetchResponse, FetchResult, RetryDecision, RetryTable,
    MANIFEST_MIME_TYPE,
};
use response_storage::{read_all, StorageResult};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use url::Url;

use crate::cache::AppCache;
use crate::event::{AppCacheEvent, HostNotifier, LogLevel};
use crate::group::{catch_up_events, AppCacheGroup, UpdateStatus};
use crate::host::AppCacheHost;
use crate::service::ServiceContext;

const COMMIT_FAILURE: &str = "Failed to commit new cache to storage";

/// Whether a job creates a group's first cache or a newer version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// The group has no complete cache yet.
    CacheAttempt,
    /// The group has a complete cache that may be replaced.
    UpgradeAttempt,
}

/// Progress of a job. Later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InternalState {
    /// Waiting for the manifest.
    FetchManifest,
    /// The manifest did not change; master entries may still be fetched.
    NoUpdate,
    /// Fetching listed resources and master entries.
    Downloading,
    /// Re-validating the manifest.
    RefetchManifest,
    /// Writing the result to storage.
    Committing,
    /// Failed.
    CacheFailure,
    /// Done.
    Completed,
}

impl InternalState {
    /// True once hosts can no longer join the job.
    pub fn is_terminating(self) -> bool {
        self >= InternalState::RefetchManifest
    }
}

type HostRef = (HostId, Weak<AppCacheHost>);

struct SharedState {
    internal_state: InternalState,
    checking_sent: bool,
    downloading_sent: bool,
    starter: Option<HostRef>,
    early_hosts: Vec<HostRef>,
    pending_masters: BTreeMap<Url, Vec<HostRef>>,
    new_master_urls: Vec<Url>,
    detached: bool,
    written: Vec<ResponseId>,
    commit_in_flight: bool,
}

impl SharedState {
    fn recipients(&self) -> Vec<Weak<AppCacheHost>> {
        self.starter
            .iter()
            .chain(self.pending_masters.values().flatten())
            .map(|(_, host)| host.clone())
            .collect()
    }
}

/// What a host asking to join a running job gets.
pub(crate) enum JoinOutcome {
    /// The host joined; deliver `catch_up` to it right away.
    Joined { catch_up: Vec<AppCacheEvent> },
    /// The job is finishing; the request must be queued.
    Terminating,
}

/// Job state shared with the group, read and written by joining hosts.
pub(crate) struct JobShared {
    state: Mutex<SharedState>,
    delivery: ReentrantMutex<()>,
    wake: Notify,
}

impl JobShared {
    pub(crate) fn new(starter: Option<&Arc<AppCacheHost>>, master_url: Option<Url>) -> Arc<Self> {
        let starter = starter.map(|host| (host.host_id(), Arc::downgrade(host)));
        let mut pending_masters = BTreeMap::new();
        if let (Some(host), Some(url)) = (&starter, master_url) {
            pending_masters.insert(url, vec![host.clone()]);
        }
        Arc::new(Self {
            state: Mutex::new(SharedState {
                internal_state: InternalState::FetchManifest,
                checking_sent: false,
                downloading_sent: false,
                starter,
                early_hosts: Vec::new(),
                pending_masters,
                new_master_urls: Vec::new(),
                detached: false,
                written: Vec::new(),
                commit_in_flight: false,
            }),
            delivery: ReentrantMutex::new(()),
            wake: Notify::new(),
        })
    }

    /// Registers a joining host, folding its master URL into the job.
    pub(crate) fn try_join(
        &self,
        host: Option<&Arc<AppCacheHost>>,
        master_url: Option<Url>,
    ) -> JoinOutcome {
        let mut state = self.state.lock();
        if state.internal_state.is_terminating() {
            return JoinOutcome::Terminating;
        }
        let Some(host) = host else {
            return JoinOutcome::Joined {
                catch_up: Vec::new(),
            };
        };
        let host_ref = (host.host_id(), Arc::downgrade(host));

        if let Some(url) = master_url {
            let hosts = state.pending_masters.entry(url.clone()).or_default();
            let first_for_url = hosts.is_empty();
            if !hosts.iter().any(|(id, _)| *id == host_ref.0) {
                hosts.push(host_ref.clone());
            }
            if first_for_url {
                state.new_master_urls.push(url);
                self.wake.notify_one();
            }
        }

        if !state.checking_sent {
            state.early_hosts.push(host_ref);
            return JoinOutcome::Joined {
                catch_up: Vec::new(),
            };
        }
        JoinOutcome::Joined {
            catch_up: catch_up_events(state.downloading_sent),
        }
    }

    pub(crate) fn internal_state(&self) -> InternalState {
        self.state.lock().internal_state
    }

    pub(crate) fn set_detached(&self) {
        self.state.lock().detached = true;
    }

    /// Held while picking recipients and delivering to them.
    pub(crate) fn hold_delivery(&self) -> ReentrantMutexGuard<'_, ()> {
        self.delivery.lock()
    }

    fn record_written(&self, response_id: ResponseId) {
        self.state.lock().written.push(response_id);
    }

    fn take_written(&self) -> Vec<ResponseId> {
        std::mem::take(&mut self.state.lock().written)
    }

    fn begin_commit(&self) {
        self.state.lock().commit_in_flight = true;
    }

    fn end_commit(&self, stored: bool) {
        let mut state = self.state.lock();
        state.commit_in_flight = false;
        if stored {
            state.written.clear();
        }
    }

    /// Responses written by an abandoned job that no cache refers to.
    /// Empty while a commit is in flight, since storage may already hold
    /// the new cache.
    pub(crate) fn take_abandoned_responses(&self) -> Vec<ResponseId> {
        let mut state = self.state.lock();
        if state.commit_in_flight {
            return Vec::new();
        }
        std::mem::take(&mut state.written)
    }

    fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    fn set_state(&self, internal_state: InternalState) {
        self.state.lock().internal_state = internal_state;
    }

    /// Moves to a terminating state unless new master URLs arrived.
    fn begin_terminating(&self, next: InternalState) -> bool {
        let mut state = self.state.lock();
        if !state.new_master_urls.is_empty() {
            return false;
        }
        state.internal_state = next;
        true
    }

    fn announce_checking(&self) -> Vec<Weak<AppCacheHost>> {
        let mut state = self.state.lock();
        state.checking_sent = true;
        let early = std::mem::take(&mut state.early_hosts);
        state
            .starter
            .iter()
            .chain(early.iter())
            .map(|(_, host)| host.clone())
            .collect()
    }

    fn enter_downloading(&self) -> Vec<Weak<AppCacheHost>> {
        let mut state = self.state.lock();
        state.internal_state = InternalState::Downloading;
        state.downloading_sent = true;
        state.recipients()
    }

    fn recipients(&self) -> Vec<Weak<AppCacheHost>> {
        self.state.lock().recipients()
    }

    fn master_hosts(&self) -> Vec<Weak<AppCacheHost>> {
        self.state
            .lock()
            .pending_masters
            .values()
            .flatten()
            .map(|(_, host)| host.clone())
            .collect()
    }

    fn take_new_master_urls(&self) -> Vec<Url> {
        std::mem::take(&mut self.state.lock().new_master_urls)
    }

    fn take_all_master_urls(&self) -> Vec<Url> {
        let mut state = self.state.lock();
        state.new_master_urls.clear();
        state.pending_masters.keys().cloned().collect()
    }

    /// Drops a failed master URL, returning the hosts that waited on it.
    fn remove_master(&self, url: &Url) -> Vec<Weak<AppCacheHost>> {
        let mut state = self.state.lock();
        let removed = state.pending_masters.remove(url).unwrap_or_default();
        if let Some((starter_id, _)) = &state.starter {
            if removed.iter().any(|(id, _)| id == starter_id) {
                state.starter = None;
            }
        }
        removed.into_iter().map(|(_, host)| host).collect()
    }
}

#[derive(Debug)]
enum JobFailure {
    Failed(String),
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Listed,
    Master,
}

#[derive(Debug)]
struct FetchWork {
    url: Url,
    role: Role,
    existing: Option<AppCacheEntry>,
}

#[derive(Debug)]
enum EntryOutcome {
    Stored { response_id: ResponseId, size: u64 },
    Unchanged,
    Failed { status: Option<u16>, reason: String },
}

impl EntryOutcome {
    fn failure_code(&self) -> String {
        match self {
            EntryOutcome::Failed {
                status: Some(status),
                ..
            } => status.to_string(),
            EntryOutcome::Failed { reason, .. } => reason.clone(),
            EntryOutcome::Unchanged => "304".to_string(),
            EntryOutcome::Stored { .. } => "ok".to_string(),
        }
    }
}

#[derive(Debug)]
struct FetchDone {
    url: Url,
    role: Role,
    existing: Option<AppCacheEntry>,
    outcome: EntryOutcome,
}

/// What one cycle has gathered so far.
#[derive(Debug, Default)]
struct Download {
    list: BTreeMap<Url, EntryKind>,
    entries: BTreeMap<Url, AppCacheEntry>,
    masters_in_list: BTreeSet<Url>,
    master_fetches: BTreeSet<Url>,
    masters_succeeded: usize,
    masters_failed: usize,
    reuse_from: Option<CacheRecord>,
    queue: VecDeque<FetchWork>,
    total: usize,
    completed: usize,
}

/// Fetch and storage plumbing shared by the job and its fetch tasks.
struct FetchContext {
    context: Arc<ServiceContext>,
    manifest_url: Url,
    retries: Mutex<RetryTable>,
    shared: Arc<JobShared>,
}

impl FetchContext {
    async fn fetch(&self, request: FetchRequest) -> FetchResult<FetchResponse> {
        loop {
            let outcome = self.context.fetcher.fetch(request.clone()).await;
            if self.retries.lock().record(&request.url, &outcome) == RetryDecision::Finish {
                return outcome;
            }
            tracing::debug!(url = %request.url, "service unavailable, retrying");
        }
    }

    async fn store_response(&self, response: &FetchResponse) -> StorageResult<(ResponseId, u64)> {
        let mut writer = self
            .context
            .storage
            .create_response_writer(&self.manifest_url)
            .await?;
        let response_id = writer.response_id();
        self.shared.record_written(response_id);
        writer.write_info(response.response_info()).await?;
        let chunk_size = self.context.config.read_chunk_size.max(1);
        for chunk in response.body.chunks(chunk_size) {
            writer.write_data(chunk).await?;
        }
        let size = writer.finish().await?;
        Ok((response_id, size))
    }

    async fn read_info(&self, response_id: ResponseId) -> StorageResult<ResponseInfo> {
        let mut reader = self
            .context
            .storage
            .create_response_reader(&self.manifest_url, response_id)
            .await?;
        reader.read_info().await
    }

    async fn read_response(&self, response_id: ResponseId) -> StorageResult<(ResponseInfo, Bytes)> {
        let mut reader = self
            .context
            .storage
            .create_response_reader(&self.manifest_url, response_id)
            .await?;
        let info = reader.read_info().await?;
        let body = read_all(reader.as_mut(), self.context.config.read_chunk_size).await?;
        Ok((info, body))
    }

    // Cross-origin no-store responses may not be cached under an https manifest.
    fn is_policy_denied(&self, url: &Url, response: &FetchResponse) -> bool {
        self.manifest_url.scheme() == "https"
            && url.origin() != self.manifest_url.origin()
            && response.response_info().has_cache_control("no-store")
    }

    async fn fetch_entry(self: Arc<Self>, work: FetchWork) -> FetchDone {
        let outcome = self.entry_outcome(&work).await;
        FetchDone {
            url: work.url,
            role: work.role,
            existing: work.existing,
            outcome,
        }
    }

    async fn entry_outcome(&self, work: &FetchWork) -> EntryOutcome {
        let mut request = FetchRequest::get(work.url.clone());
        if let Some(response_id) = work.existing.as_ref().and_then(|e| e.response_id) {
            match self.read_info(response_id).await {
                Ok(info) if info.is_fresh(Utc::now()) && !info.has_vary() => {
                    tracing::trace!(url = %work.url, "stored response is fresh");
                    return EntryOutcome::Unchanged;
                }
                Ok(info) => request = request.with_headers(info.conditional_headers()),
                Err(e) => {
                    tracing::debug!(url = %work.url, error = %e, "stored response unreadable")
                }
            }
        }

        let conditional = request.is_conditional();
        match self.fetch(request).await {
            Err(error) => EntryOutcome::Failed {
                status: None,
                reason: error.to_string(),
            },
            Ok(response) if response.is_not_modified() && conditional => EntryOutcome::Unchanged,
            Ok(response) if response.is_success() => {
                if self.is_policy_denied(&work.url, &response) {
                    let error = FetchError::policy_denied(format!(
                        "no-store response from {}",
                        origin_of(&work.url)
                    ));
                    return EntryOutcome::Failed {
                        status: None,
                        reason: error.to_string(),
                    };
                }
                match self.store_response(&response).await {
                    Ok((response_id, size)) => EntryOutcome::Stored { response_id, size },
                    Err(e) => EntryOutcome::Failed {
                        status: None,
                        reason: e.to_string(),
                    },
                }
            }
            Ok(response) => EntryOutcome::Failed {
                status: Some(response.status),
                reason: format!("HTTP {}", response.status),
            },
        }
    }
}

/// One update of one group.
pub(crate) struct UpdateJob {
    group: Weak<AppCacheGroup>,
    manifest_url: Url,
    context: Arc<ServiceContext>,
    shared: Arc<JobShared>,
    update_type: UpdateType,
    newest: Option<Arc<AppCache>>,
    fetch: Arc<FetchContext>,
}

impl UpdateJob {
    pub(crate) fn new(
        group: &Arc<AppCacheGroup>,
        context: Arc<ServiceContext>,
        shared: Arc<JobShared>,
        newest: Option<Arc<AppCache>>,
    ) -> Self {
        let update_type = if newest.is_some() {
            UpdateType::UpgradeAttempt
        } else {
            UpdateType::CacheAttempt
        };
        let fetch = Arc::new(FetchContext {
            context: context.clone(),
            manifest_url: group.manifest_url().clone(),
            retries: Mutex::new(RetryTable::new(context.config.retry_policy())),
            shared: shared.clone(),
        });
        Self {
            group: Arc::downgrade(group),
            manifest_url: group.manifest_url().clone(),
            context,
            shared,
            update_type,
            newest,
            fetch,
        }
    }

    pub(crate) fn update_type(&self) -> UpdateType {
        self.update_type
    }

    pub(crate) async fn run(self) {
        self.announce_checking();
        if let Err(JobFailure::Failed(message)) = self.check_and_update().await {
            self.handle_cache_failure(message).await;
        }
        self.finish();
    }

    fn group(&self) -> Result<Arc<AppCacheGroup>, JobFailure> {
        self.group.upgrade().ok_or(JobFailure::Detached)
    }

    fn finish(&self) {
        if self.shared.is_detached() {
            return;
        }
        if let Some(group) = self.group.upgrade() {
            group.update_job_finished(&self.shared);
        }
    }

    async fn check_and_update(&self) -> Result<(), JobFailure> {
        let stored_manifest = self.load_stored_manifest().await;
        let mut request = FetchRequest::get(self.manifest_url.clone());
        if let Some((info, _)) = &stored_manifest {
            request = request.with_headers(info.conditional_headers());
        }

        let response = self
            .fetch
            .fetch(request)
            .await
            .map_err(|e| self.manifest_failure(&e.to_string()))?;

        let upgrading = self.update_type == UpdateType::UpgradeAttempt;
        if response.is_not_modified() && upgrading {
            return self.handle_no_update().await;
        }
        if matches!(response.status, 404 | 410) && upgrading {
            return self.handle_obsolete().await;
        }
        if !response.is_success() {
            return Err(self.manifest_failure(&response.status.to_string()));
        }
        let mime_type = response.mime_type().unwrap_or_default();
        if mime_type != MANIFEST_MIME_TYPE {
            return Err(JobFailure::Failed(format!(
                "Invalid manifest mime type ({}) {}",
                mime_type, self.manifest_url
            )));
        }
        if let Some((_, body)) = &stored_manifest {
            if *body == response.body {
                tracing::debug!(manifest_url = %self.manifest_url, "manifest unchanged");
                return self.handle_no_update().await;
            }
        }

        let manifest = self
            .context
            .parser
            .parse(&self.manifest_url, &response.body)
            .map_err(|e| {
                JobFailure::Failed(format!("Invalid manifest {}: {}", self.manifest_url, e))
            })?;
        self.download(&manifest, &response).await
    }

    fn manifest_failure(&self, code: &str) -> JobFailure {
        JobFailure::Failed(format!("Manifest fetch failed ({}) {}", code, self.manifest_url))
    }

    async fn load_stored_manifest(&self) -> Option<(ResponseInfo, Bytes)> {
        let record = self.newest.as_ref()?.record();
        let response_id = record.manifest_entry().and_then(|(_, e)| e.response_id)?;
        match self.fetch.read_response(response_id).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                tracing::warn!(
                    manifest_url = %self.manifest_url,
                    error = %e,
                    "stored manifest unreadable, fetching unconditionally"
                );
                None
            }
        }
    }

    async fn download(&self, manifest: &Manifest, first: &FetchResponse) -> Result<(), JobFailure> {
        {
            let _delivery = self.shared.hold_delivery();
            let notifier = {
                let group = self.group()?;
                group.set_update_status(UpdateStatus::Downloading);
                let recipients = self.shared.enter_downloading();
                self.notifier_for(&group, &recipients)
            };
            self.send(&notifier, AppCacheEvent::Downloading);
        }

        let mut dl = Download::default();
        for url in &manifest.explicit_urls {
            *dl.list.entry(url.clone()).or_insert(EntryKind::NONE) |= EntryKind::EXPLICIT;
        }
        for url in manifest.fallback_targets() {
            *dl.list.entry(url.clone()).or_insert(EntryKind::NONE) |= EntryKind::FALLBACK;
        }
        let newest_record = self.newest.as_ref().map(|cache| cache.record());
        if let Some(record) = &newest_record {
            for (url, entry) in &record.entries {
                if entry.is_master() {
                    *dl.list.entry(url.clone()).or_insert(EntryKind::NONE) |= EntryKind::MASTER;
                }
            }
        }
        let manifest_kind = dl
            .list
            .remove(&self.manifest_url)
            .map_or(EntryKind::MANIFEST, |kind| kind | EntryKind::MANIFEST);

        dl.total = dl.list.len();
        for url in dl.list.keys() {
            let existing = newest_record
                .as_ref()
                .and_then(|record| record.entry(url))
                .filter(|entry| entry.has_response_id())
                .cloned();
            dl.queue.push_back(FetchWork {
                url: url.clone(),
                role: Role::Listed,
                existing,
            });
        }
        for url in self.shared.take_all_master_urls() {
            self.queue_master(&mut dl, url);
        }
        tracing::debug!(
            manifest_url = %self.manifest_url,
            listed = dl.total,
            masters = dl.master_fetches.len(),
            "downloading"
        );

        self.run_fetches(&mut dl, InternalState::RefetchManifest).await?;

        if self.update_type == UpdateType::CacheAttempt
            && dl.masters_failed > 0
            && dl.masters_succeeded == 0
            && dl.masters_in_list.is_empty()
        {
            return Err(JobFailure::Failed(format!(
                "Every master entry failed to load for {}",
                self.manifest_url
            )));
        }

        self.refetch_manifest(first).await;
        self.notify_all(AppCacheEvent::Progress {
            url: None,
            total: dl.total,
            completed: dl.total,
        });
        self.commit(manifest, first, manifest_kind, dl.entries).await
    }

    async fn run_fetches(&self, dl: &mut Download, finish_state: InternalState) -> Result<(), JobFailure> {
        let limit = self.context.config.max_concurrent_fetches.max(1);
        let mut in_flight: FuturesUnordered<BoxFuture<'static, FetchDone>> = FuturesUnordered::new();
        loop {
            while in_flight.len() < limit {
                let Some(work) = dl.queue.pop_front() else {
                    break;
                };
                in_flight.push(self.fetch.clone().fetch_entry(work).boxed());
            }

            if in_flight.is_empty() {
                self.absorb_new_masters(dl);
                if dl.queue.is_empty() && self.shared.begin_terminating(finish_state) {
                    return Ok(());
                }
                continue;
            }

            let woken = self.shared.wake.notified();
            tokio::select! {
                biased;
                _ = woken => self.absorb_new_masters(dl),
                Some(done) = in_flight.next() => self.handle_fetch_done(dl, done)?,
            }
        }
    }

    fn absorb_new_masters(&self, dl: &mut Download) {
        for url in self.shared.take_new_master_urls() {
            self.queue_master(dl, url);
        }
    }

    fn queue_master(&self, dl: &mut Download, url: Url) {
        if let Some(kind) = dl.list.get_mut(&url) {
            *kind |= EntryKind::MASTER;
            if let Some(entry) = dl.entries.get_mut(&url) {
                entry.add_kind(EntryKind::MASTER);
            }
            dl.masters_in_list.insert(url);
            return;
        }
        if let Some(existing) = dl
            .reuse_from
            .as_ref()
            .and_then(|record| record.entry(&url))
            .filter(|entry| entry.has_response_id())
        {
            if !existing.is_master() {
                let mut entry = existing.clone();
                entry.add_kind(EntryKind::MASTER);
                dl.entries.insert(url, entry);
            }
            dl.masters_succeeded += 1;
            return;
        }
        if dl.master_fetches.insert(url.clone()) {
            dl.queue.push_back(FetchWork {
                url,
                role: Role::Master,
                existing: None,
            });
        }
    }

    fn handle_fetch_done(&self, dl: &mut Download, done: FetchDone) -> Result<(), JobFailure> {
        match done.role {
            Role::Listed => self.handle_listed(dl, done),
            Role::Master => {
                self.handle_master(dl, done);
                Ok(())
            }
        }
    }

    fn handle_listed(&self, dl: &mut Download, done: FetchDone) -> Result<(), JobFailure> {
        let FetchDone {
            url,
            existing,
            outcome,
            ..
        } = done;
        let kind = dl.list.get(&url).copied().unwrap_or(EntryKind::NONE);
        self.notify_all(AppCacheEvent::Progress {
            url: Some(url.clone()),
            total: dl.total,
            completed: dl.completed,
        });
        dl.completed += 1;

        match outcome {
            EntryOutcome::Stored { response_id, size } => {
                dl.entries
                    .insert(url, AppCacheEntry::with_response(kind, response_id, size));
            }
            EntryOutcome::Unchanged => {
                if let Some(entry) = copied_entry(kind, existing.as_ref()) {
                    dl.entries.insert(url, entry);
                }
            }
            EntryOutcome::Failed { status, reason } => {
                let code = status.map_or(reason, |status| status.to_string());
                if kind.intersects(EntryKind::EXPLICIT | EntryKind::FALLBACK) {
                    return Err(JobFailure::Failed(format!(
                        "Resource fetch failed ({}) {}",
                        code, url
                    )));
                }
                match (status, copied_entry(kind, existing.as_ref())) {
                    (Some(404 | 410), _) | (_, None) => {
                        tracing::debug!(url = %url, code = %code, "dropping master entry");
                    }
                    (_, Some(entry)) => {
                        tracing::debug!(url = %url, code = %code, "keeping previous master entry");
                        dl.entries.insert(url.clone(), entry);
                    }
                }
                if dl.masters_in_list.contains(&url) && !dl.entries.contains_key(&url) {
                    dl.masters_in_list.remove(&url);
                    self.fail_master(dl, &url, &code);
                }
            }
        }
        Ok(())
    }

    fn handle_master(&self, dl: &mut Download, done: FetchDone) {
        match done.outcome {
            EntryOutcome::Stored { response_id, size } => {
                dl.masters_succeeded += 1;
                dl.entries.insert(
                    done.url,
                    AppCacheEntry::with_response(EntryKind::MASTER, response_id, size),
                );
            }
            other => self.fail_master(dl, &done.url, &other.failure_code()),
        }
    }

    fn fail_master(&self, dl: &mut Download, url: &Url, code: &str) {
        dl.masters_failed += 1;
        dl.master_fetches.remove(url);
        let _delivery = self.shared.hold_delivery();
        let hosts: Vec<Arc<AppCacheHost>> = self
            .shared
            .remove_master(url)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for host in &hosts {
            host.clear_pending_master();
        }
        let message = format!("Master entry fetch failed ({}) {}", code, url);
        tracing::warn!(manifest_url = %self.manifest_url, "{}", message);
        let mut notifier = HostNotifier::new();
        notifier.add_hosts(&hosts);
        self.send_error(&notifier, &message);
    }

    async fn refetch_manifest(&self, first: &FetchResponse) {
        self.fetch.retries.lock().reset(&self.manifest_url);
        let request = FetchRequest::get(self.manifest_url.clone())
            .with_headers(conditional_headers_for(&first.headers));
        let warning = match self.fetch.fetch(request).await {
            Ok(response) if response.is_not_modified() => None,
            Ok(response) if response.is_success() && response.body == first.body => None,
            Ok(response) => Some(format!(
                "Manifest changed during update ({}) {}",
                response.status, self.manifest_url
            )),
            Err(e) => Some(format!(
                "Manifest refetch failed ({}) {}",
                e, self.manifest_url
            )),
        };
        if let Some(message) = warning {
            tracing::warn!(manifest_url = %self.manifest_url, "{}, keeping fetched content", message);
            let _delivery = self.shared.hold_delivery();
            let notifier = self.notifier_all();
            if !self.shared.is_detached() {
                notifier.send_log(LogLevel::Warning, &message);
            }
        }
    }

    async fn commit(
        &self,
        manifest: &Manifest,
        first: &FetchResponse,
        manifest_kind: EntryKind,
        entries: BTreeMap<Url, AppCacheEntry>,
    ) -> Result<(), JobFailure> {
        let (response_id, size) = self
            .fetch
            .store_response(first)
            .await
            .map_err(|e| JobFailure::Failed(format!("Failed to store manifest: {}", e)))?;
        let group_record = self.group()?.record();
        let cache_id = self
            .context
            .storage
            .new_cache_id()
            .await
            .map_err(|_| JobFailure::Failed(COMMIT_FAILURE.to_string()))?;

        let mut record = CacheRecord::new(cache_id, group_record.group_id);
        record.initialize_with_manifest(manifest);
        for (url, entry) in entries {
            record.add_or_modify_entry(url, entry);
        }
        record.add_or_modify_entry(
            self.manifest_url.clone(),
            AppCacheEntry::with_response(manifest_kind, response_id, size),
        );

        let cache = self.store_new_cache(&group_record, record).await?;
        self.shared.set_state(InternalState::Completed);
        tracing::info!(
            manifest_url = %self.manifest_url,
            cache = %cache.cache_id(),
            entries = cache.entry_count(),
            "update complete"
        );
        let event = match self.update_type {
            UpdateType::CacheAttempt => AppCacheEvent::Cached,
            UpdateType::UpgradeAttempt => AppCacheEvent::UpdateReady,
        };
        self.notify_all(event);
        Ok(())
    }

    async fn store_new_cache(
        &self,
        group_record: &GroupRecord,
        record: CacheRecord,
    ) -> Result<Arc<AppCache>, JobFailure> {
        self.shared.set_state(InternalState::Committing);
        self.shared.begin_commit();
        let stored = self
            .context
            .storage
            .store_group_and_newest_cache(group_record, &record)
            .await;
        self.shared.end_commit(stored.is_ok());
        if let Err(e) = stored {
            tracing::error!(manifest_url = %self.manifest_url, error = %e, "storing new cache failed");
            return Err(JobFailure::Failed(COMMIT_FAILURE.to_string()));
        }

        let cache = AppCache::new(record);
        cache.mark_complete();
        self.group()?.add_cache(cache.clone());
        Ok(cache)
    }

    async fn handle_no_update(&self) -> Result<(), JobFailure> {
        self.shared.set_state(InternalState::NoUpdate);
        let mut dl = Download {
            reuse_from: self.newest.as_ref().map(|cache| cache.record()),
            ..Download::default()
        };
        for url in self.shared.take_all_master_urls() {
            self.queue_master(&mut dl, url);
        }
        self.run_fetches(&mut dl, InternalState::Committing).await?;

        if let (Some(newest), false) = (&self.newest, dl.entries.is_empty()) {
            let group_record = self.group()?.record();
            let cache_id = self
                .context
                .storage
                .new_cache_id()
                .await
                .map_err(|_| JobFailure::Failed(COMMIT_FAILURE.to_string()))?;
            let mut record = newest.record();
            record.cache_id = cache_id;
            record.update_time = Utc::now();
            for (url, entry) in dl.entries {
                record.add_or_modify_entry(url, entry);
            }
            let cache = self.store_new_cache(&group_record, record).await?;
            tracing::debug!(
                manifest_url = %self.manifest_url,
                cache = %cache.cache_id(),
                "stored new master entries"
            );
            for host in newest.associated_hosts() {
                host.associate_cache(Some(cache.clone()));
            }
        }

        self.shared.set_state(InternalState::Completed);
        self.notify_all(AppCacheEvent::NoUpdate);
        Ok(())
    }

    async fn handle_obsolete(&self) -> Result<(), JobFailure> {
        self.shared.set_state(InternalState::Committing);
        let group_id = self.group()?.group_id();
        if let Err(e) = self.context.storage.make_group_obsolete(group_id).await {
            tracing::error!(manifest_url = %self.manifest_url, error = %e, "marking group obsolete failed");
            return Err(JobFailure::Failed(format!(
                "Failed to mark group obsolete {}",
                self.manifest_url
            )));
        }
        self.group()?.mark_obsolete();
        self.shared.set_state(InternalState::Completed);
        tracing::info!(manifest_url = %self.manifest_url, "manifest gone, group is obsolete");
        self.notify_all(AppCacheEvent::Obsolete);
        Ok(())
    }

    async fn handle_cache_failure(&self, message: String) {
        self.shared.set_state(InternalState::CacheFailure);
        let written = self.shared.take_written();
        if !written.is_empty() {
            if let Err(e) = self
                .context
                .storage
                .doom_responses(&self.manifest_url, &written)
                .await
            {
                tracing::warn!(manifest_url = %self.manifest_url, error = %e, "dooming responses failed");
            }
        }
        tracing::warn!(manifest_url = %self.manifest_url, "update failed: {}", message);

        let _delivery = self.shared.hold_delivery();
        let notifier = self.notifier_all();
        for host in self.shared.master_hosts().iter().filter_map(Weak::upgrade) {
            host.clear_pending_master();
        }
        self.send_error(&notifier, &message);
    }

    fn announce_checking(&self) {
        let Some(group) = self.group.upgrade() else {
            return;
        };
        let _delivery = self.shared.hold_delivery();
        let hosts = self.shared.announce_checking();
        let notifier = self.notifier_for(&group, &hosts);
        drop(group);
        self.send(&notifier, AppCacheEvent::Checking);
    }

    fn notifier_for(&self, group: &AppCacheGroup, hosts: &[Weak<AppCacheHost>]) -> HostNotifier {
        let mut notifier = HostNotifier::new();
        notifier.add_hosts(&group.associated_hosts());
        let live: Vec<Arc<AppCacheHost>> = hosts.iter().filter_map(Weak::upgrade).collect();
        notifier.add_hosts(&live);
        notifier
    }

    fn notifier_all(&self) -> HostNotifier {
        match self.group.upgrade() {
            Some(group) => self.notifier_for(&group, &self.shared.recipients()),
            None => HostNotifier::new(),
        }
    }

    fn notify_all(&self, event: AppCacheEvent) {
        let _delivery = self.shared.hold_delivery();
        let notifier = self.notifier_all();
        self.send(&notifier, event);
    }

    fn send(&self, notifier: &HostNotifier, event: AppCacheEvent) {
        if self.shared.is_detached() || notifier.is_empty() {
            return;
        }
        tracing::trace!(manifest_url = %self.manifest_url, event = %event, "notifying hosts");
        notifier.send_event(&event);
    }

    fn send_error(&self, notifier: &HostNotifier, message: &str) {
        if self.shared.is_detached() || notifier.is_empty() {
            return;
        }
        notifier.send_log(LogLevel::Error, message);
        notifier.send_event(&AppCacheEvent::Error {
            message: message.to_string(),
        });
    }
}

fn copied_entry(kind: EntryKind, existing: Option<&AppCacheEntry>) -> Option<AppCacheEntry> {
    let existing = existing?;
    let response_id = existing.response_id?;
    Some(AppCacheEntry::with_response(
        kind,
        response_id,
        existing.response_size,
    ))
}

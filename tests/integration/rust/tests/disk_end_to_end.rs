//! Updates persisted through the disk store and restored after a restart.

use appcache::{
    AppCacheEvent, AppCacheService, CheckResponseResult, RecordingFrontend, ServiceContext,
    UpdateConfig,
};
use resource_fetcher::{MockFetcher, MockResponse};
use response_storage::DiskStorage;
use std::path::Path;
use std::sync::Arc;
use url::Url;

fn url(path: &str) -> Url {
    Url::parse("http://disk.test/site/").unwrap().join(path).unwrap()
}

fn fetcher(manifest: &str) -> Arc<MockFetcher> {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.set_response(&url("manifest"), MockResponse::manifest(manifest.to_string()));
    fetcher.set_response(&url("a.css"), MockResponse::ok("a {}"));
    fetcher.set_response(&url("b.js"), MockResponse::ok("b()"));
    fetcher.set_response(&url("page.html"), MockResponse::ok("<html>"));
    fetcher
}

async fn open(root: &Path, fetcher: Arc<MockFetcher>) -> (Arc<DiskStorage>, AppCacheService) {
    let storage = Arc::new(DiskStorage::open(root).await.unwrap());
    let context = ServiceContext::builder(storage.clone(), fetcher)
        .config(UpdateConfig::default().with_read_chunk_size(4))
        .build()
        .unwrap();
    (storage, AppCacheService::new(context))
}

#[tokio::test]
async fn test_cache_survives_restart_and_upgrades() {
    let dir = tempfile::tempdir().unwrap();
    let frontend = RecordingFrontend::new();

    let first_id = {
        let (_, service) = open(dir.path(), fetcher("CACHE MANIFEST\na.css\n")).await;
        let host = service.create_host(frontend.clone());
        let group = service
            .start_update(Some(&host), &url("manifest"), Some(url("page.html")))
            .await
            .unwrap();
        group.wait_for_idle().await;
        assert_eq!(frontend.events_for(host.host_id()).last(), Some(&AppCacheEvent::Cached));
        group.newest_complete_cache().unwrap().cache_id()
    };

    let (_, service) = open(dir.path(), fetcher("CACHE MANIFEST\na.css\nb.js\n")).await;
    let group = service.load_or_create_group(&url("manifest")).await.unwrap();
    let restored = group.newest_complete_cache().expect("restored from disk");
    assert_eq!(restored.cache_id(), first_id);
    assert!(restored.entry(&url("page.html")).unwrap().is_master());

    frontend.clear();
    let host = service.create_host(frontend.clone());
    host.associate_cache(Some(restored.clone()));
    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(
        frontend.events_for(host.host_id()).last(),
        Some(&AppCacheEvent::UpdateReady)
    );
    let newest = group.newest_complete_cache().unwrap();
    assert!(newest.entry(&url("b.js")).is_some());
    // The previous master entry is carried into the new version.
    assert!(newest.entry(&url("page.html")).unwrap().is_master());
}

#[tokio::test]
async fn test_stored_responses_verify_and_deletion_purges() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, service) = open(dir.path(), fetcher("CACHE MANIFEST\na.css\nb.js\n")).await;
    let frontend = RecordingFrontend::new();
    let host = service.create_host(frontend.clone());
    let group = service
        .start_update(Some(&host), &url("manifest"), None)
        .await
        .unwrap();
    group.wait_for_idle().await;

    let cache = group.newest_complete_cache().unwrap();
    for entry_url in [url("a.css"), url("b.js"), url("manifest")] {
        let response_id = cache.entry(&entry_url).unwrap().response_id.unwrap();
        let result = service
            .check_response(&url("manifest"), cache.cache_id(), response_id)
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::ResponseOk, "{}", entry_url);
    }

    service.delete_group(&url("manifest")).await.unwrap();
    assert_eq!(storage.doomed_responses().await.len(), 3);
    assert_eq!(storage.purge_doomed_responses().await.unwrap(), 3);
    assert!(service.get_all_info().await.unwrap().is_empty());
}

//! Requests arriving while an update is finishing, and cancellation.

use crate::common::{url, wait_until, Harness};
use appcache::{AppCacheGroup, AppCacheHost, InternalState, UpdateConfig, UpdateStatus};
use core_types::EntryKind;
use std::sync::Arc;
use std::time::Duration;

/// Runs a cache attempt and queues a second host while the manifest is
/// being re-validated.
async fn finish_with_queued_host(
    h: &Harness,
) -> (Arc<AppCacheGroup>, Arc<AppCacheHost>, Arc<AppCacheHost>) {
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\n");
    h.serve("explicit1", "one");
    h.serve("page2", "page two");
    h.fetcher.hold(&url("explicit1"));
    let first = h.host();

    let group = h.service.start_update(Some(&first), &url("manifest"), None).await.unwrap();
    h.fetcher.wait_for_requests(&url("explicit1"), 1).await;
    h.fetcher.hold(&url("manifest"));
    h.fetcher.release(&url("explicit1"));
    h.fetcher.wait_for_requests(&url("manifest"), 2).await;
    assert_eq!(group.job_state(), Some(InternalState::RefetchManifest));

    let second = h.host();
    group.start_update(Some(&second), Some(url("page2")));
    assert!(group.has_queued_updates());
    assert!(h.events(&second).is_empty());

    h.fetcher.release(&url("manifest"));
    group.wait_for_idle().await;
    (group, first, second)
}

#[tokio::test]
async fn test_host_queued_during_refetch_is_restarted_later() {
    let h = Harness::new();
    let (group, first, second) = finish_with_queued_host(&h).await;

    assert_eq!(
        h.events(&first),
        vec!["checking", "downloading", "progress", "progress", "cached"]
    );
    assert!(h.events(&second).is_empty());
    assert_eq!(h.scheduler.pending(), 1);
    assert!(!group.has_update_job());

    assert_eq!(h.scheduler.advance(Duration::from_millis(999)), 0);
    assert_eq!(h.scheduler.advance(Duration::from_millis(1)), 1);
    assert!(group.has_update_job());
    group.wait_for_idle().await;

    assert_eq!(h.events(&second), vec!["checking", "noupdate"]);
    let newest = group.newest_complete_cache().unwrap();
    assert!(newest.entry(&url("page2")).unwrap().is_master());
    assert_eq!(
        second.associated_cache().map(|c| c.cache_id()),
        Some(newest.cache_id())
    );
    assert!(!group.has_queued_updates());
}

#[tokio::test]
async fn test_dropped_queued_host_is_forgotten() {
    let h = Harness::new();
    let (group, _first, second) = finish_with_queued_host(&h).await;
    assert!(group.has_queued_updates());

    drop(second);
    assert!(!group.has_queued_updates());

    assert_eq!(h.scheduler.advance(Duration::from_secs(1)), 1);
    assert!(!group.has_update_job());
}

#[tokio::test]
async fn test_new_update_absorbs_queued_hosts() {
    let h = Harness::new();
    let (group, _first, second) = finish_with_queued_host(&h).await;

    group.start_update(None, None);
    assert!(!group.has_queued_updates());
    group.wait_for_idle().await;
    assert_eq!(h.events(&second), vec!["checking", "noupdate"]);

    // The deferred restart finds nothing left to do.
    assert_eq!(h.scheduler.run_pending(), 1);
    assert!(!group.has_update_job());
    assert_eq!(group.update_status(), UpdateStatus::Idle);
}

#[tokio::test]
async fn test_detach_silences_the_running_job() {
    let h = Harness::new();
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\n");
    h.serve("explicit1", "one");
    h.fetcher.hold(&url("manifest"));
    let host = h.host();

    let group = h.service.start_update(Some(&host), &url("manifest"), None).await.unwrap();
    h.fetcher.wait_for_requests(&url("manifest"), 1).await;
    group.detach();
    h.fetcher.release(&url("manifest"));
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(h.events(&host), vec!["checking"]);
    assert_eq!(group.update_status(), UpdateStatus::Idle);
    assert!(!group.has_update_job());
    assert!(group.newest_complete_cache().is_none());
    assert_eq!(h.fetcher.request_count(&url("explicit1")), 0);
}

#[tokio::test]
async fn test_detach_dooms_responses_already_written() {
    let h = Harness::with_config(UpdateConfig::default().with_max_concurrent_fetches(1));
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\nexplicit2\n");
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.fetcher.hold(&url("explicit2"));
    let host = h.host();

    let group = h.service.start_update(Some(&host), &url("manifest"), None).await.unwrap();
    h.fetcher.wait_for_requests(&url("explicit2"), 1).await;
    wait_until(|| h.storage.response_count() == 1).await;
    assert!(h.storage.doomed_responses().is_empty());

    group.detach();
    wait_until(|| h.storage.doomed_responses().len() == 1).await;
    assert_eq!(h.storage.purge_doomed_responses(), 1);
    assert_eq!(h.storage.response_count(), 0);
    assert!(h.storage.stored_group(&url("manifest")).is_none());
}

#[tokio::test]
async fn test_dropping_group_dooms_responses_already_written() {
    let h = Harness::with_config(UpdateConfig::default().with_max_concurrent_fetches(1));
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\nexplicit2\n");
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.fetcher.hold(&url("explicit2"));

    let group = h.service.start_update(None, &url("manifest"), None).await.unwrap();
    h.fetcher.wait_for_requests(&url("explicit2"), 1).await;
    wait_until(|| h.storage.response_count() == 1).await;

    drop(group);
    wait_until(|| h.storage.doomed_responses().len() == 1).await;
}

#[tokio::test]
async fn test_update_on_obsolete_group_is_ignored() {
    let h = Harness::new();
    let group = h
        .seed_cache("manifest", "CACHE MANIFEST\n", &[("explicit1", EntryKind::EXPLICIT)])
        .await;
    h.serve_status("manifest", 404);
    group.start_update(None, None);
    group.wait_for_idle().await;
    assert!(group.is_obsolete());

    let host = h.host();
    group.start_update(Some(&host), None);
    assert!(!group.has_update_job());
    assert!(h.events(&host).is_empty());
}

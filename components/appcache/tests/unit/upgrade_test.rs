//! Updates of a group that already has a complete cache.

use crate::common::{url, wait_until, Harness, LAST_MODIFIED};
use appcache::{AppCacheEvent, LogLevel, UpdateStatus};
use core_types::{EntryKind, Headers};
use resource_fetcher::MockResponse;
use std::sync::Arc;

const V1: &str = "CACHE MANIFEST\nexplicit1\n";
const V2: &str = "CACHE MANIFEST\nexplicit1\nexplicit2\n";

#[tokio::test]
async fn test_upgrade_reports_update_ready_and_swaps() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let old = group.newest_complete_cache().unwrap();
    let host = h.host();
    host.associate_cache(Some(old.clone()));

    h.serve_manifest("manifest", V2);
    h.serve("explicit1", "one, again");
    h.serve("explicit2", "two");
    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(
        h.events(&host),
        vec!["checking", "downloading", "progress", "progress", "progress", "updateready"]
    );
    let newest = group.newest_complete_cache().unwrap();
    assert!(newest.is_version_newer_than(&old));
    assert_eq!(newest.entry_count(), 3);
    assert!(host.is_swappable());
    assert!(group.old_caches().iter().any(|c| Arc::ptr_eq(c, &old)));

    assert!(host.swap_cache());
    assert!(Arc::ptr_eq(&host.associated_cache().unwrap(), &newest));
    assert!(!host.is_swappable());
    assert!(group.old_caches().is_empty());
    assert!(!old.has_associated_hosts());
}

#[tokio::test]
async fn test_manifest_not_modified_means_no_update() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let host = h.host();
    host.associate_cache(group.newest_complete_cache());
    h.fetcher
        .set_response(&url("manifest"), MockResponse::status(304));

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&host), vec!["checking", "noupdate"]);
    assert_eq!(h.fetcher.total_requests(), 1);
    let request = &h.fetcher.requests_for(&url("manifest"))[0];
    assert_eq!(request.headers.get("if-modified-since"), Some(LAST_MODIFIED));
}

#[tokio::test]
async fn test_identical_manifest_means_no_update() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let before = group.newest_complete_cache().unwrap();
    let host = h.host();
    host.associate_cache(Some(before.clone()));
    h.serve_manifest("manifest", V1);

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&host), vec!["checking", "noupdate"]);
    assert!(Arc::ptr_eq(&group.newest_complete_cache().unwrap(), &before));
    assert_eq!(h.fetcher.request_count(&url("explicit1")), 0);
}

#[tokio::test]
async fn test_fresh_entry_is_copied_without_a_request() {
    let h = Harness::new();
    let fresh = Headers::new().with("Cache-Control", "max-age=3600");
    let group = h
        .seed_cache_with("manifest", V1, vec![("explicit1", EntryKind::EXPLICIT, fresh)])
        .await;
    let old_response = group
        .newest_complete_cache()
        .unwrap()
        .entry(&url("explicit1"))
        .unwrap()
        .response_id;
    h.serve_manifest("manifest", V2);
    h.serve("explicit2", "two");

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.fetcher.request_count(&url("explicit1")), 0);
    let entry = group.newest_complete_cache().unwrap().entry(&url("explicit1")).unwrap();
    assert_eq!(entry.response_id, old_response);
}

#[tokio::test]
async fn test_fresh_entry_with_vary_is_refetched() {
    let h = Harness::new();
    let varying = Headers::new()
        .with("Cache-Control", "max-age=3600")
        .with("Vary", "Accept-Language");
    let group = h
        .seed_cache_with("manifest", V1, vec![("explicit1", EntryKind::EXPLICIT, varying)])
        .await;
    h.serve_manifest("manifest", V2);
    h.serve("explicit1", "one, again");
    h.serve("explicit2", "two");

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.fetcher.request_count(&url("explicit1")), 1);
}

#[tokio::test]
async fn test_stale_entry_revalidated_with_not_modified() {
    let h = Harness::new();
    let validators = Headers::new().with("Last-Modified", LAST_MODIFIED);
    let group = h
        .seed_cache_with("manifest", V1, vec![("explicit1", EntryKind::EXPLICIT, validators)])
        .await;
    let old_response = group
        .newest_complete_cache()
        .unwrap()
        .entry(&url("explicit1"))
        .unwrap()
        .response_id;
    h.serve_manifest("manifest", V2);
    h.fetcher
        .set_response(&url("explicit1"), MockResponse::status(304));
    h.serve("explicit2", "two");

    group.start_update(None, None);
    group.wait_for_idle().await;

    let request = &h.fetcher.requests_for(&url("explicit1"))[0];
    assert_eq!(request.headers.get("if-modified-since"), Some(LAST_MODIFIED));
    let entry = group.newest_complete_cache().unwrap().entry(&url("explicit1")).unwrap();
    assert_eq!(entry.response_id, old_response);
}

#[tokio::test]
async fn test_previous_master_entries_are_refetched() {
    let h = Harness::new();
    let group = h
        .seed_cache(
            "manifest",
            V1,
            &[
                ("explicit1", EntryKind::EXPLICIT),
                ("gone-page", EntryKind::MASTER),
                ("flaky-page", EntryKind::MASTER),
            ],
        )
        .await;
    let flaky_response = group
        .newest_complete_cache()
        .unwrap()
        .entry(&url("flaky-page"))
        .unwrap()
        .response_id;
    h.serve_manifest("manifest", V2);
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.serve_status("gone-page", 404);
    h.serve_status("flaky-page", 500);

    group.start_update(None, None);
    group.wait_for_idle().await;

    let newest = group.newest_complete_cache().unwrap();
    assert!(newest.entry(&url("gone-page")).is_none());
    let kept = newest.entry(&url("flaky-page")).unwrap();
    assert!(kept.is_master());
    assert_eq!(kept.response_id, flaky_response);
}

#[tokio::test]
async fn test_manifest_gone_makes_group_obsolete() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let host = h.host();
    host.associate_cache(group.newest_complete_cache());
    h.serve_status("manifest", 410);

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&host), vec!["checking", "obsolete"]);
    assert!(group.is_obsolete());
    assert!(group.newest_complete_cache().is_none());
    assert!(h.storage.stored_group(&url("manifest")).is_none());
    assert!(h.service.group(&url("manifest")).is_none());

    // The host keeps its cache until it swaps.
    assert!(host.associated_cache().is_some());
    assert!(host.swap_cache());
    assert!(host.associated_cache().is_none());
}

#[tokio::test]
async fn test_obsolete_storage_failure_is_an_error() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let before = group.newest_complete_cache().unwrap();
    let host = h.host();
    host.associate_cache(Some(before.clone()));
    h.serve_status("manifest", 404);
    h.storage.set_fail_make_obsolete(true);

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&host), vec!["checking", "error"]);
    assert!(!group.is_obsolete());
    assert!(Arc::ptr_eq(&group.newest_complete_cache().unwrap(), &before));
}

#[tokio::test]
async fn test_failed_upgrade_keeps_previous_cache() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let before = group.newest_complete_cache().unwrap();
    let host = h.host();
    host.associate_cache(Some(before.clone()));
    h.serve_manifest("manifest", V2);
    h.serve("explicit1", "one");
    h.serve_status("explicit2", 500);

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&host).last(), Some(&"error"));
    assert!(Arc::ptr_eq(&group.newest_complete_cache().unwrap(), &before));
    let stored = h.storage.stored_newest_cache(&url("manifest")).unwrap();
    assert_eq!(stored.cache_id, before.cache_id());
    assert!(!host.is_swappable());
}

#[tokio::test]
async fn test_commit_failure_dooms_new_responses() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let before = group.newest_complete_cache().unwrap();
    let host = h.host();
    host.associate_cache(Some(before.clone()));
    h.serve_manifest("manifest", V2);
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.storage.set_fail_store(true);

    group.start_update(None, None);
    group.wait_for_idle().await;

    match h.frontend.events_for(host.host_id()).last() {
        Some(AppCacheEvent::Error { message }) => {
            assert_eq!(message, "Failed to commit new cache to storage")
        }
        other => panic!("expected an error, got {:?}", other),
    }
    assert!(Arc::ptr_eq(&group.newest_complete_cache().unwrap(), &before));
    // Two resources plus the manifest were written and then abandoned.
    assert_eq!(h.storage.doomed_responses().len(), 3);
}

#[tokio::test]
async fn test_manifest_change_during_update_is_logged() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let host = h.host();
    host.associate_cache(group.newest_complete_cache());
    h.fetcher.set_sequence(
        &url("manifest"),
        vec![
            Ok(MockResponse::manifest(V2)),
            Ok(MockResponse::manifest("CACHE MANIFEST\nexplicit3\n")),
        ],
    );
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");

    group.start_update(None, None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&host).last(), Some(&"updateready"));
    assert!(h
        .frontend
        .logs()
        .iter()
        .any(|(ids, level, _)| *level == LogLevel::Warning && ids.contains(&host.host_id())));
    let newest = group.newest_complete_cache().unwrap();
    assert!(newest.entry(&url("explicit2")).is_some());
}

#[tokio::test]
async fn test_hosts_sharing_a_frontend_get_one_call_per_event() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let (first, second) = (h.host(), h.host());
    first.associate_cache(group.newest_complete_cache());
    second.associate_cache(group.newest_complete_cache());
    h.fetcher
        .set_response(&url("manifest"), MockResponse::status(304));

    group.start_update(None, None);
    group.wait_for_idle().await;

    let calls = h.frontend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, vec![first.host_id(), second.host_id()]);
    assert_eq!(calls[0].1, AppCacheEvent::Checking);
    assert_eq!(calls[1].1, AppCacheEvent::NoUpdate);
}

#[tokio::test]
async fn test_status_follows_the_job() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    h.serve_manifest("manifest", V2);
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.fetcher.hold(&url("explicit2"));

    group.start_update(None, None);
    assert_eq!(group.update_status(), UpdateStatus::Checking);
    h.fetcher.wait_for_requests(&url("explicit2"), 1).await;
    wait_until(|| group.update_status() == UpdateStatus::Downloading).await;

    h.fetcher.release(&url("explicit2"));
    group.wait_for_idle().await;
    assert_eq!(group.update_status(), UpdateStatus::Idle);
    assert!(!group.has_update_job());
}

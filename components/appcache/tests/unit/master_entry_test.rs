//! Hosts joining an update with master entries.

use crate::common::{url, wait_until, Harness};
use appcache::AppCacheEvent;
use core_types::EntryKind;
use std::sync::Arc;

const V1: &str = "CACHE MANIFEST\nexplicit1\n";

#[tokio::test]
async fn test_failed_joiner_master_only_affects_that_host() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let first = h.host();
    first.associate_cache(group.newest_complete_cache());
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\nexplicit2\n");
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.fetcher.hold(&url("explicit1"));

    group.start_update(None, None);
    h.fetcher.wait_for_requests(&url("explicit1"), 1).await;

    let second = h.host();
    group.start_update(Some(&second), Some(url("bad-page")));
    assert_eq!(h.events(&second), vec!["checking", "downloading"]);
    wait_until(|| h.events(&second).len() == 3).await;

    h.fetcher.release(&url("explicit1"));
    group.wait_for_idle().await;

    assert_eq!(h.events(&second), vec!["checking", "downloading", "error"]);
    match h.frontend.events_for(second.host_id()).last() {
        Some(AppCacheEvent::Error { message }) => assert_eq!(
            message,
            &format!("Master entry fetch failed (404) {}", url("bad-page"))
        ),
        other => panic!("expected an error, got {:?}", other),
    }
    assert_eq!(h.events(&first).last(), Some(&"updateready"));
    assert!(!h.events(&first).contains(&"error"));
    assert!(second.associated_cache().is_none());
    assert!(second.pending_master_url().is_none());
    assert!(group
        .newest_complete_cache()
        .unwrap()
        .entry(&url("bad-page"))
        .is_none());
}

#[tokio::test]
async fn test_joiner_master_matching_a_listed_entry() {
    let h = Harness::new();
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\n");
    h.serve("explicit1", "one");
    h.serve("page1", "page one");
    h.fetcher.hold(&url("explicit1"));
    let first = h.host();

    let group = h
        .service
        .start_update(Some(&first), &url("manifest"), Some(url("page1")))
        .await
        .unwrap();
    h.fetcher.wait_for_requests(&url("explicit1"), 1).await;

    let second = h.host();
    group.start_update(Some(&second), Some(url("explicit1")));
    h.fetcher.release(&url("explicit1"));
    group.wait_for_idle().await;

    let cache = group.newest_complete_cache().unwrap();
    let entry = cache.entry(&url("explicit1")).unwrap();
    assert!(entry.kind.contains(EntryKind::EXPLICIT | EntryKind::MASTER));
    assert_eq!(cache.entry_count(), 3);
    assert_eq!(h.fetcher.request_count(&url("explicit1")), 1);

    assert_eq!(h.events(&first).last(), Some(&"cached"));
    assert_eq!(h.events(&second).last(), Some(&"cached"));
    for host in [&first, &second] {
        assert!(Arc::ptr_eq(&host.associated_cache().unwrap(), &cache));
    }
}

#[tokio::test]
async fn test_joiner_without_master_only_gets_catch_up() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\nexplicit2\n");
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    h.fetcher.hold(&url("explicit2"));

    group.start_update(None, None);
    h.fetcher.wait_for_requests(&url("explicit2"), 1).await;
    let watcher = h.host();
    group.start_update(Some(&watcher), None);

    h.fetcher.release(&url("explicit2"));
    group.wait_for_idle().await;

    assert_eq!(h.events(&watcher), vec!["checking", "downloading"]);
    assert!(watcher.associated_cache().is_none());
}

#[tokio::test]
async fn test_early_joiner_receives_checking() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    h.serve_manifest("manifest", V1);
    let (first, second) = (h.host(), h.host());

    group.start_update(Some(&first), None);
    // Joins before the job task had a chance to run.
    group.start_update(Some(&second), None);
    group.wait_for_idle().await;

    assert_eq!(h.events(&first), vec!["checking", "noupdate"]);
    assert_eq!(h.events(&second), vec!["checking"]);
}

#[tokio::test]
async fn test_master_on_unchanged_manifest_creates_new_version() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let old = group.newest_complete_cache().unwrap();
    let existing = h.host();
    existing.associate_cache(Some(old.clone()));
    h.serve_manifest("manifest", V1);
    h.serve("page2", "page two");
    let newcomer = h.host();

    group.start_update(Some(&newcomer), Some(url("page2")));
    group.wait_for_idle().await;

    assert_eq!(h.events(&existing), vec!["checking", "noupdate"]);
    assert_eq!(h.events(&newcomer), vec!["checking", "noupdate"]);

    let newest = group.newest_complete_cache().unwrap();
    assert_ne!(newest.cache_id(), old.cache_id());
    assert!(newest.entry(&url("page2")).unwrap().is_master());
    assert!(newest.entry(&url("explicit1")).is_some());
    for host in [&existing, &newcomer] {
        assert!(Arc::ptr_eq(&host.associated_cache().unwrap(), &newest));
    }
    assert!(!existing.is_swappable());
    assert!(group.old_caches().is_empty());
}

#[tokio::test]
async fn test_failed_master_on_unchanged_manifest() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let old = group.newest_complete_cache().unwrap();
    let existing = h.host();
    existing.associate_cache(Some(old.clone()));
    h.serve_manifest("manifest", V1);
    let newcomer = h.host();

    group.start_update(Some(&newcomer), Some(url("missing-page")));
    group.wait_for_idle().await;

    assert_eq!(h.events(&newcomer), vec!["checking", "error"]);
    assert_eq!(h.events(&existing), vec!["checking", "noupdate"]);
    assert!(Arc::ptr_eq(&group.newest_complete_cache().unwrap(), &old));
}

#[tokio::test]
async fn test_upgrade_survives_a_failed_master() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let existing = h.host();
    existing.associate_cache(group.newest_complete_cache());
    h.serve_manifest("manifest", "CACHE MANIFEST\nexplicit1\nexplicit2\n");
    h.serve("explicit1", "one");
    h.serve("explicit2", "two");
    let newcomer = h.host();

    group.start_update(Some(&newcomer), Some(url("missing-page")));
    group.wait_for_idle().await;

    assert_eq!(h.events(&existing).last(), Some(&"updateready"));
    assert_eq!(h.events(&newcomer).last(), Some(&"error"));
    assert_eq!(
        h.events(&newcomer).iter().filter(|n| **n == "error").count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joiners_get_catch_up_before_job_events() {
    let h = Harness::new();
    let listed: Vec<String> = (0..40).map(|i| format!("explicit{}", i)).collect();
    h.serve_manifest("manifest", &format!("CACHE MANIFEST\n{}\n", listed.join("\n")));
    for path in &listed {
        h.serve(path, "listed");
    }
    let starter = h.host();
    let group = h.service.start_update(Some(&starter), &url("manifest"), None).await.unwrap();
    h.fetcher.wait_for_requests(&url("explicit0"), 1).await;

    let mut joiners = Vec::new();
    for i in 0..20 {
        let page = format!("page{}", i);
        h.serve(&page, "page");
        let host = h.host();
        group.start_update(Some(&host), Some(url(&page)));
        joiners.push(host);
        tokio::task::yield_now().await;
    }
    group.wait_for_idle().await;

    for host in &joiners {
        let events = h.events(host);
        if events.is_empty() {
            continue;
        }
        assert_eq!(&events[..2], &["checking", "downloading"], "events: {:?}", events);
        assert!(!events[2..].contains(&"checking"));
        assert!(!events[2..].contains(&"downloading"));
    }
}

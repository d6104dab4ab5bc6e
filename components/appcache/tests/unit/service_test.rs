//! Service-level lookups, verification and deletion.

use crate::common::{url, Harness};
use appcache::{AppCacheError, CheckResponseResult};
use core_types::{AppCacheEntry, CacheId, CacheRecord, EntryKind, ResponseId, ResponseInfo, Headers};
use response_storage::ResponseStorage;
use std::sync::Arc;
use url::Url;

const V1: &str = "CACHE MANIFEST\nexplicit1\n";

#[tokio::test]
async fn test_live_group_is_shared() {
    let h = Harness::new();
    let a = h.service.load_or_create_group(&url("manifest")).await.unwrap();
    let b = h.service.load_or_create_group(&url("manifest")).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.newest_complete_cache().is_none());
}

#[tokio::test]
async fn test_unsupported_manifest_scheme() {
    let h = Harness::new();
    let manifest = Url::parse("ftp://mockhost/files/manifest").unwrap();
    let err = h.service.load_or_create_group(&manifest).await.unwrap_err();
    assert!(matches!(err, AppCacheError::Manifest(_)));
}

#[tokio::test]
async fn test_load_cache_returns_the_live_cache() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
    let newest = group.newest_complete_cache().unwrap();

    let loaded = h.service.load_cache(newest.cache_id()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&loaded, &newest));
    assert!(h.service.load_cache(CacheId(999)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_main_resource_lookup() {
    let h = Harness::new();
    let group = h
        .seed_cache(
            "manifest",
            V1,
            &[("explicit1", EntryKind::EXPLICIT), ("page", EntryKind::MASTER)],
        )
        .await;
    let cache_id = group.newest_complete_cache().unwrap().cache_id();

    assert!(h.service.can_handle_main_resource_offline(&url("page")).await.unwrap());
    assert!(!h.service.can_handle_main_resource_offline(&url("elsewhere")).await.unwrap());
    let found = h.service.find_main_response(&url("page"), None).await.unwrap().unwrap();
    assert_eq!(found.cache_id, cache_id);
    assert!(!found.is_fallback());

    h.service.mark_entry_as_foreign(&url("page"), cache_id).await.unwrap();
    assert!(!h.service.can_handle_main_resource_offline(&url("page")).await.unwrap());
    let live = group.newest_complete_cache().unwrap();
    assert!(live.entry(&url("page")).unwrap().is_foreign());
}

#[tokio::test]
async fn test_delete_group_removes_storage_and_live_state() {
    let h = Harness::new();
    let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;

    h.service.delete_group(&url("manifest")).await.unwrap();

    assert!(group.is_obsolete());
    assert!(h.service.group(&url("manifest")).is_none());
    assert!(h.storage.stored_group(&url("manifest")).is_none());
    assert!(!h.storage.doomed_responses().is_empty());
}

#[tokio::test]
async fn test_deleting_an_unknown_group_succeeds() {
    let h = Harness::new();
    h.service.delete_group(&url("never-stored")).await.unwrap();
}

#[tokio::test]
async fn test_delete_cancels_a_running_update() {
    let h = Harness::new();
    let host = h.host();
    h.fetcher.hold(&url("manifest"));
    let group = h.service.start_update(Some(&host), &url("manifest"), None).await.unwrap();
    h.fetcher.wait_for_requests(&url("manifest"), 1).await;

    h.service.delete_group(&url("manifest")).await.unwrap();
    h.fetcher.release(&url("manifest"));
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(!group.has_update_job());
    assert_eq!(h.events(&host), vec!["checking"]);
}

#[tokio::test]
async fn test_info_listing_and_origin_deletion() {
    let h = Harness::new();
    h.seed_cache("app1/manifest", V1, &[]).await;
    h.seed_cache("app2/manifest", V1, &[]).await;

    let info = h.service.get_all_info().await.unwrap();
    assert_eq!(info.len(), 2);
    assert_eq!(info.usage_by_origin().len(), 1);

    let other = Url::parse("http://elsewhere.example/").unwrap();
    assert_eq!(h.service.delete_for_origin(&other).await.unwrap(), 0);
    assert_eq!(h.service.delete_for_origin(&url("anything")).await.unwrap(), 2);
    assert!(h.service.get_all_info().await.unwrap().is_empty());
}

mod check_response_tests {
    use super::*;

    #[tokio::test]
    async fn test_intact_response() {
        let h = Harness::new();
        let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
        let cache = group.newest_complete_cache().unwrap();
        let response_id = cache.entry(&url("explicit1")).unwrap().response_id.unwrap();

        let result = h
            .service
            .check_response(&url("manifest"), cache.cache_id(), response_id)
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::ResponseOk);
        assert!(h.storage.stored_group(&url("manifest")).is_some());
    }

    #[tokio::test]
    async fn test_response_from_older_cache() {
        let h = Harness::new();
        h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;

        let result = h
            .service
            .check_response(&url("manifest"), CacheId(999), ResponseId(999))
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::ResponseOutOfDate);
        assert!(h.storage.stored_group(&url("manifest")).is_some());
    }

    #[tokio::test]
    async fn test_group_without_cache() {
        let h = Harness::new();
        let result = h
            .service
            .check_response(&url("manifest"), CacheId(1), ResponseId(1))
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::ManifestOutOfDate);
    }

    #[tokio::test]
    async fn test_missing_entry_deletes_group() {
        let h = Harness::new();
        let group = h.seed_cache("manifest", V1, &[("explicit1", EntryKind::EXPLICIT)]).await;
        let cache_id = group.newest_complete_cache().unwrap().cache_id();

        let result = h
            .service
            .check_response(&url("manifest"), cache_id, ResponseId(999))
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::EntryNotFound);
        assert!(h.storage.stored_group(&url("manifest")).is_none());
        assert!(group.is_obsolete());
    }

    /// Stores a cache whose single entry points at `response_id` with
    /// `recorded_size`.
    async fn store_damaged(h: &Harness, response_id: ResponseId, recorded_size: u64) -> CacheId {
        let manifest_url = url("manifest");
        let loaded = h.storage.load_or_create_group(&manifest_url).await.unwrap();
        let cache_id = h.storage.new_cache_id().await.unwrap();
        let mut record = CacheRecord::new(cache_id, loaded.group.group_id);
        record.add_or_modify_entry(
            url("explicit1"),
            AppCacheEntry::with_response(EntryKind::EXPLICIT, response_id, recorded_size),
        );
        h.storage
            .store_group_and_newest_cache(&loaded.group, &record)
            .await
            .unwrap();
        cache_id
    }

    #[tokio::test]
    async fn test_size_mismatch_deletes_group() {
        let h = Harness::new();
        let response_id = h
            .storage
            .insert_response(ResponseInfo::new(200, Headers::new()), "twelve bytes");
        let cache_id = store_damaged(&h, response_id, 999).await;

        let result = h
            .service
            .check_response(&url("manifest"), cache_id, response_id)
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::UnexpectedDataSize);
        assert!(h.storage.stored_group(&url("manifest")).is_none());
    }

    #[tokio::test]
    async fn test_unreadable_response_deletes_group() {
        let h = Harness::new();
        let cache_id = store_damaged(&h, ResponseId(4242), 10).await;

        let result = h
            .service
            .check_response(&url("manifest"), cache_id, ResponseId(4242))
            .await
            .unwrap();
        assert_eq!(result, CheckResponseResult::ReadHeadersError);
        assert!(h.storage.stored_group(&url("manifest")).is_none());
    }
}

//! Main-resource lookup shared by the storage backends.

use core_types::{CacheRecord, GroupRecord};
use url::Url;

use crate::traits::MainResponse;

/// Picks the cached response that can serve a navigation to `url`.
///
/// Candidates are ranked with the preferred manifest first, then by most
/// recent update. An exact, non-foreign entry wins over any fallback. For
/// fallbacks the longest matching namespace wins across all caches; a cache
/// whose online whitelist covers `url` is skipped.
pub fn find_main_response<'a, I>(url: &Url, preferred_manifest_url: Option<&Url>, candidates: I) -> Option<MainResponse>
where
    I: IntoIterator<Item = (&'a GroupRecord, &'a CacheRecord)>,
{
    let mut ranked: Vec<(&GroupRecord, &CacheRecord)> = candidates.into_iter().collect();
    ranked.sort_by(|(ga, ca), (gb, cb)| {
        let preferred_a = Some(&ga.manifest_url) == preferred_manifest_url;
        let preferred_b = Some(&gb.manifest_url) == preferred_manifest_url;
        preferred_b
            .cmp(&preferred_a)
            .then(cb.update_time.cmp(&ca.update_time))
            .then(cb.cache_id.cmp(&ca.cache_id))
    });

    for (group, cache) in &ranked {
        if let Some(entry) = cache.entry(url) {
            if entry.is_foreign() || !entry.has_response_id() {
                continue;
            }
            return Some(MainResponse {
                manifest_url: group.manifest_url.clone(),
                group_id: group.group_id,
                cache_id: cache.cache_id,
                entry_url: url.clone(),
                entry: *entry,
                namespace_url: None,
            });
        }
    }

    let mut best: Option<MainResponse> = None;
    let mut best_len = 0;
    for (group, cache) in &ranked {
        if cache.is_in_online_whitelist(url) {
            continue;
        }
        let Some(namespace) = cache.find_fallback_namespace(url) else {
            continue;
        };
        let len = namespace.namespace_url.as_str().len();
        if best.is_some() && len <= best_len {
            continue;
        }
        let Some(entry) = cache.entry(&namespace.target_url) else {
            continue;
        };
        if !entry.has_response_id() {
            continue;
        }
        best_len = len;
        best = Some(MainResponse {
            manifest_url: group.manifest_url.clone(),
            group_id: group.group_id,
            cache_id: cache.cache_id,
            entry_url: namespace.target_url.clone(),
            entry: *entry,
            namespace_url: Some(namespace.namespace_url.clone()),
        });
    }
    best
}

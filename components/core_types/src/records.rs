//! Persistable group and cache records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::{AppCacheEntry, CacheId, FallbackNamespace, GroupId, Manifest, ResponseId};

/// Serialized origin of a URL, e.g. `http://example.com:8080`.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Stored state of one cache group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group identity.
    pub group_id: GroupId,
    /// Manifest URL the group is keyed on.
    pub manifest_url: Url,
    /// Origin of the manifest URL.
    pub origin: String,
    /// When the group was first stored.
    pub creation_time: DateTime<Utc>,
    /// Last time the group was loaded.
    pub last_access_time: DateTime<Utc>,
}

impl GroupRecord {
    /// Creates a record for a group created now.
    pub fn new(group_id: GroupId, manifest_url: Url) -> Self {
        let now = Utc::now();
        Self {
            group_id,
            origin: origin_of(&manifest_url),
            manifest_url,
            creation_time: now,
            last_access_time: now,
        }
    }
}

/// Stored state of one cache snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Cache identity.
    pub cache_id: CacheId,
    /// Owning group.
    pub group_id: GroupId,
    /// Entries keyed by URL.
    pub entries: BTreeMap<Url, AppCacheEntry>,
    /// Fallback namespaces copied from the manifest.
    pub fallback_namespaces: Vec<FallbackNamespace>,
    /// Online whitelist namespaces copied from the manifest.
    pub online_whitelist: Vec<Url>,
    /// Whether every URL not cached may go to the network.
    pub online_whitelist_all: bool,
    /// When this version was produced.
    pub update_time: DateTime<Utc>,
}

impl CacheRecord {
    /// Creates an empty record.
    pub fn new(cache_id: CacheId, group_id: GroupId) -> Self {
        Self {
            cache_id,
            group_id,
            entries: BTreeMap::new(),
            fallback_namespaces: Vec::new(),
            online_whitelist: Vec::new(),
            online_whitelist_all: false,
            update_time: Utc::now(),
        }
    }

    /// Copies the namespace tables of `manifest`.
    pub fn initialize_with_manifest(&mut self, manifest: &Manifest) {
        self.fallback_namespaces = manifest.fallback_namespaces.clone();
        self.online_whitelist = manifest.online_whitelist.clone();
        self.online_whitelist_all = manifest.online_whitelist_all;
    }

    /// Adds an entry or merges role bits into an existing one.
    ///
    /// Returns `true` when the URL was not present before. An existing
    /// response id is kept unless it was still missing.
    pub fn add_or_modify_entry(&mut self, url: Url, entry: AppCacheEntry) -> bool {
        match self.entries.get_mut(&url) {
            Some(existing) => {
                existing.add_kind(entry.kind);
                if existing.response_id.is_none() {
                    existing.response_id = entry.response_id;
                    existing.response_size = entry.response_size;
                }
                false
            }
            None => {
                self.entries.insert(url, entry);
                true
            }
        }
    }

    /// Entry for `url`.
    pub fn entry(&self, url: &Url) -> Option<&AppCacheEntry> {
        self.entries.get(url)
    }

    /// Entry pointing at `response_id`.
    pub fn entry_with_response_id(&self, response_id: ResponseId) -> Option<(&Url, &AppCacheEntry)> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.response_id == Some(response_id))
    }

    /// URL and entry of the manifest.
    pub fn manifest_entry(&self) -> Option<(&Url, &AppCacheEntry)> {
        self.entries.iter().find(|(_, entry)| entry.is_manifest())
    }

    /// Every response id referenced by this cache.
    pub fn response_ids(&self) -> Vec<ResponseId> {
        self.entries
            .values()
            .filter_map(|entry| entry.response_id)
            .collect()
    }

    /// Total stored body size.
    pub fn cache_size(&self) -> u64 {
        self.entries.values().map(|entry| entry.response_size).sum()
    }

    /// True when `url` falls inside an online whitelist namespace.
    pub fn is_in_online_whitelist(&self, url: &Url) -> bool {
        self.online_whitelist
            .iter()
            .any(|ns| url.as_str().starts_with(ns.as_str()))
    }

    /// Longest fallback namespace covering `url`.
    pub fn find_fallback_namespace(&self, url: &Url) -> Option<&FallbackNamespace> {
        self.fallback_namespaces
            .iter()
            .filter(|ns| ns.matches(url))
            .max_by_key(|ns| ns.namespace_url.as_str().len())
    }
}

/// Summary of one group, as listed by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCacheInfo {
    /// Manifest URL of the group.
    pub manifest_url: Url,
    /// Group identity.
    pub group_id: GroupId,
    /// Newest cache identity.
    pub cache_id: CacheId,
    /// When the group was created.
    pub creation_time: DateTime<Utc>,
    /// Last time the group was loaded.
    pub last_access_time: DateTime<Utc>,
    /// When the newest cache was produced.
    pub last_update_time: DateTime<Utc>,
    /// Total stored size of the newest cache.
    pub size: u64,
}

/// Every stored group, grouped by origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCacheInfoCollection {
    /// Infos keyed by serialized origin.
    pub infos_by_origin: BTreeMap<String, Vec<AppCacheInfo>>,
}

impl AppCacheInfoCollection {
    /// Adds an info under its manifest origin.
    pub fn push(&mut self, info: AppCacheInfo) {
        self.infos_by_origin
            .entry(origin_of(&info.manifest_url))
            .or_default()
            .push(info);
    }

    /// Summed size per origin.
    pub fn usage_by_origin(&self) -> BTreeMap<String, u64> {
        self.infos_by_origin
            .iter()
            .map(|(origin, infos)| (origin.clone(), infos.iter().map(|i| i.size).sum()))
            .collect()
    }

    /// Number of groups listed.
    pub fn len(&self) -> usize {
        self.infos_by_origin.values().map(Vec::len).sum()
    }

    /// True when nothing is listed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

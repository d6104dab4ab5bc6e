//! Parsed manifest model and the default manifest parser.
//!
//! The update engine treats parsing as a collaborator behind
//! [`ManifestParser`]; [`DefaultManifestParser`] understands the classic
//! `CACHE MANIFEST` text format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

use crate::error::{ManifestError, ManifestResult};

const SIGNATURE: &str = "CACHE MANIFEST";

/// Maps a URL prefix to the resource served when the prefix is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallbackNamespace {
    /// URL prefix covered by this namespace.
    pub namespace_url: Url,
    /// Resource served for URLs under the prefix.
    pub target_url: Url,
}

impl FallbackNamespace {
    /// Creates a namespace.
    pub fn new(namespace_url: Url, target_url: Url) -> Self {
        Self {
            namespace_url,
            target_url,
        }
    }

    /// True when `url` falls under this namespace.
    pub fn matches(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.namespace_url.as_str())
    }
}

/// The resource list of one cache version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// URLs named in the CACHE section.
    pub explicit_urls: BTreeSet<Url>,
    /// FALLBACK section, in manifest order.
    pub fallback_namespaces: Vec<FallbackNamespace>,
    /// URL prefixes from the NETWORK section.
    pub online_whitelist: Vec<Url>,
    /// `*` appeared in the NETWORK section.
    pub online_whitelist_all: bool,
}

impl Manifest {
    /// Fallback target URLs, in manifest order.
    pub fn fallback_targets(&self) -> impl Iterator<Item = &Url> {
        self.fallback_namespaces.iter().map(|ns| &ns.target_url)
    }
}

/// Turns manifest bytes into a [`Manifest`].
pub trait ManifestParser: Send + Sync {
    /// Parses `data` fetched from `manifest_url`.
    fn parse(&self, manifest_url: &Url, data: &[u8]) -> ManifestResult<Manifest>;
}

/// Parser for the `CACHE MANIFEST` text format.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultManifestParser;

impl ManifestParser for DefaultManifestParser {
    fn parse(&self, manifest_url: &Url, data: &[u8]) -> ManifestResult<Manifest> {
        parse_manifest(manifest_url, data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Explicit,
    Fallback,
    Network,
    Unknown,
}

/// Parses manifest text.
///
/// Lines that cannot be used (bad URLs, disallowed schemes, cross-origin
/// fallback entries) are skipped; only a missing signature fails the parse.
pub fn parse_manifest(manifest_url: &Url, data: &[u8]) -> ManifestResult<Manifest> {
    let text = String::from_utf8_lossy(data);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let rest = text
        .strip_prefix(SIGNATURE)
        .ok_or(ManifestError::MissingSignature)?;
    if let Some(c) = rest.chars().next() {
        if !matches!(c, ' ' | '\t' | '\r' | '\n') {
            return Err(ManifestError::MissingSignature);
        }
    }

    let mut manifest = Manifest::default();
    let mut section = Section::Explicit;

    // The remainder of the signature line is ignored.
    for raw in rest.split(['\r', '\n']).skip(1) {
        let line = raw.trim_matches([' ', '\t']);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.ends_with(':') {
            section = match line {
                "CACHE:" => Section::Explicit,
                "FALLBACK:" => Section::Fallback,
                "NETWORK:" => Section::Network,
                _ => Section::Unknown,
            };
            continue;
        }

        let mut tokens = line.split([' ', '\t']).filter(|t| !t.is_empty());
        let Some(first) = tokens.next() else {
            continue;
        };

        match section {
            Section::Unknown => {}
            Section::Explicit => {
                let Some(url) = resolve(manifest_url, first) else {
                    continue;
                };
                if manifest_url.scheme() == "https" && url.scheme() != manifest_url.scheme() {
                    continue;
                }
                manifest.explicit_urls.insert(url);
            }
            Section::Network => {
                if first == "*" {
                    manifest.online_whitelist_all = true;
                } else if let Some(url) = resolve(manifest_url, first) {
                    manifest.online_whitelist.push(url);
                }
            }
            Section::Fallback => {
                let Some(second) = tokens.next() else {
                    continue;
                };
                let (Some(namespace_url), Some(target_url)) =
                    (resolve(manifest_url, first), resolve(manifest_url, second))
                else {
                    continue;
                };
                let origin = manifest_url.origin();
                if namespace_url.origin() != origin || target_url.origin() != origin {
                    continue;
                }
                manifest
                    .fallback_namespaces
                    .push(FallbackNamespace::new(namespace_url, target_url));
            }
        }
    }

    Ok(manifest)
}

fn resolve(base: &Url, token: &str) -> Option<Url> {
    let mut url = base.join(token).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type for OCI image indices.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// The MIME type for OCI image manifests.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// The MIME type for Docker Registry v2 manifest lists.
pub const MEDIA_TYPE_DOCKER_INDEX: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type for Docker Registry v2 manifests.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// The Accept header sent when negotiating manifests and indices.
pub const ACCEPT_MANIFEST_TYPES: &str = concat!(
    "application/vnd.oci.image.index.v1+json",
    ", ",
    "application/vnd.oci.image.manifest.v1+json",
    ", ",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    ", ",
    "application/vnd.docker.distribution.manifest.v2+json"
);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A content descriptor: media type, digest, and size in bytes.
///
/// A `size` of zero is treated as unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Descriptor {
    /// The media type of the referenced content.
    pub media_type: String,

    /// The `sha256:<hex>` digest of the referenced content.
    pub digest: String,

    /// The size of the referenced content in bytes.
    pub size: i64,
}

/// A flat image manifest: one config descriptor plus an ordered layer list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageManifest {
    /// The manifest's own media type, when the document carries one.
    pub media_type: String,

    /// The configuration blob descriptor.
    pub config: Descriptor,

    /// The layer blob descriptors, in order.
    pub layers: Vec<Descriptor>,
}

/// An image index listing platform-specific manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageIndex {
    /// The manifest entries in the index.
    pub manifests: Vec<IndexEntry>,
}

/// One entry of an image index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexEntry {
    /// The media type of the referenced manifest.
    pub media_type: String,

    /// The digest of the referenced manifest.
    pub digest: String,

    /// The platform the referenced manifest targets.
    pub platform: PlatformSpec,
}

/// The platform fields of an index entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSpec {
    /// The CPU architecture, e.g. `amd64`.
    pub architecture: String,

    /// The operating system, e.g. `linux`.
    pub os: String,
}

/// A blob scheduled for download: its digest and expected size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    /// The `sha256:<hex>` digest of the blob.
    pub digest: String,

    /// The expected size in bytes; zero or negative means unknown.
    pub size: i64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageManifest {
    /// Whether a decoded document plausibly is a manifest. Used by the
    /// auto-detect fallback for responses with unknown content types.
    pub fn looks_like_manifest(&self) -> bool {
        !self.config.digest.is_empty() || !self.layers.is_empty()
    }

    /// Enumerates the blobs this manifest references: the config (when
    /// present) followed by the layers, deduplicated by digest.
    pub fn blob_items(&self) -> Vec<BlobItem> {
        let mut items = Vec::with_capacity(self.layers.len() + 1);
        if !self.config.digest.is_empty() {
            items.push(BlobItem {
                digest: self.config.digest.clone(),
                size: self.config.size,
            });
        }
        for layer in &self.layers {
            items.push(BlobItem {
                digest: layer.digest.clone(),
                size: layer.size,
            });
        }
        dedupe_blobs(items)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Removes duplicate digests, keeping the first observed size.
pub fn dedupe_blobs(items: Vec<BlobItem>) -> Vec<BlobItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.digest.clone()))
        .collect()
}

/// Selects the manifest digest for a platform from an index.
///
/// Matches `(linux, <last segment of platform>)` case-insensitively; when
/// several entries match, the lexicographically smallest digest wins.
pub fn select_platform_digest(index: &ImageIndex, platform: &str) -> Option<String> {
    let target_arch = platform.rsplit('/').next().unwrap_or(platform);
    let target_os = "linux";

    let mut candidates: Vec<&str> = index
        .manifests
        .iter()
        .filter(|entry| {
            entry.platform.os.eq_ignore_ascii_case(target_os)
                && entry.platform.architecture.eq_ignore_ascii_case(target_arch)
        })
        .map(|entry| entry.digest.as_str())
        .collect();
    candidates.sort_unstable();
    candidates.first().map(|digest| digest.to_string())
}

/// Strips any parameters from a Content-Type value, e.g.
/// `application/foo; charset=utf-8` becomes `application/foo`.
pub fn strip_media_type_params(content_type: &str) -> &str {
    match content_type.split_once(';') {
        Some((media_type, _)) => media_type.trim(),
        None => content_type.trim(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

use std::path::Path;

use futures::StreamExt;
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Method, StatusCode,
};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
};
use tokio_util::sync::CancellationToken;

use crate::{pull::Progress, ModelpackError, ModelpackResult};

use super::{
    auth, header_value, select_platform_digest, strip_media_type_params, HttpTransport,
    ImageIndex, ImageManifest, ACCEPT_MANIFEST_TYPES, MEDIA_TYPE_DOCKER_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How much of an undecodable manifest body is quoted in the error.
const BODY_PREFIX_LIMIT: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A pull-side client for one registry.
///
/// Handles manifest negotiation (including index platform selection and the
/// auto-detect fallback for misadvertised content types) and resumable,
/// integrity-checked blob downloads.
#[derive(Debug)]
pub struct RegistryClient {
    transport: HttpTransport,
    registry: String,
}

/// A resolved image manifest together with the raw bytes it was decoded from.
/// The raw bytes are what gets staged on disk.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// The decoded manifest.
    pub manifest: ImageManifest,

    /// The manifest document exactly as the registry served it.
    pub raw: Vec<u8>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryClient {
    /// Creates a client for the given registry base URL.
    pub fn new(registry: impl Into<String>, transport: HttpTransport) -> Self {
        Self {
            transport,
            registry: registry.into(),
        }
    }

    /// Resolves a bearer token for pulling `repository`; see [`auth::resolve_token`].
    pub async fn resolve_token(
        &self,
        repository: &str,
        reference: &str,
        cancel: &CancellationToken,
    ) -> ModelpackResult<String> {
        auth::resolve_token(&self.transport, &self.registry, repository, reference, cancel).await
    }

    /// Resolves `reference` to a flat image manifest.
    ///
    /// When the registry answers with an index, the entry matching `platform`
    /// is selected (lexicographically smallest digest on ties) and fetched.
    /// Unknown content types fall back to body-shape detection before the
    /// pull fails.
    pub async fn resolve_manifest(
        &self,
        repository: &str,
        reference: &str,
        token: &str,
        platform: &str,
        cancel: &CancellationToken,
    ) -> ModelpackResult<ResolvedManifest> {
        let (raw, media_type) = self
            .fetch_manifest_bytes(repository, reference, token, cancel)
            .await?;

        match media_type.as_str() {
            MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => {
                let manifest: ImageManifest = serde_json::from_slice(&raw)?;
                Ok(ResolvedManifest { manifest, raw })
            }
            MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_INDEX => {
                let index: ImageIndex = serde_json::from_slice(&raw)?;
                let chosen = select_platform_digest(&index, platform)
                    .ok_or_else(|| ModelpackError::NoPlatformMatch(platform.to_string()))?;
                tracing::debug!(digest = %chosen, platform, "selected platform manifest");

                let (raw, media_type) = self
                    .fetch_manifest_bytes(repository, &chosen, token, cancel)
                    .await?;
                if media_type != MEDIA_TYPE_OCI_MANIFEST
                    && media_type != MEDIA_TYPE_DOCKER_MANIFEST
                {
                    return Err(ModelpackError::UnsupportedManifestType {
                        media_type,
                        body_prefix: body_prefix(&raw),
                    });
                }
                let manifest: ImageManifest = serde_json::from_slice(&raw)?;
                Ok(ResolvedManifest { manifest, raw })
            }
            _ => {
                self.detect_manifest(repository, token, platform, raw, media_type, cancel)
                    .await
            }
        }
    }

    /// Body-based fallback for responses whose content type is neither a
    /// manifest nor an index. Real registries occasionally misadvertise.
    async fn detect_manifest(
        &self,
        repository: &str,
        token: &str,
        platform: &str,
        raw: Vec<u8>,
        media_type: String,
        cancel: &CancellationToken,
    ) -> ModelpackResult<ResolvedManifest> {
        tracing::debug!(%media_type, "unexpected content type, attempting auto-detect");

        if let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&raw) {
            if manifest.looks_like_manifest() {
                return Ok(ResolvedManifest { manifest, raw });
            }
        }

        if let Ok(index) = serde_json::from_slice::<ImageIndex>(&raw) {
            if !index.manifests.is_empty() {
                let chosen = select_platform_digest(&index, platform)
                    .ok_or_else(|| ModelpackError::NoPlatformMatch(platform.to_string()))?;
                tracing::debug!(digest = %chosen, platform, "selected platform manifest (fallback)");

                let (raw, _) = self
                    .fetch_manifest_bytes(repository, &chosen, token, cancel)
                    .await?;
                let manifest: ImageManifest = serde_json::from_slice(&raw)?;
                return Ok(ResolvedManifest { manifest, raw });
            }
        }

        Err(ModelpackError::UnsupportedManifestType {
            media_type,
            body_prefix: body_prefix(&raw),
        })
    }

    /// Fetches a manifest document and returns its bytes and effective media
    /// type (parameters stripped; empty types leniently treated as OCI
    /// manifests).
    async fn fetch_manifest_bytes(
        &self,
        repository: &str,
        reference: &str,
        token: &str,
        cancel: &CancellationToken,
    ) -> ModelpackResult<(Vec<u8>, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry.trim_end_matches('/'),
            repository,
            reference
        );
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_MANIFEST_TYPES));
        if !token.is_empty() {
            headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }

        let response = self.transport.execute(Method::GET, &url, headers, cancel).await?;
        if response.status() != StatusCode::OK {
            return Err(ModelpackError::UnexpectedStatus {
                context: "fetching manifest",
                status: response.status(),
            });
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(strip_media_type_params)
            .filter(|value| !value.is_empty())
            .unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        let raw = response.bytes().await?.to_vec();

        Ok((raw, media_type))
    }

    /// Downloads one blob into `blobs_dir` as `sha256-<hex>`, resuming a
    /// `.part` file when one exists and verifying the streamed content
    /// against the digest before the atomic rename.
    pub async fn download_blob(
        &self,
        repository: &str,
        digest: &str,
        token: &str,
        blobs_dir: &Path,
        expected_size: i64,
        progress: Option<&Progress>,
        cancel: &CancellationToken,
    ) -> ModelpackResult<()> {
        let hex_hash = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| ModelpackError::UnsupportedDigest(digest.to_string()))?;
        let final_path = blobs_dir.join(format!("sha256-{hex_hash}"));
        let part_path = blobs_dir.join(format!("sha256-{hex_hash}.part"));

        if let Ok(meta) = fs::metadata(&final_path).await {
            if expected_size <= 0 || meta.len() as i64 >= expected_size {
                tracing::debug!(path = %final_path.display(), "blob exists, skipping");
                return Ok(());
            }
        }

        // A full-size partial may already be the finished blob.
        if expected_size > 0 {
            if let Ok(meta) = fs::metadata(&part_path).await {
                if meta.len() as i64 == expected_size
                    && matches!(file_sha256_hex(&part_path).await, Ok(sum) if sum == hex_hash)
                {
                    tracing::debug!(path = %part_path.display(), "partial blob already complete");
                    fs::rename(&part_path, &final_path).await?;
                    return Ok(());
                }
            }
        }

        let start = match fs::metadata(&part_path).await {
            Ok(meta) => {
                let mut size = meta.len() as i64;
                if expected_size > 0 && size > expected_size {
                    size = expected_size;
                }
                size
            }
            Err(_) => 0,
        };

        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.registry.trim_end_matches('/'),
            repository,
            digest
        );
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/octet-stream"));
        if !token.is_empty() {
            headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        }
        if start > 0 {
            headers.insert(header::RANGE, header_value(&format!("bytes={start}-"))?);
            tracing::debug!(digest, start, "resuming blob");
        }

        let response = self.transport.execute(Method::GET, &url, headers, cancel).await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(ModelpackError::BlobFetchFailed {
                digest: digest.to_string(),
                status,
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&part_path)
            .await?;
        file.seek(SeekFrom::Start(start.max(0) as u64)).await?;

        let mut hasher = Sha256::new();
        if start > 0 {
            hash_existing_file(&part_path, &mut hasher).await?;
        }

        // The server may ignore the range and answer 200 with the full body.
        // Start over: truncate, reset the hash, and undo prior accounting.
        if status == StatusCode::OK && start > 0 {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            if let Some(progress) = progress {
                progress.add(-start);
            }
            hasher = Sha256::new();
        }

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ModelpackError::Canceled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            hasher.update(&bytes);
            if let Some(progress) = progress {
                progress.add(bytes.len() as i64);
            }
        }

        let actual = hex::encode(hasher.finalize());
        if actual != hex_hash {
            return Err(ModelpackError::DigestMismatch {
                digest: digest.to_string(),
                actual,
            });
        }

        file.flush().await?;
        drop(file);
        fs::rename(&part_path, &final_path).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Measures the bytes already on disk for a blob, preferring the final file
/// over a partial, clamped to the expected size when one is known.
pub async fn existing_bytes_for_blob(blobs_dir: &Path, digest: &str, expected_size: i64) -> i64 {
    let Some(hex_hash) = digest.strip_prefix("sha256:") else {
        return 0;
    };
    let final_path = blobs_dir.join(format!("sha256-{hex_hash}"));
    let part_path = blobs_dir.join(format!("sha256-{hex_hash}.part"));

    for path in [final_path, part_path] {
        if let Ok(meta) = fs::metadata(&path).await {
            let size = meta.len() as i64;
            return if expected_size > 0 && size > expected_size {
                expected_size
            } else {
                size
            };
        }
    }
    0
}

/// Computes the SHA-256 of a file as a lowercase hex string.
pub async fn file_sha256_hex(path: &Path) -> ModelpackResult<String> {
    let mut hasher = Sha256::new();
    hash_existing_file(path, &mut hasher).await?;
    Ok(hex::encode(hasher.finalize()))
}

async fn hash_existing_file(path: &Path, hasher: &mut Sha256) -> ModelpackResult<()> {
    let mut file = fs::File::open(path).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(())
}

fn body_prefix(raw: &[u8]) -> String {
    if raw.len() > BODY_PREFIX_LIMIT {
        format!(
            "{}...",
            String::from_utf8_lossy(&raw[..BODY_PREFIX_LIMIT])
        )
    } else {
        String::from_utf8_lossy(raw).to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_prefix_truncates() {
        let long = vec![b'x'; 400];
        let prefix = body_prefix(&long);
        assert!(prefix.ends_with("..."));
        assert_eq!(prefix.len(), BODY_PREFIX_LIMIT + 3);

        assert_eq!(body_prefix(b"short"), "short");
    }

    #[tokio::test]
    async fn test_existing_bytes_prefers_final_file() {
        let dir = tempfile::tempdir().unwrap();
        let digest = "sha256:abcd";
        fs::write(dir.path().join("sha256-abcd"), b"12345")
            .await
            .unwrap();
        fs::write(dir.path().join("sha256-abcd.part"), b"12")
            .await
            .unwrap();

        assert_eq!(existing_bytes_for_blob(dir.path(), digest, 10).await, 5);
        // Clamped when larger than expected.
        assert_eq!(existing_bytes_for_blob(dir.path(), digest, 3).await, 3);
        // Unknown sizes are taken at face value.
        assert_eq!(existing_bytes_for_blob(dir.path(), digest, 0).await, 5);
    }

    #[tokio::test]
    async fn test_existing_bytes_falls_back_to_part() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sha256-ff.part"), b"123")
            .await
            .unwrap();

        assert_eq!(existing_bytes_for_blob(dir.path(), "sha256:ff", 10).await, 3);
        assert_eq!(existing_bytes_for_blob(dir.path(), "sha256:00", 10).await, 0);
        assert_eq!(existing_bytes_for_blob(dir.path(), "md5:ff", 10).await, 0);
    }

    #[tokio::test]
    async fn test_file_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::write(&path, b"hello").await.unwrap();

        let expected = hex::encode(Sha256::digest(b"hello"));
        assert_eq!(file_sha256_hex(&path).await.unwrap(), expected);
    }
}

use std::{io, sync::Arc};

use chrono::Utc;
use tokio::{
    fs,
    sync::Semaphore,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::PullConfig,
    oci::{existing_bytes_for_blob, BlobItem, HttpTransport, Reference, RegistryClient},
    session::{self, SessionMeta, SessionState},
    ModelpackError, ModelpackResult,
};

use super::{archive, Progress};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives one pull end to end: reference → token → manifest → staged blobs →
/// archive.
///
/// The engine is the sole writer of the session metadata while the pull runs;
/// partial progress (the `.part` files and staged blobs) is always left on
/// disk when the pull stops early, so the next attempt picks up from the
/// existing bytes.
#[derive(Debug)]
pub struct PullEngine {
    client: Arc<RegistryClient>,
    config: PullConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PullEngine {
    /// Builds an engine (and its HTTP transport) for one pull.
    pub fn new(config: &PullConfig) -> ModelpackResult<Self> {
        let transport = HttpTransport::new(
            *config.get_timeout(),
            *config.get_insecure(),
            *config.get_retries(),
        )?;
        Ok(Self {
            client: Arc::new(RegistryClient::new(config.get_registry().clone(), transport)),
            config: config.clone(),
        })
    }

    /// Runs the pull. On failure other than cancellation the session is
    /// annotated with `state = "error"`; on cancellation the state set by the
    /// pause/cancel action is left as-is.
    pub async fn run(
        &self,
        progress: &Arc<Progress>,
        cancel: &CancellationToken,
    ) -> ModelpackResult<()> {
        let result = self.pull(progress, cancel).await;

        if let Err(err) = &result {
            if !err.is_cancellation() {
                let _ = session::set_status(
                    self.config.get_staging_dir(),
                    SessionState::Error,
                    &err.to_string(),
                )
                .await;
            }
        }

        result
    }

    async fn pull(
        &self,
        progress: &Arc<Progress>,
        cancel: &CancellationToken,
    ) -> ModelpackResult<()> {
        let config = &self.config;
        let reference = Reference::parse(config.get_registry(), config.get_model())?;
        tracing::debug!(
            repository = %reference.get_repository(),
            reference = %reference.get_reference(),
            host = %reference.get_host(),
            "resolved reference"
        );

        // One token per pull, reused for manifest and blob calls.
        let token = self
            .client
            .resolve_token(reference.get_repository(), reference.get_reference(), cancel)
            .await?;

        let resolved = self
            .client
            .resolve_manifest(
                reference.get_repository(),
                reference.get_reference(),
                &token,
                config.get_platform(),
                cancel,
            )
            .await?;

        let staging = config.get_staging_dir();
        let models_root = staging.join("models");
        let blobs_dir = models_root.join("blobs");
        let manifests_dir = models_root
            .join("manifests")
            .join(reference.get_host())
            .join(reference.get_repository());
        fs::create_dir_all(&blobs_dir).await?;
        fs::create_dir_all(&manifests_dir).await?;

        self.write_session(SessionState::Downloading, "downloading").await?;

        let manifest_path = manifests_dir.join(reference.manifest_tail());
        fs::write(&manifest_path, &resolved.raw).await?;
        tracing::debug!(path = %manifest_path.display(), "wrote manifest");

        let items = resolved.manifest.blob_items();
        let total: i64 = items.iter().filter(|item| item.size > 0).map(|item| item.size).sum();
        progress.set_total(total);

        let existing = compute_existing_bytes(&blobs_dir, &items).await;
        progress.set_done(existing);

        self.fetch_blobs(items, &reference, &token, &blobs_dir, progress, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(ModelpackError::Canceled);
        }

        let out_zip = config.get_out_zip().clone();
        if let Some(parent) = out_zip.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let archive_root = models_root.clone();
        let archive_out = out_zip.clone();
        tokio::task::spawn_blocking(move || archive::zip_dir(&archive_root, &archive_out))
            .await
            .map_err(|e| ModelpackError::Io(io::Error::other(e)))??;
        tracing::info!(path = %out_zip.display(), "created archive");

        if !config.get_keep_staging() {
            let _ = fs::remove_dir_all(staging).await;
        } else {
            tracing::info!(path = %staging.display(), "staging kept");
        }

        Ok(())
    }

    /// Downloads all blobs through a bounded worker pool. The first failure
    /// wins (cancellation losing to real errors); partial progress stays on
    /// disk either way.
    async fn fetch_blobs(
        &self,
        items: Vec<BlobItem>,
        reference: &Reference,
        token: &str,
        blobs_dir: &std::path::Path,
        progress: &Arc<Progress>,
        cancel: &CancellationToken,
    ) -> ModelpackResult<()> {
        let permits = Arc::new(Semaphore::new((*self.config.get_concurrency()).max(1)));
        let mut workers = JoinSet::new();

        for item in items {
            let permits = Arc::clone(&permits);
            let client = Arc::clone(&self.client);
            let repository = reference.get_repository().clone();
            let token = token.to_string();
            let blobs_dir = blobs_dir.to_path_buf();
            let progress = Arc::clone(progress);
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ModelpackError::Canceled)?;
                client
                    .download_blob(
                        &repository,
                        &item.digest,
                        &token,
                        &blobs_dir,
                        item.size,
                        Some(progress.as_ref()),
                        &cancel,
                    )
                    .await
            });
        }

        let mut first_err: Option<ModelpackError> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(ModelpackError::Io(io::Error::other(join_err))),
            };
            if let Err(err) = outcome {
                let replace = match &first_err {
                    None => true,
                    Some(current) => current.is_cancellation() && !err.is_cancellation(),
                };
                if replace {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Loads any existing session for the staging directory (preserving its
    /// identity fields), overlays the current pull parameters, and saves.
    async fn write_session(&self, state: SessionState, message: &str) -> ModelpackResult<()> {
        let config = &self.config;
        let staging = config.get_staging_dir();

        let mut meta = match session::load(staging).await {
            Ok(meta) => meta,
            Err(_) => SessionMeta::default(),
        };
        if meta.session_id.is_empty() {
            meta.session_id = config.get_session_id().clone();
            meta.model = config.get_model().clone();
            meta.started_at = Some(Utc::now());
        }
        meta.out_zip = config.get_out_zip().display().to_string();
        meta.staging_root = staging.display().to_string();
        meta.registry = config.get_registry().clone();
        meta.platform = config.get_platform().clone();
        meta.concurrency = *config.get_concurrency();
        meta.retries = *config.get_retries();
        meta.state = state;
        meta.message = message.to_string();

        session::save(&mut meta).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sums the bytes already staged for the given blobs, clamped to expected
/// sizes. Feeds the progress counter before any download starts.
pub async fn compute_existing_bytes(blobs_dir: &std::path::Path, items: &[BlobItem]) -> i64 {
    let mut total = 0;
    for item in items {
        total += existing_bytes_for_blob(blobs_dir, &item.digest, item.size).await;
    }
    total
}

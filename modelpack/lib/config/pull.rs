use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use getset::{Getters, Setters};

use crate::{
    session::SessionMeta,
    utils::{sanitize_model_name, staging_dir_name, zip_file_name},
};

use super::{
    default_platform, DEFAULT_CONCURRENCY, DEFAULT_REGISTRY, DEFAULT_RETRIES,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The full set of parameters for one pull.
///
/// A config carries both the user-facing knobs (registry, platform,
/// concurrency, retries) and the paths derived from the model reference: the
/// session id, the output archive path, and the staging directory the pull
/// may resume from.
#[derive(Debug, Clone, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
pub struct PullConfig {
    /// The model reference as the user supplied it.
    model: String,

    /// The registry base URL.
    registry: String,

    /// The target platform used to select a manifest from an index.
    platform: String,

    /// The path of the output archive.
    out_zip: PathBuf,

    /// The directory holding archives and staging directories.
    output_dir: PathBuf,

    /// The filesystem-safe derivative of the model reference.
    session_id: String,

    /// The staging directory for this pull.
    staging_dir: PathBuf,

    /// The number of concurrent blob downloads.
    concurrency: usize,

    /// Retry attempts beyond the first for transient errors.
    retries: u32,

    /// Overall per-request timeout; `None` leaves requests uncapped.
    timeout: Option<Duration>,

    /// Skip TLS certificate verification (discouraged).
    insecure: bool,

    /// Preserve the staging directory after the archive is written.
    keep_staging: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PullConfig {
    /// Creates a config for a fresh pull of `model`, deriving the session id,
    /// archive path, and staging directory under `output_dir`.
    pub fn new(model: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let model = model.into();
        let output_dir = output_dir.into();
        let session_id = sanitize_model_name(&model);
        let out_zip = output_dir.join(zip_file_name(&session_id));
        let staging_dir = output_dir.join(staging_dir_name(&session_id));

        Self {
            model,
            registry: DEFAULT_REGISTRY.to_string(),
            platform: default_platform(),
            out_zip,
            output_dir,
            session_id,
            staging_dir,
            concurrency: DEFAULT_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            timeout: None,
            insecure: false,
            keep_staging: false,
        }
    }

    /// Rebuilds a config from persisted session metadata, substituting
    /// defaults for fields the session never recorded.
    pub fn for_resume(meta: &SessionMeta, output_dir: impl AsRef<Path>) -> Self {
        let mut config = Self::new(meta.model.clone(), output_dir.as_ref());

        if !meta.session_id.is_empty() {
            config.session_id = meta.session_id.clone();
            config.out_zip = config.output_dir.join(zip_file_name(&meta.session_id));
            config.staging_dir = config.output_dir.join(staging_dir_name(&meta.session_id));
        }
        if !meta.registry.is_empty() {
            config.registry = meta.registry.clone();
        }
        if !meta.platform.is_empty() {
            config.platform = meta.platform.clone();
        }
        if meta.concurrency > 0 {
            config.concurrency = meta.concurrency;
        }
        if meta.retries > 0 {
            config.retries = meta.retries;
        }
        if !meta.out_zip.is_empty() {
            config.out_zip = PathBuf::from(&meta.out_zip);
        }
        if !meta.staging_root.is_empty() {
            config.staging_dir = PathBuf::from(&meta.staging_root);
        }

        config
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_paths() {
        let config = PullConfig::new("owner/Model:Tag", "downloads");
        assert_eq!(config.get_session_id(), "owner-model-tag");
        assert_eq!(
            config.get_out_zip(),
            Path::new("downloads/owner-model-tag.zip")
        );
        assert_eq!(
            config.get_staging_dir(),
            Path::new("downloads/owner-model-tag.staging")
        );
        assert_eq!(*config.get_concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(*config.get_retries(), DEFAULT_RETRIES);
        assert!(config.get_timeout().is_none());
    }

    #[test]
    fn test_for_resume_overlays_session_fields() {
        let meta = SessionMeta {
            model: "llama3:8b".to_string(),
            session_id: "llama3-8b".to_string(),
            registry: "https://registry.example".to_string(),
            platform: "linux/arm64".to_string(),
            concurrency: 2,
            retries: 5,
            out_zip: "downloads/llama3-8b.zip".to_string(),
            staging_root: "downloads/llama3-8b.staging".to_string(),
            ..SessionMeta::default()
        };

        let config = PullConfig::for_resume(&meta, "downloads");
        assert_eq!(config.get_model(), "llama3:8b");
        assert_eq!(config.get_registry(), "https://registry.example");
        assert_eq!(config.get_platform(), "linux/arm64");
        assert_eq!(*config.get_concurrency(), 2);
        assert_eq!(*config.get_retries(), 5);
        assert_eq!(
            config.get_staging_dir(),
            Path::new("downloads/llama3-8b.staging")
        );
    }

    #[test]
    fn test_for_resume_defaults_missing_fields() {
        let meta = SessionMeta {
            model: "m".to_string(),
            ..SessionMeta::default()
        };

        let config = PullConfig::for_resume(&meta, "downloads");
        assert_eq!(config.get_registry(), DEFAULT_REGISTRY);
        assert_eq!(*config.get_concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(config.get_session_id(), "m");
    }
}

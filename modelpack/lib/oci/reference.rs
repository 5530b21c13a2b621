use getset::Getters;
use url::Url;

use crate::{
    config::{DEFAULT_REPO_NAMESPACE, DEFAULT_TAG},
    ModelpackError, ModelpackResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A normalized model reference.
///
/// Accepted input forms:
/// - `name[:tag]`
/// - `owner/name[:tag]`
/// - `name@sha256:<hex>`
/// - `owner/name@sha256:<hex>`
///
/// The default tag is `latest` and the default owner is `library`. The host is
/// taken from the registry base URL, not from the reference itself.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Reference {
    /// The registry host, e.g. `registry.ollama.ai`.
    host: String,

    /// The repository, e.g. `library/llama3`. Always contains a `/`.
    repository: String,

    /// The tag or `sha256:<hex>` digest used to address the manifest.
    reference: String,

    /// The tag, when the reference was given as one.
    tag: Option<String>,

    /// Whether `reference` is a digest.
    is_digest: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Parses a user-provided model reference against a registry base URL.
    pub fn parse(registry_base: &str, model: &str) -> ModelpackResult<Self> {
        let base = Url::parse(registry_base).map_err(|e| {
            ModelpackError::InvalidReference(format!("invalid registry base: {e}"))
        })?;
        let host = match (base.host_str(), base.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ModelpackError::InvalidReference(format!(
                    "registry base has no host: {registry_base}"
                )))
            }
        };

        let model = model.trim();
        if model.is_empty() {
            return Err(ModelpackError::InvalidReference(
                "model reference is empty".to_string(),
            ));
        }

        if model.contains("@sha256:") {
            let (name, digest) = model
                .split_once('@')
                .ok_or_else(|| ModelpackError::InvalidReference(model.to_string()))?;
            return Ok(Self {
                host,
                repository: with_default_namespace(name),
                reference: digest.to_string(),
                tag: None,
                is_digest: true,
            });
        }

        let (name, tag) = match model.split_once(':') {
            Some((name, tag)) => (name, tag.to_string()),
            None => (model, DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            host,
            repository: with_default_namespace(name),
            reference: tag.clone(),
            tag: Some(tag),
            is_digest: false,
        })
    }

    /// Returns the file name under which the manifest is staged: the raw tag
    /// for tag pulls, `sha256-<hex>` for digest pulls.
    pub fn manifest_tail(&self) -> String {
        if self.is_digest {
            if let Some(hex) = self.reference.strip_prefix("sha256:") {
                return format!("sha256-{hex}");
            }
        }
        self.reference.clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Prepends the default namespace to single-segment repository names.
fn with_default_namespace(name: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("{DEFAULT_REPO_NAMESPACE}/{name}")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "https://registry.ollama.ai";

    #[test]
    fn test_reference_single_segment_defaults() {
        let reference = Reference::parse(REGISTRY, "llama3").unwrap();
        assert_eq!(reference.host, "registry.ollama.ai");
        assert_eq!(reference.repository, "library/llama3");
        assert_eq!(reference.reference, "latest");
        assert_eq!(reference.tag.as_deref(), Some("latest"));
        assert!(!reference.is_digest);
    }

    #[test]
    fn test_reference_owner_and_tag() {
        let reference = Reference::parse(REGISTRY, "owner/llama3:8b").unwrap();
        assert_eq!(reference.repository, "owner/llama3");
        assert_eq!(reference.reference, "8b");
        assert_eq!(reference.tag.as_deref(), Some("8b"));
    }

    #[test]
    fn test_reference_single_segment_tag() {
        let reference = Reference::parse(REGISTRY, "llama3:8b").unwrap();
        assert_eq!(reference.repository, "library/llama3");
        assert_eq!(reference.reference, "8b");
    }

    #[test]
    fn test_reference_digest() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let reference = Reference::parse(REGISTRY, &format!("llama3@{digest}")).unwrap();
        assert_eq!(reference.repository, "library/llama3");
        assert_eq!(reference.reference, digest);
        assert!(reference.is_digest);
        assert!(reference.tag.is_none());
    }

    #[test]
    fn test_reference_owner_digest() {
        let digest = format!("sha256:{}", "cd".repeat(32));
        let reference = Reference::parse(REGISTRY, &format!("owner/llama3@{digest}")).unwrap();
        assert_eq!(reference.repository, "owner/llama3");
        assert!(reference.is_digest);
    }

    #[test]
    fn test_reference_host_with_port() {
        let reference = Reference::parse("http://127.0.0.1:5000", "llama3").unwrap();
        assert_eq!(reference.host, "127.0.0.1:5000");
    }

    #[test]
    fn test_reference_empty_input() {
        let err = Reference::parse(REGISTRY, "  ").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_reference_invalid_registry_base() {
        let err = Reference::parse("not a url", "llama3").unwrap_err();
        assert!(err.to_string().contains("invalid registry base"));
    }

    #[test]
    fn test_manifest_tail_tag() {
        let reference = Reference::parse(REGISTRY, "llama3:8b").unwrap();
        assert_eq!(reference.manifest_tail(), "8b");
    }

    #[test]
    fn test_manifest_tail_digest_uses_dash() {
        let hex = "ef".repeat(32);
        let reference = Reference::parse(REGISTRY, &format!("llama3@sha256:{hex}")).unwrap();
        assert_eq!(reference.manifest_tail(), format!("sha256-{hex}"));
    }
}

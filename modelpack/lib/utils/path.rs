use std::path::{Component, Path, PathBuf};

use crate::{ModelpackError, ModelpackResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The suffix that marks a directory as a pull staging area. Session discovery
/// treats any directory under the downloads root with this suffix as a session.
pub const STAGING_SUFFIX: &str = ".staging";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives a filesystem-safe session id from a user-provided model reference.
///
/// ## Rules:
/// - Maps `/`, `:`, `@`, `\` and spaces to `-`
/// - Lowercases the result and trims leading/trailing dashes
/// - Falls back to `"model"` when the input (or the result) is empty
///
/// ## Examples:
/// ```
/// use modelpack::utils::sanitize_model_name;
///
/// assert_eq!(sanitize_model_name("owner/Model:Tag"), "owner-model-tag");
/// assert_eq!(sanitize_model_name("   "), "model");
/// ```
pub fn sanitize_model_name(model: &str) -> String {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        return "model".to_string();
    }

    let mapped: String = trimmed
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' | '\\' | ' ' => '-',
            other => other,
        })
        .collect();

    let lowered = mapped.to_lowercase();
    let cleaned = lowered.trim_matches('-');
    if cleaned.is_empty() {
        "model".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Returns the archive file name for a session id, appending `.zip` unless the
/// id already ends with it.
pub fn zip_file_name(session_id: &str) -> String {
    if session_id.to_lowercase().ends_with(".zip") {
        session_id.to_string()
    } else {
        format!("{session_id}.zip")
    }
}

/// Returns the staging directory name for a session id.
pub fn staging_dir_name(session_id: &str) -> String {
    format!("{session_id}{STAGING_SUFFIX}")
}

/// Resolves a user-supplied download name against the downloads directory,
/// rejecting any name that would escape it once cleaned.
pub fn resolve_download_path(downloads_dir: &Path, name: &str) -> ModelpackResult<PathBuf> {
    let candidate = Path::new(name);
    let safe = !name.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(ModelpackError::PathTraversal(name.to_string()));
    }
    Ok(downloads_dir.join(candidate))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_model_name() {
        assert_eq!(
            sanitize_model_name("owner/Model:Tag@sha256:abc"),
            "owner-model-tag-sha256-abc"
        );
        assert_eq!(sanitize_model_name("llama3:8b"), "llama3-8b");
        assert_eq!(sanitize_model_name("a b\\c"), "a-b-c");
        assert_eq!(sanitize_model_name(""), "model");
        assert_eq!(sanitize_model_name("   "), "model");
        assert_eq!(sanitize_model_name("///"), "model");
        assert_eq!(sanitize_model_name("/name/"), "name");
    }

    #[test]
    fn test_zip_file_name() {
        assert_eq!(zip_file_name("llama3-8b"), "llama3-8b.zip");
        assert_eq!(zip_file_name("already.zip"), "already.zip");
        assert_eq!(zip_file_name("UPPER.ZIP"), "UPPER.ZIP");
    }

    #[test]
    fn test_staging_dir_name() {
        assert_eq!(staging_dir_name("llama3-8b"), "llama3-8b.staging");
    }

    #[test]
    fn test_resolve_download_path() {
        let dir = Path::new("/srv/downloads");
        assert_eq!(
            resolve_download_path(dir, "model.zip").unwrap(),
            dir.join("model.zip")
        );
        assert!(resolve_download_path(dir, "").is_err());
        assert!(resolve_download_path(dir, "../etc/passwd").is_err());
        assert!(resolve_download_path(dir, "a/../../b").is_err());
        assert!(resolve_download_path(dir, "/etc/passwd").is_err());
    }
}

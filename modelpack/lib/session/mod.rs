//! On-disk session metadata for resumable pulls.
//!
//! Each staging directory carries a `session.json` describing the pull that
//! owns it. The file is rewritten in full on every update and readers
//! tolerate missing or malformed files by treating the directory as a new
//! session, so a crashed or interrupted pull can always be picked back up.

use std::{
    cmp::Reverse,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{utils::STAGING_SUFFIX, ModelpackResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The metadata file name inside each staging directory.
pub const SESSION_META_FILENAME: &str = "session.json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state recorded in `session.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionState {
    /// A pull is (or was, before a crash) actively downloading.
    Downloading,

    /// The pull was paused or canceled; staging is intact for resume.
    Paused,

    /// The pull failed; `message` carries the error.
    Error,

    /// No state recorded yet.
    #[default]
    Idle,
}

/// The persisted metadata of one pull session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionMeta {
    /// The model reference as the user supplied it.
    pub model: String,

    /// The filesystem-safe derivative of `model`.
    pub session_id: String,

    /// Absolute or downloads-relative path of the target archive.
    pub out_zip: String,

    /// The staging directory this metadata lives in.
    pub staging_root: String,

    /// The registry base URL the pull used.
    pub registry: String,

    /// The platform the pull selected manifests for.
    pub platform: String,

    /// Concurrent blob downloads the pull used.
    pub concurrency: usize,

    /// Retry attempts beyond the first for transient errors.
    pub retries: u32,

    /// When the session was first created.
    pub started_at: Option<DateTime<Utc>>,

    /// When the metadata was last rewritten.
    pub last_updated: Option<DateTime<Utc>>,

    /// The current lifecycle state.
    pub state: SessionState,

    /// A short human-readable status.
    pub message: String,
}

/// A display-ready view of a session for the control-plane index page.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    /// The model reference.
    pub model: String,

    /// The session id (names the staging directory and archive).
    pub session_id: String,

    /// Formatted start time.
    pub started: String,

    /// Formatted last-update time.
    pub updated: String,

    /// The state label.
    pub state_label: String,

    /// The session's status message.
    pub message: String,
}

/// A completed archive found in the downloads directory.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// The archive file name.
    pub name: String,

    /// The file name with the `.zip` suffix removed.
    pub model: String,

    /// The full path of the archive.
    pub path: PathBuf,

    /// Last modification time, used for newest-first ordering.
    pub modified: SystemTime,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SessionState {
    /// The canonical string stored in `session.json`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Downloading => "downloading",
            SessionState::Paused => "paused",
            SessionState::Error => "error",
            SessionState::Idle => "",
        }
    }

    /// A label for display, matching the index page vocabulary.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Downloading => "downloading",
            SessionState::Paused => "paused",
            SessionState::Error => "error",
            SessionState::Idle => "waiting",
        }
    }
}

impl SessionMeta {
    /// Builds the display view of this session.
    pub fn view(&self) -> SessionView {
        SessionView {
            model: self.model.clone(),
            session_id: self.session_id.clone(),
            started: format_session_time(self.started_at),
            updated: format_session_time(self.last_updated),
            state_label: self.state.label().to_string(),
            message: self.message.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The path of the metadata file inside a staging directory.
pub fn meta_path(dir: &Path) -> PathBuf {
    dir.join(SESSION_META_FILENAME)
}

/// Loads session metadata from a staging directory.
pub async fn load(dir: &Path) -> ModelpackResult<SessionMeta> {
    let data = fs::read(meta_path(dir)).await?;
    let meta = serde_json::from_slice(&data)?;
    Ok(meta)
}

/// Rewrites the metadata file in full, stamping `lastUpdated`.
pub async fn save(meta: &mut SessionMeta) -> ModelpackResult<()> {
    meta.last_updated = Some(Utc::now());
    let data = serde_json::to_vec_pretty(meta)?;
    fs::write(meta_path(Path::new(&meta.staging_root)), data).await?;
    Ok(())
}

/// Updates only the state and message of a session, leaving the rest intact.
/// A missing or empty directory is a no-op.
pub async fn set_status(dir: &Path, state: SessionState, message: &str) -> ModelpackResult<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    let mut meta = match load(dir).await {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };
    meta.state = state;
    meta.message = message.to_string();
    save(&mut meta).await
}

/// Discovers partial sessions under the downloads directory: every directory
/// named `*.staging` with readable metadata. Malformed sessions are skipped.
pub async fn discover_partials(output_dir: &Path) -> Vec<SessionMeta> {
    let mut sessions = Vec::new();
    let Ok(mut entries) = fs::read_dir(output_dir).await else {
        return sessions;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(STAGING_SUFFIX) {
            continue;
        }
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Ok(meta) = load(&entry.path()).await {
            sessions.push(meta);
        }
    }
    sessions
}

/// Sorts sessions newest-first and splits them into at most one running view
/// plus paused and errored lists. Sessions without a recognized state land in
/// the paused list so they stay visible and resumable.
pub fn categorize(
    mut sessions: Vec<SessionMeta>,
) -> (Option<SessionView>, Vec<SessionView>, Vec<SessionView>) {
    sessions.sort_by_key(|meta| Reverse(meta.last_updated));

    let mut running = None;
    let mut paused = Vec::new();
    let mut errored = Vec::new();

    for meta in sessions {
        let view = meta.view();
        match meta.state {
            SessionState::Downloading => {
                if running.is_none() {
                    running = Some(view);
                }
            }
            SessionState::Error => errored.push(view),
            SessionState::Paused | SessionState::Idle => paused.push(view),
        }
    }

    (running, paused, errored)
}

/// Lists completed `.zip` archives in the downloads directory, newest first.
pub async fn completed_archives(dir: &Path) -> Vec<ArchiveEntry> {
    let mut archives = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return archives;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str().map(String::from) else {
            continue;
        };
        if !name.ends_with(".zip") {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }
        archives.push(ArchiveEntry {
            model: name.trim_end_matches(".zip").to_string(),
            path: entry.path(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            name,
        });
    }

    archives.sort_by_key(|entry| Reverse(entry.modified));
    archives
}

fn format_session_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "unknown".to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<String> for SessionState {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "downloading" => SessionState::Downloading,
            "paused" => SessionState::Paused,
            "error" => SessionState::Error,
            _ => SessionState::Idle,
        }
    }
}

impl From<SessionState> for String {
    fn from(state: SessionState) -> Self {
        state.as_str().to_string()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

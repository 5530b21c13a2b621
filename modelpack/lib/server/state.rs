use std::{path::PathBuf, sync::Arc};

use crate::manager::DownloadManager;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared state for the HTTP handlers: the download manager and the
/// downloads directory archives are served from.
#[derive(Clone)]
pub struct ServerState {
    manager: Arc<DownloadManager>,
    downloads_dir: PathBuf,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates the shared server state.
    pub fn new(manager: Arc<DownloadManager>, downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            downloads_dir: downloads_dir.into(),
        }
    }

    /// The download manager.
    pub fn manager(&self) -> &DownloadManager {
        &self.manager
    }

    /// The downloads directory.
    pub fn downloads_dir(&self) -> &PathBuf {
        &self.downloads_dir
    }
}

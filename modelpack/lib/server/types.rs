//! Request types for the control-plane endpoints.

use serde::Deserialize;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Form body for `POST /queue/add`.
#[derive(Debug, Deserialize)]
pub struct QueueAddForm {
    /// The model reference to pull.
    #[serde(default)]
    pub model: String,
}

/// Form body for `POST /queue/action`.
#[derive(Debug, Deserialize)]
pub struct QueueActionForm {
    /// The task id the action applies to.
    #[serde(default)]
    pub id: String,

    /// One of `pause`, `resume`, `cancel`.
    #[serde(default)]
    pub action: String,
}

/// Query parameters of the index page.
#[derive(Debug, Deserialize)]
pub struct IndexQuery {
    /// A status message carried through POST redirects.
    #[serde(default)]
    pub message: Option<String>,
}

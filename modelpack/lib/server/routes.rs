//! Route definitions for the control plane.

use axum::{
    routing::{get, post},
    Router,
};

use super::{handlers, state::ServerState};

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates the control-plane router.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(handlers::index_handler))
        .route("/queue/add", post(handlers::queue_add_handler))
        .route("/queue/action", post(handlers::queue_action_handler))
        .route("/download/{name}", get(handlers::file_download_handler))
        .route("/progress", get(handlers::progress_handler))
        .with_state(state)
}

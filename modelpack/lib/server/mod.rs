//! The embedded HTTP control plane.
//!
//! A thin axum surface over the download manager: queue a model, act on a
//! task, fetch the active progress snapshot, download a finished archive.
//! Page rendering proper is a collaborator concern; the index handler emits
//! a minimal inline page.

mod handlers;
mod routes;
mod state;
mod types;

use tokio::net::TcpListener;

use crate::ModelpackResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use handlers::*;
pub use routes::*;
pub use state::*;
pub use types::*;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Binds the control plane and serves it until the process exits.
/// Port zero binds an ephemeral port; the bound address is logged.
pub async fn serve(state: ServerState, port: u16) -> ModelpackResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!("control plane listening on http://{addr}");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

//! Bootstrap [axum] servers

use crate::coordinator::Coordinator;
use axum::{
    Router,
    routing::{get, post},
};
use std::{io, sync::Arc};
use tokio::net::TcpListener;

/// handlers for axum server
pub mod handler;
mod surface;
mod ws;

pub use surface::WsSurfaceHost;

/// Shared by every route.
#[derive(Clone, Debug)]
pub struct ServerState {
    pub coordinator: Coordinator,
    pub surfaces: Arc<WsSurfaceHost>,
}

/// Routes:
///
/// - `POST /`: JSON-RPC requests of embedding pages
/// - `GET /page`: websocket pushing page notifications, also accepting JSON-RPC requests
/// - `GET /view`: websocket of one UI view
/// - `GET /approval?id=<uuid>`: websocket of one approval surface
pub fn router(coordinator: Coordinator, surfaces: Arc<WsSurfaceHost>) -> Router {
    Router::new()
        .route("/", post(handler::handle))
        .route("/page", get(ws::handle_page_ws))
        .route("/view", get(ws::handle_view_ws))
        .route("/approval", get(surface::handle_approval_ws))
        .with_state(ServerState { coordinator, surfaces })
}

/// Serves `router` on `listener` until the task is dropped or the listener fails.
pub async fn serve(listener: TcpListener, router: Router) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "devwallet::server", %addr, "listening");
    }
    axum::serve(listener, router).await
}

//! Approval surfaces served over websockets.
//!
//! Opening a surface announces it to every view and, if configured, runs the launcher command
//! with the surface url. The surface itself is the socket at `/approval?id=<id>`: it receives
//! the request, answers with `{"approved": bool}`, and dropping it without an answer counts as
//! closing the surface.

use super::ServerState;
use crate::{
    approval::{ApprovalError, ApprovalRequest, SurfaceHandle, SurfaceHost},
    fanout::Fanout,
    messages::ViewEvent,
};
use async_trait::async_trait;
use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    process::Command,
    sync::{Notify, oneshot},
};
use uuid::Uuid;

struct Surface {
    request: ApprovalRequest,
    /// Completes the coordinator's [`SurfaceHandle`].
    closed: oneshot::Sender<()>,
    /// Tells an attached socket the request was resolved elsewhere.
    dismissed: Arc<Notify>,
}

/// [`SurfaceHost`] backed by the `/approval` websocket route.
pub struct WsSurfaceHost {
    base_url: String,
    views: Arc<Fanout<ViewEvent>>,
    launcher: Vec<String>,
    surfaces: Mutex<HashMap<Uuid, Surface>>,
}

impl WsSurfaceHost {
    /// `base_url` is the server's own http url, e.g. `http://127.0.0.1:8546`.
    pub fn new(base_url: impl Into<String>, views: Arc<Fanout<ViewEvent>>, launcher: Vec<String>) -> Self {
        Self { base_url: base_url.into(), views, launcher, surfaces: Default::default() }
    }

    /// Where the surface of `id` is served.
    pub fn surface_url(&self, id: Uuid) -> String {
        format!("{}/approval?id={id}", self.base_url.trim_end_matches('/'))
    }

    /// Number of open surfaces.
    pub fn len(&self) -> usize {
        self.surfaces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attach(&self, id: Uuid) -> Option<(ApprovalRequest, Arc<Notify>)> {
        let surfaces = self.surfaces.lock();
        let surface = surfaces.get(&id)?;
        Some((surface.request.clone(), surface.dismissed.clone()))
    }

    /// The surface went away without a decision.
    fn surface_closed(&self, id: Uuid) {
        if let Some(surface) = self.surfaces.lock().remove(&id) {
            let _ = surface.closed.send(());
        }
    }

    fn launch(&self, url: &str) -> Result<(), ApprovalError> {
        let Some((program, args)) = self.launcher.split_first() else { return Ok(()) };
        Command::new(program)
            .args(args)
            .arg(url)
            .spawn()
            .map(drop)
            .map_err(|err| ApprovalError::Surface(format!("failed to run `{program}`: {err}")))
    }
}

impl std::fmt::Debug for WsSurfaceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSurfaceHost")
            .field("base_url", &self.base_url)
            .field("launcher", &self.launcher)
            .field("open", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SurfaceHost for WsSurfaceHost {
    async fn open(&self, request: &ApprovalRequest) -> Result<SurfaceHandle, ApprovalError> {
        let id = request.id;
        let url = self.surface_url(id);

        // the launched surface may connect before `spawn` returns
        let (closed, rx) = oneshot::channel();
        let surface = Surface { request: request.clone(), closed, dismissed: Arc::new(Notify::new()) };
        self.surfaces.lock().insert(id, surface);
        if let Err(err) = self.launch(&url) {
            self.surfaces.lock().remove(&id);
            return Err(err);
        }

        self.views.broadcast(ViewEvent::ApprovalRequested {
            id,
            method: request.method.clone(),
            from: request.from,
            url,
        });
        debug!(target: "devwallet::approval", %id, "approval surface opened");
        Ok(SurfaceHandle { closed: rx })
    }

    fn close(&self, id: Uuid) {
        if let Some(surface) = self.surfaces.lock().remove(&id) {
            surface.dismissed.notify_one();
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ApprovalQuery {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct Decision {
    approved: bool,
}

/// Handles incoming Websocket upgrade of an approval surface
pub(super) async fn handle_approval_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<ApprovalQuery>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_approval_socket(socket, query.id, state))
}

async fn handle_approval_socket(mut socket: WebSocket, id: Uuid, state: ServerState) {
    let Some((request, dismissed)) = state.surfaces.attach(id) else {
        debug!(target: "devwallet::approval", %id, "no open surface");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let Ok(text) = serde_json::to_string(&request) else { return };
    if socket.send(Message::Text(text.into())).await.is_err() {
        state.surfaces.surface_closed(id);
        return;
    }

    loop {
        tokio::select! {
            _ = dismissed.notified() => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Decision>(text.as_str()) {
                    Ok(Decision { approved }) => {
                        state.coordinator.approvals().respond(id, approved);
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                    Err(err) => {
                        debug!(target: "devwallet::approval", %id, %err, "ignoring malformed decision");
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    state.surfaces.surface_closed(id);
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

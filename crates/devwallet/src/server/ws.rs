//! Websockets of embedding pages and UI views.

use super::{ServerState, handler::handle_request};
use crate::messages::{ViewCommand, ViewEvent};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use devwallet_rpc::{error::RpcError, request::Request, response::Response};
use futures::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::FuturesUnordered,
};
use serde::Serialize;
use tokio::sync::mpsc;

/// Handles incoming Websocket upgrade of an embedding page
pub async fn handle_page_ws(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_page_socket(socket, state))
}

/// Handles incoming Websocket upgrade of a UI view
pub async fn handle_view_ws(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_view_socket(socket, state))
}

/// Pushes page notifications and answers JSON-RPC requests sent over the socket.
///
/// Requests run concurrently: one waiting for approval does not hold back the others or the
/// notification stream. Whatever is still in flight when the page goes away is dropped.
async fn handle_page_socket(socket: WebSocket, state: ServerState) {
    let pages = state.coordinator.pages().clone();
    let (channel, mut notifications) = pages.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut in_flight = FuturesUnordered::<BoxFuture<'static, Option<Response>>>::new();
    trace!(target: "devwallet::server", channel, "page connected");

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                if sink.send(to_message(&notification)).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(_))) => {
                        warn!(target: "devwallet::server", channel, "unexpected binary data");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                match serde_json::from_str::<Request>(text.as_str()) {
                    Ok(req) => {
                        let dispatcher = state.coordinator.dispatcher().clone();
                        in_flight.push(async move { handle_request(req, &dispatcher).await }.boxed());
                    }
                    Err(err) => {
                        warn!(target: "devwallet::server", %err, "invalid request");
                        let response = Response::error(RpcError::parse_error());
                        if sink.send(to_message(&response)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(response) = in_flight.next(), if !in_flight.is_empty() => {
                if let Some(response) = response
                    && sink.send(to_message(&response)).await.is_err()
                {
                    break;
                }
            }
        }
    }

    if !in_flight.is_empty() {
        debug!(target: "devwallet::server", channel, pending = in_flight.len(), "dropping in-flight page requests");
    }
    pages.unsubscribe(channel);
    trace!(target: "devwallet::server", channel, "page disconnected");
}

/// One socket per open view: commands in, events out.
///
/// Commands are executed in arrival order by a separate task, so a slow one never stalls the
/// event stream. Queued commands still run after the view closes.
async fn handle_view_socket(socket: WebSocket, state: ServerState) {
    let views = state.coordinator.views().clone();
    let (channel, mut events) = views.subscribe();
    let (mut sink, mut stream) = socket.split();
    let (commands, mut queued) = mpsc::unbounded_channel::<ViewCommand>();
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        while let Some(cmd) = queued.recv().await {
            coordinator.on_command(channel, cmd).await;
        }
    });
    debug!(target: "devwallet::server", channel, "view connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if sink.send(to_message(&event)).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ViewCommand>(text.as_str()) {
                    Ok(cmd) => {
                        let _ = commands.send(cmd);
                    }
                    Err(err) => {
                        views.send_to(channel, ViewEvent::error(format!("invalid command: {err}")));
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    views.unsubscribe(channel);
    debug!(target: "devwallet::server", channel, "view disconnected");
}

fn to_message<T: Serialize>(value: &T) -> Message {
    match serde_json::to_string(value) {
        Ok(text) => Message::Text(text.into()),
        Err(err) => {
            error!(target: "devwallet::server", %err, "failed to serialize outbound message");
            Message::Text(String::from("null").into())
        }
    }
}

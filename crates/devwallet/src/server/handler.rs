use super::ServerState;
use crate::dispatcher::Dispatcher;
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use devwallet_rpc::{
    error::RpcError,
    request::{Request, RpcCall},
    response::{Response, RpcResponse},
};
use futures::{FutureExt, future};

/// Handles incoming JSON-RPC Request
pub async fn handle(
    State(state): State<ServerState>,
    request: Result<Json<Request>, JsonRejection>,
) -> Json<Response> {
    match request {
        Err(err) => {
            warn!(target: "devwallet::rpc", %err, "invalid request");
            Response::error(RpcError::invalid_request()).into()
        }
        Ok(req) => handle_request(req.0, state.coordinator.dispatcher())
            .await
            .unwrap_or_else(|| Response::error(RpcError::invalid_request()))
            .into(),
    }
}

/// Handle the JSON-RPC [Request]
///
/// Batches are executed concurrently; notifications produce no response.
pub async fn handle_request(req: Request, dispatcher: &Dispatcher) -> Option<Response> {
    /// processes batch calls
    fn responses_as_batch(outs: Vec<Option<RpcResponse>>) -> Option<Response> {
        let batch: Vec<_> = outs.into_iter().flatten().collect();
        (!batch.is_empty()).then_some(Response::Batch(batch))
    }

    match req {
        Request::Single(call) => handle_call(call, dispatcher).await.map(Response::Single),
        Request::Batch(calls) => {
            future::join_all(calls.into_iter().map(|call| handle_call(call, dispatcher)))
                .map(responses_as_batch)
                .await
        }
    }
}

/// handle a single RPC method call
async fn handle_call(call: RpcCall, dispatcher: &Dispatcher) -> Option<RpcResponse> {
    match call {
        RpcCall::MethodCall(call) => Some(dispatcher.on_call(call).await),
        RpcCall::Notification(notification) => {
            trace!(target: "devwallet::rpc", method = %notification.method, "received rpc notification");
            None
        }
        RpcCall::Invalid { id } => {
            trace!(target: "devwallet::rpc", %id, "invalid rpc call");
            Some(RpcResponse::invalid_request(id))
        }
    }
}

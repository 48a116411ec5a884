//! JSON-RPC over HTTP against a spawned server.

use crate::utils::{Upstream, init_tracing, wait_for};
use alloy_primitives::address;
use devwallet::{
    ServerHandle,
    config::WalletConfig,
    messages::ViewEvent,
    networks::FORK_CHAIN_ID,
    storage::MemoryStore,
    try_spawn, try_spawn_with,
    types::{AddressSource, SelectedAddress, StatePatch},
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

async fn spawn_offline() -> ServerHandle {
    init_tracing();
    let config = WalletConfig::default().with_port(0);
    let (_, handle) =
        try_spawn_with(config, Arc::new(MemoryStore::new()), Arc::new(Upstream::offline())).await.unwrap();
    handle
}

async fn post(handle: &ServerHandle, body: impl Into<reqwest::Body>) -> Value {
    reqwest::Client::new()
        .post(handle.http_endpoint())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn call(handle: &ServerHandle, method: &str, params: Value) -> Value {
    let req = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    post(handle, req.to_string()).await
}

#[tokio::test(flavor = "multi_thread")]
async fn can_serve_chain_id() {
    let handle = spawn_offline().await;
    assert_ne!(handle.socket_address().port(), 0);

    let res = call(&handle, "eth_chainId", json!([])).await;
    assert_eq!(res, json!({ "jsonrpc": "2.0", "id": 1, "result": "0x1" }));

    let res = call(&handle, "net_version", json!([])).await;
    assert_eq!(res["result"], "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_skips_notifications() {
    let handle = spawn_offline().await;
    let batch = json!([
        { "jsonrpc": "2.0", "id": 1, "method": "eth_chainId" },
        { "jsonrpc": "2.0", "method": "eth_chainId" },
        { "id": 3 },
    ]);

    let res = post(&handle, batch.to_string()).await;
    let res = res.as_array().unwrap();
    assert_eq!(res.len(), 2);
    assert_eq!(res[0]["result"], "0x1");
    assert_eq!(res[1]["id"], 3);
    assert_eq!(res[1]["error"]["code"], -32600);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_bodies_are_invalid_requests() {
    let handle = spawn_offline().await;

    let res = post(&handle, "{ not json").await;
    assert_eq!(res["error"]["code"], -32600);

    // a lone notification has nothing to answer
    let res = post(&handle, json!({ "jsonrpc": "2.0", "method": "eth_chainId" }).to_string()).await;
    assert_eq!(res["error"]["code"], -32600);
}

#[tokio::test(flavor = "multi_thread")]
async fn wallet_errors_keep_their_codes() {
    let handle = spawn_offline().await;

    let res = call(&handle, "anvil_setBalance", json!([])).await;
    assert_eq!(res["error"]["code"], 4200);

    let res = call(&handle, "eth_sendTransaction", json!([{}])).await;
    assert_eq!(res["error"]["code"], 4100);

    let res = call(&handle, "wallet_switchEthereumChain", json!([{ "chainId": "0x5" }])).await;
    assert_eq!(res["error"]["code"], 4902);

    let res = call(&handle, "eth_blockNumber", json!([])).await;
    assert_eq!(res["error"]["code"], -32603);
}

#[tokio::test(flavor = "multi_thread")]
async fn state_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = WalletConfig::default().with_port(0).with_storage_dir(dir.path());

    let (_, handle) = try_spawn(config.clone()).await.unwrap();
    let res = call(&handle, "wallet_switchEthereumChain", json!([{ "chainId": "0x88bb0" }])).await;
    assert_eq!(res["result"], Value::Null);
    handle.abort();

    let (coordinator, handle) = try_spawn(config).await.unwrap();
    assert_eq!(coordinator.state().get().await.chain_id, 560048);
    let res = call(&handle, "eth_chainId", json!([])).await;
    assert_eq!(res["result"], "0x88bb0");
}

#[tokio::test(flavor = "multi_thread")]
async fn page_socket_answers_while_approval_is_pending() {
    init_tracing();
    let config = WalletConfig::default().with_port(0);
    let (coordinator, handle) =
        try_spawn_with(config, Arc::new(MemoryStore::new()), Arc::new(Upstream::offline())).await.unwrap();
    let from = address!("0x1111111111111111111111111111111111111111");
    coordinator
        .state()
        .set(
            StatePatch::default()
                .chain_id(FORK_CHAIN_ID)
                .selected_address(Some(SelectedAddress::new(from, AddressSource::Manual)))
                .require_approval(true),
        )
        .await
        .unwrap();
    let (_, mut views) = coordinator.views().subscribe();

    let url = format!("ws://{}/page", handle.socket_address());
    let (mut socket, _) = connect_async(url).await.unwrap();
    let send = json!({ "jsonrpc": "2.0", "id": 1, "method": "eth_sendTransaction", "params": [{ "from": from }] });
    socket.send(Message::Text(send.to_string())).await.unwrap();
    let requested = wait_for(&mut views, |event| matches!(event, ViewEvent::ApprovalRequested { .. })).await;
    let ViewEvent::ApprovalRequested { id, .. } = requested else { unreachable!() };

    let chain_id = json!({ "jsonrpc": "2.0", "id": 2, "method": "eth_chainId" });
    socket.send(Message::Text(chain_id.to_string())).await.unwrap();
    let res = next_response(&mut socket).await;
    assert_eq!(res["id"], 2);
    assert_eq!(res["result"], "0x7a69");
    assert_eq!(coordinator.approvals().pending().len(), 1);

    assert!(coordinator.approvals().respond(id, false));
    let res = next_response(&mut socket).await;
    assert_eq!(res["id"], 1);
    assert_eq!(res["error"]["code"], 4001);
}

/// Next JSON-RPC response on a page socket, skipping pushed notifications.
async fn next_response<S>(socket: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let next = async {
        while let Some(msg) = socket.next().await {
            if let Message::Text(text) = msg.unwrap() {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value.get("id").is_some() {
                    return value;
                }
            }
        }
        panic!("page socket closed");
    };
    tokio::time::timeout(Duration::from_secs(5), next).await.expect("no response in time")
}

//! Routing of page-originated JSON-RPC requests.
//!
//! [`route`] decides what a request needs from the current state alone; [`Dispatcher`] carries
//! that decision out: answering locally, switching chains, gating signing behind approval and
//! impersonation, or proxying upstream.

use crate::{
    approval::{ApprovalCoordinator, requires_approval},
    client::{ClientCache, TransportError},
    fanout::Fanout,
    fork::ForkAdapter,
    messages::{PageNotification, ViewEvent},
    networks::{FORK_CHAIN_ID, Networks, effective_chain_id, is_fork, is_switchable},
    state::StateStore,
    types::{StatePatch, WalletState},
};
use alloy_dyn_abi::TypedData;
use alloy_primitives::{Address, ChainId};
use devwallet_rpc::{
    error::{ErrorCode, RpcError},
    request::{RequestParams, RpcMethodCall},
    response::{ResponseResult, RpcResponse},
};
use serde_json::{Value, json};
use std::sync::Arc;

/// Signing methods; these never reach a production endpoint.
pub const SIGNING_METHODS: [&str; 6] = [
    "eth_sendTransaction",
    "eth_signTypedData_v4",
    "eth_signTypedData_v3",
    "eth_signTypedData",
    "personal_sign",
    "eth_sign",
];

/// Prefixes of node-control methods pages may not call.
pub const BLOCKED_PREFIXES: [&str; 3] = ["anvil_", "hardhat_", "evm_"];

const NOT_CONNECTED: &str = "No address selected. Open the wallet to connect.";
const WATCH_ONLY: &str =
    "Watch-only address. Signing is only available on the local fork network.";
const USER_REJECTED: &str = "User rejected the request";
const RPC_FAILED: &str = "RPC request failed";

/// Error code for failures of the local fork node.
const FORK_ERROR: i64 = -32000;

/// Returns true for methods matching [`BLOCKED_PREFIXES`], case-insensitively.
pub fn is_blocked(method: &str) -> bool {
    BLOCKED_PREFIXES.iter().any(|prefix| {
        method.len() >= prefix.len() && method[..prefix.len()].eq_ignore_ascii_case(prefix)
    })
}

pub fn is_signing(method: &str) -> bool {
    SIGNING_METHODS.contains(&method)
}

/// What a request needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// Answered from local state.
    Respond(ResponseResult),
    /// Switch the wallet to another chain.
    SwitchChain(ChainId),
    /// Forward to the fork node while impersonating `from`, after approval if requested.
    Sign { from: Address, approval: bool },
    /// Forward verbatim to the endpoint of `chain_id`.
    Proxy { chain_id: ChainId },
}

impl From<RpcError> for Route {
    fn from(err: RpcError) -> Self {
        Self::Respond(ResponseResult::Error(err))
    }
}

/// Decides how to handle `method`. Touches nothing but its arguments.
pub fn route(
    method: &str,
    params: &RequestParams,
    state: &WalletState,
    forked_from: Option<ChainId>,
) -> Route {
    let effective = effective_chain_id(state.chain_id, forked_from);
    match method {
        "eth_accounts" | "eth_requestAccounts" => {
            Route::Respond(ResponseResult::success(state.accounts()))
        }
        "eth_chainId" => Route::Respond(ResponseResult::success(format!("{effective:#x}"))),
        "net_version" => Route::Respond(ResponseResult::success(effective.to_string())),
        "wallet_switchEthereumChain" => {
            let Some(requested) = params.as_array().first().and_then(switch_target) else {
                return RpcError::invalid_params("Invalid params").into();
            };
            if requested == effective {
                Route::Respond(ResponseResult::Success(Value::Null))
            } else if !is_switchable(requested) {
                RpcError::unrecognized_chain("Unrecognized chain ID").into()
            } else {
                Route::SwitchChain(requested)
            }
        }
        "wallet_addEthereumChain" => {
            RpcError::unrecognized_chain("Adding chains is not supported").into()
        }
        "wallet_requestPermissions" => Route::Respond(ResponseResult::Success(json!([
            { "parentCapability": "eth_accounts" }
        ]))),
        method if is_signing(method) => {
            let Some(selected) = &state.selected_address else {
                return RpcError::unauthorized(NOT_CONNECTED).into();
            };
            if !is_fork(state.chain_id) {
                return RpcError::unsupported_method(WATCH_ONLY).into();
            }
            if let Err(err) = validate_typed_data(method, params) {
                return err.into();
            }
            Route::Sign {
                from: selected.address,
                approval: state.require_approval && requires_approval(method),
            }
        }
        method if is_blocked(method) => {
            RpcError::unsupported_method(format!("Method {method} is not available")).into()
        }
        _ => Route::Proxy { chain_id: state.chain_id },
    }
}

/// Accepts hex strings, decimal strings and plain numbers.
fn switch_target(param: &Value) -> Option<ChainId> {
    match param.get("chainId")? {
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => ChainId::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// EIP-712 payloads must be well formed before anything is sent to the node.
fn validate_typed_data(method: &str, params: &RequestParams) -> Result<(), RpcError> {
    if !matches!(method, "eth_signTypedData_v4" | "eth_signTypedData_v3") {
        return Ok(());
    }
    let payload = params
        .as_array()
        .get(1)
        .ok_or_else(|| RpcError::invalid_params("Missing typed data"))?;
    let typed: TypedData = serde_json::from_value(payload.clone())
        .map_err(|err| RpcError::invalid_params(format!("Invalid typed data: {err}")))?;
    typed
        .eip712_signing_hash()
        .map_err(|err| RpcError::invalid_params(format!("Invalid typed data: {err}")))?;
    Ok(())
}

/// Executes page requests.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    state: StateStore,
    fork: Arc<ForkAdapter>,
    approvals: Arc<ApprovalCoordinator>,
    clients: Arc<ClientCache>,
    networks: Arc<Networks>,
    pages: Arc<Fanout<PageNotification>>,
    views: Arc<Fanout<ViewEvent>>,
}

impl Dispatcher {
    pub fn new(
        state: StateStore,
        fork: Arc<ForkAdapter>,
        approvals: Arc<ApprovalCoordinator>,
        clients: Arc<ClientCache>,
        networks: Arc<Networks>,
        pages: Arc<Fanout<PageNotification>>,
        views: Arc<Fanout<ViewEvent>>,
    ) -> Self {
        Self { state, fork, approvals, clients, networks, pages, views }
    }

    /// Handles a single method call.
    pub async fn on_call(&self, call: RpcMethodCall) -> RpcResponse {
        trace!(target: "devwallet::rpc", method = %call.method, id = %call.id, "received method call");
        let RpcMethodCall { method, params, id, .. } = call;
        let result = self.dispatch(&method, params).await;
        if let Some(err) = result.as_error() {
            debug!(target: "devwallet::rpc", %method, code = err.code.code(), message = %err.message, "request failed");
        }
        RpcResponse::new(id, result)
    }

    /// Handles `method` against the current state.
    pub async fn dispatch(&self, method: &str, params: RequestParams) -> ResponseResult {
        let state = self.state.get().await;
        let forked_from = self.fork.forked_from().await;

        match route(method, &params, &state, forked_from) {
            Route::Respond(result) => result,
            Route::SwitchChain(chain_id) => self.switch_chain(&state, chain_id).await,
            Route::Sign { from, approval } => self.sign(&state, method, params, from, approval).await,
            Route::Proxy { chain_id } => {
                let url = state.rpc_url(&self.networks, chain_id).to_string();
                self.proxy(chain_id, &url, method, params).await
            }
        }
    }

    async fn switch_chain(&self, current: &WalletState, chain_id: ChainId) -> ResponseResult {
        let state = match self.state.set(StatePatch::default().chain_id(chain_id)).await {
            Ok(state) => state,
            Err(err) => return RpcError::internal_error_with(err.to_string()).into(),
        };
        let forked_from = if is_fork(chain_id) {
            self.fork.refresh(state.rpc_url(&self.networks, FORK_CHAIN_ID)).await
        } else {
            if is_fork(current.chain_id) {
                self.fork.clear_forked_from().await;
            }
            None
        };
        info!(target: "devwallet::rpc", chain_id, ?forked_from, "page switched chain");

        let effective = effective_chain_id(chain_id, forked_from);
        self.pages.broadcast(PageNotification::chain_changed(effective));
        self.views.broadcast(ViewEvent::state(state));
        ResponseResult::Success(Value::Null)
    }

    async fn sign(
        &self,
        state: &WalletState,
        method: &str,
        params: RequestParams,
        from: Address,
        approval: bool,
    ) -> ResponseResult {
        if approval {
            match self.approvals.request_approval(method, from).await {
                Ok(true) => {}
                Ok(false) => return RpcError::user_rejected(USER_REJECTED).into(),
                Err(err) => return RpcError::internal_error_with(err.to_string()).into(),
            }
        }

        let url = state.rpc_url(&self.networks, FORK_CHAIN_ID).to_string();
        let res = self
            .fork
            .with_impersonation(&url, from, || self.proxy(FORK_CHAIN_ID, &url, method, params))
            .await;
        match res {
            Ok(result) => result,
            Err(err) => {
                warn!(target: "devwallet::rpc", %from, %err, "impersonation failed");
                RpcError::with_message(ErrorCode::ServerError(FORK_ERROR), err.message()).into()
            }
        }
    }

    async fn proxy(
        &self,
        chain_id: ChainId,
        url: &str,
        method: &str,
        params: RequestParams,
    ) -> ResponseResult {
        let custom = self.networks.is_custom_url(chain_id, url);
        let client = match self.clients.client(chain_id, url, custom) {
            Ok(client) => client,
            Err(err) => {
                warn!(target: "devwallet::rpc", url, %err, "no upstream client");
                return RpcError::internal_error_with(RPC_FAILED).into();
            }
        };
        match client.request(method, params.into()).await {
            Ok(result) => ResponseResult::Success(result),
            // the endpoint's own error objects pass through untouched
            Err(TransportError::Rpc(err)) => ResponseResult::Error(err),
            Err(err) => {
                warn!(target: "devwallet::rpc", url, method, %err, "upstream request failed");
                RpcError::internal_error_with(RPC_FAILED).into()
            }
        }
    }
}

//! Local fork node support: origin detection, pre-funded accounts and scoped impersonation.

use crate::{
    client::{ClientCache, RpcTransport, TransportError},
    networks::{FORK_CHAIN_ID, Networks, is_fork, is_supported},
    storage::{self, KvStore},
};
use alloy_primitives::{Address, ChainId};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Session storage key of the detected fork origin.
pub const FORK_ORIGIN_KEY: &str = "fork_origin";

#[derive(Debug, thiserror::Error)]
pub enum ImpersonationError {
    #[error("failed to impersonate {address}: {source}")]
    Start {
        address: Address,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ImpersonationError {
    /// The message shown to pages; the node's own wording when it produced one.
    pub fn message(&self) -> String {
        match self {
            Self::Start { source, .. } => {
                source.as_rpc().map_or_else(|| self.to_string(), |err| err.message.to_string())
            }
            Self::Transport(_) => self.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    environment: Option<NodeEnvironment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeEnvironment {
    chain_id: Option<u64>,
}

/// Talks to the local fork node.
#[derive(Debug)]
pub struct ForkAdapter {
    clients: Arc<ClientCache>,
    networks: Arc<Networks>,
    session: Arc<dyn KvStore>,
    /// In-memory copy of the session record.
    origin: Mutex<Option<ChainId>>,
}

impl ForkAdapter {
    pub fn new(clients: Arc<ClientCache>, networks: Arc<Networks>, session: Arc<dyn KvStore>) -> Self {
        Self { clients, networks, session, origin: Mutex::new(None) }
    }

    /// Probes `rpc_url` and returns the production chain it forks, if any.
    ///
    /// Never fails: an unreachable or unrecognised node reads as "no fork".
    pub async fn detect(&self, rpc_url: &str) -> Option<ChainId> {
        match self.try_detect(rpc_url).await {
            Ok(origin) => {
                debug!(target: "devwallet::fork", rpc_url, ?origin, "fork detection finished");
                origin
            }
            Err(err) => {
                debug!(target: "devwallet::fork", rpc_url, %err, "fork detection failed");
                None
            }
        }
    }

    async fn try_detect(&self, rpc_url: &str) -> Result<Option<ChainId>, TransportError> {
        let client = self.client(rpc_url)?;
        let info = client.request("anvil_nodeInfo", json!([])).await?;
        let chain_id = serde_json::from_value::<NodeInfo>(info)
            .ok()
            .and_then(|info| info.environment)
            .and_then(|env| env.chain_id);

        match chain_id {
            // the node kept its origin's id
            Some(id) if is_supported(id) => Ok(Some(id)),
            Some(id) if is_fork(id) => self.probe_contracts(&*client).await,
            _ => Ok(None),
        }
    }

    /// Looks for a well-known contract of each production chain, in order.
    async fn probe_contracts(&self, client: &dyn RpcTransport) -> Result<Option<ChainId>, TransportError> {
        for (chain_id, network) in self.networks.production() {
            let Some(probe) = network.probe else { continue };
            if has_code(client, probe).await? {
                return Ok(Some(chain_id));
            }
        }
        Ok(None)
    }

    /// Runs detection and records the outcome as the cached origin.
    pub async fn refresh(&self, rpc_url: &str) -> Option<ChainId> {
        let origin = self.detect(rpc_url).await;
        match origin {
            Some(origin) => self.set_forked_from(origin).await,
            None => self.clear_forked_from().await,
        }
        origin
    }

    /// The cached fork origin.
    pub async fn forked_from(&self) -> Option<ChainId> {
        if let Some(origin) = *self.origin.lock() {
            return Some(origin);
        }
        let stored = match storage::read::<ChainId>(&*self.session, FORK_ORIGIN_KEY).await {
            Ok(stored) => stored.filter(|id| is_supported(*id)),
            Err(err) => {
                warn!(target: "devwallet::fork", %err, "ignoring unreadable fork origin");
                None
            }
        };
        if stored.is_some() {
            *self.origin.lock() = stored;
        }
        stored
    }

    pub async fn set_forked_from(&self, origin: ChainId) {
        *self.origin.lock() = Some(origin);
        if let Err(err) = storage::write(&*self.session, FORK_ORIGIN_KEY, &origin).await {
            warn!(target: "devwallet::fork", %err, "failed to persist fork origin");
        }
    }

    /// Forgets the cached origin, e.g. after leaving the fork network.
    pub async fn clear_forked_from(&self) {
        *self.origin.lock() = None;
        if let Err(err) = self.session.remove(FORK_ORIGIN_KEY).await {
            warn!(target: "devwallet::fork", %err, "failed to clear fork origin");
        }
    }

    /// The node's pre-funded accounts, empty on any error.
    pub async fn get_accounts(&self, rpc_url: &str) -> Vec<Address> {
        let res = match self.client(rpc_url) {
            Ok(client) => client.request("eth_accounts", json!([])).await,
            Err(err) => Err(err),
        };
        match res.map(serde_json::from_value::<Vec<Address>>) {
            Ok(Ok(accounts)) => accounts,
            Ok(Err(err)) => {
                debug!(target: "devwallet::fork", %err, "malformed eth_accounts response");
                Vec::new()
            }
            Err(err) => {
                debug!(target: "devwallet::fork", %err, "failed to fetch fork accounts");
                Vec::new()
            }
        }
    }

    /// Impersonates `address` for the duration of `f`.
    ///
    /// Impersonation is always stopped afterwards, also when `f` is dropped before completing;
    /// a failing stop call is logged and never replaces `f`'s output. If impersonation cannot be
    /// started, `f` is not run.
    pub async fn with_impersonation<F, Fut, T>(
        &self,
        rpc_url: &str,
        address: Address,
        f: F,
    ) -> Result<T, ImpersonationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let client = self.client(rpc_url)?;
        client
            .request("anvil_impersonateAccount", json!([address]))
            .await
            .map_err(|source| ImpersonationError::Start { address, source })?;
        trace!(target: "devwallet::fork", %address, "impersonating");

        let guard = Impersonation { client, address, active: true };
        let out = f().await;
        guard.stop().await;
        Ok(out)
    }

    fn client(&self, rpc_url: &str) -> Result<Arc<dyn RpcTransport>, TransportError> {
        self.clients.client(FORK_CHAIN_ID, rpc_url, true)
    }
}

/// Stops impersonating when dropped without an explicit [`Impersonation::stop`].
struct Impersonation {
    client: Arc<dyn RpcTransport>,
    address: Address,
    active: bool,
}

impl Impersonation {
    async fn stop(mut self) {
        self.active = false;
        stop_impersonating(&*self.client, self.address).await;
    }
}

impl Drop for Impersonation {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let client = self.client.clone();
        let address = self.address;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { stop_impersonating(&*client, address).await });
        }
    }
}

async fn stop_impersonating(client: &dyn RpcTransport, address: Address) {
    if let Err(err) = client.request("anvil_stopImpersonatingAccount", json!([address])).await {
        warn!(target: "devwallet::fork", %address, %err, "failed to stop impersonating");
    }
}

async fn has_code(client: &dyn RpcTransport, address: Address) -> Result<bool, TransportError> {
    let code = client.request("eth_getCode", json!([address, "latest"])).await?;
    Ok(match code {
        Value::String(code) => code != "0x" && code != "0x0",
        _ => false,
    })
}

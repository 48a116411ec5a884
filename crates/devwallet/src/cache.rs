//! Operator and module-availability caches.
//!
//! Operator lists are persisted per `(module, chain)` and served regardless of age; callers use
//! [`is_stale`] to decide whether a background refresh is due. Availability is tracked in two
//! tiers: a short-lived in-memory map consulted first, and a persisted per-chain record.

use crate::{
    client::{ClientCache, RpcTransport, TransportError},
    networks::{NetworkConfig, Networks},
    registry::{self, RegistryError},
    storage::{self, KvStore, StorageError},
    types::{CacheContext, ModuleAvailability, ModuleType, OperatorCacheEntry, unix_millis},
};
use alloy_primitives::ChainId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;

/// Operator lists older than this are refreshed in the background.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// How long an availability probe result is trusted in memory.
pub const AVAILABILITY_TTL: Duration = Duration::from_secs(5 * 60);

/// Rows requested per registry page.
pub const BATCH_SIZE: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("chain {0} has no registry deployment")]
    UnsupportedChain(ChainId),
    #[error("no discovery contract configured for chain {0}")]
    NoDiscovery(ChainId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Returns true if the entry is older than [`STALE_AFTER`].
pub fn is_stale(entry: &OperatorCacheEntry) -> bool {
    is_stale_at(entry, unix_millis())
}

/// [`is_stale`] against an explicit clock, in unix milliseconds. An entry exactly
/// [`STALE_AFTER`] old is still fresh.
pub fn is_stale_at(entry: &OperatorCacheEntry, now: u64) -> bool {
    now.saturating_sub(entry.last_fetched_at) > STALE_AFTER.as_millis() as u64
}

/// Durable storage key of a chain's availability record.
pub fn availability_key(chain_id: ChainId) -> String {
    format!("module_availability_{chain_id}")
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailabilityRecord {
    #[serde(flatten)]
    modules: ModuleAvailability,
    checked_at: u64,
}

#[derive(Clone, Copy, Debug)]
struct Probe {
    available: bool,
    checked_at: Instant,
}

/// The cache layer. Owns every outbound registry read.
#[derive(Debug)]
pub struct OperatorCache {
    durable: Arc<dyn KvStore>,
    clients: Arc<ClientCache>,
    networks: Arc<Networks>,
    availability: Mutex<HashMap<(ModuleType, ChainId), Probe>>,
}

impl OperatorCache {
    pub fn new(durable: Arc<dyn KvStore>, clients: Arc<ClientCache>, networks: Arc<Networks>) -> Self {
        Self { durable, clients, networks, availability: Default::default() }
    }

    /// Pages through the registry and replaces the cached entry for the context.
    ///
    /// Failures propagate and leave the previous entry untouched.
    pub async fn fetch_operators(&self, ctx: &CacheContext) -> Result<OperatorCacheEntry, CacheError> {
        let target = ctx.call_target();
        let network = self.network(target)?;
        let discovery = network.discovery.ok_or(CacheError::NoDiscovery(target))?;
        let module_id = module_id(network, ctx.module_type);
        let client = self.client(ctx)?;

        let mut operators = Vec::new();
        let mut offset = 0;
        loop {
            let batch =
                registry::get_node_operators(&*client, discovery, module_id, offset, BATCH_SIZE)
                    .await?;
            let len = batch.len() as u64;
            trace!(target: "devwallet::cache", offset, len, "fetched operator page");
            operators.extend(batch.into_iter().map(|info| registry::decode_operator(ctx.module_type, info)));
            if len < BATCH_SIZE {
                break;
            }
            offset += BATCH_SIZE;
        }

        let entry = OperatorCacheEntry { operators, last_fetched_at: unix_millis() };
        storage::write(&*self.durable, &ctx.storage_key(), &entry).await?;
        debug!(
            target: "devwallet::cache",
            chain_id = ctx.chain_id,
            module = %ctx.module_type,
            count = entry.operators.len(),
            "operator cache refreshed"
        );
        Ok(entry)
    }

    /// Returns the cached entry, without touching the network.
    pub async fn get_cached_operators(&self, ctx: &CacheContext) -> Option<OperatorCacheEntry> {
        match storage::read(&*self.durable, &ctx.storage_key()).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "devwallet::cache", %err, "ignoring unreadable operator cache");
                None
            }
        }
    }

    /// Whether the context's module is deployed. Never fails: any error reads as unavailable.
    pub async fn is_module_available(&self, ctx: &CacheContext) -> bool {
        let key = (ctx.module_type, ctx.chain_id);
        if let Some(probe) = self.availability.lock().get(&key).copied()
            && probe.checked_at.elapsed() < AVAILABILITY_TTL
        {
            return probe.available;
        }

        // once seen, an available module never needs confirming again
        if ctx.module_type == ModuleType::Cm
            && self.get_module_availability(ctx.chain_id).await.is_some_and(|m| m.cm)
        {
            self.record(key, true);
            return true;
        }

        let available = match self.probe_module(ctx).await {
            Ok(available) => available,
            Err(err) => {
                debug!(target: "devwallet::cache", %err, module = %ctx.module_type, "availability probe failed");
                false
            }
        };
        self.record(key, available);
        available
    }

    /// The persisted availability record of a chain.
    pub async fn get_module_availability(&self, chain_id: ChainId) -> Option<ModuleAvailability> {
        match storage::read::<AvailabilityRecord>(&*self.durable, &availability_key(chain_id)).await {
            Ok(record) => record.map(|r| r.modules),
            Err(err) => {
                warn!(target: "devwallet::cache", %err, "ignoring unreadable availability record");
                None
            }
        }
    }

    /// Persists a chain's availability, stamped with the current time.
    pub async fn set_module_availability(
        &self,
        chain_id: ChainId,
        modules: ModuleAvailability,
    ) -> Result<(), StorageError> {
        let record = AvailabilityRecord { modules, checked_at: unix_millis() };
        storage::write(&*self.durable, &availability_key(chain_id), &record).await
    }

    /// The shared upstream clients.
    pub fn clients(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    pub fn networks(&self) -> &Arc<Networks> {
        &self.networks
    }

    fn record(&self, key: (ModuleType, ChainId), available: bool) {
        self.availability.lock().insert(key, Probe { available, checked_at: Instant::now() });
    }

    async fn probe_module(&self, ctx: &CacheContext) -> Result<bool, CacheError> {
        let target = ctx.call_target();
        let network = self.network(target)?;
        let discovery = network.discovery.ok_or(CacheError::NoDiscovery(target))?;
        let client = self.client(ctx)?;
        let module = registry::get_module_address(
            &*client,
            discovery,
            module_id(network, ctx.module_type),
        )
        .await?;
        Ok(!module.is_zero())
    }

    fn network(&self, chain_id: ChainId) -> Result<&NetworkConfig, CacheError> {
        self.networks.get(chain_id).ok_or(CacheError::UnsupportedChain(chain_id))
    }

    fn client(&self, ctx: &CacheContext) -> Result<Arc<dyn RpcTransport>, CacheError> {
        let custom = self.networks.is_custom_url(ctx.chain_id, &ctx.rpc_url);
        Ok(self.clients.client(ctx.call_target(), &ctx.rpc_url, custom)?)
    }
}

fn module_id(network: &NetworkConfig, module_type: ModuleType) -> u64 {
    match module_type {
        ModuleType::Csm => network.csm_module_id,
        ModuleType::Cm => network.cm_module_id,
    }
}

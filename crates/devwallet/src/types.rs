//! Wallet state and cache records shared by every component.

use crate::networks::{self, MAINNET, Networks};
use alloy_primitives::{Address, ChainId};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

/// Which on-chain registry module is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    /// Community staking module.
    #[default]
    Csm,
    /// Curated module.
    Cm,
}

impl ModuleType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Csm => "csm",
            Self::Cm => "cm",
        }
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csm" => Ok(Self::Csm),
            "cm" => Ok(Self::Cm),
            other => Err(format!("unknown module type: {other}")),
        }
    }
}

/// The operator address a selection was made from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressRole {
    Manager,
    Rewards,
    ProposedManager,
    ProposedRewards,
}

/// Where a selected address came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AddressSource {
    /// One of a registry operator's addresses.
    #[serde(rename_all = "camelCase")]
    Operator { operator_id: String, role: AddressRole },
    /// Typed in by the user.
    Manual,
    /// A pre-funded account of the local fork node.
    #[serde(alias = "anvil")]
    Fork { index: usize },
}

/// The address the wallet currently exposes to pages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedAddress {
    pub address: Address,
    pub source: AddressSource,
    /// Set when a QA key for the address has been imported this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_sign: Option<bool>,
}

impl SelectedAddress {
    pub fn new(address: Address, source: AddressSource) -> Self {
        Self { address, source, can_sign: None }
    }
}

/// The durable wallet configuration, stored as a single record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    pub chain_id: ChainId,
    #[serde(default)]
    pub module_type: ModuleType,
    #[serde(default)]
    pub selected_address: Option<SelectedAddress>,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub custom_rpc_urls: BTreeMap<ChainId, String>,
    /// Scoped keys, `<module>:<chainId>:<operatorId>`.
    #[serde(default)]
    pub favorites: Vec<String>,
    /// Checksummed, in insertion order.
    #[serde(default)]
    pub manual_addresses: Vec<Address>,
    /// Keyed by lower-cased address.
    #[serde(default)]
    pub address_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub require_approval: bool,
}

impl Default for WalletState {
    fn default() -> Self {
        Self {
            chain_id: MAINNET,
            module_type: ModuleType::Csm,
            selected_address: None,
            is_connected: false,
            custom_rpc_urls: BTreeMap::new(),
            favorites: Vec::new(),
            manual_addresses: Vec::new(),
            address_labels: BTreeMap::new(),
            require_approval: false,
        }
    }
}

impl WalletState {
    /// The user-configured endpoint for a chain, if any.
    pub fn custom_rpc_url(&self, chain_id: ChainId) -> Option<&str> {
        self.custom_rpc_urls.get(&chain_id).map(String::as_str)
    }

    /// The endpoint used for a chain: the custom override if any, the built-in default otherwise.
    pub fn rpc_url<'a>(&'a self, networks: &'a Networks, chain_id: ChainId) -> &'a str {
        self.custom_rpc_url(chain_id).unwrap_or_else(|| networks.default_rpc_url(chain_id))
    }

    /// Accounts exposed to pages.
    pub fn accounts(&self) -> Vec<Address> {
        self.selected_address.iter().map(|s| s.address).collect()
    }

    /// Returns true if the wallet currently points at the local fork.
    pub const fn is_on_fork(&self) -> bool {
        networks::is_fork(self.chain_id)
    }
}

/// A shallow update of [`WalletState`]; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatePatch {
    pub chain_id: Option<ChainId>,
    pub module_type: Option<ModuleType>,
    pub selected_address: Option<Option<SelectedAddress>>,
    pub is_connected: Option<bool>,
    pub custom_rpc_urls: Option<BTreeMap<ChainId, String>>,
    pub favorites: Option<Vec<String>>,
    pub manual_addresses: Option<Vec<Address>>,
    pub address_labels: Option<BTreeMap<String, String>>,
    pub require_approval: Option<bool>,
}

impl StatePatch {
    pub fn chain_id(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn module_type(mut self, module_type: ModuleType) -> Self {
        self.module_type = Some(module_type);
        self
    }

    /// Sets the selection and the matching connection flag.
    pub fn selected_address(mut self, selected: Option<SelectedAddress>) -> Self {
        self.is_connected = Some(selected.is_some());
        self.selected_address = Some(selected);
        self
    }

    pub fn custom_rpc_urls(mut self, urls: BTreeMap<ChainId, String>) -> Self {
        self.custom_rpc_urls = Some(urls);
        self
    }

    pub fn favorites(mut self, favorites: Vec<String>) -> Self {
        self.favorites = Some(favorites);
        self
    }

    pub fn manual_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.manual_addresses = Some(addresses);
        self
    }

    pub fn address_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.address_labels = Some(labels);
        self
    }

    pub fn require_approval(mut self, enabled: bool) -> Self {
        self.require_approval = Some(enabled);
        self
    }

    /// Applies the patch on top of `state`.
    pub fn apply(self, mut state: WalletState) -> WalletState {
        let Self {
            chain_id,
            module_type,
            selected_address,
            is_connected,
            custom_rpc_urls,
            favorites,
            manual_addresses,
            address_labels,
            require_approval,
        } = self;
        if let Some(v) = chain_id {
            state.chain_id = v;
        }
        if let Some(v) = module_type {
            state.module_type = v;
        }
        if let Some(v) = selected_address {
            state.selected_address = v;
        }
        if let Some(v) = is_connected {
            state.is_connected = v;
        }
        if let Some(v) = custom_rpc_urls {
            state.custom_rpc_urls = v;
        }
        if let Some(v) = favorites {
            state.favorites = v;
        }
        if let Some(v) = manual_addresses {
            state.manual_addresses = v;
        }
        if let Some(v) = address_labels {
            state.address_labels = v;
        }
        if let Some(v) = require_approval {
            state.require_approval = v;
        }
        state
    }
}

/// A registry operator, flattened for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: String,
    pub manager_address: Address,
    pub rewards_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_manager_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_rewards_address: Option<Address>,
    pub extended_manager_permissions: bool,
    /// Manager when it holds extended permissions, rewards otherwise.
    pub owner_address: Address,
    pub curve_id: String,
    pub operator_type: String,
}

/// A cached operator list for one `(module, chain)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCacheEntry {
    pub operators: Vec<Operator>,
    /// Unix time in milliseconds.
    pub last_fetched_at: u64,
}

/// Which modules exist on a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleAvailability {
    pub csm: bool,
    pub cm: bool,
}

/// Describes what a cache read or refresh targets. Derived per request, never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheContext {
    pub chain_id: ChainId,
    pub module_type: ModuleType,
    pub rpc_url: String,
    /// Set when `chain_id` is the fork sentinel: the registry to query belongs to this chain.
    pub forked_from: Option<ChainId>,
}

impl CacheContext {
    pub fn new(chain_id: ChainId, module_type: ModuleType, rpc_url: impl Into<String>) -> Self {
        Self { chain_id, module_type, rpc_url: rpc_url.into(), forked_from: None }
    }

    pub fn with_forked_from(mut self, origin: ChainId) -> Self {
        self.forked_from = Some(origin);
        self
    }

    /// The chain whose contracts are called.
    pub fn call_target(&self) -> ChainId {
        self.forked_from.unwrap_or(self.chain_id)
    }

    /// Durable storage key of the operator list.
    pub fn storage_key(&self) -> String {
        operators_key(self.module_type, self.chain_id)
    }
}

/// Durable storage key of an operator list.
pub fn operators_key(module_type: ModuleType, chain_id: ChainId) -> String {
    format!("operators_{module_type}_{chain_id}")
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

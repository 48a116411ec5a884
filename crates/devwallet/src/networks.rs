//! Known networks and the chain-id rules every component agrees on.

use alloy_primitives::{Address, ChainId, address};
use serde::{Deserialize, Serialize};

/// Ethereum mainnet.
pub const MAINNET: ChainId = 1;

/// Hoodi testnet.
pub const HOODI: ChainId = 560048;

/// The id a local fork node reports unless told to keep its origin's id.
pub const FORK_CHAIN_ID: ChainId = 31337;

/// Production chains the wallet can be pointed at.
pub const SUPPORTED_CHAINS: [ChainId; 2] = [MAINNET, HOODI];

/// Default endpoint of the local fork node.
pub const DEFAULT_FORK_RPC_URL: &str = "http://127.0.0.1:8545";

/// Returns true for the production chains.
pub fn is_supported(chain_id: ChainId) -> bool {
    SUPPORTED_CHAINS.contains(&chain_id)
}

/// Returns true for the local fork sentinel.
pub const fn is_fork(chain_id: ChainId) -> bool {
    chain_id == FORK_CHAIN_ID
}

/// Returns true for any chain the wallet can switch to.
pub fn is_switchable(chain_id: ChainId) -> bool {
    is_supported(chain_id) || is_fork(chain_id)
}

/// The chain id a dApp observes: on a detected fork this is the origin's id, so pages see the
/// network the fork replays rather than the node's raw id.
pub fn effective_chain_id(chain_id: ChainId, forked_from: Option<ChainId>) -> ChainId {
    match forked_from {
        Some(origin) if is_fork(chain_id) => origin,
        _ => chain_id,
    }
}

/// Human readable network name, used in logs.
pub fn network_name(chain_id: ChainId) -> &'static str {
    match chain_id {
        MAINNET => "Ethereum Mainnet",
        HOODI => "Hoodi Testnet",
        FORK_CHAIN_ID => "Local Fork",
        _ => "Unknown",
    }
}

/// Per-network endpoints and registry contracts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Public endpoint used when no custom url is configured.
    pub rpc_url: String,
    /// Registry-discovery contract queried for operators and module availability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<Address>,
    /// Contract whose bytecode identifies this network inside a fork.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<Address>,
    /// Staking module id of the primary (CSM) module.
    pub csm_module_id: u64,
    /// Staking module id of the secondary (CM) module.
    pub cm_module_id: u64,
}

impl NetworkConfig {
    /// Defaults for Ethereum mainnet.
    pub fn mainnet() -> Self {
        Self {
            rpc_url: "https://eth.drpc.org".to_string(),
            discovery: None,
            probe: Some(address!("0xdA7dE2ECdDfccC6c3AF10108Db212ACBBf9EA83F")),
            csm_module_id: 3,
            cm_module_id: 1,
        }
    }

    /// Defaults for the Hoodi testnet.
    pub fn hoodi() -> Self {
        Self {
            rpc_url: "https://ethereum-hoodi-rpc.publicnode.com".to_string(),
            discovery: None,
            probe: Some(address!("0x79CEf36D84743222f37765204Bec41E92a93E59d")),
            csm_module_id: 4,
            cm_module_id: 1,
        }
    }
}

/// The set of production networks plus the fork endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Networks {
    #[serde(default = "NetworkConfig::mainnet")]
    pub mainnet: NetworkConfig,
    #[serde(default = "NetworkConfig::hoodi")]
    pub hoodi: NetworkConfig,
    /// Default endpoint of the local fork node.
    #[serde(default = "default_fork_rpc_url")]
    pub fork_rpc_url: String,
}

impl Default for Networks {
    fn default() -> Self {
        Self {
            mainnet: NetworkConfig::mainnet(),
            hoodi: NetworkConfig::hoodi(),
            fork_rpc_url: default_fork_rpc_url(),
        }
    }
}

impl Networks {
    /// Returns the configuration of a production chain.
    pub fn get(&self, chain_id: ChainId) -> Option<&NetworkConfig> {
        match chain_id {
            MAINNET => Some(&self.mainnet),
            HOODI => Some(&self.hoodi),
            _ => None,
        }
    }

    /// Default endpoint for a chain id. Unknown ids fall back to mainnet's endpoint.
    pub fn default_rpc_url(&self, chain_id: ChainId) -> &str {
        if is_fork(chain_id) {
            return &self.fork_rpc_url;
        }
        self.get(chain_id).unwrap_or(&self.mainnet).rpc_url.as_str()
    }

    /// Returns true if `url` should be treated as a slow, self-hosted endpoint: any url other
    /// than the built-in default, and always the local fork.
    pub fn is_custom_url(&self, chain_id: ChainId, url: &str) -> bool {
        is_fork(chain_id) || url != self.default_rpc_url(chain_id)
    }

    /// Production chains in probe order.
    pub fn production(&self) -> impl Iterator<Item = (ChainId, &NetworkConfig)> {
        [(MAINNET, &self.mainnet), (HOODI, &self.hoodi)].into_iter()
    }
}

fn default_fork_rpc_url() -> String {
    DEFAULT_FORK_RPC_URL.to_string()
}

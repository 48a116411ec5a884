//! Messages exchanged with views and pages.

use crate::types::{
    AddressSource, ModuleAvailability, ModuleType, Operator, OperatorCacheEntry, WalletState,
};
use alloy_primitives::{Address, ChainId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A command sent by a view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ViewCommand {
    GetState,
    SelectAddress { address: String, source: AddressSource },
    Disconnect,
    SwitchNetwork { chain_id: ChainId },
    SwitchModule { module_type: ModuleType },
    RequestOperators { chain_id: ChainId, module_type: ModuleType },
    RefreshOperators { chain_id: ChainId, module_type: ModuleType },
    ToggleFavorite { operator_id: String },
    AddManualAddress { address: String },
    RemoveManualAddress { address: String },
    SetAddressLabel { address: String, label: String },
    SetCustomRpc { chain_id: ChainId, rpc_url: String },
    SetRequireApproval { enabled: bool },
    ImportKey { address: String, private_key: String },
    RemoveKey { address: String },
    ApprovalResponse { id: Uuid, approved: bool },
}

/// An event pushed to views.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ViewEvent {
    StateUpdate {
        state: WalletState,
    },
    OperatorsUpdate {
        chain_id: ChainId,
        module_type: ModuleType,
        operators: Vec<Operator>,
        last_fetched_at: u64,
    },
    OperatorsLoading {
        chain_id: ChainId,
        module_type: ModuleType,
        loading: bool,
    },
    ModuleAvailability {
        modules: ModuleAvailability,
    },
    ForkStatus {
        forked_from: Option<ChainId>,
        accounts: Vec<Address>,
    },
    ApprovalRequested {
        id: Uuid,
        method: String,
        from: Address,
        url: String,
    },
    Error {
        message: String,
    },
}

impl ViewEvent {
    pub fn state(state: WalletState) -> Self {
        Self::StateUpdate { state }
    }

    pub fn operators(chain_id: ChainId, module_type: ModuleType, entry: OperatorCacheEntry) -> Self {
        Self::OperatorsUpdate {
            chain_id,
            module_type,
            operators: entry.operators,
            last_fetched_at: entry.last_fetched_at,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

/// An EIP-1193 event for embedding pages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum PageNotification {
    AccountsChanged(Vec<Address>),
    /// Hex encoded chain id.
    ChainChanged(String),
}

impl PageNotification {
    pub fn chain_changed(chain_id: ChainId) -> Self {
        Self::ChainChanged(format!("{chain_id:#x}"))
    }
}

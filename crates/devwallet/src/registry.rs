//! Bindings for the on-chain registry-discovery contract.

use crate::{
    client::{RpcTransport, TransportError},
    types::{ModuleType, Operator},
};
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolCall, sol};

sol! {
    #[sol(all_derives)]
    /// Read-only view over the staking modules and their node operators.
    interface IStakingModuleDiscovery {
        struct NodeOperatorInfo {
            uint256 id;
            address managerAddress;
            address rewardAddress;
            address proposedManagerAddress;
            address proposedRewardAddress;
            bool extendedManagerPermissions;
            uint256 curveId;
        }

        function getNodeOperators(uint256 moduleId, uint256 offset, uint256 limit)
            external
            view
            returns (NodeOperatorInfo[] memory);

        function getModuleAddresses(uint256[] memory moduleIds)
            external
            view
            returns (address[] memory);
    }
}

pub use IStakingModuleDiscovery::NodeOperatorInfo;

/// Operator type tags of the community staking module, indexed by curve id.
const CSM_OPERATOR_TYPES: &[&str] = &["DEF", "LEA", "ICS", "CC"];

/// Operator type tags of the curated module, indexed by curve id.
const CM_OPERATOR_TYPES: &[&str] = &["PTO", "PO", "PGO", "DO", "EEO", "MODC", "IODC", "CC"];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to decode registry response: {0}")]
    Decode(#[from] alloy_sol_types::Error),
}

/// Human readable operator type for a curve id. Unknown curves map to the module's base type.
pub fn operator_type(module_type: ModuleType, curve_id: U256) -> &'static str {
    let table = match module_type {
        ModuleType::Csm => CSM_OPERATOR_TYPES,
        ModuleType::Cm => CM_OPERATOR_TYPES,
    };
    usize::try_from(curve_id).ok().and_then(|idx| table.get(idx)).copied().unwrap_or(table[0])
}

/// Flattens a raw registry row.
pub fn decode_operator(module_type: ModuleType, info: NodeOperatorInfo) -> Operator {
    let NodeOperatorInfo {
        id,
        managerAddress: manager,
        rewardAddress: rewards,
        proposedManagerAddress: proposed_manager,
        proposedRewardAddress: proposed_rewards,
        extendedManagerPermissions: extended,
        curveId: curve_id,
    } = info;

    Operator {
        id: id.to_string(),
        manager_address: manager,
        rewards_address: rewards,
        proposed_manager_address: non_zero(proposed_manager),
        proposed_rewards_address: non_zero(proposed_rewards),
        extended_manager_permissions: extended,
        owner_address: if extended { manager } else { rewards },
        curve_id: curve_id.to_string(),
        operator_type: operator_type(module_type, curve_id).to_string(),
    }
}

fn non_zero(address: Address) -> Option<Address> {
    (!address.is_zero()).then_some(address)
}

/// Executes a view call against `to` at the latest block.
pub async fn eth_call<C: SolCall>(
    transport: &dyn RpcTransport,
    to: Address,
    call: &C,
) -> Result<C::Return, RegistryError> {
    let out = transport.call(to, Bytes::from(call.abi_encode())).await?;
    Ok(C::abi_decode_returns(&out)?)
}

/// Fetches one page of operators.
pub async fn get_node_operators(
    transport: &dyn RpcTransport,
    discovery: Address,
    module_id: u64,
    offset: u64,
    limit: u64,
) -> Result<Vec<NodeOperatorInfo>, RegistryError> {
    let call = IStakingModuleDiscovery::getNodeOperatorsCall {
        moduleId: U256::from(module_id),
        offset: U256::from(offset),
        limit: U256::from(limit),
    };
    eth_call(transport, discovery, &call).await
}

/// Resolves the deployed address of a staking module; zero when it does not exist.
pub async fn get_module_address(
    transport: &dyn RpcTransport,
    discovery: Address,
    module_id: u64,
) -> Result<Address, RegistryError> {
    let call =
        IStakingModuleDiscovery::getModuleAddressesCall { moduleIds: vec![U256::from(module_id)] };
    let addresses = eth_call(transport, discovery, &call).await?;
    Ok(addresses.into_iter().next().unwrap_or_default())
}

//! View commands executed by the coordinator.

use crate::utils::{DISCOVERY, Harness, Registry, Upstream, operator, unreachable, wait_for};
use alloy_primitives::{Address, address};
use devwallet::{
    cache::BATCH_SIZE,
    favorites::active_favorites,
    messages::{PageNotification, ViewCommand, ViewEvent},
    networks::{FORK_CHAIN_ID, HOODI, MAINNET},
    registry::decode_operator,
    storage::{self, KvStore},
    types::{
        AddressSource, ModuleAvailability, ModuleType, OperatorCacheEntry, StatePatch, operators_key,
    },
};
use serde_json::{Value, json};
use std::sync::Arc;

const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const DEV_ADDRESS: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

/// Production registry on every chain, no fork node.
fn registry_upstream(registry: Registry) -> Upstream {
    Upstream::new(move |call| match call.method.as_str() {
        "eth_call" => registry.eth_call(call),
        _ => Err(unreachable(call)),
    })
}

async fn seed_operators(durable: &dyn KvStore, module_type: ModuleType, chain_id: u64, ids: &[u64]) {
    let operators = ids.iter().map(|id| decode_operator(module_type, operator(*id))).collect();
    let entry = OperatorCacheEntry { operators, last_fetched_at: devwallet::types::unix_millis() };
    storage::write(durable, &operators_key(module_type, chain_id), &entry).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn favorites_follow_the_active_chain() {
    let harness = Harness::new(registry_upstream(Registry::default()));
    seed_operators(&*harness.durable, ModuleType::Csm, MAINNET, &[1, 2]).await;
    let (channel, _events) = harness.view();
    let coordinator = &harness.coordinator;

    let active = |favorites: &[String], chain_id| {
        active_favorites(favorites, ModuleType::Csm, chain_id).map(str::to_string).collect::<Vec<_>>()
    };

    assert!(coordinator.state().get().await.favorites.is_empty());
    coordinator.on_command(channel, ViewCommand::ToggleFavorite { operator_id: "1".into() }).await;
    let state = coordinator.state().get().await;
    assert_eq!(state.favorites, vec!["csm:1:1".to_string()]);

    coordinator.on_command(channel, ViewCommand::SwitchNetwork { chain_id: HOODI }).await;
    let state = coordinator.state().get().await;
    assert_eq!(state.chain_id, HOODI);
    assert!(active(&state.favorites, HOODI).is_empty());

    coordinator.on_command(channel, ViewCommand::SwitchNetwork { chain_id: MAINNET }).await;
    let state = coordinator.state().get().await;
    assert_eq!(active(&state.favorites, MAINNET), vec!["1".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_operators_pages_through_registry() {
    let count = BATCH_SIZE + 1;
    let harness = Harness::new(registry_upstream(Registry::with_operators(count)));
    let (channel, mut events) = harness.view();

    harness
        .coordinator
        .on_command(channel, ViewCommand::RequestOperators { chain_id: MAINNET, module_type: ModuleType::Csm })
        .await;

    let started = wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsLoading { .. })).await;
    assert_eq!(
        started,
        ViewEvent::OperatorsLoading { chain_id: MAINNET, module_type: ModuleType::Csm, loading: true }
    );
    let ViewEvent::OperatorsUpdate { operators, chain_id, .. } =
        wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsUpdate { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(chain_id, MAINNET);
    assert_eq!(operators.len() as u64, count);
    assert_eq!(operators[0].operator_type, "DEF");
    assert_eq!(operators[1].operator_type, "LEA");
    // even ids hold extended permissions and own through the manager address
    assert_eq!(operators[2].owner_address, operators[2].manager_address);
    assert_eq!(operators[1].owner_address, operators[1].rewards_address);
    assert_eq!(operators[1].proposed_manager_address, None);

    wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsLoading { loading: false, .. })).await;

    let calls = harness.upstream.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.params[0]["to"] == json!(DISCOVERY)));
    let cached: OperatorCacheEntry = storage::read(&*harness.durable, "operators_csm_1").await.unwrap().unwrap();
    assert_eq!(cached.operators, operators);
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_cache_is_served_without_fetching() {
    let harness = Harness::new(registry_upstream(Registry::with_operators(3)));
    seed_operators(&*harness.durable, ModuleType::Csm, MAINNET, &[7]).await;
    let (channel, mut events) = harness.view();

    harness
        .coordinator
        .on_command(channel, ViewCommand::RequestOperators { chain_id: MAINNET, module_type: ModuleType::Csm })
        .await;
    let ViewEvent::OperatorsUpdate { operators, .. } =
        wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsUpdate { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(operators.len(), 1);

    // forcing goes to the registry even though the entry is fresh
    harness
        .coordinator
        .on_command(channel, ViewCommand::RefreshOperators { chain_id: MAINNET, module_type: ModuleType::Csm })
        .await;
    wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsUpdate { operators, .. } if operators.len() == 3)).await;
    assert_eq!(harness.upstream.methods(), ["eth_call"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_refresh_keeps_stale_entry() {
    let harness = Harness::new(Upstream::offline());
    let stale = OperatorCacheEntry {
        operators: vec![decode_operator(ModuleType::Cm, operator(5))],
        last_fetched_at: 0,
    };
    storage::write(&*harness.durable, "operators_cm_560048", &stale).await.unwrap();
    let (channel, mut events) = harness.view();

    harness
        .coordinator
        .on_command(channel, ViewCommand::RequestOperators { chain_id: HOODI, module_type: ModuleType::Cm })
        .await;

    let served = wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsUpdate { .. })).await;
    assert_eq!(served, ViewEvent::operators(HOODI, ModuleType::Cm, stale.clone()));
    wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsLoading { loading: true, .. })).await;
    let ViewEvent::Error { message } = wait_for(&mut events, |e| matches!(e, ViewEvent::Error { .. })).await else {
        unreachable!()
    };
    assert!(message.starts_with("Failed to load operators"), "{message}");
    wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsLoading { loading: false, .. })).await;

    let kept: Option<OperatorCacheEntry> = storage::read(&*harness.durable, "operators_cm_560048").await.unwrap();
    assert_eq!(kept, Some(stale));
}

#[tokio::test(flavor = "multi_thread")]
async fn get_state_reports_availability_and_fork() {
    let harness = Harness::new(registry_upstream(Registry::with_operators(1)));
    harness
        .coordinator
        .cache()
        .set_module_availability(MAINNET, ModuleAvailability { csm: true, cm: false })
        .await
        .unwrap();
    let (channel, mut events) = harness.view();
    let (_, mut other) = harness.view();

    harness.coordinator.on_command(channel, ViewCommand::GetState).await;

    let ViewEvent::StateUpdate { state } = events.recv().await.unwrap() else { panic!("expected state first") };
    assert_eq!(state.chain_id, MAINNET);
    // the snapshot only goes to the requester
    assert!(!matches!(other.try_recv(), Ok(ViewEvent::StateUpdate { .. })));

    let persisted = wait_for(&mut events, |e| matches!(e, ViewEvent::ModuleAvailability { .. })).await;
    assert_eq!(persisted, ViewEvent::ModuleAvailability { modules: ModuleAvailability { csm: true, cm: false } });
    let checked = wait_for(&mut events, |e| matches!(e, ViewEvent::ModuleAvailability { .. })).await;
    assert_eq!(checked, ViewEvent::ModuleAvailability { modules: ModuleAvailability { csm: true, cm: true } });

    let fork = wait_for(&mut events, |e| matches!(e, ViewEvent::ForkStatus { .. })).await;
    assert_eq!(fork, ViewEvent::ForkStatus { forked_from: None, accounts: vec![] });

    let stored = harness.coordinator.cache().get_module_availability(MAINNET).await;
    assert_eq!(stored, Some(ModuleAvailability { csm: true, cm: true }));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_fork_falls_back_to_mainnet() {
    let harness = Harness::new(registry_upstream(Registry::default()));
    harness.coordinator.state().set(StatePatch::default().chain_id(FORK_CHAIN_ID)).await.unwrap();
    let (channel, mut events) = harness.view();
    let mut page = harness.page();

    harness.coordinator.on_command(channel, ViewCommand::GetState).await;

    wait_for(&mut events, |e| matches!(e, ViewEvent::StateUpdate { state } if state.chain_id == MAINNET)).await;
    assert_eq!(page.recv().await.unwrap(), PageNotification::chain_changed(MAINNET));
    assert_eq!(harness.coordinator.state().get().await.chain_id, MAINNET);
}

#[tokio::test(flavor = "multi_thread")]
async fn detected_fork_scopes_favorites_to_origin() {
    let mainnet_probe = devwallet::networks::NetworkConfig::mainnet().probe.unwrap();
    let registry = Registry::with_operators(2);
    let harness = Harness::new(Upstream::new(move |call| match call.method.as_str() {
        "anvil_nodeInfo" => Ok(json!({ "environment": { "chainId": 31337 } })),
        "eth_getCode" if call.params[0] == json!(mainnet_probe) => Ok(json!("0x6080")),
        "eth_getCode" => Ok(json!("0x")),
        "eth_accounts" => Ok(json!([DEV_ADDRESS])),
        "eth_call" => registry.eth_call(call),
        _ => Err(unreachable(call)),
    }));
    let (channel, mut events) = harness.view();
    let mut page = harness.page();

    harness.coordinator.on_command(channel, ViewCommand::SwitchNetwork { chain_id: FORK_CHAIN_ID }).await;
    assert_eq!(page.recv().await.unwrap(), PageNotification::chain_changed(MAINNET));
    let fork = wait_for(&mut events, |e| matches!(e, ViewEvent::ForkStatus { .. })).await;
    assert_eq!(fork, ViewEvent::ForkStatus { forked_from: Some(MAINNET), accounts: vec![DEV_ADDRESS] });

    // operators of the fork are cached under the fork's own id
    wait_for(&mut events, |e| matches!(e, ViewEvent::OperatorsUpdate { chain_id: FORK_CHAIN_ID, .. })).await;

    harness.coordinator.on_command(channel, ViewCommand::ToggleFavorite { operator_id: "1".into() }).await;
    assert_eq!(harness.coordinator.state().get().await.favorites, vec!["csm:1:1".to_string()]);

    let chain_id = harness.coordinator.dispatcher().dispatch("eth_chainId", Default::default()).await;
    assert_eq!(chain_id.into_result().unwrap(), json!("0x1"));

    // leaving the fork forgets its origin
    harness.coordinator.on_command(channel, ViewCommand::SwitchNetwork { chain_id: HOODI }).await;
    assert_eq!(harness.coordinator.fork().forked_from().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_input_is_reported_to_the_issuing_view() {
    let harness = Harness::new(Upstream::offline());
    let (channel, mut events) = harness.view();
    let (_, mut other) = harness.view();
    let coordinator = &harness.coordinator;

    let source = AddressSource::Manual;
    coordinator.on_command(channel, ViewCommand::SelectAddress { address: "0x1234".into(), source }).await;
    let ViewEvent::Error { message } = events.recv().await.unwrap() else { panic!("expected an error") };
    assert!(message.contains("invalid address"), "{message}");
    assert!(other.try_recv().is_err());

    let rpc_url = "ftp://files.example.org".to_string();
    coordinator.on_command(channel, ViewCommand::SetCustomRpc { chain_id: MAINNET, rpc_url }).await;
    assert!(matches!(events.recv().await.unwrap(), ViewEvent::Error { .. }));

    coordinator.on_command(channel, ViewCommand::SwitchNetwork { chain_id: 5 }).await;
    assert!(matches!(events.recv().await.unwrap(), ViewEvent::Error { .. }));

    let state = coordinator.state().get().await;
    assert_eq!(state, Default::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn selection_notifies_pages() {
    let harness = Harness::new(Upstream::offline());
    let (channel, _events) = harness.view();
    let mut page = harness.page();
    let coordinator = &harness.coordinator;

    let address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string();
    coordinator.on_command(channel, ViewCommand::SelectAddress { address, source: AddressSource::Fork { index: 0 } }).await;
    assert_eq!(page.recv().await.unwrap(), PageNotification::AccountsChanged(vec![DEV_ADDRESS]));
    let state = coordinator.state().get().await;
    assert!(state.is_connected);
    assert_eq!(state.selected_address.as_ref().map(|s| s.address), Some(DEV_ADDRESS));

    let accounts = coordinator.dispatcher().dispatch("eth_accounts", Default::default()).await;
    assert_eq!(accounts.into_result().unwrap(), json!([DEV_ADDRESS]));

    coordinator.on_command(channel, ViewCommand::SwitchModule { module_type: ModuleType::Cm }).await;
    assert_eq!(page.recv().await.unwrap(), PageNotification::AccountsChanged(vec![]));
    let state = coordinator.state().get().await;
    assert_eq!(state.module_type, ModuleType::Cm);
    assert!(!state.is_connected);

    coordinator.on_command(channel, ViewCommand::Disconnect).await;
    assert_eq!(page.recv().await.unwrap(), PageNotification::AccountsChanged(vec![]));
}

#[tokio::test(flavor = "multi_thread")]
async fn address_book_commands() {
    let harness = Harness::new(Upstream::offline());
    let (channel, _events) = harness.view();
    let coordinator = &harness.coordinator;
    let lower = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
    let other = address!("0x0000000000000000000000000000000000000001");

    for address in [lower, "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266", "0x0000000000000000000000000000000000000001"] {
        coordinator.on_command(channel, ViewCommand::AddManualAddress { address: address.into() }).await;
    }
    assert_eq!(coordinator.state().get().await.manual_addresses, vec![DEV_ADDRESS, other]);

    coordinator.on_command(channel, ViewCommand::RemoveManualAddress { address: lower.into() }).await;
    assert_eq!(coordinator.state().get().await.manual_addresses, vec![other]);

    let label = "  QA whale ".to_string();
    coordinator.on_command(channel, ViewCommand::SetAddressLabel { address: DEV_ADDRESS.to_string(), label }).await;
    let labels = coordinator.state().get().await.address_labels;
    assert_eq!(labels.get(lower).map(String::as_str), Some("QA whale"));

    let label = "   ".to_string();
    coordinator.on_command(channel, ViewCommand::SetAddressLabel { address: lower.into(), label }).await;
    assert!(coordinator.state().get().await.address_labels.is_empty());

    let rpc_url = " http://hoodi.internal:8545 ".to_string();
    coordinator.on_command(channel, ViewCommand::SetCustomRpc { chain_id: HOODI, rpc_url }).await;
    assert_eq!(
        coordinator.state().get().await.custom_rpc_url(HOODI),
        Some("http://hoodi.internal:8545")
    );
    coordinator.on_command(channel, ViewCommand::SetCustomRpc { chain_id: HOODI, rpc_url: String::new() }).await;
    assert!(coordinator.state().get().await.custom_rpc_urls.is_empty());

    coordinator.on_command(channel, ViewCommand::SetRequireApproval { enabled: true }).await;
    assert!(coordinator.state().get().await.require_approval);
}

#[tokio::test(flavor = "multi_thread")]
async fn imported_key_marks_selection_signable() {
    let harness = Harness::new(Upstream::offline());
    let (channel, mut events) = harness.view();
    let coordinator = &harness.coordinator;
    let address = DEV_ADDRESS.to_string();

    coordinator
        .on_command(channel, ViewCommand::SelectAddress { address: address.clone(), source: AddressSource::Manual })
        .await;
    assert_eq!(coordinator.state().get().await.selected_address.unwrap().can_sign, None);

    let private_key = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d".to_string();
    coordinator.on_command(channel, ViewCommand::ImportKey { address: address.clone(), private_key }).await;
    wait_for(&mut events, |e| matches!(e, ViewEvent::Error { .. })).await;

    let private_key = DEV_KEY.to_string();
    coordinator.on_command(channel, ViewCommand::ImportKey { address: address.clone(), private_key }).await;
    assert_eq!(coordinator.state().get().await.selected_address.unwrap().can_sign, Some(true));

    coordinator.on_command(channel, ViewCommand::RemoveKey { address }).await;
    assert_eq!(coordinator.state().get().await.selected_address.unwrap().can_sign, None);

    // keys never reach durable storage
    let durable: Arc<dyn KvStore> = harness.durable.clone();
    assert_eq!(durable.get("private_keys").await.unwrap(), None::<Value>);
}

//! The background coordinator: owns every component and executes view commands.

use crate::{
    approval::{ApprovalCoordinator, SurfaceHost},
    cache::{OperatorCache, is_stale},
    client::{ClientCache, Connector},
    dispatcher::Dispatcher,
    fanout::{ChannelId, Fanout},
    favorites::toggle_favorite,
    fork::ForkAdapter,
    keys::{KeyError, KeyStore},
    messages::{PageNotification, ViewCommand, ViewEvent},
    networks::{
        FORK_CHAIN_ID, MAINNET, Networks, effective_chain_id, is_fork, is_switchable, network_name,
    },
    state::{StateStore, StoreError},
    storage::KvStore,
    types::{
        AddressSource, CacheContext, ModuleAvailability, ModuleType, SelectedAddress, StatePatch,
        WalletState,
    },
};
use alloy_primitives::{Address, ChainId};
use std::{str::FromStr, sync::Arc};
use url::Url;
use uuid::Uuid;

/// Failure of a view command, reported back to the issuing view.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid RPC URL: {0}")]
    InvalidRpcUrl(String),
    #[error("unsupported chain {0}")]
    UnsupportedChain(ChainId),
    #[error("local fork is not available")]
    NoFork,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// External collaborators of the coordinator.
#[derive(Clone, Debug)]
pub struct Backends {
    /// Survives restarts.
    pub durable: Arc<dyn KvStore>,
    /// Discarded at process exit.
    pub session: Arc<dyn KvStore>,
    /// Creates upstream clients.
    pub connector: Arc<dyn Connector>,
    /// Opens approval surfaces.
    pub surfaces: Arc<dyn SurfaceHost>,
}

/// Cheap to clone; all clones share the same components.
#[derive(Clone, Debug)]
pub struct Coordinator {
    state: StateStore,
    cache: Arc<OperatorCache>,
    fork: Arc<ForkAdapter>,
    approvals: Arc<ApprovalCoordinator>,
    keys: Arc<KeyStore>,
    networks: Arc<Networks>,
    views: Arc<Fanout<ViewEvent>>,
    pages: Arc<Fanout<PageNotification>>,
    dispatcher: Dispatcher,
}

impl Coordinator {
    /// Wires up every component. Must be called from within a tokio runtime.
    ///
    /// `views` is shared with the surface host so it can announce approval requests.
    pub fn new(networks: Networks, backends: Backends, views: Arc<Fanout<ViewEvent>>) -> Self {
        let Backends { durable, session, connector, surfaces } = backends;
        let networks = Arc::new(networks);
        let clients = Arc::new(ClientCache::new(connector));

        let state = StateStore::spawn(durable.clone());
        let cache = Arc::new(OperatorCache::new(durable, clients.clone(), networks.clone()));
        let fork = Arc::new(ForkAdapter::new(clients.clone(), networks.clone(), session.clone()));
        let approvals = Arc::new(ApprovalCoordinator::new(surfaces));
        let keys = Arc::new(KeyStore::new(session));
        let pages = Arc::new(Fanout::new());

        let dispatcher = Dispatcher::new(
            state.clone(),
            fork.clone(),
            approvals.clone(),
            clients,
            networks.clone(),
            pages.clone(),
            views.clone(),
        );

        Self { state, cache, fork, approvals, keys, networks, views, pages, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn cache(&self) -> &OperatorCache {
        &self.cache
    }

    pub fn fork(&self) -> &ForkAdapter {
        &self.fork
    }

    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    pub fn networks(&self) -> &Networks {
        &self.networks
    }

    pub fn views(&self) -> &Arc<Fanout<ViewEvent>> {
        &self.views
    }

    pub fn pages(&self) -> &Arc<Fanout<PageNotification>> {
        &self.pages
    }

    /// Executes a command sent by the view on `channel`. Failures are sent back to that view.
    pub async fn on_command(&self, channel: ChannelId, cmd: ViewCommand) {
        trace!(target: "devwallet::server", channel, ?cmd, "view command");
        if let Err(err) = self.execute(channel, cmd).await {
            debug!(target: "devwallet::server", channel, %err, "view command failed");
            self.views.send_to(channel, ViewEvent::error(err.to_string()));
        }
    }

    async fn execute(&self, channel: ChannelId, cmd: ViewCommand) -> Result<(), CommandError> {
        match cmd {
            ViewCommand::GetState => self.get_state(channel).await,
            ViewCommand::SelectAddress { address, source } => {
                self.select_address(&address, source).await
            }
            ViewCommand::Disconnect => self.disconnect().await,
            ViewCommand::SwitchNetwork { chain_id } => self.switch_network(chain_id).await,
            ViewCommand::SwitchModule { module_type } => self.switch_module(module_type).await,
            ViewCommand::RequestOperators { chain_id, module_type } => {
                self.request_operators(chain_id, module_type, false).await
            }
            ViewCommand::RefreshOperators { chain_id, module_type } => {
                self.request_operators(chain_id, module_type, true).await
            }
            ViewCommand::ToggleFavorite { operator_id } => self.toggle_favorite(operator_id).await,
            ViewCommand::AddManualAddress { address } => self.add_manual_address(&address).await,
            ViewCommand::RemoveManualAddress { address } => {
                self.remove_manual_address(&address).await
            }
            ViewCommand::SetAddressLabel { address, label } => {
                self.set_address_label(&address, &label).await
            }
            ViewCommand::SetCustomRpc { chain_id, rpc_url } => {
                self.set_custom_rpc(chain_id, &rpc_url).await
            }
            ViewCommand::SetRequireApproval { enabled } => {
                self.commit(StatePatch::default().require_approval(enabled)).await.map(drop)
            }
            ViewCommand::ImportKey { address, private_key } => {
                self.import_key(&address, &private_key).await
            }
            ViewCommand::RemoveKey { address } => self.remove_key(&address).await,
            ViewCommand::ApprovalResponse { id, approved } => {
                self.approval_response(id, approved);
                Ok(())
            }
        }
    }

    async fn get_state(&self, channel: ChannelId) -> Result<(), CommandError> {
        let state = self.state.get().await;
        self.views.send_to(channel, ViewEvent::state(state.clone()));

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.sync_network(state).await {
                this.views.broadcast(ViewEvent::error(err.to_string()));
            }
            this.probe_fork().await;
        });
        Ok(())
    }

    /// Brings views up to date with the network the wallet points at: fork status,
    /// module availability and operators.
    ///
    /// A fork that cannot be detected sends the wallet back to mainnet.
    async fn sync_network(&self, state: WalletState) -> Result<(), CommandError> {
        let state = if state.is_on_fork() {
            let url = state.rpc_url(&self.networks, FORK_CHAIN_ID).to_string();
            match self.fork.refresh(&url).await {
                Some(origin) => {
                    let accounts = self.fork.get_accounts(&url).await;
                    self.views.broadcast(ViewEvent::ForkStatus { forked_from: Some(origin), accounts });
                    state
                }
                None => {
                    info!(target: "devwallet::fork", url, "fork unavailable, switching to mainnet");
                    self.views.broadcast(ViewEvent::ForkStatus { forked_from: None, accounts: vec![] });
                    let state = self.commit(StatePatch::default().chain_id(MAINNET)).await?;
                    self.pages.broadcast(PageNotification::chain_changed(MAINNET));
                    state
                }
            }
        } else {
            state
        };

        let ctx = self.context(&state, state.chain_id, state.module_type).await?;
        tokio::join!(self.check_availability(&ctx), self.refresh_operators(ctx.clone(), false));
        Ok(())
    }

    /// Tells views whether the local fork is usable, without touching the cached origin.
    async fn probe_fork(&self) {
        let state = self.state.get().await;
        let url = state.rpc_url(&self.networks, FORK_CHAIN_ID).to_string();
        let forked_from = self.fork.detect(&url).await;
        let accounts = match forked_from {
            Some(_) => self.fork.get_accounts(&url).await,
            None => Vec::new(),
        };
        self.views.broadcast(ViewEvent::ForkStatus { forked_from, accounts });
    }

    /// Sends the persisted availability record, then re-checks the secondary module.
    async fn check_availability(&self, ctx: &CacheContext) {
        if let Some(modules) = self.cache.get_module_availability(ctx.chain_id).await {
            self.views.broadcast(ViewEvent::ModuleAvailability { modules });
        }

        let cm = CacheContext { module_type: ModuleType::Cm, ..ctx.clone() };
        let modules = ModuleAvailability { csm: true, cm: self.cache.is_module_available(&cm).await };
        if let Err(err) = self.cache.set_module_availability(ctx.chain_id, modules).await {
            warn!(target: "devwallet::cache", %err, "failed to persist module availability");
        }
        self.views.broadcast(ViewEvent::ModuleAvailability { modules });
    }

    /// Serves the cached operators right away, then fetches when missing, stale or forced.
    ///
    /// A failed fetch leaves the cached entry in place and reports the error to every view.
    pub async fn refresh_operators(&self, ctx: CacheContext, force: bool) {
        let (chain_id, module_type) = (ctx.chain_id, ctx.module_type);
        if let Some(entry) = self.cache.get_cached_operators(&ctx).await {
            let fresh = !is_stale(&entry);
            self.views.broadcast(ViewEvent::operators(chain_id, module_type, entry));
            if fresh && !force {
                return;
            }
        }

        self.views.broadcast(ViewEvent::OperatorsLoading { chain_id, module_type, loading: true });
        match self.cache.fetch_operators(&ctx).await {
            Ok(entry) => {
                self.views.broadcast(ViewEvent::operators(chain_id, module_type, entry));
            }
            Err(err) => {
                warn!(target: "devwallet::cache", chain_id, module = %module_type, %err, "operator refresh failed");
                self.views.broadcast(ViewEvent::error(format!("Failed to load operators: {err}")));
            }
        }
        self.views.broadcast(ViewEvent::OperatorsLoading { chain_id, module_type, loading: false });
    }

    async fn request_operators(
        &self,
        chain_id: ChainId,
        module_type: ModuleType,
        force: bool,
    ) -> Result<(), CommandError> {
        let state = self.state.get().await;
        let ctx = self.context(&state, chain_id, module_type).await?;
        let this = self.clone();
        tokio::spawn(async move { this.refresh_operators(ctx, force).await });
        Ok(())
    }

    async fn select_address(&self, address: &str, source: AddressSource) -> Result<(), CommandError> {
        let address = parse_address(address)?;
        let mut selected = SelectedAddress::new(address, source);
        if self.keys.has_key(address).await {
            selected.can_sign = Some(true);
        }

        self.commit(StatePatch::default().selected_address(Some(selected))).await?;
        self.pages.broadcast(PageNotification::AccountsChanged(vec![address]));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommandError> {
        self.commit(StatePatch::default().selected_address(None)).await?;
        self.pages.broadcast(PageNotification::AccountsChanged(vec![]));
        Ok(())
    }

    async fn switch_network(&self, chain_id: ChainId) -> Result<(), CommandError> {
        if !is_switchable(chain_id) {
            return Err(CommandError::UnsupportedChain(chain_id));
        }
        let previous = self.state.get().await;
        if is_fork(previous.chain_id) && !is_fork(chain_id) {
            self.fork.clear_forked_from().await;
        }

        let state = self.commit(StatePatch::default().chain_id(chain_id)).await?;
        let forked_from = if is_fork(chain_id) {
            self.fork.refresh(state.rpc_url(&self.networks, FORK_CHAIN_ID)).await
        } else {
            None
        };
        self.pages.broadcast(PageNotification::chain_changed(effective_chain_id(chain_id, forked_from)));
        info!(target: "devwallet::state", chain_id, network = network_name(chain_id), ?forked_from, "switched network");

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.sync_network(state).await {
                this.views.broadcast(ViewEvent::error(err.to_string()));
            }
        });
        Ok(())
    }

    async fn switch_module(&self, module_type: ModuleType) -> Result<(), CommandError> {
        let state = self
            .commit(StatePatch::default().module_type(module_type).selected_address(None))
            .await?;
        self.pages.broadcast(PageNotification::AccountsChanged(vec![]));

        let ctx = self.context(&state, state.chain_id, module_type).await?;
        let this = self.clone();
        tokio::spawn(async move { this.refresh_operators(ctx, false).await });
        Ok(())
    }

    async fn toggle_favorite(&self, operator_id: String) -> Result<(), CommandError> {
        let forked_from = self.fork.forked_from().await;
        let state = self
            .state
            .update(move |state| {
                let chain_id = effective_chain_id(state.chain_id, forked_from);
                let favorites =
                    toggle_favorite(&state.favorites, state.module_type, chain_id, &operator_id);
                Some(StatePatch::default().favorites(favorites))
            })
            .await?;
        self.views.broadcast(ViewEvent::state(state));
        Ok(())
    }

    async fn add_manual_address(&self, address: &str) -> Result<(), CommandError> {
        let address = parse_address(address)?;
        let state = self
            .state
            .update(move |state| {
                if state.manual_addresses.contains(&address) {
                    return None;
                }
                let mut addresses = state.manual_addresses.clone();
                addresses.push(address);
                Some(StatePatch::default().manual_addresses(addresses))
            })
            .await?;
        self.views.broadcast(ViewEvent::state(state));
        Ok(())
    }

    async fn remove_manual_address(&self, address: &str) -> Result<(), CommandError> {
        let address = parse_address(address)?;
        let state = self
            .state
            .update(move |state| {
                let addresses: Vec<_> =
                    state.manual_addresses.iter().copied().filter(|a| *a != address).collect();
                (addresses.len() != state.manual_addresses.len())
                    .then(|| StatePatch::default().manual_addresses(addresses))
            })
            .await?;
        self.views.broadcast(ViewEvent::state(state));
        Ok(())
    }

    async fn set_address_label(&self, address: &str, label: &str) -> Result<(), CommandError> {
        let key = parse_address(address)?.to_string().to_ascii_lowercase();
        let label = label.trim().to_string();
        let state = self
            .state
            .update(move |state| {
                let mut labels = state.address_labels.clone();
                if label.is_empty() {
                    labels.remove(&key)?;
                } else {
                    labels.insert(key, label);
                }
                Some(StatePatch::default().address_labels(labels))
            })
            .await?;
        self.views.broadcast(ViewEvent::state(state));
        Ok(())
    }

    async fn set_custom_rpc(&self, chain_id: ChainId, rpc_url: &str) -> Result<(), CommandError> {
        if !is_switchable(chain_id) {
            return Err(CommandError::UnsupportedChain(chain_id));
        }
        let rpc_url = rpc_url.trim();
        let rpc_url = if rpc_url.is_empty() { None } else { Some(validate_rpc_url(rpc_url)?) };

        let state = self
            .state
            .update(move |state| {
                let mut urls = state.custom_rpc_urls.clone();
                match rpc_url {
                    Some(url) => {
                        urls.insert(chain_id, url);
                    }
                    None => {
                        urls.remove(&chain_id)?;
                    }
                }
                Some(StatePatch::default().custom_rpc_urls(urls))
            })
            .await?;
        if is_fork(chain_id) {
            self.fork.clear_forked_from().await;
        }
        self.views.broadcast(ViewEvent::state(state.clone()));

        if state.chain_id == chain_id {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.sync_network(state).await {
                    this.views.broadcast(ViewEvent::error(err.to_string()));
                }
            });
        }
        Ok(())
    }

    async fn import_key(&self, address: &str, private_key: &str) -> Result<(), CommandError> {
        let address = parse_address(address)?;
        self.keys.import(address, private_key).await?;
        self.set_can_sign(address, Some(true)).await
    }

    async fn remove_key(&self, address: &str) -> Result<(), CommandError> {
        let address = parse_address(address)?;
        self.keys.remove(address).await?;
        self.set_can_sign(address, None).await
    }

    /// Updates the selection's signing flag if `address` is the selected one.
    async fn set_can_sign(&self, address: Address, can_sign: Option<bool>) -> Result<(), CommandError> {
        let state = self
            .state
            .update(move |state| {
                let selected = state.selected_address.as_ref().filter(|s| s.address == address)?;
                let selected = SelectedAddress { can_sign, ..selected.clone() };
                Some(StatePatch::default().selected_address(Some(selected)))
            })
            .await?;
        self.views.broadcast(ViewEvent::state(state));
        Ok(())
    }

    fn approval_response(&self, id: Uuid, approved: bool) {
        if !self.approvals.respond(id, approved) {
            debug!(target: "devwallet::approval", %id, "no pending approval for response");
        }
    }

    /// Writes `patch` and broadcasts the resulting state.
    async fn commit(&self, patch: StatePatch) -> Result<WalletState, CommandError> {
        let state = self.state.set(patch).await?;
        self.views.broadcast(ViewEvent::state(state.clone()));
        Ok(state)
    }

    /// Describes a registry read for `(chain_id, module_type)` under the given state.
    async fn context(
        &self,
        state: &WalletState,
        chain_id: ChainId,
        module_type: ModuleType,
    ) -> Result<CacheContext, CommandError> {
        if !is_switchable(chain_id) {
            return Err(CommandError::UnsupportedChain(chain_id));
        }
        let ctx = CacheContext::new(chain_id, module_type, state.rpc_url(&self.networks, chain_id));
        if !is_fork(chain_id) {
            return Ok(ctx);
        }
        let origin = self.fork.forked_from().await.ok_or(CommandError::NoFork)?;
        Ok(ctx.with_forked_from(origin))
    }
}

/// Parses an address in any letter case. Mixed-case input must carry a valid checksum.
fn parse_address(s: &str) -> Result<Address, CommandError> {
    let s = s.trim();
    let address = Address::from_str(s).map_err(|_| CommandError::InvalidAddress(s.to_string()))?;
    let hex = s.strip_prefix("0x").unwrap_or(s);
    let mixed = hex.chars().any(|c| c.is_ascii_uppercase()) && hex.chars().any(|c| c.is_ascii_lowercase());
    if mixed && Address::parse_checksummed(s, None).is_err() {
        return Err(CommandError::InvalidAddress(s.to_string()));
    }
    Ok(address)
}

fn validate_rpc_url(s: &str) -> Result<String, CommandError> {
    let url = Url::parse(s).map_err(|err| CommandError::InvalidRpcUrl(format!("{s}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CommandError::InvalidRpcUrl(format!("{s}: scheme must be http or https")));
    }
    Ok(s.to_string())
}

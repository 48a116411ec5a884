//! The persistent wallet state store.
//!
//! Every read and write is funneled through a single worker task in the order the calls were
//! made, so two concurrent read-modify-write cycles can never lose an update, no matter in
//! which order the underlying storage writes complete.

use crate::{
    favorites::is_scoped,
    storage::{self, KvStore, StorageError},
    types::{ModuleType, StatePatch, WalletState},
};
use futures::ready;
use serde_json::{Map, Value};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::{mpsc, oneshot};

/// Durable storage key of the wallet state.
pub const STATE_KEY: &str = "wallet_state";

/// Fields introduced after the first release; a record missing any of them gets rewritten.
const KNOWN_FIELDS: [&str; 9] = [
    "chainId",
    "moduleType",
    "selectedAddress",
    "isConnected",
    "customRpcUrls",
    "favorites",
    "manualAddresses",
    "addressLabels",
    "requireApproval",
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("state store is shut down")]
    Closed,
}

/// Brings a raw stored record up to the current shape.
///
/// Returns the migrated state and whether anything had to change. Running the migration on its
/// own output never changes anything.
pub fn migrate_state(raw: Value) -> (WalletState, bool) {
    let Value::Object(mut obj) = raw else {
        warn!(target: "devwallet::state", "stored wallet state is not an object, resetting");
        return (WalletState::default(), true);
    };

    let mut changed = KNOWN_FIELDS.iter().any(|field| !obj.contains_key(*field));

    if !obj.get("moduleType").is_some_and(Value::is_string) {
        obj.insert("moduleType".into(), Value::String(ModuleType::Csm.to_string()));
        changed = true;
    }

    let chain_id = obj.get("chainId").and_then(Value::as_u64).unwrap_or(WalletState::default().chain_id);

    // bare operator ids predate module and chain scoping, they all belonged to csm
    if let Some(Value::Array(favorites)) = obj.get_mut("favorites") {
        for fav in favorites.iter_mut() {
            if let Value::String(id) = fav
                && !is_scoped(id)
            {
                *id = format!("{}:{chain_id}:{id}", ModuleType::Csm);
                changed = true;
            }
        }
    }

    if let Some(Value::Object(labels)) = obj.get_mut("addressLabels")
        && labels.keys().any(|key| key.chars().any(|c| c.is_ascii_uppercase()))
    {
        let lowered: Map<String, Value> =
            std::mem::take(labels).into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
        *labels = lowered;
        changed = true;
    }

    match serde_json::from_value::<WalletState>(Value::Object(obj)) {
        Ok(state) => (state, changed),
        Err(err) => {
            warn!(target: "devwallet::state", %err, "stored wallet state is malformed, resetting");
            (WalletState::default(), true)
        }
    }
}

type UpdateFn = Box<dyn FnOnce(&WalletState) -> Option<StatePatch> + Send>;

enum StoreOp {
    Get(oneshot::Sender<WalletState>),
    Update(UpdateFn, oneshot::Sender<Result<WalletState, StoreError>>),
}

/// Handle to the state store worker. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StateStore {
    ops: mpsc::UnboundedSender<StoreOp>,
}

impl StateStore {
    /// Spawns the store worker on the current runtime.
    pub fn spawn(durable: Arc<dyn KvStore>) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        let worker = StoreWorker { durable, snapshot: None };
        tokio::spawn(worker.run(rx));
        Self { ops }
    }

    /// Returns the current state. Never fails: unreadable storage yields the defaults.
    pub async fn get(&self) -> WalletState {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(StoreOp::Get(tx)).is_err() {
            warn!(target: "devwallet::state", "state store is shut down, serving defaults");
            return WalletState::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Applies a shallow merge and returns the new full state.
    ///
    /// The write is queued when this is called, not when the returned future is first polled,
    /// so the effective order of writes is the calling order.
    pub fn set(&self, patch: StatePatch) -> StateUpdate {
        self.update(move |_| Some(patch))
    }

    /// Read-modify-write: `f` sees the state as left by every previously queued write and
    /// returns the patch to apply, or `None` to leave the state untouched.
    pub fn update<F>(&self, f: F) -> StateUpdate
    where
        F: FnOnce(&WalletState) -> Option<StatePatch> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let rx = self.ops.send(StoreOp::Update(Box::new(f), tx)).ok().map(|()| rx);
        StateUpdate { rx }
    }
}

/// A queued state write.
///
/// The write happens whether or not this future is awaited.
#[derive(Debug)]
#[must_use = "the outcome of the write is only observable by awaiting it"]
pub struct StateUpdate {
    rx: Option<oneshot::Receiver<Result<WalletState, StoreError>>>,
}

impl Future for StateUpdate {
    type Output = Result<WalletState, StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else { return Poll::Ready(Err(StoreError::Closed)) };
        match ready!(Pin::new(rx).poll(cx)) {
            Ok(res) => Poll::Ready(res),
            Err(_) => Poll::Ready(Err(StoreError::Closed)),
        }
    }
}

struct StoreWorker {
    durable: Arc<dyn KvStore>,
    /// Mirrors durable storage once hydrated; dropped whenever a write fails.
    snapshot: Option<WalletState>,
}

impl StoreWorker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<StoreOp>) {
        while let Some(op) = ops.recv().await {
            match op {
                StoreOp::Get(tx) => {
                    let state = self.load().await.unwrap_or_else(|err| {
                        warn!(target: "devwallet::state", %err, "failed to read wallet state, serving defaults");
                        WalletState::default()
                    });
                    let _ = tx.send(state);
                }
                StoreOp::Update(f, tx) => {
                    let res = self.update(f).await;
                    let _ = tx.send(res);
                }
            }
        }
        trace!(target: "devwallet::state", "state store worker stopped");
    }

    /// Returns the hydrated state. A failed read leaves the snapshot empty and nothing persisted.
    async fn load(&mut self) -> Result<WalletState, StorageError> {
        if let Some(state) = &self.snapshot {
            return Ok(state.clone());
        }

        let raw = self.durable.get(STATE_KEY).await?;

        let (state, changed) = match raw {
            Some(raw) => migrate_state(raw),
            None => (WalletState::default(), true),
        };

        if changed {
            debug!(target: "devwallet::state", "persisting migrated wallet state");
            if let Err(err) = storage::write(&*self.durable, STATE_KEY, &state).await {
                warn!(target: "devwallet::state", %err, "failed to persist migrated wallet state");
                return Ok(state);
            }
        }

        self.snapshot = Some(state.clone());
        Ok(state)
    }

    async fn update(&mut self, f: UpdateFn) -> Result<WalletState, StoreError> {
        let current = self.load().await.inspect_err(|err| {
            error!(target: "devwallet::state", %err, "failed to read wallet state, dropping write");
        })?;
        let Some(patch) = f(&current) else { return Ok(current) };
        let next = patch.apply(current);

        match storage::write(&*self.durable, STATE_KEY, &next).await {
            Ok(()) => {
                self.snapshot = Some(next.clone());
                Ok(next)
            }
            Err(err) => {
                // the next operation re-reads durable state instead of trusting the snapshot
                self.snapshot = None;
                error!(target: "devwallet::state", %err, "failed to persist wallet state");
                Err(err.into())
            }
        }
    }
}

//! Out-of-band confirmation of signing requests.
//!
//! Every request gets its own confirmation surface and resolves exactly once: either with the
//! decision sent back for its id, or with a rejection when the surface goes away first. Both
//! paths go through [`PendingApprovals::take`], so whichever arrives second finds nothing to do.

use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Signing methods that are gated behind an approval when approvals are enabled.
pub const APPROVAL_METHODS: [&str; 6] = [
    "eth_sendTransaction",
    "eth_signTypedData_v4",
    "eth_signTypedData",
    "eth_signTypedData_v3",
    "personal_sign",
    "eth_sign",
];

/// Returns true if `method` must be confirmed by the user.
pub fn requires_approval(method: &str) -> bool {
    APPROVAL_METHODS.contains(&method)
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("failed to open approval surface: {0}")]
    Surface(String),
}

/// What the user is asked to confirm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub method: String,
    pub from: Address,
}

/// An open confirmation surface.
#[derive(Debug)]
pub struct SurfaceHandle {
    /// Completes, or is dropped, once the surface is gone.
    pub closed: oneshot::Receiver<()>,
}

/// Opens and closes confirmation surfaces.
#[async_trait]
pub trait SurfaceHost: Send + Sync + fmt::Debug {
    /// Opens a surface for `request`. Failing here rejects the request right away.
    async fn open(&self, request: &ApprovalRequest) -> Result<SurfaceHandle, ApprovalError>;

    /// Closes the surface of a resolved request. Closing an unknown id is a no-op.
    fn close(&self, id: Uuid);
}

/// Correlation table of undecided requests.
#[derive(Debug, Default)]
pub struct PendingApprovals {
    entries: Mutex<HashMap<Uuid, oneshot::Sender<bool>>>,
}

impl PendingApprovals {
    fn insert(&self, id: Uuid) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(id, tx);
        rx
    }

    /// Removes the entry and hands out its completion handle; only the first caller gets it.
    pub fn take(&self, id: Uuid) -> Option<oneshot::Sender<bool>> {
        self.entries.lock().remove(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ApprovalCoordinator {
    host: Arc<dyn SurfaceHost>,
    pending: PendingApprovals,
}

impl ApprovalCoordinator {
    pub fn new(host: Arc<dyn SurfaceHost>) -> Self {
        Self { host, pending: PendingApprovals::default() }
    }

    /// Asks the user to confirm `method` on behalf of `from`.
    ///
    /// Resolves to the user's decision, or `false` if the surface is closed without one.
    pub async fn request_approval(&self, method: &str, from: Address) -> Result<bool, ApprovalError> {
        let request = ApprovalRequest { id: Uuid::new_v4(), method: method.to_string(), from };
        let id = request.id;
        let mut decision = self.pending.insert(id);
        let guard = PendingGuard { coordinator: self, id };

        let SurfaceHandle { mut closed } = self.host.open(&request).await?;
        debug!(target: "devwallet::approval", %id, method, %from, "awaiting approval");

        let approved = tokio::select! {
            res = &mut decision => res.unwrap_or(false),
            _ = &mut closed => match self.pending.take(id) {
                Some(_) => {
                    debug!(target: "devwallet::approval", %id, "surface closed without a decision");
                    false
                }
                // a decision won the race and is already on its way
                None => decision.await.unwrap_or(false),
            },
        };
        drop(guard);

        debug!(target: "devwallet::approval", %id, approved, "approval resolved");
        Ok(approved)
    }

    /// Delivers the user's decision. Returns false if `id` was already resolved or never existed.
    pub fn respond(&self, id: Uuid, approved: bool) -> bool {
        let Some(tx) = self.pending.take(id) else {
            trace!(target: "devwallet::approval", %id, "ignoring decision for resolved request");
            return false;
        };
        self.host.close(id);
        let _ = tx.send(approved);
        true
    }

    pub fn pending(&self) -> &PendingApprovals {
        &self.pending
    }
}

/// Drops the pending entry and its surface if the request is abandoned midway.
struct PendingGuard<'a> {
    coordinator: &'a ApprovalCoordinator,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.coordinator.pending.take(self.id).is_some() {
            self.coordinator.host.close(self.id);
        }
    }
}

//! Session-only store of QA private keys.
//!
//! Keys only flag the selected address as one that could sign; they are never written to
//! durable storage and never used. Do not import real keys.

use crate::storage::{self, KvStore, StorageError};
use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use std::{collections::BTreeMap, str::FromStr, sync::Arc};
use tokio::sync::Mutex;

/// Session storage key of the key map.
pub const PRIVATE_KEYS_KEY: &str = "private_keys";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid private key")]
    InvalidKey,
    #[error("private key belongs to {derived}, not {expected}")]
    Mismatch { expected: Address, derived: Address },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Lower-cased address to private key, kept in session storage.
#[derive(Debug)]
pub struct KeyStore {
    session: Arc<dyn KvStore>,
    /// Serializes read-modify-write cycles on the key map.
    write_lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(session: Arc<dyn KvStore>) -> Self {
        Self { session, write_lock: Mutex::new(()) }
    }

    async fn keys(&self) -> BTreeMap<String, String> {
        match storage::read(&*self.session, PRIVATE_KEYS_KEY).await {
            Ok(keys) => keys.unwrap_or_default(),
            Err(err) => {
                warn!(target: "devwallet::state", %err, "ignoring unreadable key map");
                BTreeMap::new()
            }
        }
    }

    /// Stores `private_key` for `address` after checking that it actually derives `address`.
    pub async fn import(&self, address: Address, private_key: &str) -> Result<(), KeyError> {
        let signer = PrivateKeySigner::from_str(private_key.trim()).map_err(|_| KeyError::InvalidKey)?;
        let derived = signer.address();
        if derived != address {
            return Err(KeyError::Mismatch { expected: address, derived });
        }

        let _lock = self.write_lock.lock().await;
        let mut keys = self.keys().await;
        keys.insert(lower(address), private_key.trim().to_string());
        storage::write(&*self.session, PRIVATE_KEYS_KEY, &keys).await?;
        debug!(target: "devwallet::state", %address, "imported QA key");
        Ok(())
    }

    pub async fn remove(&self, address: Address) -> Result<(), KeyError> {
        let _lock = self.write_lock.lock().await;
        let mut keys = self.keys().await;
        if keys.remove(&lower(address)).is_some() {
            storage::write(&*self.session, PRIVATE_KEYS_KEY, &keys).await?;
        }
        Ok(())
    }

    pub async fn has_key(&self, address: Address) -> bool {
        self.keys().await.contains_key(&lower(address))
    }
}

fn lower(address: Address) -> String {
    address.to_string().to_ascii_lowercase()
}

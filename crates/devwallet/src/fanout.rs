//! Broadcasting to any number of connected listeners.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;

/// Identifies one connected listener.
pub type ChannelId = u64;

/// The set of live listener channels.
///
/// A listener whose receiving half is gone is evicted the first time a send to it fails, so a
/// torn-down channel never blocks delivery to the others.
#[derive(Debug)]
pub struct Fanout<E> {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, mpsc::UnboundedSender<E>>>,
}

impl<E> Default for Fanout<E> {
    fn default() -> Self {
        Self { next_id: AtomicU64::new(0), channels: Mutex::new(HashMap::new()) }
    }
}

impl<E: Clone> Fanout<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener.
    pub fn subscribe(&self) -> (ChannelId, mpsc::UnboundedReceiver<E>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().insert(id, tx);
        (id, rx)
    }

    /// Removes a listener, e.g. on disconnect.
    pub fn unsubscribe(&self, id: ChannelId) {
        self.channels.lock().remove(&id);
    }

    /// Sends to a single listener. Returns false if it is gone.
    pub fn send_to(&self, id: ChannelId, event: E) -> bool {
        let mut channels = self.channels.lock();
        let Some(tx) = channels.get(&id) else { return false };
        if tx.send(event).is_err() {
            channels.remove(&id);
            return false;
        }
        true
    }

    /// Sends to every listener and returns how many received the event.
    pub fn broadcast(&self, event: E) -> usize {
        let mut channels = self.channels.lock();
        channels.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                trace!(target: "devwallet::server", channel = id, "evicting closed channel");
            }
            alive
        });
        channels.len()
    }

    /// Number of connected listeners.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

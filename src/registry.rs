//! Lock-encapsulated connection maps.
//!
//! The stream table and the ping table are touched by the read loop, the
//! stream handles and the public connection API. Each lock is held only for
//! the map operation itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::stream::StreamShared;

/// Live streams by id.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and keeps the existing entry) when `id` is taken.
    pub fn insert(&self, id: u32, stream: Arc<StreamShared>) -> bool {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if streams.contains_key(&id) {
            return false;
        }
        streams.insert(id, stream);
        true
    }

    pub fn get(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of streams matching `pred`.
    pub fn count_where(&self, pred: impl Fn(&StreamShared) -> bool) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| pred(s))
            .count()
    }

    /// Copy of the current entries, for iterating without the lock.
    pub fn snapshot(&self) -> Vec<Arc<StreamShared>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove and return every stream.
    pub fn drain(&self) -> Vec<Arc<StreamShared>> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, stream)| stream)
            .collect()
    }
}

/// Outstanding locally-issued pings by id.
#[derive(Debug, Default)]
pub struct PingTable {
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl PingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register ping `id`; the receiver completes when the echo arrives.
    pub fn insert(&self, id: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Resolve ping `id`. False when no such ping is outstanding.
    pub fn resolve(&self, id: u32) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: u32) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Drop every outstanding ping; their receivers observe cancellation.
    pub fn clear(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

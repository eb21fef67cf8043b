//! Pending acknowledgment table.
//!
//! Each in-flight `request` envelope owns one entry keyed by its id. The
//! entry is removed when the matching `ack` arrives, or when the
//! [`AckGuard`] held by the waiting future is dropped (timeout or caller
//! cancellation).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::Envelope;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
pub struct PendingAcks {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>,
}

/// Removes its entry from the table on drop.
pub struct AckGuard {
    table: PendingAcks,
    id: String,
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        self.table.inner.lock().remove(&self.id);
    }
}

/// An entry with this id is already outstanding.
#[derive(Debug)]
pub struct DuplicateAckId;

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`.
    pub fn register(
        &self,
        id: &str,
    ) -> Result<(AckGuard, oneshot::Receiver<Envelope>), DuplicateAckId> {
        let mut map = self.inner.lock();
        if map.contains_key(id) {
            return Err(DuplicateAckId);
        }
        let (tx, rx) = oneshot::channel();
        map.insert(id.to_string(), tx);
        drop(map);

        let guard = AckGuard {
            table: self.clone(),
            id: id.to_string(),
        };
        Ok((guard, rx))
    }

    /// Hand `ack` to the waiter registered under `id`. Returns false when
    /// nothing was waiting.
    pub fn resolve(&self, id: &str, ack: Envelope) -> bool {
        let sender = self.inner.lock().remove(id);
        match sender {
            Some(tx) => tx.send(ack).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe cancellation.
    pub fn fail_all(&self) -> usize {
        let mut map = self.inner.lock();
        let count = map.len();
        map.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

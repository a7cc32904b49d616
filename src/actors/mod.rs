//! Keyed actor runtime glue.
//!
//! Every `(actor type, key)` pair gets a single tokio task that owns its state
//! and drains a bounded mailbox. The runtime guarantee the rest of the crate
//! leans on: no two operations for the same key ever run concurrently, while
//! different keys run fully in parallel. Timer callbacks re-enter an actor
//! through the same mailbox as direct calls, so the guarantee holds for those
//! too.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Failure talking to a keyed actor: the owning task stopped, or it dropped
/// the reply channel without answering.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("{actor_type} actor for '{key}' is unavailable")]
    Unavailable {
        actor_type: &'static str,
        key: String,
    },
    #[error("{actor_type} actor for '{key}' dropped a request")]
    DroppedReply {
        actor_type: &'static str,
        key: String,
    },
}

/// Per-key mailbox registry with spawn-on-first-use.
///
/// Senders are handed out to callers; the receiving task is started exactly
/// once per key by the `start` closure. If an actor task has stopped (its
/// receiver dropped), the next lookup replaces it with a fresh spawn; durable
/// state is the actor's own job to reload.
pub struct Mailboxes<M> {
    inner: Arc<Mutex<HashMap<String, mpsc::Sender<M>>>>,
    capacity: usize,
}

impl<M> Clone for Mailboxes<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<M: Send + 'static> Mailboxes<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Return the mailbox sender for `key`, spawning the actor if it is not
    /// running. `start` must hand the receiver to a task that owns it for the
    /// actor's lifetime; it also receives a clone of the sender so the actor
    /// can re-enter its own mailbox (timer callbacks, completion messages).
    pub fn get_or_spawn(
        &self,
        key: &str,
        start: impl FnOnce(String, mpsc::Sender<M>, mpsc::Receiver<M>),
    ) -> mpsc::Sender<M> {
        let mut map = self.inner.lock();
        if let Some(sender) = map.get(key) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        map.insert(key.to_string(), tx.clone());
        start(key.to_string(), tx.clone(), rx);
        tx
    }

    /// Sender for `key` if its actor is currently running.
    pub fn get(&self, key: &str) -> Option<mpsc::Sender<M>> {
        let map = self.inner.lock();
        map.get(key).filter(|tx| !tx.is_closed()).cloned()
    }

    pub fn active_keys(&self) -> Vec<String> {
        let map = self.inner.lock();
        map.iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

//! Per-conversation message debouncing.
//!
//! The coordinator is a pure accumulator: it buffers events, resets a quiet
//! timer on every append, and hands out snapshots. Deciding whether a burst
//! is final is the caller's job (see [`pipeline`]).

use crate::actors::{ActorError, Mailboxes};
use crate::reminders::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub mod pipeline;

pub use pipeline::{BurstHandler, FlushOutcome, InboundPipeline, conversation_key};

/// An inbound message event, opaque to the coordinator apart from its id and
/// arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundEvent {
    /// Unique message id from the source platform.
    pub id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub group: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn conversation_key(&self) -> String {
        conversation_key(&self.sender, &self.recipient, self.group.as_deref())
    }
}

/// Response to an append: a snapshot of the buffer at that instant.
/// `should_process` is always false: the coordinator never decides on its
/// own whether to flush.
#[derive(Debug, Clone)]
pub struct AddAck {
    pub should_process: bool,
    pub messages: Vec<InboundEvent>,
}

pub enum DebounceMsg {
    Add {
        event: InboundEvent,
        window: Duration,
        reply: oneshot::Sender<AddAck>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<InboundEvent>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

// ── Registry ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DebounceRegistry {
    mailboxes: Mailboxes<DebounceMsg>,
    store: Store,
}

impl DebounceRegistry {
    pub fn new(store: Store, mailbox_capacity: usize) -> Self {
        Self {
            mailboxes: Mailboxes::new(mailbox_capacity),
            store,
        }
    }

    pub fn handle(&self, conversation_key: &str) -> DebounceHandle {
        let store = self.store.clone();
        let tx = self
            .mailboxes
            .get_or_spawn(conversation_key, move |key, _self_tx, rx| {
                tokio::spawn(async move {
                    let actor = DebounceActor::load(key, store);
                    actor.run(rx).await;
                });
            });
        DebounceHandle {
            tx,
            key: conversation_key.to_string(),
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DebounceHandle {
    tx: mpsc::Sender<DebounceMsg>,
    key: String,
}

impl DebounceHandle {
    fn unavailable(&self) -> ActorError {
        ActorError::Unavailable {
            actor_type: "debounce",
            key: self.key.clone(),
        }
    }

    fn dropped(&self) -> ActorError {
        ActorError::DroppedReply {
            actor_type: "debounce",
            key: self.key.clone(),
        }
    }

    /// Append an event and (re)start the quiet timer. Returns a snapshot of
    /// the buffer including the new event.
    pub async fn add_message(
        &self,
        event: InboundEvent,
        window: Duration,
    ) -> anyhow::Result<AddAck> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DebounceMsg::Add {
                event,
                window,
                reply,
            })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.dropped().into())
    }

    /// Snapshot copy of the current buffer; empty for an unknown key.
    pub async fn messages(&self) -> anyhow::Result<Vec<InboundEvent>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DebounceMsg::Snapshot { reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.dropped().into())
    }

    /// Cancel the pending timer and destroy the entry entirely.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DebounceMsg::Clear { reply })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.dropped().into())
    }
}

// ── Actor ─────────────────────────────────────────────────────────

struct DebounceActor {
    key: String,
    store: Store,
    events: Vec<InboundEvent>,
    pending_timer: Option<JoinHandle<()>>,
}

impl DebounceActor {
    /// Reload the durable buffer for this key; corrupt payloads are skipped.
    fn load(key: String, store: Store) -> Self {
        let events = match store.load_debounce_events(&key) {
            Ok(payloads) => payloads
                .iter()
                .filter_map(|payload| match serde_json::from_str(payload) {
                    Ok(event) => Some(event),
                    Err(error) => {
                        tracing::warn!(%key, %error, "skipping corrupt buffered event");
                        None
                    }
                })
                .collect(),
            Err(error) => {
                tracing::warn!(%key, %error, "failed to load buffered events, starting empty");
                Vec::new()
            }
        };
        Self {
            key,
            store,
            events,
            pending_timer: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DebounceMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DebounceMsg::Add {
                    event,
                    window,
                    reply,
                } => {
                    self.add(event, window);
                    let _ = reply.send(AddAck {
                        should_process: false,
                        messages: self.events.clone(),
                    });
                }
                DebounceMsg::Snapshot { reply } => {
                    let _ = reply.send(self.events.clone());
                }
                DebounceMsg::Clear { reply } => {
                    self.clear();
                    let _ = reply.send(());
                }
            }
        }
        if let Some(timer) = self.pending_timer.take() {
            timer.abort();
        }
    }

    fn add(&mut self, event: InboundEvent, window: Duration) {
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(error) = self.store.append_debounce_event(&self.key, &payload) {
                    tracing::warn!(key = %self.key, %error, "failed to persist buffered event");
                }
            }
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "failed to encode buffered event");
            }
        }
        self.events.push(event);

        // Each append cancels the previous quiet timer; that is the
        // coalescing mechanism.
        if let Some(timer) = self.pending_timer.take() {
            timer.abort();
        }
        let key = self.key.clone();
        self.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tracing::trace!(%key, "debounce window elapsed");
        }));
    }

    fn clear(&mut self) {
        if let Some(timer) = self.pending_timer.take() {
            timer.abort();
        }
        self.events.clear();
        if let Err(error) = self.store.clear_debounce_events(&self.key) {
            tracing::warn!(key = %self.key, %error, "failed to clear buffered events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(id: &str, body: &str) -> InboundEvent {
        InboundEvent {
            id: id.to_string(),
            sender: "user-1".to_string(),
            recipient: "bot".to_string(),
            group: None,
            body: body.to_string(),
            received_at: Utc::now(),
        }
    }

    fn registry(tmp: &TempDir) -> DebounceRegistry {
        DebounceRegistry::new(Store::open(tmp.path().join("burrow.db")), 64)
    }

    const WINDOW: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn add_returns_a_snapshot_and_never_decides() {
        let tmp = TempDir::new().unwrap();
        let handle = registry(&tmp).handle("conv-1");

        let first = handle.add_message(event("m1", "hello"), WINDOW).await.unwrap();
        assert!(!first.should_process);
        assert_eq!(first.messages.len(), 1);

        let second = handle.add_message(event("m2", "world"), WINDOW).await.unwrap();
        assert!(!second.should_process);
        let ids: Vec<&str> = second.messages.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn snapshot_of_unknown_key_is_empty() {
        let tmp = TempDir::new().unwrap();
        let handle = registry(&tmp).handle("conv-never-seen");
        assert!(handle.messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_independent_copies() {
        let tmp = TempDir::new().unwrap();
        let handle = registry(&tmp).handle("conv-1");
        handle.add_message(event("m1", "hello"), WINDOW).await.unwrap();

        let mut snapshot = handle.messages().await.unwrap();
        snapshot.clear();

        assert_eq!(handle.messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_destroys_the_entry() {
        let tmp = TempDir::new().unwrap();
        let handle = registry(&tmp).handle("conv-1");

        handle.add_message(event("m1", "hello"), WINDOW).await.unwrap();
        handle.add_message(event("m2", "again"), WINDOW).await.unwrap();
        handle.clear().await.unwrap();
        assert!(handle.messages().await.unwrap().is_empty());

        // A later add starts a fresh entry.
        let ack = handle.add_message(event("m3", "fresh"), WINDOW).await.unwrap();
        assert_eq!(ack.messages.len(), 1);
        assert_eq!(ack.messages[0].id, "m3");
    }

    #[tokio::test]
    async fn buffered_events_survive_a_restart() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("burrow.db"));

        {
            let handle = DebounceRegistry::new(store.clone(), 64).handle("conv-1");
            handle.add_message(event("m1", "hello"), WINDOW).await.unwrap();
            handle.add_message(event("m2", "world"), WINDOW).await.unwrap();
        }

        // A fresh registry over the same store reloads the durable buffer.
        let handle = DebounceRegistry::new(store, 64).handle("conv-1");
        let buffered = handle.messages().await.unwrap();
        let ids: Vec<&str> = buffered.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
    }

    #[tokio::test]
    async fn keys_do_not_share_buffers() {
        let tmp = TempDir::new().unwrap();
        let registry = registry(&tmp);
        let a = registry.handle("conv-a");
        let b = registry.handle("conv-b");

        a.add_message(event("m1", "for a"), WINDOW).await.unwrap();
        assert!(b.messages().await.unwrap().is_empty());
    }
}

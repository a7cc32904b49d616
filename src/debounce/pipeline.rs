//! Inbound event pipeline: the debounce protocol on top of the coordinator.
//!
//! Every inbound event gets its own pipeline call. Each call appends to the
//! per-conversation buffer, waits out the quiet window (minus a safety
//! margin), and then checks whether its own event is still the newest one.
//! Only the caller owning the last event flushes: last writer wins, at most
//! one flush per burst.

use crate::config::DebounceConfig;
use crate::debounce::{DebounceRegistry, InboundEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Downstream consumer of a finished burst.
#[async_trait]
pub trait BurstHandler: Send + Sync {
    async fn process(&self, conversation_key: &str, events: &[InboundEvent])
    -> anyhow::Result<()>;
}

/// What a single pipeline call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// This caller owned the burst and processed all buffered events.
    Flushed(Vec<InboundEvent>),
    /// A newer event arrived during the wait; its caller owns the flush.
    Superseded,
    /// The buffer was empty at wake-up (another caller already cleared it).
    EmptyBuffer,
}

/// Derive the conversation key for a (sender, recipient, group) triple.
///
/// A group id names the conversation on its own; every participant's
/// messages share one key. Direct messages key on the sender/recipient pair.
/// Deterministic and collision-free: the namespaces are disjoint and the
/// separator is escaped inside each part, so distinct conversations can never
/// produce the same key.
pub fn conversation_key(sender: &str, recipient: &str, group: Option<&str>) -> String {
    fn escape(part: &str) -> String {
        part.replace('\\', "\\\\").replace('|', "\\|")
    }
    match group {
        Some(group) => format!("group|{}|{}", escape(recipient), escape(group)),
        None => format!("dm|{}|{}", escape(sender), escape(recipient)),
    }
}

pub struct InboundPipeline {
    registry: DebounceRegistry,
    handler: Arc<dyn BurstHandler>,
    window: Duration,
    wait: Duration,
}

impl InboundPipeline {
    pub fn new(
        registry: DebounceRegistry,
        handler: Arc<dyn BurstHandler>,
        config: &DebounceConfig,
    ) -> Self {
        let window = Duration::from_millis(config.window_ms);
        let margin = Duration::from_millis(config.safety_margin_ms.min(config.window_ms));
        Self {
            registry,
            handler,
            window,
            wait: window - margin,
        }
    }

    /// Run the debounce protocol for one inbound event.
    ///
    /// The wait suspends this caller only; the coordinator keeps accepting
    /// appends from concurrent callers throughout. A handler failure
    /// propagates and deliberately leaves the buffer in place: the same
    /// burst can be retried, and the next unrelated event on this key will
    /// be bundled with the unprocessed leftovers.
    pub async fn handle_event(&self, event: InboundEvent) -> anyhow::Result<FlushOutcome> {
        let key = event.conversation_key();
        let event_id = event.id.clone();
        let handle = self.registry.handle(&key);

        handle.add_message(event, self.window).await?;
        tokio::time::sleep(self.wait).await;

        let buffered = handle.messages().await?;
        let Some(last) = buffered.last() else {
            tracing::debug!(%key, %event_id, "buffer already cleared, nothing to flush");
            return Ok(FlushOutcome::EmptyBuffer);
        };
        if last.id != event_id {
            tracing::debug!(%key, %event_id, newest = %last.id, "superseded by a newer event");
            return Ok(FlushOutcome::Superseded);
        }

        tracing::info!(%key, count = buffered.len(), "flushing message burst");
        self.handler.process(&key, &buffered).await?;
        handle.clear().await?;
        Ok(FlushOutcome::Flushed(buffered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminders::Store;
    use chrono::Utc;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct RecordingHandler {
        bursts: Arc<Mutex<Vec<Vec<String>>>>,
        fail: bool,
    }

    #[async_trait]
    impl BurstHandler for RecordingHandler {
        async fn process(
            &self,
            _conversation_key: &str,
            events: &[InboundEvent],
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("downstream processing failed");
            }
            self.bursts
                .lock()
                .push(events.iter().map(|e| e.id.clone()).collect());
            Ok(())
        }
    }

    fn event(id: &str) -> InboundEvent {
        InboundEvent {
            id: id.to_string(),
            sender: "user-1".to_string(),
            recipient: "bot".to_string(),
            group: None,
            body: format!("body of {id}"),
            received_at: Utc::now(),
        }
    }

    fn pipeline(tmp: &TempDir, fail: bool) -> (Arc<InboundPipeline>, Arc<Mutex<Vec<Vec<String>>>>) {
        let bursts = Arc::new(Mutex::new(Vec::new()));
        let config = DebounceConfig {
            window_ms: 400,
            safety_margin_ms: 100,
            mailbox_capacity: 64,
        };
        let registry = DebounceRegistry::new(Store::open(tmp.path().join("burrow.db")), 64);
        let handler = Arc::new(RecordingHandler {
            bursts: bursts.clone(),
            fail,
        });
        (
            Arc::new(InboundPipeline::new(registry, handler, &config)),
            bursts,
        )
    }

    #[tokio::test]
    async fn burst_produces_exactly_one_flush_in_arrival_order() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, bursts) = pipeline(&tmp, false);

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle_event(event("msg-1")).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle_event(event("msg-2")).await.unwrap() })
        };

        let first = first.await.unwrap();
        let second = second.await.unwrap();

        // msg-1's caller wakes first, sees msg-2 as the newest event, and
        // exits without side effects; msg-2's caller owns the flush.
        assert_eq!(first, FlushOutcome::Superseded);
        match second {
            FlushOutcome::Flushed(events) => {
                let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
                assert_eq!(ids, ["msg-1", "msg-2"]);
            }
            other => panic!("expected flush, got {other:?}"),
        }

        assert_eq!(bursts.lock().as_slice(), [vec!["msg-1".to_string(), "msg-2".to_string()]]);
    }

    #[tokio::test]
    async fn lone_event_flushes_itself() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, bursts) = pipeline(&tmp, false);

        let outcome = pipeline.handle_event(event("solo")).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Flushed(ref events) if events.len() == 1));
        assert_eq!(bursts.lock().len(), 1);
    }

    #[tokio::test]
    async fn cleared_buffer_aborts_the_flush() {
        let tmp = TempDir::new().unwrap();
        let (pipeline, bursts) = pipeline(&tmp, false);

        let call = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.handle_event(event("msg-1")).await.unwrap() })
        };
        // Another caller clears the key mid-wait.
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline
            .registry
            .handle(&conversation_key("user-1", "bot", None))
            .clear()
            .await
            .unwrap();

        assert_eq!(call.await.unwrap(), FlushOutcome::EmptyBuffer);
        assert!(bursts.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_buffer_for_the_next_burst() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("burrow.db"));
        let config = DebounceConfig {
            window_ms: 400,
            safety_margin_ms: 100,
            mailbox_capacity: 64,
        };
        let registry = DebounceRegistry::new(store, 64);
        let bursts = Arc::new(Mutex::new(Vec::new()));

        let failing = InboundPipeline::new(
            registry.clone(),
            Arc::new(RecordingHandler {
                bursts: bursts.clone(),
                fail: true,
            }),
            &config,
        );
        assert!(failing.handle_event(event("msg-1")).await.is_err());

        // The buffer was not cleared on failure; the next burst carries the
        // leftover event along with the new one.
        let working = InboundPipeline::new(
            registry,
            Arc::new(RecordingHandler {
                bursts: bursts.clone(),
                fail: false,
            }),
            &config,
        );
        let outcome = working.handle_event(event("msg-2")).await.unwrap();
        match outcome {
            FlushOutcome::Flushed(events) => {
                let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
                assert_eq!(ids, ["msg-1", "msg-2"]);
            }
            other => panic!("expected flush, got {other:?}"),
        }
    }

    #[test]
    fn conversation_keys_are_deterministic_and_collision_free() {
        assert_eq!(
            conversation_key("alice", "bot", None),
            conversation_key("alice", "bot", None)
        );
        assert_ne!(
            conversation_key("alice", "bot", Some("team")),
            conversation_key("alice", "bot", None)
        );
        // Separator characters inside a part cannot forge another triple.
        assert_ne!(
            conversation_key("alice|bot", "x", None),
            conversation_key("alice", "bot|x", None)
        );
    }

    #[test]
    fn group_messages_share_a_key_across_senders() {
        let mut a = event("m1");
        a.group = Some("team".to_string());
        let mut b = event("m2");
        b.sender = "user-2".to_string();
        b.group = Some("team".to_string());
        assert_eq!(a.conversation_key(), b.conversation_key());
        assert_ne!(a.conversation_key(), event("m3").conversation_key());
    }
}

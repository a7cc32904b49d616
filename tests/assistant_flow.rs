//! End-to-end integration tests for the assistant core.
//!
//! These exercise the full path (inbound events, debounce, execution agent,
//! reminder scheduling, completion relay) through the public API, using mock
//! collaborators instead of a real model or messaging platform. They
//! complement the unit tests that live next to each module.

use anyhow::Result;
use async_trait::async_trait;
use burrow::config::Config;
use burrow::daemon::{Collaborators, Daemon, RelayNotifier};
use burrow::debounce::InboundEvent;
use burrow::reminders::{AgentTools, ReminderStatus};
use burrow::runner::{LoopOutcome, Outbound, ReasoningLoop, TokenUsage};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────────────
// Mock infrastructure
// ─────────────────────────────────────────────────────────────────────────────

/// Reasoning loop that records every task and answers with a canned summary.
/// When `schedule_secs` is set, the first run also schedules a reminder
/// through the tool surface, the way a real loop would.
struct MockLoop {
    tasks: Arc<Mutex<Vec<String>>>,
    schedule_secs: Option<u64>,
}

#[async_trait]
impl ReasoningLoop for MockLoop {
    async fn run(&self, task: &str, tools: AgentTools) -> Result<LoopOutcome> {
        let first_run = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(task.to_string());
            tasks.len() == 1
        };

        if first_run {
            if let Some(delay) = self.schedule_secs {
                let ack = tools.schedule_reminder(delay, "follow up on the report", None);
                assert!(ack.success, "{}", ack.message);
            }
        }

        Ok(LoopOutcome {
            text: format!("handled: {}", task.lines().count()),
            usage: TokenUsage {
                input_tokens: 42,
                output_tokens: 7,
            },
            steps: 1,
        })
    }
}

struct RecordingOutbound {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send(&self, conversation_id: &str, text: &str) -> Result<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((conversation_id.to_string(), text.to_string()));
        Ok(format!("msg-{}", sent.len()))
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::load_from(tmp.path()).unwrap();
    config.debounce.window_ms = 300;
    config.debounce.safety_margin_ms = 100;
    config
}

fn event(id: &str, sender: &str, body: &str) -> InboundEvent {
    InboundEvent {
        id: id.to_string(),
        sender: sender.to_string(),
        recipient: "assistant".to_string(),
        group: Some("team-chat".to_string()),
        body: body.to_string(),
        received_at: Utc::now(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rapid_messages_become_one_turn_and_one_reply() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    let tasks = Arc::new(Mutex::new(Vec::new()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let daemon = Daemon::build(
        config,
        Collaborators {
            runner: Arc::new(MockLoop {
                tasks: tasks.clone(),
                schedule_secs: None,
            }),
            notifier: Arc::new(RelayNotifier::new(Arc::new(RecordingOutbound {
                sent: sent.clone(),
            }))),
        },
    );
    let store = daemon.store.clone();

    let (tx, rx) = mpsc::channel(16);
    let daemon_task = tokio::spawn(daemon.run(rx));

    tx.send(event("m1", "alice", "are you there?")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    tx.send(event("m2", "alice", "need the numbers")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    tx.send(event("m3", "bob", "and the charts")).await.unwrap();

    // Let the burst settle and the turn complete, then shut down.
    tokio::time::sleep(Duration::from_millis(800)).await;
    drop(tx);
    daemon_task.await.unwrap().unwrap();

    // One turn, carrying all three messages in arrival order.
    let tasks = tasks.lock().unwrap().clone();
    assert_eq!(tasks.len(), 1, "burst must produce exactly one turn");
    assert_eq!(
        tasks[0],
        "alice: are you there?\nalice: need the numbers\nbob: and the charts"
    );

    // One completion relayed back to the conversation.
    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "handled: 3");

    // The agent checkpoint reached completed and the buffer is gone.
    let key = event("m1", "alice", "x").conversation_key();
    let row = store.load_agent(&key).unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert!(store.load_debounce_events(&key).unwrap().is_empty());
}

#[tokio::test]
async fn separate_conversations_run_independent_turns() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    let tasks = Arc::new(Mutex::new(Vec::new()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let daemon = Daemon::build(
        config,
        Collaborators {
            runner: Arc::new(MockLoop {
                tasks: tasks.clone(),
                schedule_secs: None,
            }),
            notifier: Arc::new(RelayNotifier::new(Arc::new(RecordingOutbound {
                sent: sent.clone(),
            }))),
        },
    );

    let (tx, rx) = mpsc::channel(16);
    let daemon_task = tokio::spawn(daemon.run(rx));

    let mut other = event("m2", "carol", "different room");
    other.group = Some("ops-chat".to_string());
    tx.send(event("m1", "alice", "hello")).await.unwrap();
    tx.send(other).await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    drop(tx);
    daemon_task.await.unwrap().unwrap();

    let tasks = tasks.lock().unwrap().clone();
    assert_eq!(tasks.len(), 2, "distinct keys must flush separately");
    assert_eq!(sent.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn reasoning_loop_can_schedule_a_durable_reminder() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    let tasks = Arc::new(Mutex::new(Vec::new()));
    let sent = Arc::new(Mutex::new(Vec::new()));
    let daemon = Daemon::build(
        config,
        Collaborators {
            runner: Arc::new(MockLoop {
                tasks: tasks.clone(),
                schedule_secs: Some(120),
            }),
            notifier: Arc::new(RelayNotifier::new(Arc::new(RecordingOutbound {
                sent: sent.clone(),
            }))),
        },
    );
    let store = daemon.store.clone();
    let timers = daemon.timers.clone();

    let (tx, rx) = mpsc::channel(16);
    let daemon_task = tokio::spawn(daemon.run(rx));

    tx.send(event("m1", "alice", "remind me about the report"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    drop(tx);
    daemon_task.await.unwrap().unwrap();

    // The reminder row exists, fully scheduled, with its timer handle.
    let key = event("m1", "alice", "x").conversation_key();
    let pending = store.pending_reminders(&key).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, ReminderStatus::Pending);
    assert_eq!(pending[0].task_description, "follow up on the report");
    assert!(pending[0].schedule_handle.is_some());
    assert_eq!(timers.active(), 1);

    let delta = (pending[0].scheduled_at - Utc::now()).num_seconds();
    assert!((110..=130).contains(&delta), "unexpected schedule delta {delta}");
}

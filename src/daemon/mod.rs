//! Daemon wiring: actor registries, reminder recovery, and the supervised
//! inbound consumer.
//!
//! The host embeds [`Daemon`] with its own collaborator implementations and
//! feeds parsed channel events into the inbound receiver; webhook and wire
//! parsing stay outside this crate.

use crate::config::Config;
use crate::debounce::{
    BurstHandler, DebounceRegistry, FlushOutcome, InboundEvent, InboundPipeline,
};
use crate::executor::{AgentDeps, AgentRegistry, TaskInput};
use crate::reminders::{Store, TimerService};
use crate::runner::{CompletionNotifier, CompletionReport, Outbound, ReasoningLoop};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::task::TaskTracker;

/// External collaborators the daemon wires into every execution agent.
pub struct Collaborators {
    pub runner: Arc<dyn ReasoningLoop>,
    pub notifier: Arc<dyn CompletionNotifier>,
}

/// Completion notifier that relays results straight back to the conversation
/// channel, for hosts without a separate parent service.
pub struct RelayNotifier {
    outbound: Arc<dyn Outbound>,
}

impl RelayNotifier {
    pub fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl CompletionNotifier for RelayNotifier {
    async fn deliver(&self, report: &CompletionReport) -> Result<()> {
        let text = if report.success {
            report
                .result
                .clone()
                .unwrap_or_else(|| "Task completed.".to_string())
        } else {
            format!(
                "Task failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            )
        };
        let message_id = self.outbound.send(&report.conversation_id, &text).await?;
        tracing::debug!(
            conversation_id = %report.conversation_id,
            %message_id,
            "completion relayed to conversation"
        );
        Ok(())
    }
}

/// Hands each finished burst to the conversation's execution agent.
///
/// A busy agent is surfaced as an error so the pipeline keeps the buffer:
/// the burst rides along with the next event on that conversation.
struct DelegatingHandler {
    agents: AgentRegistry,
}

#[async_trait]
impl BurstHandler for DelegatingHandler {
    async fn process(&self, conversation_key: &str, events: &[InboundEvent]) -> Result<()> {
        let input = TaskInput {
            description: render_burst(events),
            conversation_id: conversation_key.to_string(),
            context: None,
        };
        let ack = self
            .agents
            .handle(conversation_key)
            .execute_task(input)
            .await?;
        if !ack.success {
            anyhow::bail!("{}", ack.message);
        }
        Ok(())
    }
}

fn render_burst(events: &[InboundEvent]) -> String {
    let mut text = String::new();
    for event in events {
        text.push_str(&event.sender);
        text.push_str(": ");
        text.push_str(&event.body);
        text.push('\n');
    }
    text.trim_end().to_string()
}

pub struct Daemon {
    pub store: Store,
    pub timers: TimerService,
    pub tracker: TaskTracker,
    pub agents: AgentRegistry,
    pub pipeline: Arc<InboundPipeline>,
    config: Config,
}

impl Daemon {
    pub fn build(config: Config, collaborators: Collaborators) -> Self {
        let store = Store::open(config.store_db_path());
        let timers = TimerService::new();
        let tracker = TaskTracker::new();

        let agents = AgentRegistry::new(AgentDeps {
            store: store.clone(),
            timers: timers.clone(),
            limits: config.reminders.clone(),
            runner: collaborators.runner,
            notifier: collaborators.notifier,
            tracker: tracker.clone(),
        });

        let registry = DebounceRegistry::new(store.clone(), config.debounce.mailbox_capacity);
        let handler = Arc::new(DelegatingHandler {
            agents: agents.clone(),
        });
        let pipeline = Arc::new(InboundPipeline::new(registry, handler, &config.debounce));

        Self {
            store,
            timers,
            tracker,
            agents,
            pipeline,
            config,
        }
    }

    /// Run until the inbound channel closes, then drain outstanding work.
    /// Detached executions keep the process alive until they finish; only
    /// sleeping reminder timers are abandoned (their rows recover next start).
    pub async fn run(self, inbound: mpsc::Receiver<InboundEvent>) -> Result<()> {
        let recovered = self.agents.recover_pending_reminders()?;
        if recovered > 0 {
            tracing::info!(recovered, "re-armed pending reminders at startup");
        }

        let initial_backoff = self.config.reliability.component_initial_backoff_secs.max(1);
        let max_backoff = self
            .config
            .reliability
            .component_max_backoff_secs
            .max(initial_backoff);

        let inbound = Arc::new(tokio::sync::Mutex::new(inbound));
        let consumer = {
            let pipeline = Arc::clone(&self.pipeline);
            let tracker = self.tracker.clone();
            spawn_component_supervisor(
                "inbound-consumer",
                initial_backoff,
                max_backoff,
                move || {
                    let pipeline = Arc::clone(&pipeline);
                    let tracker = tracker.clone();
                    let inbound = Arc::clone(&inbound);
                    async move { consume_inbound(pipeline, tracker, inbound).await }
                },
            )
        };

        if let Err(error) = consumer.await {
            tracing::error!(%error, "inbound consumer task panicked");
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("daemon drained outstanding work and stopped");
        Ok(())
    }
}

/// Each event becomes its own pipeline call: the debounce protocol depends on
/// callers waiting concurrently, so calls must not be serialized here.
async fn consume_inbound(
    pipeline: Arc<InboundPipeline>,
    tracker: TaskTracker,
    inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundEvent>>>,
) -> Result<()> {
    loop {
        let event = { inbound.lock().await.recv().await };
        let Some(event) = event else {
            return Ok(());
        };

        let pipeline = Arc::clone(&pipeline);
        tracker.spawn(async move {
            match pipeline.handle_event(event).await {
                Ok(FlushOutcome::Flushed(events)) => {
                    tracing::debug!(count = events.len(), "burst dispatched");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, "burst processing failed; buffer retained");
                }
            }
        });
    }
}

/// Restart a daemon component with doubling backoff on failure. A clean exit
/// (closed inbound channel) stops the supervisor.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            match run_component().await {
                Ok(()) => {
                    tracing::info!("Daemon component '{name}' stopped");
                    return;
                }
                Err(e) => {
                    tracing::error!("Daemon component '{name}' failed: {e}");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

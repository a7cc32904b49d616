//! Execution agent actor.
//!
//! One actor per agent id. The mailbox serializes every entry point
//! (direct calls, timer fires, and the actor's own completion message),
//! which is what makes `is_executing` a correct lock-free gate: there is no
//! window where the flag reads false while a dispatched run is still
//! outstanding.

use crate::actors::{ActorError, Mailboxes};
use crate::executor::types::{
    ExecuteAck, ExecutionState, TaskInput, TaskStatus, Trigger, TriggerPatch, TriggerReply,
    TriggerStatus, reschedule_backoff_secs,
};
use crate::reminders::{AgentRow, AgentTools, ReminderFire, ReminderStatus, Store, TimerService};
use crate::runner::{CompletionNotifier, CompletionReport, ReasoningLoop};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

const MAILBOX_CAPACITY: usize = 64;
const BUSY_MESSAGE: &str = "Agent is already executing a task";
const STARTED_MESSAGE: &str = "Task execution started";
const REMINDER_PREFIX: &str = "[Scheduled reminder]";
/// Overdue reminders recovered at startup fire after this grace delay.
const RECOVERY_GRACE_SECS: u64 = 1;

pub enum AgentMsg {
    Execute {
        input: TaskInput,
        reply: oneshot::Sender<ExecuteAck>,
    },
    CreateTrigger {
        payload: String,
        start_time: DateTime<Utc>,
        rrule: Option<String>,
        reply: oneshot::Sender<Trigger>,
    },
    UpdateTrigger {
        id: String,
        patch: TriggerPatch,
        reply: oneshot::Sender<TriggerReply>,
    },
    ListTriggers {
        reply: oneshot::Sender<Vec<Trigger>>,
    },
    GetStatus {
        reply: oneshot::Sender<ExecutionState>,
    },
    ExecuteTrigger {
        id: String,
        reply: oneshot::Sender<ExecuteAck>,
    },
    /// Platform-timer re-entry; never sent by users directly.
    ProcessReminder { reminder_id: String },
    /// Internal: the detached run finished and persisted nothing yet; the
    /// actor owns the terminal checkpoint and the flag clear.
    TaskFinished {
        success: bool,
        output: String,
        conversation_id: String,
    },
}

/// Shared collaborators handed to every execution agent.
#[derive(Clone)]
pub struct AgentDeps {
    pub store: Store,
    pub timers: TimerService,
    pub limits: crate::config::ReminderConfig,
    pub runner: Arc<dyn ReasoningLoop>,
    pub notifier: Arc<dyn CompletionNotifier>,
    /// Tracks detached runs so the process can drain them before exit.
    pub tracker: TaskTracker,
}

// ── Registry ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AgentRegistry {
    mailboxes: Mailboxes<AgentMsg>,
    deps: AgentDeps,
}

impl AgentRegistry {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            mailboxes: Mailboxes::new(MAILBOX_CAPACITY),
            deps,
        }
    }

    pub fn handle(&self, agent_id: &str) -> AgentHandle {
        let deps = self.deps.clone();
        let tx = self.mailboxes.get_or_spawn(agent_id, move |key, self_tx, rx| {
            tokio::spawn(async move {
                let state = load_state(&deps.store, &key);
                let actor = AgentActor {
                    key,
                    state,
                    conversation_id: None,
                    deps,
                    self_tx,
                };
                actor.run(rx).await;
            });
        });
        AgentHandle {
            tx,
            agent_id: agent_id.to_string(),
        }
    }

    /// Re-arm a platform timer for every pending reminder. Run once at
    /// startup: in-process timers do not survive a restart, the rows do.
    pub fn recover_pending_reminders(&self) -> Result<usize> {
        let pending = self
            .deps
            .store
            .all_pending()
            .context("Failed to load pending reminders for recovery")?;
        let count = pending.len();

        for row in pending {
            let now = Utc::now();
            let delay_secs = u64::try_from((row.scheduled_at - now).num_seconds())
                .unwrap_or(0)
                .max(RECOVERY_GRACE_SECS);

            let registry = self.clone();
            let agent_key = row.agent_key.clone();
            let reminder_id = row.id.clone();
            let handle_id = self
                .deps
                .timers
                .register(Duration::from_secs(delay_secs), async move {
                    if let Err(error) = registry
                        .handle(&agent_key)
                        .process_reminder(reminder_id.clone())
                        .await
                    {
                        tracing::warn!(%reminder_id, %error, "recovered reminder fire failed");
                    }
                });

            if let Err(error) = self.deps.store.set_schedule_handle(&row.id, &handle_id) {
                tracing::warn!(reminder_id = %row.id, %error, "failed to record recovered timer handle");
            }
            tracing::info!(reminder_id = %row.id, delay_secs, "re-armed pending reminder");
        }

        Ok(count)
    }
}

// ── Handle ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentMsg>,
    agent_id: String,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> AgentMsg,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| {
            ActorError::Unavailable {
                actor_type: "execution",
                key: self.agent_id.clone(),
            }
        })?;
        reply_rx.await.map_err(|_| {
            ActorError::DroppedReply {
                actor_type: "execution",
                key: self.agent_id.clone(),
            }
            .into()
        })
    }

    pub async fn execute_task(&self, input: TaskInput) -> Result<ExecuteAck> {
        self.request(|reply| AgentMsg::Execute { input, reply }).await
    }

    pub async fn create_trigger(
        &self,
        payload: impl Into<String>,
        start_time: DateTime<Utc>,
        rrule: Option<String>,
    ) -> Result<Trigger> {
        let payload = payload.into();
        self.request(|reply| AgentMsg::CreateTrigger {
            payload,
            start_time,
            rrule,
            reply,
        })
        .await
    }

    pub async fn update_trigger(&self, id: impl Into<String>, patch: TriggerPatch) -> Result<TriggerReply> {
        let id = id.into();
        self.request(|reply| AgentMsg::UpdateTrigger { id, patch, reply })
            .await
    }

    pub async fn list_triggers(&self) -> Result<Vec<Trigger>> {
        self.request(|reply| AgentMsg::ListTriggers { reply }).await
    }

    pub async fn status(&self) -> Result<ExecutionState> {
        self.request(|reply| AgentMsg::GetStatus { reply }).await
    }

    pub async fn execute_trigger(&self, id: impl Into<String>) -> Result<ExecuteAck> {
        let id = id.into();
        self.request(|reply| AgentMsg::ExecuteTrigger { id, reply })
            .await
    }

    /// Fire-and-forget timer entry point.
    pub async fn process_reminder(&self, reminder_id: String) -> Result<()> {
        self.tx
            .send(AgentMsg::ProcessReminder { reminder_id })
            .await
            .map_err(|_| {
                ActorError::Unavailable {
                    actor_type: "execution",
                    key: self.agent_id.clone(),
                }
                .into()
            })
    }
}

// ── Actor ─────────────────────────────────────────────────────────

fn load_state(store: &Store, agent_id: &str) -> ExecutionState {
    match store.load_agent(agent_id) {
        Ok(Some(row)) => {
            let status = TaskStatus::try_from(row.status.as_str()).unwrap_or_else(|error| {
                tracing::warn!(agent_id, %error, "invalid checkpointed status, resetting");
                TaskStatus::Pending
            });
            let triggers: Vec<Trigger> =
                serde_json::from_str(&row.triggers_json).unwrap_or_else(|error| {
                    tracing::warn!(agent_id, %error, "invalid trigger checkpoint, starting empty");
                    Vec::new()
                });
            ExecutionState {
                agent_id: agent_id.to_string(),
                task_description: row.task_description,
                status,
                result: row.result,
                triggers,
                // A restart cannot resume an in-flight run.
                is_executing: false,
            }
        }
        Ok(None) => ExecutionState::new(agent_id),
        Err(error) => {
            tracing::warn!(agent_id, %error, "failed to load agent checkpoint, starting fresh");
            ExecutionState::new(agent_id)
        }
    }
}

struct AgentActor {
    key: String,
    state: ExecutionState,
    /// Conversation of the most recent execution request; trigger-initiated
    /// runs report completion against it.
    conversation_id: Option<String>,
    deps: AgentDeps,
    self_tx: mpsc::Sender<AgentMsg>,
}

impl AgentActor {
    async fn run(mut self, mut rx: mpsc::Receiver<AgentMsg>) {
        tracing::debug!(agent_id = %self.state.agent_id, "execution agent started");
        while let Some(msg) = rx.recv().await {
            self.handle(msg);
        }
        tracing::debug!(agent_id = %self.state.agent_id, "execution agent stopped");
    }

    fn handle(&mut self, msg: AgentMsg) {
        match msg {
            AgentMsg::Execute { input, reply } => {
                let ack = self.execute(input);
                let _ = reply.send(ack);
            }
            AgentMsg::CreateTrigger {
                payload,
                start_time,
                rrule,
                reply,
            } => {
                let trigger = self.create_trigger(payload, start_time, rrule);
                let _ = reply.send(trigger);
            }
            AgentMsg::UpdateTrigger { id, patch, reply } => {
                let _ = reply.send(self.update_trigger(&id, patch));
            }
            AgentMsg::ListTriggers { reply } => {
                let _ = reply.send(self.state.triggers.clone());
            }
            AgentMsg::GetStatus { reply } => {
                let _ = reply.send(self.state.clone());
            }
            AgentMsg::ExecuteTrigger { id, reply } => {
                let ack = self.execute_trigger(&id);
                let _ = reply.send(ack);
            }
            AgentMsg::ProcessReminder { reminder_id } => {
                self.process_reminder(&reminder_id);
            }
            AgentMsg::TaskFinished {
                success,
                output,
                conversation_id,
            } => {
                self.task_finished(success, output, conversation_id);
            }
        }
    }

    // ── Task dispatch ─────────────────────────────────────────

    fn execute(&mut self, input: TaskInput) -> ExecuteAck {
        if self.state.is_executing {
            return ExecuteAck {
                success: false,
                message: BUSY_MESSAGE.to_string(),
            };
        }

        self.conversation_id = Some(input.conversation_id.clone());
        let mut description = input.description;
        if let Some(context) = input.context {
            description.push_str("\n\nContext: ");
            description.push_str(&context);
        }
        self.dispatch(description, input.conversation_id, None);
        ExecuteAck {
            success: true,
            message: STARTED_MESSAGE.to_string(),
        }
    }

    fn execute_trigger(&mut self, id: &str) -> ExecuteAck {
        let Some(trigger) = self.state.triggers.iter_mut().find(|t| t.id == id) else {
            return ExecuteAck {
                success: false,
                message: "Trigger not found".to_string(),
            };
        };
        if trigger.status != TriggerStatus::Active {
            return ExecuteAck {
                success: false,
                message: "Trigger is not active".to_string(),
            };
        }
        if self.state.is_executing {
            return ExecuteAck {
                success: false,
                message: BUSY_MESSAGE.to_string(),
            };
        }

        trigger.last_run_at = Some(Utc::now());
        let payload = trigger.payload.clone();
        let conversation_id = self.conversation_id.clone().unwrap_or_default();
        self.checkpoint();
        self.dispatch(payload, conversation_id, None);
        ExecuteAck {
            success: true,
            message: STARTED_MESSAGE.to_string(),
        }
    }

    /// Flip the gate, checkpoint `running`, and detach the actual work. The
    /// synchronous caller gets its ack without waiting for the run to drain.
    fn dispatch(&mut self, description: String, conversation_id: String, reminder_id: Option<String>) {
        self.state.is_executing = true;
        self.state.status = TaskStatus::Running;
        self.state.task_description = Some(description.clone());
        self.state.result = None;
        self.checkpoint();

        let tools = AgentTools::new(
            self.deps.store.clone(),
            self.deps.timers.clone(),
            self.deps.limits.clone(),
            self.key.clone(),
            self.state.agent_id.clone(),
            conversation_id.clone(),
            self.reminder_fire(),
        );
        let runner = Arc::clone(&self.deps.runner);
        let store = self.deps.store.clone();
        let self_tx = self.self_tx.clone();
        let agent_id = self.state.agent_id.clone();

        self.deps.tracker.spawn(async move {
            let outcome = runner.run(&description, tools).await;
            let (success, output) = match outcome {
                Ok(out) => {
                    tracing::info!(
                        agent_id = %agent_id,
                        steps = out.steps,
                        input_tokens = out.usage.input_tokens,
                        output_tokens = out.usage.output_tokens,
                        "task completed"
                    );
                    (true, out.text)
                }
                Err(error) => {
                    tracing::error!(agent_id = %agent_id, %error, "task failed");
                    (false, error.to_string())
                }
            };

            let _ = self_tx
                .send(AgentMsg::TaskFinished {
                    success,
                    output: output.clone(),
                    conversation_id,
                })
                .await;

            // Independent of the actor's own status field; may land before
            // or after the flag clear.
            if let Some(rid) = reminder_id {
                let error = (!success).then_some(output.as_str());
                if let Err(store_error) = store.complete_reminder(&rid, success, error) {
                    tracing::warn!(reminder_id = %rid, %store_error, "failed to record reminder completion");
                }
            }
        });
    }

    fn task_finished(&mut self, success: bool, output: String, conversation_id: String) {
        self.state.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.state.result = Some(output.clone());
        self.checkpoint();
        self.state.is_executing = false;

        let report = CompletionReport {
            agent_id: self.state.agent_id.clone(),
            conversation_id,
            success,
            result: success.then(|| output.clone()),
            error: (!success).then_some(output),
        };
        let notifier = Arc::clone(&self.deps.notifier);
        self.deps.tracker.spawn(async move {
            // Best-effort: never retried, never escalated into the actor.
            if let Err(error) = notifier.deliver(&report).await {
                tracing::warn!(%error, "completion notification failed");
            }
        });
    }

    // ── Reminders ─────────────────────────────────────────────

    fn process_reminder(&mut self, reminder_id: &str) {
        let row = match self.deps.store.find_reminder(reminder_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::warn!(reminder_id, "reminder fired but row is missing");
                return;
            }
            Err(error) => {
                tracing::warn!(reminder_id, %error, "failed to load fired reminder");
                return;
            }
        };

        if row.status != ReminderStatus::Pending {
            tracing::warn!(reminder_id, status = %row.status, "skipping reminder fire");
            return;
        }

        let now = Utc::now();
        match self.deps.store.mark_processing(reminder_id, now) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(reminder_id, "reminder no longer pending, skipping fire");
                return;
            }
            Err(error) => {
                tracing::warn!(reminder_id, %error, "failed to mark reminder processing");
                return;
            }
        }

        if self.state.is_executing {
            let backoff_secs = reschedule_backoff_secs(row.retry_count);
            let handle = self.register_reminder_timer(reminder_id, Duration::from_secs(backoff_secs));
            let next = now + ChronoDuration::seconds(i64::try_from(backoff_secs).unwrap_or(3_600));
            if let Err(error) =
                self.deps
                    .store
                    .reschedule_pending(reminder_id, next, row.retry_count + 1, &handle)
            {
                tracing::warn!(reminder_id, %error, "failed to persist reminder reschedule");
            }
            tracing::info!(
                reminder_id,
                backoff_secs,
                retry_count = row.retry_count + 1,
                "agent busy, reminder rescheduled"
            );
            return;
        }

        self.conversation_id = Some(row.conversation_id.clone());
        let mut description = format!("{REMINDER_PREFIX} {}", row.task_description);
        if let Some(context) = &row.context {
            description.push_str("\n\nContext: ");
            description.push_str(context);
        }
        self.dispatch(description, row.conversation_id, Some(row.id));
    }

    fn register_reminder_timer(&self, reminder_id: &str, delay: Duration) -> String {
        let tx = self.self_tx.clone();
        let reminder_id = reminder_id.to_string();
        self.deps.timers.register(delay, async move {
            if tx
                .send(AgentMsg::ProcessReminder { reminder_id })
                .await
                .is_err()
            {
                tracing::warn!("execution agent mailbox closed before reminder fire");
            }
        })
    }

    fn reminder_fire(&self) -> ReminderFire {
        let tx = self.self_tx.clone();
        Arc::new(move |reminder_id| {
            let tx = tx.clone();
            Box::pin(async move {
                if tx
                    .send(AgentMsg::ProcessReminder { reminder_id })
                    .await
                    .is_err()
                {
                    tracing::warn!("execution agent mailbox closed before reminder fire");
                }
            })
        })
    }

    // ── Triggers ──────────────────────────────────────────────

    fn create_trigger(
        &mut self,
        payload: String,
        start_time: DateTime<Utc>,
        rrule: Option<String>,
    ) -> Trigger {
        let trigger = Trigger {
            id: Uuid::new_v4().to_string(),
            agent_id: self.state.agent_id.clone(),
            payload,
            start_time,
            rrule,
            status: TriggerStatus::Active,
            created_at: Utc::now(),
            last_run_at: None,
        };
        self.state.triggers.push(trigger.clone());
        self.checkpoint();
        tracing::info!(agent_id = %self.state.agent_id, trigger_id = %trigger.id, "trigger created");
        trigger
    }

    fn update_trigger(&mut self, id: &str, patch: TriggerPatch) -> TriggerReply {
        let Some(trigger) = self.state.triggers.iter_mut().find(|t| t.id == id) else {
            return TriggerReply {
                success: false,
                trigger: None,
                error: Some("Trigger not found".to_string()),
            };
        };

        if let Some(status) = patch.status {
            trigger.status = status;
        }
        if let Some(start_time) = patch.start_time {
            trigger.start_time = start_time;
        }
        if let Some(rrule) = patch.rrule {
            trigger.rrule = Some(rrule);
        }

        let updated = trigger.clone();
        self.checkpoint();
        TriggerReply {
            success: true,
            trigger: Some(updated),
            error: None,
        }
    }

    // ── Persistence ───────────────────────────────────────────

    fn checkpoint(&self) {
        let triggers_json =
            serde_json::to_string(&self.state.triggers).unwrap_or_else(|_| "[]".to_string());
        let row = AgentRow {
            agent_id: self.state.agent_id.clone(),
            task_description: self.state.task_description.clone(),
            status: self.state.status.as_str().to_string(),
            result: self.state.result.clone(),
            triggers_json,
            updated_at: Utc::now(),
        };
        if let Err(error) = self.deps.store.save_agent(&row) {
            tracing::warn!(agent_id = %self.state.agent_id, %error, "failed to checkpoint agent state");
        }
    }
}

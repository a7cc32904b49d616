//! Tool-exposed reminder callbacks.
//!
//! The reasoning loop consumes these as schedule/cancel/list capabilities.
//! Rejections are structured values, never errors: the loop relays them as
//! tool results.

use crate::config::ReminderConfig;
use crate::reminders::{NewReminder, Reminder, ReminderStatus, Store, TimerService};
use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Callback that delivers `process_reminder(id)` into the owning actor's
/// mailbox when a timer fires.
pub type ReminderFire =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ToolReply {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ScheduleAck {
    pub success: bool,
    pub message: String,
    pub reminder_id: Option<String>,
}

#[derive(Clone)]
pub struct AgentTools {
    store: Store,
    timers: TimerService,
    limits: ReminderConfig,
    agent_key: String,
    agent_id: String,
    conversation_id: String,
    fire: ReminderFire,
}

impl AgentTools {
    pub fn new(
        store: Store,
        timers: TimerService,
        limits: ReminderConfig,
        agent_key: String,
        agent_id: String,
        conversation_id: String,
        fire: ReminderFire,
    ) -> Self {
        Self {
            store,
            timers,
            limits,
            agent_key,
            agent_id,
            conversation_id,
            fire,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Persist a reminder and arm its platform timer.
    ///
    /// Two writes make a fully scheduled reminder: the insert and the handle
    /// write-back. When the write-back fails the timer stays armed and the row
    /// stays pending with no handle. It will still fire, but it cannot be
    /// cancelled cleanly.
    pub fn schedule_reminder(
        &self,
        delay_secs: u64,
        task: &str,
        context: Option<&str>,
    ) -> ScheduleAck {
        if delay_secs < self.limits.min_delay_secs || delay_secs > self.limits.max_delay_secs {
            return ScheduleAck {
                success: false,
                message: format!(
                    "Reminder delay must be between {} and {} seconds, got {}",
                    self.limits.min_delay_secs, self.limits.max_delay_secs, delay_secs
                ),
                reminder_id: None,
            };
        }

        match self.store.count_pending(&self.agent_id) {
            Ok(count) if count >= self.limits.max_pending => {
                return ScheduleAck {
                    success: false,
                    message: format!(
                        "Agent already has {count} pending reminders (limit {})",
                        self.limits.max_pending
                    ),
                    reminder_id: None,
                };
            }
            Ok(_) => {}
            Err(error) => {
                return ScheduleAck {
                    success: false,
                    message: format!("Failed to count pending reminders: {error}"),
                    reminder_id: None,
                };
            }
        }

        let delay_signed = i64::try_from(delay_secs).unwrap_or(i64::MAX);
        let scheduled_at = Utc::now() + ChronoDuration::seconds(delay_signed);
        let reminder = match self.store.insert_reminder(NewReminder {
            agent_key: self.agent_key.clone(),
            agent_id: self.agent_id.clone(),
            conversation_id: self.conversation_id.clone(),
            task_description: task.to_string(),
            context: context.map(str::to_string),
            scheduled_at,
        }) {
            Ok(reminder) => reminder,
            Err(error) => {
                return ScheduleAck {
                    success: false,
                    message: format!("Failed to persist reminder: {error}"),
                    reminder_id: None,
                };
            }
        };

        let handle = self.register_fire_timer(&reminder.id, Duration::from_secs(delay_secs));

        if let Err(error) = self.store.set_schedule_handle(&reminder.id, &handle) {
            tracing::warn!(
                reminder_id = %reminder.id,
                %error,
                "reminder timer armed but handle write-back failed; row cannot be cancelled cleanly"
            );
            return ScheduleAck {
                success: false,
                message: format!("Reminder scheduled but recording the timer handle failed: {error}"),
                reminder_id: Some(reminder.id),
            };
        }

        tracing::info!(
            reminder_id = %reminder.id,
            agent_id = %self.agent_id,
            delay_secs,
            "reminder scheduled"
        );
        ScheduleAck {
            success: true,
            message: format!(
                "Reminder {} scheduled for {}",
                reminder.id,
                scheduled_at.to_rfc3339()
            ),
            reminder_id: Some(reminder.id),
        }
    }

    /// Cancel a pending reminder. Any other status is a descriptive failure
    /// with no mutation.
    pub fn cancel_reminder(&self, reminder_id: &str) -> ToolReply {
        let row = match self.store.find_reminder(reminder_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                return ToolReply {
                    success: false,
                    message: "Reminder not found".to_string(),
                };
            }
            Err(error) => {
                return ToolReply {
                    success: false,
                    message: format!("Failed to load reminder: {error}"),
                };
            }
        };

        if row.status != ReminderStatus::Pending {
            return ToolReply {
                success: false,
                message: format!("Cannot cancel reminder with status: {}", row.status),
            };
        }

        // Best-effort: the handle may be stale after a restart or a failed
        // write-back; the status guard in process_reminder covers a live timer
        // we could not find.
        if let Some(handle) = row.schedule_handle.as_deref() {
            if !self.timers.cancel(handle) {
                tracing::debug!(reminder_id, handle, "no live timer for cancelled reminder");
            }
        }

        match self.store.cancel_pending(reminder_id) {
            Ok(true) => ToolReply {
                success: true,
                message: "Reminder cancelled".to_string(),
            },
            Ok(false) => {
                let status = self
                    .store
                    .find_reminder(reminder_id)
                    .ok()
                    .flatten()
                    .map_or_else(|| "unknown".to_string(), |r| r.status.to_string());
                ToolReply {
                    success: false,
                    message: format!("Cannot cancel reminder with status: {status}"),
                }
            }
            Err(error) => ToolReply {
                success: false,
                message: format!("Failed to cancel reminder: {error}"),
            },
        }
    }

    pub fn list_reminders(&self) -> anyhow::Result<Vec<Reminder>> {
        self.store.pending_reminders(&self.agent_id)
    }

    /// Arm a timer that re-enters the owning actor with `process_reminder`.
    pub fn register_fire_timer(&self, reminder_id: &str, delay: Duration) -> String {
        let fire = Arc::clone(&self.fire);
        let id = reminder_id.to_string();
        self.timers.register(delay, async move {
            fire(id).await;
        })
    }
}

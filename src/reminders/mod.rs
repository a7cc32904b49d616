//! Durable state: agent checkpoints, reminder rows, and debounce buffers.
//!
//! The relational row is the source of truth for cross-restart recovery; the
//! in-actor state is the fast path. All writes are single-row keyed updates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use uuid::Uuid;

pub mod timers;
pub mod tools;

pub use timers::TimerService;
pub use tools::{AgentTools, ReminderFire, ScheduleAck, ToolReply};

// ── Reminder rows ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ReminderStatus {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => anyhow::bail!("Unknown reminder status '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: String,
    /// Key of the execution actor that owns this reminder.
    pub agent_key: String,
    /// Platform timer handle, written back after registration. May be absent
    /// when the write-back failed or the process restarted since.
    pub schedule_handle: Option<String>,
    pub agent_id: String,
    pub conversation_id: String,
    pub task_description: String,
    pub context: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: ReminderStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Fields the caller supplies when persisting a new reminder.
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub agent_key: String,
    pub agent_id: String,
    pub conversation_id: String,
    pub task_description: String,
    pub context: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

// ── Agent checkpoint rows ─────────────────────────────────────────

/// Durable checkpoint of an execution actor. `triggers_json` is the actor's
/// trigger list serialized as JSON; the actor reloads it on spawn.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub agent_id: String,
    pub task_description: Option<String>,
    pub status: String,
    pub result: Option<String>,
    pub triggers_json: String,
    pub updated_at: DateTime<Utc>,
}

// ── Store ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    pub fn open(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open state DB: {}", self.db_path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id         TEXT PRIMARY KEY,
                task_description TEXT,
                status           TEXT NOT NULL DEFAULT 'pending',
                result           TEXT,
                triggers         TEXT NOT NULL DEFAULT '[]',
                updated_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reminders (
                id               TEXT PRIMARY KEY,
                agent_key        TEXT NOT NULL,
                schedule_handle  TEXT,
                agent_id         TEXT NOT NULL,
                conversation_id  TEXT NOT NULL,
                task_description TEXT NOT NULL,
                context          TEXT,
                scheduled_at     TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'pending',
                created_at       TEXT NOT NULL,
                processed_at     TEXT,
                completed_at     TEXT,
                error_message    TEXT,
                retry_count      INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_reminders_agent_status
                ON reminders(agent_id, status);
            CREATE TABLE IF NOT EXISTS debounce_events (
                conversation_key TEXT NOT NULL,
                payload          TEXT NOT NULL,
                created_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_debounce_events_key
                ON debounce_events(conversation_key);",
        )
        .context("Failed to initialize state schema")?;

        f(&conn)
    }

    // ── Reminders ─────────────────────────────────────────────

    pub fn insert_reminder(&self, new: NewReminder) -> Result<Reminder> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO reminders
                    (id, agent_key, agent_id, conversation_id, task_description, context,
                     scheduled_at, status, created_at, retry_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, 0)",
                params![
                    id,
                    new.agent_key,
                    new.agent_id,
                    new.conversation_id,
                    new.task_description,
                    new.context,
                    new.scheduled_at.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )
            .context("Failed to insert reminder")?;
            Ok(())
        })?;

        Ok(Reminder {
            id,
            agent_key: new.agent_key,
            schedule_handle: None,
            agent_id: new.agent_id,
            conversation_id: new.conversation_id,
            task_description: new.task_description,
            context: new.context,
            scheduled_at: new.scheduled_at,
            status: ReminderStatus::Pending,
            created_at: now,
            processed_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
        })
    }

    /// Write the platform timer handle back onto a reminder. Scheduling is
    /// complete only once this succeeds.
    pub fn set_schedule_handle(&self, id: &str, handle: &str) -> Result<()> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE reminders SET schedule_handle = ?1 WHERE id = ?2",
                params![handle, id],
            )
            .context("Failed to store reminder schedule handle")
        })?;
        if changed == 0 {
            anyhow::bail!("Reminder '{id}' not found");
        }
        Ok(())
    }

    pub fn find_reminder(&self, id: &str) -> Result<Option<Reminder>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"
            ))?;
            let found = stmt.query_row(params![id], reminder_from_row);
            match found {
                Ok(row) => Ok(Some(row?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Transition `pending → processing`, stamping `processed_at`. Returns
    /// false when the row is missing or no longer pending (double-fire or
    /// prior cancellation).
    pub fn mark_processing(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE reminders SET status = 'processing', processed_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![at.to_rfc3339(), id],
            )
            .context("Failed to mark reminder processing")
        })?;
        Ok(changed > 0)
    }

    /// Put a reminder back to `pending` after a busy-actor reschedule.
    pub fn reschedule_pending(
        &self,
        id: &str,
        scheduled_at: DateTime<Utc>,
        retry_count: u32,
        handle: &str,
    ) -> Result<()> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE reminders
                 SET status = 'pending', retry_count = ?1, scheduled_at = ?2,
                     schedule_handle = ?3
                 WHERE id = ?4",
                params![retry_count, scheduled_at.to_rfc3339(), handle, id],
            )
            .context("Failed to reschedule reminder")
        })?;
        if changed == 0 {
            anyhow::bail!("Reminder '{id}' not found");
        }
        Ok(())
    }

    /// Terminal transition after the dispatched task finished.
    pub fn complete_reminder(&self, id: &str, success: bool, error: Option<&str>) -> Result<()> {
        let status = if success {
            ReminderStatus::Completed
        } else {
            ReminderStatus::Failed
        };
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE reminders
                 SET status = ?1, completed_at = ?2, error_message = ?3
                 WHERE id = ?4",
                params![status.as_str(), Utc::now().to_rfc3339(), error, id],
            )
            .context("Failed to record reminder completion")
        })?;
        if changed == 0 {
            anyhow::bail!("Reminder '{id}' not found");
        }
        Ok(())
    }

    /// Transition `pending → cancelled`. Returns false when the row is not
    /// pending; the caller reports the current status without mutation.
    pub fn cancel_pending(&self, id: &str) -> Result<bool> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE reminders SET status = 'cancelled'
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .context("Failed to cancel reminder")
        })?;
        Ok(changed > 0)
    }

    pub fn pending_reminders(&self, agent_id: &str) -> Result<Vec<Reminder>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders
                 WHERE agent_id = ?1 AND status = 'pending'
                 ORDER BY scheduled_at ASC"
            ))?;
            collect_reminders(stmt.query_map(params![agent_id], reminder_from_row)?)
        })
    }

    pub fn count_pending(&self, agent_id: &str) -> Result<usize> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT COUNT(*) FROM reminders WHERE agent_id = ?1 AND status = 'pending'",
            )?;
            let count: usize = stmt.query_row(params![agent_id], |row| row.get(0))?;
            Ok(count)
        })
    }

    /// Every pending reminder, across agents. Used for startup recovery and
    /// the maintenance CLI.
    pub fn all_pending(&self) -> Result<Vec<Reminder>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders
                 WHERE status = 'pending' ORDER BY scheduled_at ASC"
            ))?;
            collect_reminders(stmt.query_map([], reminder_from_row)?)
        })
    }

    pub fn list_reminders(&self) -> Result<Vec<Reminder>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders ORDER BY created_at ASC"
            ))?;
            collect_reminders(stmt.query_map([], reminder_from_row)?)
        })
    }

    // ── Agent checkpoints ─────────────────────────────────────

    pub fn load_agent(&self, agent_id: &str) -> Result<Option<AgentRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, task_description, status, result, triggers, updated_at
                 FROM agents WHERE agent_id = ?1",
            )?;
            let found = stmt.query_row(params![agent_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            });
            match found {
                Ok((agent_id, task_description, status, result, triggers_json, updated_raw)) => {
                    Ok(Some(AgentRow {
                        agent_id,
                        task_description,
                        status,
                        result,
                        triggers_json,
                        updated_at: parse_rfc3339(&updated_raw)?,
                    }))
                }
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn save_agent(&self, row: &AgentRow) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO agents (agent_id, task_description, status, result, triggers, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     task_description = excluded.task_description,
                     status           = excluded.status,
                     result           = excluded.result,
                     triggers         = excluded.triggers,
                     updated_at       = excluded.updated_at",
                params![
                    row.agent_id,
                    row.task_description,
                    row.status,
                    row.result,
                    row.triggers_json,
                    row.updated_at.to_rfc3339()
                ],
            )
            .context("Failed to checkpoint agent state")?;
            Ok(())
        })
    }

    // ── Debounce buffers ──────────────────────────────────────

    pub fn append_debounce_event(&self, conversation_key: &str, payload: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO debounce_events (conversation_key, payload, created_at)
                 VALUES (?1, ?2, ?3)",
                params![conversation_key, payload, Utc::now().to_rfc3339()],
            )
            .context("Failed to persist buffered event")?;
            Ok(())
        })
    }

    /// Buffered payloads for a key, in insertion order.
    pub fn load_debounce_events(&self, conversation_key: &str) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM debounce_events
                 WHERE conversation_key = ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![conversation_key], |row| row.get::<_, String>(0))?;
            let mut payloads = Vec::new();
            for row in rows {
                payloads.push(row?);
            }
            Ok(payloads)
        })
    }

    pub fn clear_debounce_events(&self, conversation_key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM debounce_events WHERE conversation_key = ?1",
                params![conversation_key],
            )
            .context("Failed to clear buffered events")?;
            Ok(())
        })
    }
}

const REMINDER_COLUMNS: &str = "id, agent_key, schedule_handle, agent_id, conversation_id, \
     task_description, context, scheduled_at, status, created_at, processed_at, completed_at, \
     error_message, retry_count";

type ReminderTuple = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    u32,
);

fn reminder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Reminder>> {
    let tuple: ReminderTuple = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    );
    Ok(reminder_from_tuple(tuple))
}

fn reminder_from_tuple(tuple: ReminderTuple) -> Result<Reminder> {
    let (
        id,
        agent_key,
        schedule_handle,
        agent_id,
        conversation_id,
        task_description,
        context,
        scheduled_raw,
        status_raw,
        created_raw,
        processed_raw,
        completed_raw,
        error_message,
        retry_count,
    ) = tuple;
    Ok(Reminder {
        id,
        agent_key,
        schedule_handle,
        agent_id,
        conversation_id,
        task_description,
        context,
        scheduled_at: parse_rfc3339(&scheduled_raw)?,
        status: ReminderStatus::try_from(status_raw.as_str())?,
        created_at: parse_rfc3339(&created_raw)?,
        processed_at: parse_optional_rfc3339(processed_raw)?,
        completed_at: parse_optional_rfc3339(completed_raw)?,
        error_message,
        retry_count,
    })
}

fn collect_reminders(
    rows: impl Iterator<Item = rusqlite::Result<Result<Reminder>>>,
) -> Result<Vec<Reminder>> {
    let mut reminders = Vec::new();
    for row in rows {
        reminders.push(row??);
    }
    Ok(reminders)
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in state DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_optional_rfc3339(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        Some(raw) => Ok(Some(parse_rfc3339(&raw)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn test_store(tmp: &TempDir) -> Store {
        Store::open(tmp.path().join("state").join("burrow.db"))
    }

    fn new_reminder(agent_id: &str, delay_secs: i64) -> NewReminder {
        NewReminder {
            agent_key: format!("exec:{agent_id}"),
            agent_id: agent_id.to_string(),
            conversation_id: "conv-1".to_string(),
            task_description: "water the plants".to_string(),
            context: None,
            scheduled_at: Utc::now() + ChronoDuration::seconds(delay_secs),
        }
    }

    #[test]
    fn insert_find_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let reminder = store.insert_reminder(new_reminder("agent-1", 120)).unwrap();
        let found = store.find_reminder(&reminder.id).unwrap().unwrap();

        assert_eq!(found.agent_id, "agent-1");
        assert_eq!(found.status, ReminderStatus::Pending);
        assert_eq!(found.retry_count, 0);
        assert!(found.schedule_handle.is_none());
    }

    #[test]
    fn find_unknown_returns_none() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        assert!(store.find_reminder("nope").unwrap().is_none());
    }

    #[test]
    fn mark_processing_only_transitions_pending_rows() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let reminder = store.insert_reminder(new_reminder("agent-1", 120)).unwrap();

        assert!(store.mark_processing(&reminder.id, Utc::now()).unwrap());
        // Second fire must be rejected by the status guard.
        assert!(!store.mark_processing(&reminder.id, Utc::now()).unwrap());

        let row = store.find_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(row.status, ReminderStatus::Processing);
        assert!(row.processed_at.is_some());
    }

    #[test]
    fn cancel_pending_is_guarded_by_status() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let reminder = store.insert_reminder(new_reminder("agent-1", 120)).unwrap();

        assert!(store.cancel_pending(&reminder.id).unwrap());
        assert!(!store.cancel_pending(&reminder.id).unwrap());

        let row = store.find_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(row.status, ReminderStatus::Cancelled);
    }

    #[test]
    fn reschedule_updates_retry_count_and_handle() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let reminder = store.insert_reminder(new_reminder("agent-1", 120)).unwrap();
        store.mark_processing(&reminder.id, Utc::now()).unwrap();

        let next = Utc::now() + ChronoDuration::seconds(60);
        store
            .reschedule_pending(&reminder.id, next, 1, "timer-2")
            .unwrap();

        let row = store.find_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(row.status, ReminderStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.schedule_handle.as_deref(), Some("timer-2"));
    }

    #[test]
    fn complete_reminder_records_error_message_on_failure() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let reminder = store.insert_reminder(new_reminder("agent-1", 120)).unwrap();

        store
            .complete_reminder(&reminder.id, false, Some("upstream timeout"))
            .unwrap();

        let row = store.find_reminder(&reminder.id).unwrap().unwrap();
        assert_eq!(row.status, ReminderStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("upstream timeout"));
        assert!(row.completed_at.is_some());
    }

    #[test]
    fn pending_queries_filter_by_agent_and_status() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let a = store.insert_reminder(new_reminder("agent-a", 60)).unwrap();
        let _b = store.insert_reminder(new_reminder("agent-b", 60)).unwrap();
        let done = store.insert_reminder(new_reminder("agent-a", 90)).unwrap();
        store.complete_reminder(&done.id, true, None).unwrap();

        let pending = store.pending_reminders("agent-a").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
        assert_eq!(store.count_pending("agent-a").unwrap(), 1);
        assert_eq!(store.all_pending().unwrap().len(), 2);
    }

    #[test]
    fn agent_checkpoint_upserts() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        let mut row = AgentRow {
            agent_id: "agent-1".to_string(),
            task_description: Some("compile the report".to_string()),
            status: "running".to_string(),
            result: None,
            triggers_json: "[]".to_string(),
            updated_at: Utc::now(),
        };
        store.save_agent(&row).unwrap();

        row.status = "completed".to_string();
        row.result = Some("report sent".to_string());
        store.save_agent(&row).unwrap();

        let loaded = store.load_agent("agent-1").unwrap().unwrap();
        assert_eq!(loaded.status, "completed");
        assert_eq!(loaded.result.as_deref(), Some("report sent"));
    }

    #[test]
    fn debounce_events_preserve_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);

        store.append_debounce_event("conv-1", "one").unwrap();
        store.append_debounce_event("conv-1", "two").unwrap();
        store.append_debounce_event("conv-2", "other").unwrap();

        assert_eq!(store.load_debounce_events("conv-1").unwrap(), ["one", "two"]);

        store.clear_debounce_events("conv-1").unwrap();
        assert!(store.load_debounce_events("conv-1").unwrap().is_empty());
        assert_eq!(store.load_debounce_events("conv-2").unwrap(), ["other"]);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!(
                "Invalid task status '{}'. Expected one of: 'pending', 'running', 'completed', 'failed'",
                value
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    #[default]
    Active,
    Paused,
}

impl TriggerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled future or recurring task descriptor owned by one execution
/// agent. Never physically deleted; cancellation is a status transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trigger {
    pub id: String,
    pub agent_id: String,
    pub payload: String,
    pub start_time: DateTime<Utc>,
    /// Opaque recurrence expression (RFC 5545 RRULE). Stored and returned,
    /// never evaluated here.
    #[serde(default)]
    pub rrule: Option<String>,
    pub status: TriggerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Partial trigger update. Absent fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct TriggerPatch {
    pub status: Option<TriggerStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub rrule: Option<String>,
}

/// Full observable state of an execution agent.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub agent_id: String,
    pub task_description: Option<String>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub triggers: Vec<Trigger>,
    /// The sole concurrency gate: true for the entire span of a dispatched
    /// run, including terminal persistence.
    pub is_executing: bool,
}

impl ExecutionState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_description: None,
            status: TaskStatus::Pending,
            result: None,
            triggers: Vec::new(),
            is_executing: false,
        }
    }
}

/// Synchronous admission response for task dispatch.
#[derive(Debug, Clone)]
pub struct ExecuteAck {
    pub success: bool,
    pub message: String,
}

/// Response shape for trigger lookups and updates.
#[derive(Debug, Clone)]
pub struct TriggerReply {
    pub success: bool,
    pub trigger: Option<Trigger>,
    pub error: Option<String>,
}

/// Input for a direct task execution request.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub description: String,
    pub conversation_id: String,
    pub context: Option<String>,
}

/// Delay before a reminder that fired against a busy agent is retried:
/// exponential from one minute, saturating at one hour.
pub fn reschedule_backoff_secs(retry_count: u32) -> u64 {
    60u64
        .saturating_mul(2u64.saturating_pow(retry_count.min(32)))
        .min(3_600)
}

//! Per-agent single-flight task execution.

pub mod actor;
pub mod types;

pub use actor::{AgentDeps, AgentHandle, AgentMsg, AgentRegistry};
pub use types::{
    ExecuteAck, ExecutionState, TaskInput, TaskStatus, Trigger, TriggerPatch, TriggerReply,
    TriggerStatus, reschedule_backoff_secs,
};

//! External collaborator seams.
//!
//! The reasoning loop, the completion notifier, and the outbound messaging
//! channel are consumed behind traits: the core treats them as opaque,
//! possibly slow, possibly failing calls.

use crate::reminders::AgentTools;
use async_trait::async_trait;

/// Token accounting reported by a reasoning-loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Final output of one reasoning-loop run.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub text: String,
    pub usage: TokenUsage,
    pub steps: u32,
}

/// Completion payload delivered back to an agent's parent conversation.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub agent_id: String,
    pub conversation_id: String,
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Opaque "run agentic task, get text + usage back" function.
///
/// Failures propagate as task failure; the caller persists them and reports
/// through the [`CompletionNotifier`].
#[async_trait]
pub trait ReasoningLoop: Send + Sync {
    async fn run(&self, task: &str, tools: AgentTools) -> anyhow::Result<LoopOutcome>;
}

/// Best-effort completion delivery to the parent. Never retried; a failed
/// delivery is logged and swallowed by the caller.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn deliver(&self, report: &CompletionReport) -> anyhow::Result<()>;
}

/// Outbound messaging channel: send text, get the platform message id back.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, conversation_id: &str, text: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoOutbound;

    #[async_trait]
    impl Outbound for EchoOutbound {
        async fn send(&self, conversation_id: &str, _text: &str) -> anyhow::Result<String> {
            Ok(format!("{conversation_id}:msg-1"))
        }
    }

    #[tokio::test]
    async fn outbound_returns_a_message_id() {
        let outbound = EchoOutbound;
        let id = outbound.send("telegram:42", "hello").await.unwrap();
        assert_eq!(id, "telegram:42:msg-1");
    }

    #[test]
    fn completion_report_carries_either_result_or_error() {
        let ok = CompletionReport {
            agent_id: "agent-1".into(),
            conversation_id: "conv-1".into(),
            success: true,
            result: Some("done".into()),
            error: None,
        };
        assert!(ok.success);
        assert_eq!(ok.result.as_deref(), Some("done"));
        assert!(ok.error.is_none());
    }
}

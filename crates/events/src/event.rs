use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_domain::ContentBlock;
use relay_llm::Usage;

/// One option of a multiple-choice user prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOption {
    pub id: String,
    pub label: String,
}

impl ConfirmOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Persistence status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Processing,
    Completed,
    Failed,
}

/// The event vocabulary between the executor and the broadcaster.
///
/// Transports (SSE, WebSocket, channel bots) consume these after the
/// broadcaster wraps them in a [`super::SequencedEvent`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExecEvent {
    // ── Message lifecycle ─────────────────────────────────────────
    MessageStart {
        message_id: String,
    },
    MessageDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop {},

    // ── Content blocks ────────────────────────────────────────────
    ContentStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentDelta {
        index: usize,
        delta: String,
    },
    ContentStop {
        index: usize,
    },

    // ── Semantic duplicates convenient for transports ─────────────
    ThinkingDelta {
        text: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    InputDelta {
        fragment: String,
    },

    // ── User prompts (suspension points) ──────────────────────────
    HitlConfirm {
        reason: String,
        tools: Vec<String>,
        message: String,
    },
    LongRunningConfirm {
        turn: u32,
        message: String,
    },
    BacktrackExhaustedConfirm {
        turn: u32,
        total_backtracks: u32,
        message: String,
        options: Vec<ConfirmOption>,
    },
    IntentClarifyRequest {
        message: String,
        context: String,
    },
    CostLimitConfirm {
        turn: u32,
        current_cost: String,
        message: String,
        options: Vec<ConfirmOption>,
    },
    CostUrgentConfirm {
        turn: u32,
        current_cost: String,
        message: String,
        options: Vec<ConfirmOption>,
    },
    CostWarn {
        turn: u32,
        current_cost: String,
        message: String,
    },

    // ── Rollback ──────────────────────────────────────────────────
    RollbackOptions {
        task_id: String,
        options: Vec<Value>,
        reason: String,
    },
    RollbackCompleted {
        task_id: String,
        messages: Vec<String>,
    },

    // ── Backtracking ──────────────────────────────────────────────
    Backtrack {
        backtrack_type: String,
        attempt: String,
        reason: String,
    },
    BacktrackExhausted {
        decision: String,
        total_attempts: u32,
        failed_tools: Vec<String>,
        last_error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        escalation: Option<String>,
    },

    // ── Diagnostics ───────────────────────────────────────────────
    Warning {
        message: String,
    },
    Error {
        message: String,
        #[serde(default)]
        recoverable: bool,
    },
}

impl ExecEvent {
    /// The wire name of this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ExecEvent::MessageStart { .. } => "message_start",
            ExecEvent::MessageDelta { .. } => "message_delta",
            ExecEvent::MessageStop {} => "message_stop",
            ExecEvent::ContentStart { .. } => "content_start",
            ExecEvent::ContentDelta { .. } => "content_delta",
            ExecEvent::ContentStop { .. } => "content_stop",
            ExecEvent::ThinkingDelta { .. } => "thinking_delta",
            ExecEvent::ToolUseStart { .. } => "tool_use_start",
            ExecEvent::InputDelta { .. } => "input_delta",
            ExecEvent::HitlConfirm { .. } => "hitl_confirm",
            ExecEvent::LongRunningConfirm { .. } => "long_running_confirm",
            ExecEvent::BacktrackExhaustedConfirm { .. } => "backtrack_exhausted_confirm",
            ExecEvent::IntentClarifyRequest { .. } => "intent_clarify_request",
            ExecEvent::CostLimitConfirm { .. } => "cost_limit_confirm",
            ExecEvent::CostUrgentConfirm { .. } => "cost_urgent_confirm",
            ExecEvent::CostWarn { .. } => "cost_warn",
            ExecEvent::RollbackOptions { .. } => "rollback_options",
            ExecEvent::RollbackCompleted { .. } => "rollback_completed",
            ExecEvent::Backtrack { .. } => "backtrack",
            ExecEvent::BacktrackExhausted { .. } => "backtrack_exhausted",
            ExecEvent::Warning { .. } => "warning",
            ExecEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_and_data() {
        let event = ExecEvent::ContentDelta {
            index: 3,
            delta: "hi".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "content_delta");
        assert_eq!(v["data"]["index"], 3);
        assert_eq!(v["data"]["delta"], "hi");
    }

    #[test]
    fn type_name_matches_serde_tag() {
        let events = vec![
            ExecEvent::MessageStop {},
            ExecEvent::HitlConfirm {
                reason: "hitl_confirm:delete_file".into(),
                tools: vec!["delete_file".into()],
                message: "confirm".into(),
            },
            ExecEvent::Backtrack {
                backtrack_type: "tool_replace".into(),
                attempt: "1/3".into(),
                reason: "".into(),
            },
        ];
        for event in events {
            let v = serde_json::to_value(&event).unwrap();
            assert_eq!(v["type"], event.type_name());
        }
    }

    #[test]
    fn error_round_trips() {
        let event = ExecEvent::Error {
            message: "connection interrupted, please retry".into(),
            recoverable: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ExecEvent = serde_json::from_str(&json).unwrap();
        match back {
            ExecEvent::Error {
                message,
                recoverable,
            } => {
                assert!(recoverable);
                assert!(message.contains("interrupted"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

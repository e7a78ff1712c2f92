use serde::{Deserialize, Serialize};

/// Structured cause of session termination, surfaced in events and
/// recorded on the runtime context for later analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    // Normal completion
    Completed,
    AgentDecision,

    // User triggered
    UserStop,
    UserAbort,

    // Safety nets
    MaxTurns,
    MaxDuration,
    IdleTimeout,
    CostLimit,

    // Error recovery
    ConsecutiveFailures,
    BacktrackExhausted,

    // Interaction
    HitlConfirm,
    LongRunningConfirm,
    IntentClarify,
}

/// What the executor should do after a termination decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationAction {
    Stop,
    AskUser,
    RollbackOptions,
}

/// Result of one terminator evaluation. `should_stop = false` with
/// `action = AskUser` means "suspend and ask", not "keep looping".
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationDecision {
    pub should_stop: bool,
    pub reason: String,
    pub finish_reason: Option<FinishReason>,
    pub action: TerminationAction,
}

impl TerminationDecision {
    pub fn continue_running() -> Self {
        Self {
            should_stop: false,
            reason: String::new(),
            finish_reason: None,
            action: TerminationAction::Stop,
        }
    }

    pub fn stop(reason: impl Into<String>, finish: FinishReason) -> Self {
        Self {
            should_stop: true,
            reason: reason.into(),
            finish_reason: Some(finish),
            action: TerminationAction::Stop,
        }
    }

    pub fn ask_user(reason: impl Into<String>, finish: FinishReason) -> Self {
        Self {
            should_stop: false,
            reason: reason.into(),
            finish_reason: Some(finish),
            action: TerminationAction::AskUser,
        }
    }

    pub fn rollback_options(reason: impl Into<String>, finish: FinishReason) -> Self {
        Self {
            should_stop: true,
            reason: reason.into(),
            finish_reason: Some(finish),
            action: TerminationAction::RollbackOptions,
        }
    }

    /// True when the loop may simply continue with the next turn.
    pub fn is_continue(&self) -> bool {
        !self.should_stop && self.finish_reason.is_none()
    }
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Completed => "completed",
            FinishReason::AgentDecision => "agent_decision",
            FinishReason::UserStop => "user_stop",
            FinishReason::UserAbort => "user_abort",
            FinishReason::MaxTurns => "max_turns",
            FinishReason::MaxDuration => "max_duration",
            FinishReason::IdleTimeout => "idle_timeout",
            FinishReason::CostLimit => "cost_limit",
            FinishReason::ConsecutiveFailures => "consecutive_failures",
            FinishReason::BacktrackExhausted => "backtrack_exhausted",
            FinishReason::HitlConfirm => "hitl_confirm",
            FinishReason::LongRunningConfirm => "long_running_confirm",
            FinishReason::IntentClarify => "intent_clarify",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FinishReason::BacktrackExhausted).unwrap();
        assert_eq!(json, "\"backtrack_exhausted\"");
    }

    #[test]
    fn as_str_matches_serde_rename() {
        for reason in [
            FinishReason::Completed,
            FinishReason::UserStop,
            FinishReason::MaxTurns,
            FinishReason::CostLimit,
            FinishReason::IntentClarify,
        ] {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json.trim_matches('"'), reason.as_str());
        }
    }

    #[test]
    fn continue_decision_has_no_finish_reason() {
        let d = TerminationDecision::continue_running();
        assert!(d.is_continue());
        assert!(!d.should_stop);
        assert!(d.finish_reason.is_none());
    }

    #[test]
    fn ask_user_is_not_continue() {
        let d = TerminationDecision::ask_user("hitl_confirm:exec", FinishReason::HitlConfirm);
        assert!(!d.should_stop);
        assert!(!d.is_continue());
        assert_eq!(d.action, TerminationAction::AskUser);
    }
}

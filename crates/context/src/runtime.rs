use std::collections::VecDeque;
use std::time::Instant;

use sha2::{Digest, Sha256};

use relay_domain::tool::stable_json_string;
use relay_domain::FinishReason;

/// Ring capacity for tool-call signatures.
const SIGNATURE_RING_CAP: usize = 50;
/// When the ring overflows it is trimmed down to this many entries.
const SIGNATURE_RING_KEEP: usize = 20;

/// Where a backtrack escalation should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktrackEscalation {
    IntentClarify,
    Escalate,
}

impl BacktrackEscalation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacktrackEscalation::IntentClarify => "intent_clarify",
            BacktrackEscalation::Escalate => "escalate",
        }
    }
}

/// Per-session mutable state, owned exclusively by the session's
/// executor task. Tracks turn progress, activity timestamps for idle
/// detection, failure counters, the tool-call signature ring used for
/// trajectory deduplication, and the backtrack ↔ termination linkage
/// flags.
#[derive(Debug)]
pub struct RuntimeContext {
    pub session_id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,

    pub current_turn: u32,
    start_time: Instant,
    last_activity: Instant,

    /// Tool errors since the most recent tool success.
    pub consecutive_failures: u32,

    signature_ring: VecDeque<String>,
    consecutive_duplicate_count: u32,

    // Backtrack ↔ termination linkage
    pub total_backtracks: u32,
    pub backtracks_exhausted: bool,
    pub backtrack_escalation: Option<BacktrackEscalation>,

    pub stop_reason: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub final_result: Option<String>,
}

impl RuntimeContext {
    pub fn new(session_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            user_id: None,
            current_turn: 0,
            start_time: now,
            last_activity: now,
            consecutive_failures: 0,
            signature_ring: VecDeque::new(),
            consecutive_duplicate_count: 0,
            total_backtracks: 0,
            backtracks_exhausted: false,
            backtrack_escalation: None,
            stop_reason: None,
            finish_reason: None,
            final_result: None,
        }
    }

    // ── Turn & activity bookkeeping ───────────────────────────────

    /// Increment and return the current turn (1-based).
    pub fn next_turn(&mut self) -> u32 {
        self.current_turn += 1;
        self.current_turn
    }

    /// Update the activity timestamp (LLM delta or tool completion).
    pub fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn duration_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn idle_seconds(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    // ── Tool-call trajectory ──────────────────────────────────────

    /// Record a tool-call signature for trajectory deduplication.
    /// Signature = SHA-256 of `name:canonical-json(input)`.
    pub fn record_tool_call(&mut self, tool_name: &str, tool_input: &serde_json::Value) {
        let payload = format!("{tool_name}:{}", stable_json_string(tool_input));
        let sig = hex::encode(Sha256::digest(payload.as_bytes()));

        if self.signature_ring.back() == Some(&sig) {
            self.consecutive_duplicate_count += 1;
        } else {
            self.consecutive_duplicate_count = 0;
        }

        self.signature_ring.push_back(sig);
        if self.signature_ring.len() > SIGNATURE_RING_CAP {
            while self.signature_ring.len() > SIGNATURE_RING_KEEP {
                self.signature_ring.pop_front();
            }
        }
    }

    /// True when the same (tool, input) has been called `threshold` or
    /// more times consecutively.
    pub fn detect_repeated_call(&self, threshold: u32) -> bool {
        self.consecutive_duplicate_count + 1 >= threshold
    }

    pub fn consecutive_duplicates(&self) -> u32 {
        self.consecutive_duplicate_count
    }

    // ── Failure accounting ────────────────────────────────────────

    /// Record the outcome of one round of tool dispatch.
    pub fn record_round_outcome(&mut self, any_error: bool) {
        if any_error {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }
    }

    // ── Completion state ──────────────────────────────────────────

    pub fn set_completed(&mut self, result: impl Into<String>, reason: impl Into<String>) {
        self.final_result = Some(result.into());
        self.stop_reason = Some(reason.into());
    }

    pub fn is_completed(&self) -> bool {
        self.final_result.is_some()
    }

    pub fn has_final_text(&self) -> bool {
        self.final_result
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Clear the backtrack flags after a user-approved retry or a
    /// successful intent clarification.
    pub fn reset_backtrack_flags(&mut self) {
        self.backtracks_exhausted = false;
        self.backtrack_escalation = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_counter_is_one_based() {
        let mut ctx = RuntimeContext::new("s1", "c1");
        assert_eq!(ctx.current_turn, 0);
        assert_eq!(ctx.next_turn(), 1);
        assert_eq!(ctx.next_turn(), 2);
    }

    #[test]
    fn duplicate_detection_requires_consecutive_identical_calls() {
        let mut ctx = RuntimeContext::new("s1", "c1");
        let input = serde_json::json!({"url": "http://x"});

        for _ in 0..3 {
            ctx.record_tool_call("fetch", &input);
        }
        assert!(!ctx.detect_repeated_call(4));
        ctx.record_tool_call("fetch", &input);
        assert!(ctx.detect_repeated_call(4));

        // A different input breaks the streak.
        ctx.record_tool_call("fetch", &serde_json::json!({"url": "http://y"}));
        assert!(!ctx.detect_repeated_call(4));
    }

    #[test]
    fn signature_is_input_order_insensitive() {
        let mut ctx = RuntimeContext::new("s1", "c1");
        ctx.record_tool_call("t", &serde_json::json!({"a": 1, "b": 2}));
        ctx.record_tool_call("t", &serde_json::json!({"b": 2, "a": 1}));
        // Canonical JSON makes the two calls identical.
        assert_eq!(ctx.consecutive_duplicates(), 1);
    }

    #[test]
    fn ring_is_bounded() {
        let mut ctx = RuntimeContext::new("s1", "c1");
        for i in 0..120 {
            ctx.record_tool_call("t", &serde_json::json!({ "i": i }));
        }
        assert!(ctx.signature_ring.len() <= SIGNATURE_RING_CAP);
    }

    #[test]
    fn failure_counter_resets_on_success() {
        let mut ctx = RuntimeContext::new("s1", "c1");
        ctx.record_round_outcome(true);
        ctx.record_round_outcome(true);
        assert_eq!(ctx.consecutive_failures, 2);
        ctx.record_round_outcome(false);
        assert_eq!(ctx.consecutive_failures, 0);
    }

    #[test]
    fn completion_state() {
        let mut ctx = RuntimeContext::new("s1", "c1");
        assert!(!ctx.is_completed());
        ctx.set_completed("done", "end_turn");
        assert!(ctx.is_completed());
        assert!(ctx.has_final_text());
        assert_eq!(ctx.stop_reason.as_deref(), Some("end_turn"));

        let mut blank = RuntimeContext::new("s2", "c2");
        blank.set_completed("  ", "end_turn");
        assert!(!blank.has_final_text());
    }
}

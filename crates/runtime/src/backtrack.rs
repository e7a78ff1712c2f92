//! Backtrack engine (the B in RVR-B): error classification, backtrack
//! decisions, alternative-tool retry, context-pollution cleaning, and
//! progressive hint escalation.
//!
//! Infrastructure failures (network, auth, rate limits, 5xx) belong to
//! the resilience layer and never consume backtrack budget. Everything
//! else is a business-logic failure that feeds the decision procedure.

use std::collections::{HashMap, HashSet};

use serde_json::json;

use relay_context::{BacktrackEscalation, RuntimeContext};
use relay_domain::tool::stable_json_string;
use relay_domain::{ContentBlock, ToolResultContent};
use relay_events::ExecEvent;

use crate::flow::ToolExecutor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient transport/provider problems. Retried elsewhere with
    /// backoff; invisible to backtrack accounting.
    Infrastructure,
    /// Everything else: wrong tool, wrong parameters, bad assumptions.
    BusinessLogic,
}

const INFRA_MARKERS: [&str; 12] = [
    "timeout",
    "timed out",
    "connection",
    "connect refused",
    "rate limit",
    "429",
    "unauthorized",
    "authentication",
    "401",
    "502",
    "503",
    "504",
];

/// Keyword classifier over the error text.
#[derive(Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(&self, error_msg: &str) -> ErrorClass {
        let lowered = error_msg.to_lowercase();
        if INFRA_MARKERS.iter().any(|m| lowered.contains(m))
            || lowered.contains("500") && lowered.contains("server")
        {
            ErrorClass::Infrastructure
        } else {
            ErrorClass::BusinessLogic
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How to reshape the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktrackType {
    ToolReplace,
    PlanReplan,
    ParamAdjust,
    ContextEnrich,
    IntentClarify,
}

impl BacktrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacktrackType::ToolReplace => "tool_replace",
            BacktrackType::PlanReplan => "plan_replan",
            BacktrackType::ParamAdjust => "param_adjust",
            BacktrackType::ContextEnrich => "context_enrich",
            BacktrackType::IntentClarify => "intent_clarify",
        }
    }
}

/// Pluggable decision maker. An LLM-backed decider can plug in through
/// the same trait; [`HeuristicDecider`] ships as the default.
pub trait BacktrackDecider: Send + Sync {
    fn decide(&self, tool_name: &str, error_msg: &str, state: &RvrbState) -> BacktrackType;
}

/// Rule-based decider:
/// input-shaped errors after several distinct attempts escalate to
/// intent clarification; parse/argument errors adjust parameters;
/// unknown-context errors enrich context; repeated failure of the
/// same tool replaces it; the plan tool replans.
pub struct HeuristicDecider;

impl BacktrackDecider for HeuristicDecider {
    fn decide(&self, tool_name: &str, error_msg: &str, state: &RvrbState) -> BacktrackType {
        let lowered = error_msg.to_lowercase();
        let distinct_attempts = state
            .failed_approaches
            .iter()
            .filter(|a| a.tool == tool_name)
            .map(|a| a.approach.as_str())
            .collect::<HashSet<_>>()
            .len();

        let input_shaped = ["not found", "no such", "invalid", "missing"]
            .iter()
            .any(|m| lowered.contains(m));
        if input_shaped && distinct_attempts >= 2 {
            return BacktrackType::IntentClarify;
        }
        if tool_name == "plan" {
            return BacktrackType::PlanReplan;
        }
        if ["parse", "argument", "expected", "invalid"]
            .iter()
            .any(|m| lowered.contains(m))
        {
            return BacktrackType::ParamAdjust;
        }
        if ["unknown", "ambiguous", "context"]
            .iter()
            .any(|m| lowered.contains(m))
        {
            return BacktrackType::ContextEnrich;
        }
        if state.tool_failure_streak(tool_name) >= 2 {
            return BacktrackType::ToolReplace;
        }
        BacktrackType::ToolReplace
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedApproach {
    pub tool: String,
    pub approach: String,
    pub reason: String,
}

const MAX_FAILED_APPROACHES: usize = 10;
const MAX_EXECUTION_HISTORY: usize = 50;

/// RVR-B loop state for one session.
#[derive(Debug, Default)]
pub struct RvrbState {
    pub backtrack_count: u32,
    pub max_backtracks: u32,
    pub failed_tools: Vec<String>,
    pub failed_approaches: Vec<FailedApproach>,
    tool_failure_streak: HashMap<String, u32>,
    /// Tools banned from the next LLM request after repeated failure.
    pub pruned_tools: HashSet<String>,
    execution_history: Vec<String>,
    pub last_error: Option<String>,
}

impl RvrbState {
    pub fn new(max_backtracks: u32) -> Self {
        Self {
            max_backtracks,
            ..Self::default()
        }
    }

    pub fn can_backtrack(&self) -> bool {
        self.backtrack_count < self.max_backtracks
    }

    pub fn record_tool_failure(&mut self, tool_name: &str) {
        if !self.failed_tools.iter().any(|t| t == tool_name) {
            self.failed_tools.push(tool_name.to_owned());
        }
    }

    pub fn record_failed_approach(
        &mut self,
        tool_name: &str,
        approach: impl Into<String>,
        reason: impl Into<String>,
    ) {
        let entry = FailedApproach {
            tool: tool_name.to_owned(),
            approach: approach.into(),
            reason: reason.into(),
        };
        if !self.failed_approaches.contains(&entry) {
            self.failed_approaches.push(entry);
        }
        if self.failed_approaches.len() > MAX_FAILED_APPROACHES {
            let excess = self.failed_approaches.len() - MAX_FAILED_APPROACHES;
            self.failed_approaches.drain(..excess);
        }
    }

    /// Maintain the per-tool consecutive failure streak.
    pub fn record_tool_outcome(&mut self, tool_name: &str, success: bool) {
        if success {
            self.tool_failure_streak.insert(tool_name.to_owned(), 0);
        } else {
            *self
                .tool_failure_streak
                .entry(tool_name.to_owned())
                .or_insert(0) += 1;
        }
    }

    pub fn tool_failure_streak(&self, tool_name: &str) -> u32 {
        self.tool_failure_streak.get(tool_name).copied().unwrap_or(0)
    }

    pub fn record_execution(&mut self, entry: impl Into<String>) {
        self.execution_history.push(entry.into());
        if self.execution_history.len() > MAX_EXECUTION_HISTORY {
            let excess = self.execution_history.len() - MAX_EXECUTION_HISTORY;
            self.execution_history.drain(..excess);
        }
    }

    /// User chose "retry": clear the counters and bans so a fresh
    /// round of backtracking is allowed.
    pub fn reset_for_retry(&mut self) {
        self.backtrack_count = 0;
        self.pruned_tools.clear();
        self.tool_failure_streak.clear();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of handling one tool error.
#[derive(Debug)]
pub struct ErrorHandling {
    /// Content to place in the tool_result block.
    pub content: String,
    pub is_error: bool,
    /// Event to broadcast (`backtrack` / `backtrack_exhausted`).
    pub event: Option<ExecEvent>,
    /// Whether the error counts toward consecutive failures
    /// (infrastructure errors do not).
    pub counts_as_failure: bool,
    /// The alternative tool that transparently replaced the failed
    /// one, when TOOL_REPLACE succeeded.
    pub replaced_by: Option<String>,
}

pub struct BacktrackEngine {
    classifier: ErrorClassifier,
    decider: Box<dyn BacktrackDecider>,
    /// Capability-compatible alternatives per tool name.
    alternatives: HashMap<String, Vec<String>>,
}

impl BacktrackEngine {
    pub fn new(decider: Box<dyn BacktrackDecider>) -> Self {
        Self {
            classifier: ErrorClassifier,
            decider,
            alternatives: HashMap::new(),
        }
    }

    pub fn with_alternatives(mut self, alternatives: HashMap<String, Vec<String>>) -> Self {
        self.alternatives = alternatives;
        self
    }

    /// Decide how to respond to a failed tool and carry it out.
    ///
    /// Mutates `state` (counters, failure memory) and syncs the
    /// backtrack ↔ termination flags on the RuntimeContext.
    pub async fn handle_tool_error(
        &self,
        tool_name: &str,
        tool_input: &serde_json::Value,
        error_msg: &str,
        state: &mut RvrbState,
        ctx: &mut RuntimeContext,
        executor: &dyn ToolExecutor,
    ) -> ErrorHandling {
        state.last_error = Some(error_msg.to_owned());
        state.record_tool_failure(tool_name);
        state.record_failed_approach(
            tool_name,
            truncate(&stable_json_string(tool_input), 100),
            truncate(error_msg, 100),
        );

        // Infrastructure errors delegate to the resilience layer.
        if self.classifier.classify(error_msg) == ErrorClass::Infrastructure {
            tracing::info!(tool = tool_name, "infrastructure error, delegating to resilience");
            return ErrorHandling {
                content: stable_json_string(&json!({
                    "error": error_msg,
                    "delegate_to": "resilience",
                })),
                is_error: true,
                event: None,
                counts_as_failure: false,
                replaced_by: None,
            };
        }

        // Budget exhausted → fail gracefully, hand control to the user.
        if !state.can_backtrack() {
            tracing::warn!(
                attempts = state.backtrack_count,
                max = state.max_backtracks,
                "backtracks exhausted"
            );
            ctx.backtracks_exhausted = true;
            ctx.total_backtracks = state.backtrack_count;
            if ctx.backtrack_escalation.is_none() {
                ctx.backtrack_escalation = Some(BacktrackEscalation::Escalate);
            }
            state.record_execution(format!("backtrack_exhausted:{tool_name}"));
            return ErrorHandling {
                content: stable_json_string(&json!({
                    "error": error_msg,
                    "backtrack_exhausted": true,
                    "attempts": state.backtrack_count,
                    "failed_tools": state.failed_tools,
                    "message": format!(
                        "已尝试 {} 种不同方法均失败，等待用户决定",
                        state.backtrack_count
                    ),
                })),
                is_error: true,
                event: Some(ExecEvent::BacktrackExhausted {
                    decision: "fail_gracefully".into(),
                    total_attempts: state.backtrack_count,
                    failed_tools: state.failed_tools.clone(),
                    last_error: truncate(error_msg, 200),
                    escalation: ctx
                        .backtrack_escalation
                        .map(|e| e.as_str().to_owned()),
                }),
                counts_as_failure: true,
                replaced_by: None,
            };
        }

        let backtrack_type = self.decider.decide(tool_name, error_msg, state);
        state.backtrack_count += 1;
        ctx.total_backtracks = state.backtrack_count;
        let attempt = format!("{}/{}", state.backtrack_count, state.max_backtracks);
        tracing::info!(
            tool = tool_name,
            backtrack_type = backtrack_type.as_str(),
            attempt = %attempt,
            "backtrack triggered"
        );

        // Intent unclear → escalate to the user through the terminator.
        if backtrack_type == BacktrackType::IntentClarify {
            ctx.backtracks_exhausted = true;
            ctx.backtrack_escalation = Some(BacktrackEscalation::IntentClarify);
            return ErrorHandling {
                content: stable_json_string(&json!({
                    "error": error_msg,
                    "backtrack": { "type": backtrack_type.as_str(), "attempt": attempt },
                })),
                is_error: true,
                event: Some(ExecEvent::Backtrack {
                    backtrack_type: backtrack_type.as_str().into(),
                    attempt,
                    reason: truncate(error_msg, 150),
                }),
                counts_as_failure: true,
                replaced_by: None,
            };
        }

        // Tool replacement: transparently run an alternative when one
        // exists and hasn't failed yet; otherwise fall through with a
        // replacement hint for the model.
        if backtrack_type == BacktrackType::ToolReplace {
            if let Some((alt_name, output)) = self
                .try_alternative(tool_name, tool_input, state, executor)
                .await
            {
                state.record_execution(format!("backtrack:tool_replace:{alt_name}"));
                return ErrorHandling {
                    content: output,
                    is_error: false,
                    event: Some(ExecEvent::Backtrack {
                        backtrack_type: backtrack_type.as_str().into(),
                        attempt,
                        reason: format!("{tool_name} → {alt_name}"),
                    }),
                    counts_as_failure: false,
                    replaced_by: Some(alt_name),
                };
            }
            return ErrorHandling {
                content: stable_json_string(&json!({
                    "error": error_msg,
                    "backtrack": { "type": backtrack_type.as_str(), "attempt": attempt },
                    "hint": format!(
                        "工具 {tool_name} 执行失败，请选择其他工具或方法完成当前任务。"
                    ),
                })),
                is_error: true,
                event: Some(ExecEvent::Backtrack {
                    backtrack_type: backtrack_type.as_str().into(),
                    attempt,
                    reason: truncate(error_msg, 150),
                }),
                counts_as_failure: true,
                replaced_by: None,
            };
        }

        // Remaining types return the decision to the model, which
        // adjusts its own next step.
        ErrorHandling {
            content: stable_json_string(&json!({
                "error": error_msg,
                "backtrack": { "type": backtrack_type.as_str(), "attempt": attempt },
            })),
            is_error: true,
            event: Some(ExecEvent::Backtrack {
                backtrack_type: backtrack_type.as_str().into(),
                attempt,
                reason: truncate(error_msg, 150),
            }),
            counts_as_failure: true,
            replaced_by: None,
        }
    }

    async fn try_alternative(
        &self,
        failed_tool: &str,
        tool_input: &serde_json::Value,
        state: &mut RvrbState,
        executor: &dyn ToolExecutor,
    ) -> Option<(String, String)> {
        let candidates = self.alternatives.get(failed_tool)?;
        for alt in candidates {
            if state.failed_tools.iter().any(|t| t == alt) {
                continue;
            }
            tracing::info!(alt = %alt, "trying alternative tool");
            match executor.execute(alt, tool_input).await {
                Ok(value) => {
                    tracing::info!(alt = %alt, "alternative tool succeeded");
                    return Some((alt.clone(), value.to_display_string()));
                }
                Err(e) => {
                    tracing::warn!(alt = %alt, error = %e, "alternative tool failed too");
                    state.record_tool_failure(alt);
                }
            }
        }
        None
    }

    // ── Context-pollution cleaning ────────────────────────────────

    /// After a backtrack, reshape the round's tool_result blocks so
    /// stale error text stops polluting the model's context: failed
    /// results shrink to a one-line brief, and one reflection text
    /// block carries the full summary of what failed and what was
    /// already tried. Every tool_use keeps its paired tool_result.
    pub fn clean_backtrack_results(
        &self,
        blocks: Vec<ContentBlock>,
        state: &RvrbState,
    ) -> Vec<ContentBlock> {
        if state.backtrack_count == 0 {
            return blocks;
        }

        let mut cleaned = Vec::with_capacity(blocks.len() + 1);
        let mut failed_briefs: Vec<String> = Vec::new();

        for block in blocks {
            match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error: true,
                } => {
                    let brief = truncate(&content.to_display_string(), 100);
                    failed_briefs.push(brief.clone());
                    // Keep the pairing; mark as reference, not error.
                    cleaned.push(ContentBlock::ToolResult {
                        tool_use_id,
                        content: ToolResultContent::Text(format!("[已回溯] {brief}")),
                        is_error: false,
                    });
                }
                other => cleaned.push(other),
            }
        }

        if !failed_briefs.is_empty() {
            cleaned.push(ContentBlock::text(
                self.build_reflection(&failed_briefs, state),
            ));
        }
        cleaned
    }

    fn build_reflection(&self, failed_briefs: &[String], state: &RvrbState) -> String {
        let mut parts = vec![format!(
            "[回溯反思] 已尝试 {} 次回溯。",
            state.backtrack_count
        )];
        if !state.failed_tools.is_empty() {
            parts.push(format!("失败的工具: {}。", state.failed_tools.join(", ")));
        }
        match failed_briefs {
            [single] => parts.push(format!("失败原因: {single}")),
            [] => {}
            many => parts.push(format!(
                "失败原因汇总: {}",
                many.iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ")
            )),
        }
        if !state.failed_approaches.is_empty() {
            parts.push("已尝试过的方法（不要重复）:".into());
            let start = state.failed_approaches.len().saturating_sub(5);
            for (i, fa) in state.failed_approaches[start..].iter().enumerate() {
                parts.push(format!(
                    "  {}. {}: {} → 失败: {}",
                    i + 1,
                    fa.tool,
                    fa.approach,
                    fa.reason
                ));
            }
        }
        parts.push("请使用完全不同的策略或工具重试。".into());
        parts.join("\n")
    }

    // ── Progressive hint escalation ───────────────────────────────

    /// Escalating guidance for a tool's consecutive failures. At
    /// streak ≥ 3 the caller must also add the tool to
    /// `state.pruned_tools` (this function has no side effects).
    pub fn build_progressive_hint(
        &self,
        tool_name: &str,
        error_msg: &str,
        state: &RvrbState,
    ) -> Option<String> {
        let streak = state.tool_failure_streak(tool_name);
        if streak == 0 {
            return None;
        }

        if streak == 1 {
            return Some(format!(
                "[工具失败提醒] {tool_name} 执行失败: {}\n\
                 请分析失败原因，调整参数或换用其他工具。不要使用完全相同的参数重试。",
                truncate(error_msg, 150)
            ));
        }

        if streak == 2 {
            let approaches: Vec<String> = state
                .failed_approaches
                .iter()
                .filter(|fa| fa.tool == tool_name)
                .rev()
                .take(3)
                .map(|fa| {
                    format!(
                        "  - {} → {}",
                        truncate(&fa.approach, 80),
                        truncate(&fa.reason, 60)
                    )
                })
                .collect();
            return Some(format!(
                "[系统约束] {tool_name} 已连续失败 {streak} 次。\n\
                 已尝试过的方法（禁止重复）:\n{}\n\
                 要求：必须换用完全不同的工具，或使用根本不同的参数。\
                 如果没有替代方案，直接基于已有信息回答用户。",
                approaches.join("\n")
            ));
        }

        Some(format!(
            "[强制转向] {tool_name} 已连续失败 {streak} 次，已被禁用。\n\
             你无法再使用 {tool_name}。请使用其他工具完成任务，\
             或直接告诉用户当前无法完成该操作并说明原因。"
        ))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_owned()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::{Result, ToolResultValue};
    use std::sync::Arc;

    struct AltExecutor {
        succeed_on: &'static str,
    }

    #[async_trait::async_trait]
    impl ToolExecutor for AltExecutor {
        async fn execute(
            &self,
            tool_name: &str,
            _tool_input: &serde_json::Value,
        ) -> Result<ToolResultValue> {
            if tool_name == self.succeed_on {
                Ok(ToolResultValue::Text("page content".into()))
            } else {
                Err(relay_domain::Error::Other("still failing".into()))
            }
        }
    }

    fn engine_with_alts() -> BacktrackEngine {
        let mut alts = HashMap::new();
        alts.insert(
            "fetch_url_v1".to_string(),
            vec!["fetch_url_v2".to_string(), "fetch_url_v3".to_string()],
        );
        BacktrackEngine::new(Box::new(HeuristicDecider)).with_alternatives(alts)
    }

    #[test]
    fn classifier_separates_infra_from_business() {
        let c = ErrorClassifier;
        assert_eq!(c.classify("connection timed out"), ErrorClass::Infrastructure);
        assert_eq!(c.classify("HTTP 429 rate limit"), ErrorClass::Infrastructure);
        assert_eq!(c.classify("401 unauthorized"), ErrorClass::Infrastructure);
        assert_eq!(c.classify("file not found"), ErrorClass::BusinessLogic);
        assert_eq!(c.classify("permission denied"), ErrorClass::BusinessLogic);
    }

    #[tokio::test]
    async fn infrastructure_error_skips_backtrack_budget() {
        let engine = engine_with_alts();
        let mut state = RvrbState::new(3);
        let mut ctx = RuntimeContext::new("s1", "c1");
        let exec = Arc::new(AltExecutor { succeed_on: "none" });

        let handling = engine
            .handle_tool_error(
                "fetch_url_v1",
                &serde_json::json!({}),
                "connection timed out",
                &mut state,
                &mut ctx,
                exec.as_ref(),
            )
            .await;

        assert!(handling.is_error);
        assert!(!handling.counts_as_failure);
        assert!(handling.event.is_none());
        assert_eq!(state.backtrack_count, 0);
        assert!(handling.content.contains("resilience"));
    }

    #[tokio::test]
    async fn tool_replace_runs_alternative_transparently() {
        let engine = engine_with_alts();
        let mut state = RvrbState::new(3);
        // Build a streak so the decider picks ToolReplace.
        state.record_tool_outcome("fetch_url_v1", false);
        state.record_tool_outcome("fetch_url_v1", false);
        let mut ctx = RuntimeContext::new("s1", "c1");
        let exec = Arc::new(AltExecutor {
            succeed_on: "fetch_url_v2",
        });

        let handling = engine
            .handle_tool_error(
                "fetch_url_v1",
                &serde_json::json!({"url": "http://x"}),
                "fetch failed hard",
                &mut state,
                &mut ctx,
                exec.as_ref(),
            )
            .await;

        assert!(!handling.is_error);
        assert_eq!(handling.replaced_by.as_deref(), Some("fetch_url_v2"));
        assert_eq!(handling.content, "page content");
        assert_eq!(state.backtrack_count, 1);
        assert!(state.failed_tools.contains(&"fetch_url_v1".to_string()));
        match handling.event {
            Some(ExecEvent::Backtrack { attempt, .. }) => assert_eq!(attempt, "1/3"),
            other => panic!("expected backtrack event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_alternatives_fall_through_with_hint() {
        let engine = engine_with_alts();
        let mut state = RvrbState::new(3);
        state.record_tool_outcome("fetch_url_v1", false);
        state.record_tool_outcome("fetch_url_v1", false);
        let mut ctx = RuntimeContext::new("s1", "c1");
        // No alternative ever succeeds.
        let exec = Arc::new(AltExecutor { succeed_on: "none" });

        let handling = engine
            .handle_tool_error(
                "fetch_url_v1",
                &serde_json::json!({}),
                "fetch failed hard",
                &mut state,
                &mut ctx,
                exec.as_ref(),
            )
            .await;

        assert!(handling.is_error);
        assert!(handling.content.contains("hint"));
        // Both alternatives got recorded as failed.
        assert!(state.failed_tools.contains(&"fetch_url_v2".to_string()));
        assert!(state.failed_tools.contains(&"fetch_url_v3".to_string()));
    }

    #[tokio::test]
    async fn exhausted_budget_fails_gracefully_and_sets_flags() {
        let engine = engine_with_alts();
        let mut state = RvrbState::new(1);
        state.backtrack_count = 1;
        let mut ctx = RuntimeContext::new("s1", "c1");
        let exec = Arc::new(AltExecutor { succeed_on: "none" });

        let handling = engine
            .handle_tool_error(
                "fetch_url_v1",
                &serde_json::json!({}),
                "fetch failed hard",
                &mut state,
                &mut ctx,
                exec.as_ref(),
            )
            .await;

        assert!(handling.is_error);
        assert!(ctx.backtracks_exhausted);
        assert_eq!(ctx.backtrack_escalation, Some(BacktrackEscalation::Escalate));
        assert!(matches!(
            handling.event,
            Some(ExecEvent::BacktrackExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn intent_clarify_escalation() {
        let engine = BacktrackEngine::new(Box::new(HeuristicDecider));
        let mut state = RvrbState::new(5);
        // Two distinct failed approaches with input-shaped errors.
        state.record_failed_approach("lookup", r#"{"q":"a"}"#, "user not found");
        state.record_failed_approach("lookup", r#"{"q":"b"}"#, "user not found");
        let mut ctx = RuntimeContext::new("s1", "c1");
        let exec = Arc::new(AltExecutor { succeed_on: "none" });

        let handling = engine
            .handle_tool_error(
                "lookup",
                &serde_json::json!({"q": "c"}),
                "user not found",
                &mut state,
                &mut ctx,
                exec.as_ref(),
            )
            .await;

        assert!(ctx.backtracks_exhausted);
        assert_eq!(
            ctx.backtrack_escalation,
            Some(BacktrackEscalation::IntentClarify)
        );
        assert!(handling.is_error);
    }

    #[test]
    fn cleaning_preserves_pairing_and_appends_reflection() {
        let engine = engine_with_alts();
        let mut state = RvrbState::new(3);
        state.backtrack_count = 1;
        state.record_tool_failure("fetch_url_v1");
        state.record_failed_approach("fetch_url_v1", "{\"url\":\"http://x\"}", "dns failure");

        let blocks = vec![
            ContentBlock::tool_result("t1", "a very long error message about dns resolution that goes on", true),
            ContentBlock::tool_result("t2", "fine result", false),
        ];
        let cleaned = engine.clean_backtrack_results(blocks, &state);

        // Pairing intact: both original ids still present.
        let ids: Vec<&str> = cleaned
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);

        // Failed result became a non-error brief.
        match &cleaned[0] {
            ContentBlock::ToolResult {
                content, is_error, ..
            } => {
                assert!(!is_error);
                assert!(content.to_display_string().starts_with("[已回溯]"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Reflection block appended last.
        match cleaned.last().unwrap() {
            ContentBlock::Text { text } => {
                assert!(text.contains("[回溯反思]"));
                assert!(text.contains("fetch_url_v1"));
                assert!(text.contains("不要重复"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cleaning_is_identity_without_backtracks() {
        let engine = engine_with_alts();
        let state = RvrbState::new(3);
        let blocks = vec![ContentBlock::tool_result("t1", "error!", true)];
        let cleaned = engine.clean_backtrack_results(blocks.clone(), &state);
        assert_eq!(cleaned, blocks);
    }

    #[test]
    fn progressive_hints_escalate_by_streak() {
        let engine = engine_with_alts();
        let mut state = RvrbState::new(3);

        assert!(engine
            .build_progressive_hint("exec", "err", &state)
            .is_none());

        state.record_tool_outcome("exec", false);
        let l1 = engine.build_progressive_hint("exec", "err", &state).unwrap();
        assert!(l1.contains("[工具失败提醒]"));

        state.record_failed_approach("exec", "ls -la", "permission denied");
        state.record_tool_outcome("exec", false);
        let l2 = engine.build_progressive_hint("exec", "err", &state).unwrap();
        assert!(l2.contains("[系统约束]"));
        assert!(l2.contains("禁止重复"));

        state.record_tool_outcome("exec", false);
        let l3 = engine.build_progressive_hint("exec", "err", &state).unwrap();
        assert!(l3.contains("[强制转向]"));

        // A success resets the streak and silences the hints.
        state.record_tool_outcome("exec", true);
        assert!(engine
            .build_progressive_hint("exec", "err", &state)
            .is_none());
    }

    #[test]
    fn failed_approaches_are_bounded() {
        let mut state = RvrbState::new(3);
        for i in 0..20 {
            state.record_failed_approach("t", format!("approach {i}"), "reason");
        }
        assert_eq!(state.failed_approaches.len(), MAX_FAILED_APPROACHES);
        // Oldest entries were evicted.
        assert_eq!(state.failed_approaches[0].approach, "approach 10");
    }
}

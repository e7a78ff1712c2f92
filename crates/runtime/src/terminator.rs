//! Adaptive termination policy — eight dimensions evaluated in fixed
//! order at every turn boundary, first match wins.
//!
//! 1. user stop, 2. HITL danger-word gate, 3. LLM end_turn,
//! 4. max turns, 4.5 cost tiers, 5. max duration, 6. idle timeout,
//! 6.5 backtrack exhaustion / intent clarify, 7. consecutive failures
//! → rollback options, 8. long-running confirmation.
//!
//! Cost tiers are always questions to the user; the core never stops a
//! task over cost on its own. Pricing-unknown models skip the tiers.

use relay_context::{BacktrackEscalation, RuntimeContext};
use relay_domain::config::{HitlConfig, TerminatorConfig};
use relay_domain::{FinishReason, TerminationDecision};

/// Which cost tier the user confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostLevel {
    Confirm,
    Urgent,
}

/// Inputs that vary per evaluation, separate from the RuntimeContext.
#[derive(Debug, Default)]
pub struct TurnSignals<'a> {
    pub stop_requested: bool,
    pub last_stop_reason: Option<&'a str>,
    pub pending_tool_names: Option<&'a [String]>,
    pub current_cost_usd: Option<f64>,
}

/// Signal-driven terminator. One-shot flags (cost warn/confirm,
/// long-running confirm) live on the terminator so the same question
/// is never asked twice; `evaluate` never mutates the RuntimeContext.
pub struct AdaptiveTerminator {
    cfg: TerminatorConfig,
    hitl: HitlConfig,
    long_running_confirmed: bool,
    cost_warned: bool,
    cost_confirmed: bool,
    cost_urgent_confirmed: bool,
    pending_cost_warn: Option<f64>,
}

impl AdaptiveTerminator {
    pub fn new(cfg: TerminatorConfig, hitl: HitlConfig) -> Self {
        Self {
            cfg,
            hitl,
            long_running_confirmed: false,
            cost_warned: false,
            cost_confirmed: false,
            cost_urgent_confirmed: false,
            pending_cost_warn: None,
        }
    }

    /// Evaluate the termination dimensions in order. Deterministic with
    /// respect to (terminator state, ctx snapshot, signals).
    pub fn evaluate(&mut self, ctx: &RuntimeContext, signals: &TurnSignals<'_>) -> TerminationDecision {
        // 1. User requested stop.
        if signals.stop_requested {
            tracing::info!("termination: user stop");
            return TerminationDecision::stop("user_stop", FinishReason::UserStop);
        }

        // 2. HITL danger-word gate over pending tool calls.
        if let Some(decision) = self.check_hitl(signals.pending_tool_names) {
            return decision;
        }

        // 3. The model finished on its own.
        if signals.last_stop_reason == Some("end_turn") {
            tracing::info!("termination: model end_turn");
            return TerminationDecision::stop("end_turn", FinishReason::Completed);
        }

        // 4. Turn cap.
        if ctx.current_turn >= self.cfg.max_turns {
            tracing::warn!(
                turn = ctx.current_turn,
                max = self.cfg.max_turns,
                "termination: max turns"
            );
            return TerminationDecision::stop("max_turns", FinishReason::MaxTurns);
        }

        // 4.5. Tiered cost awareness (skipped when pricing unknown).
        if let Some(cost) = signals.current_cost_usd {
            let alert = &self.cfg.cost_alert;
            if !self.cost_urgent_confirmed && cost >= alert.urgent_threshold {
                tracing::warn!(cost, "termination: cost urgent tier, asking user");
                return TerminationDecision::ask_user(
                    format!("cost_urgent:${cost:.4}"),
                    FinishReason::CostLimit,
                );
            }
            if !self.cost_confirmed && cost >= alert.confirm_threshold {
                tracing::warn!(cost, "termination: cost confirm tier, asking user");
                return TerminationDecision::ask_user(
                    format!("cost_confirm:${cost:.4}"),
                    FinishReason::CostLimit,
                );
            }
            if !self.cost_warned && cost >= alert.warn_threshold {
                // One-shot, non-blocking: record and keep evaluating.
                self.cost_warned = true;
                self.pending_cost_warn = Some(cost);
                tracing::info!(cost, "cost warning threshold crossed");
            }
        }

        // 5. Wall-clock cap.
        if ctx.duration_seconds() >= self.cfg.max_duration_seconds {
            tracing::warn!("termination: max duration");
            return TerminationDecision::stop("max_duration", FinishReason::MaxDuration);
        }

        // 6. Idle timeout.
        if ctx.idle_seconds() >= self.cfg.idle_timeout_seconds {
            tracing::warn!("termination: idle timeout");
            return TerminationDecision::stop("idle_timeout", FinishReason::IdleTimeout);
        }

        // 6.5. Backtrack ↔ termination linkage.
        if ctx.backtracks_exhausted {
            return match ctx.backtrack_escalation {
                Some(BacktrackEscalation::IntentClarify) => {
                    tracing::info!(
                        backtracks = ctx.total_backtracks,
                        "termination: escalating to intent clarify"
                    );
                    TerminationDecision::ask_user(
                        "backtrack_intent_clarify",
                        FinishReason::IntentClarify,
                    )
                }
                _ => {
                    tracing::warn!(
                        backtracks = ctx.total_backtracks,
                        "termination: backtracks exhausted, asking user"
                    );
                    TerminationDecision::ask_user(
                        "backtrack_exhausted",
                        FinishReason::BacktrackExhausted,
                    )
                }
            };
        }

        // 7. Consecutive failures → rollback options.
        if ctx.consecutive_failures >= self.cfg.consecutive_failure_limit {
            tracing::warn!(
                failures = ctx.consecutive_failures,
                "termination: consecutive failures, offering rollback"
            );
            return TerminationDecision::rollback_options(
                "consecutive_failures",
                FinishReason::ConsecutiveFailures,
            );
        }

        // 8. Long-running confirmation.
        if !self.long_running_confirmed
            && ctx.current_turn >= self.cfg.long_running_confirm_after_turns
        {
            tracing::info!(turn = ctx.current_turn, "termination: long-running confirm");
            return TerminationDecision::ask_user(
                "long_running_confirm",
                FinishReason::LongRunningConfirm,
            );
        }

        TerminationDecision::continue_running()
    }

    fn check_hitl(&self, pending: Option<&[String]>) -> Option<TerminationDecision> {
        if !self.hitl.enabled {
            return None;
        }
        let pending = pending?;
        for tool_name in pending {
            let lowered = tool_name.to_lowercase();
            let matched = self
                .hitl
                .require_confirmation
                .iter()
                .any(|kw| tool_name == kw || lowered.contains(kw.as_str()));
            if matched {
                tracing::info!(tool = %tool_name, "HITL gate: confirmation required");
                return Some(TerminationDecision::ask_user(
                    format!("hitl_confirm:{tool_name}"),
                    FinishReason::HitlConfirm,
                ));
            }
        }
        None
    }

    // ── One-shot confirmations ────────────────────────────────────

    /// Called after the user approves continuing a long task.
    pub fn confirm_long_running(&mut self) {
        self.long_running_confirmed = true;
    }

    /// Called after the user approves continuing past a cost tier.
    pub fn confirm_cost_continue(&mut self, level: CostLevel) {
        match level {
            CostLevel::Urgent => self.cost_urgent_confirmed = true,
            CostLevel::Confirm => self.cost_confirmed = true,
        }
    }

    /// One-shot cost warning for the executor to surface as a
    /// non-blocking event. Returns the cost at the time of crossing.
    pub fn take_pending_cost_warn(&mut self) -> Option<f64> {
        self.pending_cost_warn.take()
    }

    /// Reset per-task state (a new task begins).
    pub fn reset(&mut self) {
        self.long_running_confirmed = false;
        self.cost_warned = false;
        self.cost_confirmed = false;
        self.cost_urgent_confirmed = false;
        self.pending_cost_warn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::TerminationAction;

    fn terminator() -> AdaptiveTerminator {
        AdaptiveTerminator::new(TerminatorConfig::default(), HitlConfig::default())
    }

    fn ctx() -> RuntimeContext {
        RuntimeContext::new("s1", "c1")
    }

    #[test]
    fn user_stop_wins_over_everything() {
        let mut t = terminator();
        let mut c = ctx();
        c.backtracks_exhausted = true;
        c.consecutive_failures = 99;
        let d = t.evaluate(
            &c,
            &TurnSignals {
                stop_requested: true,
                last_stop_reason: Some("end_turn"),
                ..TurnSignals::default()
            },
        );
        assert_eq!(d.finish_reason, Some(FinishReason::UserStop));
        assert!(d.should_stop);
    }

    #[test]
    fn hitl_matches_exact_and_substring() {
        let mut t = terminator();
        let c = ctx();
        let pending = vec!["delete_file".to_string()];
        let d = t.evaluate(
            &c,
            &TurnSignals {
                pending_tool_names: Some(&pending),
                ..TurnSignals::default()
            },
        );
        assert_eq!(d.action, TerminationAction::AskUser);
        assert_eq!(d.finish_reason, Some(FinishReason::HitlConfirm));
        assert!(d.reason.starts_with("hitl_confirm:"));

        let safe = vec!["read_file".to_string()];
        let d = t.evaluate(
            &c,
            &TurnSignals {
                pending_tool_names: Some(&safe),
                ..TurnSignals::default()
            },
        );
        assert!(d.is_continue());
    }

    #[test]
    fn hitl_disabled_skips_gate() {
        let mut t = AdaptiveTerminator::new(
            TerminatorConfig::default(),
            HitlConfig {
                enabled: false,
                ..HitlConfig::default()
            },
        );
        let c = ctx();
        let pending = vec!["delete_file".to_string()];
        let d = t.evaluate(
            &c,
            &TurnSignals {
                pending_tool_names: Some(&pending),
                ..TurnSignals::default()
            },
        );
        assert!(d.is_continue());
    }

    #[test]
    fn end_turn_completes() {
        let mut t = terminator();
        let d = t.evaluate(
            &ctx(),
            &TurnSignals {
                last_stop_reason: Some("end_turn"),
                ..TurnSignals::default()
            },
        );
        assert_eq!(d.finish_reason, Some(FinishReason::Completed));
    }

    #[test]
    fn max_turns_zero_stops_on_first_turn() {
        let mut t = AdaptiveTerminator::new(
            TerminatorConfig {
                max_turns: 0,
                ..TerminatorConfig::default()
            },
            HitlConfig::default(),
        );
        let d = t.evaluate(&ctx(), &TurnSignals::default());
        assert_eq!(d.finish_reason, Some(FinishReason::MaxTurns));
    }

    #[test]
    fn cost_tiers_latch_once_confirmed() {
        let mut t = terminator();
        let c = ctx();

        // Confirm tier fires.
        let d = t.evaluate(
            &c,
            &TurnSignals {
                current_cost_usd: Some(2.5),
                ..TurnSignals::default()
            },
        );
        assert_eq!(d.finish_reason, Some(FinishReason::CostLimit));
        assert!(d.reason.starts_with("cost_confirm:"));

        // After confirmation the same cost passes through.
        t.confirm_cost_continue(CostLevel::Confirm);
        let d = t.evaluate(
            &c,
            &TurnSignals {
                current_cost_usd: Some(2.5),
                ..TurnSignals::default()
            },
        );
        assert!(d.is_continue());

        // Urgent tier is its own latch.
        let d = t.evaluate(
            &c,
            &TurnSignals {
                current_cost_usd: Some(12.0),
                ..TurnSignals::default()
            },
        );
        assert!(d.reason.starts_with("cost_urgent:"));
        t.confirm_cost_continue(CostLevel::Urgent);
        let d = t.evaluate(
            &c,
            &TurnSignals {
                current_cost_usd: Some(12.0),
                ..TurnSignals::default()
            },
        );
        assert!(d.is_continue());
    }

    #[test]
    fn cost_warn_is_one_shot_and_non_blocking() {
        let mut t = terminator();
        let c = ctx();
        let d = t.evaluate(
            &c,
            &TurnSignals {
                current_cost_usd: Some(0.75),
                ..TurnSignals::default()
            },
        );
        assert!(d.is_continue());
        assert_eq!(t.take_pending_cost_warn(), Some(0.75));
        // Second crossing does not re-warn.
        t.evaluate(
            &c,
            &TurnSignals {
                current_cost_usd: Some(0.9),
                ..TurnSignals::default()
            },
        );
        assert_eq!(t.take_pending_cost_warn(), None);
    }

    #[test]
    fn unknown_pricing_skips_cost_tiers() {
        let mut t = terminator();
        let d = t.evaluate(
            &ctx(),
            &TurnSignals {
                current_cost_usd: None,
                ..TurnSignals::default()
            },
        );
        assert!(d.is_continue());
    }

    #[test]
    fn backtrack_exhausted_asks_user() {
        let mut t = terminator();
        let mut c = ctx();
        c.backtracks_exhausted = true;
        let d = t.evaluate(&c, &TurnSignals::default());
        assert_eq!(d.action, TerminationAction::AskUser);
        assert_eq!(d.finish_reason, Some(FinishReason::BacktrackExhausted));

        c.backtrack_escalation = Some(BacktrackEscalation::IntentClarify);
        let d = t.evaluate(&c, &TurnSignals::default());
        assert_eq!(d.finish_reason, Some(FinishReason::IntentClarify));
    }

    #[test]
    fn consecutive_failures_offer_rollback() {
        let mut t = AdaptiveTerminator::new(
            TerminatorConfig {
                consecutive_failure_limit: 0,
                ..TerminatorConfig::default()
            },
            HitlConfig::default(),
        );
        let d = t.evaluate(&ctx(), &TurnSignals::default());
        assert_eq!(d.action, TerminationAction::RollbackOptions);
        assert_eq!(d.finish_reason, Some(FinishReason::ConsecutiveFailures));
    }

    #[test]
    fn long_running_confirm_is_one_shot() {
        let mut t = terminator();
        let mut c = ctx();
        c.current_turn = 20;
        let d = t.evaluate(&c, &TurnSignals::default());
        assert_eq!(d.finish_reason, Some(FinishReason::LongRunningConfirm));

        t.confirm_long_running();
        let d = t.evaluate(&c, &TurnSignals::default());
        assert!(d.is_continue());
    }

    #[test]
    fn evaluate_is_deterministic_for_same_inputs() {
        let mut t = terminator();
        let c = ctx();
        let a = t.evaluate(&c, &TurnSignals::default());
        let b = t.evaluate(&c, &TurnSignals::default());
        assert_eq!(a, b);
    }
}

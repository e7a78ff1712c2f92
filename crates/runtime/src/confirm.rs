//! User-confirmation gates — the executor's suspension points.
//!
//! Each suspension kind (HITL approval, backtrack-exhausted three-way
//! choice, intent clarification, cost confirmation, long-running
//! confirmation) gets a oneshot gate keyed by session. The executor
//! awaits the gate; the transport resolves it from the user's reply.
//!
//! A hub constructed non-interactive (no transport attached) makes
//! every wait return `None` immediately, which the executor maps to
//! its conservative stop paths — dangerous operations are never
//! executed without an explicit approval.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// The reviewer's decision on a dangerous tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlDecision {
    Approve,
    Reject,
}

/// The user's choice after backtracks are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktrackChoice {
    Retry,
    Rollback,
    Stop,
}

/// The user's choice at a cost-confirmation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostChoice {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GateKind {
    Hitl,
    Backtrack,
    IntentClarify,
    Cost,
    LongRunning,
}

#[derive(Debug)]
enum GateReply {
    Hitl(HitlDecision),
    Backtrack(BacktrackChoice),
    Clarify(String),
    Cost(CostChoice),
    LongRunning,
}

/// Pending oneshot gates, one per (session, kind). Registering a new
/// gate for an occupied slot drops the stale sender, which wakes the
/// stale waiter with `None`.
pub struct ConfirmHub {
    interactive: bool,
    pending: Mutex<HashMap<(String, GateKind), oneshot::Sender<GateReply>>>,
}

impl ConfirmHub {
    /// A hub with a transport attached: waits block until resolved.
    pub fn interactive() -> Self {
        Self {
            interactive: true,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// A hub with nobody listening: every wait returns `None` at once.
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    async fn wait(&self, session_id: &str, kind: GateKind) -> Option<GateReply> {
        if !self.interactive {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert((session_id.to_owned(), kind), tx);
        rx.await.ok()
    }

    fn resolve(&self, session_id: &str, kind: GateKind, reply: GateReply) -> bool {
        if let Some(tx) = self.pending.lock().remove(&(session_id.to_owned(), kind)) {
            return tx.send(reply).is_ok();
        }
        false
    }

    // ── Executor side ─────────────────────────────────────────────

    pub async fn wait_hitl(&self, session_id: &str) -> Option<HitlDecision> {
        match self.wait(session_id, GateKind::Hitl).await? {
            GateReply::Hitl(d) => Some(d),
            _ => None,
        }
    }

    pub async fn wait_backtrack(&self, session_id: &str) -> Option<BacktrackChoice> {
        match self.wait(session_id, GateKind::Backtrack).await? {
            GateReply::Backtrack(c) => Some(c),
            _ => None,
        }
    }

    pub async fn wait_intent_clarify(&self, session_id: &str) -> Option<String> {
        match self.wait(session_id, GateKind::IntentClarify).await? {
            GateReply::Clarify(text) => Some(text),
            _ => None,
        }
    }

    pub async fn wait_cost(&self, session_id: &str) -> Option<CostChoice> {
        match self.wait(session_id, GateKind::Cost).await? {
            GateReply::Cost(c) => Some(c),
            _ => None,
        }
    }

    /// Returns true when the user confirmed continuing.
    pub async fn wait_long_running(&self, session_id: &str) -> bool {
        matches!(
            self.wait(session_id, GateKind::LongRunning).await,
            Some(GateReply::LongRunning)
        )
    }

    // ── Transport side ────────────────────────────────────────────

    pub fn resolve_hitl(&self, session_id: &str, decision: HitlDecision) -> bool {
        self.resolve(session_id, GateKind::Hitl, GateReply::Hitl(decision))
    }

    pub fn resolve_backtrack(&self, session_id: &str, choice: BacktrackChoice) -> bool {
        self.resolve(session_id, GateKind::Backtrack, GateReply::Backtrack(choice))
    }

    pub fn resolve_intent_clarify(&self, session_id: &str, text: impl Into<String>) -> bool {
        self.resolve(
            session_id,
            GateKind::IntentClarify,
            GateReply::Clarify(text.into()),
        )
    }

    pub fn resolve_cost(&self, session_id: &str, choice: CostChoice) -> bool {
        self.resolve(session_id, GateKind::Cost, GateReply::Cost(choice))
    }

    pub fn resolve_long_running(&self, session_id: &str) -> bool {
        self.resolve(session_id, GateKind::LongRunning, GateReply::LongRunning)
    }

    /// Whether a gate of any kind is pending for this session.
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .keys()
            .any(|(sid, _)| sid == session_id)
    }
}

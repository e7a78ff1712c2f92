//! Human-confirmation tool handler.
//!
//! The `hitl` tool is a blocking call inside tool dispatch: it parks
//! on the session's confirmation gate until the user approves or
//! rejects out-of-band. A rejection (or an absent reviewer) produces a
//! `pending_user_input` marker result, which tells the executor to
//! suspend the session instead of looping.

use std::sync::Arc;

use relay_domain::{ToolCall, ToolExecutionResult, ToolResultValue};

use crate::confirm::{ConfirmHub, HitlDecision};
use crate::flow::{SpecialToolHandler, ToolContext};

/// Marker embedded in results that must suspend the executor.
pub const PENDING_USER_INPUT: &str = "pending_user_input";

pub struct HitlHandler {
    hub: Arc<ConfirmHub>,
}

impl HitlHandler {
    pub fn new(hub: Arc<ConfirmHub>) -> Self {
        Self { hub }
    }
}

#[async_trait::async_trait]
impl SpecialToolHandler for HitlHandler {
    fn tool_name(&self) -> &str {
        "hitl"
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolExecutionResult {
        let message = call
            .input
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("需要用户确认");
        tracing::info!(session = %ctx.session_id, message, "hitl tool waiting for user");

        match self.hub.wait_hitl(&ctx.session_id).await {
            Some(HitlDecision::Approve) => ToolExecutionResult::ok(
                &call.id,
                "hitl",
                call.input.clone(),
                ToolResultValue::Json(serde_json::json!({
                    "status": "approved",
                    "message": message,
                })),
            ),
            Some(HitlDecision::Reject) | None => ToolExecutionResult::error(
                &call.id,
                "hitl",
                call.input.clone(),
                serde_json::json!({
                    "status": PENDING_USER_INPUT,
                    "message": "等待用户进一步输入",
                })
                .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> ToolCall {
        ToolCall {
            id: "h1".into(),
            name: "hitl".into(),
            input: serde_json::json!({"message": "可以发送邮件吗？"}),
        }
    }

    #[tokio::test]
    async fn approval_unblocks_with_success() {
        let hub = Arc::new(ConfirmHub::interactive());
        let handler = HitlHandler::new(hub.clone());
        let ctx = ToolContext::new("s1", "c1");

        let task = tokio::spawn(async move { handler.execute(&call(), &ctx).await });
        while !hub.has_pending("s1") {
            tokio::task::yield_now().await;
        }
        hub.resolve_hitl("s1", HitlDecision::Approve);

        let result = task.await.unwrap();
        assert!(!result.is_error);
        assert!(result.result.to_display_string().contains("approved"));
    }

    #[tokio::test]
    async fn rejection_yields_pending_marker() {
        let hub = Arc::new(ConfirmHub::interactive());
        let handler = HitlHandler::new(hub.clone());
        let ctx = ToolContext::new("s1", "c1");

        let task = tokio::spawn(async move { handler.execute(&call(), &ctx).await });
        while !hub.has_pending("s1") {
            tokio::task::yield_now().await;
        }
        hub.resolve_hitl("s1", HitlDecision::Reject);

        let result = task.await.unwrap();
        assert!(result.is_error);
        assert!(result
            .result
            .to_display_string()
            .contains(PENDING_USER_INPUT));
    }

    #[tokio::test]
    async fn no_reviewer_suspends_too() {
        let handler = HitlHandler::new(Arc::new(ConfirmHub::non_interactive()));
        let ctx = ToolContext::new("s1", "c1");
        let result = handler.execute(&call(), &ctx).await;
        assert!(result.is_error);
        assert!(result
            .result
            .to_display_string()
            .contains(PENDING_USER_INPUT));
    }
}

//! Unified tool execution flow: serial/parallel partitioning, special
//! handler dispatch, side-effect capture, and ordered result emission.
//!
//! Errors never escape the flow — every failure becomes a
//! `ToolExecutionResult` with `is_error = true` and a stringified
//! message, which downstream components (backtrack engine, terminator)
//! treat as data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::StreamExt;

use relay_domain::config::ExecutorConfig;
use relay_domain::{Result, ToolCall, ToolExecutionResult, ToolResultValue};
use relay_events::{ContentHandler, EventBroadcaster};
use relay_llm::BoxStream;
use relay_state::StateConsistencyManager;

use crate::capture;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool executor contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Contract the tool registry implements. Shared read-only across
/// sessions; per-tool state is the tool's own responsibility.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run a tool. `Err` is a business-logic failure the flow turns
    /// into an error result.
    async fn execute(
        &self,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> Result<ToolResultValue>;

    fn supports_stream(&self, _tool_name: &str) -> bool {
        false
    }

    /// Chunked output for streaming-capable tools.
    async fn execute_stream(
        &self,
        tool_name: &str,
        _tool_input: &serde_json::Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        Err(relay_domain::Error::Other(format!(
            "tool does not stream: {tool_name}"
        )))
    }

    /// Attach per-call identifiers before execution.
    fn update_context(&self, _session_id: &str, _conversation_id: &str, _user_id: Option<&str>) {}
}

/// Per-dispatch identifiers and the task key for side-effect capture.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub conversation_id: String,
    pub user_id: Option<String>,
    /// Key for the state manager's snapshot / operation log.
    pub task_id: String,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            task_id: session_id.clone(),
            session_id,
            conversation_id: conversation_id.into(),
            user_id: None,
        }
    }
}

/// A handler that replaces generic dispatch for one tool name
/// (plan convergence control, HITL suspension).
#[async_trait::async_trait]
pub trait SpecialToolHandler: Send + Sync {
    fn tool_name(&self) -> &str;

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolExecutionResult;

    /// Called when a different tool ran in the same turn.
    fn on_other_tool(&self) {}
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatches one turn's tool calls: parallel-eligible calls run
/// concurrently with a cap (excess spills to serial), serial-only and
/// handler-backed calls run sequentially in declaration order, and
/// results always come back in declaration order.
pub struct ToolExecutionFlow {
    executor: Arc<dyn ToolExecutor>,
    handlers: HashMap<String, Arc<dyn SpecialToolHandler>>,
    state_manager: Option<Arc<StateConsistencyManager>>,
    serial_only: HashSet<String>,
    allow_parallel: bool,
    max_parallel: usize,
}

impl ToolExecutionFlow {
    pub fn new(executor: Arc<dyn ToolExecutor>, cfg: &ExecutorConfig) -> Self {
        Self {
            executor,
            handlers: HashMap::new(),
            state_manager: None,
            serial_only: cfg.serial_only_tools.clone(),
            allow_parallel: cfg.allow_parallel_tools,
            max_parallel: cfg.max_parallel_tools.max(1),
        }
    }

    pub fn with_state_manager(mut self, manager: Arc<StateConsistencyManager>) -> Self {
        self.state_manager = Some(manager);
        self
    }

    pub fn register_handler(&mut self, handler: Arc<dyn SpecialToolHandler>) {
        tracing::debug!(tool = handler.tool_name(), "special handler registered");
        self.handlers.insert(handler.tool_name().to_owned(), handler);
    }

    pub fn has_handler(&self, tool_name: &str) -> bool {
        self.handlers.contains_key(tool_name)
    }

    /// The underlying tool executor (used by the backtrack engine for
    /// alternative-tool retries).
    pub fn tool_executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    fn is_serial_only(&self, tool_name: &str) -> bool {
        self.serial_only.contains(tool_name) || self.handlers.contains_key(tool_name)
    }

    // ── Single ────────────────────────────────────────────────────

    /// Execute one tool call. Special handlers take precedence; the
    /// generic path does side-effect capture around the executor call.
    pub async fn execute_single(&self, call: &ToolCall, ctx: &ToolContext) -> ToolExecutionResult {
        tracing::debug!(tool = %call.name, id = %call.id, "executing tool");

        if let Some(handler) = self.handlers.get(&call.name) {
            return handler.execute(call, ctx).await;
        }

        self.executor.update_context(
            &ctx.session_id,
            &ctx.conversation_id,
            ctx.user_id.as_deref(),
        );

        let report = self
            .state_manager
            .as_ref()
            .filter(|_| capture::needs_capture(&call.input))
            .map(|manager| capture::pre_capture(manager, &ctx.task_id, &call.input));

        match self.executor.execute(&call.name, &call.input).await {
            Ok(value) => {
                if let (Some(manager), Some(report)) = (self.state_manager.as_ref(), report.as_ref())
                {
                    capture::record_operations(manager, &ctx.task_id, report);
                }
                ToolExecutionResult::ok(&call.id, &call.name, call.input.clone(), value)
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool failed");
                ToolExecutionResult::error(&call.id, &call.name, call.input.clone(), e.to_string())
            }
        }
    }

    // ── Batch ─────────────────────────────────────────────────────

    /// Execute a turn's tool calls, returning results in declaration
    /// order regardless of completion order.
    pub async fn execute(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolExecutionResult> {
        let mut parallel: Vec<&ToolCall> = Vec::new();
        let mut serial: Vec<&ToolCall> = Vec::new();
        for call in calls {
            if self.is_serial_only(&call.name) {
                serial.push(call);
            } else {
                parallel.push(call);
            }
        }

        let mut by_id: HashMap<String, ToolExecutionResult> = HashMap::new();

        if self.allow_parallel && parallel.len() > 1 {
            // Cap concurrency; the overflow runs serially first.
            let overflow: Vec<&ToolCall> = parallel.split_off(parallel.len().min(self.max_parallel));
            if !overflow.is_empty() {
                tracing::warn!(
                    overflow = overflow.len(),
                    cap = self.max_parallel,
                    "parallel cap exceeded, spilling to serial"
                );
            }
            tracing::info!(count = parallel.len(), "dispatching tools in parallel");
            let results = join_all(
                parallel
                    .iter()
                    .copied()
                    .map(|call| self.execute_single(call, ctx)),
            )
            .await;
            for result in results {
                by_id.insert(result.tool_id.clone(), result);
            }
            let mut rest = overflow;
            rest.extend(serial);
            serial = rest;
        } else {
            let mut rest = parallel;
            rest.extend(serial);
            serial = rest;
        }

        for call in serial {
            let result = self.execute_single(call, ctx).await;
            by_id.insert(result.tool_id.clone(), result);
        }

        // Reset per-turn handler state when a foreign tool ran.
        for handler in self.handlers.values() {
            if calls.iter().any(|c| c.name != handler.tool_name()) {
                handler.on_other_tool();
            }
        }

        calls
            .iter()
            .map(|call| {
                by_id.remove(&call.id).unwrap_or_else(|| {
                    ToolExecutionResult::error(
                        &call.id,
                        &call.name,
                        call.input.clone(),
                        "tool produced no result",
                    )
                })
            })
            .collect()
    }

    // ── Streaming ─────────────────────────────────────────────────

    /// Execute with interleaved per-tool events: non-streaming results
    /// emit as complete `tool_result` blocks, streaming-capable tools
    /// emit start → delta × N → stop. Events appear in declaration
    /// order (completed results are buffered until their turn).
    pub async fn execute_stream(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        broadcaster: &EventBroadcaster,
    ) -> Vec<ToolExecutionResult> {
        // Partition: streaming-capable tools run inline at their
        // position, everything else goes through the batch path.
        let batch: Vec<ToolCall> = calls
            .iter()
            .filter(|c| !self.supports_stream_for(c))
            .cloned()
            .collect();
        let mut batch_results: HashMap<String, ToolExecutionResult> = self
            .execute(&batch, ctx)
            .await
            .into_iter()
            .map(|r| (r.tool_id.clone(), r))
            .collect();

        let mut handler = ContentHandler::new(broadcaster, ctx.session_id.clone());
        let mut ordered = Vec::with_capacity(calls.len());

        for call in calls {
            if let Some(result) = batch_results.remove(&call.id) {
                handler.emit_tool_result(
                    &result.tool_id,
                    result.result.clone().into_result_content(),
                    result.is_error,
                );
                ordered.push(result);
                continue;
            }

            // Streaming tool: open a block and feed chunks through it.
            ordered.push(self.stream_one(call, ctx, broadcaster).await);
        }
        ordered
    }

    fn supports_stream_for(&self, call: &ToolCall) -> bool {
        !self.is_serial_only(&call.name) && self.executor.supports_stream(&call.name)
    }

    async fn stream_one(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        broadcaster: &EventBroadcaster,
    ) -> ToolExecutionResult {
        tracing::info!(tool = %call.name, "streaming tool execution");
        self.executor.update_context(
            &ctx.session_id,
            &ctx.conversation_id,
            ctx.user_id.as_deref(),
        );

        let stream = match self.executor.execute_stream(&call.name, &call.input).await {
            Ok(stream) => stream,
            Err(e) => {
                let result = ToolExecutionResult::error(
                    &call.id,
                    &call.name,
                    call.input.clone(),
                    e.to_string(),
                );
                let mut handler = ContentHandler::new(broadcaster, ctx.session_id.clone());
                handler.emit_tool_result(
                    &result.tool_id,
                    result.result.clone().into_result_content(),
                    true,
                );
                return result;
            }
        };

        let index = broadcaster.start_block(
            &ctx.session_id,
            relay_domain::ContentBlock::tool_result(&call.id, "", false),
        );

        let mut full = String::new();
        let mut failed: Option<String> = None;
        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(text) => {
                    broadcaster.delta_at(&ctx.session_id, index, &text);
                    full.push_str(&text);
                }
                Err(e) => {
                    failed = Some(e.to_string());
                    break;
                }
            }
        }
        let _ = broadcaster.stop_block_at(&ctx.session_id, index, None);

        match failed {
            Some(message) => {
                ToolExecutionResult::error(&call.id, &call.name, call.input.clone(), message)
            }
            None => ToolExecutionResult::ok(
                &call.id,
                &call.name,
                call.input.clone(),
                ToolResultValue::Text(full),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test double: records call order, can fail or sleep per tool.
    struct StubExecutor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: parking_lot::Mutex<Vec<String>>,
    }

    impl StubExecutor {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ToolExecutor for StubExecutor {
        async fn execute(
            &self,
            tool_name: &str,
            tool_input: &serde_json::Value,
        ) -> Result<ToolResultValue> {
            self.calls.lock().push(tool_name.to_owned());
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(
                tool_input.get("sleep_ms").and_then(|v| v.as_u64()).unwrap_or(5),
            ))
            .await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if tool_input.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
                return Err(relay_domain::Error::Other("boom".into()));
            }
            Ok(ToolResultValue::Text(format!("{tool_name} ok")))
        }
    }

    fn call(id: &str, name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    fn flow(executor: Arc<StubExecutor>) -> ToolExecutionFlow {
        ToolExecutionFlow::new(executor, &ExecutorConfig::default())
    }

    #[tokio::test]
    async fn results_in_declaration_order_despite_latencies() {
        let stub = Arc::new(StubExecutor::new());
        let flow = flow(stub.clone());
        let ctx = ToolContext::new("s1", "c1");

        let calls = vec![
            call("t1", "slow", serde_json::json!({"sleep_ms": 40})),
            call("t2", "fast", serde_json::json!({"sleep_ms": 1})),
            call("t3", "mid", serde_json::json!({"sleep_ms": 10})),
        ];
        let results = flow.execute(&calls, &ctx).await;
        let ids: Vec<&str> = results.iter().map(|r| r.tool_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert!(results.iter().all(|r| !r.is_error));
    }

    #[tokio::test]
    async fn parallel_cap_is_enforced() {
        let stub = Arc::new(StubExecutor::new());
        let cfg = ExecutorConfig {
            max_parallel_tools: 2,
            ..ExecutorConfig::default()
        };
        let flow = ToolExecutionFlow::new(stub.clone(), &cfg);
        let ctx = ToolContext::new("s1", "c1");

        let calls: Vec<ToolCall> = (0..6)
            .map(|i| {
                call(
                    &format!("t{i}"),
                    "worker",
                    serde_json::json!({"sleep_ms": 20}),
                )
            })
            .collect();
        flow.execute(&calls, &ctx).await;
        assert!(stub.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn serial_only_tools_never_run_concurrently() {
        let stub = Arc::new(StubExecutor::new());
        let flow = flow(stub.clone());
        let ctx = ToolContext::new("s1", "c1");

        // "plan" is serial-only by default config.
        let calls = vec![
            call("t1", "plan", serde_json::json!({"sleep_ms": 10})),
            call("t2", "plan", serde_json::json!({"sleep_ms": 10})),
        ];
        flow.execute(&calls, &ctx).await;
        assert_eq!(stub.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_error_is_a_value_not_a_panic() {
        let stub = Arc::new(StubExecutor::new());
        let flow = flow(stub);
        let ctx = ToolContext::new("s1", "c1");

        let calls = vec![call("t1", "explode", serde_json::json!({"fail": true}))];
        let results = flow.execute(&calls, &ctx).await;
        assert!(results[0].is_error);
        assert!(results[0].error_msg.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn empty_call_list_is_a_noop() {
        let stub = Arc::new(StubExecutor::new());
        let flow = flow(stub);
        let ctx = ToolContext::new("s1", "c1");
        let results = flow.execute(&[], &ctx).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn execute_stream_emits_tool_results_in_order() {
        let stub = Arc::new(StubExecutor::new());
        let flow = flow(stub);
        let ctx = ToolContext::new("s1", "c1");
        let broadcaster = EventBroadcaster::new(128);
        broadcaster.start_message("s1", "m1");

        let calls = vec![
            call("t1", "alpha", serde_json::json!({"sleep_ms": 15})),
            call("t2", "beta", serde_json::json!({"sleep_ms": 1})),
        ];
        let results = flow.execute_stream(&calls, &ctx, &broadcaster).await;
        assert_eq!(results.len(), 2);

        let (events, _rx) = broadcaster.subscribe("s1", 0);
        let result_ids: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.event {
                relay_events::ExecEvent::ContentStart { content_block, .. } => {
                    match content_block {
                        relay_domain::ContentBlock::ToolResult { tool_use_id, .. } => {
                            Some(tool_use_id.clone())
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect();
        assert_eq!(result_ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn multimodal_results_pass_through_unstringified() {
        struct Multimodal;
        #[async_trait::async_trait]
        impl ToolExecutor for Multimodal {
            async fn execute(
                &self,
                _tool_name: &str,
                _tool_input: &serde_json::Value,
            ) -> Result<ToolResultValue> {
                Ok(ToolResultValue::Blocks(vec![
                    relay_domain::ContentBlock::text("caption"),
                    relay_domain::ContentBlock::Image {
                        media_type: "image/png".into(),
                        data: "QUJD".into(),
                    },
                ]))
            }
        }

        let flow = ToolExecutionFlow::new(Arc::new(Multimodal), &ExecutorConfig::default());
        let ctx = ToolContext::new("s1", "c1");
        let results = flow
            .execute(&[call("t1", "screenshot", serde_json::json!({}))], &ctx)
            .await;
        match &results[0].result {
            ToolResultValue::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
    }
}

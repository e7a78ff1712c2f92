//! The RVR / RVR-B executor loop.
//!
//! One iteration = one turn: compact context, refresh plan injection,
//! prune failed tools, stream the LLM response into the broadcaster,
//! dispatch tool calls, feed results (cleaned of pollution after
//! backtracks) back into history, then consult the terminator.
//!
//! The two strategies are one type: `backtrack: None` is plain RVR,
//! `Some(engine)` is RVR-B. Suspension points (HITL, cost, backtrack
//! exhaustion, intent clarification, long-running confirmation) await
//! the session's [`ConfirmHub`] gates; with no transport attached the
//! conservative stop paths run instead.

use std::pin::pin;
use std::sync::Arc;

use futures_util::StreamExt;

use relay_context::{ContextCompactor, RuntimeContext, TokenEstimator};
use relay_context::compact::compress_fresh_tool_result;
use relay_domain::config::{CoreConfig, OnRejection};
use relay_domain::{
    ContentBlock, FinishReason, Message, TerminationAction, ToolCall, ToolDefinition,
    ToolExecutionResult, ToolResultContent,
};
use relay_events::{ConfirmOption, ContentHandler, EventBroadcaster, ExecEvent};
use relay_llm::{LlmChunk, LlmRequest, LlmService, StopReason, Usage, UsageTracker};
use relay_state::StateConsistencyManager;

use crate::backtrack::{BacktrackEngine, RvrbState};
use crate::cancel::CancelToken;
use crate::confirm::{BacktrackChoice, ConfirmHub, CostChoice, HitlDecision};
use crate::flow::{ToolContext, ToolExecutionFlow};
use crate::hitl::PENDING_USER_INPUT;
use crate::plan::{self, PlanCache};
use crate::terminator::{AdaptiveTerminator, CostLevel, TurnSignals};

const DEDUP_HINT: &str = "[系统提示] 检测到完全相同的工具调用已连续执行多次，结果不会改变。\
                          请分析原因，尝试不同的参数、换一个工具、或直接基于已有信息回答用户。";

const FALLBACK_FINAL_TEXT: &str = "任务执行完毕，如有问题请继续向我提问。";

/// Everything one session's loop needs, assembled by the caller.
pub struct ExecutionContext {
    pub llm: Arc<dyn LlmService>,
    pub session_id: String,
    pub conversation_id: String,
    pub system_prompt: String,
    pub tools_for_llm: Vec<ToolDefinition>,
    pub flow: Arc<ToolExecutionFlow>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub confirm: Arc<ConfirmHub>,
    pub cancel: CancelToken,
    pub state_manager: Option<Arc<StateConsistencyManager>>,
    pub plan_cache: PlanCache,
}

/// Outcome of folding one LLM stream.
struct StreamOutcome {
    stop_reason: StopReason,
    usage: Option<Usage>,
    cancelled: bool,
}

/// The session executor. Composition, not inheritance: the backtrack
/// engine is an optional capability.
pub struct Executor {
    config: CoreConfig,
    backtrack: Option<BacktrackEngine>,
}

impl Executor {
    /// Plain React–Validate–Reflect loop.
    pub fn rvr(config: CoreConfig) -> Self {
        Self {
            config,
            backtrack: None,
        }
    }

    /// RVR with backtracking.
    pub fn rvrb(config: CoreConfig, engine: BacktrackEngine) -> Self {
        Self {
            config,
            backtrack: Some(engine),
        }
    }

    /// Spawn the loop as a background task (the transport reads events
    /// via `broadcaster.subscribe`).
    pub fn spawn(
        self: Arc<Self>,
        messages: Vec<Message>,
        exec: ExecutionContext,
    ) -> tokio::task::JoinHandle<(RuntimeContext, Vec<Message>)> {
        tokio::spawn(async move { self.run(messages, exec).await })
    }

    /// Run the loop to completion or suspension. Returns the final
    /// runtime context and the accumulated message history (which a
    /// later invocation resumes from after a suspension).
    pub async fn run(
        &self,
        messages: Vec<Message>,
        exec: ExecutionContext,
    ) -> (RuntimeContext, Vec<Message>) {
        let session = exec.session_id.clone();
        exec.broadcaster
            .bind_conversation(&session, &exec.conversation_id);

        let mut ctx = RuntimeContext::new(session.as_str(), exec.conversation_id.as_str());
        let mut terminator = AdaptiveTerminator::new(
            self.config.terminator.clone(),
            self.config.hitl.clone(),
        );
        let mut state = RvrbState::new(self.config.executor.max_backtrack_attempts);
        let mut usage = UsageTracker::new(exec.llm.model_name().map(str::to_owned));
        let compactor = ContextCompactor::new(self.config.compaction.clone());
        let estimator = LlmTokenEstimator {
            llm: exec.llm.clone(),
        };
        let tool_ctx = ToolContext::new(session.as_str(), exec.conversation_id.as_str());
        let mut messages = messages;
        let mut last_stop: Option<StopReason> = None;

        tracing::info!(
            session = %session,
            strategy = if self.backtrack.is_some() { "rvr-b" } else { "rvr" },
            "executor started"
        );

        loop {
            // Cancellation is checked before every LLM call.
            if exec.cancel.is_cancelled() {
                ctx.stop_reason = Some("user_stop".into());
                ctx.finish_reason = Some(FinishReason::UserStop);
                break;
            }

            // Compact, then re-apply plan injection (append-only: the
            // conversation prefix stays byte-stable for KV caching).
            messages = compactor.compact(
                messages,
                &exec.system_prompt,
                &exec.tools_for_llm,
                &estimator,
            );
            let mut llm_messages = messages.clone();
            let plan = exec.plan_cache.lock().clone();
            if let Some(plan) = plan {
                append_to_last_user(&mut llm_messages, &plan::render_plan_for_injection(&plan));
            }

            let effective_tools = effective_tools(&exec.tools_for_llm, &state);

            ctx.next_turn();
            ctx.touch_activity();
            tracing::info!(
                turn = ctx.current_turn,
                backtracks = state.backtrack_count,
                "turn started"
            );

            // Stream the response into the accumulator + broadcaster.
            let message_id = uuid::Uuid::new_v4().to_string();
            exec.broadcaster.start_message(&session, &message_id);
            let outcome = self
                .stream_llm(&exec, &mut ctx, llm_messages, effective_tools)
                .await;
            if let Some(u) = &outcome.usage {
                usage.accumulate(u);
                exec.broadcaster.accumulate_usage(&session, u);
            }
            let text = exec.broadcaster.text_content(&session);
            last_stop = Some(outcome.stop_reason);
            exec.broadcaster
                .emit_message_delta(&session, Some(outcome.stop_reason.as_str()));

            if outcome.cancelled {
                ctx.set_completed(text, "user_stop");
                ctx.finish_reason = Some(FinishReason::UserStop);
                exec.broadcaster.emit_message_stop(&session);
                break;
            }

            match outcome.stop_reason {
                StopReason::EndTurn | StopReason::MaxTokens => {
                    let blocks = history_blocks(exec.broadcaster.finish_turn(&session));
                    if !blocks.is_empty() {
                        messages.push(Message::assistant_blocks(blocks));
                    }
                    ctx.set_completed(text, outcome.stop_reason.as_str());
                    ctx.finish_reason = Some(FinishReason::Completed);
                    exec.broadcaster.emit_message_stop(&session);
                    break;
                }

                StopReason::StreamError => {
                    // Drop malformed partial tool_use blocks; never
                    // persist them.
                    let dropped = exec.broadcaster.abort_incomplete_tool_uses(&session);
                    tracing::warn!(
                        dropped = dropped.len(),
                        "stream interrupted, discarding partial tool_use blocks"
                    );
                    exec.broadcaster.emit(
                        &session,
                        ExecEvent::Error {
                            message: "网络波动导致回复中断，请重试".into(),
                            recoverable: true,
                        },
                    );
                    let fallback = if text.trim().is_empty() {
                        "（回复因网络中断而不完整）".to_string()
                    } else {
                        text
                    };
                    ctx.set_completed(fallback, "stream_error");
                    exec.broadcaster.emit_message_stop(&session);
                    break;
                }

                StopReason::ToolUse => {
                    let suspended = self
                        .run_tool_phase(
                            &exec,
                            &mut ctx,
                            &mut state,
                            &mut terminator,
                            &mut usage,
                            &tool_ctx,
                            &mut messages,
                        )
                        .await;
                    if suspended {
                        break;
                    }
                }
            }

            // End-of-turn termination check.
            let cost = usage.estimate_cost(&self.config.pricing);
            let decision = terminator.evaluate(
                &ctx,
                &TurnSignals {
                    stop_requested: exec.cancel.is_cancelled(),
                    last_stop_reason: last_stop.map(|s| s.as_str()),
                    pending_tool_names: None,
                    current_cost_usd: cost,
                },
            );
            if let Some(warned) = terminator.take_pending_cost_warn() {
                exec.broadcaster.emit(
                    &session,
                    ExecEvent::CostWarn {
                        turn: ctx.current_turn,
                        current_cost: format!("${warned:.4}"),
                        message: format!("本次任务费用已达 ${warned:.4}"),
                    },
                );
            }

            if decision.should_stop {
                ctx.stop_reason = Some(decision.reason.clone());
                ctx.finish_reason = decision.finish_reason;
                if decision.action == TerminationAction::RollbackOptions {
                    self.emit_rollback_options(&exec, &decision.reason);
                }
                if !ctx.has_final_text() {
                    self.termination_reply(&exec, &mut ctx, &mut messages, &decision.reason, &mut usage)
                        .await;
                }
                break;
            }

            match (decision.action, decision.finish_reason) {
                (TerminationAction::AskUser, Some(FinishReason::BacktrackExhausted)) => {
                    exec.broadcaster.emit(
                        &session,
                        ExecEvent::BacktrackExhaustedConfirm {
                            turn: ctx.current_turn,
                            total_backtracks: ctx.total_backtracks,
                            message: format!(
                                "已经尝试了 {} 种不同的方法，但都没成功。您希望怎么做？",
                                ctx.total_backtracks
                            ),
                            options: vec![
                                ConfirmOption::new("retry", "换个思路再试试"),
                                ConfirmOption::new("rollback", "撤销已做的操作"),
                                ConfirmOption::new("stop", "就这样吧，先不做了"),
                            ],
                        },
                    );
                    match exec.confirm.wait_backtrack(&session).await {
                        Some(BacktrackChoice::Retry) => {
                            state.reset_for_retry();
                            ctx.reset_backtrack_flags();
                            ctx.consecutive_failures = 0;
                            tracing::info!("user chose retry, backtrack budget reset");
                        }
                        Some(BacktrackChoice::Rollback) => {
                            self.emit_rollback_options(&exec, "用户选择回滚");
                            ctx.stop_reason = Some("user_rollback_after_backtrack".into());
                            ctx.finish_reason = Some(FinishReason::BacktrackExhausted);
                            break;
                        }
                        Some(BacktrackChoice::Stop) => {
                            ctx.stop_reason = Some("user_stop_after_backtrack".into());
                            ctx.finish_reason = Some(FinishReason::BacktrackExhausted);
                            break;
                        }
                        None => {
                            ctx.stop_reason = Some("backtrack_exhausted_no_confirm".into());
                            ctx.finish_reason = Some(FinishReason::BacktrackExhausted);
                            break;
                        }
                    }
                }

                (TerminationAction::AskUser, Some(FinishReason::IntentClarify)) => {
                    exec.broadcaster.emit(
                        &session,
                        ExecEvent::IntentClarifyRequest {
                            message: "不太确定您的具体需求，能再描述一下吗？".into(),
                            context: state
                                .last_error
                                .as_deref()
                                .map(|e| e.chars().take(200).collect())
                                .unwrap_or_default(),
                        },
                    );
                    match exec.confirm.wait_intent_clarify(&session).await {
                        Some(clarification) => {
                            messages.push(Message::user(clarification));
                            ctx.reset_backtrack_flags();
                            tracing::info!("intent clarified, continuing");
                        }
                        None => {
                            ctx.stop_reason = Some("intent_clarify_no_confirm".into());
                            ctx.finish_reason = Some(FinishReason::IntentClarify);
                            break;
                        }
                    }
                }

                (TerminationAction::AskUser, Some(FinishReason::CostLimit)) => {
                    let is_urgent = decision.reason.starts_with("cost_urgent:");
                    let cost_display = cost
                        .map(|c| format!("${c:.4}"))
                        .unwrap_or_else(|| "未知".into());
                    let options = vec![
                        ConfirmOption::new("continue", "继续执行"),
                        ConfirmOption::new("stop", "停止任务"),
                    ];
                    let event = if is_urgent {
                        ExecEvent::CostUrgentConfirm {
                            turn: ctx.current_turn,
                            current_cost: cost_display.clone(),
                            message: format!("费用提醒：本次任务费用已达 {cost_display}，费用较高，请确认"),
                            options,
                        }
                    } else {
                        ExecEvent::CostLimitConfirm {
                            turn: ctx.current_turn,
                            current_cost: cost_display.clone(),
                            message: format!("费用提醒：本次任务费用已达 {cost_display}，是否继续？"),
                            options,
                        }
                    };
                    exec.broadcaster.emit(&session, event);
                    match exec.confirm.wait_cost(&session).await {
                        Some(CostChoice::Continue) => {
                            terminator.confirm_cost_continue(if is_urgent {
                                CostLevel::Urgent
                            } else {
                                CostLevel::Confirm
                            });
                        }
                        Some(CostChoice::Stop) => {
                            ctx.stop_reason = Some("user_stop_cost_limit".into());
                            ctx.finish_reason = Some(FinishReason::CostLimit);
                            break;
                        }
                        None => {
                            ctx.stop_reason = Some("cost_limit_no_confirm".into());
                            ctx.finish_reason = Some(FinishReason::CostLimit);
                            break;
                        }
                    }
                }

                (TerminationAction::AskUser, Some(FinishReason::LongRunningConfirm)) => {
                    exec.broadcaster.emit(
                        &session,
                        ExecEvent::LongRunningConfirm {
                            turn: ctx.current_turn,
                            message: format!("任务已执行 {} 轮，是否继续？", ctx.current_turn),
                        },
                    );
                    // A missing reviewer confirms implicitly: long-run
                    // is advisory, not a safety gate.
                    exec.confirm.wait_long_running(&session).await;
                    terminator.confirm_long_running();
                }

                _ => {}
            }
        }

        // Fallback completion: never end without a non-empty assistant
        // reply (unless suspended awaiting user input).
        let suspended = ctx.stop_reason.as_deref() == Some("hitl_pending");
        if !suspended && !ctx.has_final_text() {
            let reason = ctx
                .stop_reason
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            self.termination_reply(&exec, &mut ctx, &mut messages, &reason, &mut usage)
                .await;
        }

        tracing::info!(
            turns = ctx.current_turn,
            stop_reason = ctx.stop_reason.as_deref().unwrap_or(""),
            "executor finished"
        );
        (ctx, messages)
    }

    // ── Tool phase ────────────────────────────────────────────────

    /// Handle a `tool_use` stop: HITL gate, dispatch, backtracking,
    /// context shaping. Returns true when the session must suspend or
    /// stop.
    #[allow(clippy::too_many_arguments)]
    async fn run_tool_phase(
        &self,
        exec: &ExecutionContext,
        ctx: &mut RuntimeContext,
        state: &mut RvrbState,
        terminator: &mut AdaptiveTerminator,
        usage: &mut UsageTracker,
        tool_ctx: &ToolContext,
        messages: &mut Vec<Message>,
    ) -> bool {
        let session = &exec.session_id;
        // Flush in-flight blocks first so tool calls from providers
        // that never send an explicit tool_use stop are still seen.
        let turn_blocks = exec.broadcaster.finish_turn(session);
        let tool_calls = exec.broadcaster.tool_calls(session);
        let pending_names: Vec<String> = tool_calls.iter().map(|c| c.name.clone()).collect();

        // HITL gate before any dispatch.
        let gate = terminator.evaluate(
            ctx,
            &TurnSignals {
                last_stop_reason: Some("tool_use"),
                pending_tool_names: Some(&pending_names),
                ..TurnSignals::default()
            },
        );
        if gate.action == TerminationAction::AskUser
            && gate.finish_reason == Some(FinishReason::HitlConfirm)
        {
            exec.broadcaster.emit(
                session,
                ExecEvent::HitlConfirm {
                    reason: gate.reason.clone(),
                    tools: pending_names.clone(),
                    message: "危险操作需用户确认".into(),
                },
            );
            match exec.confirm.wait_hitl(session).await {
                Some(HitlDecision::Approve) => {
                    tracing::info!(tools = ?pending_names, "HITL approved");
                }
                Some(HitlDecision::Reject) => {
                    tracing::info!(tools = ?pending_names, "HITL rejected");
                    self.handle_hitl_rejection(exec, ctx);
                    exec.broadcaster.emit_message_stop(session);
                    return true;
                }
                None => {
                    // No reviewer: never execute a dangerous tool.
                    ctx.stop_reason = Some(gate.reason.clone());
                    ctx.finish_reason = Some(FinishReason::HitlConfirm);
                    exec.broadcaster.emit_message_stop(session);
                    self.termination_reply(exec, ctx, messages, "hitl_no_confirm", usage)
                        .await;
                    return true;
                }
            }
        }

        // Append the assistant turn (text + tool_use) to history.
        let assistant_blocks = history_blocks(turn_blocks);
        if !assistant_blocks.is_empty() {
            messages.push(Message::assistant_blocks(assistant_blocks));
        }

        // Dispatch. Malformed tool inputs short-circuit to error
        // results without touching the tool registry.
        let (well_formed, malformed): (Vec<ToolCall>, Vec<ToolCall>) = tool_calls
            .iter()
            .cloned()
            .partition(|c| c.input.get("_raw_input").is_none());
        let mut by_id: std::collections::HashMap<String, ToolExecutionResult> = exec
            .flow
            .execute(&well_formed, tool_ctx)
            .await
            .into_iter()
            .map(|r| (r.tool_id.clone(), r))
            .collect();
        for call in &malformed {
            by_id.insert(
                call.id.clone(),
                ToolExecutionResult::error(
                    &call.id,
                    &call.name,
                    call.input.clone(),
                    "tool input parse failed",
                ),
            );
        }

        let mut result_blocks: Vec<ContentBlock> = Vec::with_capacity(tool_calls.len());
        let mut round_failures: Vec<(String, String)> = Vec::new();
        let mut counts_failure = false;
        let mut content_handler = ContentHandler::new(exec.broadcaster.as_ref(), session.clone());

        for call in &tool_calls {
            ctx.record_tool_call(&call.name, &call.input);
            let result = by_id
                .remove(&call.id)
                .unwrap_or_else(|| {
                    ToolExecutionResult::error(
                        &call.id,
                        &call.name,
                        call.input.clone(),
                        "tool produced no result",
                    )
                });

            let (content, is_error) = if !result.is_error {
                state.record_tool_outcome(&call.name, true);
                state.record_execution(format!("tool:{}", call.name));
                (compressed_content(result.result.into_result_content(), &self.config), false)
            } else {
                let error_msg = result
                    .error_msg
                    .clone()
                    .unwrap_or_else(|| result.result.to_display_string());
                tracing::warn!(tool = %call.name, error = %error_msg, "tool error");

                if let Some(engine) = &self.backtrack {
                    let handling = engine
                        .handle_tool_error(
                            &call.name,
                            &call.input,
                            &error_msg,
                            state,
                            ctx,
                            exec.flow.tool_executor().as_ref(),
                        )
                        .await;
                    state.record_tool_outcome(&call.name, !handling.is_error);
                    if let Some(event) = handling.event {
                        exec.broadcaster.emit(session, event);
                    }
                    if handling.counts_as_failure {
                        counts_failure = true;
                        round_failures.push((
                            call.name.clone(),
                            handling.content.chars().take(150).collect(),
                        ));
                    }
                    (
                        compressed_content(
                            ToolResultContent::Text(handling.content),
                            &self.config,
                        ),
                        handling.is_error,
                    )
                } else {
                    state.record_tool_outcome(&call.name, false);
                    counts_failure = true;
                    (
                        ToolResultContent::Text(
                            serde_json::json!({ "error": error_msg }).to_string(),
                        ),
                        true,
                    )
                }
            };

            content_handler.emit_tool_result(&call.id, content.clone(), is_error);
            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content,
                is_error,
            });
        }

        // Suspension marker from the HITL tool, checked before the
        // cleaning pass can shorten the content.
        let pending_detected = result_blocks.iter().any(|b| {
            matches!(b, ContentBlock::ToolResult { content, .. }
                     if content.contains_marker(PENDING_USER_INPUT))
        });

        // Context-pollution cleaning after backtracks.
        let cleaned = match &self.backtrack {
            Some(engine) => engine.clean_backtrack_results(result_blocks, state),
            None => result_blocks,
        };
        let hints = extract_tool_hints(&cleaned);
        if !cleaned.is_empty() {
            messages.push(Message::tool_results(cleaned));
        }

        if pending_detected {
            tracing::info!("tool returned pending_user_input, suspending session");
            ctx.stop_reason = Some("hitl_pending".into());
            exec.broadcaster.emit_message_stop(session);
            return true;
        }

        // Progressive hint escalation (streak-based, RVR-B only).
        if let Some(engine) = &self.backtrack {
            let mut escalations = Vec::new();
            for (tool_name, error_brief) in &round_failures {
                if let Some(hint) = engine.build_progressive_hint(tool_name, error_brief, state) {
                    escalations.push(hint);
                    if state.tool_failure_streak(tool_name) >= 3 {
                        state.pruned_tools.insert(tool_name.clone());
                        tracing::warn!(tool = %tool_name, "tool pruned after repeated failure");
                    }
                }
            }
            if !escalations.is_empty() {
                messages.push(Message::user(escalations.join("\n\n")));
            }
        }

        // Trajectory dedup: identical signature ≥ 4 times in a row.
        if ctx.detect_repeated_call(4) {
            tracing::warn!(
                repeats = ctx.consecutive_duplicates() + 1,
                "identical tool call repeated, injecting reflection"
            );
            messages.push(Message::user(DEDUP_HINT));
        }

        // Promote `_hint` fields buried in result JSON to a message of
        // their own so the model cannot miss them.
        if !hints.is_empty() {
            messages.push(Message::user(format!("[系统提示] {}", hints.join(" "))));
        }

        ctx.record_round_outcome(counts_failure);
        ctx.touch_activity();
        exec.broadcaster.emit_message_stop(session);
        false
    }

    // ── LLM streaming ─────────────────────────────────────────────

    async fn stream_llm(
        &self,
        exec: &ExecutionContext,
        ctx: &mut RuntimeContext,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> StreamOutcome {
        let session = &exec.session_id;
        let request = LlmRequest {
            messages,
            system: exec.system_prompt.clone(),
            tools,
            model: None,
            max_tokens: None,
        };
        let mut handler = ContentHandler::new(exec.broadcaster.as_ref(), session.clone());

        let stream = match exec.llm.create_message_stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "LLM stream failed to open");
                return StreamOutcome {
                    stop_reason: StopReason::StreamError,
                    usage: None,
                    cancelled: false,
                };
            }
        };
        let mut stream = pin!(stream);

        let mut stop_reason = StopReason::StreamError;
        let mut usage = None;
        let mut cancelled = false;

        while let Some(item) = stream.next().await {
            if exec.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            match item {
                Ok(LlmChunk::ThinkingDelta { text }) => {
                    handler.handle_thinking(&text);
                    ctx.touch_activity();
                }
                Ok(LlmChunk::TextDelta { text }) => {
                    handler.handle_text(&text);
                    ctx.touch_activity();
                }
                Ok(LlmChunk::ToolUseStart { id, name }) => {
                    handler.handle_tool_use_start(&id, &name);
                }
                Ok(LlmChunk::InputDelta { id, fragment }) => {
                    handler.handle_input_delta(&id, &fragment);
                }
                Ok(LlmChunk::ToolUseStop { id }) => {
                    if let Err(e) = handler.handle_tool_use_stop(&id) {
                        tracing::warn!(tool_id = %id, error = %e, "malformed tool input");
                    }
                }
                Ok(LlmChunk::Stop {
                    stop_reason: reason,
                    usage: u,
                }) => {
                    stop_reason = reason;
                    usage = u;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LLM stream interrupted");
                    stop_reason = StopReason::StreamError;
                    break;
                }
            }
        }

        if let Err(e) = handler.stop_current(None) {
            tracing::warn!(error = %e, "malformed trailing block");
        }

        StreamOutcome {
            stop_reason,
            usage,
            cancelled,
        }
    }

    // ── Termination helpers ───────────────────────────────────────

    fn emit_rollback_options(&self, exec: &ExecutionContext, reason: &str) {
        let options = exec
            .state_manager
            .as_ref()
            .map(|m| m.rollback_options(&exec.session_id))
            .unwrap_or_default();
        exec.broadcaster.emit(
            &exec.session_id,
            ExecEvent::RollbackOptions {
                task_id: exec.session_id.clone(),
                options,
                reason: reason.to_owned(),
            },
        );
    }

    fn handle_hitl_rejection(&self, exec: &ExecutionContext, ctx: &mut RuntimeContext) {
        ctx.finish_reason = Some(FinishReason::UserAbort);
        match self.config.hitl.on_rejection {
            OnRejection::Rollback => {
                let messages = exec
                    .state_manager
                    .as_ref()
                    .and_then(|m| {
                        m.snapshot_id_for_task(&exec.session_id)
                            .map(|sid| m.rollback(&sid))
                    })
                    .unwrap_or_default();
                exec.broadcaster.emit(
                    &exec.session_id,
                    ExecEvent::RollbackCompleted {
                        task_id: exec.session_id.clone(),
                        messages,
                    },
                );
                ctx.stop_reason = Some("hitl_rejected_rollback".into());
            }
            OnRejection::AskRollback => {
                self.emit_rollback_options(exec, "hitl_rejected");
                ctx.stop_reason = Some("hitl_rejected_ask_rollback".into());
            }
            OnRejection::Stop => {
                ctx.stop_reason = Some("hitl_rejected".into());
            }
        }
    }

    /// One extra no-tools LLM call that summarizes progress and why
    /// the loop stopped; a hard-coded line is the last resort.
    async fn termination_reply(
        &self,
        exec: &ExecutionContext,
        ctx: &mut RuntimeContext,
        messages: &mut Vec<Message>,
        reason: &str,
        usage: &mut UsageTracker,
    ) {
        let session = &exec.session_id;
        let hint = termination_reason_hint(reason);
        let mut final_messages = messages.clone();
        final_messages.push(Message::user(format!(
            "[系统提示] {hint}\n请简要总结你目前完成了哪些工作、还有什么未完成，\
             以及用户接下来可以怎么做。不要调用任何工具，直接回复用户。"
        )));

        let message_id = uuid::Uuid::new_v4().to_string();
        exec.broadcaster.start_message(session, &message_id);
        let outcome = self
            .stream_llm(exec, ctx, final_messages, Vec::new())
            .await;
        if let Some(u) = &outcome.usage {
            usage.accumulate(u);
            exec.broadcaster.accumulate_usage(session, u);
        }

        let text = exec.broadcaster.text_content(session);
        if outcome.stop_reason != StopReason::StreamError && !text.trim().is_empty() {
            messages.push(Message::assistant(text.clone()));
            ctx.set_completed(text, reason);
        } else {
            tracing::warn!("termination reply failed, sending fallback text");
            let fallback = format!("{hint}{FALLBACK_FINAL_TEXT}");
            let mut handler = ContentHandler::new(exec.broadcaster.as_ref(), session.clone());
            handler.handle_text(&fallback);
            let _ = handler.stop_current(None);
            messages.push(Message::assistant(fallback.clone()));
            ctx.set_completed(fallback, "fallback");
        }
        exec.broadcaster.emit_message_stop(session);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token estimation through the LLM adapter's tokenizer.
struct LlmTokenEstimator {
    llm: Arc<dyn LlmService>,
}

impl TokenEstimator for LlmTokenEstimator {
    fn count(&self, text: &str) -> usize {
        self.llm.count_tokens(text)
    }
}

fn termination_reason_hint(reason: &str) -> &'static str {
    match reason {
        "max_turns" => "已达到最大执行轮次。",
        "max_duration" => "任务执行时间较长，已自动暂停。",
        "idle_timeout" => "执行过程中等待超时。",
        "consecutive_failures" => "连续多次执行失败。",
        "user_stop" => "用户已请求停止。",
        "hitl_no_confirm" => "有操作需要用户确认，但当前无法获取确认，已暂停。",
        _ => "任务已暂停。",
    }
}

/// History keeps text and tool_use; thinking stays on the live stream.
fn history_blocks(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter(|b| !matches!(b, ContentBlock::Thinking { .. }))
        .filter(|b| !b.is_tool_result())
        .collect()
}

/// Prune failed tools from the request; never hand the model an empty
/// tool list.
fn effective_tools(tools: &[ToolDefinition], state: &RvrbState) -> Vec<ToolDefinition> {
    if state.pruned_tools.is_empty() {
        return tools.to_vec();
    }
    let filtered: Vec<ToolDefinition> = tools
        .iter()
        .filter(|t| !state.pruned_tools.contains(&t.name))
        .cloned()
        .collect();
    if filtered.is_empty() {
        tracing::warn!("all tools pruned, keeping the full list");
        tools.to_vec()
    } else {
        filtered
    }
}

fn append_to_last_user(messages: &mut [Message], text: &str) {
    use relay_domain::{MessageContent, Role};
    if let Some(message) = messages.iter_mut().rev().find(|m| m.role == Role::User) {
        match &mut message.content {
            MessageContent::Text(existing) => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
            MessageContent::Blocks(blocks) => {
                blocks.push(ContentBlock::text(text));
            }
        }
    }
}

fn compressed_content(
    content: ToolResultContent,
    config: &CoreConfig,
) -> ToolResultContent {
    match content {
        ToolResultContent::Text(t) => ToolResultContent::Text(compress_fresh_tool_result(
            &t,
            config.compaction.fresh_result_max_chars,
        )),
        // Multimodal results pass through untouched.
        blocks => blocks,
    }
}

/// Pull `_hint` fields out of tool-result JSON (top level or nested
/// under `result`).
fn extract_tool_hints(blocks: &[ContentBlock]) -> Vec<String> {
    let mut hints = Vec::new();
    for block in blocks {
        let ContentBlock::ToolResult { content, .. } = block else {
            continue;
        };
        let ToolResultContent::Text(text) = content else {
            continue;
        };
        if !text.contains("_hint") {
            continue;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            continue;
        };
        let hint = value
            .get("_hint")
            .or_else(|| value.get("result").and_then(|r| r.get("_hint")))
            .or_else(|| value.get("_force_execute_hint"))
            .and_then(|v| v.as_str());
        if let Some(hint) = hint {
            hints.push(hint.to_owned());
        }
    }
    hints
}

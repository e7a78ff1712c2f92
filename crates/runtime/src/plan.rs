//! Plan tool handler — convergence control for the model's todo list.
//!
//! Repeated re-planning is a classic failure loop: the model keeps
//! rewriting a nearly identical plan instead of executing it. The
//! handler tracks consecutive plan calls and the Jaccard similarity of
//! successive todo lists, injects a force-execute hint when planning
//! converges, and compresses the replaced plan to a one-line summary
//! so stale plan text stops costing tokens.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use relay_domain::{ToolCall, ToolExecutionResult, ToolResultValue};

use crate::flow::{SpecialToolHandler, ToolContext, ToolExecutor};

/// Consecutive create/update calls beyond this inject the hint.
const MAX_CONSECUTIVE_PLANS: u32 = 2;
/// Title-set Jaccard similarity above this counts as convergence.
const PLAN_CONVERGENCE_THRESHOLD: f64 = 0.8;

const PLAN_FORCE_EXECUTE_HINT: &str =
    "[SYSTEM] 你已连续规划多次，请立即执行当前 Plan 的第一个未完成步骤，不要再修改 Plan。";

/// Shared cache of the session's current plan, read by the executor
/// for per-turn injection.
pub type PlanCache = Arc<Mutex<Option<serde_json::Value>>>;

pub fn new_plan_cache() -> PlanCache {
    Arc::new(Mutex::new(None))
}

#[derive(Default)]
struct PlanTracking {
    consecutive_plan_calls: u32,
    last_todo_titles: HashSet<String>,
}

/// Special handler for the `plan` tool.
pub struct PlanHandler {
    executor: Arc<dyn ToolExecutor>,
    plan_cache: PlanCache,
    tracking: Mutex<PlanTracking>,
}

impl PlanHandler {
    pub fn new(executor: Arc<dyn ToolExecutor>, plan_cache: PlanCache) -> Self {
        Self {
            executor,
            plan_cache,
            tracking: Mutex::new(PlanTracking::default()),
        }
    }
}

#[async_trait::async_trait]
impl SpecialToolHandler for PlanHandler {
    fn tool_name(&self) -> &str {
        "plan"
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolExecutionResult {
        let action = call
            .input
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_owned();

        let mut force_execute = false;
        {
            let mut tracking = self.tracking.lock();
            if action == "create" || action == "update" {
                tracking.consecutive_plan_calls += 1;
            }
            if action == "create" {
                let new_titles = todo_titles(call.input.get("todos"));
                if !tracking.last_todo_titles.is_empty()
                    && jaccard(&tracking.last_todo_titles, &new_titles)
                        > PLAN_CONVERGENCE_THRESHOLD
                {
                    tracing::warn!("plan convergence detected, forcing execution");
                    force_execute = true;
                }
                tracking.last_todo_titles = new_titles;
            }
            if tracking.consecutive_plan_calls > MAX_CONSECUTIVE_PLANS {
                tracing::warn!(
                    count = tracking.consecutive_plan_calls,
                    "consecutive plan cap reached, forcing execution"
                );
                force_execute = true;
            }
        }

        // Summarize the plan being replaced before it leaves the cache.
        let old_plan_summary = if action == "create" {
            self.plan_cache.lock().as_ref().map(summarize_plan)
        } else {
            None
        };

        let result = match self.executor.execute("plan", &call.input).await {
            Ok(value) => value,
            Err(e) => {
                return ToolExecutionResult::error(
                    &call.id,
                    "plan",
                    call.input.clone(),
                    e.to_string(),
                );
            }
        };

        let mut body = match result {
            ToolResultValue::Json(v) => v,
            ToolResultValue::Text(t) => serde_json::from_str(&t)
                .unwrap_or_else(|_| serde_json::json!({ "output": t })),
            ToolResultValue::Blocks(_) => serde_json::json!({}),
        };

        if body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            if let Some(plan) = body.get("plan") {
                *self.plan_cache.lock() = Some(plan.clone());
                tracing::info!(action = %action, "plan cache updated");
            }
        }

        if let Some(obj) = body.as_object_mut() {
            if let Some(summary) = old_plan_summary {
                obj.insert("_old_plan_summary".into(), serde_json::json!(summary));
            }
            if force_execute {
                obj.insert(
                    "_force_execute_hint".into(),
                    serde_json::json!(PLAN_FORCE_EXECUTE_HINT),
                );
            }
        }

        ToolExecutionResult::ok(&call.id, "plan", call.input.clone(), ToolResultValue::Json(body))
    }

    fn on_other_tool(&self) {
        self.tracking.lock().consecutive_plan_calls = 0;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn status_glyph(status: &str) -> &'static str {
    match status {
        "completed" => "✓",
        "in_progress" => "→",
        "failed" => "✗",
        _ => "○",
    }
}

fn todo_title(todo: &serde_json::Value) -> String {
    todo.get("title")
        .or_else(|| todo.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned()
}

fn todo_titles(todos: Option<&serde_json::Value>) -> HashSet<String> {
    todos
        .and_then(|v| v.as_array())
        .map(|items| items.iter().map(todo_title).collect())
        .unwrap_or_default()
}

/// Code-based one-line summary of a plan (no LLM call): name, per-todo
/// status glyph, completion fraction. Embedded in the replacing tool
/// result so the full old plan can leave the context.
pub fn summarize_plan(plan: &serde_json::Value) -> String {
    let name = plan
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("未命名计划");
    let Some(todos) = plan.get("todos").and_then(|v| v.as_array()) else {
        return format!("[旧计划] {name}（无步骤）");
    };
    if todos.is_empty() {
        return format!("[旧计划] {name}（无步骤）");
    }

    let total = todos.len();
    let completed = todos
        .iter()
        .filter(|t| t.get("status").and_then(|v| v.as_str()) == Some("completed"))
        .count();
    let parts: Vec<String> = todos
        .iter()
        .map(|t| {
            let glyph = status_glyph(t.get("status").and_then(|v| v.as_str()).unwrap_or("pending"));
            let title: String = todo_title(t).chars().take(20).collect();
            format!("{glyph}{title}")
        })
        .collect();

    format!("[旧计划] {name}（{completed}/{total} 完成）: {}", parts.join(", "))
}

/// Render the active plan for per-turn injection into the last user
/// message: current objective plus progress.
pub fn render_plan_for_injection(plan: &serde_json::Value) -> String {
    let name = plan
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("当前计划");
    let Some(todos) = plan.get("todos").and_then(|v| v.as_array()) else {
        return format!("[当前计划] {name}");
    };

    let total = todos.len();
    let completed = todos
        .iter()
        .filter(|t| t.get("status").and_then(|v| v.as_str()) == Some("completed"))
        .count();
    let current = todos
        .iter()
        .find(|t| {
            !matches!(
                t.get("status").and_then(|v| v.as_str()),
                Some("completed") | Some("failed")
            )
        })
        .map(todo_title);

    let mut out = format!("[当前计划] {name}（{completed}/{total} 完成）");
    if let Some(step) = current {
        out.push_str(&format!("，当前步骤: {step}"));
    }
    out
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::Result;

    /// Plan-tool stub that always succeeds and echoes a plan.
    struct PlanTool;

    #[async_trait::async_trait]
    impl ToolExecutor for PlanTool {
        async fn execute(
            &self,
            _tool_name: &str,
            tool_input: &serde_json::Value,
        ) -> Result<ToolResultValue> {
            Ok(ToolResultValue::Json(serde_json::json!({
                "success": true,
                "plan": {
                    "name": "分析任务",
                    "todos": tool_input.get("todos").cloned().unwrap_or(serde_json::json!([])),
                },
            })))
        }
    }

    fn create_call(id: &str, titles: &[&str]) -> ToolCall {
        let todos: Vec<serde_json::Value> = titles
            .iter()
            .map(|t| serde_json::json!({"title": t, "status": "pending"}))
            .collect();
        ToolCall {
            id: id.into(),
            name: "plan".into(),
            input: serde_json::json!({"action": "create", "todos": todos}),
        }
    }

    fn handler() -> (PlanHandler, PlanCache) {
        let cache = new_plan_cache();
        (PlanHandler::new(Arc::new(PlanTool), cache.clone()), cache)
    }

    #[tokio::test]
    async fn plan_result_updates_cache() {
        let (handler, cache) = handler();
        let ctx = ToolContext::new("s1", "c1");
        handler
            .execute(&create_call("t1", &["清洗数据", "出报告"]), &ctx)
            .await;
        assert!(cache.lock().is_some());
    }

    #[tokio::test]
    async fn convergent_replan_injects_force_hint() {
        let (handler, _cache) = handler();
        let ctx = ToolContext::new("s1", "c1");

        handler
            .execute(&create_call("t1", &["a", "b", "c", "d", "e"]), &ctx)
            .await;
        // Nearly identical titles → Jaccard > 0.8.
        let second = handler
            .execute(&create_call("t2", &["a", "b", "c", "d", "e"]), &ctx)
            .await;

        let body = match &second.result {
            ToolResultValue::Json(v) => v.clone(),
            other => panic!("expected json, got {other:?}"),
        };
        assert!(body.get("_force_execute_hint").is_some());
    }

    #[tokio::test]
    async fn consecutive_plan_cap_injects_hint_and_resets_on_other_tool() {
        let (handler, _cache) = handler();
        let ctx = ToolContext::new("s1", "c1");

        // Three distinct plans in a row trip the consecutive cap.
        handler.execute(&create_call("t1", &["a1", "b1"]), &ctx).await;
        handler.execute(&create_call("t2", &["a2", "b2"]), &ctx).await;
        let third = handler.execute(&create_call("t3", &["a3", "b3"]), &ctx).await;
        let body = match &third.result {
            ToolResultValue::Json(v) => v.clone(),
            other => panic!("expected json, got {other:?}"),
        };
        assert!(body.get("_force_execute_hint").is_some());

        // A non-plan tool resets the counter.
        handler.on_other_tool();
        let after = handler.execute(&create_call("t4", &["x", "y"]), &ctx).await;
        let body = match &after.result {
            ToolResultValue::Json(v) => v.clone(),
            other => panic!("expected json, got {other:?}"),
        };
        assert!(body.get("_force_execute_hint").is_none());
    }

    #[tokio::test]
    async fn replacing_plan_carries_old_summary() {
        let (handler, _cache) = handler();
        let ctx = ToolContext::new("s1", "c1");
        handler.execute(&create_call("t1", &["清洗", "分析"]), &ctx).await;
        let second = handler.execute(&create_call("t2", &["完全", "不同"]), &ctx).await;
        let body = match &second.result {
            ToolResultValue::Json(v) => v.clone(),
            other => panic!("expected json, got {other:?}"),
        };
        let summary = body["_old_plan_summary"].as_str().unwrap();
        assert!(summary.starts_with("[旧计划]"));
        assert!(summary.contains("0/2"));
    }

    #[test]
    fn summarize_plan_with_glyphs() {
        let plan = serde_json::json!({
            "name": "季度销售分析",
            "todos": [
                {"title": "清洗", "status": "completed"},
                {"title": "分析", "status": "in_progress"},
                {"title": "排名", "status": "failed"},
                {"title": "报告", "status": "pending"},
            ]
        });
        let summary = summarize_plan(&plan);
        assert!(summary.contains("季度销售分析"));
        assert!(summary.contains("1/4"));
        assert!(summary.contains("✓清洗"));
        assert!(summary.contains("→分析"));
        assert!(summary.contains("✗排名"));
        assert!(summary.contains("○报告"));
    }

    #[test]
    fn render_injection_names_current_step() {
        let plan = serde_json::json!({
            "name": "迁移",
            "todos": [
                {"title": "备份", "status": "completed"},
                {"title": "切换", "status": "pending"},
            ]
        });
        let rendered = render_plan_for_injection(&plan);
        assert!(rendered.contains("1/2"));
        assert!(rendered.contains("切换"));
    }

    #[test]
    fn jaccard_edges() {
        let empty: HashSet<String> = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 1.0);

        let a: HashSet<String> = ["x".to_string()].into_iter().collect();
        assert_eq!(jaccard(&a, &empty), 0.0);
        assert_eq!(jaccard(&a, &a.clone()), 1.0);
    }
}

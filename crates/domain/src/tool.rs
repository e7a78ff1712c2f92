use serde::{Deserialize, Serialize};

use crate::block::{ContentBlock, ToolResultContent};

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// What a tool execution produced. Tools may return a pre-serialized
/// string, a structured value, or a list of content blocks for
/// multimodal output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultValue {
    Text(String),
    Json(serde_json::Value),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultValue {
    /// Normalize for a tool_result block: strings pass through, block
    /// lists pass through for multimodal, anything else is serialized
    /// with stable key order.
    pub fn into_result_content(self) -> ToolResultContent {
        match self {
            ToolResultValue::Text(t) => ToolResultContent::Text(t),
            ToolResultValue::Blocks(blocks) => ToolResultContent::Blocks(blocks),
            ToolResultValue::Json(v) => ToolResultContent::Text(stable_json_string(&v)),
        }
    }

    /// Flatten to a string for logs and failure briefs.
    pub fn to_display_string(&self) -> String {
        match self {
            ToolResultValue::Text(t) => t.clone(),
            ToolResultValue::Json(v) => stable_json_string(v),
            ToolResultValue::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => Some("[image]"),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// The outcome of executing one tool call. Errors are values, never
/// propagated as `Err` — the flow turns every failure into
/// `is_error = true` plus a stringified message.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub tool_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub result: ToolResultValue,
    pub is_error: bool,
    pub error_msg: Option<String>,
}

impl ToolExecutionResult {
    pub fn ok(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        result: ToolResultValue,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            tool_name: tool_name.into(),
            tool_input,
            result,
            is_error: false,
            error_msg: None,
        }
    }

    pub fn error(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            tool_id: tool_id.into(),
            tool_name: tool_name.into(),
            tool_input,
            result: ToolResultValue::Json(serde_json::json!({ "error": message })),
            is_error: true,
            error_msg: Some(message),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stable JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize with recursively sorted object keys. Used for tool-call
/// signatures and anywhere the serialized form must be deterministic
/// across runs (keeps prompt prefixes byte-stable for KV caching).
pub fn stable_json_string(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), canonicalize(&map[k]));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

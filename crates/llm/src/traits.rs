use std::pin::Pin;

use serde::{Deserialize, Serialize};

use relay_domain::{Message, Result, ToolCall, ToolDefinition};

use crate::usage::Usage;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// Synthetic: the stream dropped mid-response. Partial tool_use
    /// blocks from such a response must be discarded.
    StreamError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StreamError => "stream_error",
        }
    }
}

/// One streamed event from the provider, already translated out of the
/// provider's wire format.
#[derive(Debug, Clone)]
pub enum LlmChunk {
    ThinkingDelta {
        text: String,
    },
    TextDelta {
        text: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    /// A fragment of the tool input JSON for the identified tool_use.
    InputDelta {
        id: String,
        fragment: String,
    },
    ToolUseStop {
        id: String,
    },
    /// Terminal chunk of a response.
    Stop {
        stop_reason: StopReason,
        usage: Option<Usage>,
    },
}

/// A provider-agnostic message-creation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub system: String,
    pub tools: Vec<ToolDefinition>,
    /// Model override. `None` uses the adapter's default.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>, system: impl Into<String>) -> Self {
        Self {
            messages,
            system: system.into(),
            tools: Vec::new(),
            model: None,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// A fully assembled (non-streaming) response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>, stop_reason: StopReason) -> Self {
        Self {
            content: content.into(),
            thinking: None,
            tool_calls: Vec::new(),
            stop_reason,
            usage: None,
        }
    }
}

/// Trait every LLM adapter implements. Shared read-only across
/// sessions; adapters must be internally thread-safe.
#[async_trait::async_trait]
pub trait LlmService: Send + Sync {
    /// Stream a response as provider-agnostic chunks. A mid-stream
    /// transport failure surfaces as an `Err` item; the executor
    /// synthesizes `StopReason::StreamError` from it.
    async fn create_message_stream(
        &self,
        req: LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmChunk>>>;

    /// Non-streaming fallback.
    async fn create_message(&self, req: LlmRequest) -> Result<LlmResponse>;

    /// Deterministic, O(n)-over-characters token estimate. Adapters
    /// with a real tokenizer override this; the default is the
    /// standard ~4-chars-per-token heuristic.
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count() / 4 + 1
    }

    /// Model name used for pricing lookups, when known.
    fn model_name(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token_count_is_deterministic() {
        struct Nop;
        #[async_trait::async_trait]
        impl LlmService for Nop {
            async fn create_message_stream(
                &self,
                _req: LlmRequest,
            ) -> Result<BoxStream<'static, Result<LlmChunk>>> {
                unimplemented!("not used in this test")
            }
            async fn create_message(&self, _req: LlmRequest) -> Result<LlmResponse> {
                unimplemented!("not used in this test")
            }
        }

        let svc = Nop;
        assert_eq!(svc.count_tokens(""), 1);
        assert_eq!(svc.count_tokens("abcd"), 2);
        assert_eq!(svc.count_tokens("abcd"), svc.count_tokens("abcd"));
        // Multi-byte chars count as chars, not bytes.
        assert_eq!(svc.count_tokens("日本語です"), 2);
    }

    #[test]
    fn stop_reason_strings() {
        assert_eq!(StopReason::EndTurn.as_str(), "end_turn");
        assert_eq!(StopReason::StreamError.as_str(), "stream_error");
        let json = serde_json::to_string(&StopReason::ToolUse).unwrap();
        assert_eq!(json, "\"tool_use\"");
    }
}

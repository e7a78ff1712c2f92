use std::collections::HashMap;

use relay_domain::{ContentBlock, Result, ToolResultContent};

use crate::accumulator::BlockKind;
use crate::broadcaster::EventBroadcaster;
use crate::event::ExecEvent;

/// Per-session adapter between the LLM chunk stream and the
/// broadcaster's block operations.
///
/// Streaming and non-streaming are only different event sequences:
/// non-streaming is `content_start → content_stop`; streaming inserts
/// `content_delta × N` in between. The handler tracks block-type
/// transitions (text → thinking → tool_use) and keeps the id → index
/// map that lets interleaved tool-input deltas reach the right block.
pub struct ContentHandler<'a> {
    broadcaster: &'a EventBroadcaster,
    session_id: String,
    current_kind: Option<BlockKind>,
    tool_indices: HashMap<String, usize>,
}

impl<'a> ContentHandler<'a> {
    pub fn new(broadcaster: &'a EventBroadcaster, session_id: impl Into<String>) -> Self {
        Self {
            broadcaster,
            session_id: session_id.into(),
            current_kind: None,
            tool_indices: HashMap::new(),
        }
    }

    /// Thinking delta; opens a thinking block on type transition.
    pub fn handle_thinking(&mut self, text: &str) {
        if self.current_kind != Some(BlockKind::Thinking) {
            self.broadcaster.start_block(
                &self.session_id,
                ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            );
            self.current_kind = Some(BlockKind::Thinking);
        }
        self.broadcaster.delta(&self.session_id, text);
        self.broadcaster.emit(
            &self.session_id,
            ExecEvent::ThinkingDelta {
                text: text.to_owned(),
            },
        );
    }

    /// Text delta; opens a text block on type transition.
    pub fn handle_text(&mut self, text: &str) {
        if self.current_kind != Some(BlockKind::Text) {
            self.broadcaster
                .start_block(&self.session_id, ContentBlock::text(""));
            self.current_kind = Some(BlockKind::Text);
        }
        self.broadcaster.delta(&self.session_id, text);
    }

    /// A tool_use block opened by the provider.
    pub fn handle_tool_use_start(&mut self, id: &str, name: &str) {
        let index = self.broadcaster.start_block(
            &self.session_id,
            ContentBlock::ToolUse {
                id: id.to_owned(),
                name: name.to_owned(),
                input: serde_json::json!({}),
            },
        );
        self.tool_indices.insert(id.to_owned(), index);
        self.current_kind = Some(BlockKind::ToolUse);
        self.broadcaster.emit(
            &self.session_id,
            ExecEvent::ToolUseStart {
                id: id.to_owned(),
                name: name.to_owned(),
            },
        );
    }

    /// A fragment of tool input JSON, routed by tool id so providers
    /// may interleave multiple in-flight tools.
    pub fn handle_input_delta(&mut self, id: &str, fragment: &str) {
        match self.tool_indices.get(id) {
            Some(&index) => self.broadcaster.delta_at(&self.session_id, index, fragment),
            None => {
                tracing::warn!(tool_id = id, "input delta for unknown tool_use");
                return;
            }
        }
        self.broadcaster.emit(
            &self.session_id,
            ExecEvent::InputDelta {
                fragment: fragment.to_owned(),
            },
        );
    }

    /// Close the tool_use block for `id`. Surfaces a protocol error
    /// when the accumulated input never parsed as JSON.
    pub fn handle_tool_use_stop(&mut self, id: &str) -> Result<()> {
        if let Some(&index) = self.tool_indices.get(id) {
            if self.broadcaster.current_block_index(&self.session_id) == Some(index) {
                self.current_kind = None;
            }
            return self.broadcaster.stop_block_at(&self.session_id, index, None);
        }
        Ok(())
    }

    /// Close whatever block is open (end of stream). A no-op when
    /// everything is already closed.
    pub fn stop_current(&mut self, signature: Option<String>) -> Result<()> {
        self.current_kind = None;
        if self.broadcaster.current_block_index(&self.session_id).is_none() {
            return Ok(());
        }
        self.broadcaster.stop_block(&self.session_id, signature)
    }

    /// Emit a complete tool_result block (atomic start+stop).
    pub fn emit_tool_result(&mut self, tool_use_id: &str, content: ToolResultContent, is_error: bool) {
        self.current_kind = None;
        self.broadcaster.emit_block(
            &self.session_id,
            ContentBlock::ToolResult {
                tool_use_id: tool_use_id.to_owned(),
                content,
                is_error,
            },
        );
    }
}

use std::collections::HashMap;

use relay_domain::{ContentBlock, Error, Result, ToolCall, ToolResultContent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BlockState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Kind tag used by the block state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
}

impl BlockKind {
    pub fn of(block: &ContentBlock) -> Self {
        match block {
            ContentBlock::Text { .. } => BlockKind::Text,
            ContentBlock::Thinking { .. } => BlockKind::Thinking,
            ContentBlock::ToolUse { .. } => BlockKind::ToolUse,
            ContentBlock::ToolResult { .. } => BlockKind::ToolResult,
            // Images only occur nested inside tool results.
            ContentBlock::Image { .. } => BlockKind::ToolResult,
        }
    }
}

/// State machine for content_start / content_delta / content_stop.
///
/// Invariant: at most one block is "current"; opening a new block while
/// one is open requires closing the old one first. Indices are strictly
/// increasing within a message.
#[derive(Debug, Default)]
pub struct BlockState {
    next_index: usize,
    current_type: Option<BlockKind>,
    current_index: Option<usize>,
}

impl BlockState {
    pub fn start_new_block(&mut self, kind: BlockKind) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.current_type = Some(kind);
        self.current_index = Some(index);
        index
    }

    pub fn close_current_block(&mut self) -> Option<usize> {
        self.current_type.take()?;
        self.current_index.take()
    }

    pub fn is_block_open(&self) -> bool {
        self.current_type.is_some()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_type(&self) -> Option<BlockKind> {
        self.current_type
    }

    pub fn needs_transition(&self, kind: BlockKind) -> bool {
        self.current_type != Some(kind)
    }

    pub fn reset(&mut self) {
        *self = BlockState::default();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-block buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-flight accumulation context for one block index. Chunks are kept
/// as a Vec and joined lazily to avoid repeated reallocation on long
/// streams.
#[derive(Debug)]
struct BlockBuffer {
    kind: BlockKind,
    chunks: Vec<String>,
    /// tool_use only: id, name, and the input once it parses.
    tool_use: Option<(String, String, serde_json::Value)>,
    /// tool_use only: unparsed input JSON fragments.
    input_chunks: Vec<String>,
    /// tool_result only: target id + error flag.
    tool_result: Option<(String, bool)>,
}

impl BlockBuffer {
    fn content(&self) -> String {
        self.chunks.concat()
    }

    fn input_buffer(&self) -> String {
        self.input_chunks.concat()
    }

    /// Try to parse the accumulated input fragments; on success the
    /// parsed object replaces the fragment buffer.
    fn try_parse_tool_input(&mut self) {
        if self.input_chunks.is_empty() {
            return;
        }
        let Some((_, _, input)) = self.tool_use.as_mut() else {
            return;
        };
        let buffer = self.input_chunks.concat();
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&buffer) {
            *input = value;
            self.input_chunks.clear();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContentAccumulator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Folds streaming block events into an ordered list of typed content
/// blocks. Multiple blocks may be in flight with different indices
/// (providers can stream two tools concurrently); each index gets an
/// independent buffer.
#[derive(Debug, Default)]
pub struct ContentAccumulator {
    completed: Vec<(usize, ContentBlock)>,
    active: HashMap<usize, BlockBuffer>,
}

impl ContentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a block at `index` from its initial shape.
    pub fn on_content_start(&mut self, index: usize, initial: &ContentBlock) {
        let buffer = match initial {
            ContentBlock::Text { text } => BlockBuffer {
                kind: BlockKind::Text,
                chunks: if text.is_empty() {
                    Vec::new()
                } else {
                    vec![text.clone()]
                },
                tool_use: None,
                input_chunks: Vec::new(),
                tool_result: None,
            },
            ContentBlock::Thinking { thinking, .. } => BlockBuffer {
                kind: BlockKind::Thinking,
                chunks: if thinking.is_empty() {
                    Vec::new()
                } else {
                    vec![thinking.clone()]
                },
                tool_use: None,
                input_chunks: Vec::new(),
                tool_result: None,
            },
            ContentBlock::ToolUse { id, name, input } => BlockBuffer {
                kind: BlockKind::ToolUse,
                chunks: Vec::new(),
                tool_use: Some((id.clone(), name.clone(), input.clone())),
                input_chunks: Vec::new(),
                tool_result: None,
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Complete-at-start tool results (the non-streaming
                // emit_block path) go straight to the completed list.
                match content {
                    ToolResultContent::Text(t) if t.is_empty() => BlockBuffer {
                        kind: BlockKind::ToolResult,
                        chunks: Vec::new(),
                        tool_use: None,
                        input_chunks: Vec::new(),
                        tool_result: Some((tool_use_id.clone(), *is_error)),
                    },
                    _ => {
                        self.completed.push((index, initial.clone()));
                        return;
                    }
                }
            }
            ContentBlock::Image { .. } => {
                self.completed.push((index, initial.clone()));
                return;
            }
        };
        self.active.insert(index, buffer);
    }

    /// Append a delta to the block at `index`. Unknown or already
    /// finished indices are ignored.
    pub fn on_content_delta(&mut self, index: usize, delta: &str) {
        let Some(buffer) = self.active.get_mut(&index) else {
            return;
        };
        match buffer.kind {
            BlockKind::Text | BlockKind::Thinking | BlockKind::ToolResult => {
                buffer.chunks.push(delta.to_string());
            }
            BlockKind::ToolUse => {
                buffer.input_chunks.push(delta.to_string());
                buffer.try_parse_tool_input();
            }
        }
    }

    /// Close the block at `index` and move it to the completed list.
    ///
    /// For tool_use blocks, any remaining unparsed input is parsed one
    /// last time; failure means the model emitted malformed tool input,
    /// surfaced as a protocol error.
    pub fn on_content_stop(&mut self, index: usize, signature: Option<String>) -> Result<()> {
        let Some(mut buffer) = self.active.remove(&index) else {
            return Ok(());
        };

        let block = match buffer.kind {
            BlockKind::Thinking => {
                let thinking = buffer.content();
                if thinking.is_empty() {
                    return Ok(());
                }
                ContentBlock::Thinking {
                    thinking,
                    signature,
                }
            }
            BlockKind::Text => {
                let text = buffer.content();
                if text.is_empty() {
                    return Ok(());
                }
                ContentBlock::Text { text }
            }
            BlockKind::ToolUse => {
                buffer.try_parse_tool_input();
                let (id, name, input) = buffer
                    .tool_use
                    .take()
                    .expect("tool_use buffer always carries id/name");
                if !buffer.input_chunks.is_empty() {
                    // Malformed input: the block stays (so pairing with
                    // its eventual error result holds) with the raw
                    // fragments preserved, and the protocol violation
                    // is reported to the executor.
                    let raw = buffer.input_buffer();
                    let preview: String = raw.chars().take(120).collect();
                    self.completed.push((
                        index,
                        ContentBlock::ToolUse {
                            id,
                            name,
                            input: serde_json::json!({ "_raw_input": raw }),
                        },
                    ));
                    return Err(Error::Protocol(format!(
                        "tool input parse failed at block {index}: {preview}"
                    )));
                }
                ContentBlock::ToolUse { id, name, input }
            }
            BlockKind::ToolResult => {
                let (tool_use_id, is_error) = buffer
                    .tool_result
                    .take()
                    .expect("tool_result buffer always carries target id");
                ContentBlock::ToolResult {
                    tool_use_id,
                    content: ToolResultContent::Text(buffer.content()),
                    is_error,
                }
            }
        };

        self.completed.push((index, block));
        Ok(())
    }

    /// Discard an in-flight block without completing it. Used when the
    /// LLM stream errors mid-block so malformed partials never reach
    /// the persisted message.
    pub fn abort_block(&mut self, index: usize) {
        self.active.remove(&index);
    }

    /// Discard every in-flight tool_use block (stream_error recovery).
    /// Returns the indices that were dropped.
    pub fn abort_incomplete_tool_uses(&mut self) -> Vec<usize> {
        let doomed: Vec<usize> = self
            .active
            .iter()
            .filter(|(_, b)| b.kind == BlockKind::ToolUse)
            .map(|(i, _)| *i)
            .collect();
        for index in &doomed {
            self.active.remove(index);
        }
        doomed
    }

    /// Complete the turn: flush all remaining in-flight blocks (best
    /// effort) and return every block ordered by index.
    pub fn finish_turn(&mut self) -> Vec<ContentBlock> {
        let indices: Vec<usize> = self.active.keys().copied().collect();
        for index in indices {
            if self.on_content_stop(index, None).is_err() {
                tracing::warn!(index, "malformed tool_use at turn end");
            }
        }
        self.completed.sort_by_key(|(i, _)| *i);
        self.completed.iter().map(|(_, b)| b.clone()).collect()
    }

    /// All completed tool calls, ordered by index.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        let mut blocks: Vec<&(usize, ContentBlock)> = self.completed.iter().collect();
        blocks.sort_by_key(|(i, _)| *i);
        blocks
            .into_iter()
            .filter_map(|(_, b)| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of all completed text blocks.
    pub fn text_content(&self) -> String {
        let mut blocks: Vec<&(usize, ContentBlock)> = self.completed.iter().collect();
        blocks.sort_by_key(|(i, _)| *i);
        blocks
            .into_iter()
            .filter_map(|(_, b)| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Blocks for persistence: ordered, thinking stripped (providers
    /// disallow replaying thinking, so it only lives on the live
    /// stream).
    pub fn build_persisted(&self) -> Vec<ContentBlock> {
        let mut blocks: Vec<&(usize, ContentBlock)> = self.completed.iter().collect();
        blocks.sort_by_key(|(i, _)| *i);
        blocks
            .into_iter()
            .filter(|(_, b)| !matches!(b, ContentBlock::Thinking { .. }))
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn has_content(&self) -> bool {
        !self.completed.is_empty() || !self.active.is_empty()
    }

    pub fn reset(&mut self) {
        self.completed.clear();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_use_start(id: &str, name: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input: serde_json::json!({}),
        }
    }

    #[test]
    fn block_state_indices_strictly_increase() {
        let mut state = BlockState::default();
        let a = state.start_new_block(BlockKind::Text);
        assert!(state.is_block_open());
        assert_eq!(state.close_current_block(), Some(a));
        let b = state.start_new_block(BlockKind::ToolUse);
        assert!(b > a);
        assert!(state.needs_transition(BlockKind::Text));
        assert!(!state.needs_transition(BlockKind::ToolUse));
    }

    #[test]
    fn text_accumulation() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &ContentBlock::text(""));
        acc.on_content_delta(0, "hel");
        acc.on_content_delta(0, "lo");
        acc.on_content_stop(0, None).unwrap();
        assert_eq!(acc.text_content(), "hello");
    }

    #[test]
    fn streamed_tool_input_parses_incrementally() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &tool_use_start("t1", "read_file"));
        acc.on_content_delta(0, "{\"path\": ");
        acc.on_content_delta(0, "\"/tmp/a.txt\"}");
        acc.on_content_stop(0, None).unwrap();

        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].input["path"], "/tmp/a.txt");
    }

    #[test]
    fn malformed_tool_input_is_a_protocol_error_but_keeps_block() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &tool_use_start("t1", "exec"));
        acc.on_content_delta(0, "{\"command\": \"ls\"");
        let err = acc.on_content_stop(0, None).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // The block survives with its raw fragments so the eventual
        // error tool_result still has a tool_use to pair with.
        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].input.get("_raw_input").is_some());
    }

    #[test]
    fn parallel_blocks_interleave_by_index() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &tool_use_start("t1", "plan"));
        acc.on_content_start(1, &tool_use_start("t2", "exec"));
        acc.on_content_delta(0, "{\"action\": \"create\"}");
        acc.on_content_delta(1, "{\"command\": \"ls\"}");
        acc.on_content_stop(1, None).unwrap();
        acc.on_content_stop(0, None).unwrap();

        let calls = acc.tool_calls();
        // Ordered by index, not by completion order.
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[1].id, "t2");
    }

    #[test]
    fn abort_discards_partial_block() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &ContentBlock::text(""));
        acc.on_content_delta(0, "partial");
        acc.on_content_start(1, &tool_use_start("t1", "exec"));
        acc.on_content_delta(1, "{\"comm");

        let dropped = acc.abort_incomplete_tool_uses();
        assert_eq!(dropped, vec![1]);
        let blocks = acc.finish_turn();
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "partial"));
    }

    #[test]
    fn empty_text_block_is_dropped_at_stop() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &ContentBlock::text(""));
        acc.on_content_stop(0, None).unwrap();
        assert!(acc.finish_turn().is_empty());
    }

    #[test]
    fn thinking_is_stripped_from_persisted_blocks() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(
            0,
            &ContentBlock::Thinking {
                thinking: "".into(),
                signature: None,
            },
        );
        acc.on_content_delta(0, "pondering");
        acc.on_content_stop(0, Some("sig".into())).unwrap();
        acc.on_content_start(1, &ContentBlock::text(""));
        acc.on_content_delta(1, "answer");
        acc.on_content_stop(1, None).unwrap();

        let persisted = acc.build_persisted();
        assert_eq!(persisted.len(), 1);
        assert!(matches!(&persisted[0], ContentBlock::Text { text } if text == "answer"));

        // The live view still has both.
        assert_eq!(acc.finish_turn().len(), 2);
    }

    #[test]
    fn complete_tool_result_at_start_skips_streaming() {
        let mut acc = ContentAccumulator::new();
        acc.on_content_start(0, &ContentBlock::tool_result("t1", "output", false));
        // No stop needed; already complete.
        let blocks = acc.finish_turn();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_tool_result());
    }
}

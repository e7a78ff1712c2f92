use relay_domain::config::CompactionConfig;
use relay_domain::{ContentBlock, Message, MessageContent, Role, ToolDefinition, ToolResultContent};

use crate::estimate::{estimate_request_tokens, TokenEstimator};

/// Fixed placeholder that replaces stripped image blocks.
const IMAGE_PLACEHOLDER: &str = "[image removed to conserve context]";
/// Marker inserted where a message was truncated mid-content.
const TRUNCATION_MARKER: &str = "\n...[content truncated]...\n";

/// Keeps the prompt under the model's safe token threshold across
/// turns without breaking the tool_use / tool_result pairing.
///
/// Pipeline, in order: per-message prefilter truncation → image
/// stripping outside the recency window → token estimation → budget
/// trim (pair-preserving) → aggressive retrim.
pub struct ContextCompactor {
    cfg: CompactionConfig,
}

impl ContextCompactor {
    pub fn new(cfg: CompactionConfig) -> Self {
        Self { cfg }
    }

    pub fn compact(
        &self,
        mut messages: Vec<Message>,
        system: &str,
        tools: &[ToolDefinition],
        estimator: &dyn TokenEstimator,
    ) -> Vec<Message> {
        prefilter(&mut messages, self.cfg.per_message_char_cap);
        strip_old_images(&mut messages, self.cfg.preserve_last_images);

        let safe_threshold = self
            .cfg
            .token_budget
            .saturating_sub(self.cfg.safe_threshold_margin);
        let estimate = estimate_request_tokens(estimator, system, tools, &messages);
        if estimate <= safe_threshold {
            return messages;
        }

        tracing::info!(
            estimate,
            safe_threshold,
            messages = messages.len(),
            "context over threshold, trimming"
        );

        let mut trimmed = trim_by_token_budget(
            messages,
            self.cfg.token_budget,
            self.cfg.preserve_first_messages,
            self.cfg.preserve_last_messages,
            self.cfg.preserve_tool_results,
            system,
            tools,
            estimator,
        );

        if estimate_request_tokens(estimator, system, tools, &trimmed) > self.cfg.token_budget {
            tracing::warn!("still over budget after trim, aggressive pass");
            trimmed = trim_by_token_budget(
                trimmed,
                self.cfg.token_budget * 6 / 10,
                2,
                6,
                false,
                system,
                tools,
                estimator,
            );
        }

        trimmed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step 1: prefilter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Truncate any message whose stringified content vastly exceeds the
/// per-message cap. Structural inspection is limited to finding the
/// oversized text fields.
fn prefilter(messages: &mut [Message], char_cap: usize) {
    for message in messages.iter_mut() {
        if message.content.char_len() <= char_cap {
            continue;
        }
        match &mut message.content {
            MessageContent::Text(text) => {
                *text = truncate_middle(text, char_cap);
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks.iter_mut() {
                    truncate_block(block, char_cap);
                }
            }
        }
    }
}

fn truncate_block(block: &mut ContentBlock, char_cap: usize) {
    match block {
        ContentBlock::Text { text } if text.chars().count() > char_cap => {
            *text = truncate_middle(text, char_cap);
        }
        ContentBlock::ToolResult { content, .. } => match content {
            ToolResultContent::Text(text) if text.chars().count() > char_cap => {
                *text = truncate_middle(text, char_cap);
            }
            ToolResultContent::Blocks(inner) => {
                for b in inner.iter_mut() {
                    truncate_block(b, char_cap);
                }
            }
            _ => {}
        },
        _ => {}
    }
}

/// Keep the head and a short tail, marking the cut. Char-boundary safe.
fn truncate_middle(text: &str, char_cap: usize) -> String {
    let total = text.chars().count();
    if total <= char_cap {
        return text.to_string();
    }
    let head: usize = char_cap * 2 / 3;
    let tail: usize = char_cap / 6;
    let mut out: String = text.chars().take(head).collect();
    out.push_str(TRUNCATION_MARKER);
    out.extend(text.chars().skip(total - tail));
    out
}

/// Head+tail truncation for oversized fresh tool results before they
/// enter the message history.
pub fn compress_fresh_tool_result(content: &str, max_chars: usize) -> String {
    truncate_middle(content, max_chars)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step 2: image stripping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace every image block with a fixed text placeholder, in all
/// messages except the last `preserve_last` ones. Base64 images are
/// the dominant token sink in multimodal tool results.
fn strip_old_images(messages: &mut [Message], preserve_last: usize) {
    let window = messages.len().saturating_sub(preserve_last);
    for message in messages.iter_mut().take(window) {
        if let MessageContent::Blocks(blocks) = &mut message.content {
            for block in blocks.iter_mut() {
                strip_images_in_block(block);
            }
        }
    }
}

fn strip_images_in_block(block: &mut ContentBlock) {
    match block {
        ContentBlock::Image { .. } => {
            *block = ContentBlock::text(IMAGE_PLACEHOLDER);
        }
        ContentBlock::ToolResult { content, .. } => {
            if let ToolResultContent::Blocks(inner) = content {
                for b in inner.iter_mut() {
                    if matches!(b, ContentBlock::Image { .. }) {
                        *b = ContentBlock::text(IMAGE_PLACEHOLDER);
                    }
                }
            }
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step 5: budget trim
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trim the middle of the conversation until the request estimate fits
/// `budget`. The first `preserve_first` messages (task framing) and
/// the last `preserve_last` (current context) always survive; a
/// tool_use and its matching tool_result message survive or drop as a
/// unit.
#[allow(clippy::too_many_arguments)]
pub fn trim_by_token_budget(
    messages: Vec<Message>,
    budget: usize,
    preserve_first: usize,
    preserve_last: usize,
    preserve_tool_results: bool,
    system: &str,
    tools: &[ToolDefinition],
    estimator: &dyn TokenEstimator,
) -> Vec<Message> {
    if messages.len() <= preserve_first + preserve_last {
        return repair_pairing(messages);
    }

    let tail_start = messages.len() - preserve_last;
    let mut iter = messages.into_iter();
    let first: Vec<Message> = iter.by_ref().take(preserve_first).collect();
    let middle: Vec<Message> = iter
        .by_ref()
        .take(tail_start - preserve_first)
        .collect();
    let last: Vec<Message> = iter.collect();

    // Group the middle into droppable units: an assistant tool_use
    // message plus its matching tool_result message form one unit.
    let mut units: Vec<Vec<Message>> = Vec::new();
    let mut pending: Option<Message> = None;
    for message in middle {
        match pending.take() {
            Some(prev) => {
                if message.role == Role::User
                    && prev.tool_use_ids() == message.tool_result_ids()
                    && !prev.tool_use_ids().is_empty()
                {
                    units.push(vec![prev, message]);
                } else {
                    units.push(vec![prev]);
                    if message.role == Role::Assistant && message.has_tool_use() {
                        pending = Some(message);
                    } else {
                        units.push(vec![message]);
                    }
                }
            }
            None => {
                if message.role == Role::Assistant && message.has_tool_use() {
                    pending = Some(message);
                } else {
                    units.push(vec![message]);
                }
            }
        }
    }
    if let Some(prev) = pending {
        units.push(vec![prev]);
    }

    // Drop order: oldest first; units holding tool_results drop last
    // when preserve_tool_results is set.
    let mut drop_order: Vec<usize> = Vec::new();
    if preserve_tool_results {
        drop_order.extend(
            units
                .iter()
                .enumerate()
                .filter(|(_, u)| !u.iter().any(Message::has_tool_result))
                .map(|(i, _)| i),
        );
        drop_order.extend(
            units
                .iter()
                .enumerate()
                .filter(|(_, u)| u.iter().any(Message::has_tool_result))
                .map(|(i, _)| i),
        );
    } else {
        drop_order.extend(0..units.len());
    }

    let mut dropped = vec![false; units.len()];
    let mut drop_iter = drop_order.into_iter();
    loop {
        let kept: Vec<Message> = first
            .iter()
            .cloned()
            .chain(
                units
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !dropped[*i])
                    .flat_map(|(_, u)| u.iter().cloned()),
            )
            .chain(last.iter().cloned())
            .collect();

        if estimate_request_tokens(estimator, system, tools, &kept) <= budget {
            return repair_pairing(kept);
        }
        match drop_iter.next() {
            Some(index) => dropped[index] = true,
            None => return repair_pairing(kept),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pairing repair
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enforce the legal-sequence invariant after trimming: the list
/// starts with a user message, every tool_use is immediately followed
/// by its matching tool_result message, and orphans on either side are
/// dropped rather than left dangling.
fn repair_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(message) = iter.next() {
        // The conversation must open with a user message.
        if out.is_empty() && message.role != Role::User {
            continue;
        }

        if message.role == Role::Assistant && message.has_tool_use() {
            let paired = iter
                .peek()
                .map(|next| {
                    next.role == Role::User
                        && next.tool_result_ids() == message.tool_use_ids()
                })
                .unwrap_or(false);
            if paired {
                out.push(message);
                out.push(iter.next().expect("peeked"));
            } else {
                // Orphan tool_use: keep any prose, drop the tool blocks.
                if let MessageContent::Blocks(blocks) = &message.content {
                    let prose: Vec<ContentBlock> = blocks
                        .iter()
                        .filter(|b| !b.is_tool_use())
                        .cloned()
                        .collect();
                    if prose.iter().any(|b| matches!(b, ContentBlock::Text { .. })) {
                        out.push(Message {
                            role: Role::Assistant,
                            content: MessageContent::Blocks(prose),
                        });
                    }
                }
            }
            continue;
        }

        if message.role == Role::User && message.has_tool_result() {
            let prev_matches = out
                .last()
                .map(|prev| {
                    prev.role == Role::Assistant
                        && prev.tool_use_ids() == message.tool_result_ids()
                })
                .unwrap_or(false);
            if prev_matches {
                out.push(message);
            }
            // Orphan tool_result: dropped.
            continue;
        }

        out.push(message);
    }

    out
}

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use relay_domain::{ContentBlock, Result, Role, ToolCall};
use relay_llm::Usage;

use crate::accumulator::{BlockKind, BlockState, ContentAccumulator};
use crate::event::{ExecEvent, MessageStatus};

/// Broadcast channel capacity per session. Slow subscribers that lag
/// more than this many events see a `Lagged` error and resume from the
/// replay ring.
const CHANNEL_CAPACITY: usize = 128;

/// An [`ExecEvent`] stamped with its session-local sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub session_id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub event: ExecEvent,
}

/// One persisted conversation row, assembled at message stop. Thinking
/// blocks are stripped (live-stream only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub status: MessageStatus,
    pub metadata: serde_json::Value,
}

struct SessionState {
    conversation_id: String,
    seq: u64,
    message_id: Option<String>,
    block: BlockState,
    accumulator: ContentAccumulator,
    usage: Usage,
    replay: VecDeque<SequencedEvent>,
    tx: broadcast::Sender<SequencedEvent>,
    stored: Vec<StoredMessage>,
}

impl SessionState {
    fn new(conversation_id: String) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            conversation_id,
            seq: 0,
            message_id: None,
            block: BlockState::default(),
            accumulator: ContentAccumulator::new(),
            usage: Usage::default(),
            replay: VecDeque::new(),
            tx,
            stored: Vec::new(),
        }
    }
}

/// Per-session event serializer and fan-out point.
///
/// Multiple writers (executor + tool flow) may emit concurrently; every
/// write goes through the session's entry under one short mutex, which
/// is what makes `seq` strictly monotonic and gap-free.
pub struct EventBroadcaster {
    sessions: Mutex<HashMap<String, SessionState>>,
    replay_capacity: usize,
}

impl EventBroadcaster {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            replay_capacity,
        }
    }

    fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| SessionState::new(session_id.to_owned()));
        f(state)
    }

    /// Associate a conversation id with a session (defaults to the
    /// session id when never set).
    pub fn bind_conversation(&self, session_id: &str, conversation_id: &str) {
        self.with_session(session_id, |s| {
            s.conversation_id = conversation_id.to_owned();
        });
    }

    fn stamp_and_send(state: &mut SessionState, session_id: &str, event: ExecEvent, cap: usize) {
        state.seq += 1;
        let sequenced = SequencedEvent {
            seq: state.seq,
            session_id: session_id.to_owned(),
            conversation_id: state.conversation_id.clone(),
            message_id: state.message_id.clone(),
            event,
        };
        state.replay.push_back(sequenced.clone());
        while state.replay.len() > cap {
            state.replay.pop_front();
        }
        let _ = state.tx.send(sequenced);
    }

    /// Emit an arbitrary event for a session (non-content events from
    /// the executor: backtrack, prompts, warnings, errors).
    pub fn emit(&self, session_id: &str, event: ExecEvent) {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            Self::stamp_and_send(s, session_id, event, cap);
        });
    }

    // ── Message lifecycle ─────────────────────────────────────────

    /// Begin a new assistant message: reset block state, accumulator,
    /// and per-message usage.
    pub fn start_message(&self, session_id: &str, message_id: &str) {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            s.message_id = Some(message_id.to_owned());
            s.block.reset();
            s.accumulator.reset();
            s.usage = Usage::default();
            Self::stamp_and_send(
                s,
                session_id,
                ExecEvent::MessageStart {
                    message_id: message_id.to_owned(),
                },
                cap,
            );
        });
    }

    pub fn emit_message_delta(&self, session_id: &str, stop_reason: Option<&str>) {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            let usage = if s.usage.total() > 0 { Some(s.usage) } else { None };
            Self::stamp_and_send(
                s,
                session_id,
                ExecEvent::MessageDelta {
                    stop_reason: stop_reason.map(str::to_owned),
                    usage,
                },
                cap,
            );
        });
    }

    /// End the current message: flush the accumulator into a persisted
    /// row (thinking stripped) and emit `message_stop`.
    pub fn emit_message_stop(&self, session_id: &str) -> StoredMessage {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            let content = s.accumulator.build_persisted();
            let stored = StoredMessage {
                role: Role::Assistant,
                content,
                status: MessageStatus::Completed,
                metadata: serde_json::json!({
                    "session_id": session_id,
                    "usage": s.usage,
                }),
            };
            s.stored.push(stored.clone());
            Self::stamp_and_send(s, session_id, ExecEvent::MessageStop {}, cap);
            s.message_id = None;
            stored
        })
    }

    pub fn accumulate_usage(&self, session_id: &str, usage: &Usage) {
        self.with_session(session_id, |s| {
            s.usage.input_tokens += usage.input_tokens;
            s.usage.output_tokens += usage.output_tokens;
        });
    }

    // ── Content blocks ────────────────────────────────────────────

    /// Open a new block, closing any currently open one first.
    /// Returns the new block's index.
    pub fn start_block(&self, session_id: &str, initial: ContentBlock) -> usize {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            if let Some(open) = s.block.current_index() {
                let _ = s.accumulator.on_content_stop(open, None);
                s.block.close_current_block();
                Self::stamp_and_send(
                    s,
                    session_id,
                    ExecEvent::ContentStop { index: open },
                    cap,
                );
            }
            let index = s.block.start_new_block(BlockKind::of(&initial));
            s.accumulator.on_content_start(index, &initial);
            Self::stamp_and_send(
                s,
                session_id,
                ExecEvent::ContentStart {
                    index,
                    content_block: initial,
                },
                cap,
            );
            index
        })
    }

    /// Append a fragment to the currently open block.
    pub fn delta(&self, session_id: &str, fragment: &str) {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            let Some(index) = s.block.current_index() else {
                tracing::warn!(session_id, "delta with no open block");
                return;
            };
            s.accumulator.on_content_delta(index, fragment);
            Self::stamp_and_send(
                s,
                session_id,
                ExecEvent::ContentDelta {
                    index,
                    delta: fragment.to_owned(),
                },
                cap,
            );
        });
    }

    /// Append a fragment to a specific block index (interleaved
    /// parallel streams).
    pub fn delta_at(&self, session_id: &str, index: usize, fragment: &str) {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            s.accumulator.on_content_delta(index, fragment);
            Self::stamp_and_send(
                s,
                session_id,
                ExecEvent::ContentDelta {
                    index,
                    delta: fragment.to_owned(),
                },
                cap,
            );
        });
    }

    /// Close the currently open block. A protocol error (malformed
    /// streamed tool input) is returned to the executor.
    pub fn stop_block(&self, session_id: &str, signature: Option<String>) -> Result<()> {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            let Some(index) = s.block.current_index() else {
                tracing::warn!(session_id, "stop_block with no open block");
                return Ok(());
            };
            s.block.close_current_block();
            Self::stamp_and_send(s, session_id, ExecEvent::ContentStop { index }, cap);
            s.accumulator.on_content_stop(index, signature)
        })
    }

    /// Close a specific block index.
    pub fn stop_block_at(
        &self,
        session_id: &str,
        index: usize,
        signature: Option<String>,
    ) -> Result<()> {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            if s.block.current_index() == Some(index) {
                s.block.close_current_block();
            }
            Self::stamp_and_send(s, session_id, ExecEvent::ContentStop { index }, cap);
            s.accumulator.on_content_stop(index, signature)
        })
    }

    /// Atomic start+stop for non-streaming blocks (tool results).
    pub fn emit_block(&self, session_id: &str, block: ContentBlock) -> usize {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            if let Some(open) = s.block.current_index() {
                let _ = s.accumulator.on_content_stop(open, None);
                s.block.close_current_block();
                Self::stamp_and_send(
                    s,
                    session_id,
                    ExecEvent::ContentStop { index: open },
                    cap,
                );
            }
            let index = s.block.start_new_block(BlockKind::of(&block));
            s.accumulator.on_content_start(index, &block);
            Self::stamp_and_send(
                s,
                session_id,
                ExecEvent::ContentStart {
                    index,
                    content_block: block,
                },
                cap,
            );
            // The block was complete at start; stop never fails here.
            let _ = s.accumulator.on_content_stop(index, None);
            s.block.close_current_block();
            Self::stamp_and_send(s, session_id, ExecEvent::ContentStop { index }, cap);
            index
        })
    }

    /// Drop every in-flight tool_use block (stream_error recovery) and
    /// emit `content_stop` for each so the block invariant (I3) holds
    /// on the wire.
    pub fn abort_incomplete_tool_uses(&self, session_id: &str) -> Vec<usize> {
        let cap = self.replay_capacity;
        self.with_session(session_id, |s| {
            let dropped = s.accumulator.abort_incomplete_tool_uses();
            for &index in &dropped {
                if s.block.current_index() == Some(index) {
                    s.block.close_current_block();
                }
                Self::stamp_and_send(s, session_id, ExecEvent::ContentStop { index }, cap);
            }
            dropped
        })
    }

    // ── Accessors for the executor ────────────────────────────────

    pub fn current_block_index(&self, session_id: &str) -> Option<usize> {
        self.with_session(session_id, |s| s.block.current_index())
    }

    pub fn text_content(&self, session_id: &str) -> String {
        self.with_session(session_id, |s| s.accumulator.text_content())
    }

    pub fn tool_calls(&self, session_id: &str) -> Vec<ToolCall> {
        self.with_session(session_id, |s| s.accumulator.tool_calls())
    }

    /// Current turn's blocks, ordered by index (flushes in-flight
    /// blocks best-effort).
    pub fn finish_turn(&self, session_id: &str) -> Vec<ContentBlock> {
        self.with_session(session_id, |s| s.accumulator.finish_turn())
    }

    pub fn stored_messages(&self, session_id: &str) -> Vec<StoredMessage> {
        self.with_session(session_id, |s| s.stored.clone())
    }

    pub fn last_seq(&self, session_id: &str) -> u64 {
        self.with_session(session_id, |s| s.seq)
    }

    // ── Subscription ──────────────────────────────────────────────

    /// Subscribe to a session's events. Events after `after_seq` that
    /// the bounded replay ring still holds are returned immediately;
    /// the receiver then yields live events.
    pub fn subscribe(
        &self,
        session_id: &str,
        after_seq: u64,
    ) -> (Vec<SequencedEvent>, broadcast::Receiver<SequencedEvent>) {
        self.with_session(session_id, |s| {
            let replayed: Vec<SequencedEvent> = s
                .replay
                .iter()
                .filter(|e| e.seq > after_seq)
                .cloned()
                .collect();
            (replayed, s.tx.subscribe())
        })
    }

    /// Drop all state for a finished session.
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

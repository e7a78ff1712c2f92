//! Shared data model for the relay execution core: content blocks,
//! messages, tool call types, termination vocabulary, configuration,
//! and the common error type.

pub mod block;
pub mod config;
pub mod error;
pub mod termination;
pub mod tool;

pub use block::{ContentBlock, Message, MessageContent, Role, ToolResultContent};
pub use error::{Error, Result};
pub use termination::{FinishReason, TerminationAction, TerminationDecision};
pub use tool::{ToolCall, ToolDefinition, ToolExecutionResult, ToolResultValue};

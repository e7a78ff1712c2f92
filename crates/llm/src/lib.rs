//! LLM service contract consumed by the executor.
//!
//! Provider adapters (HTTP, local inference, test doubles) implement
//! [`LlmService`]; the execution core only sees the provider-agnostic
//! chunk vocabulary defined here.

pub mod traits;
pub mod usage;

pub use traits::{BoxStream, LlmChunk, LlmRequest, LlmResponse, LlmService, StopReason};
pub use usage::{Usage, UsageTracker};

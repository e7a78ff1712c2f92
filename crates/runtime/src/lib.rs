//! The execution runtime: tool dispatch flow, backtrack engine,
//! adaptive terminator, cancellation, user-confirmation gates, and the
//! RVR / RVR-B executor loop that ties them together.
//!
//! One logical executor runs per session as a cooperative task that
//! suspends at well-defined points: the LLM stream, tool completion,
//! and the user-confirmation gates in [`confirm::ConfirmHub`].

pub mod backtrack;
pub mod cancel;
pub mod capture;
pub mod confirm;
pub mod executor;
pub mod flow;
pub mod hitl;
pub mod plan;
pub mod terminator;

pub use backtrack::{BacktrackDecider, BacktrackEngine, BacktrackType, HeuristicDecider, RvrbState};
pub use cancel::{CancelMap, CancelToken};
pub use confirm::{BacktrackChoice, ConfirmHub, CostChoice, HitlDecision};
pub use executor::{ExecutionContext, Executor};
pub use flow::{SpecialToolHandler, ToolContext, ToolExecutionFlow, ToolExecutor};
pub use terminator::AdaptiveTerminator;

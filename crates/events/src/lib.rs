//! Event layer: the streaming event vocabulary, the per-session content
//! accumulator, and the sequenced broadcaster that external transports
//! subscribe to.
//!
//! Every event a session emits flows through [`EventBroadcaster`],
//! which stamps a strictly monotonic per-session `seq`, folds content
//! events into the session's [`ContentAccumulator`], and fans out to
//! subscribers with bounded replay.

pub mod accumulator;
pub mod broadcaster;
pub mod event;
pub mod handler;

pub use accumulator::{BlockState, ContentAccumulator};
pub use broadcaster::{EventBroadcaster, SequencedEvent, StoredMessage};
pub use event::{ConfirmOption, ExecEvent, MessageStatus};
pub use handler::ContentHandler;

//! Transaction-like semantics over local filesystem side effects for
//! the duration of one task: pre-task snapshots, an append-only
//! operation log with derived inverse actions, rollback with per-file
//! failure isolation, and disk persistence for post-crash recovery.

pub mod manager;
pub mod oplog;
pub mod snapshot;

pub use manager::{PostCheckResult, PreCheckResult, StateConsistencyManager};
pub use oplog::{OpAction, OperationLog, OperationRecord};
pub use snapshot::{EnvironmentState, Snapshot};

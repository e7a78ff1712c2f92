/// Shared error type used across all relay crates.
///
/// Tool failures and backtrack decisions are data, not errors; this
/// type covers I/O, protocol violations, and construction-time
/// contract failures that should fail fast.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The LLM produced output that violates the streaming protocol
    /// (e.g. unparseable tool input at block stop).
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("llm: {0}")]
    Llm(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A required collaborator was not supplied at construction.
    /// Raised before turn 1, never mid-loop.
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

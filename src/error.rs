//! Error taxonomy for the session engine.
//!
//! Every failure is reported at the boundary of the operation that discovered
//! it; no partial conversation state leaks past a failed call, and nothing is
//! retried on the engine's behalf.
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation was attempted before its prerequisite state existed,
    /// e.g. generating without an active context or chatting without a
    /// chat template.
    #[error("{0}")]
    Misuse(String),

    /// An argument was structurally wrong: bad value range, unparseable
    /// option, rejected key.
    #[error("{0}")]
    Validation(String),

    /// An allocation could not be satisfied. The enclosing operation was
    /// aborted; no partially grown buffer is ever used.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The pending batch no longer fits the context window. Terminal for
    /// this call; the caller may retry with a larger context.
    #[error("context window overflow: {needed} tokens needed, {capacity} available")]
    ContextOverflow { needed: usize, capacity: usize },

    /// The bounded adapter table is full.
    #[error("adapter table full: at most {max} adapters may be attached")]
    AdapterTableFull { max: usize },

    /// The model runtime's tokenize/decode/render step failed or reported
    /// an inconsistent size.
    #[error("model runtime failure: {0}")]
    Runtime(String),

    /// The operation is incompatible with the loaded model.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// History persistence failed. Save transactions are rolled back whole.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl EngineError {
    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        EngineError::Misuse(msg.into())
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        EngineError::Runtime(msg.into())
    }
}

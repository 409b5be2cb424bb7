//! Error types for the scheduling and state engine
//!
//! All fallible operations in this crate return [`Result`]. The variants
//! `NodeNotFound`, `SessionNotFound`, `SessionCancelled` and `SessionFinished`
//! are part of the stable error surface shared with every storage backend.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Convenience result type using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by orchestration, execution and the service backends
#[derive(Error, Debug)]
pub enum Error {
    /// The node row does not exist in storage
    #[error("node `{0}` not found")]
    NodeNotFound(Uuid),

    /// The session row does not exist in storage
    #[error("session `{0}` not found")]
    SessionNotFound(Uuid),

    /// The session (or the entity through which it was observed) is cancelled
    ///
    /// This is an expected race outcome, not a fault: a worker may observe it
    /// while starting a node whose session was cancelled in flight.
    #[error("session `{0}` cancelled")]
    SessionCancelled(Uuid),

    /// The session has no non-terminal graphs left, so there is nothing to cancel
    #[error("session `{0}` finished")]
    SessionFinished(Uuid),

    /// A graph already has a different dependent graph
    ///
    /// The back-edge is single-write: once a graph defers its result to a
    /// dependent, it cannot be re-pointed somewhere else.
    #[error("graph `{dependency}` is already linked to dependent graph `{existing}`")]
    GraphLinked { dependency: Uuid, existing: Uuid },

    /// No handler is registered under this id
    #[error("no handler registered for `{0}`")]
    UnknownHandler(String),

    /// The decoded argument list does not fit the handler's declared parameters
    #[error("handler `{handler}` takes {expected} parameters, got argument index {index}")]
    Arity {
        handler: String,
        expected: usize,
        index: usize,
    },

    /// The handler did not finish within the per-node timeout
    #[error("node `{node}` timed out after {timeout:?}")]
    Timeout { node: Uuid, timeout: Duration },

    /// The handler returned an application error
    #[error("handler failed: {0}")]
    Handler(String),

    /// Encoding or decoding of the binary argument/result format failed
    #[error("codec error: {0}")]
    Codec(String),

    /// Storage backend failure (connection, constraint, unexpected shape)
    #[error("storage error: {0}")]
    Storage(String),

    /// Broker failure (publish or subscription plumbing)
    #[error("broker error: {0}")]
    Broker(String),

    /// Client-side orchestration failure (cycles, poisoned dedup entries)
    #[error("orchestration error: {0}")]
    Orchestration(String),
}

impl Error {
    /// True for the terminal-session outcomes a caller may treat as benign
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            Error::SessionCancelled(_) | Error::SessionFinished(_)
        )
    }
}

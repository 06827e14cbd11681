//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    /// Write of a tuple containing wildcards or `None`, or a query
    /// containing `None`.
    #[error("tuple is not fully defined")]
    Undefined,

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A primitive was invoked on a non-leader; carries the leader's
    /// client-facing address when known.
    #[error("not leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    /// Consensus apply exceeded its budget.
    #[error("consensus apply timed out")]
    Timeout,

    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed preamble, unknown message type, bad framing.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Any other consensus-layer failure.
    #[error("consensus: {0}")]
    Consensus(String),
}

pub type Result<T> = std::result::Result<T, Error>;

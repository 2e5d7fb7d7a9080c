//! Shared error type for the storage engine.
//!
//! Mirrors the error kinds `spec.md` §7 names (NotFound, AlreadyExists,
//! InvalidArgument, DecodeError, IoError, Concurrency) so that every public
//! operation surfaces one of these variants rather than a string.

/// Everything that can go wrong talking to the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A key or sub-store is missing on an operation that requires presence.
    #[error("{0} not found")]
    NotFound(String),

    /// A copy/create target already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed timestamp, non-monotonic range, unknown format descriptor,
    /// bad regex, or a packed value whose arity/types don't match.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Stored bytes could not be decoded with the current codec.
    #[error("failed to decode value in {sub_store}: {source}")]
    Decode {
        sub_store: String,
        #[source]
        source: anyhow::Error,
    },

    /// The underlying mmap store reported a failure.
    #[error("storage I/O error: {0}")]
    Io(#[from] heed::Error),

    /// Attempted to open/create a sub-store while a transaction on the same
    /// environment is still active.
    #[error("sub-store {name} cannot be opened while a transaction is active on this environment")]
    Concurrency { name: String },
}

impl StoreError {
    pub fn decode(sub_store: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Decode {
            sub_store: sub_store.into(),
            source: source.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

//! Error types for document operations.
//!
//! Local misuse (out-of-range access, writing through a closed
//! transaction) is reported synchronously to the caller. Decode failures
//! reject the whole payload before any state is touched.

use thiserror::Error;

use crate::crdt::primitives::StateVector;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the document engine.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Index access beyond the materialized bounds of a sequence.
    #[error("index {index} is out of range for length {len}")]
    OutOfRange { index: u32, len: u32 },

    /// A mutation was attempted through a transaction that already committed.
    #[error("no active transaction: the transaction has already been committed")]
    NoActiveTransaction,

    /// A shared type handle was used with a transaction of another document.
    #[error("shared type belongs to a different document than the transaction")]
    ForeignDocument,

    /// A shared type instance was inserted into a second location.
    #[error("shared type has already been integrated into a document")]
    AlreadyIntegrated,

    /// Another transaction is currently open on the document.
    #[error("document is busy: another transaction is in progress")]
    Busy,

    /// An operation was attempted on a freed subscription or destroyed document.
    #[error("use after free: {0}")]
    UseAfterFree(&'static str),

    /// The payload was truncated or internally inconsistent.
    #[error("malformed update: {reason}")]
    MalformedUpdate { reason: String },

    /// The payload carries a content kind this engine does not model.
    #[error("unsupported content kind {tag} in update")]
    UnsupportedContent { tag: u8 },

    /// The pending-integration queue outgrew its configured limit.
    #[error("unresolved dependencies exceed the pending limit; missing {missing:?}")]
    UnresolvedDependency { missing: StateVector },

    /// The operation needs a shared type that is part of a document.
    #[error("shared type is not integrated into a document")]
    NotIntegrated,

    /// A root type was accessed with a different kind than it was created with.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Error {
        return Error::MalformedUpdate {
            reason: reason.into(),
        };
    }

    /// Whether this error came from decoding a binary payload.
    pub fn is_decode_error(&self) -> bool {
        return matches!(
            self,
            Error::MalformedUpdate { .. } | Error::UnsupportedContent { .. }
        );
    }

    /// Whether the operation may succeed if retried once the document is free.
    pub fn is_busy(&self) -> bool {
        return matches!(self, Error::Busy);
    }
}

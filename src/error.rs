//! Failure kinds that callers need to tell apart.
//!
//! Most fallible paths return [`anyhow::Result`] with context chains;
//! the variants here are the ones where *policy* depends on the kind
//! (retry, collect, abort), so they can be downcast back out.

use thiserror::Error;

use crate::hashing::ObjectId;

#[derive(Debug, Error)]
pub enum Error {
    /// The backend has no object with the given name.
    #[error("{0} not found in backend")]
    BackendNotFound(String),

    /// Refusing to overwrite an existing object.
    /// Benign when deduplicating - the bytes are already there.
    #[error("{0} already exists in backend")]
    BackendAlreadyExists(String),

    /// MAC verification failed. Never retried, never downgraded.
    #[error("ciphertext failed verification")]
    Unauthenticated,

    /// No key object could be opened with the given password.
    #[error("wrong password (tried {tries} keys)")]
    WrongPassword { tries: usize },

    /// The pack trailer or header doesn't parse.
    #[error("invalid pack format: {0}")]
    InvalidPackFormat(String),

    /// A blob was referenced but no loaded index knows where it lives.
    #[error("blob {0} is not in the index")]
    NotInIndex(ObjectId),

    /// A short ID matched more than one object.
    #[error("prefix {0} is ambiguous ({1} matches)")]
    AmbiguousId(String, usize),

    /// Someone else holds an incompatible lock.
    #[error("repository is locked: {0}")]
    LockConflict(String),

    /// An object's bytes don't hash to its recorded identity.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: ObjectId,
        actual: ObjectId,
    },
}

/// Does this error (or anything it wraps) represent a crypto failure?
///
/// Archiver and restorer error callbacks may downgrade I/O problems to
/// warnings, but never these.
pub fn is_crypto_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Unauthenticated | Error::ChecksumMismatch { .. })
    )
}

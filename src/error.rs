//! Error taxonomy for the credential and session subsystem.
//!
//! Everything that crosses the crate boundary is one of these variants so
//! the embedding service can map them to transport-level codes in a single
//! place. `Unauthorized` is deliberately carried without detail: bad
//! credential, expired token, blacklisted token, and locked account must be
//! indistinguishable to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed input; the operation had no side effects.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Bad credential or token. Never says which check failed.
    #[error("unauthorized")]
    Unauthorized,

    /// A unique field (email) already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No such record, where non-existence is not itself sensitive.
    #[error("not found")]
    NotFound,

    /// Attempt budget exhausted or lockout in effect.
    #[error("rate limited")]
    RateLimited,

    /// A stored record failed decryption or names an unknown key version.
    /// Fatal for the record, not the process. The message carries the
    /// record reference only, never ciphertext or key material.
    #[error("corrupted record: {record}")]
    CorruptedRecord { record: String },

    /// A backing store is unreachable. Callers must treat this as a
    /// fail-closed rejection, not retry inline.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Key material or token machinery rejected an operation.
    #[error("crypto failure: {0}")]
    Crypto(String),
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AuthError::NotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AuthError::DependencyUnavailable(err.to_string())
            }
            other => AuthError::DependencyUnavailable(other.to_string()),
        }
    }
}

/// Match Postgres SQLSTATE 23505 so unique-index races map to `Conflict`
/// instead of surfacing as a store failure.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

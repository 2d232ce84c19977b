//! Principal identity rows and their storage contract.
//!
//! A principal's PII never touches storage in the clear: the repo moves
//! [`EncryptedValue`]s and lookup hashes only. Encryption and decryption
//! are the vault's job; the repo is plumbing.

mod memory;
mod postgres;

pub use memory::MemoryPrincipalRepo;
pub use postgres::PostgresPrincipalRepo;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::AuthError;
use crate::keyring::{EncryptedValue, LookupHash};

/// A user identity as stored: immutable numeric id, encrypted PII, and
/// the lifecycle counters the session layer depends on. `token_version`
/// starts at 0 and only ever moves up, via revoke-all.
#[derive(Clone, Debug)]
pub struct PrincipalRecord {
    pub id: i64,
    pub full_name: EncryptedValue,
    pub email: EncryptedValue,
    pub email_hash: LookupHash,
    pub date_of_birth: EncryptedValue,
    pub address: EncryptedValue,
    pub pin_hash: Option<String>,
    pub token_version: i64,
    pub lock_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl PrincipalRecord {
    /// Whether a durable lockout is currently in force.
    #[must_use]
    pub fn is_locked(&self, now: OffsetDateTime) -> bool {
        self.lock_until.is_some_and(|until| until > now)
    }
}

/// Encrypted fields for a fresh principal row.
#[derive(Clone, Debug)]
pub struct NewPrincipal {
    pub full_name: EncryptedValue,
    pub email: EncryptedValue,
    pub email_hash: LookupHash,
    pub date_of_birth: EncryptedValue,
    pub address: EncryptedValue,
}

/// Full replacement of the encrypted PII block, used by credential-change
/// flows and the re-encryption sweep.
#[derive(Clone, Debug)]
pub struct PiiUpdate {
    pub full_name: EncryptedValue,
    pub email: EncryptedValue,
    pub email_hash: LookupHash,
    pub date_of_birth: EncryptedValue,
    pub address: EncryptedValue,
}

#[async_trait]
pub trait PrincipalRepo: Send + Sync {
    /// Insert a new principal. Fails with `Conflict` when the email hash
    /// already exists.
    async fn insert(&self, principal: NewPrincipal) -> Result<PrincipalRecord, AuthError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<PrincipalRecord>, AuthError>;

    async fn find_by_email_hash(
        &self,
        email_hash: &LookupHash,
    ) -> Result<Option<PrincipalRecord>, AuthError>;

    /// Equality search over the hash index only; implementations must not
    /// read, let alone decrypt, the encrypted columns for this check.
    async fn exists_by_email_hash(&self, email_hash: &LookupHash) -> Result<bool, AuthError>;

    async fn update_pii(&self, id: i64, update: PiiUpdate) -> Result<(), AuthError>;

    async fn set_pin_hash(&self, id: i64, pin_hash: String) -> Result<(), AuthError>;

    async fn set_lock(&self, id: i64, lock_until: Option<OffsetDateTime>)
        -> Result<(), AuthError>;

    /// Increment the token-version counter and return the new value.
    /// Monotonic; never reset.
    async fn bump_token_version(&self, id: i64) -> Result<i64, AuthError>;

    /// Cheap current-token-version read for access-token validation.
    async fn token_version(&self, id: i64) -> Result<Option<i64>, AuthError>;
}

//! Durable audit ledger of issued refresh tokens.
//!
//! One row per token, kept forever: rotation and revocation mark rows
//! rather than deleting them, so the ledger doubles as revocation history
//! and as the backing query for multi-device session listings.
//!
//! Validity is NOT decided here. A token absent from the ephemeral store
//! is invalid regardless of what its ledger row says; the ledger checks
//! are defense in depth on top of that.

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AuthError;

/// Why a ledger row was closed. Serialized as the stored string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevocationReason {
    TokenRefreshed,
    UserRevokedSession,
    LogoutAllDevices,
}

impl RevocationReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::TokenRefreshed => "token_refreshed",
            RevocationReason::UserRevokedSession => "user_revoked_session",
            RevocationReason::LogoutAllDevices => "logout_all_devices",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_refreshed" => Ok(RevocationReason::TokenRefreshed),
            "user_revoked_session" => Ok(RevocationReason::UserRevokedSession),
            "logout_all_devices" => Ok(RevocationReason::LogoutAllDevices),
            other => Err(AuthError::Validation(format!(
                "unknown revocation reason: {other}"
            ))),
        }
    }
}

/// Device metadata captured at issuance and carried forward on rotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_name: String,
    pub device_type: String,
    pub ip: String,
    pub location: Option<String>,
    pub user_agent: String,
}

/// A full audit row. The opaque token itself is never stored; only its
/// hash is, so a ledger dump cannot be replayed as live credentials.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub token_id: Uuid,
    pub user_id: i64,
    pub token_hash: String,
    pub device: DeviceInfo,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub revoked: bool,
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_reason: Option<RevocationReason>,
    pub last_used_at: Option<OffsetDateTime>,
}

impl RefreshTokenRecord {
    #[must_use]
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Fields for a fresh row; audit fields start clear.
#[derive(Clone, Debug)]
pub struct NewRefreshToken {
    pub token_id: Uuid,
    pub user_id: i64,
    pub token_hash: String,
    pub device: DeviceInfo,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

#[async_trait]
pub trait SessionLedger: Send + Sync {
    async fn insert(&self, token: NewRefreshToken) -> Result<(), AuthError>;

    async fn find_by_hash(&self, token_hash: &str)
        -> Result<Option<RefreshTokenRecord>, AuthError>;

    async fn find_by_id(
        &self,
        user_id: i64,
        token_id: Uuid,
    ) -> Result<Option<RefreshTokenRecord>, AuthError>;

    /// One-way: a revoked row never reopens.
    async fn mark_revoked(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
    ) -> Result<(), AuthError>;

    /// Revoke every non-revoked row for the user and return the rows that
    /// were closed, so the caller can clear their fast-store entries.
    async fn revoke_all_active(
        &self,
        user_id: i64,
        reason: RevocationReason,
    ) -> Result<Vec<RefreshTokenRecord>, AuthError>;

    async fn touch_last_used(&self, token_id: Uuid) -> Result<(), AuthError>;

    /// Rows with `revoked = false` and `expires_at > now`, most recently
    /// used first.
    async fn list_active(&self, user_id: i64) -> Result<Vec<RefreshTokenRecord>, AuthError>;

    /// Whether the user already has an active session from this device
    /// name. Drives new-device notices only, never authorization.
    async fn has_active_for_device(
        &self,
        user_id: i64,
        device_name: &str,
    ) -> Result<bool, AuthError>;
}

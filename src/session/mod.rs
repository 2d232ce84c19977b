//! Session issuance, rotation, revocation, and validation.
//!
//! Refresh tokens live in two places: the ephemeral store (hashed key,
//! TTL = remaining lifetime) owns validity; the ledger keeps the audit
//! row forever. The write order is a small saga: ephemeral first, ledger
//! second, so a ledger outage degrades auditing, never security. The
//! reverse failure cannot mint a token the fast store doesn't know about.
//!
//! Rotation is strict single-use: the atomic take on the ephemeral entry
//! picks exactly one winner among concurrent refreshes of the same token,
//! with no lock manager. Everyone else gets `Unauthorized`.

mod token;

pub use token::{AccessTokenClaims, TokenSigner, decode_unverified};

use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::ledger::{DeviceInfo, NewRefreshToken, RevocationReason, SessionLedger};
use crate::notify::{GeoLookup, NotificationSender};
use crate::principal::PrincipalRepo;
use crate::store::EphemeralStore;
use crate::vault::Principal;

const REFRESH_TOKEN_BYTES: usize = 32;

/// Device details supplied by the caller at sign-in. Location is resolved
/// here via the geo collaborator, not trusted from the client.
#[derive(Clone, Debug)]
pub struct NewDevice {
    pub device_name: String,
    pub device_type: String,
    pub ip: String,
    pub user_agent: String,
}

/// The freshly issued pair handed back to the caller. The refresh token
/// is the only copy of the opaque value; storage keeps hashes.
#[derive(Clone, Debug)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_token_id: Uuid,
    pub refresh_expires_at: OffsetDateTime,
}

/// A row of the device list shown to the user.
#[derive(Clone, Debug)]
pub struct SessionView {
    pub token_id: Uuid,
    pub device_name: String,
    pub device_type: String,
    pub ip: String,
    pub location: Option<String>,
    pub user_agent: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

/// Payload stored under the hashed refresh token in the ephemeral store.
#[derive(Serialize, Deserialize)]
struct RefreshEntry {
    user_id: i64,
    token_id: Uuid,
}

pub struct SessionManager {
    store: Arc<dyn EphemeralStore>,
    ledger: Arc<dyn SessionLedger>,
    repo: Arc<dyn PrincipalRepo>,
    signer: TokenSigner,
    notifier: Arc<dyn NotificationSender>,
    geo: Arc<dyn GeoLookup>,
    config: AuthConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        ledger: Arc<dyn SessionLedger>,
        repo: Arc<dyn PrincipalRepo>,
        signer: TokenSigner,
        notifier: Arc<dyn NotificationSender>,
        geo: Arc<dyn GeoLookup>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            repo,
            signer,
            notifier,
            geo,
            config,
        }
    }

    /// Issue a fresh access/refresh pair after a successful
    /// authentication. Sends a best-effort notice when the device name
    /// has no other active session.
    ///
    /// # Errors
    ///
    /// Store failures; the ledger write and the notification are
    /// best-effort.
    pub async fn issue_session(
        &self,
        principal: &Principal,
        device: NewDevice,
    ) -> Result<SessionTokens, AuthError> {
        let known_device = self
            .ledger
            .has_active_for_device(principal.id, &device.device_name)
            .await
            .unwrap_or(false);

        let location = self.geo.locate(&device.ip).await;
        let info = DeviceInfo {
            device_name: device.device_name,
            device_type: device.device_type,
            ip: device.ip,
            location,
            user_agent: device.user_agent,
        };

        let tokens = self
            .write_session(principal.id, principal.token_version, info.clone())
            .await?;

        if !known_device {
            self.send_new_device_notice(principal, &info).await;
        }
        Ok(tokens)
    }

    /// Rotate a refresh token. Single-use: the presented token is
    /// consumed atomically up front, so replay of a rotated token fails
    /// even before its natural expiry, and an unreachable store fails
    /// closed rather than falling back to ledger-only trust.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for an unknown, already rotated, revoked, or
    /// expired token; `DependencyUnavailable` when the store is down.
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionTokens, AuthError> {
        let token_hash = hash_refresh_token(refresh_token);
        let Some(entry) = self.store.take(&refresh_key(&token_hash)).await? else {
            return Err(AuthError::Unauthorized);
        };
        let entry: RefreshEntry =
            serde_json::from_str(&entry).map_err(|_| AuthError::Unauthorized)?;

        // Defense in depth: the stores can transiently diverge, so the
        // ledger's revocation and expiry verdicts are checked as well.
        let row = self
            .ledger
            .find_by_id(entry.user_id, entry.token_id)
            .await?;
        let device = match row {
            Some(row) => {
                if row.revoked || row.expires_at <= OffsetDateTime::now_utc() {
                    return Err(AuthError::Unauthorized);
                }
                row.device
            }
            None => {
                // Tolerated divergence: the audit write was lost. The
                // fast store already proved validity and uniqueness.
                warn!(
                    token_id = %entry.token_id,
                    "refresh token missing its ledger row"
                );
                DeviceInfo {
                    device_name: "unknown".to_string(),
                    device_type: "unknown".to_string(),
                    ip: "unknown".to_string(),
                    location: None,
                    user_agent: "unknown".to_string(),
                }
            }
        };

        let token_version = self
            .repo
            .token_version(entry.user_id)
            .await?
            .ok_or(AuthError::Unauthorized)?;

        if let Err(err) = self.ledger.touch_last_used(entry.token_id).await {
            warn!("Failed to stamp last use on rotated token: {err}");
        }
        if let Err(err) = self
            .ledger
            .mark_revoked(entry.token_id, RevocationReason::TokenRefreshed)
            .await
        {
            warn!("Failed to mark rotated token revoked: {err}");
        }

        self.write_session(entry.user_id, token_version, device)
            .await
    }

    /// Invalidate the session carrying this refresh token. Idempotent:
    /// an unknown or already dead token is a successful logout.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let token_hash = hash_refresh_token(refresh_token);
        if let Some(entry) = self.store.take(&refresh_key(&token_hash)).await? {
            if let Ok(entry) = serde_json::from_str::<RefreshEntry>(&entry) {
                self.ledger
                    .mark_revoked(entry.token_id, RevocationReason::UserRevokedSession)
                    .await?;
                return Ok(());
            }
        }
        // The fast entry may have already aged out; still close any open
        // audit row so the device list reflects the logout.
        if let Some(row) = self.ledger.find_by_hash(&token_hash).await? {
            if !row.revoked {
                self.ledger
                    .mark_revoked(row.token_id, RevocationReason::UserRevokedSession)
                    .await?;
            }
        }
        Ok(())
    }

    /// Revoke one session by its ledger id (the device-list flow).
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id; session ids are not sensitive.
    pub async fn revoke_one(&self, user_id: i64, token_id: Uuid) -> Result<(), AuthError> {
        let row = self
            .ledger
            .find_by_id(user_id, token_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        self.store.delete(&refresh_key(&row.token_hash)).await?;
        self.ledger
            .mark_revoked(token_id, RevocationReason::UserRevokedSession)
            .await
    }

    /// Sign out everywhere. Bumping the token version alone invalidates
    /// every outstanding access token on its next check; the refresh
    /// entries are then cleared best-effort.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown principal; ledger/store failures.
    pub async fn revoke_all(&self, user_id: i64) -> Result<(), AuthError> {
        self.repo.bump_token_version(user_id).await?;
        let closed = self
            .ledger
            .revoke_all_active(user_id, RevocationReason::LogoutAllDevices)
            .await?;
        for row in closed {
            if let Err(err) = self.store.delete(&refresh_key(&row.token_hash)).await {
                error!(token_id = %row.token_id, "Failed to clear refresh entry: {err}");
            }
        }
        Ok(())
    }

    /// Deny an individual access token for the rest of its natural life.
    /// The blacklist entry's TTL equals the remaining validity, never
    /// longer, so the deny list stays bounded.
    ///
    /// # Errors
    ///
    /// `Validation` for a structurally invalid token; store failures.
    pub async fn blacklist_access_token(&self, access_token: &str) -> Result<(), AuthError> {
        let claims = decode_unverified(access_token)?;
        let remaining = claims.expires_at_unix()? - OffsetDateTime::now_utc().unix_timestamp();
        if remaining <= 0 {
            // Already dead; nothing to store.
            return Ok(());
        }
        let remaining = u64::try_from(remaining).unwrap_or(0);
        self.store
            .put(
                &blacklist_key(&claims.jti),
                "1",
                Duration::from_secs(remaining),
            )
            .await
    }

    /// Validate an access token: signature and time bounds, then the
    /// principal's current token version, then the jti blacklist.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for every failure mode, deliberately
    /// undifferentiated.
    pub async fn validate_access_token(
        &self,
        access_token: &str,
    ) -> Result<AccessTokenClaims, AuthError> {
        let claims = self
            .signer
            .verify(access_token, self.config.token_issuer())?;
        let subject_id = claims.subject_id()?;

        let current_version = self
            .repo
            .token_version(subject_id)
            .await
            .map_err(|_| AuthError::Unauthorized)?
            .ok_or(AuthError::Unauthorized)?;
        if claims.tv != current_version {
            return Err(AuthError::Unauthorized);
        }

        if self
            .store
            .get(&blacklist_key(&claims.jti))
            .await
            .map_err(|_| AuthError::Unauthorized)?
            .is_some()
        {
            return Err(AuthError::Unauthorized);
        }
        Ok(claims)
    }

    /// Active sessions for the device list, most recently used first.
    ///
    /// # Errors
    ///
    /// Ledger failures only.
    pub async fn list_active_sessions(
        &self,
        user_id: i64,
    ) -> Result<Vec<SessionView>, AuthError> {
        let rows = self.ledger.list_active(user_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| SessionView {
                token_id: row.token_id,
                device_name: row.device.device_name,
                device_type: row.device.device_type,
                ip: row.device.ip,
                location: row.device.location,
                user_agent: row.device.user_agent,
                issued_at: row.issued_at,
                expires_at: row.expires_at,
                last_used_at: row.last_used_at,
            })
            .collect())
    }

    /// Shared issue path: mint the pair, write the fast store, then the
    /// audit row.
    async fn write_session(
        &self,
        user_id: i64,
        token_version: i64,
        device: DeviceInfo,
    ) -> Result<SessionTokens, AuthError> {
        let claims = AccessTokenClaims::new(
            self.config.token_issuer(),
            user_id,
            token_version,
            self.config.access_token_ttl_seconds(),
        )?;
        let access_token = self.signer.sign(&claims)?;

        let refresh_token = generate_refresh_token()?;
        let token_hash = hash_refresh_token(&refresh_token);
        let token_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let ttl_seconds = self.config.refresh_token_ttl_seconds();
        let expires_at = now + time::Duration::seconds(ttl_seconds);

        let entry = serde_json::to_string(&RefreshEntry { user_id, token_id })
            .map_err(|err| AuthError::Crypto(format!("failed to encode session entry: {err}")))?;

        // Fast store first: it is the source of truth for validity.
        self.store
            .put(
                &refresh_key(&token_hash),
                &entry,
                Duration::from_secs(u64::try_from(ttl_seconds).unwrap_or(0)),
            )
            .await?;

        // Audit row second, best-effort. A lost row is repaired by the
        // reconciliation sweep and never blocks the sign-in.
        if let Err(err) = self
            .ledger
            .insert(NewRefreshToken {
                token_id,
                user_id,
                token_hash,
                device,
                issued_at: now,
                expires_at,
            })
            .await
        {
            error!(%token_id, "Failed to write session audit row: {err}");
        }

        Ok(SessionTokens {
            access_token,
            refresh_token,
            refresh_token_id: token_id,
            refresh_expires_at: expires_at,
        })
    }

    async fn send_new_device_notice(&self, principal: &Principal, device: &DeviceInfo) {
        let where_from = device
            .location
            .clone()
            .unwrap_or_else(|| "an unrecognized location".to_string());
        let text = format!(
            "A new sign-in to your account from {} ({where_from}). If this \
             wasn't you, revoke the session from your device list.",
            device.device_name
        );
        if let Err(err) = self
            .notifier
            .send_email(
                &principal.profile.email,
                "New sign-in to your account",
                &text,
                &format!("<p>{text}</p>"),
            )
            .await
        {
            error!("Failed to send new-device notice: {err}");
        }
    }
}

/// A fresh unguessable opaque token. The raw value goes to the caller
/// only; both stores see its hash.
fn generate_refresh_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| AuthError::Crypto("failed to generate refresh token".to_string()))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn refresh_key(token_hash: &str) -> String {
    format!("rt:{token_hash}")
}

fn blacklist_key(jti: &str) -> String {
    format!("bl:{jti}")
}

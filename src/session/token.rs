//! Signed access tokens: PASETO v4.public with Ed25519 keys.
//!
//! Keys are stored and accepted ONLY as PASERK strings (`k4.secret` /
//! `k4.public`). A key that does not parse as canonical PASERK is
//! rejected when the signer is built; nothing re-interprets key formats
//! at verification time.
//!
//! Claims carry the subject, the principal's token version, and a unique
//! `jti`. The token version is what makes revoke-all instant: a bumped
//! counter orphans every outstanding token without touching storage.

use base64ct::{Base64UrlUnpadded, Encoding};
use pasetors::Public;
use pasetors::keys::{AsymmetricKeyPair, AsymmetricPublicKey, AsymmetricSecretKey, Generate};
use pasetors::paserk::FormatAsPaserk;
use pasetors::token::UntrustedToken;
use pasetors::version4::{PublicToken, V4};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::error::AuthError;

const TOKEN_HEADER: &str = "v4.public.";
const SECRET_PASERK_HEADER: &str = "k4.secret.";
const ED25519_SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub exp: String,
    pub iat: String,
    pub jti: String,
    /// Principal token version at signing time.
    pub tv: i64,
}

impl AccessTokenClaims {
    /// Build claims for a principal with a fresh `jti`.
    ///
    /// # Errors
    ///
    /// Returns an error if timestamp formatting fails.
    pub fn new(
        issuer: &str,
        subject_id: i64,
        token_version: i64,
        ttl_seconds: i64,
    ) -> Result<Self, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Ok(Self {
            iss: issuer.to_string(),
            sub: subject_id.to_string(),
            exp: rfc3339_from_unix(now + ttl_seconds)?,
            iat: rfc3339_from_unix(now)?,
            jti: Uuid::new_v4().to_string(),
            tv: token_version,
        })
    }

    /// The numeric principal id carried in `sub`.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when `sub` is not numeric; a malformed subject is a
    /// forged or corrupted token, never a caller-facing detail.
    pub fn subject_id(&self) -> Result<i64, AuthError> {
        self.sub.parse().map_err(|_| AuthError::Unauthorized)
    }

    /// Expiry as unix seconds.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when `exp` does not parse.
    pub fn expires_at_unix(&self) -> Result<i64, AuthError> {
        unix_from_rfc3339(&self.exp).map_err(|_| AuthError::Unauthorized)
    }
}

pub struct TokenSigner {
    secret: AsymmetricSecretKey<V4>,
    public: AsymmetricPublicKey<V4>,
}

impl TokenSigner {
    /// Generate a fresh Ed25519 keypair. Intended for tests and local
    /// development; production loads a provisioned PASERK.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate() -> Result<Self, AuthError> {
        let pair = AsymmetricKeyPair::<V4>::generate()
            .map_err(|_| AuthError::Crypto("failed to generate signing keypair".to_string()))?;
        Ok(Self {
            secret: pair.secret,
            public: pair.public,
        })
    }

    /// Load the signing key from its canonical `k4.secret` PASERK form.
    ///
    /// # Errors
    ///
    /// `Validation` for anything that is not a well-formed `k4.secret`
    /// string. Enforced here, at construction, so drifted key formats are
    /// caught at enrollment rather than tolerated at verify time.
    pub fn from_paserk(secret_paserk: &str) -> Result<Self, AuthError> {
        if !secret_paserk.starts_with(SECRET_PASERK_HEADER) {
            return Err(AuthError::Validation(
                "signing key must be a k4.secret PASERK".to_string(),
            ));
        }
        let secret = AsymmetricSecretKey::<V4>::try_from(secret_paserk).map_err(|_| {
            AuthError::Validation("signing key must be a k4.secret PASERK".to_string())
        })?;
        // An Ed25519 secret is seed || public; the verifying half is the
        // trailing 32 bytes.
        let public_bytes = &secret.as_bytes()[32..];
        let public = AsymmetricPublicKey::<V4>::from(public_bytes)
            .map_err(|_| AuthError::Crypto("failed to derive verifying key".to_string()))?;
        Ok(Self { secret, public })
    }

    /// Canonical `k4.public` form of the verifying key.
    ///
    /// # Errors
    ///
    /// Returns an error if PASERK serialization fails.
    pub fn paserk_public(&self) -> Result<String, AuthError> {
        let mut paserk = String::new();
        self.public
            .fmt(&mut paserk)
            .map_err(|_| AuthError::Crypto("failed to serialize verifying key".to_string()))?;
        Ok(paserk)
    }

    /// Canonical `k4.secret` form, for provisioning storage.
    ///
    /// # Errors
    ///
    /// Returns an error if PASERK serialization fails.
    pub fn paserk_secret(&self) -> Result<String, AuthError> {
        let mut paserk = String::new();
        self.secret
            .fmt(&mut paserk)
            .map_err(|_| AuthError::Crypto("failed to serialize signing key".to_string()))?;
        Ok(paserk)
    }

    /// Sign claims into a `v4.public` token.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or signing fails.
    pub fn sign(&self, claims: &AccessTokenClaims) -> Result<String, AuthError> {
        let payload = serde_json::to_vec(claims)
            .map_err(|err| AuthError::Crypto(format!("failed to encode claims: {err}")))?;
        PublicToken::sign(&self.secret, &payload, None, None)
            .map_err(|_| AuthError::Crypto("failed to sign access token".to_string()))
    }

    /// Verify signature and time bounds, returning the claims.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for every failure: malformed token, bad signature,
    /// expired, not yet valid, or wrong issuer. Callers must not be able
    /// to tell which check failed.
    pub fn verify(
        &self,
        token: &str,
        expected_issuer: &str,
    ) -> Result<AccessTokenClaims, AuthError> {
        let untrusted =
            UntrustedToken::<Public, V4>::try_from(token).map_err(|_| AuthError::Unauthorized)?;
        let trusted = PublicToken::verify(&self.public, &untrusted, None, None)
            .map_err(|_| AuthError::Unauthorized)?;
        let claims: AccessTokenClaims =
            serde_json::from_str(trusted.payload()).map_err(|_| AuthError::Unauthorized)?;

        if claims.iss != expected_issuer {
            return Err(AuthError::Unauthorized);
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let iat = unix_from_rfc3339(&claims.iat).map_err(|_| AuthError::Unauthorized)?;
        let exp = claims.expires_at_unix()?;
        if iat > now || exp <= now {
            return Err(AuthError::Unauthorized);
        }
        Ok(claims)
    }
}

/// Decode a token's payload without verifying its signature.
///
/// Used only by deny-side operations (blacklisting) that need `jti` and
/// the remaining lifetime; nothing decoded here grants access.
///
/// # Errors
///
/// `Validation` when the token is not a structurally valid `v4.public`
/// payload.
pub fn decode_unverified(token: &str) -> Result<AccessTokenClaims, AuthError> {
    let body = token
        .strip_prefix(TOKEN_HEADER)
        .ok_or_else(|| AuthError::Validation("not a v4.public token".to_string()))?;
    let body = body.split('.').next().unwrap_or(body);
    let message = Base64UrlUnpadded::decode_vec(body)
        .map_err(|_| AuthError::Validation("invalid token encoding".to_string()))?;
    if message.len() <= ED25519_SIGNATURE_LEN {
        return Err(AuthError::Validation("truncated token".to_string()));
    }
    let payload = &message[..message.len() - ED25519_SIGNATURE_LEN];
    serde_json::from_slice(payload)
        .map_err(|_| AuthError::Validation("invalid token payload".to_string()))
}

fn rfc3339_from_unix(unix_seconds: i64) -> Result<String, AuthError> {
    let dt = OffsetDateTime::from_unix_timestamp(unix_seconds)
        .map_err(|_| AuthError::Crypto("timestamp out of range".to_string()))?;
    dt.format(&Rfc3339)
        .map_err(|_| AuthError::Crypto("failed to format timestamp".to_string()))
}

fn unix_from_rfc3339(value: &str) -> Result<i64, AuthError> {
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|_| AuthError::Crypto("failed to parse timestamp".to_string()))?;
    Ok(dt.unix_timestamp())
}

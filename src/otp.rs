//! One-time code challenges for enrollment and recovery flows.
//!
//! State machine per `(purpose, subject)`: NONE -> ISSUED -> {VERIFIED |
//! EXPIRED | LOCKED}. Codes are single-use and stored only as lookup
//! hashes; a store dump never yields live codes. Attempt decrements go
//! through the store's atomic decrement so concurrent guesses cannot both
//! slip past the final attempt.

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, rngs::OsRng};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::keyring::KeyRing;
use crate::store::EphemeralStore;

/// Named flows that carry an OTP step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtpPurpose {
    Signup,
    SignInRecovery,
    PinReset,
    EmailChange,
}

impl OtpPurpose {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::Signup => "signup",
            OtpPurpose::SignInRecovery => "signin_recovery",
            OtpPurpose::PinReset => "pin_reset",
            OtpPurpose::EmailChange => "email_change",
        }
    }
}

/// Outcome of a verification attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtpVerification {
    /// Code matched; the challenge is consumed.
    Verified,
    /// Wrong code; the attempt budget shrank by one.
    Mismatch,
    /// No live challenge for this purpose and subject.
    Expired,
    /// Attempt budget exhausted. Maps to `RateLimited` at the boundary,
    /// distinct from a plain wrong-code response.
    Locked,
}

#[derive(Serialize, Deserialize)]
struct OtpRecord {
    code_hash: String,
}

const CODE_LEN: usize = 6;

pub struct OtpChallenge {
    store: Arc<dyn EphemeralStore>,
    keyring: Arc<KeyRing>,
    config: AuthConfig,
}

impl OtpChallenge {
    #[must_use]
    pub fn new(store: Arc<dyn EphemeralStore>, keyring: Arc<KeyRing>, config: AuthConfig) -> Self {
        Self {
            store,
            keyring,
            config,
        }
    }

    /// Issue a fresh code for `(purpose, subject)`, replacing any prior
    /// challenge and resetting the attempt budget to the configured
    /// maximum. A resend is the same operation: it intentionally grants a
    /// fresh budget (product decision), but issuance itself is capped per
    /// window so the budget reset cannot be farmed.
    ///
    /// # Errors
    ///
    /// `RateLimited` once the issuance cap for the window is exhausted.
    pub async fn issue(&self, purpose: OtpPurpose, subject: &str) -> Result<String, AuthError> {
        let sends = self
            .store
            .increment(
                &send_budget_key(purpose, subject),
                Duration::from_secs(seconds(self.config.otp_resend_window_seconds())),
            )
            .await?;
        if sends > i64::from(self.config.otp_resend_cap()) {
            return Err(AuthError::RateLimited);
        }

        let code = generate_code();
        let record = OtpRecord {
            code_hash: self.keyring.hash(&code).as_str().to_string(),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| AuthError::Crypto(format!("failed to encode challenge: {err}")))?;

        let ttl = Duration::from_secs(seconds(self.config.otp_ttl_seconds()));
        self.store.put(&code_key(purpose, subject), &payload, ttl).await?;
        self.store
            .put(
                &attempts_key(purpose, subject),
                &self.config.otp_max_attempts().to_string(),
                ttl,
            )
            .await?;
        Ok(code)
    }

    /// Alias for [`issue`](Self::issue); a resend overwrites the prior
    /// challenge wholesale.
    ///
    /// # Errors
    ///
    /// Same as `issue`.
    pub async fn resend(&self, purpose: OtpPurpose, subject: &str) -> Result<String, AuthError> {
        self.issue(purpose, subject).await
    }

    /// Check a supplied code. Exhaustion is checked before comparison, so
    /// a locked challenge reports `Locked` even for the right code.
    ///
    /// # Errors
    ///
    /// Only store failures; every protocol outcome is a variant of
    /// [`OtpVerification`].
    pub async fn verify(
        &self,
        purpose: OtpPurpose,
        subject: &str,
        supplied_code: &str,
    ) -> Result<OtpVerification, AuthError> {
        let Some(payload) = self.store.get(&code_key(purpose, subject)).await? else {
            return Ok(OtpVerification::Expired);
        };
        let record: OtpRecord = serde_json::from_str(&payload).map_err(|_| {
            AuthError::CorruptedRecord {
                record: format!("otp:{}:{subject}", purpose.as_str()),
            }
        })?;

        let attempts = self
            .store
            .get(&attempts_key(purpose, subject))
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        if attempts <= 0 {
            return Ok(OtpVerification::Locked);
        }

        if self.keyring.hash(supplied_code).as_str() != record.code_hash {
            let remaining = self
                .store
                .decrement(&attempts_key(purpose, subject))
                .await?
                .unwrap_or(0);
            if remaining <= 0 {
                return Ok(OtpVerification::Locked);
            }
            return Ok(OtpVerification::Mismatch);
        }

        // Single use: consume the challenge and its budget together.
        self.store.delete(&code_key(purpose, subject)).await?;
        self.store.delete(&attempts_key(purpose, subject)).await?;
        Ok(OtpVerification::Verified)
    }
}

fn generate_code() -> String {
    // Leading digit 1-9: a zero-led code renders ambiguously in SMS and
    // email clients that strip leading zeros.
    let mut rng = OsRng;
    let mut code = String::with_capacity(CODE_LEN);
    code.push(char::from(b'0' + rng.gen_range(1..=9u8)));
    for _ in 1..CODE_LEN {
        code.push(char::from(b'0' + rng.gen_range(0..=9u8)));
    }
    code
}

fn code_key(purpose: OtpPurpose, subject: &str) -> String {
    format!("otp:{}:{subject}", purpose.as_str())
}

fn attempts_key(purpose: OtpPurpose, subject: &str) -> String {
    format!("otp:{}:{subject}:attempts", purpose.as_str())
}

fn send_budget_key(purpose: OtpPurpose, subject: &str) -> String {
    format!("otp:{}:{subject}:sends", purpose.as_str())
}

fn seconds(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

//! Enrollment step machine with resume-after-interruption.
//!
//! The flow is linear with one branch: phone verification through PIN
//! setup, then the identity-verification sub-flow, which can fail
//! recoverably and loop back. State lives in the ephemeral store under a
//! long TTL (~100 days); completion re-arms the TTL to a short grace
//! window so late duplicate completion signals stay idempotent, after
//! which the entry ages out on its own.
//!
//! The state carries references (principal id, provider ref), never PII:
//! identity data belongs to the credential vault.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::error;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::notify::WalletProvisioner;
use crate::store::EphemeralStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnboardingStep {
    PhoneVerification,
    PhoneVerified,
    BasicInfo,
    PasswordSetup,
    PinSetup,
    VerificationInitiated,
    VerificationPending,
    VerificationSuccess,
    VerificationFailed,
    Completed,
}

impl OnboardingStep {
    /// Legal forward edges. `VerificationFailed -> VerificationInitiated`
    /// is the recovery loop; everything else marches forward.
    fn allows(self, to: OnboardingStep) -> bool {
        use OnboardingStep::{
            BasicInfo, Completed, PasswordSetup, PhoneVerification, PhoneVerified, PinSetup,
            VerificationFailed, VerificationInitiated, VerificationPending, VerificationSuccess,
        };
        matches!(
            (self, to),
            (PhoneVerification, PhoneVerified)
                | (PhoneVerified, BasicInfo)
                | (BasicInfo, PasswordSetup)
                | (PasswordSetup, PinSetup)
                | (PinSetup, VerificationInitiated)
                | (VerificationInitiated, VerificationPending)
                | (VerificationPending, VerificationSuccess)
                | (VerificationPending, VerificationFailed)
                | (VerificationFailed, VerificationInitiated)
                | (VerificationSuccess, Completed)
        )
    }
}

/// Step-scoped data. One variant per step that produces data, so an
/// out-of-place payload is unrepresentable rather than silently merged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OnboardingPatch {
    None,
    PhoneNumber(String),
    /// Completing BASIC_INFO creates the principal; the state keeps only
    /// its id.
    BasicInfo {
        principal_id: i64,
    },
    PasswordSet,
    PinSet,
    VerificationRef(String),
    VerificationResult {
        passed: bool,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingData {
    pub phone_number: Option<String>,
    pub principal_id: Option<i64>,
    pub password_set: bool,
    pub pin_set: bool,
    pub verification_ref: Option<String>,
    pub verification_completed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnboardingState {
    pub subject: String,
    pub current_step: OnboardingStep,
    pub completed_steps: Vec<OnboardingStep>,
    pub data: OnboardingData,
    pub created_at: i64,
    pub last_updated: i64,
}

pub struct OnboardingProgress {
    store: Arc<dyn EphemeralStore>,
    wallets: Arc<dyn WalletProvisioner>,
    config: AuthConfig,
}

impl OnboardingProgress {
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        wallets: Arc<dyn WalletProvisioner>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            wallets,
            config,
        }
    }

    /// Begin enrollment, or resume an interrupted one: an existing state
    /// for the subject is returned untouched.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn start(
        &self,
        subject: &str,
        phone_number: &str,
    ) -> Result<OnboardingState, AuthError> {
        if let Some(existing) = self.load(subject).await? {
            return Ok(existing);
        }
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let state = OnboardingState {
            subject: subject.to_string(),
            current_step: OnboardingStep::PhoneVerification,
            completed_steps: Vec::new(),
            data: OnboardingData {
                phone_number: Some(phone_number.to_string()),
                ..OnboardingData::default()
            },
            created_at: now,
            last_updated: now,
        };
        self.save(&state, self.enrollment_ttl()).await?;
        Ok(state)
    }

    /// Move to `to_step`, folding the current step into the completed set
    /// (idempotently) and applying the step's data patch.
    ///
    /// # Errors
    ///
    /// `NotFound` when no enrollment is in flight, `Validation` for an
    /// illegal transition or a patch that does not belong to the step
    /// being completed.
    pub async fn advance(
        &self,
        subject: &str,
        to_step: OnboardingStep,
        patch: OnboardingPatch,
    ) -> Result<OnboardingState, AuthError> {
        let mut state = self.load(subject).await?.ok_or(AuthError::NotFound)?;

        if !state.current_step.allows(to_step) {
            return Err(AuthError::Validation(format!(
                "cannot advance from {:?} to {to_step:?}",
                state.current_step
            )));
        }
        apply_patch(&mut state.data, state.current_step, to_step, &patch)?;

        if !state.completed_steps.contains(&state.current_step) {
            state.completed_steps.push(state.current_step);
        }

        // Completing BASIC_INFO provisions the wallet, best-effort:
        // failure never fails the enrollment step.
        if state.current_step == OnboardingStep::BasicInfo {
            if let Some(principal_id) = state.data.principal_id {
                if let Err(err) = self.wallets.create_wallet(principal_id).await {
                    error!(principal_id, "Failed to provision wallet: {err}");
                }
            }
        }

        state.current_step = to_step;
        state.last_updated = OffsetDateTime::now_utc().unix_timestamp();

        let ttl = if to_step == OnboardingStep::Completed {
            self.grace_ttl()
        } else {
            self.enrollment_ttl()
        };
        self.save(&state, ttl).await?;
        Ok(state)
    }

    /// Where to drop the subject back into the flow. `None` means
    /// nothing to resume: no enrollment in flight, or already completed.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn get_resume_info(
        &self,
        subject: &str,
    ) -> Result<Option<OnboardingState>, AuthError> {
        let state = self.load(subject).await?;
        Ok(state.filter(|state| state.current_step != OnboardingStep::Completed))
    }

    async fn load(&self, subject: &str) -> Result<Option<OnboardingState>, AuthError> {
        let Some(payload) = self.store.get(&state_key(subject)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&payload)
            .map(Some)
            .map_err(|_| AuthError::CorruptedRecord {
                record: format!("onboarding:{subject}"),
            })
    }

    async fn save(&self, state: &OnboardingState, ttl: Duration) -> Result<(), AuthError> {
        let payload = serde_json::to_string(state)
            .map_err(|err| AuthError::Crypto(format!("failed to encode onboarding state: {err}")))?;
        self.store.put(&state_key(&state.subject), &payload, ttl).await
    }

    fn enrollment_ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.config.onboarding_ttl_seconds()).unwrap_or(0))
    }

    fn grace_ttl(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.config.completion_grace_seconds()).unwrap_or(0))
    }
}

/// Fold a patch into the data block, enforcing that it belongs to the
/// step being completed.
fn apply_patch(
    data: &mut OnboardingData,
    current: OnboardingStep,
    to: OnboardingStep,
    patch: &OnboardingPatch,
) -> Result<(), AuthError> {
    match (patch, current) {
        (OnboardingPatch::None, _) => {
            if current == OnboardingStep::BasicInfo {
                // The principal reference is mandatory output of this step.
                return Err(AuthError::Validation(
                    "completing basic info requires the principal reference".to_string(),
                ));
            }
        }
        (OnboardingPatch::PhoneNumber(number), OnboardingStep::PhoneVerification) => {
            data.phone_number = Some(number.clone());
        }
        (OnboardingPatch::BasicInfo { principal_id }, OnboardingStep::BasicInfo) => {
            data.principal_id = Some(*principal_id);
        }
        (OnboardingPatch::PasswordSet, OnboardingStep::PasswordSetup) => {
            data.password_set = true;
        }
        (OnboardingPatch::PinSet, OnboardingStep::PinSetup) => {
            data.pin_set = true;
        }
        (OnboardingPatch::VerificationRef(reference), OnboardingStep::VerificationInitiated) => {
            data.verification_ref = Some(reference.clone());
        }
        (OnboardingPatch::VerificationResult { passed }, OnboardingStep::VerificationPending) => {
            data.verification_completed = *passed;
        }
        (patch, step) => {
            return Err(AuthError::Validation(format!(
                "patch {patch:?} does not belong to step {step:?}"
            )));
        }
    }

    // A failed verification is a recoverable dead-end: the completion
    // flag is cleared so the subject re-enters the sub-flow cleanly.
    if to == OnboardingStep::VerificationFailed {
        data.verification_completed = false;
    }
    Ok(())
}

fn state_key(subject: &str) -> String {
    format!("onboarding:{subject}")
}

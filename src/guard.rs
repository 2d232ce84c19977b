//! Brute-force defense for authentication attempts.
//!
//! Two independent fixed-window counters per attempt: one keyed by the
//! principal, one by the origin IP. The principal counter escalates to a
//! durable lock on the identity row (it must survive counter expiry); the
//! IP counter uses a coarser ceiling and refuses all attempts from that
//! origin regardless of target, to blunt distributed guessing.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{error, info};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::notify::NotificationSender;
use crate::principal::PrincipalRepo;
use crate::store::EphemeralStore;
use crate::vault::Principal;

/// What a recorded failure escalated to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counted; attempts remain before the threshold.
    Counted(i64),
    /// This failure crossed the threshold and locked the principal.
    LockedOut,
}

pub struct BruteForceGuard {
    store: Arc<dyn EphemeralStore>,
    repo: Arc<dyn PrincipalRepo>,
    notifier: Arc<dyn NotificationSender>,
    config: AuthConfig,
}

impl BruteForceGuard {
    #[must_use]
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        repo: Arc<dyn PrincipalRepo>,
        notifier: Arc<dyn NotificationSender>,
        config: AuthConfig,
    ) -> Self {
        Self {
            store,
            repo,
            notifier,
            config,
        }
    }

    /// Gate to run before any credential check. Refuses throttled origins
    /// and durably locked principals.
    ///
    /// # Errors
    ///
    /// `RateLimited` when the origin or the principal is locked out.
    pub async fn preflight(&self, principal_id: Option<i64>, ip: &str) -> Result<(), AuthError> {
        if self.is_ip_throttled(ip).await? {
            return Err(AuthError::RateLimited);
        }
        if let Some(id) = principal_id {
            if self.is_locked(id).await? {
                return Err(AuthError::RateLimited);
            }
        }
        Ok(())
    }

    /// Count a failed attempt against a known principal and its origin.
    /// Crossing the threshold sets a durable lock and emits a best-effort
    /// lockout notice.
    ///
    /// # Errors
    ///
    /// Store or repo failures only; the notification result is logged and
    /// swallowed.
    pub async fn record_failure(
        &self,
        principal: &Principal,
        ip: &str,
    ) -> Result<FailureOutcome, AuthError> {
        self.record_ip_failure(ip).await?;

        let count = self
            .store
            .increment(
                &principal_key(principal.id),
                window(self.config.signin_failure_window_seconds()),
            )
            .await?;

        if count < self.config.signin_failure_threshold() {
            return Ok(FailureOutcome::Counted(count));
        }

        let lock_until =
            OffsetDateTime::now_utc() + time::Duration::seconds(self.config.lockout_seconds());
        self.repo.set_lock(principal.id, Some(lock_until)).await?;
        info!(principal_id = principal.id, "account locked after repeated sign-in failures");

        if let Err(err) = self
            .notifier
            .send_email(
                &principal.profile.email,
                "Your account has been temporarily locked",
                "We detected repeated failed sign-in attempts, so your account \
                 is locked for the next hour. If this wasn't you, reset your \
                 password once the lock lifts.",
                "<p>We detected repeated failed sign-in attempts, so your \
                 account is locked for the next hour.</p>",
            )
            .await
        {
            error!("Failed to send lockout notification: {err}");
        }

        Ok(FailureOutcome::LockedOut)
    }

    /// Count a failed attempt from an origin with no resolvable
    /// principal (unknown identifier). Only the IP counter moves.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn record_ip_failure(&self, ip: &str) -> Result<i64, AuthError> {
        self.store
            .increment(
                &ip_key(ip),
                window(self.config.ip_failure_window_seconds()),
            )
            .await
    }

    /// Clear both counters and any durable lock after a successful
    /// authentication.
    ///
    /// # Errors
    ///
    /// Store or repo failures only.
    pub async fn record_success(&self, principal_id: i64, ip: &str) -> Result<(), AuthError> {
        self.store.delete(&principal_key(principal_id)).await?;
        self.store.delete(&ip_key(ip)).await?;
        self.repo.set_lock(principal_id, None).await?;
        Ok(())
    }

    /// Whether the durable lock on the principal row is in force.
    ///
    /// # Errors
    ///
    /// Repo failures only. Unknown principals read as unlocked; sign-in
    /// responses must not reveal whether the identity exists.
    pub async fn is_locked(&self, principal_id: i64) -> Result<bool, AuthError> {
        let Some(record) = self.repo.find_by_id(principal_id).await? else {
            return Ok(false);
        };
        Ok(record.is_locked(OffsetDateTime::now_utc()))
    }

    /// Whether the origin has exhausted its window ceiling.
    ///
    /// # Errors
    ///
    /// Store failures only.
    pub async fn is_ip_throttled(&self, ip: &str) -> Result<bool, AuthError> {
        let count = self
            .store
            .get(&ip_key(ip))
            .await?
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(count >= self.config.ip_failure_ceiling())
    }
}

fn principal_key(principal_id: i64) -> String {
    format!("bf:user:{principal_id}")
}

fn ip_key(ip: &str) -> String {
    format!("bf:ip:{ip}")
}

fn window(seconds: i64) -> Duration {
    Duration::from_secs(u64::try_from(seconds).unwrap_or(0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::keyring::tests::test_ring;
    use crate::principal::MemoryPrincipalRepo;
    use crate::store::MemoryStore;
    use crate::vault::{CredentialVault, PrincipalProfile};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use tokio::sync::Mutex;

    struct RecordingNotifier {
        emails: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSender for RecordingNotifier {
        async fn send_sms(&self, _to: &str, _body: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn send_email(
            &self,
            to: &str,
            _subject: &str,
            _text: &str,
            _html: &str,
        ) -> Result<(), AuthError> {
            self.emails.lock().await.push(to.to_string());
            Ok(())
        }
    }

    struct Fixture {
        guard: BruteForceGuard,
        repo: Arc<MemoryPrincipalRepo>,
        notifier: Arc<RecordingNotifier>,
        principal: Principal,
    }

    async fn fixture(config: AuthConfig) -> Fixture {
        let repo = Arc::new(MemoryPrincipalRepo::new());
        let vault = CredentialVault::new(
            Arc::new(test_ring()),
            repo.clone(),
            SecretString::from("pepper"),
        );
        let principal = vault
            .create_principal(&PrincipalProfile {
                full_name: "Ada Lovelace".to_string(),
                email: "ada@cambio.dev".to_string(),
                date_of_birth: "1990-12-10".to_string(),
                address: "1 Analytical Way".to_string(),
            })
            .await
            .unwrap();
        let notifier = Arc::new(RecordingNotifier {
            emails: Mutex::new(Vec::new()),
        });
        let guard = BruteForceGuard::new(
            Arc::new(MemoryStore::new()),
            repo.clone(),
            notifier.clone(),
            config,
        );
        Fixture {
            guard,
            repo,
            notifier,
            principal,
        }
    }

    #[tokio::test]
    async fn fifth_failure_locks_fourth_does_not() {
        let f = fixture(AuthConfig::new()).await;
        for expected in 1..=4 {
            let outcome = f.guard.record_failure(&f.principal, "203.0.113.7").await.unwrap();
            assert_eq!(outcome, FailureOutcome::Counted(expected));
            assert!(!f.guard.is_locked(f.principal.id).await.unwrap());
        }

        let outcome = f.guard.record_failure(&f.principal, "203.0.113.7").await.unwrap();
        assert_eq!(outcome, FailureOutcome::LockedOut);
        assert!(f.guard.is_locked(f.principal.id).await.unwrap());

        // Lock lands roughly one hour out.
        let row = f.repo.find_by_id(f.principal.id).await.unwrap().unwrap();
        let until = row.lock_until.unwrap();
        let delta = until - OffsetDateTime::now_utc();
        assert!(delta > time::Duration::minutes(59));
        assert!(delta <= time::Duration::hours(1));

        assert_eq!(
            f.notifier.emails.lock().await.as_slice(),
            ["ada@cambio.dev"]
        );
    }

    #[tokio::test]
    async fn preflight_refuses_locked_principal() {
        let f = fixture(AuthConfig::new().with_signin_failure_threshold(1)).await;
        f.guard.record_failure(&f.principal, "203.0.113.7").await.unwrap();
        let err = f
            .guard
            .preflight(Some(f.principal.id), "198.51.100.9")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
    }

    #[tokio::test]
    async fn success_clears_counters_and_lock() {
        let f = fixture(AuthConfig::new().with_signin_failure_threshold(2)).await;
        f.guard.record_failure(&f.principal, "203.0.113.7").await.unwrap();
        f.guard.record_failure(&f.principal, "203.0.113.7").await.unwrap();
        assert!(f.guard.is_locked(f.principal.id).await.unwrap());

        f.guard.record_success(f.principal.id, "203.0.113.7").await.unwrap();
        assert!(!f.guard.is_locked(f.principal.id).await.unwrap());
        assert!(!f.guard.is_ip_throttled("203.0.113.7").await.unwrap());

        // Counter restarts from one after the reset.
        let outcome = f.guard.record_failure(&f.principal, "203.0.113.7").await.unwrap();
        assert_eq!(outcome, FailureOutcome::Counted(1));
    }

    #[tokio::test]
    async fn ip_ceiling_throttles_regardless_of_principal() {
        let f = fixture(AuthConfig::new().with_ip_failure_ceiling(3)).await;
        for _ in 0..3 {
            f.guard.record_ip_failure("203.0.113.7").await.unwrap();
        }
        assert!(f.guard.is_ip_throttled("203.0.113.7").await.unwrap());
        // Preflight with no principal still refuses the origin.
        let err = f.guard.preflight(None, "203.0.113.7").await.unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
        // Other origins are unaffected.
        assert!(!f.guard.is_ip_throttled("198.51.100.9").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ip_window_expires() {
        let f = fixture(
            AuthConfig::new()
                .with_ip_failure_ceiling(2)
                .with_ip_failure_window_seconds(10),
        )
        .await;
        f.guard.record_ip_failure("203.0.113.7").await.unwrap();
        f.guard.record_ip_failure("203.0.113.7").await.unwrap();
        assert!(f.guard.is_ip_throttled("203.0.113.7").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!f.guard.is_ip_throttled("203.0.113.7").await.unwrap());
        assert_eq!(f.guard.record_ip_failure("203.0.113.7").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_principal_reads_unlocked() {
        let f = fixture(AuthConfig::new()).await;
        assert!(!f.guard.is_locked(9999).await.unwrap());
    }
}

//! End-to-end lifecycle scenarios over the in-memory backends.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use secrecy::SecretString;
use time::OffsetDateTime;

use cambio_auth::config::AuthConfig;
use cambio_auth::error::AuthError;
use cambio_auth::guard::{BruteForceGuard, FailureOutcome};
use cambio_auth::keyring::{KeyClass, KeyRing, KeyRingConfig, LookupHash};
use cambio_auth::ledger::{MemoryLedger, RevocationReason, SessionLedger};
use cambio_auth::notify::{NoopGeoLookup, NoopNotifier};
use cambio_auth::otp::{OtpChallenge, OtpPurpose, OtpVerification};
use cambio_auth::principal::{
    MemoryPrincipalRepo, NewPrincipal, PiiUpdate, PrincipalRecord, PrincipalRepo,
};
use cambio_auth::session::{NewDevice, SessionManager, TokenSigner};
use cambio_auth::store::MemoryStore;
use cambio_auth::vault::{CredentialVault, Principal, PrincipalProfile};

fn test_ring() -> KeyRing {
    let config = KeyRingConfig::new(
        SecretString::from("integration-master-secret"),
        "integration-kdf-salt".to_string(),
        SecretString::from("integration-lookup-salt"),
    )
    .with_kdf_params(1024, 1, 1);
    KeyRing::new(&config).unwrap()
}

fn profile(email: &str) -> PrincipalProfile {
    PrincipalProfile {
        full_name: "Grace Hopper".to_string(),
        email: email.to_string(),
        date_of_birth: "1985-12-09".to_string(),
        address: "3 Compiler Court, Porto".to_string(),
    }
}

fn device(name: &str) -> NewDevice {
    NewDevice {
        device_name: name.to_string(),
        device_type: "ios".to_string(),
        ip: "203.0.113.7".to_string(),
        user_agent: "cambio-app/3.1".to_string(),
    }
}

struct World {
    vault: CredentialVault,
    sessions: SessionManager,
    guard: BruteForceGuard,
    ledger: Arc<MemoryLedger>,
    repo: Arc<MemoryPrincipalRepo>,
}

fn world(config: AuthConfig) -> World {
    let ring = Arc::new(test_ring());
    let repo = Arc::new(MemoryPrincipalRepo::new());
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(MemoryLedger::new());

    let vault = CredentialVault::new(ring.clone(), repo.clone(), SecretString::from("pepper"));
    let sessions = SessionManager::new(
        store.clone(),
        ledger.clone(),
        repo.clone(),
        TokenSigner::generate().unwrap(),
        Arc::new(NoopNotifier),
        Arc::new(NoopGeoLookup),
        config.clone(),
    );
    let guard = BruteForceGuard::new(store, repo.clone(), Arc::new(NoopNotifier), config);
    World {
        vault,
        sessions,
        guard,
        ledger,
        repo,
    }
}

async fn enroll(world: &World, email: &str) -> Principal {
    world.vault.create_principal(&profile(email)).await.unwrap()
}

#[tokio::test]
async fn rotation_chain_leaves_audit_trail() {
    let w = world(AuthConfig::new());
    let user = enroll(&w, "grace@cambio.dev").await;

    let first = w.sessions.issue_session(&user, device("iPhone 15")).await.unwrap();
    let second = w.sessions.refresh(&first.refresh_token).await.unwrap();
    let third = w.sessions.refresh(&second.refresh_token).await.unwrap();

    // Both superseded tokens are revoked in the ledger with the rotation
    // reason.
    for token_id in [first.refresh_token_id, second.refresh_token_id] {
        let row = w.ledger.find_by_id(user.id, token_id).await.unwrap().unwrap();
        assert!(row.revoked);
        assert_eq!(row.revoked_reason, Some(RevocationReason::TokenRefreshed));
    }

    // Only the latest refresh token is alive.
    assert!(w.sessions.refresh(&first.refresh_token).await.is_err());
    assert!(w.sessions.refresh(&second.refresh_token).await.is_err());
    let fourth = w.sessions.refresh(&third.refresh_token).await.unwrap();
    assert!(
        w.sessions
            .validate_access_token(&fourth.access_token)
            .await
            .is_ok()
    );

    // One active session remains in the device list.
    assert_eq!(w.sessions.list_active_sessions(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn revoke_all_invalidates_outstanding_access_tokens() {
    let w = world(AuthConfig::new());
    let user = enroll(&w, "grace@cambio.dev").await;

    let phone = w.sessions.issue_session(&user, device("iPhone 15")).await.unwrap();
    let tablet = w.sessions.issue_session(&user, device("iPad Air")).await.unwrap();
    w.sessions.validate_access_token(&phone.access_token).await.unwrap();
    w.sessions.validate_access_token(&tablet.access_token).await.unwrap();

    w.sessions.revoke_all(user.id).await.unwrap();

    // The signatures and expiries are still valid; the bumped token
    // version alone kills them.
    assert!(w.sessions.validate_access_token(&phone.access_token).await.is_err());
    assert!(w.sessions.validate_access_token(&tablet.access_token).await.is_err());
    assert!(w.sessions.refresh(&phone.refresh_token).await.is_err());
    assert!(w.sessions.refresh(&tablet.refresh_token).await.is_err());
    assert!(w.sessions.list_active_sessions(user.id).await.unwrap().is_empty());

    for view in w.ledger.history(user.id).await {
        assert_eq!(view.revoked_reason, Some(RevocationReason::LogoutAllDevices));
    }

    // A fresh sign-in works and carries the new version.
    let user = w.vault.fetch(user.id).await.unwrap().unwrap();
    assert_eq!(user.token_version, 1);
    let fresh = w.sessions.issue_session(&user, device("iPhone 15")).await.unwrap();
    w.sessions.validate_access_token(&fresh.access_token).await.unwrap();
}

#[tokio::test]
async fn otp_budget_locks_on_the_last_attempt() {
    let ring = Arc::new(test_ring());
    let otp = OtpChallenge::new(
        Arc::new(MemoryStore::new()),
        ring,
        AuthConfig::new().with_otp_max_attempts(3),
    );

    let code = otp.issue(OtpPurpose::SignInRecovery, "+351900000001").await.unwrap();
    let wrong = if code == "999999" { "888888" } else { "999999" };

    for expected in [OtpVerification::Mismatch, OtpVerification::Mismatch] {
        assert_eq!(
            otp.verify(OtpPurpose::SignInRecovery, "+351900000001", wrong)
                .await
                .unwrap(),
            expected
        );
    }
    assert_eq!(
        otp.verify(OtpPurpose::SignInRecovery, "+351900000001", wrong)
            .await
            .unwrap(),
        OtpVerification::Locked
    );

    // A fresh challenge verifies and is consumed.
    let code = otp.resend(OtpPurpose::SignInRecovery, "+351900000001").await.unwrap();
    assert_eq!(
        otp.verify(OtpPurpose::SignInRecovery, "+351900000001", &code)
            .await
            .unwrap(),
        OtpVerification::Verified
    );
    assert_eq!(
        otp.verify(OtpPurpose::SignInRecovery, "+351900000001", &code)
            .await
            .unwrap(),
        OtpVerification::Expired
    );
}

#[tokio::test]
async fn signin_lockout_after_exactly_five_failures() {
    let w = world(AuthConfig::new());
    let user = enroll(&w, "grace@cambio.dev").await;

    for _ in 0..4 {
        let outcome = w.guard.record_failure(&user, "203.0.113.7").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Counted(_)));
    }
    let row = w.repo.find_by_id(user.id).await.unwrap().unwrap();
    assert!(row.lock_until.is_none());

    let outcome = w.guard.record_failure(&user, "203.0.113.7").await.unwrap();
    assert_eq!(outcome, FailureOutcome::LockedOut);

    let row = w.repo.find_by_id(user.id).await.unwrap().unwrap();
    let delta = row.lock_until.unwrap() - OffsetDateTime::now_utc();
    assert!(delta > time::Duration::minutes(59));
    assert!(delta <= time::Duration::hours(1));

    assert!(matches!(
        w.guard.preflight(Some(user.id), "198.51.100.1").await,
        Err(AuthError::RateLimited)
    ));
}

#[tokio::test]
async fn encrypted_email_matches_wire_format_and_hides_plaintext() {
    let ring = test_ring();
    let sealed = ring.encrypt(b"a@b.com", KeyClass::Pii).unwrap();
    let encoded = sealed.to_string();

    assert_ne!(encoded, "a@b.com");
    let fields: Vec<&str> = encoded.split(':').collect();
    assert_eq!(fields.len(), 5);
    assert_eq!(fields[0], "PII");
    assert!(fields[1].starts_with('v'));
    assert!(fields[1][1..].chars().all(|c| c.is_ascii_digit()));
    for field in &fields[2..] {
        assert!(!field.is_empty());
        assert!(field.chars().all(|c| c.is_ascii_hexdigit()));
    }

    assert_eq!(ring.decrypt(&sealed).unwrap(), b"a@b.com");
}

/// Counts repo reads so the uniqueness check can be shown to touch the
/// hash index only: no row fetches, hence nothing to decrypt.
struct CountingRepo {
    inner: MemoryPrincipalRepo,
    exists_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

#[async_trait]
impl PrincipalRepo for CountingRepo {
    async fn insert(&self, principal: NewPrincipal) -> Result<PrincipalRecord, AuthError> {
        self.inner.insert(principal).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<PrincipalRecord>, AuthError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_id(id).await
    }

    async fn find_by_email_hash(
        &self,
        email_hash: &LookupHash,
    ) -> Result<Option<PrincipalRecord>, AuthError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_email_hash(email_hash).await
    }

    async fn exists_by_email_hash(&self, email_hash: &LookupHash) -> Result<bool, AuthError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists_by_email_hash(email_hash).await
    }

    async fn update_pii(&self, id: i64, update: PiiUpdate) -> Result<(), AuthError> {
        self.inner.update_pii(id, update).await
    }

    async fn set_pin_hash(&self, id: i64, pin_hash: String) -> Result<(), AuthError> {
        self.inner.set_pin_hash(id, pin_hash).await
    }

    async fn set_lock(
        &self,
        id: i64,
        lock_until: Option<OffsetDateTime>,
    ) -> Result<(), AuthError> {
        self.inner.set_lock(id, lock_until).await
    }

    async fn bump_token_version(&self, id: i64) -> Result<i64, AuthError> {
        self.inner.bump_token_version(id).await
    }

    async fn token_version(&self, id: i64) -> Result<Option<i64>, AuthError> {
        self.inner.token_version(id).await
    }
}

#[tokio::test]
async fn email_uniqueness_reads_only_the_hash_index() {
    let repo = Arc::new(CountingRepo {
        inner: MemoryPrincipalRepo::new(),
        exists_calls: AtomicUsize::new(0),
        fetch_calls: AtomicUsize::new(0),
    });
    let vault = CredentialVault::new(
        Arc::new(test_ring()),
        repo.clone(),
        SecretString::from("pepper"),
    );

    vault.create_principal(&profile("x@y.com")).await.unwrap();
    vault.create_principal(&profile("other@y.com")).await.unwrap();

    repo.exists_calls.store(0, Ordering::SeqCst);
    repo.fetch_calls.store(0, Ordering::SeqCst);

    assert!(vault.exists_by_email("x@y.com").await.unwrap());
    assert!(!vault.exists_by_email("ghost@y.com").await.unwrap());

    // Two probes of the hash index, zero row reads: no stored ciphertext
    // was ever in scope for decryption.
    assert_eq!(repo.exists_calls.load(Ordering::SeqCst), 2);
    assert_eq!(repo.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn key_rotation_re_encrypts_principals_in_place() {
    // Same master material, two ring generations sharing the repo.
    let base = || {
        KeyRingConfig::new(
            SecretString::from("integration-master-secret"),
            "integration-kdf-salt".to_string(),
            SecretString::from("integration-lookup-salt"),
        )
        .with_kdf_params(1024, 1, 1)
    };
    let repo = Arc::new(MemoryPrincipalRepo::new());

    let v1_vault = CredentialVault::new(
        Arc::new(KeyRing::new(&base()).unwrap()),
        repo.clone(),
        SecretString::from("pepper"),
    );
    let user = v1_vault.create_principal(&profile("x@y.com")).await.unwrap();

    let v2_ring = KeyRing::new(&base().with_current_version(KeyClass::Pii, 2)).unwrap();
    let v2_vault = CredentialVault::new(Arc::new(v2_ring), repo.clone(), SecretString::from("pepper"));

    // Old ciphertext still reads, then upgrades in place.
    assert_eq!(
        v2_vault.fetch(user.id).await.unwrap().unwrap().profile.email,
        "x@y.com"
    );
    assert!(v2_vault.re_encrypt_principal(user.id).await.unwrap());
    assert!(!v2_vault.re_encrypt_principal(user.id).await.unwrap());

    let row = repo.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(row.email.version(), 2);
    // Lookup hash unchanged: uniqueness checks survive the rotation.
    assert!(v2_vault.exists_by_email("x@y.com").await.unwrap());

    assert_eq!(
        v2_vault.fetch(user.id).await.unwrap().unwrap().profile.email,
        "x@y.com"
    );
}

#[tokio::test]
async fn locked_out_then_recovered_sign_in_flow() {
    let config = AuthConfig::new().with_signin_failure_threshold(2);
    let w = world(config);
    let user = enroll(&w, "grace@cambio.dev").await;
    w.vault.set_pin(user.id, "123456").await.unwrap();

    // Wrong PIN twice: guard locks the account.
    for _ in 0..2 {
        assert!(!w.vault.verify_pin(user.id, "000000").await.unwrap());
        w.guard.record_failure(&user, "203.0.113.7").await.unwrap();
    }
    assert!(matches!(
        w.guard.preflight(Some(user.id), "203.0.113.7").await,
        Err(AuthError::RateLimited)
    ));

    // Success path (e.g. after OTP recovery) clears the lock and issues
    // a session.
    assert!(w.vault.verify_pin(user.id, "123456").await.unwrap());
    w.guard.record_success(user.id, "203.0.113.7").await.unwrap();
    w.guard.preflight(Some(user.id), "203.0.113.7").await.unwrap();
    let tokens = w.sessions.issue_session(&user, device("iPhone 15")).await.unwrap();
    w.sessions.validate_access_token(&tokens.access_token).await.unwrap();
}

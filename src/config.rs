//! Lifecycle configuration shared by the auth components.

const DEFAULT_OTP_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_OTP_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_OTP_RESEND_CAP: u32 = 5;
const DEFAULT_OTP_RESEND_WINDOW_SECONDS: i64 = 60 * 60;
const DEFAULT_SIGNIN_FAILURE_THRESHOLD: i64 = 5;
const DEFAULT_SIGNIN_FAILURE_WINDOW_SECONDS: i64 = 15 * 60;
const DEFAULT_LOCKOUT_SECONDS: i64 = 60 * 60;
const DEFAULT_IP_FAILURE_CEILING: i64 = 10;
const DEFAULT_IP_FAILURE_WINDOW_SECONDS: i64 = 15 * 60;
const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 30 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_ONBOARDING_TTL_SECONDS: i64 = 100 * 24 * 60 * 60;
const DEFAULT_COMPLETION_GRACE_SECONDS: i64 = 10 * 60;
const DEFAULT_TOKEN_ISSUER: &str = "auth.cambio.dev";

/// Tunable knobs for OTP, lockout, and token lifetimes.
///
/// Defaults match production policy; tests override the windows they
/// exercise. Key material lives in [`crate::keyring::KeyRingConfig`] and
/// the PASERK strings handed to [`crate::session::TokenSigner`], not here.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    otp_ttl_seconds: i64,
    otp_max_attempts: u32,
    otp_resend_cap: u32,
    otp_resend_window_seconds: i64,
    signin_failure_threshold: i64,
    signin_failure_window_seconds: i64,
    lockout_seconds: i64,
    ip_failure_ceiling: i64,
    ip_failure_window_seconds: i64,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    onboarding_ttl_seconds: i64,
    completion_grace_seconds: i64,
    token_issuer: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            otp_ttl_seconds: DEFAULT_OTP_TTL_SECONDS,
            otp_max_attempts: DEFAULT_OTP_MAX_ATTEMPTS,
            otp_resend_cap: DEFAULT_OTP_RESEND_CAP,
            otp_resend_window_seconds: DEFAULT_OTP_RESEND_WINDOW_SECONDS,
            signin_failure_threshold: DEFAULT_SIGNIN_FAILURE_THRESHOLD,
            signin_failure_window_seconds: DEFAULT_SIGNIN_FAILURE_WINDOW_SECONDS,
            lockout_seconds: DEFAULT_LOCKOUT_SECONDS,
            ip_failure_ceiling: DEFAULT_IP_FAILURE_CEILING,
            ip_failure_window_seconds: DEFAULT_IP_FAILURE_WINDOW_SECONDS,
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            onboarding_ttl_seconds: DEFAULT_ONBOARDING_TTL_SECONDS,
            completion_grace_seconds: DEFAULT_COMPLETION_GRACE_SECONDS,
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_otp_ttl_seconds(mut self, seconds: i64) -> Self {
        self.otp_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_otp_max_attempts(mut self, attempts: u32) -> Self {
        self.otp_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_otp_resend_cap(mut self, cap: u32) -> Self {
        self.otp_resend_cap = cap;
        self
    }

    #[must_use]
    pub fn with_otp_resend_window_seconds(mut self, seconds: i64) -> Self {
        self.otp_resend_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_signin_failure_threshold(mut self, threshold: i64) -> Self {
        self.signin_failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_lockout_seconds(mut self, seconds: i64) -> Self {
        self.lockout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_ip_failure_ceiling(mut self, ceiling: i64) -> Self {
        self.ip_failure_ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn with_ip_failure_window_seconds(mut self, seconds: i64) -> Self {
        self.ip_failure_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_onboarding_ttl_seconds(mut self, seconds: i64) -> Self {
        self.onboarding_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_completion_grace_seconds(mut self, seconds: i64) -> Self {
        self.completion_grace_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String) -> Self {
        self.token_issuer = issuer;
        self
    }

    #[must_use]
    pub fn otp_ttl_seconds(&self) -> i64 {
        self.otp_ttl_seconds
    }

    #[must_use]
    pub fn otp_max_attempts(&self) -> u32 {
        self.otp_max_attempts
    }

    #[must_use]
    pub fn otp_resend_cap(&self) -> u32 {
        self.otp_resend_cap
    }

    #[must_use]
    pub fn otp_resend_window_seconds(&self) -> i64 {
        self.otp_resend_window_seconds
    }

    #[must_use]
    pub fn signin_failure_threshold(&self) -> i64 {
        self.signin_failure_threshold
    }

    #[must_use]
    pub fn signin_failure_window_seconds(&self) -> i64 {
        self.signin_failure_window_seconds
    }

    #[must_use]
    pub fn lockout_seconds(&self) -> i64 {
        self.lockout_seconds
    }

    #[must_use]
    pub fn ip_failure_ceiling(&self) -> i64 {
        self.ip_failure_ceiling
    }

    #[must_use]
    pub fn ip_failure_window_seconds(&self) -> i64 {
        self.ip_failure_window_seconds
    }

    #[must_use]
    pub fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    #[must_use]
    pub fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    #[must_use]
    pub fn onboarding_ttl_seconds(&self) -> i64 {
        self.onboarding_ttl_seconds
    }

    #[must_use]
    pub fn completion_grace_seconds(&self) -> i64 {
        self.completion_grace_seconds
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }
}

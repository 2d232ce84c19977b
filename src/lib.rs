//! # Cambio Auth (Credential & Session Lifecycle)
//!
//! `cambio-auth` is the subsystem of the Cambio platform that proves who
//! a caller is, keeps that proof valid across devices and time, defends
//! it against brute force, and stores identifying data safely at rest.
//!
//! ## Encryption at rest
//!
//! Every PII and financial field is encrypted under a versioned,
//! per-class key chain ([`keyring::KeyRing`]); equality lookups (does
//! this email exist) run over deterministic lookup hashes so rows are
//! never bulk-decrypted to answer a search.
//!
//! ## Sessions
//!
//! Access tokens are short-lived PASETO `v4.public` tokens carrying the
//! principal's token version and a unique `jti`. Refresh tokens are
//! opaque and strictly single-use: each refresh rotates the token, and
//! the superseded value is dead even before its natural expiry. Validity
//! lives in the ephemeral store (fail-closed on absence or outage); the
//! durable ledger keeps one audit row per token for revocation history
//! and the multi-device session list.
//!
//! ## Abuse defense
//!
//! OTP challenges are single-use codes with an atomically decremented
//! attempt budget. Sign-in failures feed per-principal and per-origin
//! counters; crossing the principal threshold sets a durable hour-long
//! lock on the identity row.
//!
//! Transport concerns (routing, request validation, TLS) belong to the
//! embedding service; everything here is invoked after a request reaches
//! the service boundary.

pub mod config;
pub mod error;
pub mod guard;
pub mod keyring;
pub mod ledger;
pub mod notify;
pub mod onboarding;
pub mod otp;
pub mod principal;
pub mod session;
pub mod store;
pub mod vault;

pub use config::AuthConfig;
pub use error::AuthError;

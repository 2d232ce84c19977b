//! Collaborator contracts consumed by this subsystem.
//!
//! Delivery mechanics live elsewhere; from here every call is
//! fire-and-forget. Failures are logged at the call site and never block
//! an authentication result, and `GeoLookup` output only ever annotates
//! session metadata; it never gates authorization.

use async_trait::async_trait;

use crate::error::AuthError;

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), AuthError>;

    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        text: &str,
        html: &str,
    ) -> Result<(), AuthError>;
}

#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    /// Invoked once, best-effort, after basic-info completion.
    async fn create_wallet(&self, principal_id: i64) -> Result<(), AuthError>;
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// A display string for the origin, e.g. "Lisbon, PT".
    async fn locate(&self, ip: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationSender for NoopNotifier {
    async fn send_sms(&self, _to: &str, _body: &str) -> Result<(), AuthError> {
        Ok(())
    }

    async fn send_email(
        &self,
        _to: &str,
        _subject: &str,
        _text: &str,
        _html: &str,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoopWalletProvisioner;

#[async_trait]
impl WalletProvisioner for NoopWalletProvisioner {
    async fn create_wallet(&self, _principal_id: i64) -> Result<(), AuthError> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoopGeoLookup;

#[async_trait]
impl GeoLookup for NoopGeoLookup {
    async fn locate(&self, _ip: &str) -> Option<String> {
        None
    }
}

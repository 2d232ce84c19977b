//! In-memory ledger for tests and local development.

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{NewRefreshToken, RefreshTokenRecord, RevocationReason, SessionLedger};
use crate::error::AuthError;

#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<RefreshTokenRecord>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Full audit trail for a user, newest first. Test helper; production
    /// reads go through `list_active`.
    pub async fn history(&self, user_id: i64) -> Vec<RefreshTokenRecord> {
        let rows = self.rows.lock().await;
        let mut out: Vec<RefreshTokenRecord> = rows
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        out
    }
}

#[async_trait]
impl SessionLedger for MemoryLedger {
    async fn insert(&self, token: NewRefreshToken) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().await;
        rows.push(RefreshTokenRecord {
            token_id: token.token_id,
            user_id: token.user_id,
            token_hash: token.token_hash,
            device: token.device,
            issued_at: token.issued_at,
            expires_at: token.expires_at,
            revoked: false,
            revoked_at: None,
            revoked_reason: None,
            last_used_at: None,
        });
        Ok(())
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| row.token_hash == token_hash).cloned())
    }

    async fn find_by_id(
        &self,
        user_id: i64,
        token_id: Uuid,
    ) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|row| row.user_id == user_id && row.token_id == token_id)
            .cloned())
    }

    async fn mark_revoked(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
    ) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.token_id == token_id && !row.revoked)
        {
            row.revoked = true;
            row.revoked_at = Some(OffsetDateTime::now_utc());
            row.revoked_reason = Some(reason);
        }
        Ok(())
    }

    async fn revoke_all_active(
        &self,
        user_id: i64,
        reason: RevocationReason,
    ) -> Result<Vec<RefreshTokenRecord>, AuthError> {
        let now = OffsetDateTime::now_utc();
        let mut rows = self.rows.lock().await;
        let mut closed = Vec::new();
        for row in rows
            .iter_mut()
            .filter(|row| row.user_id == user_id && !row.revoked)
        {
            row.revoked = true;
            row.revoked_at = Some(now);
            row.revoked_reason = Some(reason);
            closed.push(row.clone());
        }
        Ok(closed)
    }

    async fn touch_last_used(&self, token_id: Uuid) -> Result<(), AuthError> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.iter_mut().find(|row| row.token_id == token_id) {
            row.last_used_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn list_active(&self, user_id: i64) -> Result<Vec<RefreshTokenRecord>, AuthError> {
        let now = OffsetDateTime::now_utc();
        let rows = self.rows.lock().await;
        let mut active: Vec<RefreshTokenRecord> = rows
            .iter()
            .filter(|row| row.user_id == user_id && row.is_active(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            let a_used = a.last_used_at.unwrap_or(a.issued_at);
            let b_used = b.last_used_at.unwrap_or(b.issued_at);
            b_used.cmp(&a_used)
        });
        Ok(active)
    }

    async fn has_active_for_device(
        &self,
        user_id: i64,
        device_name: &str,
    ) -> Result<bool, AuthError> {
        let now = OffsetDateTime::now_utc();
        let rows = self.rows.lock().await;
        Ok(rows.iter().any(|row| {
            row.user_id == user_id && row.device.device_name == device_name && row.is_active(now)
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::DeviceInfo;

    fn device(name: &str) -> DeviceInfo {
        DeviceInfo {
            device_name: name.to_string(),
            device_type: "ios".to_string(),
            ip: "198.51.100.4".to_string(),
            location: Some("Lisbon, PT".to_string()),
            user_agent: "cambio-app/3.1".to_string(),
        }
    }

    fn new_token(user_id: i64, hash: &str, name: &str) -> NewRefreshToken {
        let now = OffsetDateTime::now_utc();
        NewRefreshToken {
            token_id: Uuid::new_v4(),
            user_id,
            token_hash: hash.to_string(),
            device: device(name),
            issued_at: now,
            expires_at: now + time::Duration::days(30),
        }
    }

    #[tokio::test]
    async fn insert_and_find_by_hash() {
        let ledger = MemoryLedger::new();
        ledger.insert(new_token(7, "h1", "iPhone 15")).await.unwrap();
        let row = ledger.find_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(row.user_id, 7);
        assert!(!row.revoked);
        assert!(ledger.find_by_hash("h2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_revoked_is_one_way() {
        let ledger = MemoryLedger::new();
        let token = new_token(7, "h1", "iPhone 15");
        let id = token.token_id;
        ledger.insert(token).await.unwrap();
        ledger
            .mark_revoked(id, RevocationReason::TokenRefreshed)
            .await
            .unwrap();
        let row = ledger.find_by_id(7, id).await.unwrap().unwrap();
        assert!(row.revoked);
        assert_eq!(row.revoked_reason, Some(RevocationReason::TokenRefreshed));
        assert!(row.revoked_at.is_some());

        // A second revocation with a different reason does not overwrite.
        ledger
            .mark_revoked(id, RevocationReason::LogoutAllDevices)
            .await
            .unwrap();
        let row = ledger.find_by_id(7, id).await.unwrap().unwrap();
        assert_eq!(row.revoked_reason, Some(RevocationReason::TokenRefreshed));
    }

    #[tokio::test]
    async fn revoke_all_returns_closed_rows() {
        let ledger = MemoryLedger::new();
        ledger.insert(new_token(7, "h1", "iPhone 15")).await.unwrap();
        ledger.insert(new_token(7, "h2", "Pixel 9")).await.unwrap();
        ledger.insert(new_token(8, "h3", "iPad")).await.unwrap();

        let closed = ledger
            .revoke_all_active(7, RevocationReason::LogoutAllDevices)
            .await
            .unwrap();
        assert_eq!(closed.len(), 2);
        assert!(ledger.list_active(7).await.unwrap().is_empty());
        assert_eq!(ledger.list_active(8).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_active_orders_by_recency() {
        let ledger = MemoryLedger::new();
        let first = new_token(7, "h1", "iPhone 15");
        let second = new_token(7, "h2", "Pixel 9");
        let first_id = first.token_id;
        ledger.insert(first).await.unwrap();
        ledger.insert(second).await.unwrap();

        ledger.touch_last_used(first_id).await.unwrap();
        let active = ledger.list_active(7).await.unwrap();
        assert_eq!(active.first().map(|row| row.token_id), Some(first_id));
    }

    #[tokio::test]
    async fn device_presence_ignores_revoked_rows() {
        let ledger = MemoryLedger::new();
        let token = new_token(7, "h1", "iPhone 15");
        let id = token.token_id;
        ledger.insert(token).await.unwrap();
        assert!(ledger.has_active_for_device(7, "iPhone 15").await.unwrap());
        assert!(!ledger.has_active_for_device(7, "Pixel 9").await.unwrap());

        ledger
            .mark_revoked(id, RevocationReason::UserRevokedSession)
            .await
            .unwrap();
        assert!(!ledger.has_active_for_device(7, "iPhone 15").await.unwrap());
    }
}

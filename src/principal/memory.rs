//! In-memory principal repo for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{NewPrincipal, PiiUpdate, PrincipalRecord, PrincipalRepo};
use crate::error::AuthError;
use crate::keyring::LookupHash;

#[derive(Default)]
pub struct MemoryPrincipalRepo {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<i64, PrincipalRecord>,
    next_id: i64,
}

impl MemoryPrincipalRepo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrincipalRepo for MemoryPrincipalRepo {
    async fn insert(&self, principal: NewPrincipal) -> Result<PrincipalRecord, AuthError> {
        let mut inner = self.inner.lock().await;
        if inner
            .rows
            .values()
            .any(|row| row.email_hash == principal.email_hash)
        {
            return Err(AuthError::Conflict("email already registered".to_string()));
        }
        inner.next_id += 1;
        let record = PrincipalRecord {
            id: inner.next_id,
            full_name: principal.full_name,
            email: principal.email,
            email_hash: principal.email_hash,
            date_of_birth: principal.date_of_birth,
            address: principal.address,
            pin_hash: None,
            token_version: 0,
            lock_until: None,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<PrincipalRecord>, AuthError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(&id).cloned())
    }

    async fn find_by_email_hash(
        &self,
        email_hash: &LookupHash,
    ) -> Result<Option<PrincipalRecord>, AuthError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .find(|row| &row.email_hash == email_hash)
            .cloned())
    }

    async fn exists_by_email_hash(&self, email_hash: &LookupHash) -> Result<bool, AuthError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().any(|row| &row.email_hash == email_hash))
    }

    async fn update_pii(&self, id: i64, update: PiiUpdate) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        if inner
            .rows
            .values()
            .any(|row| row.id != id && row.email_hash == update.email_hash)
        {
            return Err(AuthError::Conflict("email already registered".to_string()));
        }
        let row = inner.rows.get_mut(&id).ok_or(AuthError::NotFound)?;
        row.full_name = update.full_name;
        row.email = update.email;
        row.email_hash = update.email_hash;
        row.date_of_birth = update.date_of_birth;
        row.address = update.address;
        Ok(())
    }

    async fn set_pin_hash(&self, id: i64, pin_hash: String) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        let row = inner.rows.get_mut(&id).ok_or(AuthError::NotFound)?;
        row.pin_hash = Some(pin_hash);
        Ok(())
    }

    async fn set_lock(
        &self,
        id: i64,
        lock_until: Option<OffsetDateTime>,
    ) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().await;
        let row = inner.rows.get_mut(&id).ok_or(AuthError::NotFound)?;
        row.lock_until = lock_until;
        Ok(())
    }

    async fn bump_token_version(&self, id: i64) -> Result<i64, AuthError> {
        let mut inner = self.inner.lock().await;
        let row = inner.rows.get_mut(&id).ok_or(AuthError::NotFound)?;
        row.token_version += 1;
        Ok(row.token_version)
    }

    async fn token_version(&self, id: i64) -> Result<Option<i64>, AuthError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(&id).map(|row| row.token_version))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::keyring::tests::test_ring;
    use crate::keyring::KeyClass;

    fn sample(ring: &crate::keyring::KeyRing, email: &str) -> NewPrincipal {
        NewPrincipal {
            full_name: ring.encrypt(b"Ada Lovelace", KeyClass::Pii).unwrap(),
            email: ring.encrypt(email.as_bytes(), KeyClass::Pii).unwrap(),
            email_hash: ring.hash(email),
            date_of_birth: ring.encrypt(b"1990-12-10", KeyClass::Pii).unwrap(),
            address: ring.encrypt(b"1 Analytical Way", KeyClass::Pii).unwrap(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let ring = test_ring();
        let repo = MemoryPrincipalRepo::new();
        let first = repo.insert(sample(&ring, "a@b.com")).await.unwrap();
        let second = repo.insert(sample(&ring, "c@d.com")).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.token_version, 0);
    }

    #[tokio::test]
    async fn duplicate_email_hash_conflicts() {
        let ring = test_ring();
        let repo = MemoryPrincipalRepo::new();
        repo.insert(sample(&ring, "a@b.com")).await.unwrap();
        let err = repo.insert(sample(&ring, "a@b.com")).await.unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn bump_token_version_is_monotonic() {
        let ring = test_ring();
        let repo = MemoryPrincipalRepo::new();
        let record = repo.insert(sample(&ring, "a@b.com")).await.unwrap();
        assert_eq!(repo.bump_token_version(record.id).await.unwrap(), 1);
        assert_eq!(repo.bump_token_version(record.id).await.unwrap(), 2);
        assert_eq!(repo.token_version(record.id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn lock_round_trip() {
        let ring = test_ring();
        let repo = MemoryPrincipalRepo::new();
        let record = repo.insert(sample(&ring, "a@b.com")).await.unwrap();
        let until = OffsetDateTime::now_utc() + time::Duration::hours(1);
        repo.set_lock(record.id, Some(until)).await.unwrap();
        let row = repo.find_by_id(record.id).await.unwrap().unwrap();
        assert!(row.is_locked(OffsetDateTime::now_utc()));
        repo.set_lock(record.id, None).await.unwrap();
        let row = repo.find_by_id(record.id).await.unwrap().unwrap();
        assert!(!row.is_locked(OffsetDateTime::now_utc()));
    }
}

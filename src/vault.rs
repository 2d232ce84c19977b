//! Credential vault: the only reader/writer of principal PII.
//!
//! Write path encrypts every sensitive field under its key class and
//! computes the email lookup hash; read path decrypts transparently and
//! fails loudly when a stored field no longer round-trips. Uniqueness
//! checks go through the hash index, never through decryption; plaintext
//! comparison across encrypted rows is a correctness rule here, not a
//! performance preference.

use std::sync::Arc;

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use rand::rngs::OsRng;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use time::OffsetDateTime;

use crate::error::AuthError;
use crate::keyring::{CryptoError, EncryptedValue, KeyClass, KeyRing};
use crate::principal::{NewPrincipal, PiiUpdate, PrincipalRecord, PrincipalRepo};

/// Plaintext PII accepted on enrollment and returned on read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrincipalProfile {
    pub full_name: String,
    pub email: String,
    pub date_of_birth: String,
    pub address: String,
}

/// A decrypted principal view. PIN material never leaves the vault; the
/// view only says whether one is set.
#[derive(Clone, Debug)]
pub struct Principal {
    pub id: i64,
    pub profile: PrincipalProfile,
    pub has_pin: bool,
    pub token_version: i64,
    pub lock_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

pub struct CredentialVault {
    keyring: Arc<KeyRing>,
    repo: Arc<dyn PrincipalRepo>,
    pin_pepper: SecretString,
}

impl CredentialVault {
    #[must_use]
    pub fn new(
        keyring: Arc<KeyRing>,
        repo: Arc<dyn PrincipalRepo>,
        pin_pepper: SecretString,
    ) -> Self {
        Self {
            keyring,
            repo,
            pin_pepper,
        }
    }

    /// Encrypt and store a new principal.
    ///
    /// # Errors
    ///
    /// `Validation` on a malformed email, `Conflict` when the email is
    /// already registered.
    pub async fn create_principal(
        &self,
        profile: &PrincipalProfile,
    ) -> Result<Principal, AuthError> {
        let email = normalize_email(&profile.email);
        if !valid_email(&email) {
            return Err(AuthError::Validation("invalid email".to_string()));
        }

        let record = self
            .repo
            .insert(NewPrincipal {
                full_name: self.encrypt_field(&profile.full_name, KeyClass::Pii)?,
                email: self.encrypt_field(&email, KeyClass::Pii)?,
                email_hash: self.keyring.hash(&email),
                date_of_birth: self.encrypt_field(&profile.date_of_birth, KeyClass::Pii)?,
                address: self.encrypt_field(&profile.address, KeyClass::Pii)?,
            })
            .await?;
        self.decrypt_record(&record)
    }

    /// Read and decrypt a principal by id.
    ///
    /// # Errors
    ///
    /// `CorruptedRecord` when any stored field fails decryption; the
    /// ciphertext is never returned as if it were plaintext.
    pub async fn fetch(&self, id: i64) -> Result<Option<Principal>, AuthError> {
        match self.repo.find_by_id(id).await? {
            Some(record) => Ok(Some(self.decrypt_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Hash-indexed uniqueness check. Never decrypts anything.
    pub async fn exists_by_email(&self, email: &str) -> Result<bool, AuthError> {
        let email = normalize_email(email);
        self.repo
            .exists_by_email_hash(&self.keyring.hash(&email))
            .await
    }

    /// Hash-indexed identity lookup for sign-in flows.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, AuthError> {
        let email = normalize_email(email);
        match self
            .repo
            .find_by_email_hash(&self.keyring.hash(&email))
            .await?
        {
            Some(record) => Ok(Some(self.decrypt_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Replace the stored email, refreshing both ciphertext and hash.
    ///
    /// # Errors
    ///
    /// `Validation` on a malformed address, `Conflict` when the new email
    /// belongs to another principal, `NotFound` for an unknown id.
    pub async fn update_email(&self, id: i64, new_email: &str) -> Result<(), AuthError> {
        let email = normalize_email(new_email);
        if !valid_email(&email) {
            return Err(AuthError::Validation("invalid email".to_string()));
        }
        let record = self.repo.find_by_id(id).await?.ok_or(AuthError::NotFound)?;
        self.repo
            .update_pii(
                id,
                PiiUpdate {
                    full_name: record.full_name,
                    email: self.encrypt_field(&email, KeyClass::Pii)?,
                    email_hash: self.keyring.hash(&email),
                    date_of_birth: record.date_of_birth,
                    address: record.address,
                },
            )
            .await
    }

    /// Hash and store a PIN under the server pepper.
    ///
    /// # Errors
    ///
    /// `Validation` unless the PIN is 4-6 digits.
    pub async fn set_pin(&self, id: i64, pin: &str) -> Result<(), AuthError> {
        if !valid_pin(pin) {
            return Err(AuthError::Validation("PIN must be 4-6 digits".to_string()));
        }
        let hash = self.hash_pin(pin)?;
        self.repo.set_pin_hash(id, hash).await
    }

    /// Verify a supplied PIN. Returns `false` both for a wrong PIN and
    /// for a principal with no PIN set, so callers cannot distinguish the
    /// two. Feed failures into the brute-force guard.
    pub async fn verify_pin(&self, id: i64, pin: &str) -> Result<bool, AuthError> {
        let record = self.repo.find_by_id(id).await?.ok_or(AuthError::NotFound)?;
        let Some(stored) = record.pin_hash else {
            return Ok(false);
        };
        let parsed = PasswordHash::new(&stored).map_err(|_| AuthError::CorruptedRecord {
            record: format!("principal:{id}:pin_hash"),
        })?;
        let argon2 = self.pin_hasher()?;
        Ok(argon2.verify_password(pin.as_bytes(), &parsed).is_ok())
    }

    /// Upgrade any field written under a superseded key version. Returns
    /// whether the row changed. Intended for an operator-run sweep after
    /// a key rotation.
    pub async fn re_encrypt_principal(&self, id: i64) -> Result<bool, AuthError> {
        let record = self.repo.find_by_id(id).await?.ok_or(AuthError::NotFound)?;
        let stale = [
            &record.full_name,
            &record.email,
            &record.date_of_birth,
            &record.address,
        ]
        .into_iter()
        .any(|value| self.keyring.needs_re_encryption(value));
        if !stale {
            return Ok(false);
        }

        let update = PiiUpdate {
            full_name: self.upgrade_field(&record, record.full_name.clone(), "full_name")?,
            email: self.upgrade_field(&record, record.email.clone(), "email")?,
            email_hash: record.email_hash.clone(),
            date_of_birth: self.upgrade_field(
                &record,
                record.date_of_birth.clone(),
                "date_of_birth",
            )?,
            address: self.upgrade_field(&record, record.address.clone(), "address")?,
        };
        self.repo.update_pii(id, update).await?;
        Ok(true)
    }

    fn encrypt_field(&self, plaintext: &str, class: KeyClass) -> Result<EncryptedValue, AuthError> {
        self.keyring
            .encrypt(plaintext.as_bytes(), class)
            .map_err(|err| AuthError::Crypto(err.to_string()))
    }

    fn decrypt_field(
        &self,
        record_id: i64,
        field: &str,
        value: &EncryptedValue,
    ) -> Result<String, AuthError> {
        self.keyring
            .decrypt_string(value)
            .map_err(|_| AuthError::CorruptedRecord {
                record: format!("principal:{record_id}:{field}"),
            })
    }

    fn decrypt_record(&self, record: &PrincipalRecord) -> Result<Principal, AuthError> {
        Ok(Principal {
            id: record.id,
            profile: PrincipalProfile {
                full_name: self.decrypt_field(record.id, "full_name", &record.full_name)?,
                email: self.decrypt_field(record.id, "email", &record.email)?,
                date_of_birth: self.decrypt_field(
                    record.id,
                    "date_of_birth",
                    &record.date_of_birth,
                )?,
                address: self.decrypt_field(record.id, "address", &record.address)?,
            },
            has_pin: record.pin_hash.is_some(),
            token_version: record.token_version,
            lock_until: record.lock_until,
            created_at: record.created_at,
        })
    }

    fn upgrade_field(
        &self,
        record: &PrincipalRecord,
        value: EncryptedValue,
        field: &str,
    ) -> Result<EncryptedValue, AuthError> {
        if !self.keyring.needs_re_encryption(&value) {
            return Ok(value);
        }
        self.keyring.re_encrypt(&value).map_err(|err| match err {
            CryptoError::Decryption | CryptoError::UnknownKeyVersion { .. } => {
                AuthError::CorruptedRecord {
                    record: format!("principal:{}:{field}", record.id),
                }
            }
            other => AuthError::Crypto(other.to_string()),
        })
    }

    fn hash_pin(&self, pin: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = self.pin_hasher()?;
        argon2
            .hash_password(pin.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|_| AuthError::Crypto("failed to hash PIN".to_string()))
    }

    fn pin_hasher(&self) -> Result<Argon2<'_>, AuthError> {
        Argon2::new_with_secret(
            self.pin_pepper.expose_secret().as_bytes(),
            Algorithm::Argon2id,
            Version::V0x13,
            Params::default(),
        )
        .map_err(|_| AuthError::Crypto("failed to initialize Argon2id".to_string()))
    }
}

/// Normalize an email for hashing and uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

fn valid_pin(pin: &str) -> bool {
    (4..=6).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

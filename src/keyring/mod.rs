//! Versioned field-level encryption and lookup hashing.
//!
//! Each [`KeyClass`] owns an independently rotatable chain of symmetric
//! keys. Keys are never used raw: every `(class, version)` key is derived
//! from the master secret with Argon2id under a per-class, per-version
//! salt. Lookup hashes come from a separate non-rotating salt so equality
//! search stays stable across key rotations.
//!
//! The ring is an explicitly constructed instance injected into every
//! component that needs it. Key material is derived once at construction
//! and read-only afterwards, so a shared reference is safe for unlimited
//! concurrent readers.

mod value;

pub use value::{EncryptedValue, KeyClass};

use std::collections::HashMap;
use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use thiserror::Error;

use value::{NONCE_LEN, TAG_LEN};

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const CANARY: &[u8] = b"cambio-keyring-canary";

// Argon2id parameters for key derivation. Memory: 64 MiB, iterations: 3,
// parallelism: 4.
const KDF_M_COST: u32 = 64 * 1024;
const KDF_T_COST: u32 = 3;
const KDF_P_COST: u32 = 4;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed encrypted value")]
    Malformed,
    #[error("unknown key class: {0}")]
    UnknownKeyClass(String),
    #[error("unknown key version: {class} v{version}")]
    UnknownKeyVersion { class: KeyClass, version: u32 },
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("startup self-test failed for {0}")]
    SelfTest(KeyClass),
    #[error("decrypted payload is not valid utf-8")]
    PlaintextEncoding,
}

/// Deterministic one-way digest of a plaintext, used as an equality index
/// over encrypted fields. Never reversed, never versioned.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LookupHash(String);

impl LookupHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a hash previously read from storage.
    #[must_use]
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LookupHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key material and rotation state for a [`KeyRing`].
#[derive(Clone)]
pub struct KeyRingConfig {
    master_secret: SecretString,
    kdf_salt: String,
    lookup_salt: SecretString,
    current_versions: HashMap<KeyClass, u32>,
    kdf_m_cost: u32,
    kdf_t_cost: u32,
    kdf_p_cost: u32,
}

impl KeyRingConfig {
    #[must_use]
    pub fn new(master_secret: SecretString, kdf_salt: String, lookup_salt: SecretString) -> Self {
        Self {
            master_secret,
            kdf_salt,
            lookup_salt,
            current_versions: KeyClass::ALL.iter().map(|class| (*class, 1)).collect(),
            kdf_m_cost: KDF_M_COST,
            kdf_t_cost: KDF_T_COST,
            kdf_p_cost: KDF_P_COST,
        }
    }

    /// Set the current key version for a class. Versions below it stay
    /// decryptable; new encryptions use the current one.
    #[must_use]
    pub fn with_current_version(mut self, class: KeyClass, version: u32) -> Self {
        self.current_versions.insert(class, version.max(1));
        self
    }

    /// Override the Argon2id cost parameters. Intended for tests; the
    /// defaults are the production hardness.
    #[must_use]
    pub fn with_kdf_params(mut self, m_cost: u32, t_cost: u32, p_cost: u32) -> Self {
        self.kdf_m_cost = m_cost;
        self.kdf_t_cost = t_cost;
        self.kdf_p_cost = p_cost;
        self
    }
}

impl fmt::Debug for KeyRingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRingConfig")
            .field("master_secret", &"***")
            .field("kdf_salt", &self.kdf_salt)
            .field("lookup_salt", &"***")
            .field("current_versions", &self.current_versions)
            .finish()
    }
}

/// Holds the derived key chain for every class and performs authenticated
/// encryption, decryption, and lookup hashing.
pub struct KeyRing {
    keys: HashMap<(KeyClass, u32), [u8; KEY_LEN]>,
    current_versions: HashMap<KeyClass, u32>,
    lookup_mac: HmacSha256,
}

impl KeyRing {
    /// Derive the full key chain and run the startup self-test.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails or if any class fails the
    /// encrypt/decrypt canary check. Callers must treat this as fatal and
    /// abort startup rather than continue without working keys.
    pub fn new(config: &KeyRingConfig) -> Result<Self, CryptoError> {
        let mut keys = HashMap::new();
        for class in KeyClass::ALL {
            let current = config.current_versions.get(&class).copied().unwrap_or(1);
            for version in 1..=current {
                let key = derive_key(config, class, version)?;
                keys.insert((class, version), key);
            }
        }

        let lookup_key = Sha256::digest(config.lookup_salt.expose_secret().as_bytes());
        let lookup_mac =
            HmacSha256::new_from_slice(&lookup_key).map_err(|_| CryptoError::KeyDerivation)?;

        let ring = Self {
            keys,
            current_versions: config.current_versions.clone(),
            lookup_mac,
        };
        ring.self_test()?;
        Ok(ring)
    }

    /// Encrypt `plaintext` under the current key for `class`.
    ///
    /// # Errors
    ///
    /// Returns an error if the class has no derived key or the cipher
    /// rejects the payload.
    pub fn encrypt(&self, plaintext: &[u8], class: KeyClass) -> Result<EncryptedValue, CryptoError> {
        let version = self.current_version(class);
        let key = self
            .keys
            .get(&(class, version))
            .ok_or(CryptoError::UnknownKeyVersion { class, version })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let aad = header_aad(class, version);
        let mut sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        // The cipher appends the 16-byte tag; the wire format carries it
        // as its own field.
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::Encryption);
        }
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedValue::new(
            class,
            version,
            nonce_bytes.to_vec(),
            tag,
            sealed,
        ))
    }

    /// Decrypt a value under the exact key version named in its tag.
    ///
    /// # Errors
    ///
    /// Returns an error on tag mismatch, truncated payload, or a key
    /// version this ring does not hold.
    pub fn decrypt(&self, value: &EncryptedValue) -> Result<Vec<u8>, CryptoError> {
        let class = value.key_class();
        let version = value.version();
        let key = self
            .keys
            .get(&(class, version))
            .ok_or(CryptoError::UnknownKeyVersion { class, version })?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let aad = header_aad(class, version);
        let mut sealed = Vec::with_capacity(value.ciphertext().len() + TAG_LEN);
        sealed.extend_from_slice(value.ciphertext());
        sealed.extend_from_slice(value.tag());

        cipher
            .decrypt(
                Nonce::from_slice(value.nonce()),
                Payload {
                    msg: &sealed,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::Decryption)
    }

    /// Decrypt a value that is expected to hold utf-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if decryption fails or the plaintext is not utf-8.
    pub fn decrypt_string(&self, value: &EncryptedValue) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(value)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::PlaintextEncoding)
    }

    /// Deterministic lookup hash of a plaintext. Stable across key
    /// rotations because it is keyed from the non-rotating lookup salt.
    #[must_use]
    pub fn hash(&self, plaintext: &str) -> LookupHash {
        let mut mac = self.lookup_mac.clone();
        mac.update(plaintext.as_bytes());
        LookupHash(hex::encode(mac.finalize().into_bytes()))
    }

    /// Whether a stored value was written under a superseded key version.
    #[must_use]
    pub fn needs_re_encryption(&self, value: &EncryptedValue) -> bool {
        value.version() < self.current_version(value.key_class())
    }

    /// Decrypt and re-encrypt under the current key version for the
    /// value's class.
    ///
    /// # Errors
    ///
    /// Returns an error if either the decryption or the re-encryption
    /// fails.
    pub fn re_encrypt(&self, value: &EncryptedValue) -> Result<EncryptedValue, CryptoError> {
        let plaintext = self.decrypt(value)?;
        self.encrypt(&plaintext, value.key_class())
    }

    #[must_use]
    pub fn current_version(&self, class: KeyClass) -> u32 {
        self.current_versions.get(&class).copied().unwrap_or(1)
    }

    fn self_test(&self) -> Result<(), CryptoError> {
        for class in KeyClass::ALL {
            let sealed = self
                .encrypt(CANARY, class)
                .map_err(|_| CryptoError::SelfTest(class))?;
            let opened = self
                .decrypt(&sealed)
                .map_err(|_| CryptoError::SelfTest(class))?;
            if opened != CANARY {
                return Err(CryptoError::SelfTest(class));
            }
        }
        Ok(())
    }
}

fn header_aad(class: KeyClass, version: u32) -> String {
    // Binds the tag header to the ciphertext so a relabeled value fails
    // authentication instead of decrypting under the wrong key context.
    format!("{class}:v{version}")
}

fn derive_key(
    config: &KeyRingConfig,
    class: KeyClass,
    version: u32,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let params = Params::new(
        config.kdf_m_cost,
        config.kdf_t_cost,
        config.kdf_p_cost,
        Some(KEY_LEN),
    )
    .map_err(|_| CryptoError::KeyDerivation)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = Sha256::digest(format!("{}|{class}|v{version}", config.kdf_salt).as_bytes());
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(
            config.master_secret.expose_secret().as_bytes(),
            &salt,
            &mut key,
        )
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(key)
}

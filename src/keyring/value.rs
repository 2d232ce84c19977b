//! On-disk representation of an encrypted field.
//!
//! The five-field colon format is a durable contract: rows written years
//! ago must stay parseable, so changes here require a data migration.

use std::fmt;
use std::str::FromStr;

use super::CryptoError;

/// Nonce length for ChaCha20-Poly1305.
pub(crate) const NONCE_LEN: usize = 12;
/// Poly1305 authentication tag length.
pub(crate) const TAG_LEN: usize = 16;

/// A named category of encryption key with its own rotation lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyClass {
    Pii,
    Financial,
    Auth,
    Sensitive,
}

impl KeyClass {
    pub const ALL: [KeyClass; 4] = [
        KeyClass::Pii,
        KeyClass::Financial,
        KeyClass::Auth,
        KeyClass::Sensitive,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyClass::Pii => "PII",
            KeyClass::Financial => "FINANCIAL",
            KeyClass::Auth => "AUTH",
            KeyClass::Sensitive => "SENSITIVE",
        }
    }
}

impl fmt::Display for KeyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyClass {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PII" => Ok(KeyClass::Pii),
            "FINANCIAL" => Ok(KeyClass::Financial),
            "AUTH" => Ok(KeyClass::Auth),
            "SENSITIVE" => Ok(KeyClass::Sensitive),
            other => Err(CryptoError::UnknownKeyClass(other.to_string())),
        }
    }
}

/// A tagged ciphertext: `{keyClass}:v{version}:{iv}:{authTag}:{ciphertext}`
/// with the binary fields hex-encoded.
///
/// Decryption requires the exact key version named in the tag; new
/// encryptions always use the current version for the class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedValue {
    key_class: KeyClass,
    version: u32,
    nonce: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl EncryptedValue {
    pub(crate) fn new(
        key_class: KeyClass,
        version: u32,
        nonce: Vec<u8>,
        tag: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            key_class,
            version,
            nonce,
            tag,
            ciphertext,
        }
    }

    #[must_use]
    pub fn key_class(&self) -> KeyClass {
        self.key_class
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub(crate) fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub(crate) fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }
}

impl fmt::Display for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:v{}:{}:{}:{}",
            self.key_class,
            self.version,
            hex::encode(&self.nonce),
            hex::encode(&self.tag),
            hex::encode(&self.ciphertext)
        )
    }
}

impl FromStr for EncryptedValue {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let class = parts.next().ok_or(CryptoError::Malformed)?;
        let version = parts.next().ok_or(CryptoError::Malformed)?;
        let nonce = parts.next().ok_or(CryptoError::Malformed)?;
        let tag = parts.next().ok_or(CryptoError::Malformed)?;
        let ciphertext = parts.next().ok_or(CryptoError::Malformed)?;
        if parts.next().is_some() {
            return Err(CryptoError::Malformed);
        }

        let key_class = KeyClass::from_str(class)?;
        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(CryptoError::Malformed)?;
        let nonce = hex::decode(nonce).map_err(|_| CryptoError::Malformed)?;
        let tag = hex::decode(tag).map_err(|_| CryptoError::Malformed)?;
        let ciphertext = hex::decode(ciphertext).map_err(|_| CryptoError::Malformed)?;

        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::Malformed);
        }

        Ok(Self {
            key_class,
            version,
            nonce,
            tag,
            ciphertext,
        })
    }
}

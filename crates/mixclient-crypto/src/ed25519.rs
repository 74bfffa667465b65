//! Ed25519 signatures (RFC 8032).
//!
//! Node identity keys and the directory authority key are Ed25519. The
//! client only verifies consensus documents; signing exists for tooling
//! and tests that produce them.

use ed25519_dalek::{Signer, Verifier};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// An Ed25519 signing key.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut bytes = self.inner.to_bytes();
        bytes.zeroize();
    }
}

/// An Ed25519 verifying key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

/// An Ed25519 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a signing key from its 32-byte seed.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    /// Seed bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Corresponding verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message),
        }
    }
}

impl VerifyingKey {
    /// Parse a verifying key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] if the bytes are not a valid point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Parse a hex-encoded verifying key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] or [`CryptoError::InvalidKeyLength`].
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: raw.len(),
            })?;
        Self::from_bytes(&bytes)
    }

    /// Raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verify `signature` over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SignatureVerification`] on failure.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.inner
            .verify(message, &signature.inner)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    /// Parse a hex-encoded signature.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] or [`CryptoError::InvalidKeyLength`].
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        let bytes: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 64,
                actual: raw.len(),
            })?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Raw bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    /// Hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.to_bytes())
    }
}

//! X25519 key agreement (RFC 7748).
//!
//! Account identity keys, node link keys and per-message ephemeral keys are
//! all X25519. [`blind`] exposes the raw scalar multiplication used to
//! re-randomize the Sphinx group element at every hop.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// A long-lived X25519 secret key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct X25519StaticSecret {
    inner: StaticSecret,
}

impl fmt::Debug for X25519StaticSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("X25519StaticSecret(..)")
    }
}

/// An X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; 32],
}

/// Output of a key agreement. Zeroized on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl X25519StaticSecret {
    /// Generate a new random secret.
    pub fn random() -> Self {
        Self {
            inner: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Parse a hex-encoded secret key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidInput`] on bad hex and
    /// [`CryptoError::InvalidKeyLength`] on a wrong length.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
        let len = raw.len();
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: len,
            })?;
        raw.zeroize();
        Ok(Self::from_bytes(bytes))
    }

    /// Raw secret bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Hex encoding of the secret, for key files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.to_bytes())
    }

    /// Corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey {
            bytes: PublicKey::from(&self.inner).to_bytes(),
        }
    }

    /// Diffie-Hellman with a peer public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DegenerateKey`] if the peer key is a low-order
    /// point and the shared secret would be all zeros.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> Result<SharedSecret> {
        let shared = self.inner.diffie_hellman(&PublicKey::from(their_public.bytes));
        if !shared.was_contributory() {
            return Err(CryptoError::DegenerateKey);
        }
        Ok(SharedSecret {
            bytes: *shared.as_bytes(),
        })
    }
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Raw bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl SharedSecret {
    /// Wrap raw shared-secret bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Borrow the shared secret.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

/// Multiply the group element `point` by the (clamped) scalar `scalar`.
///
/// Scalar multiplications commute, so a sender applying a node's blinding
/// factors to `x * pk` reaches the same secret the node gets from
/// `sk * alpha`.
///
/// # Errors
///
/// Returns [`CryptoError::DegenerateKey`] if the result is all zeros.
pub fn blind(scalar: &[u8; 32], point: &[u8; 32]) -> Result<[u8; 32]> {
    let out = x25519_dalek::x25519(*scalar, *point);
    if out == [0u8; 32] {
        return Err(CryptoError::DegenerateKey);
    }
    Ok(out)
}

/// Public key for a raw scalar.
pub fn basepoint_mult(secret: &[u8; 32]) -> [u8; 32] {
    x25519_dalek::x25519(*secret, x25519_dalek::X25519_BASEPOINT_BYTES)
}

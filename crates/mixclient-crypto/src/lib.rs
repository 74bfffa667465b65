//! # mixclient-crypto
//!
//! Cryptographic primitives for the mixclient packet and block formats.
//! The suite is fixed; there is no algorithm negotiation.
//!
//! ## Modules
//!
//! - [`blake3`] - Domain-separated key derivation, MACs and keystreams
//! - [`x25519`] - X25519 key agreement and Sphinx group-element blinding
//! - [`chacha20`] - ChaCha20-Poly1305 AEAD
//! - [`ed25519`] - Ed25519 signatures for consensus documents

pub mod blake3;
pub mod chacha20;
pub mod ed25519;
pub mod x25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// AEAD decryption failed (authentication tag mismatch).
    #[error("AEAD decryption failed")]
    AeadDecryption,

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    AeadEncryption,

    /// Key agreement produced the all-zero output of a low-order point.
    #[error("degenerate key agreement")]
    DegenerateKey,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

//! ChaCha20-Poly1305 AEAD (RFC 8439).
//!
//! Seals the terminal Sphinx payload layer, SURB reply bodies and every
//! end-to-end block.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::{CryptoError, Result};

/// Nonce size (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Key size (256 bits).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext`, returning ciphertext with the tag appended.
///
/// # Errors
///
/// Returns [`CryptoError::AeadEncryption`] if the cipher rejects the input.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadEncryption)
}

/// Decrypt `ciphertext` (tag appended) and verify `aad`.
///
/// # Errors
///
/// Returns [`CryptoError::AeadDecryption`] on any authentication failure.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::AeadDecryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AeadDecryption)
}

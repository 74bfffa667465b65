//! Domain-separated BLAKE3.
//!
//! ## Modes
//!
//! - [`hash`] - plain hashing: node identifiers, dedup tags
//! - [`derive_key`] - per-hop and per-block key derivation
//! - [`keyed_hash`] / [`mac`] - header MACs
//! - [`keystream`] - keyed XOF used as a stream cipher for Sphinx headers and payloads
//!
//! Every derivation uses one of the registered [`contexts`].

use subtle::ConstantTimeEq;

/// Registered BLAKE3 key-derivation context strings.
pub mod contexts {
    pub const SPHINX_HEADER_KEY: &str = "mixclient v1 sphinx-header-key";
    pub const SPHINX_MAC_KEY: &str = "mixclient v1 sphinx-mac-key";
    pub const SPHINX_PAYLOAD_KEY: &str = "mixclient v1 sphinx-payload-key";
    pub const SPHINX_PAYLOAD_AEAD: &str = "mixclient v1 sphinx-payload-aead";
    pub const SPHINX_PAYLOAD_NONCE: &str = "mixclient v1 sphinx-payload-nonce";
    pub const SPHINX_BLINDING: &str = "mixclient v1 sphinx-blinding";
    pub const SPHINX_REPLAY_TAG: &str = "mixclient v1 sphinx-replay-tag";
    pub const SURB_REPLY_NONCE: &str = "mixclient v1 surb-reply-nonce";
    pub const BLOCK_SENDER_KEY: &str = "mixclient v1 block-sender-key";
    pub const BLOCK_SENDER_NONCE: &str = "mixclient v1 block-sender-nonce";
    pub const BLOCK_KEY: &str = "mixclient v1 block-key";
    pub const BLOCK_NONCE: &str = "mixclient v1 block-nonce";
    pub const INBOUND_DEDUP_TAG: &str = "mixclient v1 inbound-dedup-tag";

    /// All registered context strings.
    pub const ALL_CONTEXTS: &[&str] = &[
        SPHINX_HEADER_KEY,
        SPHINX_MAC_KEY,
        SPHINX_PAYLOAD_KEY,
        SPHINX_PAYLOAD_AEAD,
        SPHINX_PAYLOAD_NONCE,
        SPHINX_BLINDING,
        SPHINX_REPLAY_TAG,
        SURB_REPLY_NONCE,
        BLOCK_SENDER_KEY,
        BLOCK_SENDER_NONCE,
        BLOCK_KEY,
        BLOCK_NONCE,
        INBOUND_DEDUP_TAG,
    ];
}

/// BLAKE3 hash of the input.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a 32-byte key from `key_material` under a registered context.
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    ::blake3::derive_key(context, key_material)
}

/// Derive a key from several fields without ambiguity between them.
///
/// Each field is encoded as `LE32(len) || field`.
pub fn derive_key_multi(context: &str, fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    for field in fields {
        hasher.update(&(field.len() as u32).to_le_bytes());
        hasher.update(field);
    }
    *hasher.finalize().as_bytes()
}

/// Derive a 12-byte AEAD nonce.
pub fn derive_nonce(context: &str, key_material: &[u8]) -> [u8; 12] {
    let full = derive_key(context, key_material);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&full[..12]);
    nonce
}

/// Keyed BLAKE3 hash.
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Truncated 16-byte MAC.
pub fn mac(key: &[u8; 32], message: &[u8]) -> [u8; 16] {
    let full = keyed_hash(key, message);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

/// Constant-time MAC comparison.
pub fn verify_mac(key: &[u8; 32], message: &[u8], expected: &[u8]) -> bool {
    let computed = mac(key, message);
    computed[..].ct_eq(expected).into()
}

/// Fill `out` with the keyed XOF stream for `key`.
pub fn keystream(key: &[u8; 32], out: &mut [u8]) {
    let mut reader = ::blake3::Hasher::new_keyed(key).finalize_xof();
    reader.fill(out);
}

/// XOR the keyed XOF stream for `key` into `data` in place.
pub fn apply_keystream(key: &[u8; 32], data: &mut [u8]) {
    let mut stream = vec![0u8; data.len()];
    keystream(key, &mut stream);
    xor_in_place(data, &stream);
}

/// `dst[i] ^= src[i]` over the shorter of the two slices.
pub fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Whether `context` is one of the registered context strings.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_prefix() {
        for ctx in contexts::ALL_CONTEXTS {
            assert!(ctx.starts_with("mixclient v1 "), "bad prefix: {ctx}");
        }
        assert!(is_registered_context(contexts::BLOCK_KEY));
        assert!(!is_registered_context("mixclient v1 unknown"));
    }

    #[test]
    fn test_derive_key_domain_separation() {
        let a = derive_key(contexts::SPHINX_HEADER_KEY, &[1u8; 32]);
        let b = derive_key(contexts::SPHINX_MAC_KEY, &[1u8; 32]);
        assert_ne!(a, b);
        assert_eq!(a, derive_key(contexts::SPHINX_HEADER_KEY, &[1u8; 32]));
    }

    #[test]
    fn test_derive_key_multi_unambiguous() {
        let a = derive_key_multi(contexts::BLOCK_KEY, &[b"ab".as_slice(), b"c".as_slice()]);
        let b = derive_key_multi(contexts::BLOCK_KEY, &[b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_mac_verify() {
        let key = [3u8; 32];
        let tag = mac(&key, b"header");
        assert!(verify_mac(&key, b"header", &tag));
        assert!(!verify_mac(&key, b"headeR", &tag));
        assert!(!verify_mac(&key, b"header", &tag[..15]));
    }

    #[test]
    fn test_keystream_prefix_stable() {
        let key = [9u8; 32];
        let mut short = [0u8; 40];
        let mut long = [0u8; 400];
        keystream(&key, &mut short);
        keystream(&key, &mut long);
        assert_eq!(&short[..], &long[..40]);
    }

    #[test]
    fn test_apply_keystream_involution() {
        let key = [5u8; 32];
        let original = b"layered payload bytes".to_vec();
        let mut data = original.clone();
        apply_keystream(&key, &mut data);
        assert_ne!(data, original);
        apply_keystream(&key, &mut data);
        assert_eq!(data, original);
    }
}

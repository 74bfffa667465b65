//! Fixed-size identifiers.
//!
//! | Type | Size | Derivation |
//! |---|---|---|
//! | [`NodeId`] | 32 | BLAKE3 of the node identity public key |
//! | [`AccountId`] | 32 | BLAKE3 of `"<name>@<provider>"` |
//! | [`MessageId`] | 16 | random per message |
//! | [`SurbId`] | 16 | random per reply block |
//!
//! All identifiers serialize as lowercase hex.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::{Result, TypesError};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[serde_as]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(#[serde_as(as = "Hex")] pub [u8; $len]);

        impl $name {
            /// Length of the identifier in bytes.
            pub const LEN: usize = $len;

            /// Wrap raw bytes.
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Parse from a byte slice of exactly [`Self::LEN`] bytes.
            ///
            /// # Errors
            ///
            /// Returns [`TypesError::InvalidLength`] on a length mismatch.
            pub fn from_slice(data: &[u8]) -> Result<Self> {
                let bytes: [u8; $len] =
                    data.try_into().map_err(|_| TypesError::InvalidLength {
                        expected: $len,
                        actual: data.len(),
                    })?;
                Ok(Self(bytes))
            }

            /// Parse from a hex string.
            ///
            /// # Errors
            ///
            /// Returns [`TypesError::Hex`] or [`TypesError::InvalidLength`].
            pub fn from_hex(s: &str) -> Result<Self> {
                let data = hex::decode(s.trim())?;
                Self::from_slice(&data)
            }

            /// Full lowercase hex encoding.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}…)", stringify!($name), &self.to_hex()[..8])
            }
        }
    };
}

define_id!(
    /// Identity of a mix node or provider.
    NodeId,
    32
);

define_id!(
    /// Routing address of a client account at its provider.
    AccountId,
    32
);

define_id!(
    /// Identifier shared by every block of one end-to-end message.
    MessageId,
    16
);

define_id!(
    /// Identifier correlating a single-use reply block with its keys.
    SurbId,
    16
);

impl NodeId {
    /// Derive the node identifier from its identity public key.
    pub fn from_identity_key(identity_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(identity_key).as_bytes())
    }
}

impl AccountId {
    /// Derive the account identifier from a `name@provider` pair.
    pub fn from_address(name: &str, provider: &str) -> Self {
        let address = format!("{name}@{provider}");
        Self(*blake3::hash(address.as_bytes()).as_bytes())
    }

    /// Parse a `name@provider` string and derive its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TypesError::InvalidAddress`] if either part is missing.
    pub fn parse_address(address: &str) -> Result<Self> {
        let (name, provider) = split_address(address)?;
        Ok(Self::from_address(name, provider))
    }
}

impl MessageId {
    /// Generate a fresh random message identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl SurbId {
    /// Generate a fresh random reply-block identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Split `name@provider` into its two non-empty halves.
///
/// # Errors
///
/// Returns [`TypesError::InvalidAddress`] if the address is malformed.
pub fn split_address(address: &str) -> Result<(&str, &str)> {
    match address.split_once('@') {
        Some((name, provider)) if !name.is_empty() && !provider.is_empty() => {
            Ok((name, provider))
        }
        _ => Err(TypesError::InvalidAddress(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = MessageId::random();
        let parsed = MessageId::from_hex(&id.to_hex()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_from_slice_wrong_length() {
        let result = NodeId::from_slice(&[0u8; 31]);
        assert!(matches!(
            result,
            Err(TypesError::InvalidLength {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn test_account_address() {
        let a = AccountId::from_address("alice", "provider-1");
        let b = AccountId::parse_address("alice@provider-1").expect("parse");
        assert_eq!(a, b);
        assert_ne!(a, AccountId::from_address("alice", "provider-2"));
    }

    #[test]
    fn test_invalid_address() {
        assert!(AccountId::parse_address("alice").is_err());
        assert!(AccountId::parse_address("@provider").is_err());
        assert!(AccountId::parse_address("alice@").is_err());
    }

    #[test]
    fn test_serde_as_hex() {
        let id = SurbId::from_bytes([0xAB; 16]);
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: SurbId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn test_debug_is_short() {
        let id = NodeId::from_bytes([0x11; 32]);
        assert_eq!(format!("{id:?}"), "NodeId(11111111…)");
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(MessageId::random(), MessageId::random());
        assert_ne!(SurbId::random(), SurbId::random());
    }
}

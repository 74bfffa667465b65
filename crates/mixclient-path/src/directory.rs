//! Recipient directory.
//!
//! Maps user names to their X25519 identity key and provider. Loaded from
//! a JSON object keyed by user name:
//!
//! ```json
//! { "bob": { "identity_key": "<hex x25519>", "provider": "provider-1" } }
//! ```

use std::collections::HashMap;
use std::path::Path as FsPath;

use mixclient_crypto::x25519::X25519PublicKey;
use mixclient_types::{ids::split_address, AccountId};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::{PathError, Result};

/// Directory record for one user.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    #[serde_as(as = "Hex")]
    pub identity_key: [u8; 32],
    pub provider: String,
}

/// A resolved recipient, ready for block encryption and routing.
#[derive(Clone, Debug)]
pub struct Recipient {
    pub name: String,
    pub provider: String,
    pub account: AccountId,
    pub identity_key: X25519PublicKey,
}

/// In-memory user directory.
#[derive(Clone, Debug, Default)]
pub struct UserDirectory {
    entries: HashMap<String, DirectoryEntry>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a directory from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::Json`] on malformed input.
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let entries: HashMap<String, DirectoryEntry> = serde_json::from_slice(json)?;
        Ok(Self { entries })
    }

    /// Load a directory file.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::Io`] or [`PathError::Json`].
    pub fn load(path: impl AsRef<FsPath>) -> Result<Self> {
        Self::from_json(&std::fs::read(path)?)
    }

    /// Add or replace a user.
    pub fn insert(&mut self, name: impl Into<String>, entry: DirectoryEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `name@provider`, or a bare user name.
    ///
    /// # Errors
    ///
    /// - [`PathError::Address`] if a qualified address is malformed
    /// - [`PathError::UnknownRecipient`] if the user is missing or registered
    ///   at a different provider
    pub fn resolve(&self, address: &str) -> Result<Recipient> {
        let (name, provider) = if address.contains('@') {
            let (name, provider) = split_address(address)?;
            (name, Some(provider))
        } else {
            (address, None)
        };

        let entry = self
            .entries
            .get(name)
            .filter(|e| provider.map_or(true, |p| p == e.provider))
            .ok_or_else(|| PathError::UnknownRecipient(address.to_string()))?;

        Ok(Recipient {
            name: name.to_string(),
            provider: entry.provider.clone(),
            account: AccountId::from_address(name, &entry.provider),
            identity_key: X25519PublicKey::from_bytes(entry.identity_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        format!(
            r#"{{"bob": {{"identity_key": "{}", "provider": "provider-1"}}}}"#,
            "ab".repeat(32)
        )
    }

    #[test]
    fn test_resolve_qualified_and_bare() {
        let dir = UserDirectory::from_json(sample_json().as_bytes()).expect("parse");
        assert_eq!(dir.len(), 1);

        let bob = dir.resolve("bob@provider-1").expect("resolve");
        assert_eq!(bob.identity_key.to_bytes(), [0xab; 32]);
        assert_eq!(bob.account, AccountId::from_address("bob", "provider-1"));

        let bare = dir.resolve("bob").expect("resolve bare");
        assert_eq!(bare.account, bob.account);
    }

    #[test]
    fn test_unknown_or_wrong_provider() {
        let dir = UserDirectory::from_json(sample_json().as_bytes()).expect("parse");
        assert!(matches!(
            dir.resolve("carol@provider-1"),
            Err(PathError::UnknownRecipient(_))
        ));
        assert!(matches!(
            dir.resolve("bob@provider-2"),
            Err(PathError::UnknownRecipient(_))
        ));
        assert!(matches!(dir.resolve("@provider-1"), Err(PathError::Address(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.json");
        std::fs::write(&path, sample_json()).expect("write");
        let loaded = UserDirectory::load(&path).expect("load");
        assert!(loaded.resolve("bob").is_ok());
    }

    #[test]
    fn test_insert() {
        let mut dir = UserDirectory::new();
        assert!(dir.is_empty());
        dir.insert(
            "alice",
            DirectoryEntry {
                identity_key: [1u8; 32],
                provider: "provider-2".to_string(),
            },
        );
        assert_eq!(dir.resolve("alice@provider-2").expect("alice").provider, "provider-2");
    }
}

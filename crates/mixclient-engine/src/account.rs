//! Local accounts served by the engine.

use std::fmt;
use std::path::Path;

use mixclient_crypto::x25519::X25519StaticSecret;
use mixclient_types::AccountId;

use crate::{EngineError, Result};

/// A local account: its address and the X25519 identity that decrypts its
/// inbound blocks and authenticates its outbound ones.
#[derive(Clone)]
pub struct Account {
    pub name: String,
    pub provider: String,
    pub id: AccountId,
    pub identity: X25519StaticSecret,
}

impl Account {
    pub fn new(name: impl Into<String>, provider: impl Into<String>, identity: X25519StaticSecret) -> Self {
        let name = name.into();
        let provider = provider.into();
        let id = AccountId::from_address(&name, &provider);
        Self {
            name,
            provider,
            id,
            identity,
        }
    }

    /// Load the identity key from a file holding 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingIdentityKey`] if the file is absent or
    /// does not hold a valid key.
    pub fn from_key_file(
        name: impl Into<String>,
        provider: impl Into<String>,
        key_path: &Path,
    ) -> Result<Self> {
        let name = name.into();
        let missing = |reason: String| EngineError::MissingIdentityKey {
            account: name.clone(),
            reason,
        };
        let text = std::fs::read_to_string(key_path)
            .map_err(|e| missing(format!("{}: {e}", key_path.display())))?;
        let identity = X25519StaticSecret::from_hex(text.trim())
            .map_err(|e| missing(format!("{}: {e}", key_path.display())))?;
        Ok(Self::new(name, provider, identity))
    }

    /// `name@provider`.
    pub fn address(&self) -> String {
        format!("{}@{}", self.name, self.provider)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address())
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_matches_address() {
        let account = Account::new("alice", "provider-1", X25519StaticSecret::random());
        assert_eq!(account.address(), "alice@provider-1");
        assert_eq!(
            account.id,
            AccountId::parse_address("alice@provider-1").expect("parse")
        );
    }

    #[test]
    fn test_key_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alice.key");
        let secret = X25519StaticSecret::random();
        std::fs::write(&path, format!("{}\n", secret.to_hex())).expect("write");

        let account = Account::from_key_file("alice", "p", &path).expect("load");
        assert_eq!(account.identity.public_key(), secret.public_key());
    }

    #[test]
    fn test_missing_key_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Account::from_key_file("alice", "p", &dir.path().join("absent.key"))
            .expect_err("missing");
        assert!(matches!(err, EngineError::MissingIdentityKey { ref account, .. } if account == "alice"));

        let bad = dir.path().join("bad.key");
        std::fs::write(&bad, "zz").expect("write");
        assert!(matches!(
            Account::from_key_file("alice", "p", &bad),
            Err(EngineError::MissingIdentityKey { .. })
        ));
    }
}

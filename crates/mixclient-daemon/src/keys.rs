//! Account identity keys.
//!
//! Keys are stored as 64 hex characters. A key that cannot be loaded aborts
//! that account only.

use std::path::Path;

use anyhow::Context;
use mixclient_crypto::x25519::X25519StaticSecret;
use mixclient_engine::Account;
use tracing::error;

use crate::config::DaemonConfig;

/// Write a fresh identity key to `path` and return it.
pub fn generate(path: &Path) -> anyhow::Result<X25519StaticSecret> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let secret = X25519StaticSecret::random();
    std::fs::write(path, format!("{}\n", secret.to_hex()))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(secret)
}

/// Load every configured account whose key is usable.
pub fn load_accounts(config: &DaemonConfig) -> Vec<Account> {
    config
        .accounts
        .iter()
        .filter_map(|entry| {
            let key_path = config.data_path(&entry.identity_key_file);
            match Account::from_key_file(&entry.name, &entry.provider, &key_path) {
                Ok(account) => Some(account),
                Err(e) => {
                    error!(account = %entry.name, error = %e, "account aborted");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountConfig;

    #[test]
    fn test_generate_refuses_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alice.key");
        let secret = generate(&path).expect("generate");
        let stored = std::fs::read_to_string(&path).expect("read");
        assert_eq!(stored.trim(), secret.to_hex());
        assert!(generate(&path).is_err());
    }

    #[test]
    fn test_missing_key_skips_only_that_account() {
        let dir = tempfile::tempdir().expect("tempdir");
        generate(&dir.path().join("alice.key")).expect("generate");

        let mut config = DaemonConfig::default();
        config.storage.data_dir = dir.path().display().to_string();
        for name in ["alice", "bob"] {
            config.accounts.push(AccountConfig {
                name: name.into(),
                provider: "provider-1".into(),
                identity_key_file: format!("{name}.key"),
            });
        }

        let accounts = load_accounts(&config);
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].address(), "alice@provider-1");
    }
}

//! One provider session per account.
//!
//! Sessions are opened lazily on first use and authenticated with
//! [`ProviderCommand::Authenticate`]. Concurrent first uses for the same
//! account are funneled through a per-account gate so only one connection
//! is made. A session that fails is invalidated and the next use reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use mixclient_path::consensus::ConsensusCache;
use mixclient_path::PathError;
use mixclient_transport::session::{self, Session, Transport};
use mixclient_transport::wire::{ProviderCommand, ProviderReply};
use mixclient_transport::TransportError;
use mixclient_types::AccountId;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::account::Account;
use crate::{EngineError, Result};

/// An authenticated session to an account's provider.
///
/// Exchanges are serialized: each command holds the session until its reply
/// arrives, so the send and fetch pipelines interleave at command
/// granularity.
pub struct ProviderSession {
    account: AccountId,
    provider: String,
    inner: tokio::sync::Mutex<Box<dyn Session>>,
}

impl ProviderSession {
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Send `command` and wait for its reply.
    ///
    /// # Errors
    ///
    /// Any [`TransportError`] from the underlying session.
    pub async fn exchange(&self, command: &ProviderCommand) -> Result<ProviderReply> {
        let mut inner = self.inner.lock().await;
        Ok(session::request(inner.as_mut(), command).await?)
    }

    async fn close(&self) {
        self.inner.lock().await.close().await;
    }
}

/// Lazily connected provider sessions, keyed by account.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    consensus: Arc<ConsensusCache>,
    sessions: Mutex<HashMap<AccountId, Arc<ProviderSession>>>,
    gates: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionPool {
    pub fn new(transport: Arc<dyn Transport>, consensus: Arc<ConsensusCache>) -> Self {
        Self {
            transport,
            consensus,
            sessions: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// The live session for `account`, connecting and authenticating if
    /// there is none.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Path`] if the account's provider is not in the
    ///   current consensus
    /// - [`EngineError::Transport`] if connecting fails
    /// - [`EngineError::Rejected`] if the provider refuses authentication
    pub async fn get_session(&self, account: &Account) -> Result<Arc<ProviderSession>> {
        if let Some(existing) = self.sessions.lock().get(&account.id) {
            return Ok(Arc::clone(existing));
        }

        let gate = Arc::clone(self.gates.lock().entry(account.id).or_default());
        let _guard = gate.lock().await;

        // Another task may have connected while we waited.
        if let Some(existing) = self.sessions.lock().get(&account.id) {
            return Ok(Arc::clone(existing));
        }

        let topology = self.consensus.snapshot();
        let provider = topology
            .provider(&account.provider)
            .ok_or_else(|| PathError::UnknownProvider(account.provider.clone()))?
            .clone();
        drop(topology);

        let mut raw = self.transport.connect(&provider).await?;
        let auth = ProviderCommand::Authenticate {
            account: account.id,
            link_public_key: account.identity.public_key().to_bytes(),
        };
        match session::request(raw.as_mut(), &auth).await {
            Ok(ProviderReply::Ok) => {}
            Ok(ProviderReply::Error { reason }) => {
                raw.close().await;
                return Err(EngineError::Rejected(reason));
            }
            Ok(other) => {
                raw.close().await;
                return Err(TransportError::ProtocolViolation(format!(
                    "unexpected reply to authenticate: {other:?}"
                ))
                .into());
            }
            Err(e) => {
                raw.close().await;
                return Err(e.into());
            }
        }

        let session = Arc::new(ProviderSession {
            account: account.id,
            provider: provider.name.clone(),
            inner: tokio::sync::Mutex::new(raw),
        });
        self.sessions.lock().insert(account.id, Arc::clone(&session));
        info!(account = %account.address(), provider = %provider.name, "provider session established");
        Ok(session)
    }

    /// Close a session that failed. It is removed from the pool only while
    /// it is still the account's current one, so a late failure on an old
    /// session never tears down its replacement.
    pub async fn invalidate(&self, failed: &Arc<ProviderSession>) {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&failed.account) {
                Some(current) if Arc::ptr_eq(current, failed) => sessions.remove(&failed.account),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!(account = %failed.account, "provider session invalidated");
        } else {
            debug!(account = %failed.account, "failed session was already replaced");
        }
        failed.close().await;
    }

    /// Whether `account` currently holds a session.
    pub fn is_connected(&self, account: &AccountId) -> bool {
        self.sessions.lock().contains_key(account)
    }

    /// Close every session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mixclient_transport::wire;
    use mixclient_types::{ConsensusSnapshot, NodeDescriptor, NodeFlags};

    use super::*;
    use mixclient_crypto::x25519::X25519StaticSecret;

    /// Session that authenticates and then echoes `Ok`.
    struct EchoSession {
        pending: Option<ProviderCommand>,
        commands: Arc<Mutex<Vec<ProviderCommand>>>,
        refuse: bool,
    }

    #[async_trait]
    impl Session for EchoSession {
        async fn send(&mut self, data: &[u8]) -> mixclient_transport::Result<()> {
            let command = wire::decode_command(data)?;
            self.commands.lock().push(command.clone());
            self.pending = Some(command);
            Ok(())
        }

        async fn receive(&mut self) -> mixclient_transport::Result<Vec<u8>> {
            let reply = match self.pending.take() {
                Some(ProviderCommand::Authenticate { .. }) if self.refuse => ProviderReply::Error {
                    reason: "unknown account".into(),
                },
                Some(_) => ProviderReply::Ok,
                None => return Err(TransportError::Closed),
            };
            wire::encode_reply(&reply)
        }

        async fn close(&mut self) {}
    }

    struct CountingTransport {
        connects: AtomicUsize,
        commands: Arc<Mutex<Vec<ProviderCommand>>>,
        refuse: bool,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn connect(
            &self,
            _node: &NodeDescriptor,
        ) -> mixclient_transport::Result<Box<dyn Session>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Box::new(EchoSession {
                pending: None,
                commands: Arc::clone(&self.commands),
                refuse: self.refuse,
            }))
        }
    }

    fn consensus() -> Arc<ConsensusCache> {
        let provider = NodeDescriptor {
            name: "provider-1".into(),
            identity_key: [1; 32],
            link_key: X25519StaticSecret::random().public_key().to_bytes(),
            address: "127.0.0.1:1".into(),
            flags: NodeFlags {
                is_provider: true,
                supports_surb: true,
            },
        };
        Arc::new(
            ConsensusCache::from_snapshot(ConsensusSnapshot {
                epoch: 1,
                nodes: vec![provider],
                signature_valid: true,
            })
            .expect("snapshot"),
        )
    }

    fn pool(refuse: bool) -> (Arc<SessionPool>, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport {
            connects: AtomicUsize::new(0),
            commands: Arc::new(Mutex::new(Vec::new())),
            refuse,
        });
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            consensus(),
        ));
        (pool, transport)
    }

    #[tokio::test]
    async fn test_lazy_connect_and_reuse() {
        let (pool, transport) = pool(false);
        let account = Account::new("alice", "provider-1", X25519StaticSecret::random());
        assert!(!pool.is_connected(&account.id));

        let first = pool.get_session(&account).await.expect("session");
        let second = pool.get_session(&account).await.expect("session");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            transport.commands.lock().first(),
            Some(ProviderCommand::Authenticate { account: id, .. }) if *id == account.id
        ));
    }

    #[tokio::test]
    async fn test_concurrent_first_use_connects_once() {
        let (pool, transport) = pool(false);
        let account = Account::new("alice", "provider-1", X25519StaticSecret::random());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let account = account.clone();
            handles.push(tokio::spawn(async move { pool.get_session(&account).await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("session");
        }
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_reconnects() {
        let (pool, transport) = pool(false);
        let account = Account::new("alice", "provider-1", X25519StaticSecret::random());
        let failed = pool.get_session(&account).await.expect("session");
        pool.invalidate(&failed).await;
        assert!(!pool.is_connected(&account.id));

        let session = pool.get_session(&account).await.expect("session");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        let reply = session
            .exchange(&ProviderCommand::Acknowledge { sequence: 0 })
            .await
            .expect("exchange");
        assert_eq!(reply, ProviderReply::Ok);
    }

    #[tokio::test]
    async fn test_late_failure_keeps_replacement() {
        let (pool, transport) = pool(false);
        let account = Account::new("alice", "provider-1", X25519StaticSecret::random());
        let old = pool.get_session(&account).await.expect("session");
        pool.invalidate(&old).await;
        let fresh = pool.get_session(&account).await.expect("session");

        // The other pipeline reports its failure on the old session late.
        pool.invalidate(&old).await;
        assert!(pool.is_connected(&account.id));
        let current = pool.get_session(&account).await.expect("session");
        assert!(Arc::ptr_eq(&current, &fresh));
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let (pool, _) = pool(false);
        let account = Account::new("alice", "elsewhere", X25519StaticSecret::random());
        assert!(matches!(
            pool.get_session(&account).await,
            Err(EngineError::Path(PathError::UnknownProvider(_)))
        ));
    }

    #[tokio::test]
    async fn test_authentication_refused() {
        let (pool, _) = pool(true);
        let account = Account::new("alice", "provider-1", X25519StaticSecret::random());
        assert!(matches!(
            pool.get_session(&account).await,
            Err(EngineError::Rejected(_))
        ));
        assert!(!pool.is_connected(&account.id));
    }
}

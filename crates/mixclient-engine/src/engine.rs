//! The [`Engine`] facade.
//!
//! [`Engine::start`] validates each account against the current topology,
//! reloads persisted state and spawns one send and one fetch task per
//! account. An account that fails validation is aborted on its own; the
//! others keep running.

use std::collections::HashMap;
use std::sync::Arc;

use mixclient_block::fragment;
use mixclient_db::records::PendingSendRecord;
use mixclient_db::store::now_secs;
use mixclient_db::MessageStore;
use mixclient_path::consensus::ConsensusCache;
use mixclient_path::directory::UserDirectory;
use mixclient_path::selector::PathSelector;
use mixclient_path::PathError;
use mixclient_replay::ReplayFilter;
use mixclient_transport::session::Transport;
use mixclient_types::{AccountId, ConsensusSnapshot, MessageId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::config::EngineConfig;
use crate::events::{DeliveryEvent, EventSink, ReceivedMessage};
use crate::fetch::FetchScheduler;
use crate::pipeline::{AccountPipeline, Shared};
use crate::send::SendScheduler;
use crate::session_pool::SessionPool;
use crate::{EngineError, Result};

/// Receiving halves of the engine's notification channels.
pub struct EngineEvents {
    pub delivery: mpsc::Receiver<DeliveryEvent>,
    pub received: mpsc::Receiver<ReceivedMessage>,
}

struct AccountHandle {
    pipeline: Arc<AccountPipeline>,
    queue: mpsc::Sender<PendingSendRecord>,
}

/// A running message delivery engine.
pub struct Engine {
    shared: Arc<Shared>,
    accounts: HashMap<AccountId, AccountHandle>,
    aborted: Vec<(String, EngineError)>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start pipelines for `accounts`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Path`] if the mixing parameters are invalid
    /// - [`EngineError::Replay`] if the replay filter cannot be sized
    /// - [`EngineError::Db`] if persisted state cannot be read
    ///
    /// Per-account topology failures do not fail the call; see
    /// [`Engine::aborted`].
    pub async fn start(
        config: EngineConfig,
        accounts: Vec<Account>,
        consensus: Arc<ConsensusCache>,
        directory: Arc<UserDirectory>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MessageStore>,
    ) -> Result<(Self, EngineEvents)> {
        let selector = PathSelector::new(config.hops, config.lambda, config.max_delay_ms)?;
        let replay = Arc::new(ReplayFilter::new(config.replay, consensus.epoch())?);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events, delivery, received) =
            EventSink::new(config.queue_capacity, shutdown_rx.clone());
        let queue_capacity = config.queue_capacity.max(1);

        let shared = Arc::new(Shared {
            config,
            consensus: Arc::clone(&consensus),
            directory,
            selector,
            pool: SessionPool::new(transport, Arc::clone(&consensus)),
            replay,
            store,
            events,
        });

        let topology = consensus.snapshot();
        let mut handles = HashMap::new();
        let mut aborted = Vec::new();
        let mut tasks = Vec::new();
        for account in accounts {
            let address = account.address();
            if handles.contains_key(&account.id) {
                warn!(account = %address, "duplicate account ignored");
                continue;
            }
            if let Err(e) = shared.selector.check_topology(&topology, &account.provider) {
                error!(account = %address, error = %e, "account aborted");
                aborted.push((address, e.into()));
                continue;
            }

            let pipeline = Arc::new(AccountPipeline::new(account, Arc::clone(&shared)));
            let backlog = pipeline.pending_backlog()?;
            let (queue, queue_rx) = mpsc::channel(queue_capacity);

            tasks.push(tokio::spawn(
                SendScheduler::new(Arc::clone(&pipeline), queue_rx, backlog, shutdown_rx.clone())
                    .run(),
            ));
            tasks.push(tokio::spawn(
                FetchScheduler::new(Arc::clone(&pipeline), shutdown_rx.clone()).run(),
            ));
            info!(account = %address, "account pipeline started");
            handles.insert(pipeline.account.id, AccountHandle { pipeline, queue });
        }

        info!(
            accounts = handles.len(),
            aborted = aborted.len(),
            epoch = topology.epoch(),
            "engine started"
        );
        Ok((
            Self {
                shared,
                accounts: handles,
                aborted,
                shutdown,
                tasks: Mutex::new(tasks),
            },
            EngineEvents { delivery, received },
        ))
    }

    /// Accounts that were rejected at startup, by address.
    pub fn aborted(&self) -> &[(String, EngineError)] {
        &self.aborted
    }

    /// Accounts with running pipelines.
    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values().map(|h| &h.pipeline.account)
    }

    fn handle(&self, account: &AccountId) -> Result<&AccountHandle> {
        self.accounts
            .get(account)
            .ok_or_else(|| EngineError::UnknownAccount(account.to_string()))
    }

    /// Fragment `plaintext` for `recipient` and queue it behind the
    /// account's earlier submissions.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownAccount`] for an account without a pipeline
    /// - [`EngineError::UnknownRecipient`] if the directory has no entry
    /// - [`EngineError::Block`] if the message exceeds the block limit
    /// - [`EngineError::ShuttingDown`] once shutdown has begun
    pub async fn submit(
        &self,
        account: &AccountId,
        recipient: &str,
        plaintext: &[u8],
    ) -> Result<MessageId> {
        if *self.shutdown.borrow() {
            return Err(EngineError::ShuttingDown);
        }
        let handle = self.handle(account)?;
        let resolved = self
            .shared
            .directory
            .resolve(recipient)
            .map_err(|e| match e {
                PathError::UnknownRecipient(r) => EngineError::UnknownRecipient(r),
                other => other.into(),
            })?;

        let sender = &handle.pipeline.account;
        let blocks = fragment(plaintext, &resolved.identity_key, &sender.identity)?;
        let message_id = blocks
            .first()
            .map(|b| b.message_id)
            .unwrap_or_else(MessageId::random);
        let record = PendingSendRecord {
            message_id,
            recipient: format!("{}@{}", resolved.name, resolved.provider),
            blocks: blocks.iter().map(|b| b.to_bytes()).collect(),
            next_block: 0,
            attempts: 0,
            created_at: now_secs(),
            last_attempt_at: None,
        };
        handle.pipeline.save_pending(&record)?;

        if handle.queue.send(record).await.is_err() {
            return Err(EngineError::ShuttingDown);
        }
        debug!(
            account = %sender.address(),
            %message_id,
            blocks = blocks.len(),
            "message queued"
        );
        Ok(message_id)
    }

    /// Drain the account's provider queue now, outside the periodic tick.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownAccount`], or any session or storage error.
    pub async fn poll_once(&self, account: &AccountId) -> Result<usize> {
        self.handle(account)?.pipeline.poll().await
    }

    /// Install a newer consensus and start a fresh replay epoch.
    ///
    /// # Errors
    ///
    /// - [`PathError::StaleConsensus`] if `snapshot` is not newer
    /// - [`PathError::UnsignedConsensus`] if it was not verified
    pub fn rotate_consensus(&self, snapshot: ConsensusSnapshot) -> Result<()> {
        let epoch = snapshot.epoch;
        self.shared.consensus.update(snapshot)?;
        self.shared.replay.rotate(epoch)?;
        info!(epoch, "consensus rotated");
        Ok(())
    }

    /// Epoch of the topology in use.
    pub fn epoch(&self) -> u64 {
        self.shared.consensus.epoch()
    }

    /// The store holding this engine's records.
    pub fn store(&self) -> &dyn MessageStore {
        self.shared.store.as_ref()
    }

    /// Stop every pipeline and close provider sessions.
    ///
    /// Fetch loops exit at their next select point; a send in progress
    /// finishes its current attempt and leaves the rest of the message in
    /// `pending/` for the next start.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("engine shutting down");
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        self.shared.pool.close_all().await;
        info!("engine stopped");
    }
}

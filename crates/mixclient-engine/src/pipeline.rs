//! State shared by an account's send and fetch schedulers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use mixclient_block::Reassembler;
use mixclient_db::records::{
    self, FailedRecord, PendingSendRecord, SentRecord, PENDING_PREFIX,
};
use mixclient_db::store::now_secs;
use mixclient_db::MessageStore;
use mixclient_path::consensus::ConsensusCache;
use mixclient_path::directory::UserDirectory;
use mixclient_path::selector::PathSelector;
use mixclient_replay::ReplayFilter;
use mixclient_transport::surb::SurbKeyTable;
use mixclient_types::MessageId;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::account::Account;
use crate::config::EngineConfig;
use crate::events::{DeliveryEvent, EventSink};
use crate::session_pool::SessionPool;
use crate::Result;

/// Effect of one end-to-end acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AckProgress {
    /// Block already acknowledged, or the message already delivered.
    Duplicate,
    /// New block acknowledged; others are still outstanding.
    Recorded,
    /// Last outstanding block acknowledged.
    Delivered,
}

/// Collaborators common to every account.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) consensus: Arc<ConsensusCache>,
    pub(crate) directory: Arc<UserDirectory>,
    pub(crate) selector: PathSelector,
    pub(crate) pool: SessionPool,
    pub(crate) replay: Arc<ReplayFilter>,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) events: EventSink,
}

pub(crate) struct AccountPipeline {
    pub(crate) account: Account,
    pub(crate) shared: Arc<Shared>,
    /// SURBs issued by this account's sends, consumed by its fetches.
    pub(crate) surbs: SurbKeyTable,
    pub(crate) reassembler: Mutex<Reassembler>,
    /// Serializes fetches; holds the retrieval cursor.
    pub(crate) fetch_cursor: tokio::sync::Mutex<u32>,
    /// Acknowledged blocks of messages not yet fully delivered.
    acks: Mutex<HashMap<MessageId, BTreeSet<u32>>>,
}

impl AccountPipeline {
    pub(crate) fn new(account: Account, shared: Arc<Shared>) -> Self {
        let reassembler = Reassembler::new(account.identity.clone(), shared.config.reassembly_expiry);
        Self {
            account,
            shared,
            surbs: SurbKeyTable::new(),
            reassembler: Mutex::new(reassembler),
            fetch_cursor: tokio::sync::Mutex::new(0),
            acks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn store(&self) -> &dyn MessageStore {
        self.shared.store.as_ref()
    }

    /// Stored pending sends, oldest first.
    pub(crate) fn pending_backlog(&self) -> Result<Vec<PendingSendRecord>> {
        let mut backlog: Vec<PendingSendRecord> =
            records::list_json(self.store(), &self.account.id, PENDING_PREFIX)?
                .into_iter()
                .map(|(_, record)| record)
                .collect();
        backlog.sort_by_key(|r: &PendingSendRecord| r.created_at);
        Ok(backlog)
    }

    pub(crate) fn save_pending(&self, record: &PendingSendRecord) -> Result<()> {
        records::put_json(
            self.store(),
            &self.account.id,
            &records::pending_key(&record.message_id),
            record,
        )?;
        Ok(())
    }

    /// Record a terminal failure and notify.
    pub(crate) async fn fail(&self, record: &PendingSendRecord, reason: String) {
        error!(
            account = %self.account.address(),
            message_id = %record.message_id,
            block = record.next_block,
            attempts = record.attempts,
            %reason,
            "message failed permanently"
        );
        let failed = FailedRecord {
            message_id: record.message_id,
            recipient: record.recipient.clone(),
            attempts: record.attempts,
            reason: reason.clone(),
            failed_at: now_secs(),
        };
        let persisted = records::put_json(
            self.store(),
            &self.account.id,
            &records::failed_key(&record.message_id),
            &failed,
        )
        .and_then(|()| {
            self.store()
                .delete(&self.account.id, &records::pending_key(&record.message_id))
        });
        if let Err(e) = persisted {
            error!(message_id = %record.message_id, error = %e, "failed to record permanent failure");
        }
        self.acks.lock().remove(&record.message_id);
        let dropped = self.surbs.forget_message(&record.message_id);
        debug!(message_id = %record.message_id, dropped, "released unanswered SURBs");

        self.shared
            .events
            .delivery(DeliveryEvent::PermanentFailure {
                account: self.account.id,
                message_id: record.message_id,
                attempts: record.attempts,
                reason,
            })
            .await;
    }

    /// Move a fully sent message from `pending/` to `sent/`.
    pub(crate) async fn finish(&self, record: &PendingSendRecord) -> Result<()> {
        let delivered = {
            let mut acks = self.acks.lock();
            let sent = SentRecord {
                message_id: record.message_id,
                recipient: record.recipient.clone(),
                blocks: record.blocks.len() as u32,
                sent_at: now_secs(),
                acknowledged: acks
                    .get(&record.message_id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default(),
            };
            records::put_json(
                self.store(),
                &self.account.id,
                &records::sent_key(&record.message_id),
                &sent,
            )?;
            self.store()
                .delete(&self.account.id, &records::pending_key(&record.message_id))?;
            let delivered = sent.is_acknowledged();
            if delivered {
                acks.remove(&record.message_id);
                self.surbs.forget_message(&record.message_id);
            }
            delivered
        };

        info!(
            account = %self.account.address(),
            message_id = %record.message_id,
            blocks = record.blocks.len(),
            "message sent"
        );
        self.shared
            .events
            .delivery(DeliveryEvent::Sent {
                account: self.account.id,
                message_id: record.message_id,
            })
            .await;
        if delivered {
            self.delivered(record.message_id).await;
        }
        Ok(())
    }

    /// Note an end-to-end acknowledgement of `block`.
    ///
    /// Acks may arrive before the last block is handed off; they are held
    /// here until [`AccountPipeline::finish`] writes the sent record. Once a
    /// sent record exists every ack is merged into it, so a late ack from a
    /// retried block never shrinks the acknowledged set.
    pub(crate) fn note_ack(&self, message_id: MessageId, block: u32) -> Result<AckProgress> {
        let mut acks = self.acks.lock();
        let key = records::sent_key(&message_id);
        let stored = records::get_json::<_, SentRecord>(self.store(), &self.account.id, &key)?;
        if stored
            .as_ref()
            .is_some_and(|sent| sent.is_acknowledged() || sent.acknowledged.contains(&block))
        {
            return Ok(AckProgress::Duplicate);
        }

        let held = acks.entry(message_id).or_default();
        if !held.insert(block) {
            return Ok(AckProgress::Duplicate);
        }
        let Some(mut sent) = stored else {
            return Ok(AckProgress::Recorded);
        };

        let merged: BTreeSet<u32> = sent.acknowledged.iter().chain(held.iter()).copied().collect();
        sent.acknowledged = merged.into_iter().collect();
        records::put_json(self.store(), &self.account.id, &key, &sent)?;
        if sent.is_acknowledged() {
            acks.remove(&message_id);
            self.surbs.forget_message(&message_id);
            return Ok(AckProgress::Delivered);
        }
        Ok(AckProgress::Recorded)
    }

    pub(crate) async fn delivered(&self, message_id: MessageId) {
        info!(account = %self.account.address(), %message_id, "message delivered");
        self.shared
            .events
            .delivery(DeliveryEvent::Delivered {
                account: self.account.id,
                message_id,
            })
            .await;
    }
}

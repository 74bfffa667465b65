//! Per-account fetch scheduler.
//!
//! Every `fetch_interval` the account's provider queue is drained: each
//! retrieved item is processed locally and only then acknowledged, so a
//! crash or session failure leads to redelivery rather than loss.
//! Redelivered blocks are dropped by the replay filter.
//!
//! | Item | Handling |
//! |------|----------|
//! | `Message` | dedupe, parse, authenticate, reassemble, store |
//! | `SurbReply` | consume the SURB, decrypt, record the acknowledgement |

use std::sync::Arc;
use std::time::Duration;

use mixclient_block::{Block, DecryptedMessage, InsertOutcome};
use mixclient_crypto::blake3::{self, contexts};
use mixclient_db::records::{self, FragmentRecord, InboxRecord, FRAGMENT_PREFIX};
use mixclient_db::store::now_secs;
use mixclient_transport::wire::{ProviderCommand, ProviderReply};
use mixclient_transport::TransportError;
use mixclient_types::SurbId;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::{DeliveryEvent, ReceivedMessage};
use crate::pipeline::{AccountPipeline, AckProgress};
use crate::session_pool::ProviderSession;
use crate::{EngineError, Result};

pub(crate) struct FetchScheduler {
    pipeline: Arc<AccountPipeline>,
    shutdown: watch::Receiver<bool>,
}

impl FetchScheduler {
    pub(crate) fn new(pipeline: Arc<AccountPipeline>, shutdown: watch::Receiver<bool>) -> Self {
        Self { pipeline, shutdown }
    }

    pub(crate) async fn run(mut self) {
        let account = self.pipeline.account.address();
        match self.pipeline.restore_fragments().await {
            Ok(0) => {}
            Ok(restored) => info!(%account, restored, "restored stored fragments"),
            Err(e) => warn!(%account, error = %e, "failed to restore stored fragments"),
        }

        let mut ticker = interval(self.pipeline.shared.config.fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(%account, "fetch scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }

            match self.pipeline.poll().await {
                Ok(0) => {}
                Ok(processed) => debug!(%account, processed, "fetch tick"),
                Err(e) => warn!(%account, error = %e, "fetch failed"),
            }
            self.pipeline.sweep();
        }
        info!(%account, "fetch scheduler stopped");
    }
}

impl AccountPipeline {
    /// Drain the provider queue once. Returns the number of items processed.
    ///
    /// # Errors
    ///
    /// Session, timeout and storage errors. Items processed before the
    /// error stay acknowledged; the failing item is redelivered later.
    pub(crate) async fn poll(&self) -> Result<usize> {
        let mut cursor = self.fetch_cursor.lock().await;
        let session = tokio::time::timeout(
            self.shared.config.send_timeout,
            self.shared.pool.get_session(&self.account),
        )
        .await
        .map_err(|_| EngineError::Timeout)??;

        let result = self.drain(&session, &mut cursor).await;
        if let Err(e) = &result {
            if e.breaks_session() {
                self.shared.pool.invalidate(&session).await;
            }
        }
        result
    }

    async fn drain(&self, session: &ProviderSession, cursor: &mut u32) -> Result<usize> {
        let mut processed = 0;
        while processed < self.shared.config.fetch_drain_limit {
            let reply = self
                .exchange(session, ProviderCommand::RetrieveMessage { sequence: *cursor })
                .await?;
            let (sequence, remaining) = match reply {
                ProviderReply::Empty { .. } => break,
                ProviderReply::Message {
                    sequence,
                    payload,
                    queue_hint,
                } => {
                    self.accept_block(&payload).await?;
                    (sequence, queue_hint)
                }
                ProviderReply::SurbReply {
                    sequence,
                    surb_id,
                    payload,
                    queue_hint,
                } => {
                    self.accept_ack(&surb_id, &payload).await?;
                    (sequence, queue_hint)
                }
                ProviderReply::Error { reason } => return Err(EngineError::Rejected(reason)),
                ProviderReply::Ok => {
                    return Err(TransportError::ProtocolViolation(
                        "unexpected Ok to retrieve".to_string(),
                    )
                    .into())
                }
            };

            match self
                .exchange(session, ProviderCommand::Acknowledge { sequence })
                .await?
            {
                ProviderReply::Ok => {}
                ProviderReply::Error { reason } => return Err(EngineError::Rejected(reason)),
                other => {
                    return Err(TransportError::ProtocolViolation(format!(
                        "unexpected reply to acknowledge: {other:?}"
                    ))
                    .into())
                }
            }
            *cursor = sequence.wrapping_add(1);
            processed += 1;
            if remaining == 0 {
                break;
            }
        }
        Ok(processed)
    }

    async fn exchange(
        &self,
        session: &ProviderSession,
        command: ProviderCommand,
    ) -> Result<ProviderReply> {
        tokio::time::timeout(self.shared.config.send_timeout, session.exchange(&command))
            .await
            .map_err(|_| EngineError::Timeout)?
    }

    /// Process one forward block. Undecodable or unauthenticated blocks are
    /// dropped; only storage failures are returned.
    async fn accept_block(&self, payload: &[u8]) -> Result<()> {
        let tag = blake3::derive_key_multi(
            contexts::INBOUND_DEDUP_TAG,
            &[self.account.id.as_bytes(), payload],
        );
        if self.shared.replay.contains(&tag) {
            debug!(account = %self.account.id, "redelivered block dropped");
            return Ok(());
        }

        match Block::from_bytes(payload) {
            Ok(block) => self.insert_block(&block, now_secs()).await?,
            Err(e) => debug!(account = %self.account.id, reason = %e, "inbound block dropped"),
        }
        self.shared.replay.test_and_set(&tag);
        Ok(())
    }

    async fn insert_block(&self, block: &Block, received_at: u64) -> Result<()> {
        let outcome = self.reassembler.lock().insert(block);
        match outcome {
            Ok(InsertOutcome::Pending {
                message_id,
                have,
                total,
            }) => {
                records::put_json(
                    self.store(),
                    &self.account.id,
                    &records::fragment_key(&message_id, block.sequence),
                    &FragmentRecord {
                        block: block.to_bytes(),
                        received_at,
                    },
                )?;
                debug!(%message_id, have, total, "fragment stored");
            }
            Ok(InsertOutcome::Complete(message)) => self.complete(message).await?,
            Ok(InsertOutcome::Duplicate) => {
                debug!(message_id = %block.message_id, sequence = block.sequence, "duplicate fragment");
            }
            Err(e) => {
                debug!(message_id = %block.message_id, reason = %e, "fragment discarded");
            }
        }
        Ok(())
    }

    async fn complete(&self, message: DecryptedMessage) -> Result<()> {
        let id = message.message_id;
        let inbox = records::inbox_key(&id);
        let already_stored = self.store().get(&self.account.id, &inbox)?.is_some();
        if !already_stored {
            records::put_json(
                self.store(),
                &self.account.id,
                &inbox,
                &InboxRecord {
                    message_id: id,
                    sender: message.sender.to_bytes(),
                    plaintext: message.plaintext.clone(),
                    received_at: now_secs(),
                },
            )?;
        }
        for (key, _) in self.store().list(&self.account.id, &records::fragment_prefix(&id))? {
            self.store().delete(&self.account.id, &key)?;
        }
        if already_stored {
            debug!(message_id = %id, "message already in inbox");
            return Ok(());
        }

        info!(
            account = %self.account.address(),
            message_id = %id,
            bytes = message.plaintext.len(),
            "message received"
        );
        self.shared
            .events
            .received(ReceivedMessage {
                account: self.account.id,
                message_id: id,
                sender: message.sender,
                plaintext: message.plaintext,
            })
            .await;
        Ok(())
    }

    /// Process a SURB acknowledgement. Unknown, reused or undecryptable
    /// replies are dropped.
    async fn accept_ack(&self, surb_id: &SurbId, payload: &[u8]) -> Result<()> {
        let entry = match self.surbs.take(surb_id) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(account = %self.account.id, reason = %e, "SURB reply dropped");
                return Ok(());
            }
        };
        if let Err(e) = entry.keys.decrypt_reply(payload) {
            debug!(account = %self.account.id, reason = %e, "SURB reply dropped");
            return Ok(());
        }

        debug!(message_id = %entry.message_id, block = entry.block, "block acknowledged");
        let progress = self.note_ack(entry.message_id, entry.block)?;
        if progress == AckProgress::Duplicate {
            debug!(message_id = %entry.message_id, block = entry.block, "ack already recorded");
            return Ok(());
        }
        self.shared
            .events
            .delivery(DeliveryEvent::Acknowledged {
                account: self.account.id,
                message_id: entry.message_id,
                block: entry.block,
            })
            .await;
        if progress == AckProgress::Delivered {
            self.delivered(entry.message_id).await;
        }
        Ok(())
    }

    /// Feed stored fragments back into the reassembler. Fragments older
    /// than the reassembly expiry are deleted instead.
    pub(crate) async fn restore_fragments(&self) -> Result<usize> {
        let _guard = self.fetch_cursor.lock().await;
        let stored: Vec<(String, FragmentRecord)> =
            records::list_json(self.store(), &self.account.id, FRAGMENT_PREFIX)?;
        let max_age = self.shared.config.reassembly_expiry.as_secs();
        let now = now_secs();

        let mut restored = 0;
        for (key, record) in stored {
            if now.saturating_sub(record.received_at) >= max_age {
                self.store().delete(&self.account.id, &key)?;
                continue;
            }
            match Block::from_bytes(&record.block) {
                Ok(block) => {
                    self.insert_block(&block, record.received_at).await?;
                    restored += 1;
                }
                Err(e) => {
                    warn!(%key, error = %e, "corrupt stored fragment removed");
                    self.store().delete(&self.account.id, &key)?;
                }
            }
        }
        Ok(restored)
    }

    /// Expire unanswered SURBs, stale partial messages and their stored
    /// fragments.
    pub(crate) fn sweep(&self) {
        let config = &self.shared.config;
        self.surbs.expire(config.surb_max_age);
        let dropped = self.reassembler.lock().expire(std::time::Instant::now());
        if dropped == 0 {
            return;
        }
        if let Err(e) = self.delete_stale_fragments(config.reassembly_expiry) {
            warn!(account = %self.account.id, error = %e, "failed to delete stale fragments");
        }
    }

    fn delete_stale_fragments(&self, max_age: Duration) -> Result<()> {
        let now = now_secs();
        let stored: Vec<(String, FragmentRecord)> =
            records::list_json(self.store(), &self.account.id, FRAGMENT_PREFIX)?;
        for (key, record) in stored {
            if now.saturating_sub(record.received_at) >= max_age.as_secs() {
                self.store().delete(&self.account.id, &key)?;
            }
        }
        Ok(())
    }
}

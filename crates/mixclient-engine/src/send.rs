//! Per-account send scheduler.
//!
//! One task per account drains a FIFO of pending sends, one block at a
//! time, so the provider observes an account's packets in submission
//! order. Each attempt picks a fresh path and a fresh acknowledgement SURB.
//! A block is sent without a SURB when the recipient's provider or the
//! reply route cannot carry one; such messages never reach `Delivered`.
//!
//! ## Retry policy
//!
//! A failed attempt (path, session, timeout or provider error) is retried
//! after `min(base * 2^(attempt-1), max)` with full jitter. Once
//! `max_send_attempts` is reached the message is recorded under `failed/`
//! and a [`DeliveryEvent::PermanentFailure`](crate::DeliveryEvent) is
//! emitted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use mixclient_block::BlockError;
use mixclient_db::records::PendingSendRecord;
use mixclient_db::store::now_secs;
use mixclient_path::directory::Recipient;
use mixclient_transport::codec::{self, ReplyRoute};
use mixclient_transport::wire::{ProviderCommand, ProviderReply};
use mixclient_transport::TransportError;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::pipeline::AccountPipeline;
use crate::{EngineError, Result};

/// Delay before retry number `attempt` (1-based), drawn uniformly from
/// `[0, min(base * 2^(attempt-1), max)]`.
pub fn backoff_delay<R: Rng + ?Sized>(
    attempt: u32,
    base: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let ceiling = base.saturating_mul(1u32 << exponent).min(max);
    let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rng.gen_range(0..=millis))
}

pub(crate) struct SendScheduler {
    pipeline: Arc<AccountPipeline>,
    queue: mpsc::Receiver<PendingSendRecord>,
    backlog: VecDeque<PendingSendRecord>,
    shutdown: watch::Receiver<bool>,
}

impl SendScheduler {
    pub(crate) fn new(
        pipeline: Arc<AccountPipeline>,
        queue: mpsc::Receiver<PendingSendRecord>,
        backlog: Vec<PendingSendRecord>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pipeline,
            queue,
            backlog: backlog.into(),
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let account = self.pipeline.account.address();
        info!(%account, backlog = self.backlog.len(), "send scheduler started");
        while let Some(record) = self.next().await {
            if !self.deliver(record).await {
                break;
            }
        }
        info!(%account, "send scheduler stopped");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn next(&mut self) -> Option<PendingSendRecord> {
        if self.stopping() {
            return None;
        }
        if let Some(record) = self.backlog.pop_front() {
            return Some(record);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => None,
            record = self.queue.recv() => record,
        }
    }

    /// Send every remaining block of `record`. Returns `false` if shutdown
    /// interrupted it; the pending record then resumes on the next start.
    async fn deliver(&mut self, mut record: PendingSendRecord) -> bool {
        let pipeline = Arc::clone(&self.pipeline);
        let config = &pipeline.shared.config;

        let recipient = match pipeline.shared.directory.resolve(&record.recipient) {
            Ok(recipient) => recipient,
            Err(e) => {
                pipeline.fail(&record, e.to_string()).await;
                return true;
            }
        };

        while !record.is_complete() {
            if self.stopping() {
                return false;
            }
            let index = record.next_block;
            let result = send_block(&pipeline, &recipient, &record, index).await;
            record.last_attempt_at = Some(now_secs());

            match result {
                Ok(()) => {
                    debug!(
                        message_id = %record.message_id,
                        block = index,
                        total = record.blocks.len(),
                        "block accepted by provider"
                    );
                    record.next_block += 1;
                    record.attempts = 0;
                }
                Err(e) => {
                    record.attempts += 1;
                    if record.attempts >= config.max_send_attempts {
                        pipeline.fail(&record, e.to_string()).await;
                        return true;
                    }
                    let delay = backoff_delay(
                        record.attempts,
                        config.backoff_base,
                        config.backoff_max,
                        &mut rand::thread_rng(),
                    );
                    warn!(
                        account = %pipeline.account.address(),
                        message_id = %record.message_id,
                        block = index,
                        attempt = record.attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "block send failed, retrying"
                    );
                    if let Err(e) = pipeline.save_pending(&record) {
                        warn!(message_id = %record.message_id, error = %e, "failed to persist pending send");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return false,
                    }
                    continue;
                }
            }

            if !record.is_complete() {
                if let Err(e) = pipeline.save_pending(&record) {
                    warn!(message_id = %record.message_id, error = %e, "failed to persist pending send");
                }
            }
        }

        if let Err(e) = pipeline.finish(&record).await {
            warn!(message_id = %record.message_id, error = %e, "failed to record sent message");
        }
        true
    }
}

/// One attempt at handing block `index` to the provider.
async fn send_block(
    pipeline: &AccountPipeline,
    recipient: &Recipient,
    record: &PendingSendRecord,
    index: u32,
) -> Result<()> {
    let shared = &pipeline.shared;
    let block = record.blocks.get(index as usize).ok_or_else(|| {
        BlockError::Malformed(format!("block {index} of {} missing", record.blocks.len()))
    })?;

    let outbound = {
        let topology = shared.consensus.snapshot();
        let forward = shared.selector.select(&topology, &recipient.provider)?;
        let terminal_routes_surbs = forward
            .terminal()
            .is_some_and(|hop| hop.node.flags.supports_surb);
        let reverse = if terminal_routes_surbs {
            match shared.selector.select_reply(&topology, &pipeline.account.provider) {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!(message_id = %record.message_id, error = %e, "no reply path, sending without acknowledgement");
                    None
                }
            }
        } else {
            None
        };
        codec::build(
            &forward,
            recipient.account,
            block,
            reverse.as_ref().map(|path| ReplyRoute {
                reverse_path: path,
                owner: pipeline.account.id,
            }),
        )?
    };
    if let Some(keys) = outbound.surb_keys {
        pipeline.surbs.insert(keys, record.message_id, index);
    }

    let command = ProviderCommand::SendPacket {
        first_hop: outbound.first_hop,
        packet: outbound.packet.into_bytes(),
    };
    // Connecting and the exchange share one deadline per attempt.
    let deadline = Instant::now() + shared.config.send_timeout;
    let session = timeout_at(deadline, shared.pool.get_session(&pipeline.account))
        .await
        .map_err(|_| EngineError::Timeout)??;
    let reply = match timeout_at(deadline, session.exchange(&command)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            if e.breaks_session() {
                shared.pool.invalidate(&session).await;
            }
            return Err(e);
        }
        Err(_) => {
            shared.pool.invalidate(&session).await;
            return Err(EngineError::Timeout);
        }
    };

    match reply {
        ProviderReply::Ok => Ok(()),
        ProviderReply::Error { reason } => Err(EngineError::Rejected(reason)),
        other => Err(TransportError::ProtocolViolation(format!(
            "unexpected reply to send: {other:?}"
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        for attempt in 1..=10u32 {
            let ceiling = (base * 2u32.pow(attempt - 1)).min(max);
            for _ in 0..50 {
                let delay = backoff_delay(attempt, base, max, &mut rng);
                assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_backoff_saturates() {
        let mut rng = StdRng::seed_from_u64(1);
        let max = Duration::from_secs(30);
        let delay = backoff_delay(u32::MAX, Duration::from_secs(1), max, &mut rng);
        assert!(delay <= max);
    }

    #[test]
    fn test_backoff_zero_base() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            backoff_delay(3, Duration::ZERO, Duration::from_secs(1), &mut rng),
            Duration::ZERO
        );
    }
}

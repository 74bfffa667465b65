//! Reassembly buffer for inbound blocks.
//!
//! Each block is authenticated on arrival; a block that fails is discarded
//! and does not disturb the partial message it claims to belong to. Partial
//! messages are keyed by message id together with the per-message ephemeral
//! key, so a sender reusing someone else's message id starts a separate
//! message instead of locking out the original. Partial sets are dropped
//! once they are older than the configured expiry.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use mixclient_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use mixclient_types::MessageId;
use tracing::debug;

use crate::block::{self, Block, DecryptedMessage};
use crate::{BlockError, Result};

/// Default lifetime of an incomplete message.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(3600);

/// Message id plus the ephemeral key every block of the message carries.
type MessageKey = (MessageId, [u8; 32]);

fn message_key(block: &Block) -> MessageKey {
    (block.message_id, block.ephemeral_key)
}

struct Partial {
    total: u32,
    sender: X25519PublicKey,
    chunks: BTreeMap<u32, Vec<u8>>,
    first_seen: Instant,
}

/// Result of feeding one block to the [`Reassembler`].
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// More blocks are needed.
    Pending {
        message_id: MessageId,
        have: usize,
        total: usize,
    },
    /// The last missing block arrived.
    Complete(DecryptedMessage),
    /// Block already held, or its message was already completed.
    Duplicate,
}

/// Holds partial messages for one recipient identity.
pub struct Reassembler {
    identity: X25519StaticSecret,
    expiry: Duration,
    partial: HashMap<MessageKey, Partial>,
    completed: HashMap<MessageKey, Instant>,
}

impl Reassembler {
    pub fn new(identity: X25519StaticSecret, expiry: Duration) -> Self {
        Self {
            identity,
            expiry,
            partial: HashMap::new(),
            completed: HashMap::new(),
        }
    }

    /// Add a block received now.
    ///
    /// # Errors
    ///
    /// See [`Reassembler::insert_at`].
    pub fn insert(&mut self, block: &Block) -> Result<InsertOutcome> {
        self.insert_at(block, Instant::now())
    }

    /// Add a block received at `now`.
    ///
    /// # Errors
    ///
    /// - [`BlockError::AuthenticationFailed`] if the block does not
    ///   authenticate, or names a different sender than earlier blocks of
    ///   the same message
    /// - [`BlockError::MixedMessages`] if the block disagrees with earlier
    ///   blocks on the total count
    pub fn insert_at(&mut self, block: &Block, now: Instant) -> Result<InsertOutcome> {
        self.expire(now);
        let key = message_key(block);
        if self.completed.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }

        let opened = block::open(block, &self.identity)?;
        let partial = self.partial.entry(key).or_insert_with(|| Partial {
            total: opened.total,
            sender: opened.sender,
            chunks: BTreeMap::new(),
            first_seen: now,
        });
        if partial.sender != opened.sender {
            return Err(BlockError::AuthenticationFailed);
        }
        if partial.total != opened.total {
            return Err(BlockError::MixedMessages);
        }
        if partial.chunks.contains_key(&opened.sequence) {
            return Ok(InsertOutcome::Duplicate);
        }
        partial.chunks.insert(opened.sequence, opened.data);

        let have = partial.chunks.len();
        let total = partial.total as usize;
        if have < total {
            return Ok(InsertOutcome::Pending {
                message_id: opened.message_id,
                have,
                total,
            });
        }

        match self.partial.remove(&key) {
            Some(done) => {
                self.completed.insert(key, now);
                debug!(message_id = %opened.message_id, blocks = total, "message reassembled");
                Ok(InsertOutcome::Complete(block::join(
                    opened.message_id,
                    done.sender,
                    done.chunks,
                )))
            }
            None => Err(BlockError::IncompleteMessage { have, total }),
        }
    }

    /// Progress of the partial message `block` belongs to, as `(have, total)`.
    pub fn progress(&self, block: &Block) -> Option<(usize, usize)> {
        self.partial
            .get(&message_key(block))
            .map(|p| (p.chunks.len(), p.total as usize))
    }

    /// Drop partial messages (and completion markers) older than the expiry.
    /// Returns the number of partial messages discarded.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expiry = self.expiry;
        let before = self.partial.len();
        self.partial
            .retain(|_, p| now.saturating_duration_since(p.first_seen) < expiry);
        self.completed
            .retain(|_, at| now.saturating_duration_since(*at) < expiry);
        let dropped = before - self.partial.len();
        if dropped > 0 {
            debug!(dropped, "expired incomplete messages");
        }
        dropped
    }

    /// Number of incomplete messages held.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

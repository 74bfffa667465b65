//! Single-use reply blocks.
//!
//! A SURB is a pre-built Sphinx header for a reverse path that ends at the
//! issuer's provider, plus a one-off reply key. Whoever holds it can send
//! one reply without learning the issuer's route. Every hop on the reverse
//! path, the terminal provider included, adds a keystream layer; the issuer
//! strips them with the keys it kept in [`SurbKeys`].
//!
//! ## Wire format
//!
//! ```text
//! [first_hop:32][header:408][reply_key:32] = 472 bytes
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mixclient_crypto::blake3::{self as mb3, contexts};
use mixclient_crypto::chacha20;
use mixclient_types::{
    AccountId, MessageId, NodeId, Path, SurbId, HEADER_SIZE, PAYLOAD_PLAINTEXT_SIZE,
    PAYLOAD_SIZE, SURB_SIZE,
};
use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;

use crate::sphinx::{build_header, BuiltHeader, RoutingCommand, SphinxPacket};
use crate::{Result, TransportError};

/// Reply block handed to the recipient inside the forward payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Surb {
    pub first_hop: NodeId,
    header: Vec<u8>,
    reply_key: [u8; 32],
}

impl std::fmt::Debug for Surb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surb")
            .field("first_hop", &self.first_hop)
            .finish_non_exhaustive()
    }
}

/// Sender-side secrets needed to read a reply sent through a [`Surb`].
#[derive(Clone)]
pub struct SurbKeys {
    pub id: SurbId,
    payload_keys: Vec<[u8; 32]>,
    reply_key: [u8; 32],
    created_at: Instant,
}

impl std::fmt::Debug for SurbKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurbKeys")
            .field("id", &self.id)
            .field("hops", &self.payload_keys.len())
            .finish_non_exhaustive()
    }
}

/// Build a SURB over `reverse_path`, delivering replies to `owner`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidPath`] for an empty or over-long path.
pub fn build_surb(reverse_path: &Path, owner: AccountId) -> Result<(Surb, SurbKeys)> {
    let id = SurbId::random();
    let hops = crate::codec::route(reverse_path, |delay_ms| {
        RoutingCommand::DeliverSurbReply {
            recipient: owner,
            surb_id: id,
            delay_ms,
        }
    })?;
    let first_hop = reverse_path
        .first()
        .map(|h| h.node.node_id())
        .ok_or_else(|| TransportError::InvalidPath("path has no hops".to_string()))?;
    let BuiltHeader { header, keys } = build_header(&hops)?;

    let mut reply_key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut reply_key);

    let surb = Surb {
        first_hop,
        header,
        reply_key,
    };
    let keys = SurbKeys {
        id,
        payload_keys: keys.iter().map(|k| k.payload).collect(),
        reply_key,
        created_at: Instant::now(),
    };
    Ok((surb, keys))
}

fn reply_nonce(reply_key: &[u8; 32]) -> [u8; 12] {
    mb3::derive_nonce(contexts::SURB_REPLY_NONCE, reply_key)
}

impl Surb {
    /// Encode to the fixed [`SURB_SIZE`] wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SURB_SIZE);
        out.extend_from_slice(self.first_hop.as_bytes());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.reply_key);
        out
    }

    /// Decode from the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidPacket`] if `data` is not [`SURB_SIZE`] bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != SURB_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "SURB is {} bytes, expected {SURB_SIZE}",
                data.len()
            )));
        }
        let mut first_hop = [0u8; 32];
        first_hop.copy_from_slice(&data[..32]);
        let mut reply_key = [0u8; 32];
        reply_key.copy_from_slice(&data[32 + HEADER_SIZE..]);
        Ok(Self {
            first_hop: NodeId(first_hop),
            header: data[32..32 + HEADER_SIZE].to_vec(),
            reply_key,
        })
    }

    /// Build the reply packet carrying `message` (zero padded).
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidPacket`] if `message` does not fit
    /// - [`TransportError::Crypto`] if encryption fails
    pub fn reply(&self, message: &[u8]) -> Result<SphinxPacket> {
        if message.len() > PAYLOAD_PLAINTEXT_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "reply too large: {} bytes, max {PAYLOAD_PLAINTEXT_SIZE}",
                message.len()
            )));
        }
        let mut padded = vec![0u8; PAYLOAD_PLAINTEXT_SIZE];
        padded[..message.len()].copy_from_slice(message);
        let body = chacha20::encrypt(&self.reply_key, &reply_nonce(&self.reply_key), &padded, &[])
            .map_err(|e| TransportError::Crypto(e.to_string()))?;
        Ok(SphinxPacket::from_parts(&self.header, &body))
    }
}

impl SurbKeys {
    /// Remove every hop layer and authenticate the reply.
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidPacket`] if the payload has the wrong size
    /// - [`TransportError::Crypto`] if the reply does not authenticate
    pub fn decrypt_reply(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() != PAYLOAD_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "reply payload is {} bytes, expected {PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        let mut body = payload.to_vec();
        for key in &self.payload_keys {
            mb3::apply_keystream(key, &mut body);
        }
        chacha20::decrypt(&self.reply_key, &reply_nonce(&self.reply_key), &body, &[])
            .map_err(|e| TransportError::Crypto(e.to_string()))
    }

    /// Time since the SURB was built.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// What a stored SURB acknowledges.
#[derive(Clone, Debug)]
pub struct SurbEntry {
    pub keys: SurbKeys,
    pub message_id: MessageId,
    pub block: u32,
}

#[derive(Default)]
struct TableState {
    live: HashMap<SurbId, SurbEntry>,
    consumed: HashMap<SurbId, Instant>,
}

/// Mutex-guarded map of issued SURBs, keyed by id.
///
/// An entry is removed on first use; a second reply with the same id is
/// rejected with [`TransportError::SurbReused`] until the id ages out.
#[derive(Default)]
pub struct SurbKeyTable {
    state: Mutex<TableState>,
}

impl SurbKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the keys of a freshly issued SURB.
    pub fn insert(&self, keys: SurbKeys, message_id: MessageId, block: u32) {
        let id = keys.id;
        self.state.lock().live.insert(
            id,
            SurbEntry {
                keys,
                message_id,
                block,
            },
        );
    }

    /// Consume the entry for `id`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::SurbReused`] if the id was already consumed
    /// - [`TransportError::UnknownSurb`] if the id was never issued or expired
    pub fn take(&self, id: &SurbId) -> Result<SurbEntry> {
        let mut state = self.state.lock();
        if let Some(entry) = state.live.remove(id) {
            state.consumed.insert(*id, Instant::now());
            return Ok(entry);
        }
        if state.consumed.contains_key(id) {
            return Err(TransportError::SurbReused(*id));
        }
        Err(TransportError::UnknownSurb(*id))
    }

    /// Drop every unanswered SURB for `message_id` once the message is
    /// delivered or abandoned. Returns how many were dropped.
    pub fn forget_message(&self, message_id: &MessageId) -> usize {
        let mut state = self.state.lock();
        let before = state.live.len();
        state.live.retain(|_, e| e.message_id != *message_id);
        before - state.live.len()
    }

    /// Drop live and consumed entries older than `max_age`.
    pub fn expire(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.live.len();
        state.live.retain(|_, e| e.keys.age() < max_age);
        state.consumed.retain(|_, at| at.elapsed() < max_age);
        let removed = before - state.live.len();
        if removed > 0 {
            debug!(removed, "expired unanswered SURBs");
        }
        removed
    }

    /// Number of SURBs awaiting a reply.
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

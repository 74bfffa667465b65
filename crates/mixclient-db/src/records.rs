//! Typed records kept in a [`MessageStore`], serialized as JSON.

use mixclient_types::{AccountId, MessageId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::store::MessageStore;
use crate::{DbError, Result};

pub const PENDING_PREFIX: &str = "pending/";
pub const SENT_PREFIX: &str = "sent/";
pub const FAILED_PREFIX: &str = "failed/";
pub const INBOX_PREFIX: &str = "inbox/";
pub const FRAGMENT_PREFIX: &str = "fragment/";

pub fn pending_key(id: &MessageId) -> String {
    format!("{PENDING_PREFIX}{id}")
}

pub fn sent_key(id: &MessageId) -> String {
    format!("{SENT_PREFIX}{id}")
}

pub fn failed_key(id: &MessageId) -> String {
    format!("{FAILED_PREFIX}{id}")
}

pub fn inbox_key(id: &MessageId) -> String {
    format!("{INBOX_PREFIX}{id}")
}

/// Prefix shared by every stored fragment of one message.
pub fn fragment_prefix(id: &MessageId) -> String {
    format!("{FRAGMENT_PREFIX}{id}/")
}

/// Sequence numbers are zero padded so keys sort numerically.
pub fn fragment_key(id: &MessageId, sequence: u32) -> String {
    format!("{FRAGMENT_PREFIX}{id}/{sequence:08}")
}

/// An outbound message not yet fully handed to the provider.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSendRecord {
    pub message_id: MessageId,
    /// Recipient address, `name@provider`.
    pub recipient: String,
    /// Encoded blocks, one per packet.
    #[serde_as(as = "Vec<Hex>")]
    pub blocks: Vec<Vec<u8>>,
    /// Index of the first block not yet accepted by the provider.
    pub next_block: u32,
    /// Failed attempts for the current block.
    pub attempts: u32,
    pub created_at: u64,
    pub last_attempt_at: Option<u64>,
}

impl PendingSendRecord {
    pub fn is_complete(&self) -> bool {
        self.next_block as usize >= self.blocks.len()
    }
}

/// A message whose blocks were all accepted by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    pub message_id: MessageId,
    pub recipient: String,
    pub blocks: u32,
    pub sent_at: u64,
    /// Block indices confirmed end to end by a SURB acknowledgement.
    pub acknowledged: Vec<u32>,
}

impl SentRecord {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.len() as u32 >= self.blocks
    }
}

/// Terminal failure after retries were exhausted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub message_id: MessageId,
    pub recipient: String,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: u64,
}

/// A reassembled inbound message.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub message_id: MessageId,
    /// Sender X25519 identity key.
    #[serde_as(as = "Hex")]
    pub sender: [u8; 32],
    #[serde_as(as = "Hex")]
    pub plaintext: Vec<u8>,
    pub received_at: u64,
}

/// An authenticated block of a message still being reassembled.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRecord {
    #[serde_as(as = "Hex")]
    pub block: Vec<u8>,
    pub received_at: u64,
}

/// Serialize `record` as JSON under `key`.
pub fn put_json<S, T>(
    store: &S,
    account: &AccountId,
    key: &str,
    record: &T,
) -> Result<()>
where
    S: MessageStore + ?Sized,
    T: Serialize,
{
    let bytes = serde_json::to_vec(record).map_err(|e| DbError::Serialization(e.to_string()))?;
    store.put(account, key, &bytes)
}

/// Fetch and decode the JSON record under `key`.
pub fn get_json<S, T>(store: &S, account: &AccountId, key: &str) -> Result<Option<T>>
where
    S: MessageStore + ?Sized,
    T: DeserializeOwned,
{
    store
        .get(account, key)?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(|e| DbError::Serialization(e.to_string())))
        .transpose()
}

/// Decode every JSON record under `prefix`.
pub fn list_json<S, T>(
    store: &S,
    account: &AccountId,
    prefix: &str,
) -> Result<Vec<(String, T)>>
where
    S: MessageStore + ?Sized,
    T: DeserializeOwned,
{
    store
        .list(account, prefix)?
        .into_iter()
        .map(|(key, bytes)| {
            serde_json::from_slice(&bytes)
                .map(|record| (key, record))
                .map_err(|e| DbError::Serialization(e.to_string()))
        })
        .collect()
}

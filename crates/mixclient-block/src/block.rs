//! Block format, fragmentation and decryption.
//!
//! ## Wire format
//!
//! ```text
//! [message_id:16][sequence:4 BE][total:4 BE][ephemeral_pk:32][sealed_sender:48][ciphertext:2066]
//! ```
//!
//! ## Key schedule
//!
//! ```text
//! es            = X25519(e, R)
//! ss            = X25519(S, R)
//! k_sender      = BLAKE3::derive_key("mixclient v1 block-sender-key", es || e_pub || R_pub)
//! sealed_sender = ChaCha20-Poly1305(k_sender, nonce(k_sender), S_pub, aad = message_id || e_pub)
//! k_block       = BLAKE3::derive_key("mixclient v1 block-key", es || ss || e_pub || S_pub || R_pub)
//! nonce_i       = BLAKE3::derive_key("mixclient v1 block-nonce", k_block || seq_i)[..12]
//! ciphertext_i  = ChaCha20-Poly1305(k_block, nonce_i, [len:2 BE][chunk][pad],
//!                                   aad = message_id || seq_i || total || e_pub)
//! ```
//!
//! One ephemeral key `e` is generated per message. Since `ss` needs the
//! sender's static secret, a block that authenticates under `k_block`
//! proves the sender revealed by `sealed_sender`.

use std::collections::BTreeMap;

use mixclient_crypto::blake3::{self, contexts};
use mixclient_crypto::chacha20;
use mixclient_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use mixclient_types::{
    MessageId, BLOCK_DATA_SIZE, BLOCK_SIZE, MAX_MESSAGE_BLOCKS, MAX_MESSAGE_SIZE, TAG_SIZE,
};
use tracing::debug;

use crate::{BlockError, Result};

/// Sealed sender public key: key plus AEAD tag.
pub const SEALED_SENDER_SIZE: usize = 32 + TAG_SIZE;

/// Chunk plaintext: `[len:2 BE][data][zero pad]`.
const CHUNK_SIZE: usize = 2 + BLOCK_DATA_SIZE;

/// Encrypted chunk with tag.
pub const CIPHERTEXT_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

const OFF_SEQUENCE: usize = 16;
const OFF_TOTAL: usize = 20;
const OFF_EPHEMERAL: usize = 24;
const OFF_SEALED: usize = 56;
const OFF_CIPHERTEXT: usize = OFF_SEALED + SEALED_SENDER_SIZE;

/// One encrypted fragment of an end-to-end message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Shared by every block of the message.
    pub message_id: MessageId,
    /// Zero-based position within the message.
    pub sequence: u32,
    /// Number of blocks in the message.
    pub total: u32,
    /// Per-message ephemeral X25519 public key.
    pub ephemeral_key: [u8; 32],
    /// Sender static public key sealed to the recipient.
    pub sealed_sender: [u8; SEALED_SENDER_SIZE],
    /// Encrypted chunk, exactly [`CIPHERTEXT_SIZE`] bytes.
    pub ciphertext: Vec<u8>,
}

impl Block {
    /// Encode to exactly [`BLOCK_SIZE`] bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_SIZE);
        out.extend_from_slice(self.message_id.as_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&self.ephemeral_key);
        out.extend_from_slice(&self.sealed_sender);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode a block.
    ///
    /// Trailing zero padding beyond [`BLOCK_SIZE`] (as carried in a Sphinx
    /// payload) is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::Malformed`] if the input is too short or the
    /// sequence fields are out of range.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_SIZE {
            return Err(BlockError::Malformed(format!(
                "block is {} bytes, expected {BLOCK_SIZE}",
                data.len()
            )));
        }
        let message_id = MessageId::from_slice(&data[..OFF_SEQUENCE])
            .map_err(|e| BlockError::Malformed(e.to_string()))?;
        let sequence = read_u32(&data[OFF_SEQUENCE..OFF_TOTAL]);
        let total = read_u32(&data[OFF_TOTAL..OFF_EPHEMERAL]);
        if total == 0 || total as usize > MAX_MESSAGE_BLOCKS || sequence >= total {
            return Err(BlockError::Malformed(format!(
                "sequence {sequence} of {total} out of range"
            )));
        }

        let mut ephemeral_key = [0u8; 32];
        ephemeral_key.copy_from_slice(&data[OFF_EPHEMERAL..OFF_SEALED]);
        let mut sealed_sender = [0u8; SEALED_SENDER_SIZE];
        sealed_sender.copy_from_slice(&data[OFF_SEALED..OFF_CIPHERTEXT]);

        Ok(Self {
            message_id,
            sequence,
            total,
            ephemeral_key,
            sealed_sender,
            ciphertext: data[OFF_CIPHERTEXT..BLOCK_SIZE].to_vec(),
        })
    }

    fn aad(&self) -> Vec<u8> {
        block_aad(&self.message_id, self.sequence, self.total, &self.ephemeral_key)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn sender_aad(message_id: &MessageId, ephemeral_key: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 32);
    aad.extend_from_slice(message_id.as_bytes());
    aad.extend_from_slice(ephemeral_key);
    aad
}

fn block_aad(message_id: &MessageId, sequence: u32, total: u32, ephemeral_key: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 4 + 4 + 32);
    aad.extend_from_slice(message_id.as_bytes());
    aad.extend_from_slice(&sequence.to_be_bytes());
    aad.extend_from_slice(&total.to_be_bytes());
    aad.extend_from_slice(ephemeral_key);
    aad
}

fn block_nonce(k_block: &[u8; 32], sequence: u32) -> [u8; 12] {
    let mut material = Vec::with_capacity(32 + 4);
    material.extend_from_slice(k_block);
    material.extend_from_slice(&sequence.to_be_bytes());
    blake3::derive_nonce(contexts::BLOCK_NONCE, &material)
}

fn sender_key(es: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    blake3::derive_key_multi(
        contexts::BLOCK_SENDER_KEY,
        &[es.as_slice(), ephemeral.as_slice(), recipient.as_slice()],
    )
}

fn block_key(
    es: &[u8; 32],
    ss: &[u8; 32],
    ephemeral: &[u8; 32],
    sender: &[u8; 32],
    recipient: &[u8; 32],
) -> [u8; 32] {
    blake3::derive_key_multi(
        contexts::BLOCK_KEY,
        &[
            es.as_slice(),
            ss.as_slice(),
            ephemeral.as_slice(),
            sender.as_slice(),
            recipient.as_slice(),
        ],
    )
}

/// Split `plaintext` into blocks sealed to `recipient` from `sender`.
///
/// An empty plaintext yields a single empty block.
///
/// # Errors
///
/// - [`BlockError::MessageTooLarge`] above [`MAX_MESSAGE_SIZE`]
/// - [`BlockError::Crypto`] if key agreement with `recipient` is degenerate
pub fn fragment(
    plaintext: &[u8],
    recipient: &X25519PublicKey,
    sender: &X25519StaticSecret,
) -> Result<Vec<Block>> {
    fragment_with_id(MessageId::random(), plaintext, recipient, sender)
}

/// [`fragment`] under a caller-chosen message identifier.
///
/// # Errors
///
/// See [`fragment`].
pub fn fragment_with_id(
    message_id: MessageId,
    plaintext: &[u8],
    recipient: &X25519PublicKey,
    sender: &X25519StaticSecret,
) -> Result<Vec<Block>> {
    if plaintext.len() > MAX_MESSAGE_SIZE {
        return Err(BlockError::MessageTooLarge {
            size: plaintext.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let ephemeral = X25519StaticSecret::random();
    let ephemeral_key = ephemeral.public_key().to_bytes();
    let sender_public = sender.public_key();
    let es = ephemeral.diffie_hellman(recipient)?;
    let ss = sender.diffie_hellman(recipient)?;

    let k_sender = sender_key(es.as_bytes(), &ephemeral_key, recipient.as_bytes());
    let sealed = chacha20::encrypt(
        &k_sender,
        &blake3::derive_nonce(contexts::BLOCK_SENDER_NONCE, &k_sender),
        sender_public.as_bytes(),
        &sender_aad(&message_id, &ephemeral_key),
    )?;
    let sealed_sender: [u8; SEALED_SENDER_SIZE] = sealed
        .as_slice()
        .try_into()
        .map_err(|_| BlockError::Malformed("sealed sender size".to_string()))?;

    let k_block = block_key(
        es.as_bytes(),
        ss.as_bytes(),
        &ephemeral_key,
        sender_public.as_bytes(),
        recipient.as_bytes(),
    );

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(BLOCK_DATA_SIZE).collect()
    };
    let total = chunks.len() as u32;

    let mut blocks = Vec::with_capacity(chunks.len());
    for (i, data) in chunks.into_iter().enumerate() {
        let sequence = i as u32;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        chunk[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
        chunk[2..2 + data.len()].copy_from_slice(data);

        let ciphertext = chacha20::encrypt(
            &k_block,
            &block_nonce(&k_block, sequence),
            &chunk,
            &block_aad(&message_id, sequence, total, &ephemeral_key),
        )?;
        blocks.push(Block {
            message_id,
            sequence,
            total,
            ephemeral_key,
            sealed_sender,
            ciphertext,
        });
    }

    debug!(message_id = %message_id, blocks = total, "message fragmented");
    Ok(blocks)
}

/// A single block after decryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenedBlock {
    pub message_id: MessageId,
    pub sequence: u32,
    pub total: u32,
    /// Authenticated sender static key.
    pub sender: X25519PublicKey,
    /// Chunk data with padding removed.
    pub data: Vec<u8>,
}

/// Authenticate and decrypt one block.
///
/// # Errors
///
/// - [`BlockError::AuthenticationFailed`] if the sealed sender or the chunk
///   does not authenticate under `recipient`
/// - [`BlockError::Malformed`] if the authenticated chunk length is invalid
pub fn open(block: &Block, recipient: &X25519StaticSecret) -> Result<OpenedBlock> {
    if block.ciphertext.len() != CIPHERTEXT_SIZE {
        return Err(BlockError::Malformed(format!(
            "ciphertext is {} bytes, expected {CIPHERTEXT_SIZE}",
            block.ciphertext.len()
        )));
    }
    let recipient_public = recipient.public_key();
    let es = recipient
        .diffie_hellman(&X25519PublicKey::from_bytes(block.ephemeral_key))
        .map_err(|_| BlockError::AuthenticationFailed)?;

    let k_sender = sender_key(es.as_bytes(), &block.ephemeral_key, recipient_public.as_bytes());
    let sender_bytes = chacha20::decrypt(
        &k_sender,
        &blake3::derive_nonce(contexts::BLOCK_SENDER_NONCE, &k_sender),
        &block.sealed_sender,
        &sender_aad(&block.message_id, &block.ephemeral_key),
    )
    .map_err(|_| BlockError::AuthenticationFailed)?;
    let sender_key_bytes: [u8; 32] = sender_bytes
        .as_slice()
        .try_into()
        .map_err(|_| BlockError::AuthenticationFailed)?;
    let sender = X25519PublicKey::from_bytes(sender_key_bytes);

    let ss = recipient
        .diffie_hellman(&sender)
        .map_err(|_| BlockError::AuthenticationFailed)?;
    let k_block = block_key(
        es.as_bytes(),
        ss.as_bytes(),
        &block.ephemeral_key,
        sender.as_bytes(),
        recipient_public.as_bytes(),
    );
    let chunk = chacha20::decrypt(
        &k_block,
        &block_nonce(&k_block, block.sequence),
        &block.ciphertext,
        &block.aad(),
    )
    .map_err(|_| BlockError::AuthenticationFailed)?;

    let len = usize::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    if len > BLOCK_DATA_SIZE {
        return Err(BlockError::Malformed(format!("chunk length {len}")));
    }

    Ok(OpenedBlock {
        message_id: block.message_id,
        sequence: block.sequence,
        total: block.total,
        sender,
        data: chunk[2..2 + len].to_vec(),
    })
}

/// A fully reassembled message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub message_id: MessageId,
    pub sender: X25519PublicKey,
    pub plaintext: Vec<u8>,
}

/// Join decrypted chunks in sequence order.
pub(crate) fn join(message_id: MessageId, sender: X25519PublicKey, chunks: BTreeMap<u32, Vec<u8>>) -> DecryptedMessage {
    let plaintext = chunks.into_values().flatten().collect();
    DecryptedMessage {
        message_id,
        sender,
        plaintext,
    }
}

/// Decrypt a complete set of blocks, in any order.
///
/// Duplicate blocks are ignored.
///
/// # Errors
///
/// - [`BlockError::IncompleteMessage`] while any sequence number is missing
/// - [`BlockError::MixedMessages`] if the blocks disagree on message id or total
/// - [`BlockError::AuthenticationFailed`] if any block fails authentication
pub fn decrypt(blocks: &[Block], recipient: &X25519StaticSecret) -> Result<DecryptedMessage> {
    let first = blocks
        .first()
        .ok_or_else(|| BlockError::Malformed("no blocks".to_string()))?;
    if blocks
        .iter()
        .any(|b| b.message_id != first.message_id || b.total != first.total)
    {
        return Err(BlockError::MixedMessages);
    }

    let unique: BTreeMap<u32, &Block> = blocks.iter().map(|b| (b.sequence, b)).collect();
    let total = first.total as usize;
    if unique.len() < total {
        return Err(BlockError::IncompleteMessage {
            have: unique.len(),
            total,
        });
    }

    let mut sender = None;
    let mut chunks = BTreeMap::new();
    for (sequence, block) in unique {
        let opened = open(block, recipient)?;
        match sender {
            None => sender = Some(opened.sender),
            Some(s) if s != opened.sender => return Err(BlockError::AuthenticationFailed),
            Some(_) => {}
        }
        chunks.insert(sequence, opened.data);
    }
    let sender = sender.ok_or(BlockError::IncompleteMessage { have: 0, total })?;
    Ok(join(first.message_id, sender, chunks))
}

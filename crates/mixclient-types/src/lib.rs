//! # mixclient-types
//!
//! Shared domain types used across the mixclient workspace: identifiers,
//! node descriptors, consensus snapshots, paths and the fixed packet
//! geometry that every layer agrees on.

pub mod ids;
pub mod node;
pub mod path;

pub use ids::{AccountId, MessageId, NodeId, SurbId};
pub use node::{ConsensusSnapshot, NodeDescriptor, NodeFlags};
pub use path::{Hop, Path};

/// Maximum number of hops in a path, terminal provider included.
pub const MAX_HOPS: usize = 5;

/// Size of the per-hop routing command inside the Sphinx header.
///
/// Layout: `[command:1][address:32][delay_ms:4 BE][next_mac:16][surb_id:16][reserved:3]`
pub const ROUTING_INFO_SIZE: usize = 72;

/// Size of the Sphinx group element (X25519 public key).
pub const GROUP_ELEMENT_SIZE: usize = 32;

/// Size of the truncated header MAC.
pub const MAC_SIZE: usize = 16;

/// Encrypted routing section of the header (`beta`).
pub const ROUTING_SIZE: usize = MAX_HOPS * ROUTING_INFO_SIZE;

/// Full Sphinx header: `[alpha:32][beta:360][gamma:16]`.
pub const HEADER_SIZE: usize = GROUP_ELEMENT_SIZE + ROUTING_SIZE + MAC_SIZE;

/// AEAD authentication tag size (ChaCha20-Poly1305).
pub const TAG_SIZE: usize = 16;

/// Plaintext bytes carried by a single block.
pub const BLOCK_DATA_SIZE: usize = 2048;

/// Maximum number of blocks a single message may be split into.
pub const MAX_MESSAGE_BLOCKS: usize = 64;

/// Maximum plaintext message size accepted for fragmentation.
pub const MAX_MESSAGE_SIZE: usize = BLOCK_DATA_SIZE * MAX_MESSAGE_BLOCKS;

/// Encoded block size.
///
/// `[message_id:16][sequence:4][total:4][ephemeral_pk:32][sealed_sender:48][ciphertext:2+2048+16]`
pub const BLOCK_SIZE: usize = 16 + 4 + 4 + 32 + (32 + TAG_SIZE) + (2 + BLOCK_DATA_SIZE + TAG_SIZE);

/// Encoded single-use reply block: `[first_hop:32][header:408][reply_key:32]`.
pub const SURB_SIZE: usize = 32 + HEADER_SIZE + 32;

/// Plaintext size of a Sphinx payload: `[flags:1][reserved:1][surb][body]`.
pub const PAYLOAD_PLAINTEXT_SIZE: usize = 2 + SURB_SIZE + BLOCK_SIZE;

/// Encrypted Sphinx payload size (plaintext plus the terminal AEAD tag).
pub const PAYLOAD_SIZE: usize = PAYLOAD_PLAINTEXT_SIZE + TAG_SIZE;

/// Total Sphinx packet size. Constant for every path length and message size.
pub const PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Errors raised when parsing shared types.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Decoded value has the wrong length.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Malformed account address.
    #[error("invalid account address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, TypesError>;

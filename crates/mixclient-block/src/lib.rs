//! # mixclient-block
//!
//! End-to-end message encryption for the mixnet client.
//!
//! A plaintext message is split into fixed-size blocks, each sealed to the
//! recipient's X25519 identity key. The sender's static key is bound into
//! every block, so the recipient learns who sent the message without a
//! separate signature.
//!
//! ## Modules
//!
//! - [`block`] - block format, `fragment` and `decrypt`
//! - [`reassembly`] - buffer holding partial messages until complete or expired

pub mod block;
pub mod reassembly;

pub use block::{decrypt, fragment, fragment_with_id, open, Block, DecryptedMessage, OpenedBlock};
pub use reassembly::{InsertOutcome, Reassembler, DEFAULT_EXPIRY};

use mixclient_crypto::CryptoError;

/// Error types for block operations.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// Plaintext needs more than the maximum number of blocks.
    #[error("message too large: {size} bytes, max {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Not every fragment of the message is present yet.
    #[error("incomplete message: {have} of {total} blocks")]
    IncompleteMessage { have: usize, total: usize },

    /// A block failed authentication and was discarded.
    #[error("block authentication failed")]
    AuthenticationFailed,

    /// Block bytes do not follow the block format.
    #[error("malformed block: {0}")]
    Malformed(String),

    /// Blocks from different messages were passed together.
    #[error("blocks belong to different messages")]
    MixedMessages,

    /// Key agreement or encryption failed on the sending side.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Convenience result type for block operations.
pub type Result<T> = std::result::Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BlockError::IncompleteMessage { have: 4, total: 5 };
        assert_eq!(err.to_string(), "incomplete message: 4 of 5 blocks");
        let err = BlockError::MessageTooLarge {
            size: 200_000,
            max: 131_072,
        };
        assert_eq!(err.to_string(), "message too large: 200000 bytes, max 131072");
    }
}

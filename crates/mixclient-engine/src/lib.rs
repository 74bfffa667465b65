//! # mixclient-engine
//!
//! The message delivery engine: one send pipeline and one fetch pipeline per
//! account, sharing a session pool, the consensus cache and the replay
//! filter.
//!
//! ## Modules
//!
//! - [`account`] - account identities and key loading
//! - [`config`] - [`EngineConfig`] with defaults
//! - [`events`] - delivery and receive notifications over bounded channels
//! - [`session_pool`] - one lazily established provider session per account
//! - `send` - serialized sends with retry and backoff
//! - `fetch` - periodic retrieval, dedupe, reassembly and acknowledgement
//! - [`engine`] - the [`Engine`] facade
//!
//! ## Pipeline
//!
//! ```text
//! submit ──> BlockCodec::fragment ──> pending/ record ──> send queue
//!                                                            │
//!              PathSelector ──> PacketCodec::build ──> SessionPool ──> provider
//!
//! provider ──> FetchScheduler ──> ReplayFilter ──> Reassembler ──> inbox/ record ──> received
//!                    └──> SURB reply ──> SurbKeyTable ──> acknowledged
//! ```

pub mod account;
pub mod config;
pub mod engine;
pub mod events;
pub mod session_pool;

mod fetch;
mod pipeline;
mod send;

pub use account::Account;
pub use config::EngineConfig;
pub use engine::{Engine, EngineEvents};
pub use events::{DeliveryEvent, ReceivedMessage};
pub use send::backoff_delay;
pub use session_pool::{ProviderSession, SessionPool};

use mixclient_block::BlockError;
use mixclient_db::DbError;
use mixclient_path::PathError;
use mixclient_replay::ReplayError;
use mixclient_transport::TransportError;
use mixclient_types::MessageId;

/// Error types for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Retries were exhausted; the message will not be sent.
    #[error("message {message_id} failed after {attempts} attempts: {reason}")]
    PermanentFailure {
        message_id: MessageId,
        attempts: u32,
        reason: String,
    },

    /// The account is not configured or was aborted at startup.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// The recipient address is not in the user directory.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    /// The account's identity key could not be loaded.
    #[error("missing identity key for {account}: {reason}")]
    MissingIdentityKey { account: String, reason: String },

    /// The engine is shutting down.
    #[error("engine shutting down")]
    ShuttingDown,

    /// A provider exchange did not complete in time.
    #[error("provider exchange timed out")]
    Timeout,

    /// The provider answered with an error.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("path error: {0}")]
    Path(#[from] PathError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("block error: {0}")]
    Block(#[from] BlockError),

    #[error("storage error: {0}")]
    Db(#[from] DbError),

    #[error("replay filter error: {0}")]
    Replay(#[from] ReplayError),
}

impl EngineError {
    /// Whether the provider session should be dropped after this error.
    pub fn breaks_session(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::PermanentFailure {
            message_id: MessageId([0xAB; 16]),
            attempts: 5,
            reason: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            format!("message {} failed after 5 attempts: timeout", "ab".repeat(16))
        );
    }

    #[test]
    fn test_breaks_session() {
        assert!(EngineError::Timeout.breaks_session());
        assert!(EngineError::Transport(TransportError::Closed).breaks_session());
        assert!(!EngineError::Rejected("full".into()).breaks_session());
        assert!(!EngineError::UnknownAccount("x".into()).breaks_session());
    }
}

//! # mixclient-transport
//!
//! Packet layer and provider link for the mixnet client.
//!
//! - **Sphinx packets** with per-hop blinding, header MACs and replay tags via [`sphinx`]
//! - **Single-use reply blocks** and the sender-side key table via [`surb`]
//! - **Packet codec** tying paths, forward payloads and SURBs together via [`codec`]
//! - **Provider protocol** commands and replies (CBOR) via [`wire`]
//! - **Session traits** consumed by the engine via [`session`]
//! - **QUIC/TLS 1.3** client transport via [`quic`]
//!
//! ## Architecture
//!
//! ```text
//! Engine
//!     |
//!     v
//! ProviderCommand (wire.rs)   -- CBOR frame with version
//!     |
//!     v
//! Session (session.rs)        -- byte-oriented authenticated channel
//!     |
//!     v
//! QuicTransport (quic.rs)     -- QUIC/TLS 1.3 bidirectional stream
//! ```
//!
//! The Sphinx packet travels inside `ProviderCommand::SendPacket`; providers
//! and relays peel it with [`codec::unwrap`].

pub mod codec;
pub mod quic;
pub mod session;
pub mod sphinx;
pub mod surb;
pub mod wire;

use mixclient_types::SurbId;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (version mismatch, oversized frame, unexpected reply).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid or malformed Sphinx packet.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Path cannot carry a packet (empty, too long, misplaced terminal hop).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// MAC verification failed on a Sphinx header.
    #[error("MAC verification failed")]
    MacVerification,

    /// Replay tag already recorded for this epoch.
    #[error("replayed packet")]
    ReplayDetected,

    /// Reply arrived for a SURB this client never issued or already expired.
    #[error("unknown SURB {0:?}")]
    UnknownSurb(SurbId),

    /// Reply arrived for a SURB that was already consumed.
    #[error("SURB {0:?} already used")]
    SurbReused(SurbId),

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// The session was closed by either side.
    #[error("session closed")]
    Closed,
}

impl TransportError {
    /// Whether a packet failing with this error must be dropped without any
    /// signal to the network.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            Self::MacVerification | Self::ReplayDetected | Self::InvalidPacket(_)
        )
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");
        assert_eq!(TransportError::ReplayDetected.to_string(), "replayed packet");
    }

    #[test]
    fn test_silent_drop_classification() {
        assert!(TransportError::MacVerification.is_silent_drop());
        assert!(TransportError::ReplayDetected.is_silent_drop());
        assert!(TransportError::InvalidPacket("short".into()).is_silent_drop());
        assert!(!TransportError::Connection("reset".into()).is_silent_drop());
        assert!(!TransportError::Closed.is_silent_drop());
    }
}

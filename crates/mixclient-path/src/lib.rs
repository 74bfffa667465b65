//! # mixclient-path
//!
//! Topology and route selection for the mixnet client.
//!
//! - [`ordered_map`] - generic ordered map backing the topology index
//! - [`consensus`] - [`ConsensusCache`](consensus::ConsensusCache), the
//!   [`ConsensusSource`](consensus::ConsensusSource) authority interface and
//!   the signed static consensus file
//! - [`selector`] - Poisson-delayed random path selection
//! - [`directory`] - recipient address to identity key and provider lookup
//!
//! ## Key Parameters
//!
//! | Parameter | Default |
//! |---|---|
//! | Relay hops before the provider | 3 |
//! | Poisson rate (per ms) | 0.00025 (mean hop delay 4 s) |
//! | Hop delay cap | 90 s |

pub mod consensus;
pub mod directory;
pub mod ordered_map;
pub mod selector;

/// Default number of relay hops before the terminal provider.
pub const DEFAULT_HOPS: usize = 3;

/// Default Poisson mixing rate, per millisecond.
pub const DEFAULT_LAMBDA: f64 = 0.000_25;

/// Default cap on a single sampled hop delay.
pub const DEFAULT_MAX_DELAY_MS: u32 = 90_000;

/// Error types for topology and path operations.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Not enough eligible relays for the requested hop count.
    #[error("insufficient topology: need {need} relays, have {have}")]
    InsufficientTopology { need: usize, have: usize },

    /// The destination provider is not in the current consensus.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider does not route single-use reply blocks.
    #[error("provider {0} does not support SURBs")]
    SurbUnsupported(String),

    /// A selector parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Snapshot was offered without a verified signature.
    #[error("consensus signature not validated")]
    UnsignedConsensus,

    /// Snapshot is older than the one already cached.
    #[error("stale consensus: cached epoch {current}, offered {offered}")]
    StaleConsensus { current: u64, offered: u64 },

    /// Snapshot content is inconsistent.
    #[error("malformed consensus: {0}")]
    MalformedConsensus(String),

    /// Recipient address missing from the user directory.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Malformed recipient address or identifier.
    #[error("invalid address: {0}")]
    Address(#[from] mixclient_types::TypesError),

    /// I/O error while reading a PKI file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse error in a PKI file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signature or key error.
    #[error("crypto error: {0}")]
    Crypto(#[from] mixclient_crypto::CryptoError),
}

/// Convenience result type for path operations.
pub type Result<T> = std::result::Result<T, PathError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PathError::InsufficientTopology { need: 2, have: 1 };
        assert_eq!(
            err.to_string(),
            "insufficient topology: need 2 relays, have 1"
        );
    }

    #[test]
    fn test_default_mean_delay() {
        assert!((1.0 / DEFAULT_LAMBDA - 4000.0).abs() < f64::EPSILON);
    }
}

//! # mixclient-replay
//!
//! Replay protection for Sphinx packets and inbound provider deliveries.
//!
//! - [`bloom`] - generic approximate membership set
//! - [`ReplayFilter`] - thread-safe, epoch-scoped wrapper used by packet
//!   unwrapping and inbound deduplication
//!
//! ## Lifetime
//!
//! The filter is bound to a consensus epoch. [`ReplayFilter::rotate`] swaps
//! in an empty filter with a fresh SipHash key when the epoch advances;
//! packets built for an older epoch no longer unwrap once node keys rotate,
//! so their tags need not be remembered.

pub mod bloom;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bloom::BloomFilter;

/// Default filter size exponent (`2^22` bits, 512 KiB).
pub const DEFAULT_M_LN2: u32 = 22;

/// Default target false-positive rate at capacity.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 1e-6;

/// Error types for replay filter construction.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Requested bit-array exponent is too large.
    #[error("requested filter too large: 2^{0} bits")]
    FilterTooLarge(u32),

    /// False-positive rate outside `(0, 1)`.
    #[error("invalid false positive rate: {0}")]
    InvalidRate(f64),

    /// Parameters need more hash functions than supported.
    #[error("requested parameters need too many hashes: {0}")]
    TooManyHashes(usize),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

/// Sizing parameters for a [`ReplayFilter`].
#[derive(Clone, Copy, Debug)]
pub struct ReplayConfig {
    /// Filter size exponent, `m = 2^m_ln2` bits.
    pub m_ln2: u32,
    /// Target false-positive rate at capacity.
    pub false_positive_rate: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            m_ln2: DEFAULT_M_LN2,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
        }
    }
}

struct FilterState {
    filter: BloomFilter,
    epoch: u64,
    saturation_reported: bool,
}

/// Epoch-scoped replay filter shared by every account pipeline.
pub struct ReplayFilter {
    config: ReplayConfig,
    state: Mutex<FilterState>,
}

impl ReplayFilter {
    /// Create an empty filter for `epoch`.
    ///
    /// # Errors
    ///
    /// Returns a [`ReplayError`] if the configured parameters are invalid.
    pub fn new(config: ReplayConfig, epoch: u64) -> Result<Self> {
        let filter = BloomFilter::new(config.m_ln2, config.false_positive_rate)?;
        debug!(
            epoch,
            hashes = filter.num_hashes(),
            capacity = filter.max_entries(),
            "replay filter created"
        );
        Ok(Self {
            config,
            state: Mutex::new(FilterState {
                filter,
                epoch,
                saturation_reported: false,
            }),
        })
    }

    /// Record `tag`, returning `true` if it had already been seen.
    ///
    /// A `true` result may be a false positive; a previously recorded tag
    /// always yields `true` within the same epoch.
    pub fn test_and_set(&self, tag: &[u8]) -> bool {
        let mut state = self.state.lock();
        let seen = state.filter.test_and_set(tag);
        if !seen && state.filter.is_saturated() && !state.saturation_reported {
            state.saturation_reported = true;
            warn!(
                epoch = state.epoch,
                entries = state.filter.entries(),
                "replay filter at capacity; false positive rate now exceeds target"
            );
        }
        seen
    }

    /// Whether `tag` has been recorded, without inserting it.
    pub fn contains(&self, tag: &[u8]) -> bool {
        self.state.lock().filter.test(tag)
    }

    /// Reset the filter for a newer epoch. Older or equal epochs are ignored.
    ///
    /// Returns `true` if the filter was reset.
    ///
    /// # Errors
    ///
    /// Returns a [`ReplayError`] if a fresh filter cannot be built.
    pub fn rotate(&self, epoch: u64) -> Result<bool> {
        let fresh = BloomFilter::new(self.config.m_ln2, self.config.false_positive_rate)?;
        let mut state = self.state.lock();
        if epoch <= state.epoch {
            return Ok(false);
        }
        info!(
            from = state.epoch,
            to = epoch,
            dropped = state.filter.entries(),
            "replay filter rotated"
        );
        state.filter = fresh;
        state.epoch = epoch;
        state.saturation_reported = false;
        Ok(true)
    }

    /// Epoch the current filter belongs to.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Number of tags recorded in the current epoch.
    pub fn entries(&self) -> usize {
        self.state.lock().filter.entries()
    }
}

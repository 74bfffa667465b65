//! Engine tuning parameters.

use std::time::Duration;

use mixclient_block::DEFAULT_EXPIRY;
use mixclient_path::{DEFAULT_HOPS, DEFAULT_LAMBDA, DEFAULT_MAX_DELAY_MS};
use mixclient_replay::ReplayConfig;

/// Default interval between provider polls.
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(7);

/// Default attempts per block before a send fails permanently.
pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 5;

/// Upper bound on items drained from the provider in one poll.
pub const DEFAULT_FETCH_DRAIN_LIMIT: usize = 64;

/// Unanswered acknowledgement SURBs are forgotten after this long.
pub const DEFAULT_SURB_MAX_AGE: Duration = Duration::from_secs(3600);

/// Programmatic engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Relay hops before the destination provider.
    pub hops: usize,
    /// Poisson mixing rate per millisecond.
    pub lambda: f64,
    /// Cap on a single hop delay.
    pub max_delay_ms: u32,
    pub fetch_interval: Duration,
    pub fetch_drain_limit: usize,
    pub max_send_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bound on a single provider exchange.
    pub send_timeout: Duration,
    /// Capacity of the per-account send queue and of each event channel.
    pub queue_capacity: usize,
    pub reassembly_expiry: Duration,
    pub surb_max_age: Duration,
    pub replay: ReplayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hops: DEFAULT_HOPS,
            lambda: DEFAULT_LAMBDA,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            fetch_interval: DEFAULT_FETCH_INTERVAL,
            fetch_drain_limit: DEFAULT_FETCH_DRAIN_LIMIT,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            queue_capacity: 256,
            reassembly_expiry: DEFAULT_EXPIRY,
            surb_max_age: DEFAULT_SURB_MAX_AGE,
            replay: ReplayConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.hops, 3);
        assert_eq!(config.fetch_interval, Duration::from_secs(7));
        assert_eq!(config.max_send_attempts, 5);
        assert!(config.backoff_base < config.backoff_max);
    }
}

//! Consensus epoch rotation.
//!
//! The authority is polled for the epoch after the one in use. A newer
//! document replaces the topology and resets the replay filter; an
//! unchanged one is ignored.

use std::sync::Arc;
use std::time::Duration;

use mixclient_engine::{Engine, EngineError};
use mixclient_path::consensus::ConsensusSource;
use mixclient_path::PathError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Check once for a newer consensus. Returns whether the epoch advanced.
pub async fn refresh(engine: &Engine, source: &dyn ConsensusSource) -> bool {
    let current = engine.epoch();
    let snapshot = match source.fetch_consensus(current + 1).await {
        Ok(snapshot) => snapshot,
        Err(PathError::StaleConsensus { .. }) => {
            debug!(epoch = current, "no newer consensus");
            return false;
        }
        Err(e) => {
            warn!(epoch = current, error = %e, "consensus fetch failed");
            return false;
        }
    };
    match engine.rotate_consensus(snapshot) {
        Ok(()) => {
            info!(from = current, to = engine.epoch(), "epoch advanced");
            true
        }
        Err(EngineError::Path(PathError::StaleConsensus { .. })) => false,
        Err(e) => {
            warn!(epoch = current, error = %e, "consensus rejected");
            false
        }
    }
}

/// Poll `source` every `period` until shutdown.
pub async fn run(
    engine: Arc<Engine>,
    source: Arc<dyn ConsensusSource>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                refresh(&engine, source.as_ref()).await;
            }
        }
    }
    debug!("epoch rotation stopped");
}

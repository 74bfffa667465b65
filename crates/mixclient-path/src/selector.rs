//! Random path selection with Poisson mixing delays.
//!
//! A path is `hops` distinct relays drawn uniformly without replacement,
//! followed by the destination provider. Each hop, the provider included,
//! gets an independent `Exp(lambda)` delay in milliseconds, capped at
//! `max_delay_ms`. Paths are never cached; every send draws a new one.
//!
//! Reply paths, used to build SURBs, only pass through nodes that advertise
//! `supports_surb`, and their provider must advertise it too.

use mixclient_types::{Hop, NodeDescriptor, Path, MAX_HOPS};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use tracing::debug;

use crate::consensus::Topology;
use crate::{PathError, Result, DEFAULT_MAX_DELAY_MS};

/// Validated path selection parameters.
#[derive(Clone, Debug)]
pub struct PathSelector {
    hops: usize,
    lambda: f64,
    max_delay_ms: u32,
    delay: Exp<f64>,
}

impl PathSelector {
    /// Create a selector for `hops` relays before the provider.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::InvalidParameter`] if `hops` is zero, the path
    /// would exceed [`MAX_HOPS`], or `lambda` is not a positive finite rate.
    pub fn new(hops: usize, lambda: f64, max_delay_ms: u32) -> Result<Self> {
        if hops == 0 || hops + 1 > MAX_HOPS {
            return Err(PathError::InvalidParameter(format!(
                "hops must be in 1..={}, got {hops}",
                MAX_HOPS - 1
            )));
        }
        if !lambda.is_finite() || lambda <= 0.0 {
            return Err(PathError::InvalidParameter(format!(
                "lambda must be positive, got {lambda}"
            )));
        }
        let delay = Exp::new(lambda)
            .map_err(|e| PathError::InvalidParameter(format!("lambda: {e}")))?;
        Ok(Self {
            hops,
            lambda,
            max_delay_ms,
            delay,
        })
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Select a fresh path ending at `provider` using the thread RNG.
    ///
    /// # Errors
    ///
    /// See [`PathSelector::select_with_rng`].
    pub fn select(&self, topology: &Topology, provider: &str) -> Result<Path> {
        self.select_with_rng(topology, provider, &mut rand::thread_rng())
    }

    /// Select a fresh path ending at `provider`.
    ///
    /// # Errors
    ///
    /// - [`PathError::UnknownProvider`] if `provider` is not in the topology
    /// - [`PathError::InsufficientTopology`] if fewer than `hops` relays are eligible
    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        topology: &Topology,
        provider: &str,
        rng: &mut R,
    ) -> Result<Path> {
        self.draw(topology, provider, Route::Forward, rng)
    }

    /// Select a reply path back to `provider` using the thread RNG.
    ///
    /// # Errors
    ///
    /// See [`PathSelector::select_reply_with_rng`].
    pub fn select_reply(&self, topology: &Topology, provider: &str) -> Result<Path> {
        self.select_reply_with_rng(topology, provider, &mut rand::thread_rng())
    }

    /// Select a reply path back to `provider` through SURB-capable relays.
    ///
    /// # Errors
    ///
    /// - [`PathError::UnknownProvider`] if `provider` is not in the topology
    /// - [`PathError::SurbUnsupported`] if `provider` does not route SURBs
    /// - [`PathError::InsufficientTopology`] if fewer than `hops` SURB-capable
    ///   relays are available
    pub fn select_reply_with_rng<R: Rng + ?Sized>(
        &self,
        topology: &Topology,
        provider: &str,
        rng: &mut R,
    ) -> Result<Path> {
        self.draw(topology, provider, Route::Reply, rng)
    }

    fn draw<R: Rng + ?Sized>(
        &self,
        topology: &Topology,
        provider: &str,
        route: Route,
        rng: &mut R,
    ) -> Result<Path> {
        let destination = topology
            .provider(provider)
            .ok_or_else(|| PathError::UnknownProvider(provider.to_string()))?;
        if route == Route::Reply && !destination.flags.supports_surb {
            return Err(PathError::SurbUnsupported(provider.to_string()));
        }
        let eligible = eligible_relays(topology, destination, route);
        if eligible.len() < self.hops {
            return Err(PathError::InsufficientTopology {
                need: self.hops,
                have: eligible.len(),
            });
        }

        let mut relays: Vec<&NodeDescriptor> =
            eligible.choose_multiple(rng, self.hops).copied().collect();
        relays.shuffle(rng);

        let mut hops = Vec::with_capacity(self.hops + 1);
        for node in relays.into_iter().chain(std::iter::once(destination)) {
            hops.push(Hop {
                node: node.clone(),
                delay_ms: self.sample_delay(rng),
            });
        }
        let path = Path::new(hops);
        debug!(
            epoch = topology.epoch(),
            hops = path.len(),
            reply = route == Route::Reply,
            total_delay_ms = path.total_delay().as_millis() as u64,
            "path selected"
        );
        Ok(path)
    }

    /// Check that a path to `provider` can be built at all.
    ///
    /// # Errors
    ///
    /// Same conditions as [`PathSelector::select_with_rng`].
    pub fn check_topology(&self, topology: &Topology, provider: &str) -> Result<()> {
        let destination = topology
            .provider(provider)
            .ok_or_else(|| PathError::UnknownProvider(provider.to_string()))?;
        let have = eligible_relays(topology, destination, Route::Forward).len();
        if have < self.hops {
            return Err(PathError::InsufficientTopology {
                need: self.hops,
                have,
            });
        }
        Ok(())
    }

    /// Draw one hop delay in milliseconds.
    pub fn sample_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        let ms = self.delay.sample(rng);
        if ms >= f64::from(self.max_delay_ms) {
            self.max_delay_ms
        } else {
            ms as u32
        }
    }
}

/// One-shot path selection with the default delay cap.
///
/// # Errors
///
/// See [`PathSelector::new`] and [`PathSelector::select_with_rng`].
pub fn select_path(topology: &Topology, hops: usize, provider: &str, lambda: f64) -> Result<Path> {
    PathSelector::new(hops, lambda, DEFAULT_MAX_DELAY_MS)?.select(topology, provider)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Route {
    Forward,
    Reply,
}

fn eligible_relays<'a>(
    topology: &'a Topology,
    destination: &NodeDescriptor,
    route: Route,
) -> Vec<&'a NodeDescriptor> {
    let destination_id = destination.node_id();
    topology
        .relays()
        .filter(|n| n.node_id() != destination_id)
        .filter(|n| route == Route::Forward || n.flags.supports_surb)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use mixclient_types::{ConsensusSnapshot, NodeFlags};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn node(seed: u8, is_provider: bool) -> NodeDescriptor {
        NodeDescriptor {
            name: if is_provider {
                format!("provider-{seed}")
            } else {
                format!("mix{seed}")
            },
            identity_key: [seed; 32],
            link_key: [seed; 32],
            address: String::new(),
            flags: NodeFlags {
                is_provider,
                supports_surb: true,
            },
        }
    }

    fn topology(relays: u8, providers: u8) -> Topology {
        let mut nodes: Vec<NodeDescriptor> = (1..=relays).map(|i| node(i, false)).collect();
        nodes.extend((1..=providers).map(|i| node(100 + i, true)));
        Topology::from_snapshot(ConsensusSnapshot {
            epoch: 1,
            nodes,
            signature_valid: true,
        })
        .expect("topology")
    }

    #[test]
    fn test_three_relays_two_hops() {
        let topo = topology(3, 1);
        let path = select_path(&topo, 2, "provider-101", 0.001).expect("path");
        assert_eq!(path.len(), 3);
        assert_eq!(
            path.terminal().map(|h| h.node.name.as_str()),
            Some("provider-101")
        );
    }

    #[test]
    fn test_insufficient_topology() {
        let topo = topology(1, 1);
        let err = select_path(&topo, 2, "provider-101", 0.001).expect_err("should fail");
        assert!(matches!(
            err,
            PathError::InsufficientTopology { need: 2, have: 1 }
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let topo = topology(3, 1);
        assert!(matches!(
            select_path(&topo, 2, "provider-9", 0.001),
            Err(PathError::UnknownProvider(_))
        ));
        // Relays are not valid destinations.
        assert!(matches!(
            select_path(&topo, 2, "mix1", 0.001),
            Err(PathError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_no_repeats_and_providers_only_terminal() {
        let topo = topology(6, 3);
        let selector = PathSelector::new(4, 0.001, 10_000).expect("selector");
        let mut rng = StdRng::seed_from_u64(7);
        let mut distinct_paths = HashSet::new();
        for _ in 0..200 {
            let path = selector
                .select_with_rng(&topo, "provider-102", &mut rng)
                .expect("path");
            let ids = path.node_ids();
            let unique: HashSet<_> = ids.iter().collect();
            assert_eq!(unique.len(), ids.len());
            let (terminal, relays) = path.hops().split_last().expect("non-empty");
            assert_eq!(terminal.node.name, "provider-102");
            assert!(relays.iter().all(|h| h.node.is_relay()));
            distinct_paths.insert(ids);
        }
        assert!(distinct_paths.len() > 1);
    }

    #[test]
    fn test_delay_distribution() {
        let lambda = 0.001;
        let selector = PathSelector::new(1, lambda, u32::MAX).expect("selector");
        let mut rng = StdRng::seed_from_u64(42);
        let samples = 20_000u32;
        let total: f64 = (0..samples)
            .map(|_| f64::from(selector.sample_delay(&mut rng)))
            .sum();
        let mean = total / f64::from(samples);
        let expected = 1.0 / lambda;
        assert!(
            (mean - expected).abs() < expected * 0.05,
            "mean delay {mean}, expected about {expected}"
        );
    }

    #[test]
    fn test_delay_capped() {
        let selector = PathSelector::new(1, 0.000_001, 50).expect("selector");
        let mut rng = StdRng::seed_from_u64(1);
        assert!((0..100).all(|_| selector.sample_delay(&mut rng) <= 50));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(PathSelector::new(0, 0.001, 100).is_err());
        assert!(PathSelector::new(MAX_HOPS, 0.001, 100).is_err());
        assert!(PathSelector::new(2, 0.0, 100).is_err());
        assert!(PathSelector::new(2, f64::NAN, 100).is_err());
        assert!(PathSelector::new(MAX_HOPS - 1, 0.001, 100).is_ok());
    }

    fn mixed_topology() -> Topology {
        let mut nodes: Vec<NodeDescriptor> = (1..=6).map(|i| node(i, false)).collect();
        for relay in nodes.iter_mut().filter(|n| n.identity_key[0] % 2 == 0) {
            relay.flags.supports_surb = false;
        }
        nodes.push(node(101, true));
        let mut legacy = node(102, true);
        legacy.flags.supports_surb = false;
        nodes.push(legacy);
        Topology::from_snapshot(ConsensusSnapshot {
            epoch: 1,
            nodes,
            signature_valid: true,
        })
        .expect("topology")
    }

    #[test]
    fn test_reply_path_uses_surb_capable_nodes() {
        let topo = mixed_topology();
        let selector = PathSelector::new(3, 0.001, 100).expect("selector");
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let path = selector
                .select_reply_with_rng(&topo, "provider-101", &mut rng)
                .expect("reply path");
            assert!(path.hops().iter().all(|h| h.node.flags.supports_surb));
        }

        // Forward paths may still use every relay.
        let used: HashSet<String> = (0..100)
            .flat_map(|_| {
                selector
                    .select_with_rng(&topo, "provider-101", &mut rng)
                    .expect("path")
                    .hops()
                    .iter()
                    .map(|h| h.node.name.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert!(used.contains("mix2"));
    }

    #[test]
    fn test_reply_path_needs_surb_capable_provider_and_relays() {
        let topo = mixed_topology();
        let selector = PathSelector::new(3, 0.001, 100).expect("selector");
        assert!(matches!(
            selector.select_reply(&topo, "provider-102"),
            Err(PathError::SurbUnsupported(_))
        ));
        assert!(selector.select(&topo, "provider-102").is_ok());

        let wide = PathSelector::new(4, 0.001, 100).expect("selector");
        assert!(matches!(
            wide.select_reply(&topo, "provider-101"),
            Err(PathError::InsufficientTopology { need: 4, have: 3 })
        ));
    }

    #[test]
    fn test_check_topology() {
        let selector = PathSelector::new(3, 0.001, 100).expect("selector");
        assert!(selector.check_topology(&topology(3, 1), "provider-101").is_ok());
        assert!(matches!(
            selector.check_topology(&topology(2, 1), "provider-101"),
            Err(PathError::InsufficientTopology { need: 3, have: 2 })
        ));
    }
}

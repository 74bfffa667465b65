//! Routes through the mixnet.

use std::time::Duration;

use crate::{NodeDescriptor, NodeId};

/// One hop of a path: the node and the delay it holds the packet for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hop {
    pub node: NodeDescriptor,
    pub delay_ms: u32,
}

impl Hop {
    /// Delay as a [`Duration`].
    pub fn delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.delay_ms))
    }
}

/// Ordered hops terminated by the destination provider.
///
/// Built per packet and dropped once the packet is constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Path {
    hops: Vec<Hop>,
}

impl Path {
    /// Wrap an ordered list of hops.
    pub fn new(hops: Vec<Hop>) -> Self {
        Self { hops }
    }

    /// All hops in traversal order.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Number of hops including the terminal provider.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Whether the path has no hops at all.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// First hop, where the packet enters the network.
    pub fn first(&self) -> Option<&Hop> {
        self.hops.first()
    }

    /// Terminal hop.
    pub fn terminal(&self) -> Option<&Hop> {
        self.hops.last()
    }

    /// Node identifiers in order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.hops.iter().map(|h| h.node.node_id()).collect()
    }

    /// Sum of all per-hop delays.
    pub fn total_delay(&self) -> Duration {
        self.hops.iter().map(Hop::delay).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeFlags;

    fn hop(seed: u8, delay_ms: u32) -> Hop {
        Hop {
            node: NodeDescriptor {
                name: format!("node{seed}"),
                identity_key: [seed; 32],
                link_key: [seed; 32],
                address: String::new(),
                flags: NodeFlags::default(),
            },
            delay_ms,
        }
    }

    #[test]
    fn test_empty_path() {
        let path = Path::new(Vec::new());
        assert!(path.is_empty());
        assert!(path.terminal().is_none());
    }

    #[test]
    fn test_total_delay() {
        let path = Path::new(vec![hop(1, 100), hop(2, 250), hop(3, 0)]);
        assert_eq!(path.len(), 3);
        assert_eq!(path.total_delay(), Duration::from_millis(350));
        assert_eq!(
            path.terminal().map(|h| h.node.name.as_str()),
            Some("node3")
        );
    }
}

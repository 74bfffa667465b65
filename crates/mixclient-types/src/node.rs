//! Mix node descriptors and consensus snapshots.

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::NodeId;

/// Capability flags published with a node descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Store-and-forward mailbox for client accounts.
    #[serde(default)]
    pub is_provider: bool,
    /// Accepts and routes single-use reply blocks.
    #[serde(default)]
    pub supports_surb: bool,
}

/// A published mix node. Immutable for the epoch it belongs to.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Human readable name; providers are addressed by it in `name@provider`.
    pub name: String,
    /// Ed25519 identity public key.
    #[serde_as(as = "Hex")]
    pub identity_key: [u8; 32],
    /// X25519 link public key used for packet key agreement.
    #[serde_as(as = "Hex")]
    pub link_key: [u8; 32],
    /// Network address (`host:port`).
    pub address: String,
    /// Capability flags.
    #[serde(default)]
    pub flags: NodeFlags,
}

impl NodeDescriptor {
    /// Identifier derived from the identity key.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_identity_key(&self.identity_key)
    }

    /// Whether this node may appear at a non-terminal path position.
    pub fn is_relay(&self) -> bool {
        !self.flags.is_provider
    }

    /// Whether this node is a provider.
    pub fn is_provider(&self) -> bool {
        self.flags.is_provider
    }
}

/// A validated view of the network for one epoch.
///
/// Produced by the authority client and owned by the consensus cache,
/// which swaps whole snapshots and never edits one in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusSnapshot {
    /// Epoch this snapshot is valid for.
    pub epoch: u64,
    /// Published nodes.
    pub nodes: Vec<NodeDescriptor>,
    /// Set by the authority client once the document signature verified.
    pub signature_valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, is_provider: bool) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            identity_key: [name.len() as u8; 32],
            link_key: [7u8; 32],
            address: "127.0.0.1:4000".to_string(),
            flags: NodeFlags {
                is_provider,
                supports_surb: true,
            },
        }
    }

    #[test]
    fn test_relay_flag() {
        assert!(descriptor("mix1", false).is_relay());
        assert!(!descriptor("provider1", true).is_relay());
    }

    #[test]
    fn test_node_id_from_identity() {
        let d = descriptor("mix1", false);
        assert_eq!(d.node_id(), NodeId::from_identity_key(&d.identity_key));
    }

    #[test]
    fn test_descriptor_json() {
        let d = descriptor("mix1", false);
        let json = serde_json::to_string(&d).expect("serialize");
        assert!(json.contains(&"07".repeat(32)));
        let back: NodeDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, d);
    }

    #[test]
    fn test_flags_default_when_missing() {
        let json = format!(
            r#"{{"name":"m","identity_key":"{}","link_key":"{}","address":"a:1"}}"#,
            "00".repeat(32),
            "01".repeat(32)
        );
        let d: NodeDescriptor = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(d.flags, NodeFlags::default());
        assert!(d.is_relay());
    }
}

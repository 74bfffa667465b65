//! Consensus cache and authority interface.
//!
//! The cache holds one validated [`Topology`] behind an `Arc`. Readers take
//! a cheap clone of the `Arc` and keep using it for the whole operation;
//! [`ConsensusCache::update`] builds the next topology off to the side and
//! swaps the pointer, so a reader never sees a half-applied snapshot.
//!
//! ## Static consensus document
//!
//! ```json
//! { "epoch": 42, "nodes": [ ... ], "signature": "<hex ed25519>" }
//! ```
//!
//! The signature covers the canonical JSON of `{"epoch":..,"nodes":[..]}`
//! and is made with the authority key configured in the daemon.

use std::collections::HashMap;
use std::ops::RangeBounds;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use mixclient_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use mixclient_types::{ConsensusSnapshot, NodeDescriptor, NodeId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use tracing::{debug, info};

use crate::ordered_map::OrderedMap;
use crate::{PathError, Result};

/// Indexed, immutable view of one consensus snapshot.
#[derive(Debug, Default)]
pub struct Topology {
    epoch: u64,
    nodes: OrderedMap<NodeId, NodeDescriptor>,
    providers: HashMap<String, NodeId>,
}

impl Topology {
    /// Index a snapshot whose signature has been validated.
    ///
    /// # Errors
    ///
    /// - [`PathError::UnsignedConsensus`] if `signature_valid` is not set
    /// - [`PathError::MalformedConsensus`] on duplicate nodes or provider names
    pub fn from_snapshot(snapshot: ConsensusSnapshot) -> Result<Self> {
        if !snapshot.signature_valid {
            return Err(PathError::UnsignedConsensus);
        }

        let mut nodes = OrderedMap::new();
        let mut providers = HashMap::new();
        for node in snapshot.nodes {
            let id = node.node_id();
            if node.is_provider()
                && providers.insert(node.name.clone(), id).is_some()
            {
                return Err(PathError::MalformedConsensus(format!(
                    "duplicate provider name {}",
                    node.name
                )));
            }
            if nodes.insert(id, node).is_some() {
                return Err(PathError::MalformedConsensus(format!(
                    "duplicate node {id:?}"
                )));
            }
        }

        Ok(Self {
            epoch: snapshot.epoch,
            nodes,
            providers,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by identifier.
    pub fn get(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    /// Look up a provider by its published name.
    pub fn provider(&self, name: &str) -> Option<&NodeDescriptor> {
        self.providers.get(name).and_then(|id| self.nodes.get(id))
    }

    /// All nodes in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Nodes that may occupy a non-terminal path position, in identifier order.
    pub fn relays(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|n| n.is_relay())
    }

    /// Provider nodes, in identifier order.
    pub fn providers(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|n| n.is_provider())
    }

    /// Nodes whose identifiers fall within `range`.
    pub fn range<R: RangeBounds<NodeId>>(
        &self,
        range: R,
    ) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.range(range).map(|(_, n)| n)
    }
}

/// Atomically swapped holder of the current [`Topology`].
pub struct ConsensusCache {
    current: RwLock<Arc<Topology>>,
}

impl ConsensusCache {
    /// Create an empty cache. Path selection fails until a snapshot is loaded.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Topology::default())),
        }
    }

    /// Create a cache seeded with `snapshot`.
    ///
    /// # Errors
    ///
    /// See [`Topology::from_snapshot`].
    pub fn from_snapshot(snapshot: ConsensusSnapshot) -> Result<Self> {
        let topology = Topology::from_snapshot(snapshot)?;
        Ok(Self {
            current: RwLock::new(Arc::new(topology)),
        })
    }

    /// The topology in force right now.
    pub fn snapshot(&self) -> Arc<Topology> {
        Arc::clone(&self.current.read())
    }

    /// Epoch of the cached topology, `0` when empty.
    pub fn epoch(&self) -> u64 {
        self.current.read().epoch
    }

    /// Replace the cached topology with a newer snapshot.
    ///
    /// # Errors
    ///
    /// - [`PathError::StaleConsensus`] if the snapshot is not newer than the cached one
    /// - any error from [`Topology::from_snapshot`]
    pub fn update(&self, snapshot: ConsensusSnapshot) -> Result<()> {
        let offered = snapshot.epoch;
        let topology = Topology::from_snapshot(snapshot)?;

        let mut current = self.current.write();
        if !current.is_empty() && offered <= current.epoch {
            return Err(PathError::StaleConsensus {
                current: current.epoch,
                offered,
            });
        }
        info!(
            from = current.epoch,
            to = offered,
            nodes = topology.len(),
            "consensus updated"
        );
        *current = Arc::new(topology);
        Ok(())
    }
}

impl Default for ConsensusCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory authority client.
///
/// Implementations return only snapshots whose signature they verified.
#[async_trait]
pub trait ConsensusSource: Send + Sync {
    /// Fetch the consensus for `epoch` or a newer one.
    async fn fetch_consensus(&self, epoch: u64) -> Result<ConsensusSnapshot>;
}

/// Signed consensus document as stored on disk.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusDocument {
    pub epoch: u64,
    pub nodes: Vec<NodeDescriptor>,
    #[serde_as(as = "Hex")]
    pub signature: [u8; 64],
}

#[derive(Serialize)]
struct SignedContent<'a> {
    epoch: u64,
    nodes: &'a [NodeDescriptor],
}

fn signed_bytes(epoch: u64, nodes: &[NodeDescriptor]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&SignedContent { epoch, nodes })?)
}

impl ConsensusDocument {
    /// Sign `nodes` for `epoch` with the authority key.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::Json`] if the content cannot be serialized.
    pub fn sign(authority: &SigningKey, epoch: u64, nodes: Vec<NodeDescriptor>) -> Result<Self> {
        let signature = authority.sign(&signed_bytes(epoch, &nodes)?);
        Ok(Self {
            epoch,
            nodes,
            signature: signature.to_bytes(),
        })
    }

    /// Verify the authority signature and produce a validated snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::Crypto`] if the signature does not verify.
    pub fn verify(self, authority: &VerifyingKey) -> Result<ConsensusSnapshot> {
        let message = signed_bytes(self.epoch, &self.nodes)?;
        authority.verify(&message, &Signature::from_bytes(&self.signature))?;
        Ok(ConsensusSnapshot {
            epoch: self.epoch,
            nodes: self.nodes,
            signature_valid: true,
        })
    }
}

/// Authority backed by a signed JSON document on the local filesystem.
///
/// The file is re-read on every fetch, so an operator can drop in the next
/// epoch's document without restarting the daemon.
pub struct StaticConsensusFile {
    path: PathBuf,
    authority: VerifyingKey,
}

impl StaticConsensusFile {
    pub fn new(path: impl AsRef<FsPath>, authority: VerifyingKey) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            authority,
        }
    }

    /// Write a signed document for `nodes` to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::Io`] or [`PathError::Json`] on failure.
    pub fn write(
        path: impl AsRef<FsPath>,
        authority: &SigningKey,
        epoch: u64,
        nodes: Vec<NodeDescriptor>,
    ) -> Result<()> {
        let document = ConsensusDocument::sign(authority, epoch, nodes)?;
        std::fs::write(path, serde_json::to_vec_pretty(&document)?)?;
        Ok(())
    }
}

#[async_trait]
impl ConsensusSource for StaticConsensusFile {
    async fn fetch_consensus(&self, epoch: u64) -> Result<ConsensusSnapshot> {
        let raw = tokio::fs::read(&self.path).await?;
        let document: ConsensusDocument = serde_json::from_slice(&raw)?;
        if document.epoch < epoch {
            return Err(PathError::StaleConsensus {
                current: epoch,
                offered: document.epoch,
            });
        }
        let snapshot = document.verify(&self.authority)?;
        debug!(
            epoch = snapshot.epoch,
            nodes = snapshot.nodes.len(),
            path = %self.path.display(),
            "consensus document verified"
        );
        Ok(snapshot)
    }
}

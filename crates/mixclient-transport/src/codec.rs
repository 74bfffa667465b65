//! Packet codec: paths and message bodies in, Sphinx packets out.
//!
//! ## Forward payload
//!
//! ```text
//! [flags:1][reserved:1][surb:472][body:2170] = PAYLOAD_PLAINTEXT_SIZE
//! ```
//!
//! Flag bit 0 marks a SURB as present; otherwise the SURB slot is zero.
//! The body is one encoded end-to-end block, zero padded.

use mixclient_crypto::x25519::{X25519PublicKey, X25519StaticSecret};
use mixclient_replay::ReplayFilter;
use mixclient_types::{AccountId, NodeId, Path, BLOCK_SIZE, PAYLOAD_PLAINTEXT_SIZE, SURB_SIZE};
use tracing::debug;

use crate::sphinx::{self, RoutingCommand, SphinxPacket, Unwrapped};
use crate::surb::{build_surb, Surb, SurbKeys};
use crate::{Result, TransportError};

const FLAG_SURB: u8 = 0x01;
const OFF_SURB: usize = 2;
const OFF_BODY: usize = OFF_SURB + SURB_SIZE;

/// Plaintext carried to the terminal provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardPayload {
    /// Reply block for the recipient's provider to acknowledge with.
    pub surb: Option<Surb>,
    /// Encoded block, zero padded to [`BLOCK_SIZE`].
    pub body: Vec<u8>,
}

impl ForwardPayload {
    /// Encode to exactly [`PAYLOAD_PLAINTEXT_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidPacket`] if the body exceeds [`BLOCK_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.body.len() > BLOCK_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "body too large: {} bytes, max {BLOCK_SIZE}",
                self.body.len()
            )));
        }
        let mut out = vec![0u8; PAYLOAD_PLAINTEXT_SIZE];
        if let Some(surb) = &self.surb {
            out[0] = FLAG_SURB;
            out[OFF_SURB..OFF_BODY].copy_from_slice(&surb.to_bytes());
        }
        out[OFF_BODY..OFF_BODY + self.body.len()].copy_from_slice(&self.body);
        Ok(out)
    }

    /// Decode a terminal payload.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidPacket`] if the payload is malformed.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != PAYLOAD_PLAINTEXT_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "forward payload is {} bytes, expected {PAYLOAD_PLAINTEXT_SIZE}",
                data.len()
            )));
        }
        let surb = if data[0] & FLAG_SURB != 0 {
            Some(Surb::from_bytes(&data[OFF_SURB..OFF_BODY])?)
        } else {
            None
        };
        Ok(Self {
            surb,
            body: data[OFF_BODY..].to_vec(),
        })
    }
}

/// Reverse route for the acknowledgement SURB.
#[derive(Clone, Copy, Debug)]
pub struct ReplyRoute<'a> {
    /// Relays followed by the sender's own provider.
    pub reverse_path: &'a Path,
    /// Sender account the reply is delivered to.
    pub owner: AccountId,
}

/// A packet ready to hand to the sender's provider.
#[derive(Debug)]
pub struct OutboundPacket {
    /// Node the packet enters the mix network at.
    pub first_hop: NodeId,
    pub packet: SphinxPacket,
    /// Present when a reply route was requested.
    pub surb_keys: Option<SurbKeys>,
}

/// Map a path onto (link key, command) pairs; `terminal` builds the last
/// hop's command from its delay.
///
/// # Errors
///
/// Returns [`TransportError::InvalidPath`] if the path is empty.
pub(crate) fn route(
    path: &Path,
    terminal: impl FnOnce(u32) -> RoutingCommand,
) -> Result<Vec<(X25519PublicKey, RoutingCommand)>> {
    let (last, relays) = path
        .hops()
        .split_last()
        .ok_or_else(|| TransportError::InvalidPath("path has no hops".to_string()))?;

    let mut hops = Vec::with_capacity(path.len());
    for (i, hop) in relays.iter().enumerate() {
        let next = &path.hops()[i + 1];
        hops.push((
            X25519PublicKey::from_bytes(hop.node.link_key),
            RoutingCommand::Relay {
                next_hop: next.node.node_id(),
                delay_ms: hop.delay_ms,
            },
        ));
    }
    hops.push((
        X25519PublicKey::from_bytes(last.node.link_key),
        terminal(last.delay_ms),
    ));
    Ok(hops)
}

/// Build a forward packet carrying `body` to `recipient` over `path`.
///
/// With `reply` set, a SURB over the reverse route is embedded in the payload
/// and its keys are returned for the caller to store.
///
/// # Errors
///
/// - [`TransportError::InvalidPath`] for an empty or over-long path
/// - [`TransportError::InvalidPacket`] if `body` exceeds [`BLOCK_SIZE`]
pub fn build(
    path: &Path,
    recipient: AccountId,
    body: &[u8],
    reply: Option<ReplyRoute<'_>>,
) -> Result<OutboundPacket> {
    let first_hop = path
        .first()
        .map(|h| h.node.node_id())
        .ok_or_else(|| TransportError::InvalidPath("path has no hops".to_string()))?;

    let (surb, surb_keys) = match reply {
        Some(route) => {
            let (surb, keys) = build_surb(route.reverse_path, route.owner)?;
            (Some(surb), Some(keys))
        }
        None => (None, None),
    };
    let payload = ForwardPayload {
        surb,
        body: body.to_vec(),
    }
    .encode()?;

    let hops = route(path, |delay_ms| RoutingCommand::Deliver {
        recipient,
        delay_ms,
    })?;
    let packet = sphinx::build_packet(&hops, &payload)?;
    debug!(
        hops = path.len(),
        surb = surb_keys.is_some(),
        "packet built"
    );
    Ok(OutboundPacket {
        first_hop,
        packet,
        surb_keys,
    })
}

/// Peel one layer at a mix node or provider. See [`sphinx::unwrap_packet`].
///
/// # Errors
///
/// Silent-drop errors as documented on [`sphinx::unwrap_packet`].
pub fn unwrap(
    packet: &SphinxPacket,
    node_secret: &X25519StaticSecret,
    replay: &ReplayFilter,
) -> Result<Unwrapped> {
    let result = sphinx::unwrap_packet(packet, node_secret, replay);
    if let Err(e) = &result {
        if e.is_silent_drop() {
            debug!(reason = %e, "packet dropped");
        }
    }
    result
}

//! Sphinx packet construction and per-hop processing.
//!
//! Every packet is exactly [`PACKET_SIZE`] bytes regardless of path length
//! or message size.
//!
//! ## Packet layout
//!
//! ```text
//! [alpha:32][beta:360][gamma:16] = 408 bytes header
//! [payload:2660]                 = PAYLOAD_PLAINTEXT_SIZE + AEAD tag
//! ```
//!
//! - `alpha`: X25519 group element, re-blinded at every hop
//! - `beta`: encrypted routing commands, one 72-byte slot per remaining hop
//! - `gamma`: truncated BLAKE3 MAC over `beta` for the current hop
//!
//! ## Per-hop key derivation
//!
//! Given shared secret `s = X25519(sk_i, alpha_i)`:
//! - `header  = derive_key("mixclient v1 sphinx-header-key", s)`, keystream over `beta || 0^72`
//! - `mac     = derive_key("mixclient v1 sphinx-mac-key", s)`
//! - `payload = derive_key("mixclient v1 sphinx-payload-key", s)`, intermediate payload layer
//! - `aead    = derive_key("mixclient v1 sphinx-payload-aead", s)`, terminal payload layer
//! - `tag     = derive_key("mixclient v1 sphinx-replay-tag", s)`
//! - `b       = derive_key("mixclient v1 sphinx-blinding", alpha_i || s)`, `alpha_{i+1} = X25519(b, alpha_i)`
//!
//! ## Routing command (72 bytes)
//!
//! ```text
//! [command:1][address:32][delay_ms:4 BE][next_mac:16][surb_id:16][reserved:3]
//! ```

use mixclient_crypto::blake3::{self as mb3, contexts};
use mixclient_crypto::chacha20;
use mixclient_crypto::x25519::{self, X25519PublicKey, X25519StaticSecret};
use mixclient_replay::ReplayFilter;
use mixclient_types::{
    AccountId, NodeId, SurbId, GROUP_ELEMENT_SIZE, HEADER_SIZE, MAC_SIZE, MAX_HOPS,
    PACKET_SIZE, PAYLOAD_PLAINTEXT_SIZE, PAYLOAD_SIZE, ROUTING_INFO_SIZE, ROUTING_SIZE,
};

use crate::{Result, TransportError};

const OFF_BETA: usize = GROUP_ELEMENT_SIZE;
const OFF_GAMMA: usize = OFF_BETA + ROUTING_SIZE;
const OFF_PAYLOAD: usize = HEADER_SIZE;

/// Header keystream covers `beta` plus one slot that is shifted in.
const STREAM_SIZE: usize = ROUTING_SIZE + ROUTING_INFO_SIZE;

const CMD_RELAY: u8 = 1;
const CMD_DELIVER: u8 = 2;
const CMD_SURB_REPLY: u8 = 3;

/// Instruction revealed to a single hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingCommand {
    /// Hold for `delay_ms`, then forward to `next_hop`.
    Relay { next_hop: NodeId, delay_ms: u32 },
    /// Terminal provider: decrypt and store for `recipient`.
    Deliver { recipient: AccountId, delay_ms: u32 },
    /// Terminal provider on a SURB path: store the still-encrypted reply.
    DeliverSurbReply {
        recipient: AccountId,
        surb_id: SurbId,
        delay_ms: u32,
    },
}

impl RoutingCommand {
    /// Delay the hop holds the packet for.
    pub fn delay_ms(&self) -> u32 {
        match self {
            Self::Relay { delay_ms, .. }
            | Self::Deliver { delay_ms, .. }
            | Self::DeliverSurbReply { delay_ms, .. } => *delay_ms,
        }
    }

    /// Whether this command ends the path.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Relay { .. })
    }

    fn encode(&self, next_mac: &[u8; MAC_SIZE]) -> [u8; ROUTING_INFO_SIZE] {
        let mut buf = [0u8; ROUTING_INFO_SIZE];
        let (command, address, surb_id) = match self {
            Self::Relay { next_hop, .. } => (CMD_RELAY, next_hop.0, [0u8; 16]),
            Self::Deliver { recipient, .. } => (CMD_DELIVER, recipient.0, [0u8; 16]),
            Self::DeliverSurbReply {
                recipient, surb_id, ..
            } => (CMD_SURB_REPLY, recipient.0, surb_id.0),
        };
        buf[0] = command;
        buf[1..33].copy_from_slice(&address);
        buf[33..37].copy_from_slice(&self.delay_ms().to_be_bytes());
        buf[37..53].copy_from_slice(next_mac);
        buf[53..69].copy_from_slice(&surb_id);
        buf
    }

    fn decode(buf: &[u8]) -> Result<(Self, [u8; MAC_SIZE])> {
        if buf.len() < ROUTING_INFO_SIZE {
            return Err(TransportError::InvalidPacket(
                "routing command truncated".to_string(),
            ));
        }
        let mut address = [0u8; 32];
        address.copy_from_slice(&buf[1..33]);
        let mut delay = [0u8; 4];
        delay.copy_from_slice(&buf[33..37]);
        let delay_ms = u32::from_be_bytes(delay);
        let mut next_mac = [0u8; MAC_SIZE];
        next_mac.copy_from_slice(&buf[37..53]);
        let mut surb_id = [0u8; 16];
        surb_id.copy_from_slice(&buf[53..69]);

        let command = match buf[0] {
            CMD_RELAY => Self::Relay {
                next_hop: NodeId(address),
                delay_ms,
            },
            CMD_DELIVER => Self::Deliver {
                recipient: AccountId(address),
                delay_ms,
            },
            CMD_SURB_REPLY => Self::DeliverSurbReply {
                recipient: AccountId(address),
                surb_id: SurbId(surb_id),
                delay_ms,
            },
            other => {
                return Err(TransportError::InvalidPacket(format!(
                    "unknown routing command {other}"
                )))
            }
        };
        Ok((command, next_mac))
    }
}

/// Keys one hop derives from its shared secret.
#[derive(Clone)]
pub struct HopKeys {
    pub header: [u8; 32],
    pub mac: [u8; 32],
    pub payload: [u8; 32],
    pub payload_aead: [u8; 32],
    pub payload_nonce: [u8; 12],
    pub replay_tag: [u8; 32],
}

impl HopKeys {
    /// Derive per-hop keys from a raw X25519 shared secret.
    pub fn derive(shared_secret: &[u8; 32]) -> Self {
        Self {
            header: mb3::derive_key(contexts::SPHINX_HEADER_KEY, shared_secret),
            mac: mb3::derive_key(contexts::SPHINX_MAC_KEY, shared_secret),
            payload: mb3::derive_key(contexts::SPHINX_PAYLOAD_KEY, shared_secret),
            payload_aead: mb3::derive_key(contexts::SPHINX_PAYLOAD_AEAD, shared_secret),
            payload_nonce: mb3::derive_nonce(contexts::SPHINX_PAYLOAD_NONCE, shared_secret),
            replay_tag: mb3::derive_key(contexts::SPHINX_REPLAY_TAG, shared_secret),
        }
    }

    fn header_stream(&self) -> Vec<u8> {
        let mut stream = vec![0u8; STREAM_SIZE];
        mb3::keystream(&self.header, &mut stream);
        stream
    }
}

fn blinding_factor(alpha: &[u8; 32], shared_secret: &[u8; 32]) -> [u8; 32] {
    mb3::derive_key_multi(contexts::SPHINX_BLINDING, &[alpha.as_slice(), shared_secret.as_slice()])
}

fn crypto_err(e: mixclient_crypto::CryptoError) -> TransportError {
    TransportError::Crypto(e.to_string())
}

/// A fixed-size Sphinx packet.
#[derive(Clone, PartialEq, Eq)]
pub struct SphinxPacket {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for SphinxPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SphinxPacket({} bytes)", self.bytes.len())
    }
}

impl SphinxPacket {
    /// Parse a packet received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidPacket`] unless `data` is exactly
    /// [`PACKET_SIZE`] bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != PACKET_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "wrong packet size: {} bytes, expected {PACKET_SIZE}",
                data.len()
            )));
        }
        Ok(Self {
            bytes: data.to_vec(),
        })
    }

    pub(crate) fn from_parts(header: &[u8], payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(PACKET_SIZE);
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(payload);
        debug_assert_eq!(bytes.len(), PACKET_SIZE);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Header portion (`alpha || beta || gamma`).
    pub fn header(&self) -> &[u8] {
        &self.bytes[..OFF_PAYLOAD]
    }

    /// Encrypted payload portion.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[OFF_PAYLOAD..]
    }
}

/// A built header plus the keys the sender derived for each hop.
pub(crate) struct BuiltHeader {
    pub header: Vec<u8>,
    pub keys: Vec<HopKeys>,
}

/// Build a Sphinx header for `hops`, given as (link key, command) pairs in
/// traversal order.
///
/// # Errors
///
/// - [`TransportError::InvalidPath`] if the route is empty, longer than
///   [`MAX_HOPS`], or its terminal command is misplaced
/// - [`TransportError::Crypto`] if a key agreement degenerates
pub(crate) fn build_header(hops: &[(X25519PublicKey, RoutingCommand)]) -> Result<BuiltHeader> {
    let n = hops.len();
    if n == 0 {
        return Err(TransportError::InvalidPath("path has no hops".to_string()));
    }
    if n > MAX_HOPS {
        return Err(TransportError::InvalidPath(format!(
            "path has {n} hops, max {MAX_HOPS}"
        )));
    }
    let last = n - 1;
    for (i, (_, command)) in hops.iter().enumerate() {
        if command.is_terminal() != (i == last) {
            return Err(TransportError::InvalidPath(format!(
                "hop {i} has a misplaced terminal command"
            )));
        }
    }

    // Shared secrets: s_i = pk_i ^ (x * b_0 * ... * b_{i-1}).
    let x = X25519StaticSecret::random().to_bytes();
    let alpha0 = x25519::basepoint_mult(&x);
    let mut alpha = alpha0;
    let mut blinds: Vec<[u8; 32]> = Vec::with_capacity(n);
    let mut keys = Vec::with_capacity(n);
    for (pk, _) in hops {
        let mut s = x25519::blind(&x, pk.as_bytes()).map_err(crypto_err)?;
        for b in &blinds {
            s = x25519::blind(b, &s).map_err(crypto_err)?;
        }
        keys.push(HopKeys::derive(&s));
        let b = blinding_factor(&alpha, &s);
        alpha = x25519::blind(&b, &alpha).map_err(crypto_err)?;
        blinds.push(b);
    }

    let mut filler: Vec<u8> = Vec::with_capacity(last * ROUTING_INFO_SIZE);
    for k in &keys[..last] {
        filler.extend_from_slice(&[0u8; ROUTING_INFO_SIZE]);
        let stream = k.header_stream();
        let start = STREAM_SIZE - filler.len();
        mb3::xor_in_place(&mut filler, &stream[start..]);
    }

    let pad_len = ROUTING_SIZE - filler.len();
    let mut beta = vec![0u8; ROUTING_SIZE];
    beta[..ROUTING_INFO_SIZE].copy_from_slice(&hops[last].1.encode(&[0u8; MAC_SIZE]));
    mb3::xor_in_place(&mut beta[..pad_len], &keys[last].header_stream());
    beta[pad_len..].copy_from_slice(&filler);
    let mut gamma = mb3::mac(&keys[last].mac, &beta);

    for i in (0..last).rev() {
        let mut next = vec![0u8; ROUTING_SIZE];
        next[..ROUTING_INFO_SIZE].copy_from_slice(&hops[i].1.encode(&gamma));
        next[ROUTING_INFO_SIZE..].copy_from_slice(&beta[..ROUTING_SIZE - ROUTING_INFO_SIZE]);
        mb3::xor_in_place(&mut next, &keys[i].header_stream());
        beta = next;
        gamma = mb3::mac(&keys[i].mac, &beta);
    }

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&alpha0);
    header.extend_from_slice(&beta);
    header.extend_from_slice(&gamma);
    Ok(BuiltHeader { header, keys })
}

/// Build a forward packet carrying `payload` (at most
/// [`PAYLOAD_PLAINTEXT_SIZE`] bytes, zero padded).
///
/// The terminal hop's layer is ChaCha20-Poly1305; every other hop adds a
/// size-preserving keystream layer.
///
/// # Errors
///
/// - [`TransportError::InvalidPacket`] if `payload` is too large
/// - any error from header construction
pub fn build_packet(
    hops: &[(X25519PublicKey, RoutingCommand)],
    payload: &[u8],
) -> Result<SphinxPacket> {
    if payload.len() > PAYLOAD_PLAINTEXT_SIZE {
        return Err(TransportError::InvalidPacket(format!(
            "payload too large: {} bytes, max {PAYLOAD_PLAINTEXT_SIZE}",
            payload.len()
        )));
    }
    let BuiltHeader { header, keys } = build_header(hops)?;
    let (terminal, relays) = keys
        .split_last()
        .ok_or_else(|| TransportError::InvalidPath("path has no hops".to_string()))?;

    let mut padded = vec![0u8; PAYLOAD_PLAINTEXT_SIZE];
    padded[..payload.len()].copy_from_slice(payload);
    let mut body = chacha20::encrypt(
        &terminal.payload_aead,
        &terminal.payload_nonce,
        &padded,
        &[],
    )
    .map_err(crypto_err)?;
    for k in relays {
        mb3::apply_keystream(&k.payload, &mut body);
    }
    debug_assert_eq!(body.len(), PAYLOAD_SIZE);

    Ok(SphinxPacket::from_parts(&header, &body))
}

/// Outcome of processing a packet at one hop.
#[derive(Debug)]
pub enum Unwrapped {
    /// Forward `packet` to `next_hop` after `delay_ms`.
    Forward {
        next_hop: NodeId,
        delay_ms: u32,
        packet: SphinxPacket,
    },
    /// Terminal hop: decrypted forward payload for `recipient`.
    Deliver {
        recipient: AccountId,
        delay_ms: u32,
        payload: Vec<u8>,
    },
    /// Terminal hop of a SURB path: reply still encrypted for its owner.
    SurbReply {
        recipient: AccountId,
        surb_id: SurbId,
        delay_ms: u32,
        payload: Vec<u8>,
    },
}

/// Peel one layer of `packet` with this node's link key.
///
/// The replay tag is recorded only after the header MAC verified.
///
/// # Errors
///
/// Errors for which [`TransportError::is_silent_drop`] holds mean the packet
/// must be dropped without any response:
/// - [`TransportError::MacVerification`] if the header MAC fails
/// - [`TransportError::ReplayDetected`] if the packet was already processed
/// - [`TransportError::InvalidPacket`] if the header or terminal payload is malformed
pub fn unwrap_packet(
    packet: &SphinxPacket,
    node_secret: &X25519StaticSecret,
    replay: &ReplayFilter,
) -> Result<Unwrapped> {
    let data = packet.as_bytes();
    let mut alpha = [0u8; 32];
    alpha.copy_from_slice(&data[..OFF_BETA]);
    let beta = &data[OFF_BETA..OFF_GAMMA];
    let gamma = &data[OFF_GAMMA..OFF_PAYLOAD];

    let shared = node_secret
        .diffie_hellman(&X25519PublicKey::from_bytes(alpha))
        .map_err(|_| TransportError::InvalidPacket("degenerate group element".to_string()))?;
    let keys = HopKeys::derive(shared.as_bytes());

    if !mb3::verify_mac(&keys.mac, beta, gamma) {
        return Err(TransportError::MacVerification);
    }
    if replay.test_and_set(&keys.replay_tag) {
        return Err(TransportError::ReplayDetected);
    }

    let mut routing = vec![0u8; STREAM_SIZE];
    routing[..ROUTING_SIZE].copy_from_slice(beta);
    mb3::xor_in_place(&mut routing, &keys.header_stream());
    let (command, next_mac) = RoutingCommand::decode(&routing[..ROUTING_INFO_SIZE])?;

    let mut payload = data[OFF_PAYLOAD..].to_vec();
    match command {
        RoutingCommand::Relay { next_hop, delay_ms } => {
            let b = blinding_factor(&alpha, shared.as_bytes());
            let next_alpha = x25519::blind(&b, &alpha).map_err(|_| {
                TransportError::InvalidPacket("degenerate blinded element".to_string())
            })?;
            mb3::apply_keystream(&keys.payload, &mut payload);

            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(&next_alpha);
            header.extend_from_slice(&routing[ROUTING_INFO_SIZE..]);
            header.extend_from_slice(&next_mac);
            Ok(Unwrapped::Forward {
                next_hop,
                delay_ms,
                packet: SphinxPacket::from_parts(&header, &payload),
            })
        }
        RoutingCommand::Deliver {
            recipient,
            delay_ms,
        } => {
            let plaintext =
                chacha20::decrypt(&keys.payload_aead, &keys.payload_nonce, &payload, &[])
                    .map_err(|_| {
                        TransportError::InvalidPacket(
                            "payload authentication failed".to_string(),
                        )
                    })?;
            Ok(Unwrapped::Deliver {
                recipient,
                delay_ms,
                payload: plaintext,
            })
        }
        RoutingCommand::DeliverSurbReply {
            recipient,
            surb_id,
            delay_ms,
        } => {
            mb3::apply_keystream(&keys.payload, &mut payload);
            Ok(Unwrapped::SurbReply {
                recipient,
                surb_id,
                delay_ms,
                payload,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use mixclient_replay::ReplayConfig;

    use super::*;

    struct TestNode {
        secret: X25519StaticSecret,
        id: NodeId,
        replay: ReplayFilter,
    }

    fn nodes(n: usize) -> Vec<TestNode> {
        (0..n)
            .map(|i| TestNode {
                secret: X25519StaticSecret::random(),
                id: NodeId([i as u8 + 1; 32]),
                replay: ReplayFilter::new(
                    ReplayConfig {
                        m_ln2: 14,
                        false_positive_rate: 1e-4,
                    },
                    1,
                )
                .expect("replay filter"),
            })
            .collect()
    }

    fn route(nodes: &[TestNode], recipient: AccountId) -> Vec<(X25519PublicKey, RoutingCommand)> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let delay_ms = 100 * (i as u32 + 1);
                let command = match nodes.get(i + 1) {
                    Some(next) => RoutingCommand::Relay {
                        next_hop: next.id,
                        delay_ms,
                    },
                    None => RoutingCommand::Deliver {
                        recipient,
                        delay_ms,
                    },
                };
                (node.secret.public_key(), command)
            })
            .collect()
    }

    fn traverse(nodes: &[TestNode], mut packet: SphinxPacket) -> Unwrapped {
        for (i, node) in nodes.iter().enumerate() {
            match unwrap_packet(&packet, &node.secret, &node.replay).expect("unwrap") {
                Unwrapped::Forward {
                    next_hop,
                    delay_ms,
                    packet: next,
                } => {
                    assert_eq!(next_hop, nodes[i + 1].id);
                    assert_eq!(delay_ms, 100 * (i as u32 + 1));
                    assert_eq!(next.as_bytes().len(), PACKET_SIZE);
                    packet = next;
                }
                terminal => {
                    assert_eq!(i, nodes.len() - 1);
                    return terminal;
                }
            }
        }
        unreachable!("path ended without a terminal hop")
    }

    #[test]
    fn test_routing_command_encoding() {
        let command = RoutingCommand::DeliverSurbReply {
            recipient: AccountId([3u8; 32]),
            surb_id: SurbId([4u8; 16]),
            delay_ms: 1234,
        };
        let encoded = command.encode(&[5u8; MAC_SIZE]);
        let (decoded, mac) = RoutingCommand::decode(&encoded).expect("decode");
        assert_eq!(decoded, command);
        assert_eq!(mac, [5u8; MAC_SIZE]);

        let mut bad = encoded;
        bad[0] = 9;
        assert!(RoutingCommand::decode(&bad).is_err());
    }

    #[test]
    fn test_hop_keys_distinct() {
        let keys = HopKeys::derive(&[42u8; 32]);
        assert_ne!(keys.header, keys.mac);
        assert_ne!(keys.payload, keys.payload_aead);
        assert_ne!(keys.replay_tag, keys.header);
        let other = HopKeys::derive(&[43u8; 32]);
        assert_ne!(keys.replay_tag, other.replay_tag);
    }

    #[test]
    fn test_roundtrip_every_path_length() {
        let recipient = AccountId([0xAB; 32]);
        for n in 1..=MAX_HOPS {
            let path = nodes(n);
            let message = format!("hello over {n} hops");
            let packet = build_packet(&route(&path, recipient), message.as_bytes())
                .expect("build");
            assert_eq!(packet.as_bytes().len(), PACKET_SIZE);
            match traverse(&path, packet) {
                Unwrapped::Deliver {
                    recipient: r,
                    delay_ms,
                    payload,
                } => {
                    assert_eq!(r, recipient);
                    assert_eq!(delay_ms, 100 * n as u32);
                    assert_eq!(payload.len(), PAYLOAD_PLAINTEXT_SIZE);
                    assert_eq!(&payload[..message.len()], message.as_bytes());
                    assert!(payload[message.len()..].iter().all(|&b| b == 0));
                }
                other => unreachable!("unexpected terminal result {other:?}"),
            }
        }
    }

    #[test]
    fn test_replay_dropped() {
        let path = nodes(3);
        let packet = build_packet(&route(&path, AccountId([1; 32])), b"once").expect("build");
        let first = unwrap_packet(&packet, &path[0].secret, &path[0].replay);
        assert!(matches!(first, Ok(Unwrapped::Forward { .. })));
        let second = unwrap_packet(&packet, &path[0].secret, &path[0].replay);
        assert!(matches!(second, Err(TransportError::ReplayDetected)));
    }

    #[test]
    fn test_tampered_header_fails_mac() {
        let path = nodes(2);
        let packet = build_packet(&route(&path, AccountId([1; 32])), b"x").expect("build");
        let mut bytes = packet.into_bytes();
        bytes[OFF_BETA + 10] ^= 0x01;
        let tampered = SphinxPacket::from_bytes(&bytes).expect("size ok");
        let err = unwrap_packet(&tampered, &path[0].secret, &path[0].replay)
            .expect_err("must fail");
        assert!(matches!(err, TransportError::MacVerification));
        assert!(err.is_silent_drop());
        // A failed MAC must not consume the replay tag of the genuine packet.
        assert_eq!(path[0].replay.entries(), 0);
    }

    #[test]
    fn test_wrong_node_key_fails_mac() {
        let path = nodes(2);
        let packet = build_packet(&route(&path, AccountId([1; 32])), b"x").expect("build");
        let stranger = X25519StaticSecret::random();
        assert!(matches!(
            unwrap_packet(&packet, &stranger, &path[0].replay),
            Err(TransportError::MacVerification)
        ));
    }

    #[test]
    fn test_tampered_payload_detected_at_terminal() {
        let path = nodes(2);
        let packet = build_packet(&route(&path, AccountId([1; 32])), b"x").expect("build");
        let mut bytes = packet.into_bytes();
        bytes[OFF_PAYLOAD + 5] ^= 0x80;
        let tampered = SphinxPacket::from_bytes(&bytes).expect("size ok");
        let forwarded = match unwrap_packet(&tampered, &path[0].secret, &path[0].replay) {
            Ok(Unwrapped::Forward { packet, .. }) => packet,
            other => unreachable!("expected forward, got {other:?}"),
        };
        assert!(matches!(
            unwrap_packet(&forwarded, &path[1].secret, &path[1].replay),
            Err(TransportError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_invalid_paths_rejected() {
        assert!(matches!(
            build_packet(&[], b"x"),
            Err(TransportError::InvalidPath(_))
        ));

        let path = nodes(MAX_HOPS + 1);
        assert!(matches!(
            build_packet(&route(&path, AccountId([1; 32])), b"x"),
            Err(TransportError::InvalidPath(_))
        ));

        let path = nodes(2);
        let mut hops = route(&path, AccountId([1; 32]));
        hops.swap(0, 1);
        assert!(matches!(
            build_packet(&hops, b"x"),
            Err(TransportError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let path = nodes(1);
        let big = vec![0u8; PAYLOAD_PLAINTEXT_SIZE + 1];
        assert!(matches!(
            build_packet(&route(&path, AccountId([1; 32])), &big),
            Err(TransportError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_from_bytes_size_check() {
        assert!(SphinxPacket::from_bytes(&[0u8; 100]).is_err());
        assert!(SphinxPacket::from_bytes(&vec![0u8; PACKET_SIZE]).is_ok());
    }

    #[test]
    fn test_alpha_rerandomized_per_hop() {
        let path = nodes(3);
        let packet = build_packet(&route(&path, AccountId([1; 32])), b"x").expect("build");
        let first_alpha = packet.header()[..32].to_vec();
        match unwrap_packet(&packet, &path[0].secret, &path[0].replay).expect("unwrap") {
            Unwrapped::Forward { packet: next, .. } => {
                assert_ne!(&next.header()[..32], first_alpha.as_slice());
                assert_ne!(next.payload(), packet.payload());
            }
            other => unreachable!("expected forward, got {other:?}"),
        }
    }
}

//! Client-to-provider protocol.
//!
//! Every command and reply travels in a [`ProviderFrame`] envelope,
//! CBOR-serialized and sent as one message on the session.
//!
//! ## Wire format
//!
//! ```text
//! ProviderFrame {
//!     version: u8,   // Protocol version (1)
//!     body:    T,    // ProviderCommand or ProviderReply
//! }
//! ```
//!
//! Retrieval is sequence based: the client asks for `sequence`, the
//! provider answers with the head of the account queue, and the entry is
//! only removed once the client sends `Acknowledge` for that sequence.

use mixclient_types::{AccountId, NodeId, SurbId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::TransportError;

/// Current provider protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded frame size (to prevent allocation attacks).
pub const MAX_FRAME_SIZE: usize = 65536;

/// Requests a client sends to its provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderCommand {
    /// First command on a session; binds it to `account`.
    Authenticate {
        account: AccountId,
        link_public_key: [u8; 32],
    },
    /// Inject a Sphinx packet into the mix network at `first_hop`.
    SendPacket { first_hop: NodeId, packet: Vec<u8> },
    /// Ask for the queued item at `sequence`.
    RetrieveMessage { sequence: u32 },
    /// Confirm that the item at `sequence` was processed.
    Acknowledge { sequence: u32 },
}

/// Provider responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderReply {
    Ok,
    /// A forward message body for this account.
    Message {
        sequence: u32,
        payload: Vec<u8>,
        queue_hint: u32,
    },
    /// A reply that arrived through one of this account's SURBs.
    SurbReply {
        sequence: u32,
        surb_id: SurbId,
        payload: Vec<u8>,
        queue_hint: u32,
    },
    /// Nothing queued at `sequence`.
    Empty { sequence: u32 },
    Error { reason: String },
}

impl ProviderReply {
    /// Items still queued after this one, if the reply carries a hint.
    pub fn queue_hint(&self) -> Option<u32> {
        match self {
            Self::Message { queue_hint, .. } | Self::SurbReply { queue_hint, .. } => {
                Some(*queue_hint)
            }
            _ => None,
        }
    }
}

/// Versioned envelope around a command or reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderFrame<T> {
    /// Protocol version. Must be [`PROTOCOL_VERSION`].
    pub version: u8,
    pub body: T,
}

impl<T: Serialize + DeserializeOwned> ProviderFrame<T> {
    pub fn new(body: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body,
        }
    }

    /// Serialize for transmission.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Serialization`] if encoding fails
    /// - [`TransportError::ProtocolViolation`] if the frame exceeds [`MAX_FRAME_SIZE`]
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "frame too large: {} bytes, max {MAX_FRAME_SIZE}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Deserialize a frame received from the wire.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ProtocolViolation`] if the frame is oversized or the
    ///   version is unsupported
    /// - [`TransportError::Deserialization`] if the bytes do not decode
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "frame too large: {} bytes, max {MAX_FRAME_SIZE}",
                data.len()
            )));
        }
        let frame: Self = ciborium::from_reader(data)
            .map_err(|e| TransportError::Deserialization(e.to_string()))?;
        if frame.version != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolViolation(format!(
                "unsupported protocol version {}, expected {PROTOCOL_VERSION}",
                frame.version
            )));
        }
        Ok(frame)
    }
}

/// Encode a command frame.
///
/// # Errors
///
/// See [`ProviderFrame::to_bytes`].
pub fn encode_command(command: &ProviderCommand) -> Result<Vec<u8>, TransportError> {
    ProviderFrame::new(command.clone()).to_bytes()
}

/// Decode a command frame.
///
/// # Errors
///
/// See [`ProviderFrame::from_bytes`].
pub fn decode_command(data: &[u8]) -> Result<ProviderCommand, TransportError> {
    Ok(ProviderFrame::<ProviderCommand>::from_bytes(data)?.body)
}

/// Encode a reply frame.
///
/// # Errors
///
/// See [`ProviderFrame::to_bytes`].
pub fn encode_reply(reply: &ProviderReply) -> Result<Vec<u8>, TransportError> {
    ProviderFrame::new(reply.clone()).to_bytes()
}

/// Decode a reply frame.
///
/// # Errors
///
/// See [`ProviderFrame::from_bytes`].
pub fn decode_reply(data: &[u8]) -> Result<ProviderReply, TransportError> {
    Ok(ProviderFrame::<ProviderReply>::from_bytes(data)?.body)
}

#[cfg(test)]
mod tests {
    use mixclient_types::PACKET_SIZE;

    use super::*;

    #[test]
    fn test_packet_command_fits_frame() {
        let cmd = ProviderCommand::SendPacket {
            first_hop: NodeId([1; 32]),
            packet: vec![0xAB; PACKET_SIZE],
        };
        let bytes = encode_command(&cmd).expect("encode");
        assert!(bytes.len() <= MAX_FRAME_SIZE);
        assert_eq!(decode_command(&bytes).expect("decode"), cmd);
    }

    #[test]
    fn test_reply_decodes() {
        let reply = ProviderReply::SurbReply {
            sequence: 4,
            surb_id: SurbId([2; 16]),
            payload: vec![1, 2, 3],
            queue_hint: 7,
        };
        let bytes = encode_reply(&reply).expect("encode");
        let decoded = decode_reply(&bytes).expect("decode");
        assert_eq!(decoded.queue_hint(), Some(7));
        assert_eq!(decoded, reply);
        assert_eq!(ProviderReply::Empty { sequence: 1 }.queue_hint(), None);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let frame = ProviderFrame {
            version: 99,
            body: ProviderReply::Ok,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&frame, &mut bytes).expect("serialize");
        assert!(matches!(
            decode_reply(&bytes),
            Err(TransportError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            decode_command(&huge),
            Err(TransportError::ProtocolViolation(_))
        ));
        let cmd = ProviderCommand::SendPacket {
            first_hop: NodeId([0; 32]),
            packet: vec![0u8; MAX_FRAME_SIZE],
        };
        assert!(encode_command(&cmd).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_command(&[0xFF, 0xFF, 0xFF]),
            Err(TransportError::Deserialization(_))
        ));
        assert!(matches!(
            decode_reply(&[]),
            Err(TransportError::Deserialization(_))
        ));
    }

    #[test]
    fn test_command_as_reply_fails() {
        let bytes = encode_command(&ProviderCommand::Acknowledge { sequence: 1 })
            .expect("encode");
        assert!(decode_reply(&bytes).is_err());
    }
}

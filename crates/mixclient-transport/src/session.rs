//! Link-layer abstraction consumed by the engine.
//!
//! A [`Transport`] connects to a node and yields a [`Session`], a
//! byte-oriented authenticated channel carrying whole messages. The QUIC
//! implementation lives in [`crate::quic`]; tests substitute an in-memory
//! network.

use async_trait::async_trait;
use mixclient_types::NodeDescriptor;
use tracing::trace;

use crate::wire::{self, ProviderCommand, ProviderReply};
use crate::Result;

/// A connected, message-oriented channel to one node.
#[async_trait]
pub trait Session: Send {
    /// Send one complete message.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive the next complete message.
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Close the channel. Further calls fail with
    /// [`TransportError::Closed`](crate::TransportError::Closed).
    async fn close(&mut self);
}

/// Factory for sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session to `node`.
    async fn connect(&self, node: &NodeDescriptor) -> Result<Box<dyn Session>>;
}

/// Send `command` and wait for the matching reply.
///
/// # Errors
///
/// Any session or frame decoding error.
pub async fn request(session: &mut dyn Session, command: &ProviderCommand) -> Result<ProviderReply> {
    session.send(&wire::encode_command(command)?).await?;
    let reply = wire::decode_reply(&session.receive().await?)?;
    trace!(?reply, "provider reply");
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::TransportError;

    /// Session answering each command with a canned reply.
    struct Scripted {
        replies: VecDeque<ProviderReply>,
        sent: Vec<ProviderCommand>,
        closed: bool,
    }

    #[async_trait]
    impl Session for Scripted {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            self.sent.push(wire::decode_command(data)?);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Vec<u8>> {
            let reply = self.replies.pop_front().ok_or(TransportError::Closed)?;
            wire::encode_reply(&reply)
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let mut session = Scripted {
            replies: VecDeque::from([ProviderReply::Ok, ProviderReply::Empty { sequence: 3 }]),
            sent: Vec::new(),
            closed: false,
        };
        let reply = request(&mut session, &ProviderCommand::Acknowledge { sequence: 2 })
            .await
            .expect("request");
        assert_eq!(reply, ProviderReply::Ok);
        let reply = request(&mut session, &ProviderCommand::RetrieveMessage { sequence: 3 })
            .await
            .expect("request");
        assert_eq!(reply, ProviderReply::Empty { sequence: 3 });
        assert_eq!(session.sent.len(), 2);

        session.close().await;
        assert!(matches!(
            request(&mut session, &ProviderCommand::RetrieveMessage { sequence: 3 }).await,
            Err(TransportError::Closed)
        ));
    }
}

//! Engine notifications.
//!
//! Events are delivered over two bounded channels, one for delivery status
//! and one for received messages. A full channel applies backpressure to the
//! emitting pipeline; a dropped receiver discards further events.

use mixclient_crypto::x25519::X25519PublicKey;
use mixclient_types::{AccountId, MessageId};
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// Progress of an outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Every block was accepted by the sender's provider.
    Sent {
        account: AccountId,
        message_id: MessageId,
    },
    /// One block was confirmed by the recipient's provider.
    Acknowledged {
        account: AccountId,
        message_id: MessageId,
        block: u32,
    },
    /// Every block was confirmed by the recipient's provider.
    Delivered {
        account: AccountId,
        message_id: MessageId,
    },
    /// Retries for a block were exhausted.
    PermanentFailure {
        account: AccountId,
        message_id: MessageId,
        attempts: u32,
        reason: String,
    },
}

/// A fully reassembled and authenticated inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub account: AccountId,
    pub message_id: MessageId,
    pub sender: X25519PublicKey,
    pub plaintext: Vec<u8>,
}

/// Emitting half shared by the pipelines.
#[derive(Clone)]
pub(crate) struct EventSink {
    delivery: mpsc::Sender<DeliveryEvent>,
    received: mpsc::Sender<ReceivedMessage>,
    shutdown: watch::Receiver<bool>,
}

impl EventSink {
    pub(crate) fn new(
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::Receiver<DeliveryEvent>, mpsc::Receiver<ReceivedMessage>) {
        let (delivery, delivery_rx) = mpsc::channel(capacity.max(1));
        let (received, received_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                delivery,
                received,
                shutdown,
            },
            delivery_rx,
            received_rx,
        )
    }

    pub(crate) async fn delivery(&self, event: DeliveryEvent) {
        trace!(?event, "delivery event");
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return;
        }
        tokio::select! {
            result = self.delivery.send(event) => {
                if result.is_err() {
                    trace!("delivery receiver dropped");
                }
            }
            _ = shutdown.changed() => {}
        }
    }

    pub(crate) async fn received(&self, message: ReceivedMessage) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow_and_update() {
            return;
        }
        tokio::select! {
            result = self.received.send(message) => {
                if result.is_err() {
                    trace!("received receiver dropped");
                }
            }
            _ = shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_flow() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (sink, mut delivery, _received) = EventSink::new(4, stop_rx);
        let event = DeliveryEvent::Sent {
            account: AccountId([1; 32]),
            message_id: MessageId([2; 16]),
        };
        sink.delivery(event.clone()).await;
        assert_eq!(delivery.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_full_channel_released_by_shutdown() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (sink, _delivery, _received) = EventSink::new(1, stop_rx);
        let event = DeliveryEvent::Delivered {
            account: AccountId([1; 32]),
            message_id: MessageId([2; 16]),
        };
        sink.delivery(event.clone()).await;

        let blocked = tokio::spawn({
            let sink = sink.clone();
            async move { sink.delivery(event).await }
        });
        stop_tx.send(true).expect("send");
        blocked.await.expect("join");
    }
}

//! Delivery and receive notifications.
//!
//! Events are logged; received plaintext is already persisted under
//! `inbox/` by the engine.

use mixclient_engine::{DeliveryEvent, EngineEvents};
use tracing::{error, info};

/// Consume engine events until both channels close.
pub async fn run(mut events: EngineEvents) {
    let mut delivery_open = true;
    let mut received_open = true;
    while delivery_open || received_open {
        tokio::select! {
            event = events.delivery.recv(), if delivery_open => match event {
                Some(event) => log_delivery(&event),
                None => delivery_open = false,
            },
            message = events.received.recv(), if received_open => match message {
                Some(message) => info!(
                    account = %message.account,
                    message_id = %message.message_id,
                    sender = %hex::encode(message.sender.as_bytes()),
                    bytes = message.plaintext.len(),
                    "message received"
                ),
                None => received_open = false,
            },
        }
    }
}

fn log_delivery(event: &DeliveryEvent) {
    match event {
        DeliveryEvent::Sent { account, message_id } => {
            info!(%account, %message_id, "message handed to provider");
        }
        DeliveryEvent::Acknowledged {
            account,
            message_id,
            block,
        } => info!(%account, %message_id, block, "block acknowledged"),
        DeliveryEvent::Delivered { account, message_id } => {
            info!(%account, %message_id, "message delivered");
        }
        DeliveryEvent::PermanentFailure {
            account,
            message_id,
            attempts,
            reason,
        } => error!(%account, %message_id, attempts, %reason, "message failed"),
    }
}

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::ledger::models::Amount;
use crate::transfers::models::Rail;

/// Notifications published by the settlement core. Delivery and formatting belong to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum GatewayEvent {
    BlockSealed { chain_id: u64, block_number: u64 },
    NodeConnected { chain_id: u64 },
    NodeDisconnected { chain_id: u64 },
    SyncLost { chain_id: u64 },
    SyncRecovered { chain_id: u64, block_number: u64 },
    ReorgDetected { chain_id: u64, new_head: u64, removed_blocks: usize },
    PaymentReceived {
        order_id: Uuid,
        payment_id: Uuid,
        amount: Amount,
        block_number: Option<u64>,
    },
    PaymentConfirmed {
        order_id: Uuid,
        payment_id: Uuid,
        amount: Amount,
        block_number: Option<u64>,
    },
    RouteExpired { order_id: Uuid, route_id: Uuid },
    TransferScheduled { transfer_id: Uuid, amount: Amount },
    TransferExecuted { transfer_id: Uuid, rail: Rail },
    TransferFailed { transfer_id: Uuid },
    TransferCanceled { transfer_id: Uuid },
}

/// Event channel capacity
const BROADCAST_CAPACITY: usize = 1024;

/// Fan-out of gateway events to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish after the write that caused the event has committed
    pub fn publish(&self, event: GatewayEvent) {
        debug!("📡 {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(GatewayEvent::NodeConnected { chain_id: 1 });

        assert_eq!(first.recv().await.unwrap(), GatewayEvent::NodeConnected { chain_id: 1 });
        assert_eq!(second.recv().await.unwrap(), GatewayEvent::NodeConnected { chain_id: 1 });
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::TransferFailed {
            transfer_id: Uuid::new_v4(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = GatewayEvent::BlockSealed {
            chain_id: 1,
            block_number: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "blockSealed");
        assert_eq!(json["block_number"], 42);
    }
}

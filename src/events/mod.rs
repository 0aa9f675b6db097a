use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes an event whose underlying change is already committed.
    /// Never waits for channel capacity; a full or closed channel drops the
    /// event with a warning.
    pub fn publish(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = event.name(), "event channel full, dropping ledger event")
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event = event.name(), "event channel closed, dropping ledger event")
            }
        }
    }
}

/// Events published after ledger and directory changes commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StockAdjusted {
        warehouse_id: Uuid,
        product_id: Uuid,
        old_quantity: i32,
        new_quantity: i32,
        reason: String,
        performed_by: Uuid,
    },
    StockTransferred {
        transfer_id: Uuid,
        source_warehouse_id: Uuid,
        destination_warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        performed_by: Uuid,
    },
    StockReceived {
        warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        purchase_order_id: Uuid,
    },
    StockDeducted {
        warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    StockRestored {
        warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    LowStock {
        warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        threshold: i32,
    },
    OutOfStock {
        warehouse_id: Uuid,
        product_id: Uuid,
    },
    WarehouseCreated(Uuid),
    WarehouseUpdated(Uuid),
    WarehouseDeleted(Uuid),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::StockTransferred { .. } => "stock_transferred",
            Event::StockReceived { .. } => "stock_received",
            Event::StockDeducted { .. } => "stock_deducted",
            Event::StockRestored { .. } => "stock_restored",
            Event::LowStock { .. } => "low_stock",
            Event::OutOfStock { .. } => "out_of_stock",
            Event::WarehouseCreated(_) => "warehouse_created",
            Event::WarehouseUpdated(_) => "warehouse_updated",
            Event::WarehouseDeleted(_) => "warehouse_deleted",
        }
    }
}

/// Drains the channel, logging every event until all senders are dropped.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::LowStock {
                warehouse_id,
                product_id,
                quantity,
                threshold,
            } => warn!(
                %warehouse_id,
                %product_id,
                quantity,
                threshold,
                "stock at or below low-stock threshold"
            ),
            Event::OutOfStock {
                warehouse_id,
                product_id,
            } => warn!(%warehouse_id, %product_id, "stock depleted"),
            other => info!(event = other.name(), payload = ?other, "ledger event"),
        }
    }
    info!("event channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_receiver() {
        let (sender, mut rx) = EventSender::channel(4);
        let id = Uuid::new_v4();
        sender.publish(Event::WarehouseCreated(id));
        assert_eq!(rx.recv().await, Some(Event::WarehouseCreated(id)));
    }

    #[tokio::test]
    async fn publish_ignores_closed_channel() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        sender.publish(Event::WarehouseDeleted(Uuid::nil()));
        assert!(sender.send(Event::WarehouseDeleted(Uuid::nil())).await.is_err());
    }

    #[tokio::test]
    async fn publish_drops_events_when_channel_is_full() {
        let (sender, mut rx) = EventSender::channel(1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        // Nobody is receiving yet; the second publish must not wait for room.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            sender.publish(Event::WarehouseCreated(first));
            sender.publish(Event::WarehouseCreated(second));
        })
        .await
        .expect("publish blocked on a full channel");

        assert_eq!(rx.recv().await, Some(Event::WarehouseCreated(first)));
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }
}

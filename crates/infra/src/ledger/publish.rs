//! Post-commit publication of stock changes.

use std::sync::Mutex;

use thiserror::Error;

use stockledger_events::{Event, EventBus};
use stockledger_inventory::StockChanged;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Receiver of stock-changed events.
///
/// Called only after the unit of work committed. A failure is logged by the
/// ledger and dropped; it never undoes the committed change.
pub trait StockEventSink: Send + Sync {
    fn publish(&self, event: &StockChanged) -> Result<(), PublishError>;
}

/// Forwards events to any [`EventBus`] (in-memory, Redis).
#[derive(Debug)]
pub struct BusSink<B> {
    bus: B,
}

impl<B> BusSink<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> StockEventSink for BusSink<B>
where
    B: EventBus<StockChanged>,
{
    fn publish(&self, event: &StockChanged) -> Result<(), PublishError> {
        self.bus
            .publish(event.clone())
            .map_err(|e| PublishError(format!("{}: {e:?}", event.schema())))
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl StockEventSink for NoopSink {
    fn publish(&self, _event: &StockChanged) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Keeps every event in memory, in publication order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StockChanged>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StockChanged> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl StockEventSink for RecordingSink {
    fn publish(&self, event: &StockChanged) -> Result<(), PublishError> {
        self.events
            .lock()
            .map_err(|_| PublishError("recording sink poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stockledger_core::{ItemId, TenantId, WarehouseId};
    use stockledger_events::InMemoryEventBus;
    use stockledger_inventory::{TransactionId, TransactionKind};

    fn event() -> StockChanged {
        StockChanged {
            tenant_id: TenantId::new(),
            item_id: ItemId::generate(),
            warehouse_id: WarehouseId::generate(),
            old_quantity: dec!(0),
            new_quantity: dec!(5),
            transaction_kind: TransactionKind::Purchase,
            transaction_id: TransactionId(1),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn bus_sink_forwards_to_subscribers() {
        let bus = std::sync::Arc::new(InMemoryEventBus::<StockChanged>::new());
        let subscription = bus.subscribe();
        let sink = BusSink::new(bus.clone());

        let changed = event();
        let other_tenant = event();
        sink.publish(&changed).unwrap();
        sink.publish(&other_tenant).unwrap();

        assert_eq!(subscription.drain_for(changed.tenant_id), vec![changed]);
    }

    struct ClosedBus;

    impl EventBus<StockChanged> for ClosedBus {
        type Error = &'static str;

        fn publish(&self, _message: StockChanged) -> Result<(), Self::Error> {
            Err("closed")
        }

        fn subscribe(&self) -> stockledger_events::Subscription<StockChanged> {
            stockledger_events::Subscription::new(std::sync::mpsc::channel().1)
        }
    }

    #[test]
    fn bus_failures_name_the_event_schema() {
        let err = BusSink::new(ClosedBus).publish(&event()).unwrap_err();
        assert_eq!(err, PublishError("inventory.stock.changed.v1: \"closed\"".to_string()));
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        let (a, b) = (event(), event());
        sink.publish(&a).unwrap();
        sink.publish(&b).unwrap();
        assert_eq!(sink.events(), vec![a, b]);
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{ItemId, TenantId, WarehouseId};
use stockledger_events::{Event, TenantScoped};

use crate::transaction::{TransactionId, TransactionKind};

/// Integration event: a committed transaction changed a stock balance.
///
/// Emitted after commit only; consumers may see it more than once and must not
/// treat its absence as a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChanged {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub old_quantity: Decimal,
    pub new_quantity: Decimal,
    pub transaction_kind: TransactionKind,
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

impl Event for StockChanged {
    fn event_type(&self) -> &'static str {
        "inventory.stock.changed"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

impl TenantScoped for StockChanged {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

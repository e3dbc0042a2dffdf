//! Balance vs. ledger reconciliation (read-only audit queries).

use rust_decimal::Decimal;

use stockledger_core::TenantId;
use stockledger_inventory::{BalanceKey, replay};

/// Stored balance of one key next to what its logs add up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub tenant_id: TenantId,
    pub key: BalanceKey,
    /// Stored on-hand quantity; zero when the row does not exist.
    pub balance: Decimal,
    pub transaction_sum: Decimal,
    pub movement_sum: Decimal,
    pub transaction_count: usize,
}

impl Reconciliation {
    /// Balance, transaction log and movement log all agree.
    pub fn is_consistent(&self) -> bool {
        self.balance == self.transaction_sum && self.balance == self.movement_sum
    }

    pub fn drift(&self) -> Decimal {
        self.balance - self.transaction_sum
    }
}

pub(crate) fn reconcile_key(
    tenant_id: TenantId,
    key: BalanceKey,
    balance: Decimal,
    transactions: &[stockledger_inventory::Transaction],
    movements: &[stockledger_inventory::Movement],
) -> Reconciliation {
    Reconciliation {
        tenant_id,
        key,
        balance,
        transaction_sum: replay(transactions),
        movement_sum: movements.iter().map(|m| m.signed_quantity()).sum(),
        transaction_count: transactions.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_core::{ItemId, WarehouseId};

    #[test]
    fn empty_logs_reconcile_with_zero_balance() {
        let key = BalanceKey::new(WarehouseId::generate(), ItemId::generate());
        let rec = reconcile_key(TenantId::new(), key, dec!(0), &[], &[]);
        assert!(rec.is_consistent());
        assert_eq!(rec.transaction_count, 0);
    }

    #[test]
    fn drift_is_reported() {
        let key = BalanceKey::new(WarehouseId::generate(), ItemId::generate());
        let rec = reconcile_key(TenantId::new(), key, dec!(3), &[], &[]);
        assert!(!rec.is_consistent());
        assert_eq!(rec.drift(), dec!(3));
    }
}

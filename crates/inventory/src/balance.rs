use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DomainError, ItemId, TenantId, WarehouseId};

use crate::transaction::Direction;

/// Key of a stock balance row: one row per (warehouse, item) within a tenant.
///
/// Ordered by warehouse, then item. Callers that lock several rows lock them in
/// this order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub warehouse_id: WarehouseId,
    pub item_id: ItemId,
}

impl BalanceKey {
    pub fn new(warehouse_id: WarehouseId, item_id: ItemId) -> Self {
        Self {
            warehouse_id,
            item_id,
        }
    }
}

impl core::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.warehouse_id, self.item_id)
    }
}

/// A decrease (or reservation) that does not fit into what is on hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub requested: Decimal,
    pub available: Decimal,
}

/// Why a movement cannot be applied to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementRejection {
    /// The decrease is larger than what is on hand.
    Shortfall(Shortfall),
    /// The increase would take the balance past the decimal range.
    Overflow { on_hand: Decimal, incoming: Decimal },
}

/// On-hand and reserved quantity of one item in one warehouse.
///
/// Invariants: `quantity >= 0` and `0 <= reserved <= quantity`.
///
/// `version` is the row version as read from the store. Version 0 means the
/// row has never been persisted (lazily created on first movement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    tenant_id: TenantId,
    key: BalanceKey,
    quantity: Decimal,
    reserved: Decimal,
    version: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl StockBalance {
    /// A not-yet-persisted zero balance.
    pub fn empty(tenant_id: TenantId, key: BalanceKey) -> Self {
        Self {
            tenant_id,
            key,
            quantity: Decimal::ZERO,
            reserved: Decimal::ZERO,
            version: 0,
            updated_at: None,
        }
    }

    /// Rebuild a row loaded from storage.
    pub fn restore(
        tenant_id: TenantId,
        key: BalanceKey,
        quantity: Decimal,
        reserved: Decimal,
        version: u64,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<Self, DomainError> {
        if quantity < Decimal::ZERO {
            return Err(DomainError::invariant(format!(
                "stored balance {key} is negative ({quantity})"
            )));
        }
        if reserved < Decimal::ZERO || reserved > quantity {
            return Err(DomainError::invariant(format!(
                "stored reservation {reserved} out of range for balance {key} ({quantity})"
            )));
        }
        Ok(Self {
            tenant_id,
            key,
            quantity,
            reserved,
            version,
            updated_at,
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn key(&self) -> BalanceKey {
        self.key
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn reserved(&self) -> Decimal {
        self.reserved
    }

    /// On hand minus reserved.
    pub fn available(&self) -> Decimal {
        self.quantity - self.reserved
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Compute the balance after moving `magnitude` units in `direction`.
    ///
    /// The receiver is left untouched; the returned row keeps the version it
    /// was read at (the store bumps it on write). A decrease that would leave
    /// the balance negative is rejected, and so is an increase past the
    /// decimal range. A decrease that dips below the
    /// reserved amount shrinks the reservation to what is left on hand.
    pub fn after_movement(
        &self,
        direction: Direction,
        magnitude: Decimal,
        at: DateTime<Utc>,
    ) -> Result<StockBalance, MovementRejection> {
        let magnitude = magnitude.abs();
        let quantity = match direction {
            Direction::In => self.quantity.checked_add(magnitude).ok_or(
                MovementRejection::Overflow {
                    on_hand: self.quantity,
                    incoming: magnitude,
                },
            )?,
            Direction::Out => {
                if magnitude > self.quantity {
                    return Err(MovementRejection::Shortfall(Shortfall {
                        requested: magnitude,
                        available: self.quantity,
                    }));
                }
                self.quantity - magnitude
            }
        };

        Ok(StockBalance {
            quantity,
            reserved: self.reserved.min(quantity),
            updated_at: Some(at),
            ..self.clone()
        })
    }

    /// Allocate `amount` of the available stock.
    pub fn reserve(&self, amount: Decimal, at: DateTime<Utc>) -> Result<StockBalance, Shortfall> {
        let amount = amount.abs();
        if amount > self.available() {
            return Err(Shortfall {
                requested: amount,
                available: self.available(),
            });
        }
        // amount <= available, so the sum stays within quantity.
        Ok(StockBalance {
            reserved: self.reserved + amount,
            updated_at: Some(at),
            ..self.clone()
        })
    }

    /// Give back up to `amount` of the reservation. Returns the new row and
    /// the amount actually released.
    pub fn release(&self, amount: Decimal, at: DateTime<Utc>) -> (StockBalance, Decimal) {
        let released = amount.abs().min(self.reserved);
        let next = StockBalance {
            reserved: self.reserved - released,
            updated_at: Some(at),
            ..self.clone()
        };
        (next, released)
    }
}

impl AggregateRoot for StockBalance {
    type Id = BalanceKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn test_key() -> BalanceKey {
        BalanceKey::new(WarehouseId::generate(), ItemId::generate())
    }

    fn balance_with(quantity: Decimal, reserved: Decimal) -> StockBalance {
        StockBalance::restore(TenantId::new(), test_key(), quantity, reserved, 1, None).unwrap()
    }

    #[test]
    fn empty_balance_is_not_persisted() {
        let balance = StockBalance::empty(TenantId::new(), test_key());
        assert_eq!(balance.quantity(), Decimal::ZERO);
        assert!(!balance.is_persisted());
    }

    #[test]
    fn decrease_below_zero_is_rejected() {
        let balance = balance_with(dec!(10), dec!(0));
        let err = balance
            .after_movement(Direction::Out, dec!(11), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            MovementRejection::Shortfall(Shortfall {
                requested: dec!(11),
                available: dec!(10),
            })
        );
    }

    #[test]
    fn increase_past_decimal_range_is_rejected() {
        let balance = balance_with(Decimal::MAX, dec!(0));
        let err = balance
            .after_movement(Direction::In, dec!(1), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            MovementRejection::Overflow {
                on_hand: Decimal::MAX,
                incoming: dec!(1),
            }
        );
    }

    #[test]
    fn decrease_keeps_version_and_clamps_reservation() {
        let balance = balance_with(dec!(10), dec!(8));
        let next = balance
            .after_movement(Direction::Out, dec!(4), Utc::now())
            .unwrap();
        assert_eq!(next.quantity(), dec!(6));
        assert_eq!(next.reserved(), dec!(6));
        assert_eq!(next.version(), 1);
    }

    #[test]
    fn reserve_is_limited_to_available() {
        let balance = balance_with(dec!(10), dec!(7));
        assert!(balance.reserve(dec!(3), Utc::now()).is_ok());
        let err = balance.reserve(dec!(4), Utc::now()).unwrap_err();
        assert_eq!(err.available, dec!(3));
    }

    #[test]
    fn release_never_exceeds_reservation() {
        let balance = balance_with(dec!(10), dec!(2));
        let (next, released) = balance.release(dec!(5), Utc::now());
        assert_eq!(released, dec!(2));
        assert_eq!(next.reserved(), Decimal::ZERO);
    }

    #[test]
    fn restore_rejects_negative_quantity() {
        let err =
            StockBalance::restore(TenantId::new(), test_key(), dec!(-1), dec!(0), 1, None).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of movements is attempted, accepted
        /// movements never leave the balance negative or the reservation
        /// above the quantity.
        #[test]
        fn balance_never_goes_negative(
            moves in prop::collection::vec((any::<bool>(), 1i64..500i64), 1..40),
            reserve in 0i64..100i64,
        ) {
            let mut balance = StockBalance::empty(TenantId::new(), test_key());
            if let Ok(next) = balance.after_movement(Direction::In, Decimal::from(reserve), Utc::now()) {
                balance = next;
            }
            if let Ok(next) = balance.reserve(Decimal::from(reserve), Utc::now()) {
                balance = next;
            }

            for (is_in, amount) in moves {
                let direction = if is_in { Direction::In } else { Direction::Out };
                if let Ok(next) = balance.after_movement(direction, Decimal::from(amount), Utc::now()) {
                    balance = next;
                }
                prop_assert!(balance.quantity() >= Decimal::ZERO);
                prop_assert!(balance.reserved() <= balance.quantity());
            }
        }
    }
}

// =============================================================================
// STOCK LEDGER
// =============================================================================
// Counters for every stock-bearing resource: physical stocks, virtual pools
// and promo code quotas. All three share one discipline:
//
//   reserve  -> reserved += qty            (requires available >= qty)
//   deduct   -> reserved -= qty, sold += qty
//   release  -> reserved -= qty
//
// Invariant: total >= reserved + sold. `total == None` means unbounded.
// =============================================================================

use serde::{ser::SerializeStruct, Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::audit::LogType;

/// Largest quantity accepted on a single line item or ledger call.
pub const MAX_QUANTITY: i32 = 9999;

// -----------------------------------------------------------------------------
// RESOURCE IDENTITY
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Stock,
    VirtualPool,
    PromoCode,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Stock => "stock",
            ResourceKind::VirtualPool => "virtual_pool",
            ResourceKind::PromoCode => "promo_code",
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock" => Ok(ResourceKind::Stock),
            "virtual_pool" => Ok(ResourceKind::VirtualPool),
            "promo_code" => Ok(ResourceKind::PromoCode),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// A ledger-bearing row, addressed by kind and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: i64,
}

impl ResourceRef {
    pub fn stock(id: i64) -> Self {
        Self { kind: ResourceKind::Stock, id }
    }

    pub fn pool(id: i64) -> Self {
        Self { kind: ResourceKind::VirtualPool, id }
    }

    pub fn promo(id: i64) -> Self {
        Self { kind: ResourceKind::PromoCode, id }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.id)
    }
}

// -----------------------------------------------------------------------------
// ERRORS
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient stock: available {available}, requested {requested}")]
    Insufficient { available: i32, requested: i32 },

    #[error("quantity must be between 1 and 9999, got {0}")]
    InvalidQuantity(i32),

    /// The caller asked for something the counters cannot support. Reaching
    /// this means a state machine guard is wrong.
    #[error("ledger invariant violated: {0}")]
    Invariant(String),
}

// -----------------------------------------------------------------------------
// LEDGER
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Ledger {
    pub total: Option<i32>,
    pub reserved: i32,
    pub sold: i32,
}

/// Which counter a ledger operation moved. Mirrors the inventory log types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    Reserve,
    Deduct,
    Release,
    ReturnSold,
    StockIn,
    AdjustTotal,
}

impl LedgerOp {
    pub fn log_type(&self) -> LogType {
        match self {
            LedgerOp::Reserve => LogType::Reserve,
            LedgerOp::Deduct => LogType::Out,
            LedgerOp::Release => LogType::Release,
            LedgerOp::ReturnSold | LedgerOp::AdjustTotal => LogType::Adjust,
            LedgerOp::StockIn => LogType::In,
        }
    }
}

/// Outcome of one successful ledger mutation, ready to be logged.
///
/// `before`/`after` hold the counter the operation targets: `reserved` for
/// reserve and release, `sold` for deduct and sold returns, `total` for
/// stock-in and total adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerChange {
    pub op: LedgerOp,
    pub quantity: i32,
    pub before: i32,
    pub after: i32,
}

impl Ledger {
    pub fn bounded(total: i32) -> Self {
        Self { total: Some(total), reserved: 0, sold: 0 }
    }

    pub fn unbounded() -> Self {
        Self { total: None, reserved: 0, sold: 0 }
    }

    pub fn is_unbounded(&self) -> bool {
        self.total.is_none()
    }

    /// `None` for unbounded resources.
    pub fn available(&self) -> Option<i32> {
        self.total.map(|t| t - self.reserved - self.sold)
    }

    pub fn can_reserve(&self, qty: i32) -> bool {
        self.available().map_or(true, |a| a >= qty)
    }

    pub fn check(&self) -> Result<(), LedgerError> {
        if self.reserved < 0 || self.sold < 0 {
            return Err(LedgerError::Invariant(format!(
                "negative counters: reserved {}, sold {}",
                self.reserved, self.sold
            )));
        }
        if let Some(total) = self.total {
            if total < self.reserved + self.sold {
                return Err(LedgerError::Invariant(format!(
                    "total {} below reserved {} + sold {}",
                    total, self.reserved, self.sold
                )));
            }
        }
        Ok(())
    }

    pub fn reserve(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        validate_quantity(qty)?;
        if let Some(available) = self.available() {
            if available < qty {
                return Err(LedgerError::Insufficient { available, requested: qty });
            }
        }
        let before = self.reserved;
        self.reserved += qty;
        Ok(LedgerChange { op: LedgerOp::Reserve, quantity: qty, before, after: self.reserved })
    }

    pub fn deduct(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        validate_quantity(qty)?;
        if self.reserved < qty {
            return Err(LedgerError::Invariant(format!(
                "deduct {} with only {} reserved",
                qty, self.reserved
            )));
        }
        let before = self.sold;
        self.reserved -= qty;
        self.sold += qty;
        Ok(LedgerChange { op: LedgerOp::Deduct, quantity: qty, before, after: self.sold })
    }

    pub fn release(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        validate_quantity(qty)?;
        if self.reserved < qty {
            return Err(LedgerError::Invariant(format!(
                "release {} with only {} reserved",
                qty, self.reserved
            )));
        }
        let before = self.reserved;
        self.reserved -= qty;
        Ok(LedgerChange { op: LedgerOp::Release, quantity: -qty, before, after: self.reserved })
    }

    /// Reverse a completed sale (refund). Capacity goes back to available.
    pub fn return_sold(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        validate_quantity(qty)?;
        if self.sold < qty {
            return Err(LedgerError::Invariant(format!(
                "return {} with only {} sold",
                qty, self.sold
            )));
        }
        let before = self.sold;
        self.sold -= qty;
        Ok(LedgerChange { op: LedgerOp::ReturnSold, quantity: -qty, before, after: self.sold })
    }

    pub fn stock_in(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        validate_quantity(qty)?;
        let total = self.bounded_total("stock in")?;
        self.total = Some(total + qty);
        Ok(LedgerChange { op: LedgerOp::StockIn, quantity: qty, before: total, after: total + qty })
    }

    /// Correct `total` by a signed delta. Never lets total drop below what is
    /// already reserved or sold.
    pub fn adjust_total(&mut self, delta: i32) -> Result<LedgerChange, LedgerError> {
        if delta == 0 || delta.abs() > MAX_QUANTITY {
            return Err(LedgerError::InvalidQuantity(delta));
        }
        let total = self.bounded_total("adjust")?;
        let next = total + delta;
        if next < self.reserved + self.sold {
            return Err(LedgerError::Insufficient {
                available: total - self.reserved - self.sold,
                requested: -delta,
            });
        }
        self.total = Some(next);
        Ok(LedgerChange { op: LedgerOp::AdjustTotal, quantity: delta, before: total, after: next })
    }

    fn bounded_total(&self, what: &str) -> Result<i32, LedgerError> {
        self.total
            .ok_or_else(|| LedgerError::Invariant(format!("{what} on an unbounded resource")))
    }
}

fn validate_quantity(qty: i32) -> Result<(), LedgerError> {
    if (1..=MAX_QUANTITY).contains(&qty) {
        Ok(())
    } else {
        Err(LedgerError::InvalidQuantity(qty))
    }
}

// Admin displays want the derived `available` next to the raw counters.
impl Serialize for Ledger {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Ledger", 5)?;
        s.serialize_field("total", &self.total)?;
        s.serialize_field("reserved", &self.reserved)?;
        s.serialize_field("sold", &self.sold)?;
        s.serialize_field("available", &self.available())?;
        s.serialize_field("unbounded", &self.is_unbounded())?;
        s.end()
    }
}

// =============================================================================
// RESERVABLE CAPABILITY
// =============================================================================
/// Implemented by every resource that carries a [`Ledger`]. Storage backends
/// that hold rows in memory drive the protocol through this trait; the SQL
/// backend expresses the same checks as conditional updates.
pub trait Reservable {
    fn resource(&self) -> ResourceRef;
    fn ledger(&self) -> &Ledger;
    fn ledger_mut(&mut self) -> &mut Ledger;

    /// Extra gate on top of the counters (soft-disabled, expired, ...).
    fn accepts_reservations(&self, _now: chrono::DateTime<chrono::Utc>) -> bool {
        true
    }

    fn reserve(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        self.ledger_mut().reserve(qty)
    }

    fn deduct(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        self.ledger_mut().deduct(qty)
    }

    fn release(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        self.ledger_mut().release(qty)
    }

    fn return_sold(&mut self, qty: i32) -> Result<LedgerChange, LedgerError> {
        self.ledger_mut().return_sold(qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stock;
    use crate::virtual_pool::VirtualPool;
    use crate::promo::PromoCode;
    use proptest::prelude::*;

    #[test]
    fn reserve_respects_available() {
        let mut ledger = Ledger::bounded(3);
        ledger.reserve(2).unwrap();
        let err = ledger.reserve(2).unwrap_err();
        assert_eq!(err, LedgerError::Insufficient { available: 1, requested: 2 });
        assert_eq!(ledger.reserved, 2);
    }

    #[test]
    fn unbounded_always_reserves() {
        let mut ledger = Ledger::unbounded();
        for _ in 0..100 {
            ledger.reserve(MAX_QUANTITY).unwrap();
        }
        assert_eq!(ledger.available(), None);
        assert!(ledger.check().is_ok());
    }

    #[test]
    fn deduct_without_reservation_is_an_invariant_violation() {
        let mut ledger = Ledger::bounded(5);
        assert!(matches!(ledger.deduct(1), Err(LedgerError::Invariant(_))));
        assert!(matches!(ledger.release(1), Err(LedgerError::Invariant(_))));
        assert_eq!(ledger, Ledger::bounded(5));
    }

    #[test]
    fn full_release_and_full_deduct_close_the_books() {
        let mut released = Ledger { total: Some(10), reserved: 1, sold: 2 };
        released.reserve(4).unwrap();
        released.release(4).unwrap();
        assert_eq!(released.reserved, 1);
        assert_eq!(released.sold, 2);

        let mut deducted = Ledger { total: Some(10), reserved: 1, sold: 2 };
        deducted.reserve(4).unwrap();
        let change = deducted.deduct(4).unwrap();
        assert_eq!(deducted.reserved, 1);
        assert_eq!(deducted.sold, 6);
        assert_eq!((change.before, change.after), (2, 6));
    }

    #[test]
    fn return_sold_is_logged_as_adjust() {
        let mut ledger = Ledger { total: Some(5), reserved: 0, sold: 3 };
        let change = ledger.return_sold(2).unwrap();
        assert_eq!(change.op.log_type(), LogType::Adjust);
        assert_eq!(change.quantity, -2);
        assert_eq!(ledger.available(), Some(4));
    }

    #[test]
    fn adjust_total_cannot_undercut_commitments() {
        let mut ledger = Ledger { total: Some(5), reserved: 2, sold: 2 };
        assert!(ledger.adjust_total(-2).is_err());
        ledger.adjust_total(-1).unwrap();
        assert_eq!(ledger.available(), Some(0));
        assert!(matches!(Ledger::unbounded().stock_in(1), Err(LedgerError::Invariant(_))));
    }

    #[test]
    fn rejects_non_positive_quantities() {
        let mut ledger = Ledger::bounded(5);
        assert_eq!(ledger.reserve(0), Err(LedgerError::InvalidQuantity(0)));
        assert_eq!(ledger.reserve(-3), Err(LedgerError::InvalidQuantity(-3)));
    }

    // -------------------------------------------------------------------------
    // No-oversell, checked once against every Reservable implementation
    // -------------------------------------------------------------------------

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(i32),
        Deduct,
        Release,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1..4i32).prop_map(Op::Reserve),
            Just(Op::Deduct),
            Just(Op::Release),
        ]
    }

    /// Interleaves many callers' operations against one resource. Each caller
    /// only deducts or releases what it successfully reserved.
    fn assert_never_oversold<R: Reservable>(resource: &mut R, total: i32, script: &[(usize, Op)]) {
        let mut held = vec![0i32; 8];
        let mut granted = 0;
        for (caller, op) in script {
            let slot = caller % held.len();
            match op {
                Op::Reserve(qty) => {
                    if resource.reserve(*qty).is_ok() {
                        held[slot] += qty;
                        granted += qty;
                    }
                }
                Op::Deduct if held[slot] > 0 => {
                    resource.deduct(held[slot]).unwrap();
                    held[slot] = 0;
                }
                Op::Release if held[slot] > 0 => {
                    resource.release(held[slot]).unwrap();
                    granted -= held[slot];
                    held[slot] = 0;
                }
                _ => {}
            }
            let ledger = resource.ledger();
            assert!(ledger.check().is_ok(), "{ledger:?}");
            assert!(granted <= total, "granted {granted} of {total}");
            assert_eq!(ledger.reserved, held.iter().sum::<i32>());
        }
    }

    proptest! {
        #[test]
        fn stock_never_oversells(total in 1..6i32, script in prop::collection::vec((0..8usize, op_strategy()), 1..80)) {
            let mut stock = Stock::for_tests(1, "SKU-P", total);
            assert_never_oversold(&mut stock, total, &script);
        }

        #[test]
        fn virtual_pool_never_oversells(total in 1..6i32, script in prop::collection::vec((0..8usize, op_strategy()), 1..80)) {
            let mut pool = VirtualPool::for_tests(1, total);
            assert_never_oversold(&mut pool, total, &script);
        }

        #[test]
        fn promo_quota_never_oversells(total in 1..6i32, script in prop::collection::vec((0..8usize, op_strategy()), 1..80)) {
            let mut promo = PromoCode::for_tests("LIMITED", total);
            assert_never_oversold(&mut promo, total, &script);
        }
    }
}

// =============================================================================
// STORAGE SEAM
// =============================================================================
// Every method is one atomic unit. Composite operations (create an order with
// all its claims, apply a transition with its ledger effects) either commit
// completely or leave no trace, so callers never hold a lock across calls.
//
// Two backends implement this trait: `db::Database` (PostgreSQL) and
// `memory::MemoryStore`.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};

use crate::audit::{EventDetails, InventoryLogEntry, LogContext, LogQuery, OrderEvent};
use crate::error::AppResult;
use crate::ledger::ResourceRef;
use crate::models::{NewProduct, NewStock, Product, Stock, User};
use crate::order::{LedgerEffect, Order, OrderStatus, Trigger};
use crate::permissions::AdminPermissions;
use crate::promo::{NewPromoCode, PromoCode};
use crate::serial::{NewSerials, Serial};
use crate::virtual_pool::{AllocationPolicy, ImportedItem, ItemStatus, PoolStats, VirtualPool, VirtualStockItem};

/// One resource an order needs at creation.
#[derive(Debug, Clone)]
pub struct Claim {
    /// `None` for the promo code claim.
    pub line_index: Option<i32>,
    pub product_id: Option<i64>,
    pub resource: ResourceRef,
    pub quantity: i32,
    pub auto_delivery: bool,
    /// Item selection order for virtual pools.
    pub policy: AllocationPolicy,
}

/// A fully prepared order row plus the claims to reserve with it. `order.id`
/// and `order.reservations` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order: Order,
    pub claims: Vec<Claim>,
}

/// Compare-and-swap of an order row plus the ledger effect its transition
/// carries.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub order_no: String,
    /// Applied only if the row still has this status...
    pub expected_status: OrderStatus,
    /// ...and has not been written since it was read.
    pub expected_updated_at: DateTime<Utc>,
    /// The new row. Reservations on it are ignored; the store derives them
    /// from `effect`.
    pub updated: Order,
    pub trigger: Trigger,
    pub effect: LedgerEffect,
    /// Event payload; defaults to the ledger counts when `None`.
    pub details: Option<EventDetails>,
    pub ctx: LogContext,
}

/// Virtual items handed over by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub line_index: Option<i32>,
    pub product_id: Option<i64>,
    pub item_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectCounts {
    pub deducted: usize,
    pub released: usize,
    pub returned: usize,
}

impl EffectCounts {
    pub fn details(&self, delivered_items: usize) -> EventDetails {
        EventDetails::Ledger {
            deducted: self.deducted,
            released: self.released,
            returned: self.returned,
            delivered_items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub order: Order,
    pub delivered: Vec<Delivery>,
    pub counts: EffectCounts,
}

#[derive(Debug, Clone)]
pub enum TransitionResult {
    Applied(TransitionOutcome),
    /// The row moved on since it was read; carries the current row.
    Stale(Order),
}

/// Strictly increasing row version at the microsecond precision PostgreSQL
/// stores, so a version read back always equals the one written.
pub fn next_version(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // ----- physical stock -----
    async fn create_stock(&self, new: NewStock, ctx: &LogContext) -> AppResult<Stock>;
    async fn get_stock(&self, id: i64) -> AppResult<Option<Stock>>;
    /// Page is 1-based. Returns the page and the total row count.
    async fn list_stocks(&self, page: i32, per_page: i32) -> AppResult<(Vec<Stock>, i64)>;
    async fn low_stock_stocks(&self) -> AppResult<Vec<Stock>>;
    async fn stock_in(&self, id: i64, quantity: i32, ctx: &LogContext) -> AppResult<Stock>;
    async fn adjust_stock(&self, id: i64, delta: i32, ctx: &LogContext) -> AppResult<Stock>;

    // ----- virtual pools -----
    async fn create_pool(&self, name: &str) -> AppResult<VirtualPool>;
    async fn get_pool(&self, id: i64) -> AppResult<Option<(VirtualPool, PoolStats)>>;
    async fn import_items(
        &self,
        pool_id: i64,
        items: Vec<ImportedItem>,
        batch_no: &str,
        ctx: &LogContext,
    ) -> AppResult<VirtualPool>;
    async fn list_items(&self, pool_id: i64, status: Option<ItemStatus>) -> AppResult<Vec<VirtualStockItem>>;
    /// `available -> invalid`; the pool loses one unit of `total`.
    async fn invalidate_item(&self, item_id: i64, ctx: &LogContext) -> AppResult<VirtualStockItem>;

    // ----- catalog -----
    async fn create_product(&self, new: NewProduct) -> AppResult<Product>;
    async fn product_by_sku(&self, sku: &str) -> AppResult<Option<Product>>;
    async fn product_by_id(&self, id: i64) -> AppResult<Option<Product>>;
    async fn create_promo(&self, new: NewPromoCode) -> AppResult<PromoCode>;
    /// `code` is already normalized.
    async fn promo_by_code(&self, code: &str) -> AppResult<Option<PromoCode>>;

    // ----- orders -----
    /// Insert the order and reserve every claim, or nothing at all.
    async fn create_order(&self, new: NewOrder, ctx: &LogContext) -> AppResult<Order>;
    async fn order_by_no(&self, order_no: &str) -> AppResult<Option<Order>>;
    async fn order_by_form_token(&self, token: &str) -> AppResult<Option<Order>>;
    async fn apply_transition(&self, req: TransitionRequest) -> AppResult<TransitionResult>;
    /// Order numbers still awaiting payment that were created before `cutoff`.
    async fn stale_pending_payment(&self, cutoff: DateTime<Utc>, limit: i64) -> AppResult<Vec<String>>;
    async fn order_events(&self, order_id: i64) -> AppResult<Vec<OrderEvent>>;
    /// Sold virtual items of an order, in delivery order.
    async fn delivered_items(&self, order_id: i64) -> AppResult<Vec<VirtualStockItem>>;

    // ----- users & permissions -----
    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>>;
    /// Returns the existing user and `false` when the email is taken.
    async fn create_user(&self, email: &str, password_hash: &str) -> AppResult<(User, bool)>;
    async fn admin_permissions(&self, user_id: i64) -> AppResult<Option<AdminPermissions>>;
    async fn upsert_admin_permissions(&self, perms: AdminPermissions) -> AppResult<AdminPermissions>;

    // ----- serials -----
    /// Allocates consecutive per-product sequence numbers.
    async fn issue_serials(&self, req: NewSerials) -> AppResult<Vec<Serial>>;
    async fn serials_for_order(&self, order_id: i64) -> AppResult<Vec<Serial>>;
    /// Counts a view and returns the updated serial.
    async fn verify_serial(&self, serial_number: &str) -> AppResult<Option<Serial>>;

    // ----- audit -----
    async fn inventory_logs(&self, query: &LogQuery) -> AppResult<Vec<InventoryLogEntry>>;

    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn version_always_moves_forward() {
        let read = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(next_version(read, read + Duration::seconds(1)), read + Duration::seconds(1));
        assert_eq!(next_version(read, read), read + Duration::microseconds(1));
        assert_eq!(next_version(read, read - Duration::seconds(5)), read + Duration::microseconds(1));
    }

    #[test]
    fn version_is_stored_at_microsecond_precision() {
        let read = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let now = read + Duration::nanoseconds(2_500_750);
        assert_eq!(next_version(read, now), read + Duration::microseconds(2_500));
    }
}

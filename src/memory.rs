// =============================================================================
// IN-MEMORY STORE
// =============================================================================
// Single-process backend selected with `DATABASE_URL=memory://`. All tables
// sit behind one mutex. A mutating call works on a copy of the tables and
// swaps it in only when every step succeeded, which gives each call the same
// all-or-nothing behaviour as a SQL transaction.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::audit::{
    EventDetails, InventoryLogEntry, LogContext, LogDetails, LogQuery, OrderEvent,
};
use crate::error::{AppError, AppResult};
use crate::ledger::{LedgerChange, Reservable, ResourceKind, ResourceRef};
use crate::models::{NewProduct, NewStock, Product, Stock, User};
use crate::order::{LedgerEffect, Order, OrderStatus, Reservation, ReservationState, Trigger};
use crate::permissions::AdminPermissions;
use crate::promo::{normalize_code, NewPromoCode, PromoCode, PromoError, PromoStatus};
use crate::serial::{anti_counterfeit_code, normalize_serial, serial_number, NewSerials, Serial};
use crate::store::{
    next_version, Claim, Delivery, EffectCounts, NewOrder, Store, TransitionOutcome,
    TransitionRequest, TransitionResult,
};
use crate::virtual_pool::{ImportedItem, ItemStatus, PoolStats, VirtualPool, VirtualStockItem};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tables: Tables,
    logs: Vec<InventoryLogEntry>,
    events: Vec<OrderEvent>,
}

#[derive(Clone, Default)]
struct Tables {
    last_id: i64,
    stocks: BTreeMap<i64, Stock>,
    pools: BTreeMap<i64, VirtualPool>,
    items: BTreeMap<i64, VirtualStockItem>,
    products: BTreeMap<i64, Product>,
    serial_seq: HashMap<i64, i64>,
    promos: BTreeMap<i64, PromoCode>,
    users: BTreeMap<i64, User>,
    admins: HashMap<i64, AdminPermissions>,
    orders: BTreeMap<i64, Order>,
    serials: BTreeMap<i64, Serial>,
}

/// Append-only records produced by one call, kept out of the table copy.
#[derive(Default)]
struct Journal {
    logs: Vec<InventoryLogEntry>,
    events: Vec<OrderEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn atomic<T>(&self, f: impl FnOnce(&mut Tables, &mut Journal) -> AppResult<T>) -> AppResult<T> {
        let mut inner = self.inner.lock();
        let mut draft = inner.tables.clone();
        let mut journal = Journal::default();
        let out = f(&mut draft, &mut journal)?;
        inner.tables = draft;
        inner.commit(journal);
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        f(&self.inner.lock())
    }
}

impl Inner {
    fn commit(&mut self, journal: Journal) {
        for mut entry in journal.logs {
            entry.id = self.logs.len() as i64 + 1;
            self.logs.push(entry);
        }
        for mut event in journal.events {
            event.id = self.events.len() as i64 + 1;
            self.events.push(event);
        }
    }
}

fn not_found(what: impl std::fmt::Display) -> AppError {
    AppError::NotFound(format!("{what} not found"))
}

// =============================================================================
// TABLE OPERATIONS
// =============================================================================

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn reservable(&mut self, resource: ResourceRef) -> AppResult<&mut dyn Reservable> {
        let found: Option<&mut dyn Reservable> = match resource.kind {
            ResourceKind::Stock => self.stocks.get_mut(&resource.id).map(|s| s as &mut dyn Reservable),
            ResourceKind::VirtualPool => self.pools.get_mut(&resource.id).map(|p| p as &mut dyn Reservable),
            ResourceKind::PromoCode => self.promos.get_mut(&resource.id).map(|p| p as &mut dyn Reservable),
        };
        found.ok_or_else(|| not_found(resource))
    }

    /// Run one ledger operation and re-check the counters afterwards.
    fn ledger_op(
        &mut self,
        resource: ResourceRef,
        op: impl FnOnce(&mut dyn Reservable) -> Result<LedgerChange, crate::ledger::LedgerError>,
    ) -> AppResult<LedgerChange> {
        let target = self.reservable(resource)?;
        let change = op(&mut *target).map_err(|e| AppError::from_ledger(resource, e))?;
        target
            .ledger()
            .check()
            .map_err(|e| AppError::from_ledger(resource, e))?;
        Ok(change)
    }

    fn order_id_by_no(&self, order_no: &str) -> Option<i64> {
        self.orders.values().find(|o| o.order_no == order_no).map(|o| o.id)
    }

    fn pool_items(&self, pool_id: i64) -> impl Iterator<Item = &VirtualStockItem> {
        self.items.values().filter(move |i| i.pool_id == pool_id)
    }

    // -------------------------------------------------------------------------
    // Reservation protocol
    // -------------------------------------------------------------------------

    fn reserve_claim(
        &mut self,
        claim: &Claim,
        order_id: i64,
        order_no: &str,
        now: DateTime<Utc>,
        ctx: &LogContext,
        journal: &mut Journal,
    ) -> AppResult<Reservation> {
        let resource = claim.resource;
        let target = self.reservable(resource)?;
        if !target.accepts_reservations(now) {
            return Err(match resource.kind {
                ResourceKind::PromoCode => AppError::Promo(PromoError::Inactive),
                _ => AppError::InsufficientStock { resource, available: 0, requested: claim.quantity },
            });
        }

        let change = self.ledger_op(resource, |r| r.reserve(claim.quantity))?;

        let mut item_ids = Vec::new();
        if resource.kind == ResourceKind::VirtualPool {
            let mut candidates: Vec<&VirtualStockItem> = self
                .pool_items(resource.id)
                .filter(|i| i.status == ItemStatus::Available)
                .collect();
            claim.policy.arrange(&mut candidates, &mut rand::thread_rng());
            item_ids = candidates
                .into_iter()
                .take(claim.quantity as usize)
                .map(|i| i.id)
                .collect();
            if item_ids.len() < claim.quantity as usize {
                return Err(AppError::InvariantViolation(format!(
                    "{resource}: ledger allows {} but only {} items are available",
                    claim.quantity,
                    item_ids.len()
                )));
            }
            for id in &item_ids {
                if let Some(item) = self.items.get_mut(id) {
                    item.bind(order_id, order_no, now);
                }
            }
        }

        journal.logs.push(InventoryLogEntry::from_change(
            resource,
            &change,
            ctx,
            LogDetails::OrderClaim {
                line_index: claim.line_index,
                product_id: claim.product_id,
                item_ids: item_ids.clone(),
            },
        ));

        Ok(Reservation {
            id: self.next_id(),
            line_index: claim.line_index,
            product_id: claim.product_id,
            resource,
            quantity: claim.quantity,
            auto_delivery: claim.auto_delivery,
            state: ReservationState::Reserved,
            item_ids,
        })
    }

    fn apply_effect(
        &mut self,
        order: &mut Order,
        effect: LedgerEffect,
        now: DateTime<Utc>,
        ctx: &LogContext,
        journal: &mut Journal,
    ) -> AppResult<(EffectCounts, Vec<Delivery>)> {
        let mut counts = EffectCounts::default();
        let mut delivered = Vec::new();

        for claim in order.reservations.iter_mut() {
            match effect {
                LedgerEffect::None => {}
                LedgerEffect::Deduct(scope) => {
                    if claim.deductible_under(scope) {
                        self.deduct_claim(claim, now, ctx, journal, &mut delivered)?;
                        counts.deducted += 1;
                    }
                }
                LedgerEffect::Release => {
                    if claim.state == ReservationState::Reserved {
                        self.release_claim(claim, ctx, journal)?;
                        counts.released += 1;
                    }
                }
                LedgerEffect::Refund => match claim.state {
                    ReservationState::Reserved => {
                        self.release_claim(claim, ctx, journal)?;
                        counts.released += 1;
                    }
                    ReservationState::Deducted => {
                        self.return_claim(claim, now, ctx, journal)?;
                        counts.returned += 1;
                    }
                    ReservationState::Released | ReservationState::Returned => {}
                },
            }
        }

        Ok((counts, delivered))
    }

    fn deduct_claim(
        &mut self,
        claim: &mut Reservation,
        now: DateTime<Utc>,
        ctx: &LogContext,
        journal: &mut Journal,
        delivered: &mut Vec<Delivery>,
    ) -> AppResult<()> {
        let change = self.ledger_op(claim.resource, |r| r.deduct(claim.quantity))?;
        if claim.is_virtual() {
            for id in &claim.item_ids {
                let item = self.items.get_mut(id).ok_or_else(|| not_found(format!("item {id}")))?;
                if item.status != ItemStatus::Reserved {
                    return Err(AppError::InvariantViolation(format!(
                        "item {id} is {} at delivery",
                        item.status.as_str()
                    )));
                }
                item.deliver(now);
            }
            delivered.push(Delivery {
                line_index: claim.line_index,
                product_id: claim.product_id,
                item_ids: claim.item_ids.clone(),
            });
        }
        claim.state = ReservationState::Deducted;
        journal.logs.push(InventoryLogEntry::from_change(
            claim.resource,
            &change,
            ctx,
            LogDetails::OrderClaim {
                line_index: claim.line_index,
                product_id: claim.product_id,
                item_ids: claim.item_ids.clone(),
            },
        ));
        Ok(())
    }

    fn release_claim(&mut self, claim: &mut Reservation, ctx: &LogContext, journal: &mut Journal) -> AppResult<()> {
        let change = self.ledger_op(claim.resource, |r| r.release(claim.quantity))?;
        for id in &claim.item_ids {
            if let Some(item) = self.items.get_mut(id) {
                item.unbind();
            }
        }
        claim.state = ReservationState::Released;
        journal.logs.push(InventoryLogEntry::from_change(
            claim.resource,
            &change,
            ctx,
            LogDetails::OrderClaim {
                line_index: claim.line_index,
                product_id: claim.product_id,
                item_ids: claim.item_ids.clone(),
            },
        ));
        Ok(())
    }

    fn return_claim(
        &mut self,
        claim: &mut Reservation,
        now: DateTime<Utc>,
        ctx: &LogContext,
        journal: &mut Journal,
    ) -> AppResult<()> {
        let change = self.ledger_op(claim.resource, |r| r.return_sold(claim.quantity))?;
        for id in &claim.item_ids {
            if let Some(item) = self.items.get_mut(id) {
                item.invalidate(now);
            }
        }
        claim.state = ReservationState::Returned;
        journal.logs.push(InventoryLogEntry::from_change(
            claim.resource,
            &change,
            ctx,
            LogDetails::Refund {
                line_index: claim.line_index,
                invalidated_item_ids: claim.item_ids.clone(),
            },
        ));
        Ok(())
    }
}

fn order_event(
    order: &Order,
    trigger: Option<Trigger>,
    from_status: Option<OrderStatus>,
    ctx: &LogContext,
    details: EventDetails,
    now: DateTime<Utc>,
) -> OrderEvent {
    OrderEvent {
        id: 0,
        order_id: order.id,
        order_no: order.order_no.clone(),
        trigger,
        from_status,
        to_status: order.status,
        operator: ctx.operator.clone(),
        details,
        created_at: now,
    }
}

// =============================================================================
// STORE IMPLEMENTATION
// =============================================================================

#[async_trait]
impl Store for MemoryStore {
    // -------------------------------------------------------------------------
    // Physical stock
    // -------------------------------------------------------------------------

    async fn create_stock(&self, new: NewStock, ctx: &LogContext) -> AppResult<Stock> {
        self.atomic(|t, j| {
            if t.stocks.values().any(|s| s.sku == new.sku) {
                return Err(AppError::validation("sku", "already exists"));
            }
            let now = Utc::now();
            let id = t.next_id();
            let mut stock = Stock {
                id,
                sku: new.sku,
                name: new.name,
                ledger: crate::ledger::Ledger::bounded(0),
                warehouse: new.warehouse,
                low_stock_threshold: new.low_stock_threshold,
                active: true,
                created_at: now,
                updated_at: now,
            };
            if new.total > 0 {
                let change = stock
                    .ledger
                    .stock_in(new.total)
                    .map_err(|e| AppError::from_ledger(stock.resource(), e))?;
                j.logs.push(InventoryLogEntry::from_change(stock.resource(), &change, ctx, LogDetails::Restock));
            }
            t.stocks.insert(id, stock.clone());
            Ok(stock)
        })
    }

    async fn get_stock(&self, id: i64) -> AppResult<Option<Stock>> {
        Ok(self.read(|i| i.tables.stocks.get(&id).cloned()))
    }

    async fn list_stocks(&self, page: i32, per_page: i32) -> AppResult<(Vec<Stock>, i64)> {
        let offset = ((page.max(1) - 1) * per_page) as usize;
        Ok(self.read(|i| {
            let page = i
                .tables
                .stocks
                .values()
                .skip(offset)
                .take(per_page as usize)
                .cloned()
                .collect();
            (page, i.tables.stocks.len() as i64)
        }))
    }

    async fn low_stock_stocks(&self) -> AppResult<Vec<Stock>> {
        Ok(self.read(|i| {
            i.tables
                .stocks
                .values()
                .filter(|s| s.active && s.is_low_stock())
                .cloned()
                .collect()
        }))
    }

    async fn stock_in(&self, id: i64, quantity: i32, ctx: &LogContext) -> AppResult<Stock> {
        self.atomic(|t, j| {
            let resource = ResourceRef::stock(id);
            let stock = t.stocks.get_mut(&id).ok_or_else(|| not_found(resource))?;
            let change = stock.ledger.stock_in(quantity).map_err(|e| AppError::from_ledger(resource, e))?;
            stock.updated_at = Utc::now();
            j.logs.push(InventoryLogEntry::from_change(resource, &change, ctx, LogDetails::Restock));
            Ok(stock.clone())
        })
    }

    async fn adjust_stock(&self, id: i64, delta: i32, ctx: &LogContext) -> AppResult<Stock> {
        self.atomic(|t, j| {
            let resource = ResourceRef::stock(id);
            let stock = t.stocks.get_mut(&id).ok_or_else(|| not_found(resource))?;
            let change = stock.ledger.adjust_total(delta).map_err(|e| AppError::from_ledger(resource, e))?;
            stock.updated_at = Utc::now();
            j.logs.push(InventoryLogEntry::from_change(resource, &change, ctx, LogDetails::Correction));
            Ok(stock.clone())
        })
    }

    // -------------------------------------------------------------------------
    // Virtual pools
    // -------------------------------------------------------------------------

    async fn create_pool(&self, name: &str) -> AppResult<VirtualPool> {
        self.atomic(|t, _| {
            let now = Utc::now();
            let pool = VirtualPool {
                id: t.next_id(),
                name: name.to_string(),
                ledger: crate::ledger::Ledger::bounded(0),
                active: true,
                created_at: now,
                updated_at: now,
            };
            t.pools.insert(pool.id, pool.clone());
            Ok(pool)
        })
    }

    async fn get_pool(&self, id: i64) -> AppResult<Option<(VirtualPool, PoolStats)>> {
        Ok(self.read(|i| {
            i.tables
                .pools
                .get(&id)
                .map(|pool| (pool.clone(), PoolStats::tally(i.tables.pool_items(id))))
        }))
    }

    async fn import_items(
        &self,
        pool_id: i64,
        items: Vec<ImportedItem>,
        batch_no: &str,
        ctx: &LogContext,
    ) -> AppResult<VirtualPool> {
        self.atomic(|t, j| {
            let resource = ResourceRef::pool(pool_id);
            let count = items.len() as i32;
            let pool = t.pools.get_mut(&pool_id).ok_or_else(|| not_found(resource))?;
            let change = pool.ledger.stock_in(count).map_err(|e| AppError::from_ledger(resource, e))?;
            let now = Utc::now();
            pool.updated_at = now;
            let pool = pool.clone();

            for imported in items {
                let id = t.next_id();
                t.items.insert(
                    id,
                    VirtualStockItem {
                        id,
                        pool_id,
                        content: imported.content,
                        remark: imported.remark,
                        status: ItemStatus::Available,
                        order_id: None,
                        order_no: None,
                        batch_no: batch_no.to_string(),
                        created_at: now,
                        reserved_at: None,
                        sold_at: None,
                        invalidated_at: None,
                    },
                );
            }
            j.logs.push(InventoryLogEntry::from_change(
                resource,
                &change,
                ctx,
                LogDetails::Import { batch_no: batch_no.to_string(), count },
            ));
            Ok(pool)
        })
    }

    async fn list_items(&self, pool_id: i64, status: Option<ItemStatus>) -> AppResult<Vec<VirtualStockItem>> {
        Ok(self.read(|i| {
            i.tables
                .pool_items(pool_id)
                .filter(|item| status.map_or(true, |s| item.status == s))
                .cloned()
                .collect()
        }))
    }

    async fn invalidate_item(&self, item_id: i64, ctx: &LogContext) -> AppResult<VirtualStockItem> {
        self.atomic(|t, j| {
            let item = t.items.get(&item_id).ok_or_else(|| not_found(format!("item {item_id}")))?;
            if item.status != ItemStatus::Available {
                return Err(AppError::BadRequest(format!(
                    "item {item_id} is {}; only available items can be invalidated",
                    item.status.as_str()
                )));
            }
            let resource = ResourceRef::pool(item.pool_id);
            let pool = t.pools.get_mut(&item.pool_id).ok_or_else(|| not_found(resource))?;
            let change = pool.ledger.adjust_total(-1).map_err(|e| AppError::from_ledger(resource, e))?;
            let now = Utc::now();
            pool.updated_at = now;

            let item = t.items.get_mut(&item_id).ok_or_else(|| not_found(format!("item {item_id}")))?;
            item.invalidate(now);
            j.logs.push(InventoryLogEntry::from_change(
                resource,
                &change,
                ctx,
                LogDetails::Invalidation { item_id },
            ));
            Ok(item.clone())
        })
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    async fn create_product(&self, new: NewProduct) -> AppResult<Product> {
        self.atomic(|t, _| {
            if t.products.values().any(|p| p.sku == new.sku) {
                return Err(AppError::validation("sku", "already exists"));
            }
            if let Some(stock_id) = new.stock_id.filter(|id| !t.stocks.contains_key(id)) {
                return Err(AppError::validation("stock_id", format!("stock {stock_id} does not exist")));
            }
            if let Some(pool_id) = new.pool_id.filter(|id| !t.pools.contains_key(id)) {
                return Err(AppError::validation("pool_id", format!("pool {pool_id} does not exist")));
            }
            let product = Product {
                id: t.next_id(),
                sku: new.sku,
                name: new.name,
                price: new.price,
                product_type: new.product_type,
                stock_id: new.stock_id,
                pool_id: new.pool_id,
                auto_delivery: new.auto_delivery,
                product_code: new.product_code,
                active: true,
                created_at: Utc::now(),
            };
            t.products.insert(product.id, product.clone());
            Ok(product)
        })
    }

    async fn product_by_sku(&self, sku: &str) -> AppResult<Option<Product>> {
        Ok(self.read(|i| i.tables.products.values().find(|p| p.sku == sku).cloned()))
    }

    async fn product_by_id(&self, id: i64) -> AppResult<Option<Product>> {
        Ok(self.read(|i| i.tables.products.get(&id).cloned()))
    }

    async fn create_promo(&self, new: NewPromoCode) -> AppResult<PromoCode> {
        self.atomic(|t, _| {
            let code = normalize_code(&new.code);
            if t.promos.values().any(|p| p.code == code) {
                return Err(AppError::validation("code", "already exists"));
            }
            let now = Utc::now();
            let promo = PromoCode {
                id: t.next_id(),
                code,
                description: new.description.clone(),
                discount_type: new.discount_type,
                discount_value: new.discount_value,
                min_order_amount: new.min_order_amount,
                max_discount: new.max_discount,
                ledger: new.ledger(),
                status: PromoStatus::Active,
                expires_at: new.expires_at,
                product_scope: new.product_scope,
                product_ids: new.product_ids.clone(),
                created_at: now,
                updated_at: now,
            };
            t.promos.insert(promo.id, promo.clone());
            Ok(promo)
        })
    }

    async fn promo_by_code(&self, code: &str) -> AppResult<Option<PromoCode>> {
        Ok(self.read(|i| i.tables.promos.values().find(|p| p.code == code).cloned()))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    async fn create_order(&self, new: NewOrder, ctx: &LogContext) -> AppResult<Order> {
        self.atomic(|t, j| {
            let NewOrder { mut order, claims } = new;
            if t.order_id_by_no(&order.order_no).is_some() {
                return Err(AppError::Internal(format!("duplicate order number {}", order.order_no)));
            }
            let now = Utc::now();
            order.id = t.next_id();
            order.reservations.clear();
            for claim in &claims {
                let reservation = t.reserve_claim(claim, order.id, &order.order_no, now, ctx, j)?;
                order.reservations.push(reservation);
            }

            j.events.push(order_event(
                &order,
                None,
                None,
                ctx,
                EventDetails::Created { reservations: order.reservations.len() },
                now,
            ));
            t.orders.insert(order.id, order.clone());
            Ok(order)
        })
    }

    async fn order_by_no(&self, order_no: &str) -> AppResult<Option<Order>> {
        Ok(self.read(|i| i.tables.orders.values().find(|o| o.order_no == order_no).cloned()))
    }

    async fn order_by_form_token(&self, token: &str) -> AppResult<Option<Order>> {
        Ok(self.read(|i| {
            i.tables
                .orders
                .values()
                .find(|o| o.form_token.as_deref() == Some(token))
                .cloned()
        }))
    }

    async fn apply_transition(&self, req: TransitionRequest) -> AppResult<TransitionResult> {
        self.atomic(|t, j| {
            let id = t.order_id_by_no(&req.order_no).ok_or_else(|| not_found(format!("order {}", req.order_no)))?;
            let current = t.orders.get(&id).cloned().ok_or_else(|| not_found(format!("order {}", req.order_no)))?;
            if current.status != req.expected_status || current.updated_at != req.expected_updated_at {
                return Ok(TransitionResult::Stale(current));
            }

            let now = Utc::now();
            let mut order = req.updated;
            order.id = current.id;
            order.order_no = current.order_no.clone();
            order.created_at = current.created_at;
            order.reservations = current.reservations.clone();
            order.updated_at = next_version(current.updated_at, now);

            let (counts, delivered) = t.apply_effect(&mut order, req.effect, now, &req.ctx, j)?;
            let delivered_items = delivered.iter().map(|d| d.item_ids.len()).sum();
            let details = req.details.unwrap_or_else(|| counts.details(delivered_items));
            j.events.push(order_event(&order, Some(req.trigger), Some(current.status), &req.ctx, details, now));

            t.orders.insert(order.id, order.clone());
            Ok(TransitionResult::Applied(TransitionOutcome { order, delivered, counts }))
        })
    }

    async fn stale_pending_payment(&self, cutoff: DateTime<Utc>, limit: i64) -> AppResult<Vec<String>> {
        Ok(self.read(|i| {
            let mut stale: Vec<&Order> = i
                .tables
                .orders
                .values()
                .filter(|o| o.status == OrderStatus::PendingPayment && o.created_at < cutoff)
                .collect();
            stale.sort_by_key(|o| (o.created_at, o.id));
            stale
                .into_iter()
                .take(limit.max(0) as usize)
                .map(|o| o.order_no.clone())
                .collect()
        }))
    }

    async fn order_events(&self, order_id: i64) -> AppResult<Vec<OrderEvent>> {
        Ok(self.read(|i| i.events.iter().filter(|e| e.order_id == order_id).cloned().collect()))
    }

    async fn delivered_items(&self, order_id: i64) -> AppResult<Vec<VirtualStockItem>> {
        Ok(self.read(|i| {
            let mut items: Vec<VirtualStockItem> = i
                .tables
                .items
                .values()
                .filter(|item| item.order_id == Some(order_id) && item.status == ItemStatus::Sold)
                .cloned()
                .collect();
            items.sort_by_key(|item| (item.sold_at, item.id));
            items
        }))
    }

    // -------------------------------------------------------------------------
    // Users & permissions
    // -------------------------------------------------------------------------

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        Ok(self.read(|i| i.tables.users.values().find(|u| u.email == email).cloned()))
    }

    async fn create_user(&self, email: &str, password_hash: &str) -> AppResult<(User, bool)> {
        self.atomic(|t, _| {
            if let Some(existing) = t.users.values().find(|u| u.email == email) {
                return Ok((existing.clone(), false));
            }
            let user = User {
                id: t.next_id(),
                email: email.to_string(),
                password_hash: password_hash.to_string(),
                created_at: Utc::now(),
            };
            t.users.insert(user.id, user.clone());
            Ok((user, true))
        })
    }

    async fn admin_permissions(&self, user_id: i64) -> AppResult<Option<AdminPermissions>> {
        Ok(self.read(|i| i.tables.admins.get(&user_id).cloned()))
    }

    async fn upsert_admin_permissions(&self, perms: AdminPermissions) -> AppResult<AdminPermissions> {
        self.atomic(|t, _| {
            t.admins.insert(perms.user_id, perms.clone());
            Ok(perms)
        })
    }

    // -------------------------------------------------------------------------
    // Serials
    // -------------------------------------------------------------------------

    async fn issue_serials(&self, req: NewSerials) -> AppResult<Vec<Serial>> {
        self.atomic(|t, _| {
            if !t.products.contains_key(&req.product_id) {
                return Err(not_found(format!("product {}", req.product_id)));
            }
            let now = Utc::now();
            let mut rng = rand::thread_rng();
            let mut issued = Vec::with_capacity(req.anti_codes.len());

            for anti in req.anti_codes {
                let seq = {
                    let counter = t.serial_seq.entry(req.product_id).or_insert(0);
                    *counter += 1;
                    *counter
                };
                let mut anti = anti;
                let mut number = serial_number(&req.product_code, seq, &anti);
                while t.serials.values().any(|s| s.serial_number == number) {
                    anti = anti_counterfeit_code(&mut rng);
                    number = serial_number(&req.product_code, seq, &anti);
                }
                let serial = Serial {
                    id: t.next_id(),
                    serial_number: number,
                    product_code: req.product_code.clone(),
                    sequence_number: seq,
                    anti_counterfeit_code: anti,
                    order_id: req.order_id,
                    order_no: req.order_no.clone(),
                    product_id: req.product_id,
                    view_count: 0,
                    first_viewed_at: None,
                    last_viewed_at: None,
                    created_at: now,
                };
                t.serials.insert(serial.id, serial.clone());
                issued.push(serial);
            }
            Ok(issued)
        })
    }

    async fn serials_for_order(&self, order_id: i64) -> AppResult<Vec<Serial>> {
        Ok(self.read(|i| i.tables.serials.values().filter(|s| s.order_id == order_id).cloned().collect()))
    }

    async fn verify_serial(&self, serial_number: &str) -> AppResult<Option<Serial>> {
        let wanted = normalize_serial(serial_number);
        let mut inner = self.inner.lock();
        let found = inner.tables.serials.values_mut().find(|s| s.serial_number == wanted);
        Ok(found.map(|serial| {
            serial.record_view(Utc::now());
            serial.clone()
        }))
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    async fn inventory_logs(&self, query: &LogQuery) -> AppResult<Vec<InventoryLogEntry>> {
        Ok(self.read(|i| {
            i.logs
                .iter()
                .rev()
                .filter(|e| query.matches(e))
                .take(query.effective_limit() as usize)
                .cloned()
                .collect()
        }))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Actor, LogType};
    use crate::models::{NewProduct, ProductType};
    use crate::order::tests::blank_order;
    use crate::virtual_pool::AllocationPolicy;
    use rust_decimal::Decimal;

    fn admin() -> LogContext {
        LogContext::new(&Actor::Admin(1))
    }

    async fn stock(store: &MemoryStore, total: i32) -> Stock {
        store
            .create_stock(
                NewStock {
                    sku: format!("SKU-{total}"),
                    name: "Widget".into(),
                    total,
                    warehouse: "DEFAULT".into(),
                    low_stock_threshold: 0,
                },
                &admin(),
            )
            .await
            .unwrap()
    }

    async fn pool(store: &MemoryStore, keys: &[&str]) -> VirtualPool {
        let pool = store.create_pool("keys").await.unwrap();
        let items = keys
            .iter()
            .map(|k| ImportedItem { content: k.to_string(), remark: None })
            .collect();
        store.import_items(pool.id, items, "BATCH-T", &admin()).await.unwrap()
    }

    fn claim(resource: ResourceRef, quantity: i32) -> Claim {
        Claim {
            line_index: Some(0),
            product_id: Some(1),
            resource,
            quantity,
            auto_delivery: true,
            policy: AllocationPolicy::Oldest,
        }
    }

    #[tokio::test]
    async fn failed_claim_rolls_back_earlier_claims() {
        let store = MemoryStore::new();
        let plenty = stock(&store, 10).await;
        let scarce = stock(&store, 1).await;

        let new = NewOrder {
            order: blank_order("ORD-ROLLBACK"),
            claims: vec![claim(plenty.resource(), 3), claim(scarce.resource(), 2)],
        };
        let err = store.create_order(new, &admin()).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock { resource, .. } if resource == scarce.resource()));

        assert_eq!(store.get_stock(plenty.id).await.unwrap().unwrap().ledger.reserved, 0);
        assert!(store.order_by_no("ORD-ROLLBACK").await.unwrap().is_none());
        let reserves = store
            .inventory_logs(&LogQuery { log_type: Some(LogType::Reserve), ..Default::default() })
            .await
            .unwrap();
        assert!(reserves.is_empty());
    }

    #[tokio::test]
    async fn pool_counters_follow_item_statuses() {
        let store = MemoryStore::new();
        let pool = pool(&store, &["K1", "K2", "K3"]).await;

        let order = store
            .create_order(
                NewOrder { order: blank_order("ORD-V"), claims: vec![claim(pool.resource(), 2)] },
                &admin(),
            )
            .await
            .unwrap();
        assert_eq!(order.reservations[0].item_ids.len(), 2);

        let (pool_now, stats) = store.get_pool(pool.id).await.unwrap().unwrap();
        assert_eq!(stats, PoolStats { available: 1, reserved: 2, sold: 0, invalid: 0 });
        assert!(stats.matches(&pool_now.ledger));

        let spare = store.list_items(pool.id, Some(ItemStatus::Available)).await.unwrap();
        store.invalidate_item(spare[0].id, &admin()).await.unwrap();
        let (pool_now, stats) = store.get_pool(pool.id).await.unwrap().unwrap();
        assert!(stats.matches(&pool_now.ledger));
        assert_eq!(pool_now.ledger.available(), Some(0));

        let reserved = store.list_items(pool.id, Some(ItemStatus::Reserved)).await.unwrap();
        assert!(store.invalidate_item(reserved[0].id, &admin()).await.is_err());
    }

    #[tokio::test]
    async fn stale_version_is_not_applied() {
        let store = MemoryStore::new();
        let stock = stock(&store, 5).await;
        let order = store
            .create_order(
                NewOrder { order: blank_order("ORD-CAS"), claims: vec![claim(stock.resource(), 1)] },
                &admin(),
            )
            .await
            .unwrap();

        let cancel = |expected_updated_at| TransitionRequest {
            order_no: order.order_no.clone(),
            expected_status: OrderStatus::PendingPayment,
            expected_updated_at,
            updated: Order { status: OrderStatus::Cancelled, ..order.clone() },
            trigger: Trigger::Cancelled,
            effect: LedgerEffect::Release,
            details: None,
            ctx: admin(),
        };

        let first = store.apply_transition(cancel(order.updated_at)).await.unwrap();
        assert!(matches!(first, TransitionResult::Applied(ref o) if o.counts.released == 1));
        let second = store.apply_transition(cancel(order.updated_at)).await.unwrap();
        assert!(matches!(second, TransitionResult::Stale(ref o) if o.status == OrderStatus::Cancelled));

        assert_eq!(store.get_stock(stock.id).await.unwrap().unwrap().ledger.reserved, 0);
        let events = store.order_events(order.id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn serial_sequences_are_per_product() {
        let store = MemoryStore::new();
        let pool = store.create_pool("licenses").await.unwrap();
        let product = store
            .create_product(NewProduct {
                sku: "LIC".into(),
                name: "License".into(),
                price: Decimal::TEN,
                product_type: ProductType::Virtual,
                stock_id: None,
                pool_id: Some(pool.id),
                auto_delivery: true,
                product_code: Some("LIC".into()),
            })
            .await
            .unwrap();

        let first = store
            .issue_serials(NewSerials::generate(1, "ORD1", product.id, "LIC", 2))
            .await
            .unwrap();
        let second = store
            .issue_serials(NewSerials::generate(2, "ORD2", product.id, "LIC", 1))
            .await
            .unwrap();
        let seqs: Vec<i64> = first.iter().chain(&second).map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(second[0].serial_number.starts_with("LIC003"));

        let viewed = store.verify_serial(&second[0].serial_number.to_lowercase()).await.unwrap().unwrap();
        assert_eq!(viewed.view_count, 1);
        assert!(store.verify_serial("NOPE000AAAA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_creation_is_idempotent_per_email() {
        let store = MemoryStore::new();
        let (first, created) = store.create_user("a@shop.test", "$argon2id$x").await.unwrap();
        assert!(created);
        let (again, created) = store.create_user("a@shop.test", "$argon2id$y").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);
        assert_eq!(again.password_hash, "$argon2id$x");
    }
}

// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL backend. Each `Store` method runs in one transaction; ledger rows
// are locked with `SELECT ... FOR UPDATE`, updated through the same `Ledger`
// rules the in-memory store uses, and guarded again by CHECK constraints.
//
// Lock order inside a transaction: order row first, then ledger rows sorted
// by resource, then virtual items.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row};
use std::str::FromStr;
use std::time::Instant;

use crate::audit::{EventDetails, InventoryLogEntry, LogContext, LogDetails, LogQuery, OrderEvent};
use crate::error::{AppError, AppResult};
use crate::ledger::{Ledger, LedgerChange, LedgerError, Reservable, ResourceKind, ResourceRef};
use crate::metrics;
use crate::models::{NewProduct, NewStock, Product, Stock, User};
use crate::order::{LedgerEffect, Order, OrderItem, OrderStatus, Reservation, ReservationState, Trigger};
use crate::permissions::AdminPermissions;
use crate::promo::{normalize_code, NewPromoCode, PromoCode, PromoError};
use crate::serial::{anti_counterfeit_code, normalize_serial, serial_number, NewSerials, Serial};
use crate::shipping::ReceiverInfo;
use crate::store::{
    next_version, Claim, Delivery, EffectCounts, NewOrder, Store, TransitionOutcome,
    TransitionRequest, TransitionResult,
};
use crate::virtual_pool::{
    ImportedItem, ItemStatus, PoolStats, VirtualPool, VirtualStockItem, MAX_ALLOCATION_ATTEMPTS,
};

/// Retries when a generated serial collides with an existing one.
const SERIAL_COLLISION_RETRIES: usize = 5;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create tables and indexes. Every statement is idempotent.
    pub async fn run_migrations(&self) -> Result<()> {
        for (name, statement) in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {name}"))?;
        }
        Ok(())
    }
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "stocks table",
        r#"
        CREATE TABLE IF NOT EXISTS stocks (
            id                  BIGSERIAL PRIMARY KEY,
            sku                 VARCHAR(64) UNIQUE NOT NULL,
            name                VARCHAR(255) NOT NULL,
            total               INTEGER NOT NULL DEFAULT 0,
            reserved            INTEGER NOT NULL DEFAULT 0,
            sold                INTEGER NOT NULL DEFAULT 0,
            warehouse           VARCHAR(50) NOT NULL DEFAULT 'DEFAULT',
            low_stock_threshold INTEGER NOT NULL DEFAULT 0,
            active              BOOLEAN NOT NULL DEFAULT TRUE,
            created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT stock_counters CHECK (reserved >= 0 AND sold >= 0 AND total >= reserved + sold)
        )
        "#,
    ),
    (
        "virtual_pools table",
        r#"
        CREATE TABLE IF NOT EXISTS virtual_pools (
            id         BIGSERIAL PRIMARY KEY,
            name       VARCHAR(255) NOT NULL,
            total      INTEGER NOT NULL DEFAULT 0,
            reserved   INTEGER NOT NULL DEFAULT 0,
            sold       INTEGER NOT NULL DEFAULT 0,
            active     BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT pool_counters CHECK (reserved >= 0 AND sold >= 0 AND total >= reserved + sold)
        )
        "#,
    ),
    (
        "virtual_items table",
        r#"
        CREATE TABLE IF NOT EXISTS virtual_items (
            id             BIGSERIAL PRIMARY KEY,
            pool_id        BIGINT NOT NULL REFERENCES virtual_pools(id),
            content        TEXT NOT NULL,
            remark         TEXT,
            status         VARCHAR(16) NOT NULL DEFAULT 'available',
            order_id       BIGINT,
            order_no       VARCHAR(64),
            batch_no       VARCHAR(64) NOT NULL,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            reserved_at    TIMESTAMPTZ,
            sold_at        TIMESTAMPTZ,
            invalidated_at TIMESTAMPTZ
        )
        "#,
    ),
    (
        "virtual item status index",
        "CREATE INDEX IF NOT EXISTS idx_virtual_items_pool_status ON virtual_items(pool_id, status)",
    ),
    (
        "virtual item order index",
        "CREATE INDEX IF NOT EXISTS idx_virtual_items_order ON virtual_items(order_id)",
    ),
    (
        "products table",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id            BIGSERIAL PRIMARY KEY,
            sku           VARCHAR(64) UNIQUE NOT NULL,
            name          VARCHAR(255) NOT NULL,
            price         NUMERIC(12, 2) NOT NULL,
            product_type  VARCHAR(16) NOT NULL,
            stock_id      BIGINT REFERENCES stocks(id),
            pool_id       BIGINT REFERENCES virtual_pools(id),
            auto_delivery BOOLEAN NOT NULL DEFAULT FALSE,
            product_code  VARCHAR(16),
            serial_seq    BIGINT NOT NULL DEFAULT 0,
            active        BOOLEAN NOT NULL DEFAULT TRUE,
            created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "promo_codes table",
        r#"
        CREATE TABLE IF NOT EXISTS promo_codes (
            id                BIGSERIAL PRIMARY KEY,
            code              VARCHAR(50) UNIQUE NOT NULL,
            description       TEXT,
            discount_type     VARCHAR(16) NOT NULL,
            discount_value    NUMERIC(12, 2) NOT NULL,
            min_order_amount  NUMERIC(12, 2) NOT NULL DEFAULT 0,
            max_discount      NUMERIC(12, 2) NOT NULL DEFAULT 0,
            total_quantity    INTEGER,
            reserved_quantity INTEGER NOT NULL DEFAULT 0,
            used_quantity     INTEGER NOT NULL DEFAULT 0,
            status            VARCHAR(16) NOT NULL DEFAULT 'active',
            expires_at        TIMESTAMPTZ,
            product_scope     VARCHAR(16) NOT NULL DEFAULT 'all',
            product_ids       BIGINT[] NOT NULL DEFAULT '{}',
            created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT promo_counters CHECK (
                reserved_quantity >= 0 AND used_quantity >= 0
                AND (total_quantity IS NULL OR total_quantity >= reserved_quantity + used_quantity)
            )
        )
        "#,
    ),
    (
        "users table",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id            BIGSERIAL PRIMARY KEY,
            email         VARCHAR(255) UNIQUE NOT NULL,
            password_hash TEXT NOT NULL,
            created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "admin_permissions table",
        r#"
        CREATE TABLE IF NOT EXISTS admin_permissions (
            user_id     BIGINT PRIMARY KEY,
            role        VARCHAR(32) NOT NULL,
            permissions TEXT[] NOT NULL DEFAULT '{}'
        )
        "#,
    ),
    (
        "orders table",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id                BIGSERIAL PRIMARY KEY,
            order_no          VARCHAR(64) UNIQUE NOT NULL,
            status            VARCHAR(32) NOT NULL,
            items             JSONB NOT NULL,
            receiver          JSONB,
            privacy_protected BOOLEAN NOT NULL DEFAULT FALSE,
            form_token        VARCHAR(64) UNIQUE,
            form_expires_at   TIMESTAMPTZ,
            form_submitted_at TIMESTAMPTZ,
            subtotal_amount   NUMERIC(12, 2) NOT NULL,
            discount_amount   NUMERIC(12, 2) NOT NULL,
            total_amount      NUMERIC(12, 2) NOT NULL,
            currency          VARCHAR(8) NOT NULL,
            promo_code_id     BIGINT,
            promo_code        VARCHAR(50),
            tracking_no       VARCHAR(100),
            shipped_at        TIMESTAMPTZ,
            paid_at           TIMESTAMPTZ,
            completed_at      TIMESTAMPTZ,
            user_id           BIGINT,
            user_email        VARCHAR(255),
            user_name         VARCHAR(255),
            source_platform   VARCHAR(64),
            external_user_id  VARCHAR(255),
            external_order_id VARCHAR(255),
            remark            TEXT,
            admin_remark      TEXT,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "stale order index",
        "CREATE INDEX IF NOT EXISTS idx_orders_status_created ON orders(status, created_at)",
    ),
    (
        "order_reservations table",
        r#"
        CREATE TABLE IF NOT EXISTS order_reservations (
            id            BIGSERIAL PRIMARY KEY,
            order_id      BIGINT NOT NULL REFERENCES orders(id),
            line_index    INTEGER,
            product_id    BIGINT,
            resource_kind VARCHAR(16) NOT NULL,
            resource_id   BIGINT NOT NULL,
            quantity      INTEGER NOT NULL CHECK (quantity > 0),
            auto_delivery BOOLEAN NOT NULL DEFAULT FALSE,
            state         VARCHAR(16) NOT NULL,
            item_ids      BIGINT[] NOT NULL DEFAULT '{}'
        )
        "#,
    ),
    (
        "reservation order index",
        "CREATE INDEX IF NOT EXISTS idx_order_reservations_order ON order_reservations(order_id)",
    ),
    (
        "order_events table",
        r#"
        CREATE TABLE IF NOT EXISTS order_events (
            id           BIGSERIAL PRIMARY KEY,
            order_id     BIGINT NOT NULL REFERENCES orders(id),
            order_no     VARCHAR(64) NOT NULL,
            trigger_name VARCHAR(32),
            from_status  VARCHAR(32),
            to_status    VARCHAR(32) NOT NULL,
            operator     VARCHAR(255) NOT NULL,
            details      JSONB NOT NULL,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "inventory_logs table",
        r#"
        CREATE TABLE IF NOT EXISTS inventory_logs (
            id            BIGSERIAL PRIMARY KEY,
            log_type      VARCHAR(16) NOT NULL,
            resource_kind VARCHAR(16) NOT NULL,
            resource_id   BIGINT NOT NULL,
            quantity      INTEGER NOT NULL,
            before_value  INTEGER NOT NULL,
            after_value   INTEGER NOT NULL,
            order_no      VARCHAR(64),
            operator      VARCHAR(255) NOT NULL,
            reason        TEXT,
            details       JSONB NOT NULL,
            created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "inventory log resource index",
        "CREATE INDEX IF NOT EXISTS idx_inventory_logs_resource ON inventory_logs(resource_kind, resource_id)",
    ),
    (
        "serials table",
        r#"
        CREATE TABLE IF NOT EXISTS serials (
            id                    BIGSERIAL PRIMARY KEY,
            serial_number         VARCHAR(64) UNIQUE NOT NULL,
            product_code          VARCHAR(16) NOT NULL,
            sequence_number       BIGINT NOT NULL,
            anti_counterfeit_code VARCHAR(8) NOT NULL,
            order_id              BIGINT NOT NULL,
            order_no              VARCHAR(64) NOT NULL,
            product_id            BIGINT NOT NULL,
            view_count            BIGINT NOT NULL DEFAULT 0,
            first_viewed_at       TIMESTAMPTZ,
            last_viewed_at        TIMESTAMPTZ,
            created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
];

// =============================================================================
// ROWS
// =============================================================================

fn parse_column<T: FromStr<Err = String>>(raw: &str) -> AppResult<T> {
    raw.parse().map_err(AppError::Internal)
}

fn not_found(what: impl std::fmt::Display) -> AppError {
    AppError::NotFound(format!("{what} not found"))
}

#[derive(FromRow)]
struct StockRow {
    id: i64,
    sku: String,
    name: String,
    total: i32,
    reserved: i32,
    sold: i32,
    warehouse: String,
    low_stock_threshold: i32,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StockRow> for Stock {
    fn from(row: StockRow) -> Self {
        Self {
            id: row.id,
            sku: row.sku,
            name: row.name,
            ledger: Ledger { total: Some(row.total), reserved: row.reserved, sold: row.sold },
            warehouse: row.warehouse,
            low_stock_threshold: row.low_stock_threshold,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PoolRow {
    id: i64,
    name: String,
    total: i32,
    reserved: i32,
    sold: i32,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PoolRow> for VirtualPool {
    fn from(row: PoolRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            ledger: Ledger { total: Some(row.total), reserved: row.reserved, sold: row.sold },
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ItemRow {
    id: i64,
    pool_id: i64,
    content: String,
    remark: Option<String>,
    status: String,
    order_id: Option<i64>,
    order_no: Option<String>,
    batch_no: String,
    created_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    sold_at: Option<DateTime<Utc>>,
    invalidated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ItemRow> for VirtualStockItem {
    type Error = AppError;

    fn try_from(row: ItemRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            pool_id: row.pool_id,
            content: row.content,
            remark: row.remark,
            status: parse_column(&row.status)?,
            order_id: row.order_id,
            order_no: row.order_no,
            batch_no: row.batch_no,
            created_at: row.created_at,
            reserved_at: row.reserved_at,
            sold_at: row.sold_at,
            invalidated_at: row.invalidated_at,
        })
    }
}

#[derive(FromRow)]
struct ProductRow {
    id: i64,
    sku: String,
    name: String,
    price: Decimal,
    product_type: String,
    stock_id: Option<i64>,
    pool_id: Option<i64>,
    auto_delivery: bool,
    product_code: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = AppError;

    fn try_from(row: ProductRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            sku: row.sku,
            name: row.name,
            price: row.price,
            product_type: parse_column(&row.product_type)?,
            stock_id: row.stock_id,
            pool_id: row.pool_id,
            auto_delivery: row.auto_delivery,
            product_code: row.product_code,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct PromoRow {
    id: i64,
    code: String,
    description: Option<String>,
    discount_type: String,
    discount_value: Decimal,
    min_order_amount: Decimal,
    max_discount: Decimal,
    total_quantity: Option<i32>,
    reserved_quantity: i32,
    used_quantity: i32,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    product_scope: String,
    product_ids: Vec<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PromoRow> for PromoCode {
    type Error = AppError;

    fn try_from(row: PromoRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            code: row.code,
            description: row.description,
            discount_type: parse_column(&row.discount_type)?,
            discount_value: row.discount_value,
            min_order_amount: row.min_order_amount,
            max_discount: row.max_discount,
            ledger: Ledger {
                total: row.total_quantity,
                reserved: row.reserved_quantity,
                sold: row.used_quantity,
            },
            status: parse_column(&row.status)?,
            expires_at: row.expires_at,
            product_scope: parse_column(&row.product_scope)?,
            product_ids: row.product_ids,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AdminRow {
    user_id: i64,
    role: String,
    permissions: Vec<String>,
}

impl TryFrom<AdminRow> for AdminPermissions {
    type Error = AppError;

    fn try_from(row: AdminRow) -> AppResult<Self> {
        Ok(Self { user_id: row.user_id, role: parse_column(&row.role)?, permissions: row.permissions })
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: i64,
    order_no: String,
    status: String,
    items: Json<Vec<OrderItem>>,
    receiver: Option<Json<ReceiverInfo>>,
    privacy_protected: bool,
    form_token: Option<String>,
    form_expires_at: Option<DateTime<Utc>>,
    form_submitted_at: Option<DateTime<Utc>>,
    subtotal_amount: Decimal,
    discount_amount: Decimal,
    total_amount: Decimal,
    currency: String,
    promo_code_id: Option<i64>,
    promo_code: Option<String>,
    tracking_no: Option<String>,
    shipped_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    user_id: Option<i64>,
    user_email: Option<String>,
    user_name: Option<String>,
    source_platform: Option<String>,
    external_user_id: Option<String>,
    external_order_id: Option<String>,
    remark: Option<String>,
    admin_remark: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, reservations: Vec<Reservation>) -> AppResult<Order> {
        Ok(Order {
            id: self.id,
            order_no: self.order_no,
            status: parse_column(&self.status)?,
            items: self.items.0,
            receiver: self.receiver.map(|r| r.0),
            privacy_protected: self.privacy_protected,
            form_token: self.form_token,
            form_expires_at: self.form_expires_at,
            form_submitted_at: self.form_submitted_at,
            subtotal_amount: self.subtotal_amount,
            discount_amount: self.discount_amount,
            total_amount: self.total_amount,
            currency: self.currency,
            promo_code_id: self.promo_code_id,
            promo_code: self.promo_code,
            tracking_no: self.tracking_no,
            shipped_at: self.shipped_at,
            paid_at: self.paid_at,
            completed_at: self.completed_at,
            user_id: self.user_id,
            user_email: self.user_email,
            user_name: self.user_name,
            source_platform: self.source_platform,
            external_user_id: self.external_user_id,
            external_order_id: self.external_order_id,
            remark: self.remark,
            admin_remark: self.admin_remark,
            created_at: self.created_at,
            updated_at: self.updated_at,
            reservations,
        })
    }
}

#[derive(FromRow)]
struct ReservationRow {
    id: i64,
    line_index: Option<i32>,
    product_id: Option<i64>,
    resource_kind: String,
    resource_id: i64,
    quantity: i32,
    auto_delivery: bool,
    state: String,
    item_ids: Vec<i64>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = AppError;

    fn try_from(row: ReservationRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            line_index: row.line_index,
            product_id: row.product_id,
            resource: ResourceRef { kind: parse_column(&row.resource_kind)?, id: row.resource_id },
            quantity: row.quantity,
            auto_delivery: row.auto_delivery,
            state: parse_column(&row.state)?,
            item_ids: row.item_ids,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    order_id: i64,
    order_no: String,
    trigger_name: Option<String>,
    from_status: Option<String>,
    to_status: String,
    operator: String,
    details: Json<EventDetails>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for OrderEvent {
    type Error = AppError;

    fn try_from(row: EventRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            order_no: row.order_no,
            trigger: row.trigger_name.as_deref().map(parse_column::<Trigger>).transpose()?,
            from_status: row.from_status.as_deref().map(parse_column::<OrderStatus>).transpose()?,
            to_status: parse_column(&row.to_status)?,
            operator: row.operator,
            details: row.details.0,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct LogRow {
    id: i64,
    log_type: String,
    resource_kind: String,
    resource_id: i64,
    quantity: i32,
    before_value: i32,
    after_value: i32,
    order_no: Option<String>,
    operator: String,
    reason: Option<String>,
    details: Json<LogDetails>,
    created_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for InventoryLogEntry {
    type Error = AppError;

    fn try_from(row: LogRow) -> AppResult<Self> {
        Ok(Self {
            id: row.id,
            log_type: parse_column(&row.log_type)?,
            resource: ResourceRef { kind: parse_column(&row.resource_kind)?, id: row.resource_id },
            quantity: row.quantity,
            before: row.before_value,
            after: row.after_value,
            order_no: row.order_no,
            operator: row.operator,
            reason: row.reason,
            details: row.details.0,
            created_at: row.created_at,
        })
    }
}

// =============================================================================
// QUERY HELPERS
// =============================================================================

/// Records the query duration when dropped.
struct QueryTimer {
    operation: &'static str,
    start: Instant,
}

impl QueryTimer {
    fn start(operation: &'static str) -> Self {
        Self { operation, start: Instant::now() }
    }
}

impl Drop for QueryTimer {
    fn drop(&mut self) {
        metrics::record_db_query(self.operation, self.start.elapsed().as_secs_f64());
    }
}

/// Table and counter columns of a ledger-bearing resource.
struct LedgerColumns {
    table: &'static str,
    total: &'static str,
    reserved: &'static str,
    sold: &'static str,
}

impl LedgerColumns {
    fn of(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Stock => Self { table: "stocks", total: "total", reserved: "reserved", sold: "sold" },
            ResourceKind::VirtualPool => {
                Self { table: "virtual_pools", total: "total", reserved: "reserved", sold: "sold" }
            }
            ResourceKind::PromoCode => Self {
                table: "promo_codes",
                total: "total_quantity",
                reserved: "reserved_quantity",
                sold: "used_quantity",
            },
        }
    }
}

async fn lock_reservable(
    conn: &mut PgConnection,
    resource: ResourceRef,
) -> AppResult<Box<dyn Reservable + Send>> {
    let found: Option<Box<dyn Reservable + Send>> = match resource.kind {
        ResourceKind::Stock => sqlx::query_as::<_, StockRow>("SELECT * FROM stocks WHERE id = $1 FOR UPDATE")
            .bind(resource.id)
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| Box::new(Stock::from(row)) as Box<dyn Reservable + Send>),
        ResourceKind::VirtualPool => {
            sqlx::query_as::<_, PoolRow>("SELECT * FROM virtual_pools WHERE id = $1 FOR UPDATE")
                .bind(resource.id)
                .fetch_optional(&mut *conn)
                .await?
                .map(|row| Box::new(VirtualPool::from(row)) as Box<dyn Reservable + Send>)
        }
        ResourceKind::PromoCode => {
            match sqlx::query_as::<_, PromoRow>("SELECT * FROM promo_codes WHERE id = $1 FOR UPDATE")
                .bind(resource.id)
                .fetch_optional(&mut *conn)
                .await?
            {
                Some(row) => Some(Box::new(PromoCode::try_from(row)?) as Box<dyn Reservable + Send>),
                None => None,
            }
        }
    };
    found.ok_or_else(|| not_found(resource))
}

async fn save_ledger(conn: &mut PgConnection, resource: ResourceRef, ledger: &Ledger) -> AppResult<()> {
    let cols = LedgerColumns::of(resource.kind);
    let sql = format!(
        "UPDATE {} SET {} = $1, {} = $2, {} = $3, updated_at = NOW() WHERE id = $4",
        cols.table, cols.total, cols.reserved, cols.sold
    );
    sqlx::query(&sql)
        .bind(ledger.total)
        .bind(ledger.reserved)
        .bind(ledger.sold)
        .bind(resource.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Lock the row, run one ledger operation, re-check and persist the counters.
async fn ledger_op<F>(conn: &mut PgConnection, resource: ResourceRef, op: F) -> AppResult<LedgerChange>
where
    F: FnOnce(&mut dyn Reservable) -> Result<LedgerChange, LedgerError> + Send,
{
    let mut target = lock_reservable(conn, resource).await?;
    let change = op(&mut *target).map_err(|e| AppError::from_ledger(resource, e))?;
    target.ledger().check().map_err(|e| AppError::from_ledger(resource, e))?;
    save_ledger(conn, resource, target.ledger()).await?;
    Ok(change)
}

async fn insert_log(conn: &mut PgConnection, entry: &InventoryLogEntry) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO inventory_logs
            (log_type, resource_kind, resource_id, quantity, before_value, after_value,
             order_no, operator, reason, details, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(entry.log_type.as_str())
    .bind(entry.resource.kind.as_str())
    .bind(entry.resource.id)
    .bind(entry.quantity)
    .bind(entry.before)
    .bind(entry.after)
    .bind(&entry.order_no)
    .bind(&entry.operator)
    .bind(&entry.reason)
    .bind(Json(&entry.details))
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_event(conn: &mut PgConnection, event: &OrderEvent) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO order_events
            (order_id, order_no, trigger_name, from_status, to_status, operator, details, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.order_id)
    .bind(&event.order_no)
    .bind(event.trigger.map(|t| t.as_str()))
    .bind(event.from_status.map(|s| s.as_str()))
    .bind(event.to_status.as_str())
    .bind(&event.operator)
    .bind(Json(&event.details))
    .bind(event.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
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

fn claim_details(claim: &Reservation) -> LogDetails {
    LogDetails::OrderClaim {
        line_index: claim.line_index,
        product_id: claim.product_id,
        item_ids: claim.item_ids.clone(),
    }
}

/// Binds `$2..$27`: every order column except `id` and `order_no`.
fn bind_order_columns<'q>(
    query: Query<'q, Postgres, PgArguments>,
    order: &'q Order,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(order.status.as_str())
        .bind(Json(&order.items))
        .bind(order.receiver.as_ref().map(Json))
        .bind(order.privacy_protected)
        .bind(&order.form_token)
        .bind(order.form_expires_at)
        .bind(order.form_submitted_at)
        .bind(order.subtotal_amount)
        .bind(order.discount_amount)
        .bind(order.total_amount)
        .bind(&order.currency)
        .bind(order.promo_code_id)
        .bind(&order.promo_code)
        .bind(&order.tracking_no)
        .bind(order.shipped_at)
        .bind(order.paid_at)
        .bind(order.completed_at)
        .bind(order.user_id)
        .bind(&order.user_email)
        .bind(&order.user_name)
        .bind(&order.source_platform)
        .bind(&order.external_user_id)
        .bind(&order.external_order_id)
        .bind(&order.remark)
        .bind(&order.admin_remark)
        .bind(order.updated_at)
}

async fn load_reservations(conn: &mut PgConnection, order_id: i64) -> AppResult<Vec<Reservation>> {
    sqlx::query_as::<_, ReservationRow>("SELECT * FROM order_reservations WHERE order_id = $1 ORDER BY id")
        .bind(order_id)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Reservation::try_from)
        .collect()
}

async fn hydrate(conn: &mut PgConnection, row: Option<OrderRow>) -> AppResult<Option<Order>> {
    match row {
        Some(row) => {
            let reservations = load_reservations(conn, row.id).await?;
            Ok(Some(row.into_order(reservations)?))
        }
        None => Ok(None),
    }
}

async fn set_reservation_state(conn: &mut PgConnection, claim: &Reservation) -> AppResult<()> {
    sqlx::query("UPDATE order_reservations SET state = $2 WHERE id = $1")
        .bind(claim.id)
        .bind(claim.state.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// -----------------------------------------------------------------------------
// Reservation protocol
// -----------------------------------------------------------------------------

async fn reserve_claim(
    conn: &mut PgConnection,
    claim: &Claim,
    order_id: i64,
    order_no: &str,
    now: DateTime<Utc>,
    ctx: &LogContext,
) -> AppResult<Reservation> {
    let resource = claim.resource;
    let mut target = lock_reservable(conn, resource).await?;
    if !target.accepts_reservations(now) {
        return Err(match resource.kind {
            ResourceKind::PromoCode => AppError::Promo(PromoError::Inactive),
            _ => AppError::InsufficientStock { resource, available: 0, requested: claim.quantity },
        });
    }
    let change = target.reserve(claim.quantity).map_err(|e| AppError::from_ledger(resource, e))?;
    target.ledger().check().map_err(|e| AppError::from_ledger(resource, e))?;
    save_ledger(conn, resource, target.ledger()).await?;

    let mut item_ids = Vec::new();
    if resource.kind == ResourceKind::VirtualPool {
        item_ids = allocate_items(conn, claim, order_id, order_no, now).await?;
    }

    let reservation = Reservation {
        id: 0,
        line_index: claim.line_index,
        product_id: claim.product_id,
        resource,
        quantity: claim.quantity,
        auto_delivery: claim.auto_delivery,
        state: ReservationState::Reserved,
        item_ids,
    };
    insert_log(conn, &InventoryLogEntry::from_change(resource, &change, ctx, claim_details(&reservation))).await?;
    Ok(reservation)
}

/// Bind `claim.quantity` available items to the order. The pool row is
/// already locked, so only rows held by other writers are skipped.
async fn allocate_items(
    conn: &mut PgConnection,
    claim: &Claim,
    order_id: i64,
    order_no: &str,
    now: DateTime<Utc>,
) -> AppResult<Vec<i64>> {
    let wanted = claim.quantity as usize;
    let select = format!(
        "SELECT id FROM virtual_items WHERE pool_id = $1 AND status = 'available' AND NOT (id = ANY($2)) \
         ORDER BY {} LIMIT $3 FOR UPDATE SKIP LOCKED",
        claim.policy.sql_order()
    );
    let mut item_ids: Vec<i64> = Vec::with_capacity(wanted);

    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let missing = (wanted - item_ids.len()) as i64;
        let picked: Vec<i64> = sqlx::query_scalar(&select)
            .bind(claim.resource.id)
            .bind(&item_ids)
            .bind(missing)
            .fetch_all(&mut *conn)
            .await?;
        if picked.is_empty() {
            break;
        }
        let bound = sqlx::query(
            r#"
            UPDATE virtual_items
            SET status = 'reserved', order_id = $2, order_no = $3, reserved_at = $4
            WHERE id = ANY($1) AND status = 'available'
            "#,
        )
        .bind(&picked)
        .bind(order_id)
        .bind(order_no)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        if bound.rows_affected() as usize == picked.len() {
            item_ids.extend(picked);
        }
        if item_ids.len() == wanted {
            return Ok(item_ids);
        }
    }

    Err(AppError::InsufficientStock {
        resource: claim.resource,
        available: item_ids.len() as i32,
        requested: claim.quantity,
    })
}

async fn deduct_claim(
    conn: &mut PgConnection,
    order_id: i64,
    claim: &mut Reservation,
    now: DateTime<Utc>,
    ctx: &LogContext,
) -> AppResult<Option<Delivery>> {
    let quantity = claim.quantity;
    let change = ledger_op(conn, claim.resource, move |r| r.deduct(quantity)).await?;
    let mut delivery = None;
    if claim.is_virtual() {
        let sold = sqlx::query(
            r#"
            UPDATE virtual_items SET status = 'sold', sold_at = $3
            WHERE id = ANY($1) AND order_id = $2 AND status = 'reserved'
            "#,
        )
        .bind(&claim.item_ids)
        .bind(order_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        if sold.rows_affected() as usize != claim.item_ids.len() {
            return Err(AppError::InvariantViolation(format!(
                "{}: {} of {} items were still reserved at delivery",
                claim.resource,
                sold.rows_affected(),
                claim.item_ids.len()
            )));
        }
        delivery = Some(Delivery {
            line_index: claim.line_index,
            product_id: claim.product_id,
            item_ids: claim.item_ids.clone(),
        });
    }
    claim.state = ReservationState::Deducted;
    set_reservation_state(conn, claim).await?;
    insert_log(conn, &InventoryLogEntry::from_change(claim.resource, &change, ctx, claim_details(claim))).await?;
    Ok(delivery)
}

async fn release_claim(conn: &mut PgConnection, claim: &mut Reservation, ctx: &LogContext) -> AppResult<()> {
    let quantity = claim.quantity;
    let change = ledger_op(conn, claim.resource, move |r| r.release(quantity)).await?;
    if !claim.item_ids.is_empty() {
        sqlx::query(
            r#"
            UPDATE virtual_items
            SET status = 'available', order_id = NULL, order_no = NULL, reserved_at = NULL
            WHERE id = ANY($1) AND status = 'reserved'
            "#,
        )
        .bind(&claim.item_ids)
        .execute(&mut *conn)
        .await?;
    }
    claim.state = ReservationState::Released;
    set_reservation_state(conn, claim).await?;
    insert_log(conn, &InventoryLogEntry::from_change(claim.resource, &change, ctx, claim_details(claim))).await?;
    Ok(())
}

async fn return_claim(
    conn: &mut PgConnection,
    claim: &mut Reservation,
    now: DateTime<Utc>,
    ctx: &LogContext,
) -> AppResult<()> {
    let quantity = claim.quantity;
    let change = ledger_op(conn, claim.resource, move |r| r.return_sold(quantity)).await?;
    if !claim.item_ids.is_empty() {
        sqlx::query("UPDATE virtual_items SET status = 'invalid', invalidated_at = $2 WHERE id = ANY($1)")
            .bind(&claim.item_ids)
            .bind(now)
            .execute(&mut *conn)
            .await?;
    }
    claim.state = ReservationState::Returned;
    set_reservation_state(conn, claim).await?;
    let details = LogDetails::Refund {
        line_index: claim.line_index,
        invalidated_item_ids: claim.item_ids.clone(),
    };
    insert_log(conn, &InventoryLogEntry::from_change(claim.resource, &change, ctx, details)).await?;
    Ok(())
}

async fn apply_effect(
    conn: &mut PgConnection,
    order: &mut Order,
    effect: LedgerEffect,
    now: DateTime<Utc>,
    ctx: &LogContext,
) -> AppResult<(EffectCounts, Vec<Delivery>)> {
    let mut counts = EffectCounts::default();
    let mut delivered = Vec::new();
    let order_id = order.id;

    let mut lock_order: Vec<usize> = (0..order.reservations.len()).collect();
    lock_order.sort_by_key(|&i| (order.reservations[i].resource, order.reservations[i].id));

    for i in lock_order {
        let claim = &mut order.reservations[i];
        match effect {
            LedgerEffect::None => {}
            LedgerEffect::Deduct(scope) => {
                if claim.deductible_under(scope) {
                    delivered.extend(deduct_claim(conn, order_id, claim, now, ctx).await?);
                    counts.deducted += 1;
                }
            }
            LedgerEffect::Release => {
                if claim.state == ReservationState::Reserved {
                    release_claim(conn, claim, ctx).await?;
                    counts.released += 1;
                }
            }
            LedgerEffect::Refund => match claim.state {
                ReservationState::Reserved => {
                    release_claim(conn, claim, ctx).await?;
                    counts.released += 1;
                }
                ReservationState::Deducted => {
                    return_claim(conn, claim, now, ctx).await?;
                    counts.returned += 1;
                }
                ReservationState::Released | ReservationState::Returned => {}
            },
        }
    }

    delivered.sort_by_key(|d| d.line_index);
    Ok((counts, delivered))
}

// =============================================================================
// STORE IMPLEMENTATION
// =============================================================================

#[async_trait]
impl Store for Database {
    // -------------------------------------------------------------------------
    // Physical stock
    // -------------------------------------------------------------------------

    async fn create_stock(&self, new: NewStock, ctx: &LogContext) -> AppResult<Stock> {
        let _t = QueryTimer::start("create_stock");
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, StockRow>(
            r#"
            INSERT INTO stocks (sku, name, warehouse, low_stock_threshold)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sku) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.sku)
        .bind(&new.name)
        .bind(&new.warehouse)
        .bind(new.low_stock_threshold)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::validation("sku", "already exists"))?;

        let mut stock = Stock::from(row);
        if new.total > 0 {
            let resource = stock.resource();
            let change = stock.ledger.stock_in(new.total).map_err(|e| AppError::from_ledger(resource, e))?;
            save_ledger(&mut tx, resource, &stock.ledger).await?;
            insert_log(&mut tx, &InventoryLogEntry::from_change(resource, &change, ctx, LogDetails::Restock)).await?;
        }

        tx.commit().await?;
        Ok(stock)
    }

    async fn get_stock(&self, id: i64) -> AppResult<Option<Stock>> {
        let _t = QueryTimer::start("get_stock");
        let row = sqlx::query_as::<_, StockRow>("SELECT * FROM stocks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Stock::from))
    }

    async fn list_stocks(&self, page: i32, per_page: i32) -> AppResult<(Vec<Stock>, i64)> {
        let _t = QueryTimer::start("list_stocks");
        let offset = (page.max(1) - 1) * per_page;

        let rows = sqlx::query_as::<_, StockRow>("SELECT * FROM stocks ORDER BY sku ASC LIMIT $1 OFFSET $2")
            .bind(per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stocks").fetch_one(&self.pool).await?;

        Ok((rows.into_iter().map(Stock::from).collect(), total.0))
    }

    async fn low_stock_stocks(&self) -> AppResult<Vec<Stock>> {
        let _t = QueryTimer::start("low_stock_stocks");
        let rows = sqlx::query_as::<_, StockRow>(
            r#"
            SELECT * FROM stocks
            WHERE active AND (total - reserved - sold) <= low_stock_threshold
            ORDER BY (total - reserved - sold) ASC, sku ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Stock::from).collect())
    }

    async fn stock_in(&self, id: i64, quantity: i32, ctx: &LogContext) -> AppResult<Stock> {
        let _t = QueryTimer::start("stock_in");
        let resource = ResourceRef::stock(id);
        let mut tx = self.pool.begin().await?;
        let change = ledger_op(&mut tx, resource, move |r| r.ledger_mut().stock_in(quantity)).await?;
        insert_log(&mut tx, &InventoryLogEntry::from_change(resource, &change, ctx, LogDetails::Restock)).await?;
        let row = sqlx::query_as::<_, StockRow>("SELECT * FROM stocks WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Stock::from(row))
    }

    async fn adjust_stock(&self, id: i64, delta: i32, ctx: &LogContext) -> AppResult<Stock> {
        let _t = QueryTimer::start("adjust_stock");
        let resource = ResourceRef::stock(id);
        let mut tx = self.pool.begin().await?;
        let change = ledger_op(&mut tx, resource, move |r| r.ledger_mut().adjust_total(delta)).await?;
        insert_log(&mut tx, &InventoryLogEntry::from_change(resource, &change, ctx, LogDetails::Correction)).await?;
        let row = sqlx::query_as::<_, StockRow>("SELECT * FROM stocks WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Stock::from(row))
    }

    // -------------------------------------------------------------------------
    // Virtual pools
    // -------------------------------------------------------------------------

    async fn create_pool(&self, name: &str) -> AppResult<VirtualPool> {
        let _t = QueryTimer::start("create_pool");
        let row = sqlx::query_as::<_, PoolRow>("INSERT INTO virtual_pools (name) VALUES ($1) RETURNING *")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(VirtualPool::from(row))
    }

    async fn get_pool(&self, id: i64) -> AppResult<Option<(VirtualPool, PoolStats)>> {
        let _t = QueryTimer::start("get_pool");
        let Some(row) = sqlx::query_as::<_, PoolRow>("SELECT * FROM virtual_pools WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM virtual_items WHERE pool_id = $1 GROUP BY status")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut stats = PoolStats::default();
        for (status, count) in counts {
            let count = count as i32;
            match parse_column::<ItemStatus>(&status)? {
                ItemStatus::Available => stats.available = count,
                ItemStatus::Reserved => stats.reserved = count,
                ItemStatus::Sold => stats.sold = count,
                ItemStatus::Invalid => stats.invalid = count,
            }
        }
        Ok(Some((VirtualPool::from(row), stats)))
    }

    async fn import_items(
        &self,
        pool_id: i64,
        items: Vec<ImportedItem>,
        batch_no: &str,
        ctx: &LogContext,
    ) -> AppResult<VirtualPool> {
        let _t = QueryTimer::start("import_items");
        let resource = ResourceRef::pool(pool_id);
        let count = items.len() as i32;
        let mut tx = self.pool.begin().await?;

        let change = ledger_op(&mut tx, resource, move |r| r.ledger_mut().stock_in(count)).await?;
        for item in &items {
            sqlx::query("INSERT INTO virtual_items (pool_id, content, remark, batch_no) VALUES ($1, $2, $3, $4)")
                .bind(pool_id)
                .bind(&item.content)
                .bind(&item.remark)
                .bind(batch_no)
                .execute(&mut *tx)
                .await?;
        }
        let details = LogDetails::Import { batch_no: batch_no.to_string(), count };
        insert_log(&mut tx, &InventoryLogEntry::from_change(resource, &change, ctx, details)).await?;

        let row = sqlx::query_as::<_, PoolRow>("SELECT * FROM virtual_pools WHERE id = $1")
            .bind(pool_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(VirtualPool::from(row))
    }

    async fn list_items(&self, pool_id: i64, status: Option<ItemStatus>) -> AppResult<Vec<VirtualStockItem>> {
        let _t = QueryTimer::start("list_items");
        sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM virtual_items WHERE pool_id = $1 AND ($2::text IS NULL OR status = $2) ORDER BY id",
        )
        .bind(pool_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(VirtualStockItem::try_from)
        .collect()
    }

    async fn invalidate_item(&self, item_id: i64, ctx: &LogContext) -> AppResult<VirtualStockItem> {
        let _t = QueryTimer::start("invalidate_item");
        let mut tx = self.pool.begin().await?;

        let pool_id: i64 = sqlx::query_scalar("SELECT pool_id FROM virtual_items WHERE id = $1")
            .bind(item_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| not_found(format!("item {item_id}")))?;
        let resource = ResourceRef::pool(pool_id);

        // Pool before item, same order as allocation.
        lock_reservable(&mut tx, resource).await?;
        let item: VirtualStockItem = sqlx::query_as::<_, ItemRow>("SELECT * FROM virtual_items WHERE id = $1 FOR UPDATE")
            .bind(item_id)
            .fetch_one(&mut *tx)
            .await?
            .try_into()?;
        if item.status != ItemStatus::Available {
            return Err(AppError::BadRequest(format!(
                "item {item_id} is {}; only available items can be invalidated",
                item.status.as_str()
            )));
        }

        let change = ledger_op(&mut tx, resource, |r| r.ledger_mut().adjust_total(-1)).await?;
        let row = sqlx::query_as::<_, ItemRow>(
            "UPDATE virtual_items SET status = 'invalid', invalidated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(item_id)
        .fetch_one(&mut *tx)
        .await?;
        insert_log(
            &mut tx,
            &InventoryLogEntry::from_change(resource, &change, ctx, LogDetails::Invalidation { item_id }),
        )
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    async fn create_product(&self, new: NewProduct) -> AppResult<Product> {
        let _t = QueryTimer::start("create_product");
        if let Some(stock_id) = new.stock_id {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM stocks WHERE id = $1)")
                .bind(stock_id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(AppError::validation("stock_id", format!("stock {stock_id} does not exist")));
            }
        }
        if let Some(pool_id) = new.pool_id {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM virtual_pools WHERE id = $1)")
                .bind(pool_id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(AppError::validation("pool_id", format!("pool {pool_id} does not exist")));
            }
        }

        sqlx::query_as::<_, ProductRow>(
            r#"
            INSERT INTO products (sku, name, price, product_type, stock_id, pool_id, auto_delivery, product_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (sku) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&new.sku)
        .bind(&new.name)
        .bind(new.price)
        .bind(new.product_type.as_str())
        .bind(new.stock_id)
        .bind(new.pool_id)
        .bind(new.auto_delivery)
        .bind(&new.product_code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::validation("sku", "already exists"))?
        .try_into()
    }

    async fn product_by_sku(&self, sku: &str) -> AppResult<Option<Product>> {
        let _t = QueryTimer::start("product_by_sku");
        sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE sku = $1")
            .bind(sku)
            .fetch_optional(&self.pool)
            .await?
            .map(Product::try_from)
            .transpose()
    }

    async fn product_by_id(&self, id: i64) -> AppResult<Option<Product>> {
        let _t = QueryTimer::start("product_by_id");
        sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Product::try_from)
            .transpose()
    }

    async fn create_promo(&self, new: NewPromoCode) -> AppResult<PromoCode> {
        let _t = QueryTimer::start("create_promo");
        let ledger = new.ledger();
        sqlx::query_as::<_, PromoRow>(
            r#"
            INSERT INTO promo_codes
                (code, description, discount_type, discount_value, min_order_amount, max_discount,
                 total_quantity, expires_at, product_scope, product_ids)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (code) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(normalize_code(&new.code))
        .bind(&new.description)
        .bind(new.discount_type.as_str())
        .bind(new.discount_value)
        .bind(new.min_order_amount)
        .bind(new.max_discount)
        .bind(ledger.total)
        .bind(new.expires_at)
        .bind(new.product_scope.as_str())
        .bind(&new.product_ids)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::validation("code", "already exists"))?
        .try_into()
    }

    async fn promo_by_code(&self, code: &str) -> AppResult<Option<PromoCode>> {
        let _t = QueryTimer::start("promo_by_code");
        sqlx::query_as::<_, PromoRow>("SELECT * FROM promo_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(PromoCode::try_from)
            .transpose()
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    async fn create_order(&self, new: NewOrder, ctx: &LogContext) -> AppResult<Order> {
        let _t = QueryTimer::start("create_order");
        let NewOrder { mut order, claims } = new;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let insert = sqlx::query(
            r#"
            INSERT INTO orders
                (order_no, status, items, receiver, privacy_protected, form_token, form_expires_at,
                 form_submitted_at, subtotal_amount, discount_amount, total_amount, currency,
                 promo_code_id, promo_code, tracking_no, shipped_at, paid_at, completed_at, user_id,
                 user_email, user_name, source_platform, external_user_id, external_order_id, remark,
                 admin_remark, updated_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                    $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
            ON CONFLICT (order_no) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&order.order_no);
        let inserted = bind_order_columns(insert, &order)
            .bind(order.created_at)
            .fetch_optional(&mut *tx)
            .await?;
        order.id = match inserted {
            Some(row) => row.try_get("id")?,
            None => return Err(AppError::Internal(format!("duplicate order number {}", order.order_no))),
        };

        // Lock ledger rows in resource order; keep reservations in line order.
        let mut lock_order: Vec<usize> = (0..claims.len()).collect();
        lock_order.sort_by_key(|&i| claims[i].resource);
        let mut reserved: Vec<(usize, Reservation)> = Vec::with_capacity(claims.len());
        for i in lock_order {
            let reservation = reserve_claim(&mut tx, &claims[i], order.id, &order.order_no, now, ctx).await?;
            reserved.push((i, reservation));
        }
        reserved.sort_by_key(|(i, _)| *i);

        order.reservations.clear();
        for (_, mut reservation) in reserved {
            reservation.id = sqlx::query_scalar(
                r#"
                INSERT INTO order_reservations
                    (order_id, line_index, product_id, resource_kind, resource_id, quantity,
                     auto_delivery, state, item_ids)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING id
                "#,
            )
            .bind(order.id)
            .bind(reservation.line_index)
            .bind(reservation.product_id)
            .bind(reservation.resource.kind.as_str())
            .bind(reservation.resource.id)
            .bind(reservation.quantity)
            .bind(reservation.auto_delivery)
            .bind(reservation.state.as_str())
            .bind(&reservation.item_ids)
            .fetch_one(&mut *tx)
            .await?;
            order.reservations.push(reservation);
        }

        let details = EventDetails::Created { reservations: order.reservations.len() };
        insert_event(&mut tx, &order_event(&order, None, None, ctx, details, now)).await?;

        tx.commit().await?;
        Ok(order)
    }

    async fn order_by_no(&self, order_no: &str) -> AppResult<Option<Order>> {
        let _t = QueryTimer::start("order_by_no");
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE order_no = $1")
            .bind(order_no)
            .fetch_optional(&mut *conn)
            .await?;
        hydrate(&mut conn, row).await
    }

    async fn order_by_form_token(&self, token: &str) -> AppResult<Option<Order>> {
        let _t = QueryTimer::start("order_by_form_token");
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE form_token = $1")
            .bind(token)
            .fetch_optional(&mut *conn)
            .await?;
        hydrate(&mut conn, row).await
    }

    async fn apply_transition(&self, req: TransitionRequest) -> AppResult<TransitionResult> {
        let _t = QueryTimer::start("apply_transition");
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE order_no = $1 FOR UPDATE")
            .bind(&req.order_no)
            .fetch_optional(&mut *tx)
            .await?;
        let current = hydrate(&mut tx, row)
            .await?
            .ok_or_else(|| not_found(format!("order {}", req.order_no)))?;
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

        let (counts, delivered) = apply_effect(&mut tx, &mut order, req.effect, now, &req.ctx).await?;

        let update = sqlx::query(
            r#"
            UPDATE orders SET
                status = $2, items = $3, receiver = $4, privacy_protected = $5, form_token = $6,
                form_expires_at = $7, form_submitted_at = $8, subtotal_amount = $9,
                discount_amount = $10, total_amount = $11, currency = $12, promo_code_id = $13,
                promo_code = $14, tracking_no = $15, shipped_at = $16, paid_at = $17,
                completed_at = $18, user_id = $19, user_email = $20, user_name = $21,
                source_platform = $22, external_user_id = $23, external_order_id = $24,
                remark = $25, admin_remark = $26, updated_at = $27
            WHERE id = $1
            "#,
        )
        .bind(order.id);
        bind_order_columns(update, &order).execute(&mut *tx).await?;

        let delivered_items = delivered.iter().map(|d| d.item_ids.len()).sum();
        let details = req.details.unwrap_or_else(|| counts.details(delivered_items));
        insert_event(&mut tx, &order_event(&order, Some(req.trigger), Some(current.status), &req.ctx, details, now))
            .await?;

        tx.commit().await?;
        Ok(TransitionResult::Applied(TransitionOutcome { order, delivered, counts }))
    }

    async fn stale_pending_payment(&self, cutoff: DateTime<Utc>, limit: i64) -> AppResult<Vec<String>> {
        let _t = QueryTimer::start("stale_pending_payment");
        let rows = sqlx::query_scalar(
            r#"
            SELECT order_no FROM orders
            WHERE status = 'pending_payment' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn order_events(&self, order_id: i64) -> AppResult<Vec<OrderEvent>> {
        let _t = QueryTimer::start("order_events");
        sqlx::query_as::<_, EventRow>("SELECT * FROM order_events WHERE order_id = $1 ORDER BY id")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(OrderEvent::try_from)
            .collect()
    }

    async fn delivered_items(&self, order_id: i64) -> AppResult<Vec<VirtualStockItem>> {
        let _t = QueryTimer::start("delivered_items");
        sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM virtual_items WHERE order_id = $1 AND status = 'sold' ORDER BY sold_at, id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(VirtualStockItem::try_from)
        .collect()
    }

    // -------------------------------------------------------------------------
    // Users & permissions
    // -------------------------------------------------------------------------

    async fn find_user_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let _t = QueryTimer::start("find_user_by_email");
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn create_user(&self, email: &str, password_hash: &str) -> AppResult<(User, bool)> {
        let _t = QueryTimer::start("create_user");
        let created = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, password_hash) VALUES ($1, $2) ON CONFLICT (email) DO NOTHING RETURNING *",
        )
        .bind(email)
        .bind(password_hash)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(user) = created {
            return Ok((user, true));
        }
        let existing = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        Ok((existing, false))
    }

    async fn admin_permissions(&self, user_id: i64) -> AppResult<Option<AdminPermissions>> {
        let _t = QueryTimer::start("admin_permissions");
        sqlx::query_as::<_, AdminRow>("SELECT * FROM admin_permissions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(AdminPermissions::try_from)
            .transpose()
    }

    async fn upsert_admin_permissions(&self, perms: AdminPermissions) -> AppResult<AdminPermissions> {
        let _t = QueryTimer::start("upsert_admin_permissions");
        sqlx::query_as::<_, AdminRow>(
            r#"
            INSERT INTO admin_permissions (user_id, role, permissions)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role, permissions = EXCLUDED.permissions
            RETURNING *
            "#,
        )
        .bind(perms.user_id)
        .bind(perms.role.as_str())
        .bind(&perms.permissions)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    // -------------------------------------------------------------------------
    // Serials
    // -------------------------------------------------------------------------

    async fn issue_serials(&self, req: NewSerials) -> AppResult<Vec<Serial>> {
        let _t = QueryTimer::start("issue_serials");
        let count = req.anti_codes.len() as i64;
        let mut tx = self.pool.begin().await?;

        let last: i64 = sqlx::query_scalar("UPDATE products SET serial_seq = serial_seq + $2 WHERE id = $1 RETURNING serial_seq")
            .bind(req.product_id)
            .bind(count)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| not_found(format!("product {}", req.product_id)))?;
        let first = last - count + 1;

        let mut issued = Vec::with_capacity(req.anti_codes.len());
        for (offset, anti) in req.anti_codes.into_iter().enumerate() {
            let seq = first + offset as i64;
            let mut anti = anti;
            let mut attempts = 0;
            let serial = loop {
                let inserted = sqlx::query_as::<_, Serial>(
                    r#"
                    INSERT INTO serials
                        (serial_number, product_code, sequence_number, anti_counterfeit_code,
                         order_id, order_no, product_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (serial_number) DO NOTHING
                    RETURNING *
                    "#,
                )
                .bind(serial_number(&req.product_code, seq, &anti))
                .bind(&req.product_code)
                .bind(seq)
                .bind(&anti)
                .bind(req.order_id)
                .bind(&req.order_no)
                .bind(req.product_id)
                .fetch_optional(&mut *tx)
                .await?;
                if let Some(serial) = inserted {
                    break serial;
                }
                attempts += 1;
                if attempts > SERIAL_COLLISION_RETRIES {
                    return Err(AppError::Internal(format!(
                        "could not issue a unique serial for product {} sequence {seq}",
                        req.product_id
                    )));
                }
                anti = anti_counterfeit_code(&mut rand::thread_rng());
            };
            issued.push(serial);
        }

        tx.commit().await?;
        Ok(issued)
    }

    async fn serials_for_order(&self, order_id: i64) -> AppResult<Vec<Serial>> {
        let _t = QueryTimer::start("serials_for_order");
        let serials = sqlx::query_as::<_, Serial>("SELECT * FROM serials WHERE order_id = $1 ORDER BY id")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(serials)
    }

    async fn verify_serial(&self, serial_number: &str) -> AppResult<Option<Serial>> {
        let _t = QueryTimer::start("verify_serial");
        let serial = sqlx::query_as::<_, Serial>(
            r#"
            UPDATE serials
            SET view_count = view_count + 1,
                first_viewed_at = COALESCE(first_viewed_at, NOW()),
                last_viewed_at = NOW()
            WHERE serial_number = $1
            RETURNING *
            "#,
        )
        .bind(normalize_serial(serial_number))
        .fetch_optional(&self.pool)
        .await?;
        Ok(serial)
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    async fn inventory_logs(&self, query: &LogQuery) -> AppResult<Vec<InventoryLogEntry>> {
        let _t = QueryTimer::start("inventory_logs");
        sqlx::query_as::<_, LogRow>(
            r#"
            SELECT * FROM inventory_logs
            WHERE ($1::text IS NULL OR resource_kind = $1)
              AND ($2::bigint IS NULL OR resource_id = $2)
              AND ($3::text IS NULL OR order_no = $3)
              AND ($4::text IS NULL OR log_type = $4)
            ORDER BY id DESC
            LIMIT $5
            "#,
        )
        .bind(query.resource.map(|r| r.kind.as_str()))
        .bind(query.resource.map(|r| r.id))
        .bind(&query.order_no)
        .bind(query.log_type.map(|t| t.as_str()))
        .bind(query.effective_limit())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(InventoryLogEntry::try_from)
        .collect()
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------
    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

// These run against a real PostgreSQL:
// DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Actor;
    use crate::order::tests::blank_order;
    use crate::virtual_pool::AllocationPolicy;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    async fn database() -> Arc<Database> {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
        let db = Database::connect(&url).await.unwrap();
        db.run_migrations().await.unwrap();
        Arc::new(db)
    }

    fn admin() -> LogContext {
        LogContext::new(&Actor::Admin(1))
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    async fn stock(db: &Database, total: i32) -> Stock {
        let new = NewStock {
            sku: unique("SKU"),
            name: "Widget".into(),
            total,
            warehouse: "DEFAULT".into(),
            low_stock_threshold: 0,
        };
        db.create_stock(new, &admin()).await.unwrap()
    }

    async fn pool(db: &Database, size: usize) -> VirtualPool {
        let pool = db.create_pool("keys").await.unwrap();
        let items = (0..size)
            .map(|i| ImportedItem { content: format!("KEY-{i}"), remark: None })
            .collect();
        db.import_items(pool.id, items, &unique("BATCH"), &admin()).await.unwrap()
    }

    fn claim(resource: ResourceRef, quantity: i32) -> Claim {
        Claim {
            line_index: Some(0),
            product_id: None,
            resource,
            quantity,
            auto_delivery: true,
            policy: AllocationPolicy::Oldest,
        }
    }

    async fn place(db: Arc<Database>, claims: Vec<Claim>) -> AppResult<Order> {
        let new = NewOrder { order: blank_order(&unique("ORD")), claims };
        db.create_order(new, &admin()).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn last_unit_of_stock_goes_to_one_order() {
        let db = database().await;
        let stock = stock(&db, 1).await;

        let racers: Vec<_> = (0..4)
            .map(|_| tokio::spawn(place(db.clone(), vec![claim(stock.resource(), 1)])))
            .collect();
        let mut placed = 0;
        for racer in racers {
            match racer.await.unwrap() {
                Ok(_) => placed += 1,
                Err(e) => assert!(matches!(e, AppError::InsufficientStock { .. }), "{e}"),
            }
        }

        assert_eq!(placed, 1);
        let stock = db.get_stock(stock.id).await.unwrap().unwrap();
        assert_eq!((stock.ledger.reserved, stock.available()), (1, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn last_virtual_item_goes_to_one_order() {
        let db = database().await;
        let pool = pool(&db, 1).await;

        let racers: Vec<_> = (0..4)
            .map(|_| tokio::spawn(place(db.clone(), vec![claim(pool.resource(), 1)])))
            .collect();
        let mut winners = Vec::new();
        for racer in racers {
            match racer.await.unwrap() {
                Ok(order) => winners.push(order),
                Err(e) => assert!(matches!(e, AppError::InsufficientStock { .. }), "{e}"),
            }
        }

        assert_eq!(winners.len(), 1);
        let items = db.list_items(pool.id, Some(ItemStatus::Reserved)).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].order_no.as_deref(), Some(winners[0].order_no.as_str()));
        assert!(db.list_items(pool.id, Some(ItemStatus::Available)).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn concurrent_allocations_bind_distinct_items() {
        let db = database().await;
        let pool = pool(&db, 6).await;

        let racers: Vec<_> = (0..3)
            .map(|_| tokio::spawn(place(db.clone(), vec![claim(pool.resource(), 2)])))
            .collect();
        let mut bound = Vec::new();
        for racer in racers {
            let order = racer.await.unwrap().unwrap();
            bound.extend(order.reservations[0].item_ids.iter().copied());
        }

        bound.sort_unstable();
        bound.dedup();
        assert_eq!(bound.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs DATABASE_URL"]
    async fn crossed_claim_orders_do_not_deadlock() {
        let db = database().await;
        let a = stock(&db, 10).await;
        let b = stock(&db, 10).await;

        let forward = tokio::spawn(place(db.clone(), vec![claim(a.resource(), 1), claim(b.resource(), 1)]));
        let backward = tokio::spawn(place(db.clone(), vec![claim(b.resource(), 1), claim(a.resource(), 1)]));
        let (forward, backward) = tokio::time::timeout(Duration::from_secs(10), async {
            (forward.await.unwrap(), backward.await.unwrap())
        })
        .await
        .unwrap();

        forward.unwrap();
        backward.unwrap();
        for id in [a.id, b.id] {
            assert_eq!(db.get_stock(id).await.unwrap().unwrap().ledger.reserved, 2);
        }
    }
}

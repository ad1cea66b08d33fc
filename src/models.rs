// =============================================================================
// MODELS MODULE
// =============================================================================
// Catalog entities (stocks, products, users) and the request/response shapes
// of the HTTP API. Order, promo and virtual pool types live in their own
// modules next to the rules that govern them.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::ledger::{Ledger, Reservable, ResourceRef};
use crate::order::{Order, OrderItem, OrderStatus};
use crate::shipping::ShippingInput;

// =============================================================================
// STOCK (physical SKU ledger)
// =============================================================================
#[derive(Debug, Clone, Serialize)]
pub struct Stock {
    pub id: i64,

    /// Stock Keeping Unit, unique.
    pub sku: String,

    pub name: String,

    /// Counters. Physical stock is always bounded.
    pub ledger: Ledger,

    /// Warehouse location code, e.g. "SH-1".
    pub warehouse: String,

    /// Safety stock: alert once available drops to this level.
    pub low_stock_threshold: i32,

    /// Soft-disable flag; a disabled stock takes no new reservations.
    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stock {
    pub fn available(&self) -> i32 {
        self.ledger.available().unwrap_or(i32::MAX)
    }

    pub fn is_low_stock(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }
}

impl Reservable for Stock {
    fn resource(&self) -> ResourceRef {
        ResourceRef::stock(self.id)
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    fn accepts_reservations(&self, _now: DateTime<Utc>) -> bool {
        self.active
    }
}

#[cfg(test)]
impl Stock {
    pub fn for_tests(id: i64, sku: &str, total: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            sku: sku.to_string(),
            name: sku.to_string(),
            ledger: Ledger::bounded(total),
            warehouse: "DEFAULT".into(),
            low_stock_threshold: 0,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStock {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub total: i32,
    #[serde(default = "default_warehouse")]
    pub warehouse: String,
    #[serde(default)]
    pub low_stock_threshold: i32,
}

fn default_warehouse() -> String {
    "DEFAULT".to_string()
}

/// A stock at or below its safety threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowStockAlert {
    pub stock_id: i64,
    pub sku: String,
    pub name: String,
    pub available: i32,
    pub threshold: i32,
    pub warehouse: String,
}

impl From<&Stock> for LowStockAlert {
    fn from(stock: &Stock) -> Self {
        Self {
            stock_id: stock.id,
            sku: stock.sku.clone(),
            name: stock.name.clone(),
            available: stock.available(),
            threshold: stock.low_stock_threshold,
            warehouse: stock.warehouse.clone(),
        }
    }
}

// =============================================================================
// PRODUCTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Physical,
    Virtual,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Physical => "physical",
            ProductType::Virtual => "virtual",
        }
    }
}

impl FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "physical" => Ok(ProductType::Physical),
            "virtual" => Ok(ProductType::Virtual),
            other => Err(format!("unknown product type: {other}")),
        }
    }
}

/// A sellable catalog entry. Physical products draw from a [`Stock`],
/// virtual products from a virtual pool.
#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub product_type: ProductType,
    pub stock_id: Option<i64>,
    pub pool_id: Option<i64>,
    /// Deliver virtual items as soon as payment is confirmed.
    pub auto_delivery: bool,
    /// Serial prefix; serials are issued only when set.
    pub product_code: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn resource(&self) -> Option<ResourceRef> {
        match self.product_type {
            ProductType::Physical => self.stock_id.map(ResourceRef::stock),
            ProductType::Virtual => self.pool_id.map(ResourceRef::pool),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub product_type: ProductType,
    pub stock_id: Option<i64>,
    pub pool_id: Option<i64>,
    #[serde(default)]
    pub auto_delivery: bool,
    pub product_code: Option<String>,
}

impl NewProduct {
    pub fn check(&self) -> Result<(), (&'static str, String)> {
        if self.sku.trim().is_empty() || self.sku.len() > 64 {
            return Err(("sku", "must be 1-64 characters".into()));
        }
        if self.price < Decimal::ZERO {
            return Err(("price", "cannot be negative".into()));
        }
        match self.product_type {
            ProductType::Physical if self.stock_id.is_none() => {
                Err(("stock_id", "physical products need a stock".into()))
            }
            ProductType::Virtual if self.pool_id.is_none() => {
                Err(("pool_id", "virtual products need a pool".into()))
            }
            _ => match &self.product_code {
                Some(code)
                    if code.is_empty()
                        || code.len() > 16
                        || !code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) =>
                {
                    Err(("product_code", "must be 1-16 upper-case letters or digits".into()))
                }
                _ => Ok(()),
            },
        }
    }
}

// =============================================================================
// USERS
// =============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

/// One cart line at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: String,
    pub quantity: i32,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Storefront checkout.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub items: Vec<CartItem>,
    pub promo_code: Option<String>,
    pub user_email: Option<String>,
    pub remark: Option<String>,
    /// Receiver data supplied up front; otherwise a shipping form is issued
    /// once payment is confirmed.
    pub shipping: Option<ShippingInput>,
}

/// Third-party platform draft order.
#[derive(Debug, Clone, Deserialize)]
pub struct DraftRequest {
    pub source_platform: String,
    pub external_user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub external_order_id: Option<String>,
    pub items: Vec<CartItem>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftCreated {
    pub order_no: String,
    pub form_url: String,
    pub form_expires_at: Option<DateTime<Utc>>,
    pub order: Order,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingRequest {
    pub tracking_no: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReasonRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemarkRequest {
    pub remark: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormLink {
    pub order_no: String,
    pub form_url: String,
    pub form_expires_at: Option<DateTime<Utc>>,
}

/// What a form holder sees before submitting.
#[derive(Debug, Clone, Serialize)]
pub struct ShippingFormView {
    pub order_no: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub user_email: Option<String>,
    /// No email on the order; the form must supply `receiver_email`.
    pub email_required: bool,
    pub form_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormSubmission {
    pub order_no: String,
    pub user_id: i64,
    pub is_new_user: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdjustStockRequest {
    /// Positive to add, negative to remove.
    pub delta: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockInRequest {
    pub quantity: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPool {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportItemsRequest {
    /// One item per line: `content[,remark]`.
    pub text: String,
    pub batch_no: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub pool_id: i64,
    pub batch_no: String,
    pub imported: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromoValidateRequest {
    pub code: String,
    #[serde(default)]
    pub product_ids: Vec<i64>,
    pub order_amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockListResponse {
    pub items: Vec<Stock>,
    pub total: i64,
    pub page: i32,
    pub per_page: i32,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    /// `None` when no cache is configured.
    pub redis: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error: error.into(), message: message.into(), field: None }
    }

    pub fn for_field(
        error: impl Into<String>,
        message: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self { error: error.into(), message: message.into(), field: Some(field.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_stock_at_threshold() {
        let mut stock = Stock::for_tests(1, "SKU-1", 10);
        stock.low_stock_threshold = 3;
        stock.ledger.sold = 6;
        assert!(!stock.is_low_stock());
        stock.ledger.reserved = 1;
        assert!(stock.is_low_stock());
    }

    #[test]
    fn product_needs_matching_resource() {
        let product = NewProduct {
            sku: "KEY-1".into(),
            name: "Key".into(),
            price: Decimal::ONE,
            product_type: ProductType::Virtual,
            stock_id: Some(1),
            pool_id: None,
            auto_delivery: true,
            product_code: None,
        };
        assert_eq!(product.check().unwrap_err().0, "pool_id");

        let fixed = NewProduct { pool_id: Some(2), product_code: Some("k1".into()), ..product };
        assert_eq!(fixed.check().unwrap_err().0, "product_code");
    }
}

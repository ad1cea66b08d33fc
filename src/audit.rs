// =============================================================================
// AUDIT TRAIL
// =============================================================================
// Append-only records: one inventory log entry per ledger mutation, one order
// event per applied state transition. Neither is ever updated after write.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ledger::{LedgerChange, ResourceRef};
use crate::order::{OrderStatus, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    In,
    Out,
    Reserve,
    Release,
    Adjust,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::In => "in",
            LogType::Out => "out",
            LogType::Reserve => "reserve",
            LogType::Release => "release",
            LogType::Adjust => "adjust",
        }
    }
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(LogType::In),
            "out" => Ok(LogType::Out),
            "reserve" => Ok(LogType::Reserve),
            "release" => Ok(LogType::Release),
            "adjust" => Ok(LogType::Adjust),
            other => Err(format!("unknown log type: {other}")),
        }
    }
}

/// Who caused a change. Rendered into the `operator` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    System,
    Sweeper,
    Customer(i64),
    Admin(i64),
    Platform(String),
    /// Anonymous holder of a shipping form token.
    FormHolder,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Sweeper => f.write_str("system:auto_cancel"),
            Actor::Customer(id) => write!(f, "user:{id}"),
            Actor::Admin(id) => write!(f, "admin:{id}"),
            Actor::Platform(name) => write!(f, "platform:{name}"),
            Actor::FormHolder => f.write_str("form"),
        }
    }
}

/// Context shared by every log entry written inside one operation.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub order_no: Option<String>,
    pub operator: String,
    pub reason: Option<String>,
}

impl LogContext {
    pub fn new(actor: &Actor) -> Self {
        Self { order_no: None, operator: actor.to_string(), reason: None }
    }

    pub fn for_order(actor: &Actor, order_no: impl Into<String>) -> Self {
        Self { order_no: Some(order_no.into()), operator: actor.to_string(), reason: None }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

// -----------------------------------------------------------------------------
// INVENTORY LOG
// -----------------------------------------------------------------------------

/// Structured payload of an inventory log entry, one shape per cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogDetails {
    /// Reservation lifecycle of an order line (or the order's promo claim).
    OrderClaim {
        line_index: Option<i32>,
        product_id: Option<i64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        item_ids: Vec<i64>,
    },
    /// Reversal of a completed sale. Virtual items are rendered unusable.
    Refund {
        line_index: Option<i32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        invalidated_item_ids: Vec<i64>,
    },
    Import { batch_no: String, count: i32 },
    Invalidation { item_id: i64 },
    Restock,
    Correction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryLogEntry {
    pub id: i64,
    pub log_type: LogType,
    pub resource: ResourceRef,
    pub quantity: i32,
    pub before: i32,
    pub after: i32,
    pub order_no: Option<String>,
    pub operator: String,
    pub reason: Option<String>,
    pub details: LogDetails,
    pub created_at: DateTime<Utc>,
}

impl InventoryLogEntry {
    /// Build an entry for a change; the store assigns `id`.
    pub fn from_change(
        resource: ResourceRef,
        change: &LedgerChange,
        ctx: &LogContext,
        details: LogDetails,
    ) -> Self {
        Self {
            id: 0,
            log_type: change.op.log_type(),
            resource,
            quantity: change.quantity,
            before: change.before,
            after: change.after,
            order_no: ctx.order_no.clone(),
            operator: ctx.operator.clone(),
            reason: ctx.reason.clone(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Filter for the read-only inventory log query.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub resource: Option<ResourceRef>,
    pub order_no: Option<String>,
    pub log_type: Option<LogType>,
    pub limit: Option<i64>,
}

impl LogQuery {
    pub fn matches(&self, entry: &InventoryLogEntry) -> bool {
        self.resource.map_or(true, |r| r == entry.resource)
            && self.order_no.as_deref().map_or(true, |o| entry.order_no.as_deref() == Some(o))
            && self.log_type.map_or(true, |t| t == entry.log_type)
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }
}

// -----------------------------------------------------------------------------
// ORDER EVENTS
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    Created { reservations: usize },
    Ledger { deducted: usize, released: usize, returned: usize, delivered_items: usize },
    Form { user_id: i64, new_user: bool },
    Tracking { tracking_no: String },
    Note { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: i64,
    pub order_id: i64,
    pub order_no: String,
    /// `None` for the creation event.
    pub trigger: Option<Trigger>,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub operator: String,
    pub details: EventDetails,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_are_tagged_by_kind() {
        let details = LogDetails::OrderClaim { line_index: Some(0), product_id: Some(7), item_ids: vec![] };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["kind"], "order_claim");
        assert!(json.get("item_ids").is_none());

        let back: LogDetails = serde_json::from_value(json).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    fn actors_render_as_operator_strings() {
        assert_eq!(Actor::Admin(3).to_string(), "admin:3");
        assert_eq!(Actor::Platform("shopify".into()).to_string(), "platform:shopify");
        assert_eq!(Actor::Sweeper.to_string(), "system:auto_cancel");
    }
}

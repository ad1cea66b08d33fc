// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the order service. Prometheus scrapes /metrics;
// the helpers below wrap the raw macros with consistent labels.
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Available units per physical stock. Labels: sku, warehouse
pub const INVENTORY_STOCK_LEVEL: &str = "inventory_stock_level";

/// Labels: resource (stock/virtual_pool/promo_code), status (success/failed)
pub const INVENTORY_RESERVATIONS_TOTAL: &str = "inventory_reservations_total";

/// Stocks at or below their safety threshold
pub const INVENTORY_LOW_STOCK_ITEMS: &str = "inventory_low_stock_items";

/// Labels: trigger, outcome (applied/noop/rejected)
pub const ORDER_TRANSITIONS_TOTAL: &str = "order_transitions_total";

pub const ORDERS_AUTO_CANCELLED_TOTAL: &str = "orders_auto_cancelled_total";

/// Labels: kind
pub const NOTIFICATION_FAILURES_TOTAL: &str = "notification_failures_total";

/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder and return the render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_gauge!(INVENTORY_STOCK_LEVEL, "Available units for each physical SKU");
    describe_counter!(INVENTORY_RESERVATIONS_TOTAL, "Reservation attempts by resource kind");
    describe_gauge!(INVENTORY_LOW_STOCK_ITEMS, "Number of stocks at or below their low stock threshold");
    describe_counter!(ORDER_TRANSITIONS_TOTAL, "Order state transitions by trigger and outcome");
    describe_counter!(ORDERS_AUTO_CANCELLED_TOTAL, "Unpaid orders cancelled by the sweep");
    describe_counter!(NOTIFICATION_FAILURES_TOTAL, "Notifications dropped after exhausting retries");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn set_stock_level(sku: &str, warehouse: &str, level: i32) {
    gauge!(
        INVENTORY_STOCK_LEVEL,
        "sku" => sku.to_string(),
        "warehouse" => warehouse.to_string()
    )
    .set(level as f64);
}

pub fn record_reservation(resource: &str, success: bool) {
    let status = if success { "success" } else { "failed" };
    counter!(
        INVENTORY_RESERVATIONS_TOTAL,
        "resource" => resource.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn set_low_stock_count(count: i64) {
    gauge!(INVENTORY_LOW_STOCK_ITEMS).set(count as f64);
}

/// `outcome` is one of applied, noop, rejected.
pub fn record_transition(trigger: &str, outcome: &str) {
    counter!(
        ORDER_TRANSITIONS_TOTAL,
        "trigger" => trigger.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_auto_cancelled(count: u64) {
    counter!(ORDERS_AUTO_CANCELLED_TOTAL).increment(count);
}

pub fn record_notification_failure(kind: &str) {
    counter!(NOTIFICATION_FAILURES_TOTAL, "kind" => kind.to_string()).increment(1);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

pub fn record_redis_operation(operation: &str, duration_secs: f64) {
    histogram!(
        REDIS_OPERATION_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

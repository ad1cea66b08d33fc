// =============================================================================
// HANDLERS MODULE
// =============================================================================
// Thin HTTP adapter over `OrderService`: extract, call, wrap in JSON. Every
// rule lives in the service; handlers only decide who the caller is.
//
// Authentication happens at the gateway, which forwards trusted headers:
// - x-user-id:   numeric user id of the signed-in user
// - x-user-role: `admin` or `super_admin` for back-office users
// - x-platform:  name of a third-party platform integration
// =============================================================================

use axum::{
    async_trait,
    extract::{FromRequestParts, MatchedPath, Path, Query, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{Actor, InventoryLogEntry, LogQuery, LogType, OrderEvent};
use crate::error::{AppError, AppResult};
use crate::ledger::{ResourceKind, ResourceRef};
use crate::metrics;
use crate::models::*;
use crate::order::Order;
use crate::permissions::{AdminPermissions, AdminRole};
use crate::promo::{NewPromoCode, PromoCode, PromoQuote};
use crate::serial::Serial;
use crate::shipping::ShippingForm;
use crate::virtual_pool::{ItemStatus, PoolStats, VirtualPool, VirtualStockItem};
use crate::AppState;

// =============================================================================
// CALLER IDENTITY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Guest,
    Customer,
    Admin,
    SuperAdmin,
}

/// Who is calling, as asserted by the gateway headers.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Option<i64>,
    pub role: Role,
    pub platform: Option<String>,
}

impl Caller {
    pub fn actor(&self) -> Actor {
        match (self.role, self.user_id, &self.platform) {
            (Role::Admin | Role::SuperAdmin, Some(id), _) => Actor::Admin(id),
            (_, _, Some(platform)) => Actor::Platform(platform.clone()),
            (Role::Customer, Some(id), _) => Actor::Customer(id),
            _ => Actor::System,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin | Role::SuperAdmin)
    }

    /// Id of a back-office caller.
    pub fn require_admin(&self) -> AppResult<i64> {
        match self.user_id {
            Some(id) if self.is_admin() => Ok(id),
            _ => Err(AppError::Forbidden("admin access required".into())),
        }
    }

    pub fn require_super_admin(&self) -> AppResult<i64> {
        match self.user_id {
            Some(id) if self.role == Role::SuperAdmin => Ok(id),
            _ => Err(AppError::Forbidden("super admin access required".into())),
        }
    }

    pub fn require_platform(&self) -> AppResult<&str> {
        self.platform
            .as_deref()
            .ok_or_else(|| AppError::Forbidden("platform integration required".into()))
    }

    /// Payment callbacks come from back-office users or platform integrations.
    pub fn require_trusted(&self) -> AppResult<Actor> {
        if self.is_admin() || self.platform.is_some() {
            Ok(self.actor())
        } else {
            Err(AppError::Forbidden("payment confirmation requires a trusted caller".into()))
        }
    }

    /// Admins see every order; customers only their own.
    fn can_access(&self, order: &Order) -> bool {
        self.is_admin() || (self.user_id.is_some() && order.user_id == self.user_id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let user_id = header("x-user-id")
            .map(|raw| {
                raw.parse::<i64>()
                    .map_err(|_| AppError::BadRequest(format!("invalid x-user-id header: {raw}")))
            })
            .transpose()?;

        let role = match (header("x-user-role"), user_id) {
            (_, None) => Role::Guest,
            (Some("super_admin"), Some(_)) => Role::SuperAdmin,
            (Some("admin"), Some(_)) => Role::Admin,
            _ => Role::Customer,
        };

        Ok(Caller { user_id, role, platform: header("x-platform").map(str::to_string) })
    }
}

// =============================================================================
// HTTP METRICS
// =============================================================================

/// Records count and latency per route template rather than raw path.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    metrics::record_http_request(
        method.as_str(),
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "order-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /ready
///
/// 503 when the store is unreachable. Redis only counts when configured.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> Response {
    let db_healthy = state.store.health_check().await;

    let redis_healthy = match &state.redis {
        Some(redis) => Some(
            redis::cmd("PING")
                .query_async::<_, String>(&mut redis.clone())
                .await
                .is_ok(),
        ),
        None => None,
    };

    let all_healthy = db_healthy && redis_healthy.unwrap_or(true);
    let response = ReadinessResponse {
        status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
        checks: ReadinessChecks { database: db_healthy, redis: redis_healthy },
    };

    if all_healthy {
        Json(response).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response)).into_response()
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// STOCKS
// =============================================================================

/// GET /api/v1/stocks?page=2&per_page=50
#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_page")]
    pub page: i32,
    #[serde(default = "default_per_page")]
    pub per_page: i32,
}

fn default_page() -> i32 {
    1
}
fn default_per_page() -> i32 {
    20
}

pub async fn list_stocks(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(params): Query<ListParams>,
) -> AppResult<Json<StockListResponse>> {
    caller.require_admin()?;
    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);
    let (items, total) = state.service.list_stocks(page, per_page).await?;
    Ok(Json(StockListResponse { items, total, page, per_page }))
}

/// POST /api/v1/stocks
pub async fn create_stock(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(new): Json<NewStock>,
) -> AppResult<(StatusCode, Json<Stock>)> {
    caller.require_admin()?;
    let stock = state.service.create_stock(new, &caller.actor()).await?;
    Ok((StatusCode::CREATED, Json(stock)))
}

/// GET /api/v1/stocks/:id
pub async fn get_stock(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
) -> AppResult<Json<Stock>> {
    caller.require_admin()?;
    Ok(Json(state.service.get_stock(id).await?))
}

/// POST /api/v1/stocks/:id/adjust
///
/// ```json
/// { "delta": -3, "reason": "Damaged in warehouse" }
/// ```
pub async fn adjust_stock(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
    Json(req): Json<AdjustStockRequest>,
) -> AppResult<Json<Stock>> {
    caller.require_admin()?;
    Ok(Json(state.service.adjust_stock(id, req, &caller.actor()).await?))
}

/// POST /api/v1/stocks/:id/in
pub async fn stock_in(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
    Json(req): Json<StockInRequest>,
) -> AppResult<Json<Stock>> {
    caller.require_admin()?;
    Ok(Json(state.service.stock_in(id, req, &caller.actor()).await?))
}

/// GET /api/v1/stocks/alerts
pub async fn low_stock_alerts(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> AppResult<Json<Vec<LowStockAlert>>> {
    caller.require_admin()?;
    Ok(Json(state.service.low_stock_alerts().await?))
}

// =============================================================================
// VIRTUAL POOLS
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PoolView {
    #[serde(flatten)]
    pub pool: VirtualPool,
    pub items: PoolStats,
}

#[derive(Debug, Deserialize)]
pub struct ItemFilter {
    pub status: Option<ItemStatus>,
}

/// POST /api/v1/pools
pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(new): Json<NewPool>,
) -> AppResult<(StatusCode, Json<VirtualPool>)> {
    caller.require_admin()?;
    let pool = state.service.create_pool(&new.name).await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

/// GET /api/v1/pools/:id
pub async fn get_pool(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
) -> AppResult<Json<PoolView>> {
    caller.require_admin()?;
    let (pool, items) = state.service.get_pool(id).await?;
    Ok(Json(PoolView { pool, items }))
}

/// POST /api/v1/pools/:id/items
///
/// ```json
/// { "text": "KEY-AAAA,first batch\nKEY-BBBB", "batch_no": null }
/// ```
pub async fn import_items(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
    Json(req): Json<ImportItemsRequest>,
) -> AppResult<(StatusCode, Json<ImportResult>)> {
    caller.require_admin()?;
    let result = state.service.import_items(id, req, &caller.actor()).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /api/v1/pools/:id/items?status=available
pub async fn list_items(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
    Query(filter): Query<ItemFilter>,
) -> AppResult<Json<Vec<VirtualStockItem>>> {
    caller.require_admin()?;
    Ok(Json(state.service.list_items(id, filter.status).await?))
}

/// POST /api/v1/items/:id/invalidate
pub async fn invalidate_item(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<i64>,
) -> AppResult<Json<VirtualStockItem>> {
    caller.require_admin()?;
    Ok(Json(state.service.invalidate_item(id, &caller.actor()).await?))
}

// =============================================================================
// CATALOG
// =============================================================================

/// POST /api/v1/products
pub async fn create_product(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(new): Json<NewProduct>,
) -> AppResult<(StatusCode, Json<Product>)> {
    caller.require_admin()?;
    let product = state.service.create_product(new).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// GET /api/v1/products/:sku
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(sku): Path<String>,
) -> AppResult<Json<Product>> {
    Ok(Json(state.service.product_by_sku(&sku).await?))
}

/// POST /api/v1/promo-codes
pub async fn create_promo(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(new): Json<NewPromoCode>,
) -> AppResult<(StatusCode, Json<PromoCode>)> {
    caller.require_admin()?;
    let promo = state.service.create_promo(new).await?;
    Ok((StatusCode::CREATED, Json(promo)))
}

/// GET /api/v1/promo-codes/:code
pub async fn get_promo(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(code): Path<String>,
) -> AppResult<Json<PromoCode>> {
    caller.require_admin()?;
    Ok(Json(state.service.get_promo(&code).await?))
}

/// POST /api/v1/promo-codes/validate
///
/// Quotes the discount without reserving the code.
pub async fn validate_promo(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PromoValidateRequest>,
) -> AppResult<Json<PromoQuote>> {
    Ok(Json(state.service.validate_promo(req).await?))
}

// =============================================================================
// ORDERS
// =============================================================================

/// POST /api/v1/orders
///
/// ```json
/// {
///   "items": [{ "sku": "BOOK-001", "quantity": 2 }],
///   "promo_code": "PERCENT10",
///   "user_email": "buyer@example.com"
/// }
/// ```
pub async fn checkout(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, Json<Order>)> {
    let order = state.service.checkout(req, &caller.actor()).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// POST /api/v1/orders/draft
pub async fn create_draft(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(mut req): Json<DraftRequest>,
) -> AppResult<(StatusCode, Json<DraftCreated>)> {
    // The header wins over whatever the body claims.
    req.source_platform = caller.require_platform()?.to_string();
    let draft = state.service.create_draft(req).await?;
    Ok((StatusCode::CREATED, Json(draft)))
}

/// GET /api/v1/orders/:order_no
///
/// Receiver details of privacy-protected orders are masked unless the admin
/// holds `order.view_privacy`.
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<Order>> {
    let viewer = if caller.is_admin() { caller.user_id } else { None };
    let order = state.service.view_order(&order_no, viewer).await?;
    authorize(&caller, &order)?;
    Ok(Json(order))
}

/// GET /api/v1/orders/:order_no/events
pub async fn order_events(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<Vec<OrderEvent>>> {
    caller.require_admin()?;
    Ok(Json(state.service.order_events(&order_no).await?))
}

/// GET /api/v1/orders/:order_no/serials
pub async fn order_serials(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<Vec<Serial>>> {
    let order = state.service.view_order(&order_no, None).await?;
    authorize(&caller, &order)?;
    Ok(Json(state.service.order_serials(&order_no).await?))
}

/// POST /api/v1/orders/:order_no/pay
///
/// Payment gateway callback; safe to repeat.
pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<Order>> {
    let actor = caller.require_trusted()?;
    Ok(Json(state.service.confirm_payment(&order_no, &actor).await?))
}

/// POST /api/v1/orders/:order_no/resubmit
pub async fn request_resubmit(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> AppResult<Json<FormLink>> {
    caller.require_admin()?;
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(state.service.request_resubmit(&order_no, &caller.actor(), reason).await?))
}

/// POST /api/v1/orders/:order_no/form-link
pub async fn refresh_form(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<FormLink>> {
    if !caller.is_admin() && caller.platform.is_none() {
        return Err(AppError::Forbidden("form links are issued to admins and platforms".into()));
    }
    Ok(Json(state.service.refresh_form(&order_no).await?))
}

/// POST /api/v1/orders/:order_no/ship
pub async fn assign_tracking(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
    Json(req): Json<TrackingRequest>,
) -> AppResult<Json<Order>> {
    caller.require_admin()?;
    Ok(Json(state.service.assign_tracking(&order_no, &req.tracking_no, &caller.actor()).await?))
}

/// POST /api/v1/orders/:order_no/deliver
pub async fn deliver_virtual(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<Order>> {
    caller.require_admin()?;
    Ok(Json(state.service.deliver_virtual(&order_no, &caller.actor()).await?))
}

/// POST /api/v1/orders/:order_no/complete
pub async fn confirm_receipt(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
) -> AppResult<Json<Order>> {
    let order = state.service.view_order(&order_no, None).await?;
    authorize(&caller, &order)?;
    Ok(Json(state.service.confirm_receipt(&order_no, &caller.actor()).await?))
}

/// POST /api/v1/orders/:order_no/cancel
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> AppResult<Json<Order>> {
    let order = state.service.view_order(&order_no, None).await?;
    authorize(&caller, &order)?;
    if order.paid_at.is_some() {
        caller.require_admin()?;
    }
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(state.service.cancel(&order_no, &caller.actor(), reason).await?))
}

/// POST /api/v1/orders/:order_no/refund
pub async fn refund_order(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> AppResult<Json<Order>> {
    caller.require_admin()?;
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(state.service.refund(&order_no, &caller.actor(), reason).await?))
}

/// POST /api/v1/orders/:order_no/remark
pub async fn add_admin_remark(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(order_no): Path<String>,
    Json(req): Json<RemarkRequest>,
) -> AppResult<Json<Order>> {
    let admin_id = caller.require_admin()?;
    Ok(Json(state.service.add_admin_remark(&order_no, admin_id, &req.remark).await?))
}

fn authorize(caller: &Caller, order: &Order) -> AppResult<()> {
    if caller.can_access(order) {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("order {} not found", order.order_no)))
    }
}

// =============================================================================
// SHIPPING FORMS
// =============================================================================
// Public: possession of the token is the only credential.

/// GET /api/v1/forms/:token
pub async fn get_form(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> AppResult<Json<ShippingFormView>> {
    Ok(Json(state.service.get_form(&token).await?))
}

/// POST /api/v1/forms/:token
pub async fn submit_form(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(form): Json<ShippingForm>,
) -> AppResult<Json<FormSubmission>> {
    Ok(Json(state.service.submit_form(&token, form).await?))
}

// =============================================================================
// AUDIT, SERIALS & PERMISSIONS
// =============================================================================

/// GET /api/v1/inventory/logs?resource_kind=stock&resource_id=3&limit=50
#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub resource_kind: Option<ResourceKind>,
    pub resource_id: Option<i64>,
    pub order_no: Option<String>,
    pub log_type: Option<LogType>,
    pub limit: Option<i64>,
}

impl LogParams {
    fn into_query(self) -> AppResult<LogQuery> {
        let resource = match (self.resource_kind, self.resource_id) {
            (Some(kind), Some(id)) => Some(ResourceRef { kind, id }),
            (None, None) => None,
            _ => {
                return Err(AppError::validation(
                    "resource_id",
                    "resource_kind and resource_id must be given together",
                ))
            }
        };
        Ok(LogQuery {
            resource,
            order_no: self.order_no,
            log_type: self.log_type,
            limit: Some(self.limit.unwrap_or(100).clamp(1, 500)),
        })
    }
}

pub async fn inventory_logs(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(params): Query<LogParams>,
) -> AppResult<Json<Vec<InventoryLogEntry>>> {
    caller.require_admin()?;
    Ok(Json(state.service.inventory_logs(&params.into_query()?).await?))
}

/// GET /api/v1/serials/:serial/verify
pub async fn verify_serial(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> AppResult<Json<Serial>> {
    Ok(Json(state.service.verify_serial(&serial).await?))
}

#[derive(Debug, Deserialize)]
pub struct PermissionsUpdate {
    pub role: AdminRole,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// PUT /api/v1/admins/:user_id/permissions
pub async fn update_permissions(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(user_id): Path<i64>,
    Json(update): Json<PermissionsUpdate>,
) -> AppResult<Json<AdminPermissions>> {
    caller.require_super_admin()?;
    let perms = AdminPermissions { user_id, role: update.role, permissions: update.permissions };
    Ok(Json(state.service.update_permissions(perms).await?))
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    async fn caller(headers: &[(&str, &str)]) -> Result<Caller, AppError> {
        let mut builder = HttpRequest::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn role_requires_a_user_id() {
        let guest = caller(&[("x-user-role", "super_admin")]).await.unwrap();
        assert_eq!(guest.role, Role::Guest);
        assert!(guest.require_admin().is_err());
        assert!(matches!(guest.actor(), Actor::System));
    }

    #[tokio::test]
    async fn admin_headers_map_to_admin_actor() {
        let admin = caller(&[("x-user-id", "12"), ("x-user-role", "admin")]).await.unwrap();
        assert_eq!(admin.require_admin().unwrap(), 12);
        assert!(admin.require_super_admin().is_err());
        assert!(matches!(admin.actor(), Actor::Admin(12)));

        let customer = caller(&[("x-user-id", "5")]).await.unwrap();
        assert_eq!(customer.role, Role::Customer);
        assert!(customer.require_trusted().is_err());
    }

    #[tokio::test]
    async fn platform_header_is_trusted_for_payments() {
        let platform = caller(&[("x-platform", "shopify")]).await.unwrap();
        assert_eq!(platform.require_platform().unwrap(), "shopify");
        assert!(matches!(platform.require_trusted().unwrap(), Actor::Platform(name) if name == "shopify"));
    }

    #[tokio::test]
    async fn malformed_user_id_is_rejected() {
        assert!(matches!(caller(&[("x-user-id", "abc")]).await, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn log_params_need_kind_and_id_together() {
        let params = LogParams {
            resource_kind: Some(ResourceKind::Stock),
            resource_id: None,
            order_no: None,
            log_type: None,
            limit: None,
        };
        assert!(matches!(params.into_query(), Err(AppError::Validation { .. })));

        let params = LogParams {
            resource_kind: Some(ResourceKind::VirtualPool),
            resource_id: Some(4),
            order_no: None,
            log_type: Some(LogType::Reserve),
            limit: Some(10_000),
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.resource, Some(ResourceRef::pool(4)));
        assert_eq!(query.limit, Some(500));
    }
}

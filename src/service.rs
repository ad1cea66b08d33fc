// =============================================================================
// ORDER SERVICE
// =============================================================================
// Every order mutation goes through `run_transition`: read the order, consult
// the transition table, build the new row, then hand the store one
// compare-and-swap together with the ledger effect. A lost race re-reads and
// re-evaluates. Notifications and serials follow a committed transition;
// neither can undo it.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::{Actor, EventDetails, InventoryLogEntry, LogContext, LogQuery, OrderEvent};
use crate::config::{Config, ConfigHandle};
use crate::error::{AppError, AppResult};
use crate::ledger::{ResourceRef, MAX_QUANTITY};
use crate::metrics;
use crate::models::{
    AdjustStockRequest, CartItem, CheckoutRequest, DraftCreated, DraftRequest, FormLink,
    FormSubmission, ImportItemsRequest, ImportResult, LowStockAlert, NewProduct, NewStock,
    Product, ProductType, PromoValidateRequest, ShippingFormView, StockInRequest, Stock,
};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::order::{generate_order_no, Order, OrderItem, OrderStatus, Trigger};
use crate::password;
use crate::permissions::{AdminPermissions, PermissionCache, VIEW_PRIVACY};
use crate::promo::{self, normalize_code, NewPromoCode, PromoCode, PromoError, PromoQuote};
use crate::serial::{NewSerials, Serial};
use crate::shipping::{escape_html, normalize_email, ShippingForm, ValidForm};
use crate::store::{Claim, NewOrder, Store, TransitionOutcome, TransitionRequest, TransitionResult};
use crate::virtual_pool::{
    batch_no, parse_import, AllocationPolicy, ItemStatus, PoolStats, VirtualPool, VirtualStockItem,
};

/// Re-reads after a lost compare-and-swap before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Orders cancelled per sweep pass.
const SWEEP_BATCH: i64 = 200;

const MAX_REMARK_LEN: usize = 1000;

/// Result of one transition attempt.
enum Step {
    Changed(TransitionOutcome),
    /// The trigger's work was already done; nothing was written.
    Unchanged(Order),
}

impl Step {
    fn into_order(self) -> Order {
        match self {
            Step::Changed(outcome) => outcome.order,
            Step::Unchanged(order) => order,
        }
    }
}

struct PricedCart {
    items: Vec<OrderItem>,
    claims: Vec<Claim>,
    subtotal: Decimal,
}

pub struct OrderService {
    store: Arc<dyn Store>,
    config: ConfigHandle,
    notifier: Arc<dyn Notifier>,
    permissions: PermissionCache,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn Store>,
        config: ConfigHandle,
        notifier: Arc<dyn Notifier>,
        permissions: PermissionCache,
    ) -> Self {
        Self { store, config, notifier, permissions }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    // =========================================================================
    // ORDER CREATION
    // =========================================================================

    /// Storefront checkout. Every line, and the promo code when given, is
    /// reserved together; a zero-amount order is confirmed on the spot.
    pub async fn checkout(&self, req: CheckoutRequest, actor: &Actor) -> AppResult<Order> {
        let config = self.config.snapshot();
        let now = Utc::now();
        let PricedCart { items, mut claims, subtotal } =
            self.price_cart(&req.items, config.order.virtual_delivery_order).await?;

        let product_ids: Vec<i64> = items.iter().map(|i| i.product_id).collect();
        let quote = match req.promo_code.as_deref().map(normalize_code).filter(|c| !c.is_empty()) {
            Some(code) => {
                let promo = self.store.promo_by_code(&code).await?;
                let quote = promo::validate_code(promo.as_ref(), &product_ids, subtotal, now)?;
                claims.push(Claim {
                    line_index: None,
                    product_id: None,
                    resource: ResourceRef::promo(quote.promo_id),
                    quantity: 1,
                    auto_delivery: false,
                    policy: config.order.virtual_delivery_order,
                });
                Some(quote)
            }
            None => None,
        };

        let receiver = req.shipping.as_ref().map(|s| s.validate()).transpose()?;
        let user_email = optional_email(req.user_email.as_deref(), "user_email")?;

        let mut order = blank_order(&config, items, now);
        order.status = OrderStatus::PendingPayment;
        order.subtotal_amount = subtotal;
        if let Some(quote) = &quote {
            order.discount_amount = quote.discount;
            order.promo_code_id = Some(quote.promo_id);
            order.promo_code = Some(quote.code.clone());
        }
        order.total_amount = subtotal - order.discount_amount;
        order.user_id = match actor {
            Actor::Customer(id) => Some(*id),
            _ => None,
        };
        order.user_email = user_email;
        order.receiver = receiver;
        if let Some(remark) = sanitized_remark(req.remark.as_deref())? {
            order.append_remark(&remark);
        }

        let order = self.create(&config, order, claims, actor).await?;
        info!(
            order_no = %order.order_no,
            total = %order.total_amount,
            lines = order.items.len(),
            promo = order.promo_code.as_deref().unwrap_or("-"),
            "Order created"
        );
        self.notify(NotificationKind::OrderCreated, &order);

        if order.total_amount.is_zero() {
            return self.confirm_payment(&order.order_no, &Actor::System).await;
        }
        Ok(order)
    }

    /// Third-party platform order. Stock is reserved now; the buyer completes
    /// receiver details through the returned form link.
    pub async fn create_draft(&self, req: DraftRequest) -> AppResult<DraftCreated> {
        let config = self.config.snapshot();
        let now = Utc::now();
        let platform = req.source_platform.trim();
        if platform.is_empty() || platform.len() > 64 {
            return Err(AppError::validation("source_platform", "must be 1-64 characters"));
        }
        let external_user_id = req.external_user_id.trim();
        if external_user_id.is_empty() {
            return Err(AppError::validation("external_user_id", "is required"));
        }

        let PricedCart { items, claims, subtotal } =
            self.price_cart(&req.items, config.order.virtual_delivery_order).await?;

        let mut order = blank_order(&config, items, now);
        order.status = OrderStatus::Draft;
        order.subtotal_amount = subtotal;
        order.total_amount = subtotal;
        order.source_platform = Some(platform.to_string());
        order.external_user_id = Some(external_user_id.to_string());
        order.external_order_id = req.external_order_id.map(|id| id.trim().to_string());
        order.user_name = req.user_name.map(|name| escape_html(name.trim()));
        order.user_email = optional_email(req.user_email.as_deref(), "user_email")?;
        if let Some(remark) = sanitized_remark(req.remark.as_deref())? {
            order.append_remark(&remark);
        }
        order.issue_form_token(now, config.form.expire_hours);

        let actor = Actor::Platform(platform.to_string());
        let order = self.create(&config, order, claims, &actor).await?;
        let link = form_link(&config, &order)?;
        info!(order_no = %order.order_no, platform, "Draft order created");

        Ok(DraftCreated {
            order_no: link.order_no,
            form_url: link.form_url,
            form_expires_at: link.form_expires_at,
            order,
        })
    }

    async fn price_cart(&self, cart: &[CartItem], policy: AllocationPolicy) -> AppResult<PricedCart> {
        if cart.is_empty() {
            return Err(AppError::validation("items", "at least one item is required"));
        }

        let mut items = Vec::with_capacity(cart.len());
        let mut claims = Vec::with_capacity(cart.len() + 1);
        for (index, line) in cart.iter().enumerate() {
            if !(1..=MAX_QUANTITY).contains(&line.quantity) {
                return Err(AppError::validation(
                    "quantity",
                    format!("must be between 1 and {MAX_QUANTITY}, got {}", line.quantity),
                ));
            }
            let sku = line.sku.trim();
            let product = self
                .store
                .product_by_sku(sku)
                .await?
                .filter(|p| p.active)
                .ok_or_else(|| AppError::NotFound(format!("product {sku} not found")))?;
            let resource = product
                .resource()
                .ok_or_else(|| AppError::Internal(format!("product {sku} has no stock source")))?;

            claims.push(Claim {
                line_index: Some(index as i32),
                product_id: Some(product.id),
                resource,
                quantity: line.quantity,
                auto_delivery: product.product_type == ProductType::Virtual && product.auto_delivery,
                policy,
            });
            items.push(OrderItem {
                product_id: product.id,
                sku: product.sku,
                name: product.name,
                quantity: line.quantity,
                unit_price: product.price,
                attributes: line.attributes.clone(),
                product_type: product.product_type,
            });
        }

        let subtotal = items.iter().map(OrderItem::line_total).sum();
        Ok(PricedCart { items, claims, subtotal })
    }

    async fn create(&self, config: &Config, mut order: Order, claims: Vec<Claim>, actor: &Actor) -> AppResult<Order> {
        order.order_no = generate_order_no(&config.order.no_prefix, order.created_at, &mut rand::thread_rng());
        let kinds: Vec<&'static str> = claims.iter().map(|c| c.resource.kind.as_str()).collect();
        let ctx = LogContext::for_order(actor, order.order_no.clone());

        match self.store.create_order(NewOrder { order, claims }, &ctx).await {
            Ok(order) => {
                for kind in kinds {
                    metrics::record_reservation(kind, true);
                }
                Ok(order)
            }
            Err(e) => {
                if let AppError::InsufficientStock { resource, available, requested } = &e {
                    metrics::record_reservation(resource.kind.as_str(), false);
                    warn!(%resource, available, requested, "Reservation refused");
                } else if let AppError::Promo(reason) = &e {
                    metrics::record_reservation("promo_code", false);
                    warn!(reason = reason.code(), "Promo reservation refused");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// `prepare` receives the row as read and the row to write (status
    /// already set) and may return event details. It runs again after every
    /// lost race.
    async fn run_transition<F>(
        &self,
        order_no: &str,
        trigger: Trigger,
        ctx: LogContext,
        mut prepare: F,
    ) -> AppResult<Step>
    where
        F: FnMut(&Order, &mut Order, DateTime<Utc>) -> AppResult<Option<EventDetails>> + Send,
    {
        let mut current = self.load(order_no).await?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            if current.already_applied(trigger) {
                metrics::record_transition(trigger.as_str(), "noop");
                debug!(order_no, trigger = trigger.as_str(), status = current.status.as_str(), "Already applied");
                return Ok(Step::Unchanged(current));
            }
            let Some(plan) = current.plan(trigger) else {
                metrics::record_transition(trigger.as_str(), "rejected");
                return Err(conflict(&current, trigger));
            };

            let now = Utc::now();
            let mut updated = current.clone();
            updated.status = plan.to;
            let details = prepare(&current, &mut updated, now)?;

            let req = TransitionRequest {
                order_no: current.order_no.clone(),
                expected_status: current.status,
                expected_updated_at: current.updated_at,
                updated,
                trigger,
                effect: plan.effect,
                details,
                ctx: ctx.clone(),
            };
            match self.store.apply_transition(req).await? {
                TransitionResult::Applied(outcome) => {
                    metrics::record_transition(trigger.as_str(), "applied");
                    info!(
                        order_no,
                        trigger = trigger.as_str(),
                        from = current.status.as_str(),
                        to = outcome.order.status.as_str(),
                        deducted = outcome.counts.deducted,
                        released = outcome.counts.released,
                        returned = outcome.counts.returned,
                        "Order transitioned"
                    );
                    return Ok(Step::Changed(outcome));
                }
                TransitionResult::Stale(latest) => {
                    debug!(order_no, trigger = trigger.as_str(), attempt, "Order changed concurrently; re-evaluating");
                    current = latest;
                }
            }
        }

        metrics::record_transition(trigger.as_str(), "rejected");
        warn!(order_no, trigger = trigger.as_str(), "Gave up after repeated concurrent updates");
        Err(conflict(&current, trigger))
    }

    /// Payment confirmation from the gateway. Delivered at least once, so a
    /// repeat returns the order as it is.
    pub async fn confirm_payment(&self, order_no: &str, actor: &Actor) -> AppResult<Order> {
        let config = self.config.snapshot();
        let ctx = LogContext::for_order(actor, order_no);
        let step = self
            .run_transition(order_no, Trigger::PaymentConfirmed, ctx, |_, next, now| {
                next.paid_at = Some(now);
                match next.status {
                    OrderStatus::Draft => {
                        next.issue_form_token(now, config.form.expire_hours);
                    }
                    OrderStatus::Shipped => next.shipped_at = Some(now),
                    _ => {}
                }
                Ok(None)
            })
            .await?;

        match step {
            Step::Unchanged(order) => Ok(order),
            Step::Changed(outcome) => {
                self.notify(NotificationKind::PaymentConfirmed, &outcome.order);
                self.after_fulfillment(&outcome, false).await;
                Ok(outcome.order)
            }
        }
    }

    /// Send the order back for new receiver details.
    pub async fn request_resubmit(&self, order_no: &str, actor: &Actor, reason: Option<String>) -> AppResult<FormLink> {
        let config = self.config.snapshot();
        let reason = sanitized_remark(reason.as_deref())?;
        let ctx = LogContext::for_order(actor, order_no).with_reason(reason.clone());
        let step = self
            .run_transition(order_no, Trigger::ResubmitRequested, ctx, |_, next, now| {
                next.receiver = None;
                next.privacy_protected = false;
                next.issue_form_token(now, config.form.expire_hours);
                Ok(reason.clone().map(|text| EventDetails::Note { text }))
            })
            .await?;

        match step {
            Step::Changed(outcome) => {
                let link = form_link(&config, &outcome.order)?;
                self.notify(NotificationKind::ResubmitRequested { form_url: link.form_url.clone() }, &outcome.order);
                Ok(link)
            }
            Step::Unchanged(order) => self.refresh_form(&order.order_no).await,
        }
    }

    /// Current form link, reissued when the token is missing, used, expired
    /// or about to expire.
    pub async fn refresh_form(&self, order_no: &str) -> AppResult<FormLink> {
        let config = self.config.snapshot();
        let order = self.load(order_no).await?;
        if !order.status.awaits_form() {
            return Err(AppError::BadRequest(format!(
                "order {order_no} is {}; no shipping form is pending",
                order.status
            )));
        }
        if !order.needs_fresh_form_token(Utc::now()) {
            return form_link(&config, &order);
        }

        let ctx = LogContext::for_order(&Actor::System, order_no);
        let order = self
            .run_transition(order_no, Trigger::FormRefreshed, ctx, |_, next, now| {
                next.issue_form_token(now, config.form.expire_hours);
                Ok(None)
            })
            .await?
            .into_order();
        form_link(&config, &order)
    }

    pub async fn assign_tracking(&self, order_no: &str, tracking_no: &str, actor: &Actor) -> AppResult<Order> {
        let tracking_no = tracking_no.trim();
        if tracking_no.is_empty() || tracking_no.chars().count() > 100 {
            return Err(AppError::validation("tracking_no", "must be 1-100 characters"));
        }
        let current = self.load(order_no).await?;
        if current.status == OrderStatus::Shipped && current.tracking_no.as_deref() == Some(tracking_no) {
            return Ok(current);
        }

        let ctx = LogContext::for_order(actor, order_no);
        let step = self
            .run_transition(order_no, Trigger::TrackingAssigned, ctx, |_, next, now| {
                next.tracking_no = Some(tracking_no.to_string());
                next.shipped_at = Some(now);
                Ok(Some(EventDetails::Tracking { tracking_no: tracking_no.to_string() }))
            })
            .await?;

        match step {
            Step::Unchanged(order) => Ok(order),
            Step::Changed(outcome) => {
                self.notify(NotificationKind::Shipped { tracking_no: tracking_no.to_string() }, &outcome.order);
                self.after_fulfillment(&outcome, true).await;
                Ok(outcome.order)
            }
        }
    }

    /// Manual hand-over of virtual items that were not auto-delivered.
    pub async fn deliver_virtual(&self, order_no: &str, actor: &Actor) -> AppResult<Order> {
        let ctx = LogContext::for_order(actor, order_no);
        let step = self
            .run_transition(order_no, Trigger::VirtualDelivered, ctx, |_, next, now| {
                if next.status == OrderStatus::Shipped && next.shipped_at.is_none() {
                    next.shipped_at = Some(now);
                }
                Ok(None)
            })
            .await?;

        match step {
            Step::Unchanged(order) => Ok(order),
            Step::Changed(outcome) => {
                self.after_fulfillment(&outcome, false).await;
                Ok(outcome.order)
            }
        }
    }

    pub async fn confirm_receipt(&self, order_no: &str, actor: &Actor) -> AppResult<Order> {
        let ctx = LogContext::for_order(actor, order_no);
        let step = self
            .run_transition(order_no, Trigger::ReceiptConfirmed, ctx, |_, next, now| {
                next.completed_at = Some(now);
                Ok(None)
            })
            .await?;

        if let Step::Changed(outcome) = &step {
            self.notify(NotificationKind::Completed, &outcome.order);
        }
        Ok(step.into_order())
    }

    /// Cancel releases reservations. A paid order that has not shipped yet is
    /// refunded instead, which only an admin may do.
    pub async fn cancel(&self, order_no: &str, actor: &Actor, reason: Option<String>) -> AppResult<Order> {
        let current = self.load(order_no).await?;
        if current.already_applied(Trigger::Cancelled) {
            return Ok(current);
        }
        if current.has_deducted() {
            return self.cancel_as_refund(&current, actor, reason).await;
        }

        let raw_reason = reason.clone();
        let reason = sanitized_remark(reason.as_deref())?;
        let ctx = LogContext::for_order(actor, order_no).with_reason(reason.clone());
        let result = self
            .run_transition(order_no, Trigger::Cancelled, ctx, |_, _, _| Ok(reason.clone().map(|text| EventDetails::Note { text })))
            .await;

        match result {
            Ok(Step::Changed(outcome)) => {
                self.notify(NotificationKind::Cancelled, &outcome.order);
                Ok(outcome.order)
            }
            Ok(Step::Unchanged(order)) => Ok(order),
            // Payment may have landed between the read and the write.
            Err(AppError::StateConflict { .. }) => {
                let latest = self.load(order_no).await?;
                if latest.has_deducted() {
                    self.cancel_as_refund(&latest, actor, raw_reason).await
                } else {
                    Err(conflict(&latest, Trigger::Cancelled))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_as_refund(&self, current: &Order, actor: &Actor, reason: Option<String>) -> AppResult<Order> {
        if !cancellable(current.status) {
            return Err(conflict(current, Trigger::Cancelled));
        }
        if !matches!(actor, Actor::Admin(_) | Actor::System) {
            return Err(AppError::Forbidden("only an admin can cancel a paid order".into()));
        }
        self.refund(&current.order_no, actor, reason).await
    }

    pub async fn refund(&self, order_no: &str, actor: &Actor, reason: Option<String>) -> AppResult<Order> {
        let reason = sanitized_remark(reason.as_deref())?;
        let ctx = LogContext::for_order(actor, order_no).with_reason(reason.clone());
        let step = self
            .run_transition(order_no, Trigger::Refunded, ctx, |_, _, _| Ok(reason.clone().map(|text| EventDetails::Note { text })))
            .await?;

        if let Step::Changed(outcome) = &step {
            self.notify(NotificationKind::Refunded, &outcome.order);
        }
        Ok(step.into_order())
    }

    /// Returns whether this call cancelled the order.
    pub async fn auto_cancel(&self, order_no: &str) -> AppResult<bool> {
        let ctx = LogContext::for_order(&Actor::Sweeper, order_no).with_reason(Some("payment timeout".into()));
        match self.run_transition(order_no, Trigger::AutoCancelled, ctx, |_, _, _| Ok(None)).await {
            Ok(Step::Changed(outcome)) => {
                self.notify(NotificationKind::Cancelled, &outcome.order);
                Ok(true)
            }
            Ok(Step::Unchanged(_)) => Ok(false),
            // Paid or cancelled by someone else in the meantime.
            Err(AppError::StateConflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cancel unpaid orders older than the configured window. Safe to run on
    /// several replicas at once.
    pub async fn auto_cancel_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let hours = self.config.snapshot().order.auto_cancel_hours;
        if hours == 0 {
            return Ok(0);
        }
        let cutoff = now - Duration::hours(hours);
        let stale = self.store.stale_pending_payment(cutoff, SWEEP_BATCH).await?;

        let mut cancelled = 0u64;
        for order_no in &stale {
            match self.auto_cancel(order_no).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!(order_no = %order_no, error = %e, "Auto-cancel failed; will retry next sweep"),
            }
        }
        if cancelled > 0 {
            metrics::record_auto_cancelled(cancelled);
            info!(cancelled, candidates = stale.len(), "Expired unpaid orders cancelled");
        }
        Ok(cancelled)
    }

    pub async fn add_admin_remark(&self, order_no: &str, admin_id: i64, remark: &str) -> AppResult<Order> {
        let remark = sanitized_remark(Some(remark))?
            .ok_or_else(|| AppError::validation("remark", "is required"))?;
        let ctx = LogContext::for_order(&Actor::Admin(admin_id), order_no);
        let step = self
            .run_transition(order_no, Trigger::AdminRemark, ctx, |_, next, now| {
                next.append_admin_remark(&remark, now);
                Ok(Some(EventDetails::Note { text: remark.clone() }))
            })
            .await?;
        Ok(step.into_order())
    }

    // =========================================================================
    // SHIPPING FORM
    // =========================================================================

    pub async fn get_form(&self, token: &str) -> AppResult<ShippingFormView> {
        let order = self.open_form(token, Utc::now()).await?;
        Ok(ShippingFormView {
            order_no: order.order_no,
            status: order.status,
            email_required: order.user_email.is_none(),
            user_email: order.user_email,
            items: order.items,
            form_expires_at: order.form_expires_at,
        })
    }

    pub async fn submit_form(&self, token: &str, form: ShippingForm) -> AppResult<FormSubmission> {
        let order = self.open_form(token, Utc::now()).await?;
        let ValidForm { receiver, privacy_protected, password, remark } = form.validate()?;

        let email = match order.user_email.clone() {
            Some(email) => email,
            None => receiver
                .email
                .clone()
                .ok_or_else(|| AppError::validation("receiver_email", "is required when the order has no email"))?,
        };

        let (user_id, is_new_user, generated) = match order.user_id {
            Some(user_id) => (user_id, false, None),
            None => self.resolve_user(&email, password).await?,
        };
        // Announced even when another submission wins the transition.
        if is_new_user {
            self.notifier.queue(Notification {
                kind: NotificationKind::Welcome { email: email.clone(), password: generated },
                order_no: Some(order.order_no.clone()),
                recipient: Some(email.clone()),
            });
        }

        let ctx = LogContext::for_order(&Actor::FormHolder, order.order_no.clone());
        let result = self
            .run_transition(&order.order_no, Trigger::FormSubmitted, ctx, |current, next, now| {
                if current.form_token.as_deref() != Some(token) || !current.form_open(now) {
                    return Err(form_not_found());
                }
                next.receiver = Some(receiver.clone());
                next.privacy_protected = privacy_protected;
                next.form_submitted_at = Some(now);
                next.user_id = Some(user_id);
                next.user_email = Some(email.clone());
                if let Some(remark) = &remark {
                    next.append_remark(remark);
                }
                Ok(Some(EventDetails::Form { user_id, new_user: is_new_user }))
            })
            .await;
        let order = match result {
            Ok(step) => step.into_order(),
            Err(AppError::StateConflict { .. }) => return Err(form_not_found()),
            Err(e) => return Err(e),
        };

        info!(order_no = %order.order_no, user_id, is_new_user, privacy_protected, "Shipping form submitted");

        Ok(FormSubmission { order_no: order.order_no, user_id, is_new_user })
    }

    async fn open_form(&self, token: &str, now: DateTime<Utc>) -> AppResult<Order> {
        self.store
            .order_by_form_token(token)
            .await?
            .filter(|o| o.form_open(now))
            .ok_or_else(form_not_found)
    }

    /// Find the account for `email`, or create one. Returns the generated
    /// password when the service chose it.
    async fn resolve_user(
        &self,
        email: &str,
        chosen: Option<SecretString>,
    ) -> AppResult<(i64, bool, Option<SecretString>)> {
        if let Some(user) = self.store.find_user_by_email(email).await? {
            return Ok((user.id, false, None));
        }

        let (secret, generated) = match chosen {
            Some(secret) => (secret, false),
            None => (password::generate_password(), true),
        };
        let hash = password::hash_password(secret.expose_secret())?;
        let (user, created) = self.store.create_user(email, &hash).await?;
        if created {
            debug!(user_id = user.id, generated, "User account created from shipping form");
        }
        Ok((user.id, created, (created && generated).then_some(secret)))
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Receiver details of a privacy-protected order are masked unless the
    /// viewer holds `order.view_privacy`.
    pub async fn view_order(&self, order_no: &str, viewer: Option<i64>) -> AppResult<Order> {
        let mut order = self.load(order_no).await?;
        if order.privacy_protected {
            let allowed = match viewer {
                Some(user_id) => self.permissions.has(user_id, VIEW_PRIVACY).await?,
                None => false,
            };
            if !allowed {
                order.redact_receiver();
            }
        }
        Ok(order)
    }

    pub async fn order_events(&self, order_no: &str) -> AppResult<Vec<OrderEvent>> {
        let order = self.load(order_no).await?;
        self.store.order_events(order.id).await
    }

    pub async fn order_serials(&self, order_no: &str) -> AppResult<Vec<Serial>> {
        let order = self.load(order_no).await?;
        self.store.serials_for_order(order.id).await
    }

    pub async fn verify_serial(&self, serial_number: &str) -> AppResult<Serial> {
        self.store
            .verify_serial(serial_number)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("serial {} not found", serial_number.trim())))
    }

    pub async fn inventory_logs(&self, query: &LogQuery) -> AppResult<Vec<InventoryLogEntry>> {
        self.store.inventory_logs(query).await
    }

    async fn load(&self, order_no: &str) -> AppResult<Order> {
        self.store
            .order_by_no(order_no)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_no} not found")))
    }

    // =========================================================================
    // CATALOG & INVENTORY
    // =========================================================================

    pub async fn create_stock(&self, new: NewStock, actor: &Actor) -> AppResult<Stock> {
        let sku = new.sku.trim();
        if sku.is_empty() || sku.len() > 64 {
            return Err(AppError::validation("sku", "must be 1-64 characters"));
        }
        if new.name.trim().is_empty() {
            return Err(AppError::validation("name", "is required"));
        }
        if new.total < 0 || new.low_stock_threshold < 0 {
            return Err(AppError::validation("total", "quantities cannot be negative"));
        }
        let new = NewStock { sku: sku.to_string(), name: new.name.trim().to_string(), ..new };
        let stock = self.store.create_stock(new, &LogContext::new(actor)).await?;
        metrics::set_stock_level(&stock.sku, &stock.warehouse, stock.available());
        info!(sku = %stock.sku, total = stock.available(), "Stock created");
        Ok(stock)
    }

    pub async fn get_stock(&self, id: i64) -> AppResult<Stock> {
        self.store
            .get_stock(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("stock {id} not found")))
    }

    pub async fn list_stocks(&self, page: i32, per_page: i32) -> AppResult<(Vec<Stock>, i64)> {
        let (stocks, total) = self.store.list_stocks(page.max(1), per_page.clamp(1, 100)).await?;
        for stock in &stocks {
            metrics::set_stock_level(&stock.sku, &stock.warehouse, stock.available());
        }
        Ok((stocks, total))
    }

    pub async fn stock_in(&self, id: i64, req: StockInRequest, actor: &Actor) -> AppResult<Stock> {
        let ctx = LogContext::new(actor).with_reason(sanitized_remark(req.reason.as_deref())?);
        let stock = self.store.stock_in(id, req.quantity, &ctx).await?;
        metrics::set_stock_level(&stock.sku, &stock.warehouse, stock.available());
        info!(sku = %stock.sku, quantity = req.quantity, "Stock received");
        Ok(stock)
    }

    /// Admin correction of `total`; a reason is mandatory.
    pub async fn adjust_stock(&self, id: i64, req: AdjustStockRequest, actor: &Actor) -> AppResult<Stock> {
        let reason = sanitized_remark(Some(&req.reason))?
            .ok_or_else(|| AppError::validation("reason", "is required for adjustments"))?;
        let ctx = LogContext::new(actor).with_reason(Some(reason));
        let stock = self.store.adjust_stock(id, req.delta, &ctx).await?;
        metrics::set_stock_level(&stock.sku, &stock.warehouse, stock.available());
        info!(sku = %stock.sku, delta = req.delta, "Stock adjusted");
        Ok(stock)
    }

    pub async fn low_stock_alerts(&self) -> AppResult<Vec<LowStockAlert>> {
        let stocks = self.store.low_stock_stocks().await?;
        metrics::set_low_stock_count(stocks.len() as i64);
        Ok(stocks.iter().map(LowStockAlert::from).collect())
    }

    pub async fn create_pool(&self, name: &str) -> AppResult<VirtualPool> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 255 {
            return Err(AppError::validation("name", "must be 1-255 characters"));
        }
        self.store.create_pool(&escape_html(name)).await
    }

    pub async fn get_pool(&self, id: i64) -> AppResult<(VirtualPool, PoolStats)> {
        self.store
            .get_pool(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("pool {id} not found")))
    }

    pub async fn import_items(&self, pool_id: i64, req: ImportItemsRequest, actor: &Actor) -> AppResult<ImportResult> {
        let items = parse_import(&req.text);
        if items.is_empty() {
            return Err(AppError::validation("text", "contains no items"));
        }
        if items.len() > MAX_QUANTITY as usize {
            return Err(AppError::validation("text", format!("at most {MAX_QUANTITY} items per import")));
        }
        let batch = req
            .batch_no
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| batch_no(Utc::now()));

        let imported = items.len();
        self.store.import_items(pool_id, items, &batch, &LogContext::new(actor)).await?;
        info!(pool_id, batch_no = %batch, imported, "Virtual items imported");
        Ok(ImportResult { pool_id, batch_no: batch, imported })
    }

    pub async fn list_items(&self, pool_id: i64, status: Option<ItemStatus>) -> AppResult<Vec<VirtualStockItem>> {
        self.get_pool(pool_id).await?;
        self.store.list_items(pool_id, status).await
    }

    pub async fn invalidate_item(&self, item_id: i64, actor: &Actor) -> AppResult<VirtualStockItem> {
        let item = self.store.invalidate_item(item_id, &LogContext::new(actor)).await?;
        info!(item_id, pool_id = item.pool_id, "Virtual item invalidated");
        Ok(item)
    }

    pub async fn create_product(&self, new: NewProduct) -> AppResult<Product> {
        new.check().map_err(|(field, message)| AppError::validation(field, message))?;
        self.store.create_product(new).await
    }

    pub async fn product_by_sku(&self, sku: &str) -> AppResult<Product> {
        self.store
            .product_by_sku(sku.trim())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("product {sku} not found")))
    }

    pub async fn create_promo(&self, new: NewPromoCode) -> AppResult<PromoCode> {
        new.check().map_err(|(field, message)| AppError::validation(field, message))?;
        let promo = self.store.create_promo(new).await?;
        info!(code = %promo.code, "Promo code created");
        Ok(promo)
    }

    pub async fn get_promo(&self, code: &str) -> AppResult<PromoCode> {
        self.store
            .promo_by_code(&normalize_code(code))
            .await?
            .ok_or(AppError::Promo(PromoError::NotFound))
    }

    /// Read-only check; nothing is reserved.
    pub async fn validate_promo(&self, req: PromoValidateRequest) -> AppResult<PromoQuote> {
        let promo = self.store.promo_by_code(&normalize_code(&req.code)).await?;
        Ok(promo::validate_code(promo.as_ref(), &req.product_ids, req.order_amount, Utc::now())?)
    }

    pub async fn update_permissions(&self, perms: AdminPermissions) -> AppResult<AdminPermissions> {
        self.permissions.update(perms).await
    }

    pub async fn has_permission(&self, user_id: i64, permission: &str) -> AppResult<bool> {
        self.permissions.has(user_id, permission).await
    }

    // =========================================================================
    // SIDE EFFECTS
    // =========================================================================

    fn notify(&self, kind: NotificationKind, order: &Order) {
        self.notifier
            .queue(Notification::for_order(kind, &order.order_no, order.user_email.as_deref()));
    }

    /// Delivery notice and serials for what a transition handed over.
    /// `shipped` adds the order's physical lines.
    async fn after_fulfillment(&self, outcome: &TransitionOutcome, shipped: bool) {
        let order = &outcome.order;
        let delivered_items: usize = outcome.delivered.iter().map(|d| d.item_ids.len()).sum();
        if delivered_items > 0 {
            self.notify(NotificationKind::VirtualDelivered { items: delivered_items }, order);
        }

        let mut lines: Vec<(i64, usize)> = outcome
            .delivered
            .iter()
            .filter_map(|d| d.product_id.map(|id| (id, d.item_ids.len())))
            .collect();
        if shipped {
            lines.extend(
                order
                    .items
                    .iter()
                    .filter(|i| i.product_type == ProductType::Physical)
                    .map(|i| (i.product_id, i.quantity as usize)),
            );
        }
        self.issue_serials(order, lines).await;
    }

    async fn issue_serials(&self, order: &Order, lines: Vec<(i64, usize)>) {
        for (product_id, count) in lines {
            if count == 0 {
                continue;
            }
            let product = match self.store.product_by_id(product_id).await {
                Ok(Some(product)) => product,
                Ok(None) => continue,
                Err(e) => {
                    warn!(order_no = %order.order_no, product_id, error = %e, "Serial issuance skipped");
                    continue;
                }
            };
            let Some(code) = product.product_code.as_deref() else {
                continue;
            };
            let req = NewSerials::generate(order.id, &order.order_no, product_id, code, count);
            match self.store.issue_serials(req).await {
                Ok(serials) => debug!(order_no = %order.order_no, product_id, issued = serials.len(), "Serials issued"),
                Err(e) => warn!(order_no = %order.order_no, product_id, error = %e, "Serial issuance failed"),
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Statuses a cancel request may start from. Later statuses need an explicit refund.
fn cancellable(status: OrderStatus) -> bool {
    matches!(
        status,
        OrderStatus::Draft | OrderStatus::PendingPayment | OrderStatus::Pending | OrderStatus::NeedResubmit
    )
}

fn conflict(order: &Order, trigger: Trigger) -> AppError {
    AppError::StateConflict { order_no: order.order_no.clone(), status: order.status, trigger }
}

fn form_not_found() -> AppError {
    AppError::NotFound("shipping form not found or expired".into())
}

fn form_link(config: &Config, order: &Order) -> AppResult<FormLink> {
    let token = order
        .form_token
        .as_deref()
        .ok_or_else(|| AppError::Internal(format!("order {} has no form token", order.order_no)))?;
    Ok(FormLink {
        order_no: order.order_no.clone(),
        form_url: config.form_url(token),
        form_expires_at: order.form_expires_at,
    })
}

fn optional_email(raw: Option<&str>, field: &'static str) -> AppResult<Option<String>> {
    match raw.map(str::trim).filter(|e| !e.is_empty()) {
        Some(email) => normalize_email(email)
            .map(Some)
            .ok_or_else(|| AppError::validation(field, "is not a valid email address")),
        None => Ok(None),
    }
}

/// Trimmed, HTML-escaped and length-checked; blank is `None`.
fn sanitized_remark(raw: Option<&str>) -> AppResult<Option<String>> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(remark) if remark.chars().count() > MAX_REMARK_LEN => Err(AppError::validation(
            "remark",
            format!("must be at most {MAX_REMARK_LEN} characters"),
        )),
        Some(remark) => Ok(Some(escape_html(remark))),
        None => Ok(None),
    }
}

/// An order row before the store assigns its id and number.
fn blank_order(config: &Config, items: Vec<OrderItem>, now: DateTime<Utc>) -> Order {
    Order {
        id: 0,
        order_no: String::new(),
        status: OrderStatus::PendingPayment,
        items,
        receiver: None,
        privacy_protected: false,
        form_token: None,
        form_expires_at: None,
        form_submitted_at: None,
        subtotal_amount: Decimal::ZERO,
        discount_amount: Decimal::ZERO,
        total_amount: Decimal::ZERO,
        currency: config.order.currency.clone(),
        promo_code_id: None,
        promo_code: None,
        tracking_no: None,
        shipped_at: None,
        paid_at: None,
        completed_at: None,
        user_id: None,
        user_email: None,
        user_name: None,
        source_platform: None,
        external_user_id: None,
        external_order_id: None,
        remark: None,
        admin_remark: None,
        created_at: now,
        updated_at: now,
        reservations: Vec::new(),
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::LogType;
    use crate::memory::MemoryStore;
    use crate::notify::RecordingNotifier;
    use crate::order::ReservationState;
    use crate::permissions::AdminRole;
    use crate::promo::{DiscountType, ProductScope};
    use crate::shipping::ShippingInput;

    struct Harness {
        service: Arc<OrderService>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        harness_with(Config::for_tests())
    }

    fn harness_with(config: Config) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let dyn_store: Arc<dyn Store> = store.clone();
        let service = OrderService::new(
            dyn_store.clone(),
            ConfigHandle::new(config),
            notifier.clone(),
            PermissionCache::new(None, dyn_store),
        );
        Harness { service: Arc::new(service), store, notifier }
    }

    fn admin() -> Actor {
        Actor::Admin(1)
    }

    async fn physical(h: &Harness, sku: &str, total: i32, price: i64) -> Product {
        let stock = h
            .service
            .create_stock(
                NewStock {
                    sku: format!("STK-{sku}"),
                    name: sku.into(),
                    total,
                    warehouse: "DEFAULT".into(),
                    low_stock_threshold: 0,
                },
                &admin(),
            )
            .await
            .unwrap();
        h.service
            .create_product(NewProduct {
                sku: sku.into(),
                name: sku.into(),
                price: Decimal::from(price),
                product_type: ProductType::Physical,
                stock_id: Some(stock.id),
                pool_id: None,
                auto_delivery: false,
                product_code: None,
            })
            .await
            .unwrap()
    }

    async fn licenses(h: &Harness, sku: &str, keys: &str, auto_delivery: bool) -> Product {
        let pool = h.service.create_pool("license keys").await.unwrap();
        h.service
            .import_items(pool.id, ImportItemsRequest { text: keys.into(), batch_no: None }, &admin())
            .await
            .unwrap();
        h.service
            .create_product(NewProduct {
                sku: sku.into(),
                name: "License".into(),
                price: Decimal::from(30),
                product_type: ProductType::Virtual,
                stock_id: None,
                pool_id: Some(pool.id),
                auto_delivery,
                product_code: Some("KEY".into()),
            })
            .await
            .unwrap()
    }

    fn line(sku: &str, quantity: i32) -> CartItem {
        CartItem { sku: sku.into(), quantity, attributes: Default::default() }
    }

    fn shipping() -> ShippingInput {
        ShippingInput {
            receiver_name: "Li Lei".into(),
            receiver_phone: "13812345678".into(),
            receiver_email: Some("li@example.com".into()),
            receiver_address: "1 Wensan Rd".into(),
            ..Default::default()
        }
    }

    fn cart(items: Vec<CartItem>, with_shipping: bool) -> CheckoutRequest {
        CheckoutRequest {
            items,
            promo_code: None,
            user_email: Some("buyer@shop.test".into()),
            remark: None,
            shipping: with_shipping.then(shipping),
        }
    }

    fn form(privacy_protected: bool) -> ShippingForm {
        ShippingForm { shipping: shipping(), privacy_protected, password: None, remark: None }
    }

    fn token_of(url: &str) -> String {
        url.rsplit('=').next().unwrap().to_string()
    }

    async fn stock_of(h: &Harness, product: &Product) -> Stock {
        h.store.get_stock(product.stock_id.unwrap()).await.unwrap().unwrap()
    }

    async fn logs(h: &Harness, order_no: &str, log_type: LogType) -> Vec<InventoryLogEntry> {
        h.store
            .inventory_logs(&LogQuery { order_no: Some(order_no.into()), log_type: Some(log_type), ..Default::default() })
            .await
            .unwrap()
    }

    // -------------------------------------------------------------------------
    // Reservation
    // -------------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checkouts_never_oversell() {
        let h = harness();
        let product = physical(&h, "LAST-ONE", 1, 50).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = h.service.clone();
            tasks.push(tokio::spawn(async move {
                service.checkout(cart(vec![line("LAST-ONE", 1)], true), &Actor::System).await
            }));
        }
        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(AppError::InsufficientStock { available, requested, .. }) => {
                    assert_eq!((available, requested), (0, 1));
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(won, 1);
        let stock = stock_of(&h, &product).await;
        assert_eq!(stock.ledger.reserved, 1);
        assert_eq!(stock.available(), 0);
    }

    #[tokio::test]
    async fn failed_line_leaves_earlier_lines_unreserved() {
        let h = harness();
        let plenty = physical(&h, "PLENTY", 10, 5).await;
        physical(&h, "SCARCE", 1, 5).await;

        let err = h
            .service
            .checkout(cart(vec![line("PLENTY", 3), line("SCARCE", 2)], true), &Actor::System)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InsufficientStock { .. }));
        assert_eq!(stock_of(&h, &plenty).await.ledger.reserved, 0);
        assert!(h.notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn percentage_promo_discounts_and_uses_quota() {
        let h = harness();
        physical(&h, "BOOK", 10, 100).await;
        h.service
            .create_promo(NewPromoCode {
                code: "percent10".into(),
                description: None,
                discount_type: DiscountType::Percentage,
                discount_value: Decimal::from(10),
                min_order_amount: Decimal::ZERO,
                max_discount: Decimal::ZERO,
                total_quantity: 1,
                expires_at: None,
                product_scope: ProductScope::All,
                product_ids: vec![],
            })
            .await
            .unwrap();

        let mut req = cart(vec![line("BOOK", 2)], true);
        req.promo_code = Some(" Percent10 ".into());
        let order = h.service.checkout(req.clone(), &Actor::System).await.unwrap();
        assert_eq!(order.discount_amount, Decimal::from(20));
        assert_eq!(order.total_amount, Decimal::from(180));
        assert_eq!(order.promo_code.as_deref(), Some("PERCENT10"));

        let promo = h.service.get_promo("PERCENT10").await.unwrap();
        assert_eq!((promo.reserved_quantity(), promo.used_quantity()), (1, 0));

        let err = h.service.checkout(req, &Actor::System).await.unwrap_err();
        assert!(matches!(err, AppError::Promo(PromoError::Exhausted)));

        h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        let promo = h.service.get_promo("PERCENT10").await.unwrap();
        assert_eq!((promo.reserved_quantity(), promo.used_quantity()), (0, 1));
    }

    #[tokio::test]
    async fn cancel_returns_promo_quota() {
        let h = harness();
        physical(&h, "MUG", 10, 20).await;
        h.service
            .create_promo(NewPromoCode {
                code: "ONCE".into(),
                description: None,
                discount_type: DiscountType::Fixed,
                discount_value: Decimal::from(5),
                min_order_amount: Decimal::ZERO,
                max_discount: Decimal::ZERO,
                total_quantity: 1,
                expires_at: None,
                product_scope: ProductScope::All,
                product_ids: vec![],
            })
            .await
            .unwrap();

        let mut req = cart(vec![line("MUG", 1)], true);
        req.promo_code = Some("ONCE".into());
        let first = h.service.checkout(req.clone(), &Actor::System).await.unwrap();
        h.service.cancel(&first.order_no, &Actor::Customer(7), Some("changed my mind".into())).await.unwrap();

        let promo = h.service.get_promo("ONCE").await.unwrap();
        assert_eq!(promo.reserved_quantity(), 0);
        let second = h.service.checkout(req, &Actor::System).await.unwrap();
        assert_eq!(second.total_amount, Decimal::from(15));
    }

    // -------------------------------------------------------------------------
    // Payment & fulfillment
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn payment_confirmation_is_idempotent() {
        let h = harness();
        let product = physical(&h, "LAMP", 5, 40).await;
        let order = h.service.checkout(cart(vec![line("LAMP", 2)], true), &Actor::System).await.unwrap();

        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        let again = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();

        assert_eq!(paid.status, OrderStatus::Pending);
        assert_eq!(again.paid_at, paid.paid_at);
        assert_eq!(again.updated_at, paid.updated_at);
        let stock = stock_of(&h, &product).await;
        assert_eq!((stock.ledger.reserved, stock.ledger.sold), (0, 2));
        assert_eq!(logs(&h, &order.order_no, LogType::Out).await.len(), 1);
        assert_eq!(h.service.order_events(&order.order_no).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn auto_delivery_ships_oldest_items_with_serials() {
        let mut config = Config::for_tests();
        config.order.virtual_delivery_order = AllocationPolicy::Oldest;
        let h = harness_with(config);
        licenses(&h, "LIC", "K1\nK2\nK3", true).await;

        let order = h.service.checkout(cart(vec![line("LIC", 2)], false), &Actor::System).await.unwrap();
        let shipped = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();

        assert_eq!(shipped.status, OrderStatus::Shipped);
        assert!(shipped.shipped_at.is_some());
        let contents: Vec<String> =
            h.store.delivered_items(shipped.id).await.unwrap().into_iter().map(|i| i.content).collect();
        assert_eq!(contents, vec!["K1", "K2"]);

        let serials = h.service.order_serials(&order.order_no).await.unwrap();
        assert_eq!(serials.len(), 2);
        assert!(serials[0].serial_number.starts_with("KEY001"));
        assert!(serials[1].serial_number.starts_with("KEY002"));
        assert!(h.notifier.kinds().contains(&"virtual_delivered"));
    }

    #[tokio::test]
    async fn manual_virtual_delivery_waits_for_admin() {
        let h = harness();
        let product = licenses(&h, "LIC-M", "A\nB", false).await;

        let order = h.service.checkout(cart(vec![line("LIC-M", 1)], false), &Actor::System).await.unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Pending);
        assert_eq!(paid.reservations[0].state, ReservationState::Reserved);

        let delivered = h.service.deliver_virtual(&order.order_no, &admin()).await.unwrap();
        assert_eq!(delivered.status, OrderStatus::Shipped);
        let (pool, stats) = h.service.get_pool(product.pool_id.unwrap()).await.unwrap();
        assert_eq!((pool.ledger.sold, stats.sold, stats.available), (1, 1, 1));

        let again = h.service.deliver_virtual(&order.order_no, &admin()).await.unwrap();
        assert_eq!(again.updated_at, delivered.updated_at);
    }

    #[tokio::test]
    async fn mixed_order_delivers_virtual_part_at_payment() {
        let h = harness();
        let book = physical(&h, "BOOK", 3, 10).await;
        licenses(&h, "EBOOK", "CODE-1", true).await;

        let order = h
            .service
            .checkout(cart(vec![line("BOOK", 1), line("EBOOK", 1)], true), &Actor::System)
            .await
            .unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Pending);
        assert!(paid.reservations.iter().all(|r| r.state == ReservationState::Deducted));

        let shipped = h.service.assign_tracking(&order.order_no, "SF123", &admin()).await.unwrap();
        assert_eq!(shipped.status, OrderStatus::Shipped);
        assert_eq!(stock_of(&h, &book).await.ledger.sold, 1);
        let repeat = h.service.assign_tracking(&order.order_no, "SF123", &admin()).await.unwrap();
        assert_eq!(repeat.updated_at, shipped.updated_at);
    }

    #[tokio::test]
    async fn zero_amount_physical_checkout_lands_in_draft() {
        let h = harness();
        let gift = physical(&h, "GIFT", 2, 0).await;

        let order = h.service.checkout(cart(vec![line("GIFT", 1)], false), &Actor::System).await.unwrap();

        assert_eq!(order.status, OrderStatus::Draft);
        assert!(order.paid_at.is_some());
        assert!(order.form_open(Utc::now()));
        assert_eq!(stock_of(&h, &gift).await.ledger.sold, 1);
    }

    #[tokio::test]
    async fn illegal_transition_is_a_state_conflict() {
        let h = harness();
        physical(&h, "CHAIR", 2, 80).await;
        let order = h.service.checkout(cart(vec![line("CHAIR", 1)], true), &Actor::System).await.unwrap();

        let err = h.service.confirm_receipt(&order.order_no, &Actor::System).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::StateConflict { status: OrderStatus::PendingPayment, trigger: Trigger::ReceiptConfirmed, .. }
        ));
        let err = h.service.assign_tracking(&order.order_no, "SF1", &admin()).await.unwrap_err();
        assert!(matches!(err, AppError::StateConflict { .. }));
    }

    // -------------------------------------------------------------------------
    // Cancel & refund
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn refund_of_completed_order_returns_stock() {
        let h = harness();
        let product = physical(&h, "DESK", 4, 300).await;
        let order = h.service.checkout(cart(vec![line("DESK", 2)], true), &Actor::System).await.unwrap();
        h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        h.service.assign_tracking(&order.order_no, "YT-9", &admin()).await.unwrap();
        h.service.confirm_receipt(&order.order_no, &Actor::System).await.unwrap();

        let refunded = h.service.refund(&order.order_no, &admin(), Some("damaged".into())).await.unwrap();

        assert_eq!(refunded.status, OrderStatus::Refunded);
        let stock = stock_of(&h, &product).await;
        assert_eq!((stock.ledger.reserved, stock.ledger.sold, stock.available()), (0, 0, 4));
        let adjusts = logs(&h, &order.order_no, LogType::Adjust).await;
        assert_eq!(adjusts.len(), 1);
        assert_eq!(adjusts[0].quantity, -2);
        assert_eq!(adjusts[0].reason.as_deref(), Some("damaged"));
    }

    #[tokio::test]
    async fn cancel_after_payment_becomes_refund() {
        let h = harness();
        let product = physical(&h, "SOFA", 1, 900).await;
        let order = h.service.checkout(cart(vec![line("SOFA", 1)], true), &Actor::System).await.unwrap();
        h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();

        let cancelled = h.service.cancel(&order.order_no, &admin(), None).await.unwrap();

        assert_eq!(cancelled.status, OrderStatus::Refunded);
        assert_eq!(stock_of(&h, &product).await.available(), 1);
        assert!(h.notifier.kinds().contains(&"refunded"));
        assert_eq!(h.service.cancel(&order.order_no, &admin(), None).await.unwrap().status, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn customer_cannot_cancel_a_completed_order() {
        let h = harness();
        let product = physical(&h, "LAMP", 2, 40).await;
        let order = h.service.checkout(cart(vec![line("LAMP", 1)], true), &Actor::Customer(7)).await.unwrap();
        h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        h.service.assign_tracking(&order.order_no, "SF-1", &admin()).await.unwrap();
        h.service.confirm_receipt(&order.order_no, &Actor::Customer(7)).await.unwrap();

        let result = h.service.cancel(&order.order_no, &Actor::Customer(7), None).await;
        assert!(matches!(result, Err(AppError::StateConflict { status: OrderStatus::Completed, .. })));
        assert!(matches!(
            h.service.cancel(&order.order_no, &admin(), None).await,
            Err(AppError::StateConflict { .. })
        ));

        let stock = stock_of(&h, &product).await;
        assert_eq!((stock.ledger.sold, stock.available()), (1, 1));
        let order = h.service.view_order(&order.order_no, None).await.unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn customer_cannot_refund_a_paid_order_through_cancel() {
        let h = harness();
        let product = physical(&h, "RUG", 1, 80).await;
        let order = h.service.checkout(cart(vec![line("RUG", 1)], true), &Actor::Customer(7)).await.unwrap();
        h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();

        let result = h.service.cancel(&order.order_no, &Actor::Customer(7), None).await;
        assert!(matches!(result, Err(AppError::Forbidden(_))));
        assert_eq!(stock_of(&h, &product).await.ledger.sold, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_sweeps_release_once() {
        let mut config = Config::for_tests();
        config.order.auto_cancel_hours = 1;
        let h = harness_with(config);
        let product = physical(&h, "FAN", 3, 25).await;
        let order = h.service.checkout(cart(vec![line("FAN", 2)], true), &Actor::System).await.unwrap();

        let later = Utc::now() + Duration::hours(2);
        let (a, b) = tokio::join!(
            tokio::spawn({
                let service = h.service.clone();
                async move { service.auto_cancel_expired(later).await }
            }),
            tokio::spawn({
                let service = h.service.clone();
                async move { service.auto_cancel_expired(later).await }
            }),
        );

        assert_eq!(a.unwrap().unwrap() + b.unwrap().unwrap(), 1);
        assert_eq!(stock_of(&h, &product).await.ledger.reserved, 0);
        assert_eq!(logs(&h, &order.order_no, LogType::Release).await.len(), 1);
        let cancelled = h.service.view_order(&order.order_no, None).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn sweep_skips_recent_and_paid_orders() {
        let mut config = Config::for_tests();
        config.order.auto_cancel_hours = 1;
        let h = harness_with(config);
        physical(&h, "CUP", 5, 8).await;
        let paid = h.service.checkout(cart(vec![line("CUP", 1)], true), &Actor::System).await.unwrap();
        h.service.confirm_payment(&paid.order_no, &Actor::System).await.unwrap();
        h.service.checkout(cart(vec![line("CUP", 1)], true), &Actor::System).await.unwrap();

        assert_eq!(h.service.auto_cancel_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(h.service.auto_cancel_expired(Utc::now() + Duration::hours(2)).await.unwrap(), 1);
        let paid = h.service.view_order(&paid.order_no, None).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Pending);
    }

    // -------------------------------------------------------------------------
    // Shipping form
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn draft_resubmitted_twice_reserves_once() {
        let h = harness();
        let product = physical(&h, "BIKE", 5, 500).await;
        let draft = h
            .service
            .create_draft(DraftRequest {
                source_platform: "shopify".into(),
                external_user_id: "u-77".into(),
                user_email: None,
                user_name: Some("Li".into()),
                external_order_id: Some("X-1".into()),
                items: vec![line("BIKE", 2)],
                remark: None,
            })
            .await
            .unwrap();
        assert_eq!(draft.order.status, OrderStatus::Draft);
        assert!(draft.form_url.starts_with("http://shop.test/form/shipping?token="));

        let first_token = token_of(&draft.form_url);
        let view = h.service.get_form(&first_token).await.unwrap();
        assert!(view.email_required);
        let first = h.service.submit_form(&first_token, form(false)).await.unwrap();
        assert!(first.is_new_user);

        let link = h.service.request_resubmit(&draft.order_no, &admin(), Some("address incomplete".into())).await.unwrap();
        let second_token = token_of(&link.form_url);
        assert_ne!(first_token, second_token);
        assert!(matches!(h.service.get_form(&first_token).await, Err(AppError::NotFound(_))));

        let second = h.service.submit_form(&second_token, form(false)).await.unwrap();
        assert_eq!(second.user_id, first.user_id);
        assert!(!second.is_new_user);

        let order = h.service.view_order(&draft.order_no, None).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(stock_of(&h, &product).await.ledger.reserved, 2);
        assert_eq!(logs(&h, &draft.order_no, LogType::Reserve).await.len(), 1);
    }

    #[tokio::test]
    async fn form_token_is_single_use() {
        let h = harness();
        physical(&h, "TENT", 2, 120).await;
        let order = h.service.checkout(cart(vec![line("TENT", 1)], false), &Actor::System).await.unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        assert_eq!(paid.status, OrderStatus::Draft);

        let token = paid.form_token.clone().unwrap();
        h.service.submit_form(&token, form(false)).await.unwrap();
        let err = h.service.submit_form(&token, form(false)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn new_user_gets_welcome_with_generated_password() {
        let h = harness();
        physical(&h, "KITE", 2, 15).await;
        let mut req = cart(vec![line("KITE", 1)], false);
        req.user_email = None;
        let order = h.service.checkout(req, &Actor::System).await.unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        h.notifier.take();

        let submitted = h.service.submit_form(paid.form_token.as_deref().unwrap(), form(false)).await.unwrap();
        assert!(submitted.is_new_user);

        let sent = h.notifier.take();
        assert_eq!(sent.len(), 1);
        match &sent[0].kind {
            NotificationKind::Welcome { email, password } => {
                assert_eq!(email, "li@example.com");
                let password = password.as_ref().unwrap();
                assert_eq!(password.expose_secret().len(), password::GENERATED_LENGTH);
            }
            other => panic!("unexpected notification {other:?}"),
        }
        let user = h.store.find_user_by_email("li@example.com").await.unwrap().unwrap();
        assert!(user.password_hash.starts_with("$argon2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_form_submissions_announce_the_new_account_once() {
        let h = harness();
        physical(&h, "KITE", 2, 15).await;
        let mut req = cart(vec![line("KITE", 1)], false);
        req.user_email = None;
        let order = h.service.checkout(req, &Actor::System).await.unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        let token = paid.form_token.unwrap();
        h.notifier.take();

        let submit = |service: Arc<OrderService>, token: String| {
            tokio::spawn(async move { service.submit_form(&token, form(false)).await })
        };
        let (a, b) = tokio::join!(
            submit(h.service.clone(), token.clone()),
            submit(h.service.clone(), token.clone()),
        );
        let results = [a.unwrap(), b.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, AppError::NotFound(_)));
            }
        }
        let welcomes: Vec<_> = h
            .notifier
            .take()
            .into_iter()
            .filter_map(|n| match n.kind {
                NotificationKind::Welcome { password, .. } => Some(password),
                _ => None,
            })
            .collect();
        assert_eq!(welcomes.len(), 1);
        assert!(welcomes[0].is_some());
    }

    #[tokio::test]
    async fn refresh_reuses_a_fresh_link() {
        let h = harness();
        physical(&h, "ROPE", 2, 9).await;
        let order = h.service.checkout(cart(vec![line("ROPE", 1)], false), &Actor::System).await.unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();

        let link = h.service.refresh_form(&order.order_no).await.unwrap();
        assert_eq!(token_of(&link.form_url), paid.form_token.clone().unwrap());

        h.service.submit_form(&token_of(&link.form_url), form(false)).await.unwrap();
        let err = h.service.refresh_form(&order.order_no).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn privacy_protected_receiver_is_masked() {
        let h = harness();
        physical(&h, "RING", 1, 999).await;
        h.service
            .update_permissions(AdminPermissions {
                user_id: 9,
                role: AdminRole::Admin,
                permissions: vec![VIEW_PRIVACY.into()],
            })
            .await
            .unwrap();
        h.service
            .update_permissions(AdminPermissions { user_id: 10, role: AdminRole::SuperAdmin, permissions: vec![] })
            .await
            .unwrap();

        let order = h.service.checkout(cart(vec![line("RING", 1)], false), &Actor::System).await.unwrap();
        let paid = h.service.confirm_payment(&order.order_no, &Actor::System).await.unwrap();
        h.service.submit_form(paid.form_token.as_deref().unwrap(), form(true)).await.unwrap();

        let masked = h.service.view_order(&order.order_no, None).await.unwrap();
        let receiver = masked.receiver.unwrap();
        assert_eq!(receiver.name, "***");
        assert_eq!(receiver.phone, "138****5678");
        assert_eq!(receiver.address, "***");

        let root = h.service.view_order(&order.order_no, Some(10)).await.unwrap();
        assert_eq!(root.receiver.unwrap().name, "***");
        let auditor = h.service.view_order(&order.order_no, Some(9)).await.unwrap();
        assert_eq!(auditor.receiver.unwrap().name, "Li Lei");
    }

    // -------------------------------------------------------------------------
    // Admin operations
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn admin_remarks_are_escaped_and_allowed_on_terminal_orders() {
        let h = harness();
        physical(&h, "PEN", 3, 2).await;
        let order = h.service.checkout(cart(vec![line("PEN", 1)], true), &Actor::System).await.unwrap();
        h.service.cancel(&order.order_no, &admin(), None).await.unwrap();

        let noted = h.service.add_admin_remark(&order.order_no, 1, "<b>called buyer</b>").await.unwrap();
        assert_eq!(noted.status, OrderStatus::Cancelled);
        assert!(noted.admin_remark.unwrap().ends_with("&lt;b&gt;called buyer&lt;/b&gt;"));
        assert!(matches!(
            h.service.add_admin_remark(&order.order_no, 1, "   ").await,
            Err(AppError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn adjustments_require_a_reason_and_respect_commitments() {
        let h = harness();
        let product = physical(&h, "SHELF", 3, 60).await;
        h.service.checkout(cart(vec![line("SHELF", 2)], true), &Actor::System).await.unwrap();
        let stock_id = product.stock_id.unwrap();

        let missing = AdjustStockRequest { delta: -1, reason: " ".into() };
        assert!(matches!(h.service.adjust_stock(stock_id, missing, &admin()).await, Err(AppError::Validation { .. })));

        let too_far = AdjustStockRequest { delta: -2, reason: "stocktake".into() };
        assert!(matches!(
            h.service.adjust_stock(stock_id, too_far, &admin()).await,
            Err(AppError::InsufficientStock { .. })
        ));
        let ok = AdjustStockRequest { delta: -1, reason: "stocktake".into() };
        assert_eq!(h.service.adjust_stock(stock_id, ok, &admin()).await.unwrap().available(), 0);
        assert_eq!(h.service.low_stock_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_import_is_rejected() {
        let h = harness();
        let pool = h.service.create_pool("gift cards").await.unwrap();
        let err = h
            .service
            .import_items(pool.id, ImportItemsRequest { text: "\n  \n".into(), batch_no: None }, &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        let result = h
            .service
            .import_items(pool.id, ImportItemsRequest { text: "A,first\nB".into(), batch_no: Some("B-1".into()) }, &admin())
            .await
            .unwrap();
        assert_eq!((result.imported, result.batch_no.as_str()), (2, "B-1"));
    }
}

// =============================================================================
// ORDER STATE MACHINE
// =============================================================================
// Every mutation of an order goes through `OrderStatus::next`, the single
// table of legal (status, trigger) pairs. The table also names the ledger
// effect a transition carries, so the store applies counters and status in
// one atomic unit.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ledger::{ResourceKind, ResourceRef};
use crate::models::ProductType;
use crate::shipping::ReceiverInfo;

// -----------------------------------------------------------------------------
// STATUS & TRIGGERS
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    PendingPayment,
    Pending,
    NeedResubmit,
    Shipped,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Pending => "pending",
            OrderStatus::NeedResubmit => "need_resubmit",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    /// Statuses in which the shipping form accepts submissions.
    pub fn awaits_form(&self) -> bool {
        matches!(self, OrderStatus::Draft | OrderStatus::NeedResubmit)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(OrderStatus::Draft),
            "pending_payment" => Ok(OrderStatus::PendingPayment),
            "pending" => Ok(OrderStatus::Pending),
            "need_resubmit" => Ok(OrderStatus::NeedResubmit),
            "shipped" => Ok(OrderStatus::Shipped),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    PaymentConfirmed,
    ResubmitRequested,
    FormSubmitted,
    TrackingAssigned,
    VirtualDelivered,
    ReceiptConfirmed,
    Cancelled,
    AutoCancelled,
    Refunded,
    AdminRemark,
    /// New shipping form token for an order still awaiting one.
    FormRefreshed,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::PaymentConfirmed => "payment_confirmed",
            Trigger::ResubmitRequested => "resubmit_requested",
            Trigger::FormSubmitted => "form_submitted",
            Trigger::TrackingAssigned => "tracking_assigned",
            Trigger::VirtualDelivered => "virtual_delivered",
            Trigger::ReceiptConfirmed => "receipt_confirmed",
            Trigger::Cancelled => "cancelled",
            Trigger::AutoCancelled => "auto_cancelled",
            Trigger::Refunded => "refunded",
            Trigger::AdminRemark => "admin_remark",
            Trigger::FormRefreshed => "form_refreshed",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Trigger::PaymentConfirmed,
            Trigger::ResubmitRequested,
            Trigger::FormSubmitted,
            Trigger::TrackingAssigned,
            Trigger::VirtualDelivered,
            Trigger::ReceiptConfirmed,
            Trigger::Cancelled,
            Trigger::AutoCancelled,
            Trigger::Refunded,
            Trigger::AdminRemark,
            Trigger::FormRefreshed,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| format!("unknown trigger: {s}"))
    }
}

// -----------------------------------------------------------------------------
// LEDGER EFFECTS
// -----------------------------------------------------------------------------

/// Which still-reserved claims a deduction converts to sales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductScope {
    /// Physical stock, promo quota and auto-delivery virtual claims.
    Payment,
    /// Virtual claims only (manual delivery).
    Virtual,
    /// Everything still reserved.
    Outstanding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    None,
    Deduct(DeductScope),
    /// Release every reserved claim.
    Release,
    /// Release reserved claims and reverse deducted ones.
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub to: OrderStatus,
    pub effect: LedgerEffect,
}

impl Plan {
    fn new(to: OrderStatus, effect: LedgerEffect) -> Self {
        Self { to, effect }
    }
}

/// Facts about an order the table needs beyond its status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    pub virtual_only: bool,
    pub has_physical: bool,
    /// Every virtual claim is auto-delivery.
    pub auto_deliverable: bool,
    pub has_receiver: bool,
    pub has_deducted: bool,
    pub has_reserved_virtual: bool,
}

impl OrderStatus {
    /// The transition table. `None` means the trigger is illegal here.
    pub fn next(self, trigger: Trigger, ctx: &TransitionContext) -> Option<Plan> {
        use LedgerEffect as E;
        use OrderStatus::*;

        match (self, trigger) {
            (_, Trigger::AdminRemark) => Some(Plan::new(self, E::None)),

            (PendingPayment, Trigger::PaymentConfirmed) => {
                let to = if ctx.virtual_only {
                    if ctx.auto_deliverable { Shipped } else { Pending }
                } else if ctx.has_receiver {
                    Pending
                } else {
                    Draft
                };
                Some(Plan::new(to, E::Deduct(DeductScope::Payment)))
            }

            (Pending | Shipped, Trigger::ResubmitRequested) => Some(Plan::new(NeedResubmit, E::None)),

            (Draft | NeedResubmit, Trigger::FormSubmitted) => Some(Plan::new(Pending, E::None)),

            (Draft | NeedResubmit, Trigger::FormRefreshed) => Some(Plan::new(self, E::None)),

            (Pending, Trigger::TrackingAssigned) if ctx.has_physical => {
                Some(Plan::new(Shipped, E::Deduct(DeductScope::Outstanding)))
            }

            (Pending | Shipped, Trigger::VirtualDelivered) if ctx.has_reserved_virtual => {
                let to = if ctx.virtual_only { Shipped } else { self };
                Some(Plan::new(to, E::Deduct(DeductScope::Virtual)))
            }

            (Shipped, Trigger::ReceiptConfirmed) => {
                Some(Plan::new(Completed, E::Deduct(DeductScope::Outstanding)))
            }

            (Draft | PendingPayment | Pending | NeedResubmit, Trigger::Cancelled)
                if !ctx.has_deducted =>
            {
                Some(Plan::new(Cancelled, E::Release))
            }

            (PendingPayment, Trigger::AutoCancelled) if !ctx.has_deducted => {
                Some(Plan::new(Cancelled, E::Release))
            }

            (Draft | Pending | NeedResubmit | Shipped | Completed, Trigger::Refunded) => {
                Some(Plan::new(Refunded, E::Refund))
            }

            _ => None,
        }
    }
}

// =============================================================================
// RESERVATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Reserved,
    Deducted,
    Released,
    Returned,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Deducted => "deducted",
            ReservationState::Released => "released",
            ReservationState::Returned => "returned",
        }
    }
}

impl FromStr for ReservationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationState::Reserved),
            "deducted" => Ok(ReservationState::Deducted),
            "released" => Ok(ReservationState::Released),
            "returned" => Ok(ReservationState::Returned),
            other => Err(format!("unknown reservation state: {other}")),
        }
    }
}

/// One claim an order holds against a ledger. Its `state` moves forward
/// only, so each claim is deducted or released at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: i64,
    /// `None` for the promo code claim.
    pub line_index: Option<i32>,
    pub product_id: Option<i64>,
    pub resource: ResourceRef,
    pub quantity: i32,
    pub auto_delivery: bool,
    pub state: ReservationState,
    /// Virtual items bound to this claim.
    pub item_ids: Vec<i64>,
}

impl Reservation {
    pub fn is_virtual(&self) -> bool {
        self.resource.kind == ResourceKind::VirtualPool
    }

    pub fn deductible_under(&self, scope: DeductScope) -> bool {
        self.state == ReservationState::Reserved
            && match scope {
                DeductScope::Payment => !self.is_virtual() || self.auto_delivery,
                DeductScope::Virtual => self.is_virtual(),
                DeductScope::Outstanding => true,
            }
    }
}

// =============================================================================
// ORDER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: i64,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub product_type: ProductType,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub order_no: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,

    // ----- shipping -----
    pub receiver: Option<ReceiverInfo>,
    pub privacy_protected: bool,
    #[serde(skip_serializing)]
    pub form_token: Option<String>,
    pub form_expires_at: Option<DateTime<Utc>>,
    pub form_submitted_at: Option<DateTime<Utc>>,

    // ----- payment & fulfillment -----
    pub subtotal_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub promo_code_id: Option<i64>,
    pub promo_code: Option<String>,
    pub tracking_no: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // ----- ownership & source -----
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub source_platform: Option<String>,
    pub external_user_id: Option<String>,
    pub external_order_id: Option<String>,

    pub remark: Option<String>,
    pub admin_remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Loaded with the order; written only by ledger effects.
    pub reservations: Vec<Reservation>,
}

impl Order {
    pub fn is_virtual_only(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.product_type == ProductType::Virtual)
    }

    pub fn has_physical(&self) -> bool {
        self.items.iter().any(|i| i.product_type == ProductType::Physical)
    }

    pub fn has_receiver_info(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn has_deducted(&self) -> bool {
        self.reservations.iter().any(|r| r.state == ReservationState::Deducted)
    }

    pub fn context(&self) -> TransitionContext {
        let virtual_claims = || self.reservations.iter().filter(|r| r.is_virtual());
        TransitionContext {
            virtual_only: self.is_virtual_only(),
            has_physical: self.has_physical(),
            auto_deliverable: virtual_claims().all(|r| r.auto_delivery),
            has_receiver: self.has_receiver_info(),
            has_deducted: self.has_deducted(),
            has_reserved_virtual: virtual_claims().any(|r| r.state == ReservationState::Reserved),
        }
    }

    pub fn plan(&self, trigger: Trigger) -> Option<Plan> {
        self.status.next(trigger, &self.context())
    }

    /// True when a repeated trigger finds its work already done. Such calls
    /// return the order unchanged instead of failing or re-applying effects.
    pub fn already_applied(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::PaymentConfirmed => self.paid_at.is_some(),
            Trigger::Cancelled => {
                matches!(self.status, OrderStatus::Cancelled | OrderStatus::Refunded)
            }
            Trigger::AutoCancelled => self.status == OrderStatus::Cancelled,
            Trigger::Refunded => self.status == OrderStatus::Refunded,
            Trigger::ReceiptConfirmed => self.status == OrderStatus::Completed,
            Trigger::ResubmitRequested => self.status == OrderStatus::NeedResubmit,
            Trigger::VirtualDelivered => {
                let mut virtual_claims = self.reservations.iter().filter(|r| r.is_virtual()).peekable();
                virtual_claims.peek().is_some()
                    && virtual_claims.all(|r| r.state == ReservationState::Deducted)
            }
            Trigger::FormSubmitted
            | Trigger::TrackingAssigned
            | Trigger::AdminRemark
            | Trigger::FormRefreshed => false,
        }
    }

    // -------------------------------------------------------------------------
    // Shipping form token
    // -------------------------------------------------------------------------

    pub fn form_open(&self, now: DateTime<Utc>) -> bool {
        self.status.awaits_form()
            && self.form_token.is_some()
            && self.form_submitted_at.is_none()
            && self.form_expires_at.map_or(false, |at| at > now)
    }

    /// A token is reissued when missing, consumed, expired or close to expiry.
    pub fn needs_fresh_form_token(&self, now: DateTime<Utc>) -> bool {
        !self.form_open(now)
            || self.form_expires_at.map_or(true, |at| at - now < Duration::hours(1))
    }

    pub fn issue_form_token(&mut self, now: DateTime<Utc>, expire_hours: i64) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.form_token = Some(token.clone());
        self.form_expires_at = Some(now + Duration::hours(expire_hours));
        self.form_submitted_at = None;
        token
    }

    pub fn append_remark(&mut self, remark: &str) {
        if remark.is_empty() {
            return;
        }
        self.remark = Some(match self.remark.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{remark}"),
            _ => remark.to_string(),
        });
    }

    pub fn append_admin_remark(&mut self, remark: &str, now: DateTime<Utc>) {
        let line = format!("[{}] {}", now.format("%Y-%m-%d %H:%M"), remark);
        self.admin_remark = Some(match self.admin_remark.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{line}"),
            _ => line,
        });
    }

    // -------------------------------------------------------------------------
    // Privacy
    // -------------------------------------------------------------------------

    /// Hide receiver PII of a privacy-protected order.
    pub fn redact_receiver(&mut self) {
        if !self.privacy_protected {
            return;
        }
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.name = "***".into();
            receiver.phone = mask_phone(&receiver.phone);
            receiver.address = "***".into();
            if receiver.district.is_some() {
                receiver.district = Some("***".into());
            }
            if receiver.postcode.is_some() {
                receiver.postcode = Some("***".into());
            }
        }
    }
}

/// Keep the first 3 and last 4 digits of a phone number.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() > 7 {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    } else {
        "****".to_string()
    }
}

/// `{prefix}{YYYYmmddHHMMSS}{micros:06}{rand:02}`.
pub fn generate_order_no<R: Rng + ?Sized>(prefix: &str, now: DateTime<Utc>, rng: &mut R) -> String {
    format!(
        "{}{}{:06}{:02}",
        prefix,
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_micros() % 1_000_000,
        rng.gen_range(0..100)
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn receiver() -> ReceiverInfo {
        ReceiverInfo {
            name: "Li Lei".into(),
            phone_code: "+86".into(),
            phone: "13812345678".into(),
            email: Some("li@example.com".into()),
            country: "CN".into(),
            province: Some("Zhejiang".into()),
            city: Some("Hangzhou".into()),
            district: Some("Xihu".into()),
            address: "1 Wensan Rd".into(),
            postcode: Some("310000".into()),
        }
    }

    /// An unpaid, empty order row ready to be handed to a store.
    pub(crate) fn blank_order(order_no: &str) -> Order {
        let now = Utc::now();
        Order {
            id: 0,
            order_no: order_no.to_string(),
            status: OrderStatus::PendingPayment,
            items: vec![],
            receiver: None,
            privacy_protected: false,
            form_token: None,
            form_expires_at: None,
            form_submitted_at: None,
            subtotal_amount: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            currency: "CNY".into(),
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
            reservations: vec![],
        }
    }

    fn ctx() -> TransitionContext {
        TransitionContext { has_physical: true, ..Default::default() }
    }

    #[test]
    fn payment_target_depends_on_contents() {
        let physical_no_receiver = OrderStatus::PendingPayment.next(Trigger::PaymentConfirmed, &ctx());
        assert_eq!(physical_no_receiver.map(|p| p.to), Some(OrderStatus::Draft));

        let physical = TransitionContext { has_receiver: true, ..ctx() };
        let plan = OrderStatus::PendingPayment.next(Trigger::PaymentConfirmed, &physical).unwrap();
        assert_eq!(plan.to, OrderStatus::Pending);
        assert_eq!(plan.effect, LedgerEffect::Deduct(DeductScope::Payment));

        let auto_virtual = TransitionContext { virtual_only: true, auto_deliverable: true, ..Default::default() };
        assert_eq!(
            OrderStatus::PendingPayment.next(Trigger::PaymentConfirmed, &auto_virtual).map(|p| p.to),
            Some(OrderStatus::Shipped)
        );

        let manual_virtual = TransitionContext { virtual_only: true, ..Default::default() };
        assert_eq!(
            OrderStatus::PendingPayment.next(Trigger::PaymentConfirmed, &manual_virtual).map(|p| p.to),
            Some(OrderStatus::Pending)
        );
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let c = ctx();
        assert!(OrderStatus::Cancelled.next(Trigger::TrackingAssigned, &c).is_none());
        assert!(OrderStatus::Draft.next(Trigger::PaymentConfirmed, &c).is_none());
        assert!(OrderStatus::Completed.next(Trigger::Cancelled, &c).is_none());
        assert!(OrderStatus::Pending.next(Trigger::FormSubmitted, &c).is_none());
        assert!(OrderStatus::Shipped.next(Trigger::AutoCancelled, &c).is_none());
        assert!(OrderStatus::Refunded.next(Trigger::Refunded, &c).is_none());
        // no physical item, nothing to ship
        assert!(OrderStatus::Pending.next(Trigger::TrackingAssigned, &TransitionContext::default()).is_none());
    }

    #[test]
    fn terminal_states_only_take_remarks() {
        for status in [OrderStatus::Completed, OrderStatus::Cancelled, OrderStatus::Refunded] {
            assert!(status.is_terminal());
            let plan = status.next(Trigger::AdminRemark, &ctx()).unwrap();
            assert_eq!(plan, Plan::new(status, LedgerEffect::None));
        }
        assert!(OrderStatus::Cancelled.next(Trigger::Refunded, &ctx()).is_none());
    }

    #[test]
    fn cancel_after_deduction_must_refund() {
        let paid = TransitionContext { has_deducted: true, ..ctx() };
        assert!(OrderStatus::Pending.next(Trigger::Cancelled, &paid).is_none());
        let plan = OrderStatus::Pending.next(Trigger::Refunded, &paid).unwrap();
        assert_eq!(plan.effect, LedgerEffect::Refund);

        let unpaid = OrderStatus::PendingPayment.next(Trigger::Cancelled, &ctx()).unwrap();
        assert_eq!(unpaid.effect, LedgerEffect::Release);
    }

    #[test]
    fn resubmission_keeps_stock() {
        let plan = OrderStatus::Shipped.next(Trigger::ResubmitRequested, &ctx()).unwrap();
        assert_eq!(plan, Plan::new(OrderStatus::NeedResubmit, LedgerEffect::None));
        let plan = OrderStatus::NeedResubmit.next(Trigger::FormSubmitted, &ctx()).unwrap();
        assert_eq!(plan, Plan::new(OrderStatus::Pending, LedgerEffect::None));
    }

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for status in [OrderStatus::Draft, OrderStatus::PendingPayment, OrderStatus::NeedResubmit] {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert_eq!("auto_cancelled".parse::<Trigger>(), Ok(Trigger::AutoCancelled));
    }

    #[test]
    fn phone_masking() {
        assert_eq!(mask_phone("13812345678"), "138****5678");
        assert_eq!(mask_phone("1234567"), "****");
    }

    #[test]
    fn order_numbers_embed_prefix_and_time() {
        let now = Utc::now();
        let no = generate_order_no("ORD", now, &mut rand::thread_rng());
        assert!(no.starts_with(&format!("ORD{}", now.format("%Y%m%d%H%M%S"))));
        assert_eq!(no.len(), 3 + 14 + 6 + 2);
    }

    #[test]
    fn payment_scope_skips_manual_virtual_claims() {
        let manual = Reservation {
            id: 1,
            line_index: Some(0),
            product_id: Some(1),
            resource: ResourceRef::pool(1),
            quantity: 1,
            auto_delivery: false,
            state: ReservationState::Reserved,
            item_ids: vec![11],
        };
        assert!(!manual.deductible_under(DeductScope::Payment));
        assert!(manual.deductible_under(DeductScope::Virtual));
        let stock = Reservation { resource: ResourceRef::stock(1), ..manual.clone() };
        assert!(stock.deductible_under(DeductScope::Payment));
        let done = Reservation { state: ReservationState::Deducted, ..stock };
        assert!(!done.deductible_under(DeductScope::Outstanding));
    }
}

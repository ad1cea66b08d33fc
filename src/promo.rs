// =============================================================================
// PROMO CODES
// =============================================================================
// Validation and discount computation for discount codes. A code's usage
// quota is a ledger like any stock: reserved at checkout, deducted (used) at
// payment, released on cancel.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::ledger::{Ledger, Reservable, ResourceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductScope {
    #[default]
    All,
    Specific,
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromoStatus {
    #[default]
    Active,
    Inactive,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self { $(Self::$variant => $text),+ }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($ty))),
                }
            }
        }
    };
}

text_enum!(DiscountType { Percentage => "percentage", Fixed => "fixed" });
text_enum!(ProductScope { All => "all", Specific => "specific", Exclude => "exclude" });
text_enum!(PromoStatus { Active => "active", Inactive => "inactive" });

/// Rejections in the order they are checked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromoError {
    #[error("promo code not found")]
    NotFound,
    #[error("promo code expired")]
    Expired,
    #[error("promo code is not active")]
    Inactive,
    #[error("promo code has been fully used")]
    Exhausted,
    #[error("promo code does not apply to these products")]
    NotApplicable,
    #[error("order amount is below the minimum of {minimum} for this promo code")]
    BelowMinimum { minimum: Decimal },
}

impl PromoError {
    pub fn code(&self) -> &'static str {
        match self {
            PromoError::NotFound => "PROMO_NOT_FOUND",
            PromoError::Expired => "PROMO_EXPIRED",
            PromoError::Inactive => "PROMO_INACTIVE",
            PromoError::Exhausted => "PROMO_EXHAUSTED",
            PromoError::NotApplicable => "PROMO_NOT_APPLICABLE",
            PromoError::BelowMinimum { .. } => "PROMO_BELOW_MINIMUM",
        }
    }
}

// =============================================================================
// PROMO CODE
// =============================================================================

/// `ledger.total == None` is the unlimited case (`total_quantity` NULL in
/// storage); `ledger.sold` is the used quantity.
#[derive(Debug, Clone, Serialize)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub min_order_amount: Decimal,
    /// 0 = uncapped.
    pub max_discount: Decimal,
    pub ledger: Ledger,
    pub status: PromoStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub product_scope: ProductScope,
    pub product_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromoQuote {
    pub promo_id: i64,
    pub code: String,
    pub discount: Decimal,
    pub payable: Decimal,
}

impl PromoCode {
    /// 0 when unlimited.
    pub fn total_quantity(&self) -> i32 {
        self.ledger.total.unwrap_or(0)
    }

    pub fn used_quantity(&self) -> i32 {
        self.ledger.sold
    }

    pub fn reserved_quantity(&self) -> i32 {
        self.ledger.reserved
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn is_applicable_to_product(&self, product_id: i64) -> bool {
        match self.product_scope {
            ProductScope::All => true,
            ProductScope::Specific => self.product_ids.contains(&product_id),
            ProductScope::Exclude => !self.product_ids.contains(&product_id),
        }
    }

    pub fn applies_to(&self, product_ids: &[i64]) -> bool {
        self.product_scope == ProductScope::All
            || product_ids.iter().any(|id| self.is_applicable_to_product(*id))
    }

    /// Checks everything after the lookup, then prices the discount.
    pub fn validate(
        &self,
        product_ids: &[i64],
        order_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<PromoQuote, PromoError> {
        if self.is_expired(now) {
            return Err(PromoError::Expired);
        }
        if self.status != PromoStatus::Active {
            return Err(PromoError::Inactive);
        }
        if matches!(self.ledger.available(), Some(a) if a <= 0) {
            return Err(PromoError::Exhausted);
        }
        if !self.applies_to(product_ids) {
            return Err(PromoError::NotApplicable);
        }
        if order_amount < self.min_order_amount {
            return Err(PromoError::BelowMinimum { minimum: self.min_order_amount });
        }

        let discount = compute_discount(
            self.discount_type,
            self.discount_value,
            self.max_discount,
            order_amount,
        );
        Ok(PromoQuote {
            promo_id: self.id,
            code: self.code.clone(),
            discount,
            payable: order_amount - discount,
        })
    }
}

impl Reservable for PromoCode {
    fn resource(&self) -> ResourceRef {
        ResourceRef::promo(self.id)
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    fn accepts_reservations(&self, now: DateTime<Utc>) -> bool {
        self.status == PromoStatus::Active && !self.is_expired(now)
    }
}

/// Full validation including the lookup step.
pub fn validate_code(
    promo: Option<&PromoCode>,
    product_ids: &[i64],
    order_amount: Decimal,
    now: DateTime<Utc>,
) -> Result<PromoQuote, PromoError> {
    promo
        .ok_or(PromoError::NotFound)?
        .validate(product_ids, order_amount, now)
}

/// Codes are matched trimmed and upper-cased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Always within `[0, order_amount]`, rounded to cents.
pub fn compute_discount(
    discount_type: DiscountType,
    value: Decimal,
    max_discount: Decimal,
    order_amount: Decimal,
) -> Decimal {
    if order_amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let mut discount = match discount_type {
        DiscountType::Percentage => {
            let raw = order_amount * value / Decimal::ONE_HUNDRED;
            if max_discount > Decimal::ZERO && raw > max_discount {
                max_discount
            } else {
                raw
            }
        }
        DiscountType::Fixed => value,
    };
    discount = discount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    discount.clamp(Decimal::ZERO, order_amount)
}

// -----------------------------------------------------------------------------
// CREATION
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewPromoCode {
    pub code: String,
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[serde(default)]
    pub min_order_amount: Decimal,
    #[serde(default)]
    pub max_discount: Decimal,
    /// 0 = unlimited.
    #[serde(default)]
    pub total_quantity: i32,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub product_scope: ProductScope,
    #[serde(default)]
    pub product_ids: Vec<i64>,
}

impl NewPromoCode {
    /// Returns the offending field and message.
    pub fn check(&self) -> Result<(), (&'static str, String)> {
        let code = normalize_code(&self.code);
        if code.is_empty() || code.len() > 50 {
            return Err(("code", "must be 1-50 characters".into()));
        }
        if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(("code", "may only contain letters, digits, '-' and '_'".into()));
        }
        if self.discount_value <= Decimal::ZERO {
            return Err(("discount_value", "must be positive".into()));
        }
        if self.discount_type == DiscountType::Percentage && self.discount_value > Decimal::ONE_HUNDRED {
            return Err(("discount_value", "percentage cannot exceed 100".into()));
        }
        if self.min_order_amount < Decimal::ZERO || self.max_discount < Decimal::ZERO {
            return Err(("min_order_amount", "amounts cannot be negative".into()));
        }
        if self.total_quantity < 0 {
            return Err(("total_quantity", "cannot be negative".into()));
        }
        if self.product_scope != ProductScope::All && self.product_ids.is_empty() {
            return Err(("product_ids", "required for specific/exclude scope".into()));
        }
        Ok(())
    }

    pub fn ledger(&self) -> Ledger {
        if self.total_quantity == 0 {
            Ledger::unbounded()
        } else {
            Ledger::bounded(self.total_quantity)
        }
    }
}

#[cfg(test)]
impl PromoCode {
    pub fn for_tests(code: &str, total_quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: 1,
            code: code.to_string(),
            description: None,
            discount_type: DiscountType::Fixed,
            discount_value: Decimal::ONE,
            min_order_amount: Decimal::ZERO,
            max_discount: Decimal::ZERO,
            ledger: if total_quantity == 0 { Ledger::unbounded() } else { Ledger::bounded(total_quantity) },
            status: PromoStatus::Active,
            expires_at: None,
            product_scope: ProductScope::All,
            product_ids: vec![],
            created_at: now,
            updated_at: now,
        }
    }
}

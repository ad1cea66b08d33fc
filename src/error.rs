// =============================================================================
// ERROR MODULE
// =============================================================================
// Service-wide error type and its HTTP mapping.
//
// - Validation / resource conflicts surface actionable messages.
// - State conflicts are precondition failures (412).
// - Invariant violations and infrastructure failures are logged in full
//   and surface as a generic internal error.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::ledger::{LedgerError, ResourceKind, ResourceRef};
use crate::models::ErrorResponse;
use crate::order::{OrderStatus, Trigger};
use crate::promo::PromoError;
use crate::shipping::FieldError;

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE
    // -------------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // -------------------------------------------------------------------------
    // CALLER ERRORS
    // -------------------------------------------------------------------------
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // -------------------------------------------------------------------------
    // RESOURCE CONFLICTS
    // -------------------------------------------------------------------------
    #[error("Insufficient stock for {resource}: available {available}, requested {requested}")]
    InsufficientStock { resource: ResourceRef, available: i32, requested: i32 },

    #[error("Promo code unavailable: {0}")]
    Promo(#[from] PromoError),

    // -------------------------------------------------------------------------
    // STATE CONFLICTS
    // -------------------------------------------------------------------------
    #[error("Order {order_no} is {status}; {trigger} is not allowed")]
    StateConflict { order_no: String, status: OrderStatus, trigger: Trigger },

    // -------------------------------------------------------------------------
    // BUGS & INTERNAL
    // -------------------------------------------------------------------------
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation { field: field.into(), message: message.into() }
    }

    /// Attach the resource a ledger call was made against. Promo quota
    /// shortfalls read as an exhausted code.
    pub fn from_ledger(resource: ResourceRef, err: LedgerError) -> Self {
        match err {
            LedgerError::Insufficient { .. } if resource.kind == ResourceKind::PromoCode => {
                AppError::Promo(PromoError::Exhausted)
            }
            LedgerError::Insufficient { available, requested } => {
                AppError::InsufficientStock { resource, available, requested }
            }
            LedgerError::InvalidQuantity(qty) => {
                AppError::validation("quantity", format!("must be between 1 and 9999, got {qty}"))
            }
            LedgerError::Invariant(detail) => {
                AppError::InvariantViolation(format!("{resource}: {detail}"))
            }
        }
    }
}

impl From<FieldError> for AppError {
    fn from(err: FieldError) -> Self {
        AppError::Validation { field: err.field.to_string(), message: err.message }
    }
}

impl From<argon2::password_hash::Error> for AppError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AppError::Internal(format!("password hashing failed: {err}"))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match &self {
            AppError::NotFound(msg) => ErrorResponse::new("NOT_FOUND", msg.clone()),
            AppError::Validation { field, message } => {
                ErrorResponse::for_field("VALIDATION_ERROR", format!("{field} {message}"), field.clone())
            }
            AppError::BadRequest(msg) => ErrorResponse::new("BAD_REQUEST", msg.clone()),
            AppError::Forbidden(msg) => ErrorResponse::new("FORBIDDEN", msg.clone()),
            AppError::InsufficientStock { requested, .. } => ErrorResponse::new(
                "INSUFFICIENT_STOCK",
                format!("Out of stock: requested {requested}"),
            ),
            AppError::Promo(err) => ErrorResponse::new(err.code(), err.to_string()),
            AppError::StateConflict { .. } => ErrorResponse::new("STATE_CONFLICT", self.to_string()),
            AppError::Database(_) => ErrorResponse::new("DATABASE_ERROR", "A database error occurred"),
            AppError::Redis(_) => ErrorResponse::new("CACHE_ERROR", "A cache error occurred"),
            AppError::InvariantViolation(_) | AppError::Internal(_) => {
                ErrorResponse::new("INTERNAL_ERROR", "An internal error occurred")
            }
        };
        let status = self.status_code();

        match &self {
            AppError::InvariantViolation(detail) => {
                tracing::error!(detail = %detail, "Ledger invariant violated; operation aborted");
            }
            _ if status.is_server_error() => {
                tracing::error!(error = %self, error_code = %body.error, "Request failed");
            }
            _ => {
                tracing::warn!(error_code = %body.error, message = %body.message, "Request rejected");
            }
        }

        (status, Json(body)).into_response()
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation { .. } | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InsufficientStock { .. } => StatusCode::CONFLICT,
            AppError::Promo(PromoError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Promo(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::StateConflict { .. } => StatusCode::PRECONDITION_FAILED,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::InvariantViolation(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promo_shortfall_reads_as_exhausted() {
        let err = AppError::from_ledger(
            ResourceRef::promo(3),
            LedgerError::Insufficient { available: 0, requested: 1 },
        );
        assert!(matches!(err, AppError::Promo(PromoError::Exhausted)));
    }

    #[test]
    fn status_mapping() {
        let conflict = AppError::StateConflict {
            order_no: "ORD1".into(),
            status: OrderStatus::Cancelled,
            trigger: Trigger::TrackingAssigned,
        };
        assert_eq!(conflict.status_code(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            AppError::InvariantViolation("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(AppError::Promo(PromoError::Expired).status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn internal_details_stay_out_of_responses() {
        let response = AppError::InvariantViolation("stock#1: reserved 0 < 2".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

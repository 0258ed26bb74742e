//! Billing error types

use orderdesk_shared::{Currency, ParseEnumError};
use rust_decimal::Decimal;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the settlement engine
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Malformed or out-of-range input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate in-flight request or a state that no longer permits the action
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Subscription type switch refused by the eligibility rules
    #[error("Switch not allowed: {0}")]
    SwitchNotAllowed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("No active pricing plan for currency {0}")]
    PricingUnavailable(Currency),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error taxonomy exposed to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    InsufficientBalance,
    PricingUnavailable,
    Internal,
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Validation(_) => ErrorKind::Validation,
            BillingError::Conflict(_) | BillingError::SwitchNotAllowed(_) => ErrorKind::Conflict,
            BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            BillingError::PricingUnavailable(_) => ErrorKind::PricingUnavailable,
            BillingError::Database(_) | BillingError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::Conflict(_) => "CONFLICT",
            BillingError::SwitchNotAllowed(_) => "SWITCH_NOT_ALLOWED",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            BillingError::PricingUnavailable(_) => "PRICING_UNAVAILABLE",
            BillingError::Database(_) | BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to a merchant or staff member
    ///
    /// Misconfiguration and persistence failures collapse into a generic message;
    /// everything else is surfaced verbatim.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::PricingUnavailable | ErrorKind::Internal => {
                "The request could not be completed. Please try again later.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Whether the caller may retry after resolving the cause
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Internal)
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => BillingError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BillingError::Conflict(db.message().to_string())
            }
            _ => BillingError::Database(e.to_string()),
        }
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(e: ParseEnumError) -> Self {
        BillingError::Internal(format!("Corrupt stored value: {}", e))
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("Metadata serialization failed: {}", e))
    }
}

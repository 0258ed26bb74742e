#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! OrderDesk Shared
//!
//! Domain vocabulary, configuration and database helpers used by every
//! OrderDesk crate.

pub mod config;
pub mod db;
pub mod types;

pub use config::{Config, ConfigError};
pub use db::{create_migration_pool, create_pool};
pub use types::{
    Currency, HistoryEventType, MerchantId, ParseEnumError, PaymentRequestId,
    PaymentRequestStatus, PaymentRequestType, SubscriptionStatus, SubscriptionType,
    TransactionType, TriggeredBy,
};

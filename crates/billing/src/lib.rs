// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! OrderDesk Settlement Engine
//!
//! Decides whether a merchant may take orders and keeps the money behind
//! that decision consistent.
//!
//! ## Features
//!
//! - **Balance Ledger**: Append-only transactions with before/after snapshots
//! - **Subscription Evaluation**: Trial, monthly and deposit validity with grace periods
//! - **Auto-switch**: Lapsed trial/monthly merchants with funds fall back to deposit
//! - **Payment Requests**: Manual bank-transfer top-ups and renewals, verified by staff
//! - **Transfers**: Atomic balance moves between branches of one group
//! - **History**: Normalized audit trail of every subscription change
//! - **Invariants**: Runnable ledger consistency checks

pub mod clock;
pub mod error;
pub mod evaluator;
pub mod history;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod payment_requests;
pub mod pricing;
pub mod store;
pub mod subscriptions;
pub mod transfer;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod testing;

// Clock
pub use clock::{Clock, FixedClock, SystemClock};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Evaluator
pub use evaluator::{evaluate, switch_eligibility, Evaluation, SuspensionReason, SwitchEligibility};

// History
pub use history::{HistoryEntryBuilder, HistoryService};

// Invariants
pub use invariants::{
    Invariant, InvariantChecker, InvariantReport, InvariantViolation, LedgerAudit,
    ViolationSeverity,
};

// Ledger
pub use ledger::{BalanceView, LedgerService, NewTransaction, UsageSummary};

// Models
pub use models::{
    Balance, BalanceTransaction, Merchant, Page, PaymentRequest, Subscription,
    SubscriptionHistoryEntry, SubscriptionSnapshot,
};

// Payment requests
pub use payment_requests::{
    CreatePaymentRequest, ExpirySweep, PaymentRequestService, TransferConfirmation,
    VerificationOutcome,
};

// Pricing
pub use pricing::{ActivePlan, BankTransferTarget, PlanPricing, PricingResolver};

// Store
pub use store::memory::{FailPoint, MemoryStore};
pub use store::postgres::PgSettlementStore;
pub use store::{SettlementStore, TransactionPage, TransactionQuery, TransferCommit};

// Subscriptions
pub use subscriptions::{
    AutoSwitchPolicy, DepositFallbackPolicy, RenewalReceipt, SubscriptionService,
    SubscriptionStatusView, SuspensionSweep,
};

// Transfers
pub use transfer::TransferService;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all settlement functionality
#[derive(Clone)]
pub struct BillingService {
    pub ledger: LedgerService,
    pub subscriptions: SubscriptionService,
    pub payment_requests: PaymentRequestService,
    pub transfers: TransferService,
    pub history: HistoryService,
    pub pricing: PricingResolver,
}

impl BillingService {
    /// Build every service over one store and clock with the default policy
    pub fn new(store: Arc<dyn SettlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_policy(store, clock, Arc::new(DepositFallbackPolicy))
    }

    pub fn with_policy(
        store: Arc<dyn SettlementStore>,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn AutoSwitchPolicy>,
    ) -> Self {
        Self {
            ledger: LedgerService::new(store.clone(), clock.clone()),
            subscriptions: SubscriptionService::new(store.clone(), clock.clone(), policy),
            payment_requests: PaymentRequestService::new(store.clone(), clock.clone()),
            transfers: TransferService::new(store.clone(), clock),
            history: HistoryService::new(store.clone()),
            pricing: PricingResolver::new(store),
        }
    }

    /// Production wiring: PostgreSQL store and the wall clock
    pub fn from_pool(pool: PgPool, payment_request_ttl_hours: i64) -> Self {
        let mut service = Self::new(Arc::new(PgSettlementStore::new(pool)), Arc::new(SystemClock));
        service.payment_requests = service
            .payment_requests
            .with_ttl_hours(payment_request_ttl_hours);
        service
    }
}

/// Apply the settlement schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

//! Ledger invariants
//!
//! Consistency checks over settled state. A [`LedgerAudit`] source finds the
//! offending rows (one SQL query per check on PostgreSQL); the checker turns
//! them into violations the worker can log and alert on.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use orderdesk_shared::{MerchantId, PaymentRequestId, SubscriptionStatus, SubscriptionType};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::error::{BillingError, BillingResult};
use crate::store::postgres::PgSettlementStore;

/// A ledger row whose `balance_after` is not `balance_before + amount`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArithmeticMismatch {
    pub transaction_id: i64,
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
}

/// A stored balance that disagrees with its newest ledger row
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct BalanceDrift {
    pub merchant_id: MerchantId,
    pub balance: Decimal,
    pub latest_balance_after: Option<Decimal>,
    pub latest_transaction_id: Option<i64>,
}

/// A merchant with more than one PENDING/CONFIRMED request
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OpenRequestPileup {
    pub merchant_id: MerchantId,
    pub open_count: i64,
}

/// A VERIFIED top-up with no TOPUP row linked to it
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UnpostedTopup {
    pub request_id: PaymentRequestId,
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub verified_at: Option<OffsetDateTime>,
}

/// A TRIAL without `trial_ends_at` or a MONTHLY without `current_period_end`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPeriodEnd {
    pub merchant_id: MerchantId,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
}

/// Read-only queries behind the invariant checks
#[async_trait]
pub trait LedgerAudit: Send + Sync {
    async fn arithmetic_mismatches(&self) -> BillingResult<Vec<ArithmeticMismatch>>;

    /// A balance without ledger rows is expected to be zero
    async fn balance_drift(&self) -> BillingResult<Vec<BalanceDrift>>;

    async fn open_request_pileups(&self) -> BillingResult<Vec<OpenRequestPileup>>;

    async fn unposted_topups(&self) -> BillingResult<Vec<UnpostedTopup>>;

    async fn missing_period_ends(&self) -> BillingResult<Vec<MissingPeriodEnd>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationSeverity {
    /// Money is wrong
    Critical,
    /// Workflow state contradicts the ledger
    High,
    Medium,
}

impl ViolationSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationSeverity::Critical => "CRITICAL",
            ViolationSeverity::High => "HIGH",
            ViolationSeverity::Medium => "MEDIUM",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    TransactionArithmetic,
    BalanceMatchesLedger,
    SingleOpenPaymentRequest,
    VerifiedTopupPosted,
    SubscriptionDatesConsistent,
}

impl Invariant {
    pub const ALL: [Invariant; 5] = [
        Invariant::TransactionArithmetic,
        Invariant::BalanceMatchesLedger,
        Invariant::SingleOpenPaymentRequest,
        Invariant::VerifiedTopupPosted,
        Invariant::SubscriptionDatesConsistent,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Invariant::TransactionArithmetic => "transaction_arithmetic",
            Invariant::BalanceMatchesLedger => "balance_matches_ledger",
            Invariant::SingleOpenPaymentRequest => "single_open_payment_request",
            Invariant::VerifiedTopupPosted => "verified_topup_posted",
            Invariant::SubscriptionDatesConsistent => "subscription_dates_consistent",
        }
    }

    pub fn severity(&self) -> ViolationSeverity {
        match self {
            Invariant::TransactionArithmetic
            | Invariant::BalanceMatchesLedger
            | Invariant::VerifiedTopupPosted => ViolationSeverity::Critical,
            Invariant::SingleOpenPaymentRequest => ViolationSeverity::High,
            Invariant::SubscriptionDatesConsistent => ViolationSeverity::Medium,
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Invariant {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Invariant::ALL
            .into_iter()
            .find(|i| i.name() == s)
            .ok_or_else(|| BillingError::Validation(format!("Unknown invariant check: {}", s)))
    }
}

/// One failed invariant
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: Invariant,
    pub severity: ViolationSeverity,
    pub merchant_id: MerchantId,
    pub description: String,
    pub context: serde_json::Value,
}

impl InvariantViolation {
    fn new(
        invariant: Invariant,
        merchant_id: MerchantId,
        description: String,
        context: serde_json::Value,
    ) -> Self {
        Self {
            invariant,
            severity: invariant.severity(),
            merchant_id,
            description,
            context,
        }
    }
}

impl From<ArithmeticMismatch> for InvariantViolation {
    fn from(row: ArithmeticMismatch) -> Self {
        Self::new(
            Invariant::TransactionArithmetic,
            row.merchant_id,
            format!(
                "Transaction {}: {} + {} != {}",
                row.transaction_id, row.balance_before, row.amount, row.balance_after
            ),
            json!({
                "transactionId": row.transaction_id,
                "amount": row.amount.to_string(),
                "balanceBefore": row.balance_before.to_string(),
                "balanceAfter": row.balance_after.to_string(),
            }),
        )
    }
}

impl From<BalanceDrift> for InvariantViolation {
    fn from(row: BalanceDrift) -> Self {
        let expected = row.latest_balance_after.unwrap_or(Decimal::ZERO);
        Self::new(
            Invariant::BalanceMatchesLedger,
            row.merchant_id,
            format!("Balance {} does not match ledger value {}", row.balance, expected),
            json!({
                "balance": row.balance.to_string(),
                "latestBalanceAfter": row.latest_balance_after.map(|d| d.to_string()),
                "latestTransactionId": row.latest_transaction_id,
            }),
        )
    }
}

impl From<OpenRequestPileup> for InvariantViolation {
    fn from(row: OpenRequestPileup) -> Self {
        Self::new(
            Invariant::SingleOpenPaymentRequest,
            row.merchant_id,
            format!("{} open payment requests", row.open_count),
            json!({ "openCount": row.open_count }),
        )
    }
}

impl From<UnpostedTopup> for InvariantViolation {
    fn from(row: UnpostedTopup) -> Self {
        Self::new(
            Invariant::VerifiedTopupPosted,
            row.merchant_id,
            format!(
                "Verified top-up request {} ({}) has no ledger row",
                row.request_id, row.amount
            ),
            json!({
                "requestId": row.request_id.0,
                "amount": row.amount.to_string(),
                "verifiedAt": row.verified_at.map(|t| t.unix_timestamp()),
            }),
        )
    }
}

impl From<MissingPeriodEnd> for InvariantViolation {
    fn from(row: MissingPeriodEnd) -> Self {
        Self::new(
            Invariant::SubscriptionDatesConsistent,
            row.merchant_id,
            format!("{} subscription has no end date", row.subscription_type),
            json!({
                "type": row.subscription_type.as_str(),
                "status": row.status.as_str(),
            }),
        )
    }
}

fn violations<T: Into<InvariantViolation>>(rows: Vec<T>) -> Vec<InvariantViolation> {
    rows.into_iter().map(Into::into).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }

    /// Checks with at least one violation, in run order
    pub fn failed_checks(&self) -> Vec<Invariant> {
        Invariant::ALL
            .into_iter()
            .filter(|i| self.violations.iter().any(|v| v.invariant == *i))
            .collect()
    }
}

#[derive(Clone)]
pub struct InvariantChecker {
    audit: Arc<dyn LedgerAudit>,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(audit: Arc<dyn LedgerAudit>, clock: Arc<dyn Clock>) -> Self {
        Self { audit, clock }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(Arc::new(PgSettlementStore::new(pool)), Arc::new(SystemClock))
    }

    pub async fn run_all(&self) -> BillingResult<InvariantReport> {
        let checked_at = self.clock.now();
        let mut found = Vec::new();
        for invariant in Invariant::ALL {
            found.extend(self.run(invariant).await?);
        }

        Ok(InvariantReport {
            checked_at,
            checks_run: Invariant::ALL.len(),
            violations: found,
        })
    }

    pub async fn run(&self, invariant: Invariant) -> BillingResult<Vec<InvariantViolation>> {
        let found = match invariant {
            Invariant::TransactionArithmetic => violations(self.audit.arithmetic_mismatches().await?),
            Invariant::BalanceMatchesLedger => violations(self.audit.balance_drift().await?),
            Invariant::SingleOpenPaymentRequest => {
                violations(self.audit.open_request_pileups().await?)
            }
            Invariant::VerifiedTopupPosted => violations(self.audit.unposted_topups().await?),
            Invariant::SubscriptionDatesConsistent => {
                violations(self.audit.missing_period_ends().await?)
            }
        };
        Ok(found)
    }

    /// Run one check by its snake_case name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        self.run(name.parse()?).await
    }
}

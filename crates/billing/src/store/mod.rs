//! Storage seam for the settlement engine
//!
//! Reads are plain queries. Every write goes through one of two atomic
//! primitives that lock the rows involved, hand a snapshot to a pure mutation
//! and persist what it returns in the same transaction. A mutation that
//! returns an error leaves storage untouched.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use orderdesk_shared::{MerchantId, PaymentRequestId, TransactionType};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Balance, BalanceTransaction, Merchant, NewHistoryEntry, NewPaymentRequest, Page,
    PaymentRequest, Subscription, SubscriptionHistoryEntry,
};
use crate::pricing::ActivePlan;

/// Rows visible to an account mutation, locked for the duration of the transaction
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub merchant: Merchant,
    pub balance: Balance,
    pub subscription: Option<Subscription>,
    /// The request named by the caller, if any
    pub payment_request: Option<PaymentRequest>,
    /// The merchant's PENDING/CONFIRMED request, if any
    pub open_request: Option<PaymentRequest>,
}

impl AccountSnapshot {
    pub fn subscription_or_absent(&self, now: OffsetDateTime) -> Subscription {
        self.subscription
            .clone()
            .unwrap_or_else(|| Subscription::absent(self.merchant.id, now))
    }
}

/// One ledger row to post against the locked balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPosting {
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub description: String,
    pub payment_request_id: Option<PaymentRequestId>,
    /// Refuse the posting if it would take the balance below zero
    pub require_sufficient_funds: bool,
    /// Stamp `last_topup_at` on the balance
    pub marks_topup: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentRequestWrite {
    Insert(NewPaymentRequest),
    Update(PaymentRequest),
}

/// Everything an account mutation wants persisted
#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub subscription: Option<Subscription>,
    pub posting: Option<LedgerPosting>,
    pub payment_request: Option<PaymentRequestWrite>,
    pub history: Option<NewHistoryEntry>,
}

impl AccountChanges {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.subscription.is_none()
            && self.posting.is_none()
            && self.payment_request.is_none()
            && self.history.is_none()
    }
}

/// State after an account mutation committed
#[derive(Debug, Clone)]
pub struct AccountCommit {
    pub balance: Balance,
    pub subscription: Option<Subscription>,
    pub transaction: Option<BalanceTransaction>,
    pub payment_request: Option<PaymentRequest>,
    pub history: Option<SubscriptionHistoryEntry>,
}

impl AccountCommit {
    /// Result of a mutation that asked for no writes
    pub fn unchanged(balance: Balance) -> Self {
        Self {
            balance,
            subscription: None,
            transaction: None,
            payment_request: None,
            history: None,
        }
    }
}

pub type AccountMutation =
    Box<dyn FnOnce(&AccountSnapshot) -> BillingResult<AccountChanges> + Send>;

/// Both sides of a transfer, locked in ascending merchant order
#[derive(Debug, Clone)]
pub struct TransferSnapshot {
    pub from_merchant: Merchant,
    pub to_merchant: Merchant,
    pub from_balance: Balance,
    pub to_balance: Balance,
    pub from_subscription: Option<Subscription>,
    pub to_subscription: Option<Subscription>,
}

#[derive(Debug, Clone)]
pub struct TransferLegs {
    pub debit: LedgerPosting,
    pub credit: LedgerPosting,
    pub debit_history: NewHistoryEntry,
    pub credit_history: NewHistoryEntry,
}

#[derive(Debug, Clone)]
pub struct TransferCommit {
    pub from_balance: Balance,
    pub to_balance: Balance,
    pub debit: BalanceTransaction,
    pub credit: BalanceTransaction,
}

pub type TransferMutation =
    Box<dyn FnOnce(&TransferSnapshot) -> BillingResult<TransferLegs> + Send>;

/// Filters for the ledger listing
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub transaction_type: Option<TransactionType>,
    /// Case-insensitive substring of the description
    pub search: Option<String>,
    pub page: Page,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TransactionPage {
    pub items: Vec<BalanceTransaction>,
    pub total: i64,
    pub page: Page,
}

/// Persistence used by every settlement service
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // Reads

    async fn active_plan(&self) -> BillingResult<Option<ActivePlan>>;

    async fn merchant(&self, id: MerchantId) -> BillingResult<Option<Merchant>>;

    async fn require_merchant(&self, id: MerchantId) -> BillingResult<Merchant> {
        self.merchant(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Merchant {} not found", id)))
    }

    /// Return the merchant's balance, inserting a zero balance on first access.
    ///
    /// Safe under concurrent first access: the insert ignores conflicts and the
    /// row is read back.
    async fn ensure_balance(&self, merchant_id: MerchantId) -> BillingResult<Balance>;

    async fn subscription(&self, merchant_id: MerchantId) -> BillingResult<Option<Subscription>>;

    /// Subscriptions currently ACTIVE, for the suspension sweep
    async fn active_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    async fn payment_request(&self, id: PaymentRequestId) -> BillingResult<Option<PaymentRequest>>;

    async fn open_payment_request(
        &self,
        merchant_id: MerchantId,
    ) -> BillingResult<Option<PaymentRequest>>;

    /// Newest first
    async fn payment_requests_for_merchant(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<PaymentRequest>>;

    /// PENDING requests whose deadline is at or before `now`
    async fn overdue_payment_requests(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentRequest>>;

    /// Newest first, hiding display-only subscription marker rows
    async fn list_transactions(
        &self,
        balance_id: i64,
        query: &TransactionQuery,
    ) -> BillingResult<TransactionPage>;

    /// Debit rows of usage-fee types created at or after `since`
    async fn usage_fee_transactions(
        &self,
        balance_id: i64,
        since: OffsetDateTime,
    ) -> BillingResult<Vec<BalanceTransaction>>;

    /// Newest first
    async fn history(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>>;

    // Atomic writes

    /// Lock the merchant's balance (created if absent), subscription and the
    /// named payment request, run `mutation`, persist its changes.
    async fn apply_account_change(
        &self,
        merchant_id: MerchantId,
        request_id: Option<PaymentRequestId>,
        mutation: AccountMutation,
    ) -> BillingResult<AccountCommit>;

    /// Lock both balances in ascending merchant order, run `mutation`,
    /// persist both legs.
    async fn apply_transfer(
        &self,
        from: MerchantId,
        to: MerchantId,
        mutation: TransferMutation,
    ) -> BillingResult<TransferCommit>;
}

/// Order in which a transfer's balance rows are locked
pub fn lock_order(a: MerchantId, b: MerchantId) -> (MerchantId, MerchantId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

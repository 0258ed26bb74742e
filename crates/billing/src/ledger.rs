//! Balance ledger
//!
//! Each merchant owns one balance and an append-only list of transactions.
//! Every posting locks the balance row, computes `balance_after` from the
//! locked value and writes the row and the new balance in one transaction,
//! so the latest `balance_after` always equals the stored balance.

use std::sync::Arc;

use orderdesk_shared::{Currency, MerchantId, PaymentRequestId, TransactionType};
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Duration, OffsetDateTime, Time};

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::models::{Balance, BalanceTransaction};
use crate::store::{AccountChanges, LedgerPosting, SettlementStore, TransactionPage, TransactionQuery};

/// Description marker of zero-amount rows that only document a subscription period
pub const DAYS_SUBSCRIPTION_MARKER: &str = "days subscription";

/// Length of the rolling usage window
pub const USAGE_WINDOW_DAYS: i64 = 30;

/// Apply a posting to the locked balance, returning `balance_after`
pub fn post(balance_before: Decimal, posting: &LedgerPosting) -> BillingResult<Decimal> {
    if posting.require_sufficient_funds && posting.amount.is_sign_negative() {
        let required = -posting.amount;
        if balance_before < required {
            return Err(BillingError::InsufficientBalance {
                required,
                available: balance_before,
            });
        }
    }
    Ok(balance_before + posting.amount)
}

/// Rows the ledger listing never shows
pub fn is_display_hidden(
    transaction_type: TransactionType,
    amount: Decimal,
    description: &str,
) -> bool {
    transaction_type == TransactionType::Subscription
        && amount.is_zero()
        && description
            .to_lowercase()
            .contains(DAYS_SUBSCRIPTION_MARKER)
}

/// Whether a transaction passes the listing filters
pub fn matches_query(tx: &BalanceTransaction, query: &TransactionQuery) -> bool {
    if is_display_hidden(tx.transaction_type, tx.amount, &tx.description) {
        return false;
    }
    if query.from.is_some_and(|from| tx.created_at < from) {
        return false;
    }
    if query.to.is_some_and(|to| tx.created_at > to) {
        return false;
    }
    if query
        .transaction_type
        .is_some_and(|t| t != tx.transaction_type)
    {
        return false;
    }
    match query.search.as_deref().map(str::trim) {
        Some(term) if !term.is_empty() => tx
            .description
            .to_lowercase()
            .contains(&term.to_lowercase()),
        _ => true,
    }
}

/// Balance together with the currency it is denominated in
#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub balance: Balance,
    pub currency: Currency,
}

/// A transaction requested by a collaborator
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub description: String,
    pub payment_request_id: Option<PaymentRequestId>,
    pub require_sufficient_funds: bool,
}

/// Fee usage in the today and rolling 30-day buckets (amounts are positive)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub today_total: Decimal,
    pub today_count: u32,
    pub last_30_days_total: Decimal,
    pub last_30_days_count: u32,
}

/// Aggregate usage-fee debits; `today` is the current UTC day
pub fn summarize_usage(rows: &[BalanceTransaction], now: OffsetDateTime) -> UsageSummary {
    let today_start = now.replace_time(Time::MIDNIGHT);
    let window_start = now - Duration::days(USAGE_WINDOW_DAYS);

    let mut summary = UsageSummary::default();
    for row in rows {
        if !row.transaction_type.is_usage_fee() || !row.amount.is_sign_negative() {
            continue;
        }
        let charged = -row.amount;
        if row.created_at >= window_start {
            summary.last_30_days_total += charged;
            summary.last_30_days_count += 1;
        }
        if row.created_at >= today_start {
            summary.today_total += charged;
            summary.today_count += 1;
        }
    }
    summary
}

/// Ledger operations consumed by order placement and the balance screens
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn SettlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn get_or_create_balance(&self, merchant_id: MerchantId) -> BillingResult<Balance> {
        self.store.require_merchant(merchant_id).await?;
        self.store.ensure_balance(merchant_id).await
    }

    pub async fn get_balance(&self, merchant_id: MerchantId) -> BillingResult<BalanceView> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let balance = self.store.ensure_balance(merchant_id).await?;
        Ok(BalanceView {
            balance,
            currency: merchant.currency,
        })
    }

    /// Post one transaction against the merchant's balance
    pub async fn append_transaction(
        &self,
        merchant_id: MerchantId,
        transaction: NewTransaction,
    ) -> BillingResult<BalanceTransaction> {
        if transaction.description.trim().is_empty() {
            return Err(BillingError::Validation(
                "Transaction description is required".to_string(),
            ));
        }

        let posting = LedgerPosting {
            transaction_type: transaction.transaction_type,
            amount: transaction.amount,
            description: transaction.description,
            payment_request_id: transaction.payment_request_id,
            require_sufficient_funds: transaction.require_sufficient_funds,
            marks_topup: transaction.transaction_type == TransactionType::Topup
                && transaction.amount.is_sign_positive(),
            created_at: self.clock.now(),
        };

        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                None,
                Box::new(move |_| {
                    Ok(AccountChanges {
                        posting: Some(posting),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        let row = commit.transaction.ok_or_else(|| {
            BillingError::Internal("Ledger posting produced no transaction row".to_string())
        })?;

        tracing::info!(
            merchant_id = %merchant_id,
            transaction_id = row.id,
            transaction_type = %row.transaction_type,
            amount = %row.amount,
            balance_after = %row.balance_after,
            "Posted balance transaction"
        );

        Ok(row)
    }

    /// Charge the fee for a placed order
    pub async fn debit_order_fee(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        description: &str,
    ) -> BillingResult<BalanceTransaction> {
        self.debit(merchant_id, TransactionType::OrderFee, amount, description)
            .await
    }

    /// Charge the fee for a completed-order email
    pub async fn debit_email_fee(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
        description: &str,
    ) -> BillingResult<BalanceTransaction> {
        self.debit(
            merchant_id,
            TransactionType::CompletedOrderEmailFee,
            amount,
            description,
        )
        .await
    }

    async fn debit(
        &self,
        merchant_id: MerchantId,
        transaction_type: TransactionType,
        amount: Decimal,
        description: &str,
    ) -> BillingResult<BalanceTransaction> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(format!(
                "Debit amount must be positive, got {}",
                amount
            )));
        }

        let result = self
            .append_transaction(
                merchant_id,
                NewTransaction {
                    transaction_type,
                    amount: -amount,
                    description: description.to_string(),
                    payment_request_id: None,
                    require_sufficient_funds: true,
                },
            )
            .await;

        if let Err(BillingError::InsufficientBalance {
            required,
            available,
        }) = &result
        {
            tracing::warn!(
                merchant_id = %merchant_id,
                transaction_type = %transaction_type,
                required = %required,
                available = %available,
                "Debit refused: insufficient balance"
            );
        }

        result
    }

    pub async fn list_transactions(
        &self,
        merchant_id: MerchantId,
        query: &TransactionQuery,
    ) -> BillingResult<TransactionPage> {
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(BillingError::Validation(
                    "Date range start is after its end".to_string(),
                ));
            }
        }
        let balance = self.get_or_create_balance(merchant_id).await?;
        self.store.list_transactions(balance.id, query).await
    }

    pub async fn usage_summary(&self, merchant_id: MerchantId) -> BillingResult<UsageSummary> {
        let balance = self.get_or_create_balance(merchant_id).await?;
        let now = self.clock.now();
        let rows = self
            .store
            .usage_fee_transactions(balance.id, now - Duration::days(USAGE_WINDOW_DAYS))
            .await?;
        Ok(summarize_usage(&rows, now))
    }
}

//! PostgreSQL settlement store
//!
//! Each write primitive is one database transaction. Balance rows are created
//! with `INSERT ... ON CONFLICT DO NOTHING` and then locked with
//! `SELECT ... FOR UPDATE`; dropping the transaction on any error rolls the
//! whole change back.

use async_trait::async_trait;
use orderdesk_shared::{MerchantId, PaymentRequestId, PaymentRequestStatus};
use rust_decimal::Decimal;
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    lock_order, AccountChanges, AccountCommit, AccountMutation, AccountSnapshot, LedgerPosting,
    PaymentRequestWrite, SettlementStore, TransactionPage, TransactionQuery, TransferCommit,
    TransferMutation, TransferSnapshot,
};
use crate::error::{BillingError, BillingResult};
use crate::invariants::{
    ArithmeticMismatch, BalanceDrift, LedgerAudit, MissingPeriodEnd, OpenRequestPileup,
    UnpostedTopup,
};
use crate::ledger::{self, DAYS_SUBSCRIPTION_MARKER};
use crate::models::{
    Balance, BalanceTransaction, Merchant, Metadata, NewHistoryEntry, NewPaymentRequest, Page,
    PaymentRequest, Subscription, SubscriptionHistoryEntry, SubscriptionSnapshot,
};
use crate::pricing::{ActivePlan, BankTransferTarget, CurrencyProfile};

macro_rules! merchant_columns {
    () => {
        "id, name, currency, parent_merchant_id"
    };
}

macro_rules! subscription_columns {
    () => {
        "merchant_id, type AS subscription_type, status, trial_ends_at, current_period_end, \
         suspend_reason, created_at, updated_at"
    };
}

macro_rules! balance_columns {
    () => {
        "id, merchant_id, balance, last_topup_at, created_at, updated_at"
    };
}

macro_rules! transaction_columns {
    () => {
        "id, balance_id, type AS transaction_type, amount, balance_before, balance_after, \
         description, payment_request_id, created_at"
    };
}

macro_rules! payment_request_columns {
    () => {
        "id, merchant_id, type AS request_type, status, amount, months_requested, currency, \
         bank_name, bank_account_name, bank_account_number, transfer_notes, transfer_proof_url, \
         expires_at, confirmed_at, verified_at, verified_by, rejected_at, rejection_reason, \
         cancelled_at, created_at, updated_at"
    };
}

macro_rules! history_columns {
    () => {
        "id, merchant_id, event_type, previous_type, previous_status, previous_balance, \
         previous_period_end, new_type, new_status, new_balance, new_period_end, reason, \
         metadata, triggered_by, triggered_by_user_id, created_at"
    };
}

/// Listing filter shared by the page and count queries
macro_rules! transaction_filter {
    () => {
        "WHERE balance_id = $1 \
           AND ($2::timestamptz IS NULL OR created_at >= $2) \
           AND ($3::timestamptz IS NULL OR created_at <= $3) \
           AND ($4::text IS NULL OR type = $4) \
           AND ($5::text IS NULL OR description ILIKE '%' || $5 || '%') \
           AND NOT (type = 'SUBSCRIPTION' AND amount = 0 AND LOWER(description) LIKE $6)"
    };
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: i64,
    name: String,
    grace_period_days: i32,
    monthly_days: i32,
    trial_days: i32,
    idr_deposit_minimum: Decimal,
    idr_order_fee: Decimal,
    idr_monthly_price: Decimal,
    idr_bank_name: String,
    idr_bank_account_name: String,
    idr_bank_account_number: String,
    aud_deposit_minimum: Decimal,
    aud_order_fee: Decimal,
    aud_monthly_price: Decimal,
    aud_bank_name: String,
    aud_bank_account_name: String,
    aud_bank_account_number: String,
}

impl From<PlanRow> for ActivePlan {
    fn from(row: PlanRow) -> Self {
        ActivePlan {
            id: row.id,
            name: row.name,
            grace_period_days: i64::from(row.grace_period_days),
            monthly_days: i64::from(row.monthly_days),
            trial_days: i64::from(row.trial_days),
            idr: CurrencyProfile {
                deposit_minimum: row.idr_deposit_minimum,
                order_fee: row.idr_order_fee,
                monthly_price: row.idr_monthly_price,
                bank: BankTransferTarget {
                    bank_name: row.idr_bank_name,
                    account_name: row.idr_bank_account_name,
                    account_number: row.idr_bank_account_number,
                },
            },
            aud: CurrencyProfile {
                deposit_minimum: row.aud_deposit_minimum,
                order_fee: row.aud_order_fee,
                monthly_price: row.aud_monthly_price,
                bank: BankTransferTarget {
                    bank_name: row.aud_bank_name,
                    account_name: row.aud_bank_account_name,
                    account_number: row.aud_bank_account_number,
                },
            },
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MerchantRow {
    id: MerchantId,
    name: String,
    currency: String,
    parent_merchant_id: Option<MerchantId>,
}

impl TryFrom<MerchantRow> for Merchant {
    type Error = BillingError;

    fn try_from(row: MerchantRow) -> BillingResult<Self> {
        Ok(Merchant {
            id: row.id,
            name: row.name,
            currency: row.currency.parse()?,
            parent_merchant_id: row.parent_merchant_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    merchant_id: MerchantId,
    subscription_type: String,
    status: String,
    trial_ends_at: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    suspend_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            merchant_id: row.merchant_id,
            subscription_type: row.subscription_type.parse()?,
            status: row.status.parse()?,
            trial_ends_at: row.trial_ends_at,
            current_period_end: row.current_period_end,
            suspend_reason: row.suspend_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    id: i64,
    merchant_id: MerchantId,
    balance: Decimal,
    last_topup_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<BalanceRow> for Balance {
    fn from(row: BalanceRow) -> Self {
        Balance {
            id: row.id,
            merchant_id: row.merchant_id,
            balance: row.balance,
            last_topup_at: row.last_topup_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    balance_id: i64,
    transaction_type: String,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
    description: String,
    payment_request_id: Option<PaymentRequestId>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for BalanceTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> BillingResult<Self> {
        Ok(BalanceTransaction {
            id: row.id,
            balance_id: row.balance_id,
            transaction_type: row.transaction_type.parse()?,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            description: row.description,
            payment_request_id: row.payment_request_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRequestRow {
    id: PaymentRequestId,
    merchant_id: MerchantId,
    request_type: String,
    status: String,
    amount: Decimal,
    months_requested: Option<i32>,
    currency: String,
    bank_name: String,
    bank_account_name: String,
    bank_account_number: String,
    transfer_notes: Option<String>,
    transfer_proof_url: Option<String>,
    expires_at: OffsetDateTime,
    confirmed_at: Option<OffsetDateTime>,
    verified_at: Option<OffsetDateTime>,
    verified_by: Option<Uuid>,
    rejected_at: Option<OffsetDateTime>,
    rejection_reason: Option<String>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRequestRow> for PaymentRequest {
    type Error = BillingError;

    fn try_from(row: PaymentRequestRow) -> BillingResult<Self> {
        Ok(PaymentRequest {
            id: row.id,
            merchant_id: row.merchant_id,
            request_type: row.request_type.parse()?,
            status: row.status.parse()?,
            amount: row.amount,
            months_requested: row.months_requested,
            currency: row.currency.parse()?,
            bank: BankTransferTarget {
                bank_name: row.bank_name,
                account_name: row.bank_account_name,
                account_number: row.bank_account_number,
            },
            transfer_notes: row.transfer_notes,
            transfer_proof_url: row.transfer_proof_url,
            expires_at: row.expires_at,
            confirmed_at: row.confirmed_at,
            verified_at: row.verified_at,
            verified_by: row.verified_by,
            rejected_at: row.rejected_at,
            rejection_reason: row.rejection_reason,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    merchant_id: MerchantId,
    event_type: String,
    previous_type: String,
    previous_status: String,
    previous_balance: Option<Decimal>,
    previous_period_end: Option<OffsetDateTime>,
    new_type: String,
    new_status: String,
    new_balance: Option<Decimal>,
    new_period_end: Option<OffsetDateTime>,
    reason: Option<String>,
    metadata: Json<Metadata>,
    triggered_by: String,
    triggered_by_user_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<HistoryRow> for SubscriptionHistoryEntry {
    type Error = BillingError;

    fn try_from(row: HistoryRow) -> BillingResult<Self> {
        Ok(SubscriptionHistoryEntry {
            id: row.id,
            merchant_id: row.merchant_id,
            event_type: row.event_type.parse()?,
            previous: SubscriptionSnapshot {
                subscription_type: row.previous_type.parse()?,
                status: row.previous_status.parse()?,
                balance: row.previous_balance,
                period_end: row.previous_period_end,
            },
            new: SubscriptionSnapshot {
                subscription_type: row.new_type.parse()?,
                status: row.new_status.parse()?,
                balance: row.new_balance,
                period_end: row.new_period_end,
            },
            reason: row.reason,
            metadata: row.metadata.0,
            triggered_by: row.triggered_by.parse()?,
            triggered_by_user_id: row.triggered_by_user_id,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Escape LIKE wildcards so the search term matches literally
fn like_escape(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// Statements run inside a caller's transaction

async fn fetch_merchant(conn: &mut PgConnection, id: MerchantId) -> BillingResult<Merchant> {
    let row: Option<MerchantRow> =
        sqlx::query_as(concat!("SELECT ", merchant_columns!(), " FROM merchants WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    row.ok_or_else(|| BillingError::NotFound(format!("Merchant {} not found", id)))?
        .try_into()
}

async fn lock_balance(conn: &mut PgConnection, merchant_id: MerchantId) -> BillingResult<Balance> {
    sqlx::query("INSERT INTO merchant_balances (merchant_id) VALUES ($1) ON CONFLICT (merchant_id) DO NOTHING")
        .bind(merchant_id)
        .execute(&mut *conn)
        .await?;

    let row: BalanceRow = sqlx::query_as(concat!(
        "SELECT ",
        balance_columns!(),
        " FROM merchant_balances WHERE merchant_id = $1 FOR UPDATE"
    ))
    .bind(merchant_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.into())
}

async fn lock_subscription(
    conn: &mut PgConnection,
    merchant_id: MerchantId,
) -> BillingResult<Option<Subscription>> {
    let row: Option<SubscriptionRow> = sqlx::query_as(concat!(
        "SELECT ",
        subscription_columns!(),
        " FROM merchant_subscriptions WHERE merchant_id = $1 FOR UPDATE"
    ))
    .bind(merchant_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Subscription::try_from).transpose()
}

async fn lock_payment_request(
    conn: &mut PgConnection,
    id: PaymentRequestId,
) -> BillingResult<Option<PaymentRequest>> {
    let row: Option<PaymentRequestRow> = sqlx::query_as(concat!(
        "SELECT ",
        payment_request_columns!(),
        " FROM payment_requests WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(PaymentRequest::try_from).transpose()
}

async fn fetch_open_request(
    conn: &mut PgConnection,
    merchant_id: MerchantId,
) -> BillingResult<Option<PaymentRequest>> {
    let row: Option<PaymentRequestRow> = sqlx::query_as(concat!(
        "SELECT ",
        payment_request_columns!(),
        " FROM payment_requests WHERE merchant_id = $1 AND status IN ('PENDING', 'CONFIRMED') \
         ORDER BY id DESC LIMIT 1"
    ))
    .bind(merchant_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(PaymentRequest::try_from).transpose()
}

/// Post against a balance already locked by this transaction
async fn post_transaction(
    conn: &mut PgConnection,
    balance: &Balance,
    posting: &LedgerPosting,
) -> BillingResult<(Balance, BalanceTransaction)> {
    let balance_after = ledger::post(balance.balance, posting)?;

    let updated: BalanceRow = sqlx::query_as(concat!(
        "UPDATE merchant_balances SET balance = $1, updated_at = $2, \
         last_topup_at = CASE WHEN $3 THEN $2 ELSE last_topup_at END \
         WHERE id = $4 RETURNING ",
        balance_columns!()
    ))
    .bind(balance_after)
    .bind(posting.created_at)
    .bind(posting.marks_topup)
    .bind(balance.id)
    .fetch_one(&mut *conn)
    .await?;

    let row: TransactionRow = sqlx::query_as(concat!(
        "INSERT INTO balance_transactions \
         (balance_id, type, amount, balance_before, balance_after, description, payment_request_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING ",
        transaction_columns!()
    ))
    .bind(balance.id)
    .bind(posting.transaction_type.as_str())
    .bind(posting.amount)
    .bind(balance.balance)
    .bind(balance_after)
    .bind(&posting.description)
    .bind(posting.payment_request_id)
    .bind(posting.created_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok((updated.into(), row.try_into()?))
}

async fn upsert_subscription(
    conn: &mut PgConnection,
    subscription: &Subscription,
) -> BillingResult<Subscription> {
    let row: SubscriptionRow = sqlx::query_as(concat!(
        "INSERT INTO merchant_subscriptions \
         (merchant_id, type, status, trial_ends_at, current_period_end, suspend_reason, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (merchant_id) DO UPDATE SET \
           type = EXCLUDED.type, status = EXCLUDED.status, \
           trial_ends_at = EXCLUDED.trial_ends_at, current_period_end = EXCLUDED.current_period_end, \
           suspend_reason = EXCLUDED.suspend_reason, updated_at = EXCLUDED.updated_at \
         RETURNING ",
        subscription_columns!()
    ))
    .bind(subscription.merchant_id)
    .bind(subscription.subscription_type.as_str())
    .bind(subscription.status.as_str())
    .bind(subscription.trial_ends_at)
    .bind(subscription.current_period_end)
    .bind(&subscription.suspend_reason)
    .bind(subscription.created_at)
    .bind(subscription.updated_at)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

async fn insert_payment_request(
    conn: &mut PgConnection,
    draft: &NewPaymentRequest,
) -> BillingResult<PaymentRequest> {
    let row: PaymentRequestRow = sqlx::query_as(concat!(
        "INSERT INTO payment_requests \
         (merchant_id, type, status, amount, months_requested, currency, bank_name, \
          bank_account_name, bank_account_number, expires_at, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11) RETURNING ",
        payment_request_columns!()
    ))
    .bind(draft.merchant_id)
    .bind(draft.request_type.as_str())
    .bind(PaymentRequestStatus::Pending.as_str())
    .bind(draft.amount)
    .bind(draft.months_requested)
    .bind(draft.currency.as_str())
    .bind(&draft.bank.bank_name)
    .bind(&draft.bank.account_name)
    .bind(&draft.bank.account_number)
    .bind(draft.expires_at)
    .bind(draft.created_at)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

async fn update_payment_request(
    conn: &mut PgConnection,
    request: &PaymentRequest,
) -> BillingResult<PaymentRequest> {
    let row: PaymentRequestRow = sqlx::query_as(concat!(
        "UPDATE payment_requests SET \
           status = $2, transfer_notes = $3, transfer_proof_url = $4, confirmed_at = $5, \
           verified_at = $6, verified_by = $7, rejected_at = $8, rejection_reason = $9, \
           cancelled_at = $10, updated_at = $11 \
         WHERE id = $1 RETURNING ",
        payment_request_columns!()
    ))
    .bind(request.id)
    .bind(request.status.as_str())
    .bind(&request.transfer_notes)
    .bind(&request.transfer_proof_url)
    .bind(request.confirmed_at)
    .bind(request.verified_at)
    .bind(request.verified_by)
    .bind(request.rejected_at)
    .bind(&request.rejection_reason)
    .bind(request.cancelled_at)
    .bind(request.updated_at)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

async fn insert_history(
    conn: &mut PgConnection,
    entry: &NewHistoryEntry,
) -> BillingResult<SubscriptionHistoryEntry> {
    let row: HistoryRow = sqlx::query_as(concat!(
        "INSERT INTO subscription_history \
         (merchant_id, event_type, previous_type, previous_status, previous_balance, previous_period_end, \
          new_type, new_status, new_balance, new_period_end, reason, metadata, triggered_by, \
          triggered_by_user_id, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) RETURNING ",
        history_columns!()
    ))
    .bind(entry.merchant_id)
    .bind(entry.event_type.as_str())
    .bind(entry.previous.subscription_type.as_str())
    .bind(entry.previous.status.as_str())
    .bind(entry.previous.balance)
    .bind(entry.previous.period_end)
    .bind(entry.new.subscription_type.as_str())
    .bind(entry.new.status.as_str())
    .bind(entry.new.balance)
    .bind(entry.new.period_end)
    .bind(&entry.reason)
    .bind(Json(&entry.metadata))
    .bind(entry.triggered_by.as_str())
    .bind(entry.triggered_by_user_id)
    .bind(entry.created_at)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

/// Settlement store backed by PostgreSQL
#[derive(Clone)]
pub struct PgSettlementStore {
    pool: PgPool,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    async fn active_plan(&self) -> BillingResult<Option<ActivePlan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, grace_period_days, monthly_days, trial_days,
                   idr_deposit_minimum, idr_order_fee, idr_monthly_price,
                   idr_bank_name, idr_bank_account_name, idr_bank_account_number,
                   aud_deposit_minimum, aud_order_fee, aud_monthly_price,
                   aud_bank_name, aud_bank_account_name, aud_bank_account_number
            FROM subscription_plans
            WHERE is_active = true
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ActivePlan::from))
    }

    async fn merchant(&self, id: MerchantId) -> BillingResult<Option<Merchant>> {
        let row: Option<MerchantRow> =
            sqlx::query_as(concat!("SELECT ", merchant_columns!(), " FROM merchants WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Merchant::try_from).transpose()
    }

    async fn ensure_balance(&self, merchant_id: MerchantId) -> BillingResult<Balance> {
        let mut conn = self.pool.acquire().await?;
        fetch_merchant(&mut conn, merchant_id).await?;

        sqlx::query("INSERT INTO merchant_balances (merchant_id) VALUES ($1) ON CONFLICT (merchant_id) DO NOTHING")
            .bind(merchant_id)
            .execute(&mut *conn)
            .await?;

        let row: BalanceRow = sqlx::query_as(concat!(
            "SELECT ",
            balance_columns!(),
            " FROM merchant_balances WHERE merchant_id = $1"
        ))
        .bind(merchant_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.into())
    }

    async fn subscription(&self, merchant_id: MerchantId) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM merchant_subscriptions WHERE merchant_id = $1"
        ))
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn active_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM merchant_subscriptions WHERE status = 'ACTIVE' ORDER BY merchant_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn payment_request(&self, id: PaymentRequestId) -> BillingResult<Option<PaymentRequest>> {
        let row: Option<PaymentRequestRow> = sqlx::query_as(concat!(
            "SELECT ",
            payment_request_columns!(),
            " FROM payment_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentRequest::try_from).transpose()
    }

    async fn open_payment_request(
        &self,
        merchant_id: MerchantId,
    ) -> BillingResult<Option<PaymentRequest>> {
        let mut conn = self.pool.acquire().await?;
        fetch_open_request(&mut conn, merchant_id).await
    }

    async fn payment_requests_for_merchant(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<PaymentRequest>> {
        let rows: Vec<PaymentRequestRow> = sqlx::query_as(concat!(
            "SELECT ",
            payment_request_columns!(),
            " FROM payment_requests WHERE merchant_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(merchant_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn overdue_payment_requests(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentRequest>> {
        let rows: Vec<PaymentRequestRow> = sqlx::query_as(concat!(
            "SELECT ",
            payment_request_columns!(),
            " FROM payment_requests WHERE status = 'PENDING' AND expires_at <= $1 ORDER BY id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_transactions(
        &self,
        balance_id: i64,
        query: &TransactionQuery,
    ) -> BillingResult<TransactionPage> {
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_escape);
        let transaction_type = query.transaction_type.map(|t| t.as_str());
        let marker = format!("%{}%", DAYS_SUBSCRIPTION_MARKER);

        let (total,): (i64,) = sqlx::query_as(concat!(
            "SELECT COUNT(*) FROM balance_transactions ",
            transaction_filter!()
        ))
        .bind(balance_id)
        .bind(query.from)
        .bind(query.to)
        .bind(transaction_type)
        .bind(&search)
        .bind(&marker)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<TransactionRow> = sqlx::query_as(concat!(
            "SELECT ",
            transaction_columns!(),
            " FROM balance_transactions ",
            transaction_filter!(),
            " ORDER BY created_at DESC, id DESC LIMIT $7 OFFSET $8"
        ))
        .bind(balance_id)
        .bind(query.from)
        .bind(query.to)
        .bind(transaction_type)
        .bind(&search)
        .bind(&marker)
        .bind(query.page.limit)
        .bind(query.page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(TransactionPage {
            items: convert_all(rows)?,
            total,
            page: query.page,
        })
    }

    async fn usage_fee_transactions(
        &self,
        balance_id: i64,
        since: OffsetDateTime,
    ) -> BillingResult<Vec<BalanceTransaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(concat!(
            "SELECT ",
            transaction_columns!(),
            " FROM balance_transactions \
             WHERE balance_id = $1 AND created_at >= $2 AND amount < 0 \
               AND type IN ('ORDER_FEE', 'COMPLETED_ORDER_EMAIL_FEE')"
        ))
        .bind(balance_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn history(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(concat!(
            "SELECT ",
            history_columns!(),
            " FROM subscription_history WHERE merchant_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(merchant_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn apply_account_change(
        &self,
        merchant_id: MerchantId,
        request_id: Option<PaymentRequestId>,
        mutation: AccountMutation,
    ) -> BillingResult<AccountCommit> {
        let mut tx = self.pool.begin().await?;

        let merchant = fetch_merchant(&mut tx, merchant_id).await?;
        let balance = lock_balance(&mut tx, merchant_id).await?;
        let subscription = lock_subscription(&mut tx, merchant_id).await?;
        let payment_request = match request_id {
            Some(id) => match lock_payment_request(&mut tx, id).await? {
                Some(r) if r.merchant_id == merchant_id => Some(r),
                _ => {
                    return Err(BillingError::NotFound(format!(
                        "Payment request {} not found",
                        id
                    )))
                }
            },
            None => None,
        };
        let open_request = fetch_open_request(&mut tx, merchant_id).await?;

        let snapshot = AccountSnapshot {
            merchant,
            balance,
            subscription,
            payment_request,
            open_request,
        };
        let changes = mutation(&snapshot)?;
        if changes.is_empty() {
            tx.rollback().await?;
            return Ok(AccountCommit::unchanged(snapshot.balance));
        }
        let AccountChanges {
            subscription,
            posting,
            payment_request,
            history,
        } = changes;

        let mut balance = snapshot.balance;
        let transaction = match &posting {
            Some(posting) => {
                let (updated, row) = post_transaction(&mut tx, &balance, posting).await?;
                balance = updated;
                Some(row)
            }
            None => None,
        };

        let subscription = match &subscription {
            Some(s) => Some(upsert_subscription(&mut tx, s).await?),
            None => None,
        };

        let payment_request = match &payment_request {
            Some(PaymentRequestWrite::Insert(draft)) => Some(insert_payment_request(&mut tx, draft).await?),
            Some(PaymentRequestWrite::Update(request)) => {
                Some(update_payment_request(&mut tx, request).await?)
            }
            None => None,
        };

        let history = match &history {
            Some(entry) => Some(insert_history(&mut tx, entry).await?),
            None => None,
        };

        tx.commit().await?;

        Ok(AccountCommit {
            balance,
            subscription,
            transaction,
            payment_request,
            history,
        })
    }

    async fn apply_transfer(
        &self,
        from: MerchantId,
        to: MerchantId,
        mutation: TransferMutation,
    ) -> BillingResult<TransferCommit> {
        if from == to {
            return Err(BillingError::Validation(
                "Cannot transfer to the same merchant".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let from_merchant = fetch_merchant(&mut tx, from).await?;
        let to_merchant = fetch_merchant(&mut tx, to).await?;

        let (first, second) = lock_order(from, to);
        let first_balance = lock_balance(&mut tx, first).await?;
        let second_balance = lock_balance(&mut tx, second).await?;
        let (from_balance, to_balance) = if first == from {
            (first_balance, second_balance)
        } else {
            (second_balance, first_balance)
        };

        let snapshot = TransferSnapshot {
            from_subscription: lock_subscription(&mut tx, from).await?,
            to_subscription: lock_subscription(&mut tx, to).await?,
            from_merchant,
            to_merchant,
            from_balance,
            to_balance,
        };
        let legs = mutation(&snapshot)?;

        let (from_balance, debit) =
            post_transaction(&mut tx, &snapshot.from_balance, &legs.debit).await?;
        let (to_balance, credit) =
            post_transaction(&mut tx, &snapshot.to_balance, &legs.credit).await?;
        insert_history(&mut tx, &legs.debit_history).await?;
        insert_history(&mut tx, &legs.credit_history).await?;

        tx.commit().await?;

        Ok(TransferCommit {
            from_balance,
            to_balance,
            debit,
            credit,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MissingPeriodEndRow {
    merchant_id: MerchantId,
    subscription_type: String,
    status: String,
}

impl TryFrom<MissingPeriodEndRow> for MissingPeriodEnd {
    type Error = BillingError;

    fn try_from(row: MissingPeriodEndRow) -> Result<Self, Self::Error> {
        Ok(Self {
            merchant_id: row.merchant_id,
            subscription_type: row.subscription_type.parse()?,
            status: row.status.parse()?,
        })
    }
}

#[async_trait]
impl LedgerAudit for PgSettlementStore {
    async fn arithmetic_mismatches(&self) -> BillingResult<Vec<ArithmeticMismatch>> {
        let rows = sqlx::query_as(
            r#"
            SELECT t.id AS transaction_id, b.merchant_id, t.amount, t.balance_before, t.balance_after
            FROM balance_transactions t
            JOIN merchant_balances b ON b.id = t.balance_id
            WHERE t.balance_after <> t.balance_before + t.amount
            ORDER BY t.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn balance_drift(&self) -> BillingResult<Vec<BalanceDrift>> {
        let rows = sqlx::query_as(
            r#"
            SELECT b.merchant_id, b.balance,
                   latest.balance_after AS latest_balance_after,
                   latest.id AS latest_transaction_id
            FROM merchant_balances b
            LEFT JOIN LATERAL (
                SELECT t.id, t.balance_after
                FROM balance_transactions t
                WHERE t.balance_id = b.id
                ORDER BY t.id DESC
                LIMIT 1
            ) latest ON true
            WHERE b.balance <> COALESCE(latest.balance_after, 0)
            ORDER BY b.merchant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn open_request_pileups(&self) -> BillingResult<Vec<OpenRequestPileup>> {
        let rows = sqlx::query_as(
            r#"
            SELECT merchant_id, COUNT(*) AS open_count
            FROM payment_requests
            WHERE status IN ('PENDING', 'CONFIRMED')
            GROUP BY merchant_id
            HAVING COUNT(*) > 1
            ORDER BY merchant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn unposted_topups(&self) -> BillingResult<Vec<UnpostedTopup>> {
        let rows = sqlx::query_as(
            r#"
            SELECT pr.id AS request_id, pr.merchant_id, pr.amount, pr.verified_at
            FROM payment_requests pr
            WHERE pr.type = 'DEPOSIT_TOPUP'
              AND pr.status = 'VERIFIED'
              AND NOT EXISTS (
                  SELECT 1 FROM balance_transactions t
                  WHERE t.payment_request_id = pr.id AND t.type = 'TOPUP'
              )
            ORDER BY pr.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn missing_period_ends(&self) -> BillingResult<Vec<MissingPeriodEnd>> {
        let rows: Vec<MissingPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT merchant_id, type AS subscription_type, status
            FROM merchant_subscriptions
            WHERE (type = 'TRIAL' AND trial_ends_at IS NULL)
               OR (type = 'MONTHLY' AND current_period_end IS NULL)
            ORDER BY merchant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

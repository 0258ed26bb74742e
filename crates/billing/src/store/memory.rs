//! In-memory settlement store
//!
//! One async mutex serializes every transaction, standing in for the row
//! locks of the PostgreSQL store. Writes are staged on a copy of the state and
//! swapped in only when every step succeeded, so an error at any point
//! (including an injected [`FailPoint`]) leaves the store untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use orderdesk_shared::{
    MerchantId, PaymentRequestId, PaymentRequestStatus, PaymentRequestType, SubscriptionStatus,
    SubscriptionType, TransactionType,
};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    lock_order, AccountChanges, AccountCommit, AccountMutation, AccountSnapshot, LedgerPosting,
    PaymentRequestWrite, SettlementStore, TransactionPage, TransactionQuery, TransferCommit,
    TransferMutation, TransferSnapshot,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{BillingError, BillingResult};
use crate::invariants::{
    ArithmeticMismatch, BalanceDrift, LedgerAudit, MissingPeriodEnd, OpenRequestPileup,
    UnpostedTopup,
};
use crate::ledger;
use crate::models::{
    Balance, BalanceTransaction, Merchant, NewHistoryEntry, Page, PaymentRequest, Subscription,
    SubscriptionHistoryEntry,
};
use crate::pricing::ActivePlan;

/// Step at which the next write transaction fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Before any ledger row is written
    LedgerInsert,
    /// Between the debit and the credit leg of a transfer
    AfterTransferDebit,
    /// When appending a history entry
    HistoryInsert,
}

#[derive(Debug, Clone, Default)]
struct State {
    plan: Option<ActivePlan>,
    merchants: BTreeMap<MerchantId, Merchant>,
    balances: BTreeMap<MerchantId, Balance>,
    subscriptions: BTreeMap<MerchantId, Subscription>,
    payment_requests: BTreeMap<PaymentRequestId, PaymentRequest>,
    transactions: Vec<BalanceTransaction>,
    history: Vec<SubscriptionHistoryEntry>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn merchant(&self, id: MerchantId) -> BillingResult<Merchant> {
        self.merchants
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Merchant {} not found", id)))
    }

    fn ensure_balance(
        &mut self,
        merchant_id: MerchantId,
        now: OffsetDateTime,
    ) -> BillingResult<Balance> {
        self.merchant(merchant_id)?;
        if let Some(balance) = self.balances.get(&merchant_id) {
            return Ok(balance.clone());
        }
        let balance = Balance {
            id: self.next_id(),
            merchant_id,
            balance: Decimal::ZERO,
            last_topup_at: None,
            created_at: now,
            updated_at: now,
        };
        self.balances.insert(merchant_id, balance.clone());
        Ok(balance)
    }

    fn merchant_of_balance(&self, balance_id: i64) -> Option<MerchantId> {
        self.balances
            .values()
            .find(|b| b.id == balance_id)
            .map(|b| b.merchant_id)
    }

    fn open_request(&self, merchant_id: MerchantId) -> Option<PaymentRequest> {
        self.payment_requests
            .values()
            .find(|r| r.merchant_id == merchant_id && r.status.is_open())
            .cloned()
    }

    fn post(
        &mut self,
        merchant_id: MerchantId,
        posting: &LedgerPosting,
    ) -> BillingResult<(Balance, BalanceTransaction)> {
        let mut balance = self.ensure_balance(merchant_id, posting.created_at)?;
        let balance_after = ledger::post(balance.balance, posting)?;

        let row = BalanceTransaction {
            id: self.next_id(),
            balance_id: balance.id,
            transaction_type: posting.transaction_type,
            amount: posting.amount,
            balance_before: balance.balance,
            balance_after,
            description: posting.description.clone(),
            payment_request_id: posting.payment_request_id,
            created_at: posting.created_at,
        };

        balance.balance = balance_after;
        balance.updated_at = posting.created_at;
        if posting.marks_topup {
            balance.last_topup_at = Some(posting.created_at);
        }

        self.balances.insert(merchant_id, balance.clone());
        self.transactions.push(row.clone());
        Ok((balance, row))
    }

    fn append_history(&mut self, entry: NewHistoryEntry) -> SubscriptionHistoryEntry {
        let id = self.next_id();
        let stored = entry.into_entry(id);
        self.history.push(stored.clone());
        stored
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

/// Settlement store kept entirely in memory
pub struct MemoryStore {
    state: Mutex<State>,
    fail_point: StdMutex<Option<FailPoint>>,
    /// Stamps rows the database would default to `NOW()`
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_point: StdMutex::new(None),
            clock,
        }
    }

    pub async fn set_active_plan(&self, plan: Option<ActivePlan>) {
        self.state.lock().await.plan = plan;
    }

    pub async fn add_merchant(&self, merchant: Merchant) {
        self.state.lock().await.merchants.insert(merchant.id, merchant);
    }

    pub async fn put_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.merchant_id, subscription);
    }

    /// Credit an opening balance through the ledger so its history stays consistent
    pub async fn seed_balance(
        &self,
        merchant_id: MerchantId,
        amount: Decimal,
    ) -> BillingResult<Balance> {
        let mut state = self.state.lock().await;
        let posting = LedgerPosting {
            transaction_type: TransactionType::Topup,
            amount,
            description: "Opening balance".to_string(),
            payment_request_id: None,
            require_sufficient_funds: false,
            marks_topup: false,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let (balance, _) = state.post(merchant_id, &posting)?;
        Ok(balance)
    }

    /// Make the next write transaction fail at `point`
    pub fn fail_next(&self, point: FailPoint) {
        *self.fail_point.lock().unwrap_or_else(|e| e.into_inner()) = Some(point);
    }

    /// Every ledger row of a merchant in posting order
    pub async fn ledger_of(&self, merchant_id: MerchantId) -> Vec<BalanceTransaction> {
        let state = self.state.lock().await;
        let Some(balance) = state.balances.get(&merchant_id) else {
            return Vec::new();
        };
        state
            .transactions
            .iter()
            .filter(|t| t.balance_id == balance.id)
            .cloned()
            .collect()
    }

    pub async fn history_len(&self, merchant_id: MerchantId) -> usize {
        self.state
            .lock()
            .await
            .history
            .iter()
            .filter(|h| h.merchant_id == merchant_id)
            .count()
    }

    fn check(&self, point: FailPoint) -> BillingResult<()> {
        let mut armed = self.fail_point.lock().unwrap_or_else(|e| e.into_inner());
        if *armed == Some(point) {
            *armed = None;
            return Err(BillingError::Database(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn persist_account(
        &self,
        state: &mut State,
        merchant_id: MerchantId,
        changes: AccountChanges,
    ) -> BillingResult<AccountCommit> {
        let mut transaction = None;
        if let Some(posting) = &changes.posting {
            self.check(FailPoint::LedgerInsert)?;
            let (_, row) = state.post(merchant_id, posting)?;
            transaction = Some(row);
        }

        if let Some(subscription) = &changes.subscription {
            state
                .subscriptions
                .insert(merchant_id, subscription.clone());
        }

        let payment_request = match changes.payment_request {
            Some(PaymentRequestWrite::Insert(draft)) => {
                if state.open_request(merchant_id).is_some() {
                    return Err(BillingError::Conflict(
                        "An open payment request already exists".to_string(),
                    ));
                }
                let request = PaymentRequest {
                    id: PaymentRequestId(state.next_id()),
                    merchant_id: draft.merchant_id,
                    request_type: draft.request_type,
                    status: PaymentRequestStatus::Pending,
                    amount: draft.amount,
                    months_requested: draft.months_requested,
                    currency: draft.currency,
                    bank: draft.bank,
                    transfer_notes: None,
                    transfer_proof_url: None,
                    expires_at: draft.expires_at,
                    confirmed_at: None,
                    verified_at: None,
                    verified_by: None,
                    rejected_at: None,
                    rejection_reason: None,
                    cancelled_at: None,
                    created_at: draft.created_at,
                    updated_at: draft.created_at,
                };
                state.payment_requests.insert(request.id, request.clone());
                Some(request)
            }
            Some(PaymentRequestWrite::Update(request)) => {
                state.payment_requests.insert(request.id, request.clone());
                Some(request)
            }
            None => None,
        };

        let history = match changes.history {
            Some(entry) => {
                self.check(FailPoint::HistoryInsert)?;
                Some(state.append_history(entry))
            }
            None => None,
        };

        Ok(AccountCommit {
            balance: state.ensure_balance(merchant_id, self.clock.now())?,
            subscription: changes.subscription,
            transaction,
            payment_request,
            history,
        })
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn active_plan(&self) -> BillingResult<Option<ActivePlan>> {
        Ok(self.state.lock().await.plan.clone())
    }

    async fn merchant(&self, id: MerchantId) -> BillingResult<Option<Merchant>> {
        Ok(self.state.lock().await.merchants.get(&id).cloned())
    }

    async fn ensure_balance(&self, merchant_id: MerchantId) -> BillingResult<Balance> {
        self.state.lock().await.ensure_balance(merchant_id, self.clock.now())
    }

    async fn subscription(&self, merchant_id: MerchantId) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&merchant_id).cloned())
    }

    async fn active_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .cloned()
            .collect())
    }

    async fn payment_request(&self, id: PaymentRequestId) -> BillingResult<Option<PaymentRequest>> {
        Ok(self.state.lock().await.payment_requests.get(&id).cloned())
    }

    async fn open_payment_request(
        &self,
        merchant_id: MerchantId,
    ) -> BillingResult<Option<PaymentRequest>> {
        Ok(self.state.lock().await.open_request(merchant_id))
    }

    async fn payment_requests_for_merchant(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<PaymentRequest>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .payment_requests
            .values()
            .filter(|r| r.merchant_id == merchant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(paginate(rows, page))
    }

    async fn overdue_payment_requests(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentRequest>> {
        Ok(self
            .state
            .lock()
            .await
            .payment_requests
            .values()
            .filter(|r| r.is_overdue(now))
            .cloned()
            .collect())
    }

    async fn list_transactions(
        &self,
        balance_id: i64,
        query: &TransactionQuery,
    ) -> BillingResult<TransactionPage> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .transactions
            .iter()
            .filter(|t| t.balance_id == balance_id && ledger::matches_query(t, query))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = rows.len() as i64;
        Ok(TransactionPage {
            items: paginate(rows, query.page),
            total,
            page: query.page,
        })
    }

    async fn usage_fee_transactions(
        &self,
        balance_id: i64,
        since: OffsetDateTime,
    ) -> BillingResult<Vec<BalanceTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| {
                t.balance_id == balance_id
                    && t.transaction_type.is_usage_fee()
                    && t.amount.is_sign_negative()
                    && t.created_at >= since
            })
            .cloned()
            .collect())
    }

    async fn history(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .history
            .iter()
            .filter(|h| h.merchant_id == merchant_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(paginate(rows, page))
    }

    async fn apply_account_change(
        &self,
        merchant_id: MerchantId,
        request_id: Option<PaymentRequestId>,
        mutation: AccountMutation,
    ) -> BillingResult<AccountCommit> {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let mut staged = guard.clone();

        let merchant = staged.merchant(merchant_id)?;
        let balance = staged.ensure_balance(merchant_id, now)?;
        let payment_request = match request_id {
            Some(id) => match staged.payment_requests.get(&id) {
                Some(r) if r.merchant_id == merchant_id => Some(r.clone()),
                _ => {
                    return Err(BillingError::NotFound(format!(
                        "Payment request {} not found",
                        id
                    )))
                }
            },
            None => None,
        };

        let snapshot = AccountSnapshot {
            subscription: staged.subscriptions.get(&merchant_id).cloned(),
            open_request: staged.open_request(merchant_id),
            merchant,
            balance,
            payment_request,
        };

        let changes = mutation(&snapshot)?;
        if changes.is_empty() {
            return Ok(AccountCommit::unchanged(snapshot.balance));
        }
        let commit = self.persist_account(&mut staged, merchant_id, changes)?;
        *guard = staged;
        Ok(commit)
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

        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let mut staged = guard.clone();

        let (first, second) = lock_order(from, to);
        staged.ensure_balance(first, now)?;
        staged.ensure_balance(second, now)?;

        let snapshot = TransferSnapshot {
            from_merchant: staged.merchant(from)?,
            to_merchant: staged.merchant(to)?,
            from_balance: staged.ensure_balance(from, now)?,
            to_balance: staged.ensure_balance(to, now)?,
            from_subscription: staged.subscriptions.get(&from).cloned(),
            to_subscription: staged.subscriptions.get(&to).cloned(),
        };

        let legs = mutation(&snapshot)?;

        self.check(FailPoint::LedgerInsert)?;
        let (_, debit) = staged.post(from, &legs.debit)?;
        self.check(FailPoint::AfterTransferDebit)?;
        let (_, credit) = staged.post(to, &legs.credit)?;

        self.check(FailPoint::HistoryInsert)?;
        staged.append_history(legs.debit_history);
        staged.append_history(legs.credit_history);

        let commit = TransferCommit {
            from_balance: staged.ensure_balance(from, now)?,
            to_balance: staged.ensure_balance(to, now)?,
            debit,
            credit,
        };
        *guard = staged;
        Ok(commit)
    }
}

#[async_trait]
impl LedgerAudit for MemoryStore {
    async fn arithmetic_mismatches(&self) -> BillingResult<Vec<ArithmeticMismatch>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.balance_after != t.balance_before + t.amount)
            .filter_map(|t| {
                Some(ArithmeticMismatch {
                    transaction_id: t.id,
                    merchant_id: state.merchant_of_balance(t.balance_id)?,
                    amount: t.amount,
                    balance_before: t.balance_before,
                    balance_after: t.balance_after,
                })
            })
            .collect())
    }

    async fn balance_drift(&self) -> BillingResult<Vec<BalanceDrift>> {
        let state = self.state.lock().await;
        Ok(state
            .balances
            .values()
            .filter_map(|b| {
                let latest = state
                    .transactions
                    .iter()
                    .filter(|t| t.balance_id == b.id)
                    .max_by_key(|t| t.id);
                let expected = latest.map_or(Decimal::ZERO, |t| t.balance_after);
                (b.balance != expected).then(|| BalanceDrift {
                    merchant_id: b.merchant_id,
                    balance: b.balance,
                    latest_balance_after: latest.map(|t| t.balance_after),
                    latest_transaction_id: latest.map(|t| t.id),
                })
            })
            .collect())
    }

    async fn open_request_pileups(&self) -> BillingResult<Vec<OpenRequestPileup>> {
        let state = self.state.lock().await;
        let mut open: BTreeMap<MerchantId, i64> = BTreeMap::new();
        for request in state.payment_requests.values().filter(|r| r.status.is_open()) {
            *open.entry(request.merchant_id).or_default() += 1;
        }
        Ok(open
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(merchant_id, open_count)| OpenRequestPileup {
                merchant_id,
                open_count,
            })
            .collect())
    }

    async fn unposted_topups(&self) -> BillingResult<Vec<UnpostedTopup>> {
        let state = self.state.lock().await;
        Ok(state
            .payment_requests
            .values()
            .filter(|r| {
                r.request_type == PaymentRequestType::DepositTopup
                    && r.status == PaymentRequestStatus::Verified
                    && !state.transactions.iter().any(|t| {
                        t.payment_request_id == Some(r.id)
                            && t.transaction_type == TransactionType::Topup
                    })
            })
            .map(|r| UnpostedTopup {
                request_id: r.id,
                merchant_id: r.merchant_id,
                amount: r.amount,
                verified_at: r.verified_at,
            })
            .collect())
    }

    async fn missing_period_ends(&self) -> BillingResult<Vec<MissingPeriodEnd>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| match s.subscription_type {
                SubscriptionType::Trial => s.trial_ends_at.is_none(),
                SubscriptionType::Monthly => s.current_period_end.is_none(),
                _ => false,
            })
            .map(|s| MissingPeriodEnd {
                merchant_id: s.merchant_id,
                subscription_type: s.subscription_type,
                status: s.status,
            })
            .collect())
    }
}

/// Writes that bypass the settlement rules, for seeding inconsistent state
#[cfg(test)]
impl MemoryStore {
    pub async fn overwrite_balance(&self, merchant_id: MerchantId, amount: Decimal) {
        let mut state = self.state.lock().await;
        if let Some(balance) = state.balances.get_mut(&merchant_id) {
            balance.balance = amount;
        }
    }

    pub async fn push_raw_transaction(
        &self,
        merchant_id: MerchantId,
        balance_before: Decimal,
        amount: Decimal,
        balance_after: Decimal,
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let balance = state.ensure_balance(merchant_id, now).unwrap();
        let id = state.next_id();
        state.transactions.push(BalanceTransaction {
            id,
            balance_id: balance.id,
            transaction_type: TransactionType::Adjustment,
            amount,
            balance_before,
            balance_after,
            description: "Unchecked row".to_string(),
            payment_request_id: None,
            created_at: now,
        });
    }

    pub async fn put_payment_request(&self, request: PaymentRequest) {
        self.state
            .lock()
            .await
            .payment_requests
            .insert(request.id, request);
    }
}

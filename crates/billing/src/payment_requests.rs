//! Payment request workflow
//!
//! ```text
//! PENDING --confirm--> CONFIRMED --verify--> VERIFIED
//!                      CONFIRMED --reject--> REJECTED
//! PENDING | CONFIRMED --cancel--> CANCELLED
//! PENDING --deadline passed--> EXPIRED
//! ```
//!
//! Expiry is passive: every read of an overdue PENDING request flips it to
//! EXPIRED in its own transaction before returning it. The worker sweep does
//! the same for rows nobody reads.

use std::sync::Arc;

use orderdesk_shared::{
    HistoryEventType, MerchantId, PaymentRequestId, PaymentRequestStatus, PaymentRequestType,
    SubscriptionStatus, SubscriptionType, TransactionType, TriggeredBy,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::history::{self, HistoryEntryBuilder};
use crate::models::{BalanceTransaction, NewPaymentRequest, Page, PaymentRequest, Subscription};
use crate::pricing::{PlanPricing, PricingResolver};
use crate::store::{
    AccountChanges, AccountSnapshot, LedgerPosting, PaymentRequestWrite, SettlementStore,
};
use crate::subscriptions::{clamp_months, extend_period};

/// Reason stored on requests that ran past their deadline
pub const EXPIRED_REASON: &str = "Request expired";

/// Default lifetime of a PENDING request
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// What the merchant is asking to pay for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreatePaymentRequest {
    DepositTopup { amount: Decimal },
    MonthlySubscription { months: i32 },
}

/// Details the merchant supplies after transferring
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TransferConfirmation {
    pub transfer_notes: Option<String>,
    pub transfer_proof_url: Option<String>,
}

/// Result of a staff verification
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub request: PaymentRequest,
    pub subscription: Option<Subscription>,
    pub transaction: Option<BalanceTransaction>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    pub expired: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PaymentRequestService {
    store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
    pricing: PricingResolver,
    ttl: Duration,
}

impl PaymentRequestService {
    pub fn new(store: Arc<dyn SettlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pricing: PricingResolver::new(store.clone()),
            store,
            clock,
            ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    pub fn with_ttl_hours(mut self, hours: i64) -> Self {
        self.ttl = Duration::hours(hours.max(1));
        self
    }

    /// Open a new request; only one may be PENDING/CONFIRMED per merchant
    pub async fn create(
        &self,
        merchant_id: MerchantId,
        input: CreatePaymentRequest,
    ) -> BillingResult<PaymentRequest> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let pricing = self.pricing.resolve(merchant.currency).await?;
        let (request_type, amount, months) = price_request(&pricing, input)?;

        // An overdue open request must not block a new one
        if let Some(open) = self.store.open_payment_request(merchant_id).await? {
            self.refresh(open).await?;
        }

        let now = self.clock.now();
        let draft = NewPaymentRequest {
            merchant_id,
            request_type,
            amount,
            months_requested: months,
            currency: merchant.currency,
            bank: pricing.bank.clone(),
            expires_at: now + self.ttl,
            created_at: now,
        };

        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                None,
                Box::new(move |snapshot| {
                    if let Some(open) = &snapshot.open_request {
                        return Err(BillingError::Conflict(format!(
                            "Payment request {} is still {}; confirm or cancel it first",
                            open.id, open.status
                        )));
                    }
                    Ok(AccountChanges {
                        payment_request: Some(PaymentRequestWrite::Insert(draft)),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        let request = committed_request(commit.payment_request)?;
        tracing::info!(
            merchant_id = %merchant_id,
            request_id = %request.id,
            request_type = %request.request_type,
            amount = %request.amount,
            "Created payment request"
        );
        Ok(request)
    }

    /// Merchant reports the bank transfer as done
    pub async fn confirm(
        &self,
        request_id: PaymentRequestId,
        confirmation: TransferConfirmation,
    ) -> BillingResult<PaymentRequest> {
        let request = self.get(request_id).await?;
        let now = self.clock.now();

        let request = self
            .transition(request.merchant_id, request_id, move |current| {
                if current.is_overdue(now) {
                    return Err(BillingError::Conflict(format!(
                        "Payment request {} has expired",
                        current.id
                    )));
                }
                require_status(current, &[PaymentRequestStatus::Pending], "confirm")?;

                let mut next = current.clone();
                next.status = PaymentRequestStatus::Confirmed;
                next.confirmed_at = Some(now);
                next.transfer_notes = non_blank(confirmation.transfer_notes);
                next.transfer_proof_url = non_blank(confirmation.transfer_proof_url);
                next.updated_at = now;
                Ok(next)
            })
            .await?;

        tracing::info!(
            merchant_id = %request.merchant_id,
            request_id = %request.id,
            "Payment request confirmed by merchant"
        );
        Ok(request)
    }

    pub async fn cancel(&self, request_id: PaymentRequestId) -> BillingResult<PaymentRequest> {
        let request = self.get(request_id).await?;
        let now = self.clock.now();

        let request = self
            .transition(request.merchant_id, request_id, move |current| {
                if current.is_overdue(now) {
                    return Err(BillingError::Conflict(format!(
                        "Payment request {} has expired",
                        current.id
                    )));
                }
                require_status(
                    current,
                    &[PaymentRequestStatus::Pending, PaymentRequestStatus::Confirmed],
                    "cancel",
                )?;

                let mut next = current.clone();
                next.status = PaymentRequestStatus::Cancelled;
                next.cancelled_at = Some(now);
                next.updated_at = now;
                Ok(next)
            })
            .await?;

        tracing::info!(
            merchant_id = %request.merchant_id,
            request_id = %request.id,
            "Payment request cancelled"
        );
        Ok(request)
    }

    /// Staff confirms the money arrived; funds or extends the subscription
    pub async fn verify(
        &self,
        request_id: PaymentRequestId,
        staff_user_id: Uuid,
    ) -> BillingResult<VerificationOutcome> {
        let request = self.get(request_id).await?;
        let pricing = self.pricing.resolve(request.currency).await?;
        let now = self.clock.now();

        let commit = self
            .store
            .apply_account_change(
                request.merchant_id,
                Some(request_id),
                Box::new(move |snapshot| verify_changes(snapshot, &pricing, staff_user_id, now)),
            )
            .await?;

        let request = committed_request(commit.payment_request)?;
        tracing::info!(
            merchant_id = %request.merchant_id,
            request_id = %request.id,
            request_type = %request.request_type,
            amount = %request.amount,
            staff_user_id = %staff_user_id,
            balance_after = %commit.balance.balance,
            "Payment request verified"
        );

        Ok(VerificationOutcome {
            request,
            subscription: commit.subscription,
            transaction: commit.transaction,
        })
    }

    pub async fn reject(
        &self,
        request_id: PaymentRequestId,
        reason: &str,
        staff_user_id: Uuid,
    ) -> BillingResult<PaymentRequest> {
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(BillingError::Validation(
                "A rejection reason is required".to_string(),
            ));
        }

        let request = self.get(request_id).await?;
        let now = self.clock.now();

        let request = self
            .transition(request.merchant_id, request_id, move |current| {
                require_status(current, &[PaymentRequestStatus::Confirmed], "reject")?;

                let mut next = current.clone();
                next.status = PaymentRequestStatus::Rejected;
                next.rejected_at = Some(now);
                next.rejection_reason = Some(reason);
                next.updated_at = now;
                Ok(next)
            })
            .await?;

        tracing::info!(
            merchant_id = %request.merchant_id,
            request_id = %request.id,
            staff_user_id = %staff_user_id,
            "Payment request rejected"
        );
        Ok(request)
    }

    /// Fetch one request, expiring it first if overdue
    pub async fn get(&self, request_id: PaymentRequestId) -> BillingResult<PaymentRequest> {
        let request = self
            .store
            .payment_request(request_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Payment request {} not found", request_id))
            })?;
        self.refresh(request).await
    }

    /// The merchant's PENDING/CONFIRMED request, if one is still open after expiry
    pub async fn active_for_merchant(
        &self,
        merchant_id: MerchantId,
    ) -> BillingResult<Option<PaymentRequest>> {
        self.store.require_merchant(merchant_id).await?;
        match self.store.open_payment_request(merchant_id).await? {
            Some(open) => {
                let open = self.refresh(open).await?;
                Ok(open.status.is_open().then_some(open))
            }
            None => Ok(None),
        }
    }

    pub async fn list_for_merchant(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<PaymentRequest>> {
        self.store.require_merchant(merchant_id).await?;
        let rows = self.store.payment_requests_for_merchant(merchant_id, page).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.refresh(row).await?);
        }
        Ok(out)
    }

    /// Expire every overdue PENDING request
    pub async fn sweep_expired(&self) -> BillingResult<ExpirySweep> {
        let now = self.clock.now();
        let mut sweep = ExpirySweep::default();

        for request in self.store.overdue_payment_requests(now).await? {
            let request_id = request.id;
            match self.refresh(request).await {
                Ok(r) if r.status == PaymentRequestStatus::Expired => sweep.expired += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to expire payment request");
                    sweep.failed += 1;
                }
            }
        }

        if sweep.expired > 0 || sweep.failed > 0 {
            tracing::info!(
                expired = sweep.expired,
                failed = sweep.failed,
                "Payment request expiry sweep complete"
            );
        }
        Ok(sweep)
    }

    /// Apply the lazy expiry to a request just read
    async fn refresh(&self, request: PaymentRequest) -> BillingResult<PaymentRequest> {
        let now = self.clock.now();
        if !request.is_overdue(now) {
            return Ok(request);
        }

        let commit = self
            .store
            .apply_account_change(
                request.merchant_id,
                Some(request.id),
                Box::new(move |snapshot| {
                    let Some(current) = snapshot.payment_request.as_ref() else {
                        return Ok(AccountChanges::none());
                    };
                    // Someone else moved it on while we waited for the lock
                    if !current.is_overdue(now) {
                        return Ok(AccountChanges::none());
                    }
                    let mut expired = current.clone();
                    expired.status = PaymentRequestStatus::Expired;
                    expired.rejection_reason = Some(EXPIRED_REASON.to_string());
                    expired.updated_at = now;
                    Ok(AccountChanges {
                        payment_request: Some(PaymentRequestWrite::Update(expired)),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        match commit.payment_request {
            Some(expired) => {
                tracing::info!(
                    merchant_id = %expired.merchant_id,
                    request_id = %expired.id,
                    "Payment request expired"
                );
                Ok(expired)
            }
            None => self.store.payment_request(request.id).await?.ok_or_else(|| {
                BillingError::NotFound(format!("Payment request {} not found", request.id))
            }),
        }
    }

    /// Run a status transition on the locked request row
    async fn transition<F>(
        &self,
        merchant_id: MerchantId,
        request_id: PaymentRequestId,
        step: F,
    ) -> BillingResult<PaymentRequest>
    where
        F: FnOnce(&PaymentRequest) -> BillingResult<PaymentRequest> + Send + 'static,
    {
        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                Some(request_id),
                Box::new(move |snapshot| {
                    let current = locked_request(snapshot)?;
                    let next = step(current)?;
                    Ok(AccountChanges {
                        payment_request: Some(PaymentRequestWrite::Update(next)),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;
        committed_request(commit.payment_request)
    }
}

/// Validate the input and compute the amount owed
fn price_request(
    pricing: &PlanPricing,
    input: CreatePaymentRequest,
) -> BillingResult<(PaymentRequestType, Decimal, Option<i32>)> {
    match input {
        CreatePaymentRequest::DepositTopup { amount } => {
            if amount.normalize().scale() > 2 {
                return Err(BillingError::Validation(format!(
                    "Amount {} has more than two decimal places",
                    amount
                )));
            }
            if amount < pricing.deposit_minimum {
                return Err(BillingError::Validation(format!(
                    "Minimum deposit is {} {}",
                    pricing.deposit_minimum, pricing.currency
                )));
            }
            Ok((PaymentRequestType::DepositTopup, amount, None))
        }
        CreatePaymentRequest::MonthlySubscription { months } => {
            let months = clamp_months(months);
            Ok((
                PaymentRequestType::MonthlySubscription,
                pricing.monthly_price * Decimal::from(months),
                Some(months),
            ))
        }
    }
}

fn verify_changes(
    snapshot: &AccountSnapshot,
    pricing: &PlanPricing,
    staff_user_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<AccountChanges> {
    let request = locked_request(snapshot)?;
    require_status(request, &[PaymentRequestStatus::Confirmed], "verify")?;

    let current = snapshot.subscription_or_absent(now);
    let before = snapshot.balance.balance;

    let mut verified = request.clone();
    verified.status = PaymentRequestStatus::Verified;
    verified.verified_at = Some(now);
    verified.verified_by = Some(staff_user_id);
    verified.updated_at = now;

    let (posting, next, builder) = match request.request_type {
        PaymentRequestType::DepositTopup => {
            let posting = LedgerPosting {
                transaction_type: TransactionType::Topup,
                amount: request.amount,
                description: format!("Deposit top-up via bank transfer (request #{})", request.id),
                payment_request_id: Some(request.id),
                require_sufficient_funds: false,
                marks_topup: true,
                created_at: now,
            };

            let mut next = current.clone();
            let reactivated = current.subscription_type == SubscriptionType::Deposit
                && current.status == SubscriptionStatus::Suspended;
            if reactivated {
                next.status = SubscriptionStatus::Active;
                next.suspend_reason = None;
                next.updated_at = now;
            }

            // A top-up that lifts a suspension is recorded as the reactivation
            let (event_type, reason) = if reactivated {
                (HistoryEventType::Reactivated, "Deposit top-up verified, subscription reactivated")
            } else {
                (HistoryEventType::PaymentVerified, "Deposit top-up verified")
            };
            let builder = HistoryEntryBuilder::new(
                request.merchant_id,
                event_type,
                current.snapshot(Some(before)),
                next.snapshot(Some(before + request.amount)),
                now,
            )
            .reason(reason);

            (posting, reactivated.then_some(next), builder)
        }
        PaymentRequestType::MonthlySubscription => {
            let months = clamp_months(request.months_requested.unwrap_or(1));
            let days = pricing.monthly_days * i64::from(months);
            let extension = extend_period(current.current_period_end, now, days);

            let posting = LedgerPosting {
                transaction_type: TransactionType::Subscription,
                amount: Decimal::ZERO,
                description: format!("Monthly plan: {} days subscription", days),
                payment_request_id: Some(request.id),
                require_sufficient_funds: false,
                marks_topup: false,
                created_at: now,
            };

            let mut next = current.clone();
            next.subscription_type = SubscriptionType::Monthly;
            next.status = SubscriptionStatus::Active;
            next.suspend_reason = None;
            next.trial_ends_at = None;
            next.current_period_end = Some(extension.to);
            next.updated_at = now;

            let builder = HistoryEntryBuilder::new(
                request.merchant_id,
                HistoryEventType::PaymentVerified,
                current.snapshot(Some(before)),
                next.snapshot(Some(before)),
                now,
            )
            .reason(format!("Monthly plan paid: {} months", months))
            .meta("months", months)
            .meta_time(history::PERIOD_FROM, extension.from)
            .meta_time(history::PERIOD_TO, extension.to)
            .meta(history::DAYS_DELTA, extension.days_delta);

            (posting, Some(next), builder)
        }
    };

    let entry = builder
        .meta(history::REQUEST_ID, request.id.0)
        .meta(history::FLOW_ID, format!("payment-{}", request.id))
        .meta(history::FLOW_TYPE, HistoryEventType::PaymentVerified.default_flow_type())
        .meta("requestType", request.request_type.as_str())
        .meta("amount", request.amount.to_string())
        .triggered_by(TriggeredBy::Staff, Some(staff_user_id))
        .build();

    Ok(AccountChanges {
        subscription: next,
        posting: Some(posting),
        payment_request: Some(PaymentRequestWrite::Update(verified)),
        history: Some(entry),
    })
}

fn locked_request(snapshot: &AccountSnapshot) -> BillingResult<&PaymentRequest> {
    snapshot
        .payment_request
        .as_ref()
        .ok_or_else(|| BillingError::NotFound("Payment request not found".to_string()))
}

fn require_status(
    request: &PaymentRequest,
    allowed: &[PaymentRequestStatus],
    action: &str,
) -> BillingResult<()> {
    if allowed.contains(&request.status) {
        Ok(())
    } else {
        Err(BillingError::Conflict(format!(
            "Cannot {} payment request {} while it is {}",
            action, request.id, request.status
        )))
    }
}

fn committed_request(request: Option<PaymentRequest>) -> BillingResult<PaymentRequest> {
    request.ok_or_else(|| {
        BillingError::Internal("Payment request write produced no row".to_string())
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, sample_plan, AUD_MERCHANT, IDR_MERCHANT, T0};
    use orderdesk_shared::Currency;
    use rust_decimal_macros::dec;

    fn staff() -> Uuid {
        Uuid::from_u128(0x5747_f000)
    }

    #[test]
    fn test_price_request() {
        let pricing = sample_plan().pricing_for(Currency::Idr);

        let err = price_request(
            &pricing,
            CreatePaymentRequest::DepositTopup { amount: dec!(99999) },
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let (kind, amount, months) = price_request(
            &pricing,
            CreatePaymentRequest::MonthlySubscription { months: 40 },
        )
        .unwrap();
        assert_eq!(kind, PaymentRequestType::MonthlySubscription);
        assert_eq!(amount, dec!(1200000));
        assert_eq!(months, Some(12));
    }

    #[test]
    fn test_create_input_is_tagged() {
        let input: CreatePaymentRequest =
            serde_json::from_str(r#"{"type":"MONTHLY_SUBSCRIPTION","months":3}"#).unwrap();
        assert_eq!(input, CreatePaymentRequest::MonthlySubscription { months: 3 });
    }

    #[tokio::test]
    async fn test_create_snapshots_bank_and_deadline() {
        let fx = fixture().await;
        let request = fx
            .billing
            .payment_requests
            .create(AUD_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(50.00) })
            .await
            .unwrap();

        assert_eq!(request.status, PaymentRequestStatus::Pending);
        assert_eq!(request.currency, Currency::Aud);
        assert_eq!(request.bank.bank_name, "Commonwealth Bank");
        assert_eq!(request.expires_at, T0 + Duration::hours(24));
    }

    #[tokio::test]
    async fn test_topup_lifecycle() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let request = service
            .create(IDR_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(150000) })
            .await
            .unwrap();

        // Only CONFIRMED requests can be verified
        let err = service.verify(request.id, staff()).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        let confirmed = service
            .confirm(
                request.id,
                TransferConfirmation {
                    transfer_notes: Some("  BCA ref 8812 ".to_string()),
                    transfer_proof_url: Some(String::new()),
                },
            )
            .await
            .unwrap();
        assert_eq!(confirmed.transfer_notes.as_deref(), Some("BCA ref 8812"));
        assert_eq!(confirmed.transfer_proof_url, None);

        let outcome = service.verify(request.id, staff()).await.unwrap();
        assert_eq!(outcome.request.status, PaymentRequestStatus::Verified);
        assert_eq!(outcome.request.verified_by, Some(staff()));
        let tx = outcome.transaction.unwrap();
        assert_eq!(tx.amount, dec!(150000));
        assert_eq!(tx.payment_request_id, Some(request.id));

        let view = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
        assert_eq!(view.balance.balance, dec!(150000));
        assert_eq!(view.balance.last_topup_at, Some(T0));

        let history = fx
            .billing
            .history
            .list(IDR_MERCHANT, Page::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, HistoryEventType::PaymentVerified);
        assert_eq!(
            history[0].metadata[history::FLOW_ID],
            serde_json::json!(format!("payment-{}", request.id))
        );
        assert_eq!(
            history[0].metadata[history::FLOW_TYPE],
            serde_json::json!("PAYMENT_VERIFICATION")
        );
    }

    #[tokio::test]
    async fn test_monthly_verification_extends_period() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let request = service
            .create(IDR_MERCHANT, CreatePaymentRequest::MonthlySubscription { months: 2 })
            .await
            .unwrap();
        assert_eq!(request.amount, dec!(200000));
        service
            .confirm(request.id, TransferConfirmation::default())
            .await
            .unwrap();

        let outcome = service.verify(request.id, staff()).await.unwrap();
        let sub = outcome.subscription.unwrap();
        assert_eq!(sub.subscription_type, SubscriptionType::Monthly);
        assert_eq!(sub.current_period_end, Some(T0 + Duration::days(60)));

        // The marker row is in the ledger but hidden from the listing
        let marker = outcome.transaction.unwrap();
        assert_eq!(marker.amount, Decimal::ZERO);
        let listed = fx
            .billing
            .ledger
            .list_transactions(IDR_MERCHANT, &Default::default())
            .await
            .unwrap();
        assert_eq!(listed.total, 0);

        let history = fx
            .billing
            .history
            .list(IDR_MERCHANT, Page::default())
            .await
            .unwrap();
        let meta = &history[0].metadata;
        assert_eq!(meta[history::DAYS_DELTA], serde_json::json!(60));
        assert_eq!(meta[history::PERIOD_FROM], serde_json::json!("2026-03-01T00:00:00Z"));
        assert_eq!(meta[history::PERIOD_TO], serde_json::json!("2026-04-30T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let request = service
            .create(IDR_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(100000) })
            .await
            .unwrap();
        service
            .confirm(request.id, TransferConfirmation::default())
            .await
            .unwrap();

        let err = service.reject(request.id, "   ", staff()).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let rejected = service
            .reject(request.id, "Transfer not found", staff())
            .await
            .unwrap();
        assert_eq!(rejected.status, PaymentRequestStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Transfer not found"));

        // Closed requests no longer block a new one
        assert!(service.active_for_merchant(IDR_MERCHANT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_only_while_open() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let request = service
            .create(IDR_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(100000) })
            .await
            .unwrap();
        let cancelled = service.cancel(request.id).await.unwrap();
        assert_eq!(cancelled.status, PaymentRequestStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(T0));

        let err = service.cancel(request.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_overdue_request_cannot_be_confirmed() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let request = service
            .create(IDR_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(100000) })
            .await
            .unwrap();
        fx.clock.advance(Duration::hours(24));

        let err = service
            .confirm(request.id, TransferConfirmation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        let stored = service.get(request.id).await.unwrap();
        assert_eq!(stored.status, PaymentRequestStatus::Expired);
        assert_eq!(stored.rejection_reason.as_deref(), Some(EXPIRED_REASON));

        // A fresh request is allowed once the old one expired
        service
            .create(IDR_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(100000) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expires_unread_requests() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        service
            .create(IDR_MERCHANT, CreatePaymentRequest::DepositTopup { amount: dec!(100000) })
            .await
            .unwrap();
        service
            .create(AUD_MERCHANT, CreatePaymentRequest::MonthlySubscription { months: 1 })
            .await
            .unwrap();

        fx.clock.advance(Duration::hours(23));
        assert_eq!(service.sweep_expired().await.unwrap().expired, 0);

        fx.clock.advance(Duration::hours(1));
        assert_eq!(service.sweep_expired().await.unwrap().expired, 2);
        assert_eq!(service.sweep_expired().await.unwrap(), ExpirySweep::default());
    }
}

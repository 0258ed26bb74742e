// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Settlement Engine
//!
//! Scenario tests for the properties that must hold across modules:
//! - Ledger conservation and concurrent debits
//! - Transfer atomicity, funds checks and lock ordering
//! - The single in-flight payment request and passive expiry
//! - Grace periods, auto-switch, switch eligibility and suspension

#[cfg(test)]
mod support {
    use orderdesk_shared::{MerchantId, SubscriptionStatus, SubscriptionType};
    use rust_decimal::Decimal;
    use time::OffsetDateTime;

    use crate::models::Subscription;
    use crate::testing::{Fixture, T0};

    pub fn subscription(
        merchant_id: MerchantId,
        subscription_type: SubscriptionType,
        status: SubscriptionStatus,
        end: Option<OffsetDateTime>,
    ) -> Subscription {
        let mut sub = Subscription::absent(merchant_id, T0);
        sub.subscription_type = subscription_type;
        sub.status = status;
        match subscription_type {
            SubscriptionType::Trial => sub.trial_ends_at = end,
            SubscriptionType::Monthly => sub.current_period_end = end,
            _ => {}
        }
        sub
    }

    /// Every row chains from the previous one and the last matches the balance
    pub async fn assert_conserved(fx: &Fixture, merchant_id: MerchantId) {
        let rows = fx.store.ledger_of(merchant_id).await;
        let balance = fx.billing.ledger.get_balance(merchant_id).await.unwrap();

        let mut running = Decimal::ZERO;
        for row in &rows {
            assert_eq!(row.balance_after, row.balance_before + row.amount);
            assert_eq!(row.balance_before, running, "row {} does not chain", row.id);
            running = row.balance_after;
        }
        assert_eq!(running, balance.balance.balance);
    }
}

#[cfg(test)]
mod ledger_tests {
    use std::sync::Arc;

    use orderdesk_shared::{Currency, SubscriptionStatus, SubscriptionType};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::Barrier;

    use super::support::{assert_conserved, subscription};
    use crate::error::BillingError;
    use crate::testing::{fixture, sample_plan, IDR_MERCHANT};

    // =========================================================================
    // Deposit merchant: 50000 minus one 5000 order fee, then a refused 60000
    // =========================================================================
    #[tokio::test]
    async fn test_order_fee_then_insufficient_debit() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Deposit,
                SubscriptionStatus::Active,
                None,
            ))
            .await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(50000)).await.unwrap();
        let order_fee = sample_plan().pricing_for(Currency::Idr).order_fee;

        let tx = fx
            .billing
            .ledger
            .debit_order_fee(IDR_MERCHANT, order_fee, "Order #A-1001")
            .await
            .unwrap();
        assert_eq!(tx.amount, dec!(-5000));
        assert_eq!(tx.balance_before, dec!(50000));
        assert_eq!(tx.balance_after, dec!(45000));

        let err = fx
            .billing
            .ledger
            .debit_order_fee(IDR_MERCHANT, dec!(60000), "Order #A-1002")
            .await
            .unwrap_err();
        match err {
            BillingError::InsufficientBalance { required, available } => {
                assert_eq!(required, dec!(60000));
                assert_eq!(available, dec!(45000));
            }
            other => panic!("expected InsufficientBalance, got {other:?}"),
        }

        let view = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
        assert_eq!(view.balance.balance, dec!(45000));
        assert_eq!(fx.store.ledger_of(IDR_MERCHANT).await.len(), 2);

        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(status.is_valid);
        assert_eq!(status.balance, Some(dec!(45000)));
        assert_conserved(&fx, IDR_MERCHANT).await;
    }

    // =========================================================================
    // Twenty concurrent 5000 debits against 50000: exactly ten succeed
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let fx = fixture().await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(50000)).await.unwrap();

        let barrier = Arc::new(Barrier::new(20));
        let mut handles = vec![];
        for i in 0..20 {
            let ledger = fx.billing.ledger.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .debit_order_fee(IDR_MERCHANT, dec!(5000), &format!("Order #{}", i))
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(BillingError::InsufficientBalance { .. }) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        assert_eq!(succeeded, 10);
        let view = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
        assert_eq!(view.balance.balance, Decimal::ZERO);
        assert_conserved(&fx, IDR_MERCHANT).await;
    }

    #[tokio::test]
    async fn test_non_positive_debits_are_rejected() {
        let fx = fixture().await;
        for amount in [dec!(0), dec!(-1)] {
            let err = fx
                .billing
                .ledger
                .debit_email_fee(IDR_MERCHANT, amount, "Receipt")
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)));
        }
        assert!(fx.store.ledger_of(IDR_MERCHANT).await.is_empty());
    }

    #[tokio::test]
    async fn test_usage_summary_counts_fees() {
        let fx = fixture().await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(50000)).await.unwrap();
        fx.billing
            .ledger
            .debit_order_fee(IDR_MERCHANT, dec!(5000), "Order #1")
            .await
            .unwrap();
        fx.billing
            .ledger
            .debit_email_fee(IDR_MERCHANT, dec!(250), "Receipt #1")
            .await
            .unwrap();

        let usage = fx.billing.ledger.usage_summary(IDR_MERCHANT).await.unwrap();
        assert_eq!(usage.today_total, dec!(5250));
        assert_eq!(usage.today_count, 2);
        assert_eq!(usage.last_30_days_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_merchant_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .billing
            .ledger
            .get_balance(orderdesk_shared::MerchantId(999))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}

#[cfg(test)]
mod transfer_tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;
    use tokio::sync::Barrier;

    use super::support::assert_conserved;
    use crate::error::BillingError;
    use crate::store::memory::FailPoint;
    use crate::testing::{fixture, IDR_BRANCH, IDR_MERCHANT};

    // =========================================================================
    // A failure between the two legs leaves both sides untouched
    // =========================================================================
    #[tokio::test]
    async fn test_failure_mid_transfer_rolls_back_both_sides() {
        let fx = fixture().await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(1000)).await.unwrap();

        for point in [FailPoint::AfterTransferDebit, FailPoint::HistoryInsert] {
            fx.store.fail_next(point);
            let err = fx
                .billing
                .transfers
                .transfer(IDR_MERCHANT, IDR_BRANCH, dec!(100), None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::Database(_)));

            let from = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
            let to = fx.billing.ledger.get_balance(IDR_BRANCH).await.unwrap();
            assert_eq!(from.balance.balance, dec!(1000));
            assert_eq!(to.balance.balance, dec!(0));
            assert_eq!(fx.store.ledger_of(IDR_MERCHANT).await.len(), 1);
            assert!(fx.store.ledger_of(IDR_BRANCH).await.is_empty());
            assert_eq!(fx.store.history_len(IDR_MERCHANT).await, 0);
        }

        // Nothing left armed: the next transfer goes through
        fx.billing
            .transfers
            .transfer(IDR_MERCHANT, IDR_BRANCH, dec!(100), None, None)
            .await
            .unwrap();
        let from = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
        let to = fx.billing.ledger.get_balance(IDR_BRANCH).await.unwrap();
        assert_eq!(from.balance.balance, dec!(900));
        assert_eq!(to.balance.balance, dec!(100));
    }

    // =========================================================================
    // amount > balance always fails and changes nothing
    // =========================================================================
    #[tokio::test]
    async fn test_overdraw_is_refused() {
        let fx = fixture().await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(99.99)).await.unwrap();
        fx.store.seed_balance(IDR_BRANCH, dec!(5)).await.unwrap();

        let err = fx
            .billing
            .transfers
            .transfer(IDR_MERCHANT, IDR_BRANCH, dec!(100), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InsufficientBalance { .. }));

        let from = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
        let to = fx.billing.ledger.get_balance(IDR_BRANCH).await.unwrap();
        assert_eq!(from.balance.balance, dec!(99.99));
        assert_eq!(to.balance.balance, dec!(5));
    }

    // =========================================================================
    // Opposite-direction transfers running together all complete
    // =========================================================================
    #[tokio::test]
    async fn test_bidirectional_transfers_complete() {
        let fx = fixture().await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(100000)).await.unwrap();
        fx.store.seed_balance(IDR_BRANCH, dec!(100000)).await.unwrap();

        let barrier = Arc::new(Barrier::new(20));
        let mut handles = vec![];
        for i in 0..20 {
            let transfers = fx.billing.transfers.clone();
            let barrier = barrier.clone();
            let (from, to) = if i % 2 == 0 {
                (IDR_MERCHANT, IDR_BRANCH)
            } else {
                (IDR_BRANCH, IDR_MERCHANT)
            };
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                transfers.transfer(from, to, dec!(1000), None, None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let a = fx.billing.ledger.get_balance(IDR_MERCHANT).await.unwrap();
        let b = fx.billing.ledger.get_balance(IDR_BRANCH).await.unwrap();
        assert_eq!(a.balance.balance, dec!(100000));
        assert_eq!(b.balance.balance, dec!(100000));
        assert_conserved(&fx, IDR_MERCHANT).await;
        assert_conserved(&fx, IDR_BRANCH).await;
    }
}

#[cfg(test)]
mod payment_request_tests {
    use std::sync::Arc;

    use orderdesk_shared::PaymentRequestStatus;
    use rust_decimal_macros::dec;
    use time::Duration;
    use tokio::sync::Barrier;

    use crate::error::BillingError;
    use crate::payment_requests::{CreatePaymentRequest, TransferConfirmation};
    use crate::testing::{fixture, IDR_MERCHANT};

    fn topup() -> CreatePaymentRequest {
        CreatePaymentRequest::DepositTopup {
            amount: dec!(100000),
        }
    }

    // =========================================================================
    // A second request while one is PENDING or CONFIRMED is a conflict
    // =========================================================================
    #[tokio::test]
    async fn test_single_in_flight_request() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let first = service.create(IDR_MERCHANT, topup()).await.unwrap();
        let err = service.create(IDR_MERCHANT, topup()).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        service
            .confirm(first.id, TransferConfirmation::default())
            .await
            .unwrap();
        let err = service
            .create(IDR_MERCHANT, CreatePaymentRequest::MonthlySubscription { months: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));

        service.cancel(first.id).await.unwrap();
        service.create(IDR_MERCHANT, topup()).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_creates_yield_one_request() {
        let fx = fixture().await;
        let barrier = Arc::new(Barrier::new(5));
        let mut handles = vec![];
        for _ in 0..5 {
            let service = fx.billing.payment_requests.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.create(IDR_MERCHANT, topup()).await
            }));
        }

        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(BillingError::Conflict(_)) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(created, 1);
    }

    // =========================================================================
    // Reading an overdue PENDING request twice: EXPIRED both times, no history
    // =========================================================================
    #[tokio::test]
    async fn test_expiry_is_idempotent() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;

        let request = service.create(IDR_MERCHANT, topup()).await.unwrap();
        fx.clock.advance(Duration::hours(25));

        let first = service.get(request.id).await.unwrap();
        let second = service.get(request.id).await.unwrap();
        assert_eq!(first.status, PaymentRequestStatus::Expired);
        assert_eq!(second.status, PaymentRequestStatus::Expired);
        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(fx.store.history_len(IDR_MERCHANT).await, 0);
        assert!(fx.store.ledger_of(IDR_MERCHANT).await.is_empty());

        let listed = service
            .list_for_merchant(IDR_MERCHANT, Default::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, PaymentRequestStatus::Expired);
    }

    #[tokio::test]
    async fn test_verify_twice_posts_once() {
        let fx = fixture().await;
        let service = &fx.billing.payment_requests;
        let staff = uuid::Uuid::from_u128(7);

        let request = service.create(IDR_MERCHANT, topup()).await.unwrap();
        service
            .confirm(request.id, TransferConfirmation::default())
            .await
            .unwrap();
        service.verify(request.id, staff).await.unwrap();

        let err = service.verify(request.id, staff).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
        assert_eq!(fx.store.ledger_of(IDR_MERCHANT).await.len(), 1);
    }
}

#[cfg(test)]
mod subscription_tests {
    use orderdesk_shared::{HistoryEventType, SubscriptionStatus, SubscriptionType};
    use rust_decimal_macros::dec;
    use time::Duration;

    use super::support::subscription;
    use crate::error::BillingError;
    use crate::evaluator::SuspensionReason;
    use crate::models::Page;
    use crate::payment_requests::{CreatePaymentRequest, TransferConfirmation};
    use crate::store::memory::FailPoint;
    use crate::store::SettlementStore;
    use crate::testing::{fixture, IDR_MERCHANT, T0};

    // =========================================================================
    // grace = 3 days: ended 2 days ago is in grace, 4 days ago is lapsed
    // =========================================================================
    #[tokio::test]
    async fn test_trial_grace_boundary() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Trial,
                SubscriptionStatus::Active,
                Some(T0 - Duration::days(2)),
            ))
            .await;

        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(status.is_valid);
        assert!(status.in_grace_period);
        assert_eq!(status.days_remaining, 0);

        fx.clock.advance(Duration::days(2));
        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(!status.is_valid);
        assert!(!status.in_grace_period);
        assert_eq!(
            status.pending_suspension_reason,
            Some(SuspensionReason::TrialExpired)
        );
        // No funds, so no auto-switch
        assert_eq!(status.subscription_type, SubscriptionType::Trial);
    }

    // =========================================================================
    // Lapsed trial with funds falls back to DEPOSIT on read, exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_auto_switch_on_read() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Trial,
                SubscriptionStatus::Active,
                Some(T0 - Duration::days(4)),
            ))
            .await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(10000)).await.unwrap();

        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(status.reconciled);
        assert_eq!(status.subscription_type, SubscriptionType::Deposit);
        assert!(status.is_valid);
        assert_eq!(status.trial_ends_at, None);

        fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        let history = fx
            .billing
            .history
            .list(IDR_MERCHANT, Page::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, HistoryEventType::AutoSwitch);
        assert_eq!(history[0].previous.subscription_type, SubscriptionType::Trial);
    }

    // =========================================================================
    // A failed auto-switch does not fail the read
    // =========================================================================
    #[tokio::test]
    async fn test_failed_reconcile_is_reported() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Monthly,
                SubscriptionStatus::Active,
                Some(T0 - Duration::days(10)),
            ))
            .await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(10000)).await.unwrap();

        fx.store.fail_next(FailPoint::HistoryInsert);
        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(!status.reconciled);
        assert_eq!(status.subscription_type, SubscriptionType::Monthly);

        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(status.reconciled);
        assert_eq!(status.subscription_type, SubscriptionType::Deposit);
        // The lapsed period end is kept for reference
        assert_eq!(status.current_period_end, Some(T0 - Duration::days(10)));
    }

    // =========================================================================
    // canSwitchTo* predicates and SWITCH_NOT_ALLOWED
    // =========================================================================
    #[tokio::test]
    async fn test_switch_eligibility() {
        let fx = fixture().await;
        let subs = &fx.billing.subscriptions;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Monthly,
                SubscriptionStatus::Active,
                Some(T0 + Duration::days(10)),
            ))
            .await;

        let status = subs.status(IDR_MERCHANT).await.unwrap();
        assert!(!status.can_switch_to_deposit);
        assert!(!status.can_switch_to_monthly);

        let err = subs
            .switch_type(IDR_MERCHANT, SubscriptionType::Monthly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SwitchNotAllowed(_)));
        assert_eq!(err.code(), "SWITCH_NOT_ALLOWED");

        let err = subs
            .switch_type(IDR_MERCHANT, SubscriptionType::Deposit, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SwitchNotAllowed(_)));

        fx.store.seed_balance(IDR_MERCHANT, dec!(1)).await.unwrap();
        let switched = subs
            .switch_type(IDR_MERCHANT, SubscriptionType::Deposit, None)
            .await
            .unwrap();
        assert_eq!(switched.subscription_type, SubscriptionType::Deposit);
        assert_eq!(switched.current_period_end, Some(T0 + Duration::days(10)));

        // The paid period is still running, so MONTHLY is selectable again
        let status = subs.status(IDR_MERCHANT).await.unwrap();
        assert!(status.can_switch_to_monthly);
        assert!(!status.can_switch_to_deposit);

        fx.clock.advance(Duration::days(11));
        let status = subs.status(IDR_MERCHANT).await.unwrap();
        assert!(!status.can_switch_to_monthly);
        let err = subs
            .switch_type(IDR_MERCHANT, SubscriptionType::Monthly, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SwitchNotAllowed(_)));

        let history = fx
            .billing
            .history
            .list(IDR_MERCHANT, Page::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, HistoryEventType::TypeSwitched);
    }

    // =========================================================================
    // Sweep suspends a depleted deposit; a verified top-up reactivates it
    // =========================================================================
    #[tokio::test]
    async fn test_suspension_and_reactivation() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Deposit,
                SubscriptionStatus::Active,
                None,
            ))
            .await;

        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(status.pending_suspension);

        let sweep = fx.billing.subscriptions.apply_pending_suspensions().await.unwrap();
        assert_eq!(sweep.suspended, vec![IDR_MERCHANT]);
        let again = fx.billing.subscriptions.apply_pending_suspensions().await.unwrap();
        assert!(again.suspended.is_empty());

        let stored = fx.store.subscription(IDR_MERCHANT).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Suspended);
        assert_eq!(stored.suspend_reason.as_deref(), Some("DEPOSIT_DEPLETED"));

        let requests = &fx.billing.payment_requests;
        let request = requests
            .create(
                IDR_MERCHANT,
                CreatePaymentRequest::DepositTopup {
                    amount: dec!(100000),
                },
            )
            .await
            .unwrap();
        requests
            .confirm(request.id, TransferConfirmation::default())
            .await
            .unwrap();
        let outcome = requests
            .verify(request.id, uuid::Uuid::from_u128(1))
            .await
            .unwrap();
        let sub = outcome.subscription.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.suspend_reason, None);

        let history = fx
            .billing
            .history
            .list(IDR_MERCHANT, Page::default())
            .await
            .unwrap();
        assert_eq!(history[0].event_type, HistoryEventType::Reactivated);
        assert_eq!(history[0].previous.status, SubscriptionStatus::Suspended);
        assert_eq!(history[0].new.status, SubscriptionStatus::Active);
        assert_eq!(history[0].metadata["flowType"], "PAYMENT_VERIFICATION");
        assert_eq!(history[0].metadata["flowId"], format!("payment-{}", request.id));
        assert_eq!(history[1].event_type, HistoryEventType::Suspended);

        let status = fx.billing.subscriptions.status(IDR_MERCHANT).await.unwrap();
        assert!(status.is_valid);
        assert_eq!(status.balance, Some(dec!(100000)));
    }

    #[tokio::test]
    async fn test_sweep_prefers_auto_switch_over_suspension() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Monthly,
                SubscriptionStatus::Active,
                Some(T0 - Duration::days(5)),
            ))
            .await;
        fx.store.seed_balance(IDR_MERCHANT, dec!(20000)).await.unwrap();

        let sweep = fx.billing.subscriptions.apply_pending_suspensions().await.unwrap();
        assert!(sweep.suspended.is_empty());

        let stored = fx.store.subscription(IDR_MERCHANT).await.unwrap().unwrap();
        assert_eq!(stored.subscription_type, SubscriptionType::Deposit);
        assert_eq!(stored.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_lapsed_trial_is_suspended_with_reason() {
        let fx = fixture().await;
        fx.store
            .put_subscription(subscription(
                IDR_MERCHANT,
                SubscriptionType::Trial,
                SubscriptionStatus::Active,
                Some(T0 - Duration::days(4)),
            ))
            .await;

        fx.billing.subscriptions.apply_pending_suspensions().await.unwrap();
        let history = fx
            .billing
            .history
            .list(IDR_MERCHANT, Page::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, HistoryEventType::Suspended);
        assert_eq!(history[0].reason.as_deref(), Some("TRIAL_EXPIRED"));
        assert_eq!(history[0].new.status, SubscriptionStatus::Suspended);
    }
}

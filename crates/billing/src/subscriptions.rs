//! Subscription management
//!
//! Reads run [`SubscriptionService::reconcile`] (the lazy auto-switch) in its
//! own transaction and then evaluate the committed state. Every write path,
//! explicit or automatic, goes through the store's account lock so a user
//! switch and a concurrent auto-switch cannot interleave.

use std::sync::Arc;

use orderdesk_shared::{
    HistoryEventType, MerchantId, SubscriptionStatus, SubscriptionType, TransactionType,
    TriggeredBy,
};
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::evaluator::{evaluate, switch_eligibility, SuspensionReason};
use crate::history::{self, HistoryEntryBuilder};
use crate::models::{BalanceTransaction, Merchant, Subscription};
use crate::pricing::{ActivePlan, PlanPricing, PricingResolver};
use crate::store::{AccountChanges, AccountSnapshot, LedgerPosting, SettlementStore};

/// Maximum months purchasable in one go
pub const MAX_MONTHS: i32 = 12;

/// Decides whether a merchant should be moved to another type automatically
pub trait AutoSwitchPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn target(
        &self,
        subscription: &Subscription,
        balance: Decimal,
        pricing: &PlanPricing,
        now: OffsetDateTime,
    ) -> Option<SubscriptionType>;
}

/// Falls back to DEPOSIT once a trial or monthly period and its grace period
/// are over, provided the merchant has funds to draw on
#[derive(Debug, Default, Clone, Copy)]
pub struct DepositFallbackPolicy;

impl AutoSwitchPolicy for DepositFallbackPolicy {
    fn name(&self) -> &'static str {
        "deposit_fallback"
    }

    fn target(
        &self,
        subscription: &Subscription,
        balance: Decimal,
        pricing: &PlanPricing,
        now: OffsetDateTime,
    ) -> Option<SubscriptionType> {
        match subscription.subscription_type {
            SubscriptionType::Trial | SubscriptionType::Monthly => {
                let end = subscription.governing_end()?;
                let grace_over = end + Duration::days(pricing.grace_period_days) <= now;
                (grace_over && balance > Decimal::ZERO).then_some(SubscriptionType::Deposit)
            }
            SubscriptionType::Deposit | SubscriptionType::None => None,
        }
    }
}

pub fn clamp_months(months: i32) -> i32 {
    months.clamp(1, MAX_MONTHS)
}

/// Outcome of pushing a monthly period end forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodExtension {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub days_delta: i64,
}

/// Extend from the current end if it is still running, otherwise from `now`.
/// `days_delta` is measured against the previous end (or `now` when there was none).
pub fn extend_period(
    previous_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
    days: i64,
) -> PeriodExtension {
    let base = match previous_end {
        Some(end) if end > now => end,
        _ => now,
    };
    let to = base + Duration::days(days);
    let from = previous_end.unwrap_or(now);
    PeriodExtension {
        from,
        to,
        days_delta: (to - from).whole_days(),
    }
}

/// Answer to "get my subscription"
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatusView {
    pub merchant_id: MerchantId,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub is_valid: bool,
    pub days_remaining: i64,
    pub in_grace_period: bool,
    pub pending_suspension: bool,
    pub pending_suspension_reason: Option<SuspensionReason>,
    /// Present for DEPOSIT merchants
    pub balance: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub suspend_reason: Option<String>,
    pub can_switch_to_deposit: bool,
    pub can_switch_to_monthly: bool,
    /// False when the lazy auto-switch failed; the state shown is what was
    /// committed before this read and may be switched on a later read
    pub reconciled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewalReceipt {
    pub subscription: Subscription,
    pub transaction: BalanceTransaction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuspensionSweep {
    pub suspended: Vec<MerchantId>,
    pub failed: Vec<MerchantId>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
    pricing: PricingResolver,
    policy: Arc<dyn AutoSwitchPolicy>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn AutoSwitchPolicy>,
    ) -> Self {
        Self {
            pricing: PricingResolver::new(store.clone()),
            store,
            clock,
            policy,
        }
    }

    /// Current access state, consumed before accepting new orders
    ///
    /// May write: the lazy auto-switch runs first. If it fails the read still
    /// succeeds with `reconciled = false`.
    pub async fn status(&self, merchant_id: MerchantId) -> BillingResult<SubscriptionStatusView> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let pricing = self.pricing.resolve(merchant.currency).await?;

        let reconciled = match self.reconcile_with(&merchant, &pricing).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    merchant_id = %merchant_id,
                    error = %e,
                    "Lazy auto-switch failed; evaluating committed state"
                );
                false
            }
        };

        let now = self.clock.now();
        let subscription = self
            .store
            .subscription(merchant_id)
            .await?
            .unwrap_or_else(|| Subscription::absent(merchant_id, now));
        let balance = self.store.ensure_balance(merchant_id).await?.balance;

        let evaluation = evaluate(&subscription, balance, &pricing, now);
        let eligibility = switch_eligibility(&subscription, balance, now);

        Ok(SubscriptionStatusView {
            merchant_id,
            subscription_type: subscription.subscription_type,
            status: subscription.status,
            is_valid: evaluation.is_valid,
            days_remaining: evaluation.days_remaining,
            in_grace_period: evaluation.in_grace_period,
            pending_suspension: evaluation.pending_suspension(),
            pending_suspension_reason: evaluation.pending_suspension_reason,
            balance: (subscription.subscription_type == SubscriptionType::Deposit)
                .then_some(balance),
            trial_ends_at: subscription.trial_ends_at,
            current_period_end: subscription.current_period_end,
            suspend_reason: subscription.suspend_reason,
            can_switch_to_deposit: eligibility.can_switch_to_deposit,
            can_switch_to_monthly: eligibility.can_switch_to_monthly,
            reconciled,
        })
    }

    /// Apply the auto-switch policy; returns whether a switch happened
    pub async fn reconcile(&self, merchant_id: MerchantId) -> BillingResult<bool> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let pricing = self.pricing.resolve(merchant.currency).await?;
        self.reconcile_with(&merchant, &pricing).await
    }

    async fn reconcile_with(&self, merchant: &Merchant, pricing: &PlanPricing) -> BillingResult<bool> {
        let now = self.clock.now();

        // Unlocked pre-check keeps plain reads free of write transactions
        let Some(subscription) = self.store.subscription(merchant.id).await? else {
            return Ok(false);
        };
        let balance = self.store.ensure_balance(merchant.id).await?.balance;
        if self.policy.target(&subscription, balance, pricing, now).is_none() {
            return Ok(false);
        }

        let policy = self.policy.clone();
        let pricing = pricing.clone();
        let commit = self
            .store
            .apply_account_change(
                merchant.id,
                None,
                Box::new(move |snapshot| {
                    let Some(current) = snapshot.subscription.clone() else {
                        return Ok(AccountChanges::none());
                    };
                    let balance = snapshot.balance.balance;
                    let Some(target) = policy.target(&current, balance, &pricing, now) else {
                        return Ok(AccountChanges::none());
                    };

                    let mut next = current.clone();
                    next.subscription_type = target;
                    next.status = SubscriptionStatus::Active;
                    next.suspend_reason = None;
                    next.trial_ends_at = None;
                    next.updated_at = now;

                    let entry = HistoryEntryBuilder::new(
                        current.merchant_id,
                        HistoryEventType::AutoSwitch,
                        current.snapshot(Some(balance)),
                        next.snapshot(Some(balance)),
                        now,
                    )
                    .reason(format!(
                        "{} ended; switched to {}",
                        current.subscription_type, target
                    ))
                    .meta("policy", policy.name())
                    .triggered_by(TriggeredBy::System, None)
                    .build();

                    Ok(AccountChanges {
                        subscription: Some(next),
                        history: Some(entry),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        let switched = commit.history.is_some();
        if switched {
            tracing::info!(
                merchant_id = %merchant.id,
                policy = self.policy.name(),
                "Auto-switched subscription type"
            );
        }
        Ok(switched)
    }

    /// Explicit switch from the settings screen
    pub async fn switch_type(
        &self,
        merchant_id: MerchantId,
        target: SubscriptionType,
        acting_user_id: Option<Uuid>,
    ) -> BillingResult<Subscription> {
        if !matches!(target, SubscriptionType::Deposit | SubscriptionType::Monthly) {
            return Err(BillingError::Validation(format!(
                "Cannot switch to {}; only DEPOSIT and MONTHLY are selectable",
                target
            )));
        }
        self.store.require_merchant(merchant_id).await?;
        let now = self.clock.now();

        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                None,
                Box::new(move |snapshot| switch_changes(snapshot, target, acting_user_id, now)),
            )
            .await?;

        let subscription = commit.subscription.ok_or_else(|| {
            BillingError::Internal("Switch committed without a subscription".to_string())
        })?;

        tracing::info!(
            merchant_id = %merchant_id,
            new_type = %target,
            "Switched subscription type"
        );
        Ok(subscription)
    }

    /// Create the trial subscription of a newly signed-up merchant
    pub async fn start_trial(&self, merchant_id: MerchantId) -> BillingResult<Subscription> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let pricing = self.pricing.resolve(merchant.currency).await?;
        let now = self.clock.now();
        let trial_days = pricing.trial_days;

        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                None,
                Box::new(move |snapshot| {
                    if let Some(existing) = &snapshot.subscription {
                        return Err(BillingError::Conflict(format!(
                            "Merchant {} already has a {} subscription",
                            existing.merchant_id, existing.subscription_type
                        )));
                    }
                    let previous = Subscription::absent(snapshot.merchant.id, now);
                    let mut trial = previous.clone();
                    trial.subscription_type = SubscriptionType::Trial;
                    trial.status = SubscriptionStatus::Active;
                    trial.trial_ends_at = Some(now + Duration::days(trial_days));

                    let entry = HistoryEntryBuilder::new(
                        trial.merchant_id,
                        HistoryEventType::TrialStarted,
                        previous.snapshot(None),
                        trial.snapshot(None),
                        now,
                    )
                    .meta("trialDays", trial_days)
                    .triggered_by(TriggeredBy::System, None)
                    .build();

                    Ok(AccountChanges {
                        subscription: Some(trial),
                        history: Some(entry),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        commit.subscription.ok_or_else(|| {
            BillingError::Internal("Trial start committed without a subscription".to_string())
        })
    }

    /// Buy monthly access with deposit funds
    pub async fn renew_monthly_from_balance(
        &self,
        merchant_id: MerchantId,
        months: i32,
        acting_user_id: Option<Uuid>,
    ) -> BillingResult<RenewalReceipt> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let pricing = self.pricing.resolve(merchant.currency).await?;
        let now = self.clock.now();
        let months = clamp_months(months);
        let cost = pricing.monthly_price * Decimal::from(months);
        let days = pricing.monthly_days * i64::from(months);

        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                None,
                Box::new(move |snapshot| {
                    let current = snapshot.subscription_or_absent(now);
                    let before = snapshot.balance.balance;
                    let extension = extend_period(current.current_period_end, now, days);

                    let mut next = current.clone();
                    next.subscription_type = SubscriptionType::Monthly;
                    next.status = SubscriptionStatus::Active;
                    next.suspend_reason = None;
                    next.trial_ends_at = None;
                    next.current_period_end = Some(extension.to);
                    next.updated_at = now;

                    let posting = LedgerPosting {
                        transaction_type: TransactionType::Subscription,
                        amount: -cost,
                        description: format!("Monthly plan renewal: {} months, paid from balance", months),
                        payment_request_id: None,
                        require_sufficient_funds: true,
                        marks_topup: false,
                        created_at: now,
                    };

                    let entry = HistoryEntryBuilder::new(
                        next.merchant_id,
                        HistoryEventType::SubscriptionRenewed,
                        current.snapshot(Some(before)),
                        next.snapshot(Some(before - cost)),
                        now,
                    )
                    .meta("months", months)
                    .meta("amount", cost.to_string())
                    .meta_time(history::PERIOD_FROM, extension.from)
                    .meta_time(history::PERIOD_TO, extension.to)
                    .meta(history::DAYS_DELTA, extension.days_delta)
                    .triggered_by(TriggeredBy::Merchant, acting_user_id)
                    .build();

                    Ok(AccountChanges {
                        subscription: Some(next),
                        posting: Some(posting),
                        history: Some(entry),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        let (Some(subscription), Some(transaction)) = (commit.subscription, commit.transaction)
        else {
            return Err(BillingError::Internal(
                "Renewal committed without subscription or ledger row".to_string(),
            ));
        };

        tracing::info!(
            merchant_id = %merchant_id,
            months,
            amount = %cost,
            "Renewed monthly plan from balance"
        );
        Ok(RenewalReceipt {
            subscription,
            transaction,
        })
    }

    /// Suspend every ACTIVE merchant whose access has lapsed
    ///
    /// The auto-switch runs first so a merchant with funds falls back to
    /// DEPOSIT instead of being suspended.
    pub async fn apply_pending_suspensions(&self) -> BillingResult<SuspensionSweep> {
        let plan = self
            .store
            .active_plan()
            .await?
            .ok_or_else(|| {
                tracing::error!("No active subscription plan configured");
                BillingError::Internal("No active subscription plan configured".to_string())
            })?;

        let mut sweep = SuspensionSweep::default();
        for subscription in self.store.active_subscriptions().await? {
            let merchant_id = subscription.merchant_id;
            match self.suspend_if_pending(merchant_id, &plan).await {
                Ok(true) => sweep.suspended.push(merchant_id),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(merchant_id = %merchant_id, error = %e, "Failed to apply suspension");
                    sweep.failed.push(merchant_id);
                }
            }
        }

        tracing::info!(
            suspended = sweep.suspended.len(),
            failed = sweep.failed.len(),
            "Suspension sweep complete"
        );
        Ok(sweep)
    }

    async fn suspend_if_pending(
        &self,
        merchant_id: MerchantId,
        plan: &ActivePlan,
    ) -> BillingResult<bool> {
        let merchant = self.store.require_merchant(merchant_id).await?;
        let pricing = plan.pricing_for(merchant.currency);
        self.reconcile_with(&merchant, &pricing).await?;

        let now = self.clock.now();
        let commit = self
            .store
            .apply_account_change(
                merchant_id,
                None,
                Box::new(move |snapshot| {
                    let Some(current) = snapshot.subscription.clone() else {
                        return Ok(AccountChanges::none());
                    };
                    let balance = snapshot.balance.balance;
                    let Some(reason) =
                        evaluate(&current, balance, &pricing, now).pending_suspension_reason
                    else {
                        return Ok(AccountChanges::none());
                    };

                    let mut next = current.clone();
                    next.status = SubscriptionStatus::Suspended;
                    next.suspend_reason = Some(reason.as_str().to_string());
                    next.updated_at = now;

                    let entry = HistoryEntryBuilder::new(
                        merchant_id,
                        HistoryEventType::Suspended,
                        current.snapshot(Some(balance)),
                        next.snapshot(Some(balance)),
                        now,
                    )
                    .reason(reason.as_str())
                    .triggered_by(TriggeredBy::System, None)
                    .build();

                    Ok(AccountChanges {
                        subscription: Some(next),
                        history: Some(entry),
                        ..AccountChanges::none()
                    })
                }),
            )
            .await?;

        Ok(commit.history.is_some())
    }
}

fn switch_changes(
    snapshot: &AccountSnapshot,
    target: SubscriptionType,
    acting_user_id: Option<Uuid>,
    now: OffsetDateTime,
) -> BillingResult<AccountChanges> {
    let current = snapshot.subscription_or_absent(now);
    let balance = snapshot.balance.balance;

    if current.subscription_type == target {
        return Err(BillingError::SwitchNotAllowed(format!(
            "Subscription is already {}",
            target
        )));
    }

    let eligibility = switch_eligibility(&current, balance, now);
    match target {
        SubscriptionType::Deposit if !eligibility.can_switch_to_deposit => {
            return Err(BillingError::SwitchNotAllowed(
                "Deposit balance is empty; top up before switching to DEPOSIT".to_string(),
            ));
        }
        SubscriptionType::Monthly if !eligibility.can_switch_to_monthly => {
            return Err(BillingError::SwitchNotAllowed(
                "No active monthly period; renew before switching to MONTHLY".to_string(),
            ));
        }
        _ => {}
    }

    let mut next = current.clone();
    next.subscription_type = target;
    next.status = SubscriptionStatus::Active;
    next.suspend_reason = None;
    next.trial_ends_at = None;
    next.updated_at = now;

    let entry = HistoryEntryBuilder::new(
        current.merchant_id,
        HistoryEventType::TypeSwitched,
        current.snapshot(Some(balance)),
        next.snapshot(Some(balance)),
        now,
    )
    .reason(format!("Switched from {} to {}", current.subscription_type, target))
    .triggered_by(TriggeredBy::Merchant, acting_user_id)
    .build();

    Ok(AccountChanges {
        subscription: Some(next),
        history: Some(entry),
        ..AccountChanges::none()
    })
}

//! Subscription state evaluation
//!
//! Pure functions over a subscription, its balance, pricing terms and an
//! instant. Nothing here reads the clock or touches storage.

use orderdesk_shared::{SubscriptionStatus, SubscriptionType};
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::models::Subscription;
use crate::pricing::PlanPricing;

const SECONDS_PER_DAY: i64 = 86_400;

/// Why access is about to lapse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SuspensionReason {
    #[serde(rename = "DEPOSIT_DEPLETED")]
    DepositDepleted,
    #[serde(rename = "MONTHLY_EXPIRED")]
    MonthlyExpired,
    #[serde(rename = "TRIAL_EXPIRED")]
    TrialExpired,
}

impl SuspensionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionReason::DepositDepleted => "DEPOSIT_DEPLETED",
            SuspensionReason::MonthlyExpired => "MONTHLY_EXPIRED",
            SuspensionReason::TrialExpired => "TRIAL_EXPIRED",
        }
    }

    fn for_type(subscription_type: SubscriptionType) -> Option<Self> {
        match subscription_type {
            SubscriptionType::Deposit => Some(SuspensionReason::DepositDepleted),
            SubscriptionType::Monthly => Some(SuspensionReason::MonthlyExpired),
            SubscriptionType::Trial => Some(SuspensionReason::TrialExpired),
            SubscriptionType::None => None,
        }
    }
}

impl std::fmt::Display for SuspensionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived access state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub is_valid: bool,
    /// Whole days until the trial/period end, rounded up, never negative.
    /// Always 0 for DEPOSIT.
    pub days_remaining: i64,
    pub in_grace_period: bool,
    pub pending_suspension_reason: Option<SuspensionReason>,
}

impl Evaluation {
    pub fn pending_suspension(&self) -> bool {
        self.pending_suspension_reason.is_some()
    }
}

/// Days from `now` until `end`, rounded up (negative once `end` has passed)
pub fn days_until(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (end - now).whole_seconds();
    seconds.div_euclid(SECONDS_PER_DAY) + i64::from(seconds.rem_euclid(SECONDS_PER_DAY) != 0)
}

pub fn evaluate(
    subscription: &Subscription,
    balance: Decimal,
    pricing: &PlanPricing,
    now: OffsetDateTime,
) -> Evaluation {
    let active = subscription.status == SubscriptionStatus::Active;

    let (is_valid, days_remaining, in_grace_period) = match subscription.subscription_type {
        SubscriptionType::Deposit => (active && balance > Decimal::ZERO, 0, false),
        SubscriptionType::Trial | SubscriptionType::Monthly => {
            match subscription.governing_end() {
                Some(end) => {
                    let days = days_until(end, now);
                    if days > 0 {
                        (active, days, false)
                    } else if active {
                        let grace_ends_at = end + Duration::days(pricing.grace_period_days);
                        let in_grace = grace_ends_at > now;
                        (in_grace, 0, in_grace)
                    } else {
                        (false, 0, false)
                    }
                }
                None => (false, 0, false),
            }
        }
        SubscriptionType::None => (false, 0, false),
    };

    let pending_suspension_reason = if active && !is_valid && !in_grace_period {
        SuspensionReason::for_type(subscription.subscription_type)
    } else {
        None
    };

    Evaluation {
        is_valid,
        days_remaining,
        in_grace_period,
        pending_suspension_reason,
    }
}

/// Which switches the settings screen may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchEligibility {
    pub can_switch_to_deposit: bool,
    pub can_switch_to_monthly: bool,
}

pub fn has_active_period(subscription: &Subscription, now: OffsetDateTime) -> bool {
    subscription
        .current_period_end
        .is_some_and(|end| end > now)
}

pub fn switch_eligibility(
    subscription: &Subscription,
    balance: Decimal,
    now: OffsetDateTime,
) -> SwitchEligibility {
    SwitchEligibility {
        can_switch_to_deposit: balance > Decimal::ZERO
            && subscription.subscription_type != SubscriptionType::Deposit,
        can_switch_to_monthly: has_active_period(subscription, now)
            && subscription.subscription_type != SubscriptionType::Monthly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_plan;
    use orderdesk_shared::{Currency, MerchantId};
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-10 12:00 UTC);

    fn pricing() -> PlanPricing {
        // grace_period_days = 3
        sample_plan().pricing_for(Currency::Idr)
    }

    fn subscription(
        subscription_type: SubscriptionType,
        status: SubscriptionStatus,
        end: Option<OffsetDateTime>,
    ) -> Subscription {
        let mut sub = Subscription::absent(MerchantId(1), NOW);
        sub.subscription_type = subscription_type;
        sub.status = status;
        match subscription_type {
            SubscriptionType::Trial => sub.trial_ends_at = end,
            SubscriptionType::Monthly => sub.current_period_end = end,
            _ => {}
        }
        sub
    }

    #[test]
    fn test_days_until_rounds_up() {
        assert_eq!(days_until(NOW + Duration::hours(1), NOW), 1);
        assert_eq!(days_until(NOW + Duration::hours(24), NOW), 1);
        assert_eq!(days_until(NOW + Duration::hours(25), NOW), 2);
        assert_eq!(days_until(NOW, NOW), 0);
        assert_eq!(days_until(NOW - Duration::hours(1), NOW), 0);
        assert_eq!(days_until(NOW - Duration::hours(25), NOW), -1);
    }

    #[test]
    fn test_deposit_validity_follows_balance() {
        let sub = subscription(SubscriptionType::Deposit, SubscriptionStatus::Active, None);

        let funded = evaluate(&sub, dec!(1), &pricing(), NOW);
        assert!(funded.is_valid);
        assert_eq!(funded.days_remaining, 0);
        assert!(!funded.pending_suspension());

        let empty = evaluate(&sub, dec!(0), &pricing(), NOW);
        assert!(!empty.is_valid);
        assert_eq!(
            empty.pending_suspension_reason,
            Some(SuspensionReason::DepositDepleted)
        );
    }

    #[test]
    fn test_suspended_deposit_is_invalid_without_pending_flag() {
        let sub = subscription(SubscriptionType::Deposit, SubscriptionStatus::Suspended, None);
        let eval = evaluate(&sub, dec!(100), &pricing(), NOW);
        assert!(!eval.is_valid);
        assert!(!eval.pending_suspension());
    }

    #[test]
    fn test_trial_running() {
        let sub = subscription(
            SubscriptionType::Trial,
            SubscriptionStatus::Active,
            Some(NOW + Duration::days(5) + Duration::hours(2)),
        );
        let eval = evaluate(&sub, dec!(0), &pricing(), NOW);
        assert!(eval.is_valid);
        assert_eq!(eval.days_remaining, 6);
        assert!(!eval.in_grace_period);
    }

    #[test]
    fn test_trial_inside_grace_period() {
        let sub = subscription(
            SubscriptionType::Trial,
            SubscriptionStatus::Active,
            Some(NOW - Duration::days(2)),
        );
        let eval = evaluate(&sub, dec!(0), &pricing(), NOW);
        assert!(eval.is_valid);
        assert!(eval.in_grace_period);
        assert_eq!(eval.days_remaining, 0);
        assert_eq!(eval.pending_suspension_reason, None);
    }

    #[test]
    fn test_trial_past_grace_period() {
        let sub = subscription(
            SubscriptionType::Trial,
            SubscriptionStatus::Active,
            Some(NOW - Duration::days(4)),
        );
        let eval = evaluate(&sub, dec!(0), &pricing(), NOW);
        assert!(!eval.is_valid);
        assert!(!eval.in_grace_period);
        assert_eq!(
            eval.pending_suspension_reason,
            Some(SuspensionReason::TrialExpired)
        );
        assert_eq!(eval.pending_suspension_reason.map(|r| r.as_str()), Some("TRIAL_EXPIRED"));
    }

    #[test]
    fn test_grace_boundary_is_exclusive() {
        let sub = subscription(
            SubscriptionType::Monthly,
            SubscriptionStatus::Active,
            Some(NOW - Duration::days(3)),
        );
        let eval = evaluate(&sub, dec!(0), &pricing(), NOW);
        assert!(!eval.is_valid);
        assert_eq!(
            eval.pending_suspension_reason,
            Some(SuspensionReason::MonthlyExpired)
        );
    }

    #[test]
    fn test_days_remaining_never_negative() {
        for days_ago in [0, 1, 2, 10, 400] {
            for sub_type in [SubscriptionType::Trial, SubscriptionType::Monthly] {
                for status in [SubscriptionStatus::Active, SubscriptionStatus::Suspended] {
                    let sub = subscription(sub_type, status, Some(NOW - Duration::days(days_ago)));
                    assert!(evaluate(&sub, dec!(0), &pricing(), NOW).days_remaining >= 0);
                }
            }
        }
    }

    #[test]
    fn test_no_subscription() {
        let sub = Subscription::absent(MerchantId(1), NOW);
        let eval = evaluate(&sub, dec!(100), &pricing(), NOW);
        assert!(!eval.is_valid);
        assert!(!eval.pending_suspension());
    }

    #[test]
    fn test_switch_eligibility() {
        let mut sub = subscription(
            SubscriptionType::Deposit,
            SubscriptionStatus::Active,
            None,
        );
        sub.current_period_end = Some(NOW + Duration::days(3));
        let e = switch_eligibility(&sub, dec!(100), NOW);
        assert!(!e.can_switch_to_deposit);
        assert!(e.can_switch_to_monthly);

        sub.current_period_end = Some(NOW);
        assert!(!switch_eligibility(&sub, dec!(100), NOW).can_switch_to_monthly);

        let monthly = subscription(
            SubscriptionType::Monthly,
            SubscriptionStatus::Active,
            Some(NOW + Duration::days(3)),
        );
        let e = switch_eligibility(&monthly, dec!(0), NOW);
        assert!(!e.can_switch_to_deposit);
        assert!(!e.can_switch_to_monthly);
        assert!(switch_eligibility(&monthly, dec!(0.01), NOW).can_switch_to_deposit);
    }
}

//! Plan pricing resolution
//!
//! The active plan row carries one column set per currency. The resolver
//! splits that row into two pricing profiles and hands back the one matching
//! the merchant's currency.

use std::sync::Arc;

use orderdesk_shared::Currency;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::store::SettlementStore;

/// Bank account merchants transfer to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BankTransferTarget {
    pub bank_name: String,
    pub account_name: String,
    pub account_number: String,
}

/// Currency-specific terms of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyProfile {
    pub deposit_minimum: Decimal,
    pub order_fee: Decimal,
    pub monthly_price: Decimal,
    pub bank: BankTransferTarget,
}

/// The single active plan row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivePlan {
    pub id: i64,
    pub name: String,
    pub grace_period_days: i64,
    pub monthly_days: i64,
    pub trial_days: i64,
    pub idr: CurrencyProfile,
    pub aud: CurrencyProfile,
}

impl ActivePlan {
    pub fn pricing_for(&self, currency: Currency) -> PlanPricing {
        let profile = match currency {
            Currency::Idr => &self.idr,
            Currency::Aud => &self.aud,
        };

        PlanPricing {
            plan_id: self.id,
            currency,
            deposit_minimum: profile.deposit_minimum,
            order_fee: profile.order_fee,
            monthly_price: profile.monthly_price,
            grace_period_days: self.grace_period_days,
            monthly_days: self.monthly_days,
            trial_days: self.trial_days,
            bank: profile.bank.clone(),
        }
    }
}

/// Pricing and terms for one merchant currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanPricing {
    pub plan_id: i64,
    pub currency: Currency,
    pub deposit_minimum: Decimal,
    pub order_fee: Decimal,
    pub monthly_price: Decimal,
    pub grace_period_days: i64,
    pub monthly_days: i64,
    pub trial_days: i64,
    pub bank: BankTransferTarget,
}

/// Resolves [`PlanPricing`] from the active plan
#[derive(Clone)]
pub struct PricingResolver {
    store: Arc<dyn SettlementStore>,
}

impl PricingResolver {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, currency: Currency) -> BillingResult<PlanPricing> {
        match self.store.active_plan().await? {
            Some(plan) => Ok(plan.pricing_for(currency)),
            None => {
                tracing::error!(currency = %currency, "No active subscription plan configured");
                Err(BillingError::PricingUnavailable(currency))
            }
        }
    }
}

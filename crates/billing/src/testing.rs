//! Shared fixtures for unit and scenario tests

use std::sync::Arc;

use orderdesk_shared::{Currency, MerchantId};
use rust_decimal_macros::dec;
use time::macros::datetime;
use time::OffsetDateTime;

use crate::clock::FixedClock;
use crate::models::Merchant;
use crate::pricing::{ActivePlan, BankTransferTarget, CurrencyProfile};
use crate::store::memory::MemoryStore;
use crate::BillingService;

pub const T0: OffsetDateTime = datetime!(2026-03-01 00:00 UTC);

pub const IDR_MERCHANT: MerchantId = MerchantId(1);
/// Branch of [`IDR_MERCHANT`]
pub const IDR_BRANCH: MerchantId = MerchantId(2);
pub const AUD_MERCHANT: MerchantId = MerchantId(3);
/// IDR merchant outside the [`IDR_MERCHANT`] group
pub const OTHER_IDR_MERCHANT: MerchantId = MerchantId(4);
/// AUD branch of [`IDR_MERCHANT`]
pub const AUD_BRANCH: MerchantId = MerchantId(5);

pub fn sample_plan() -> ActivePlan {
    ActivePlan {
        id: 1,
        name: "Standard".to_string(),
        grace_period_days: 3,
        monthly_days: 30,
        trial_days: 14,
        idr: CurrencyProfile {
            deposit_minimum: dec!(100000),
            order_fee: dec!(5000),
            monthly_price: dec!(100000),
            bank: BankTransferTarget {
                bank_name: "BCA".to_string(),
                account_name: "PT OrderDesk Indonesia".to_string(),
                account_number: "8830123456".to_string(),
            },
        },
        aud: CurrencyProfile {
            deposit_minimum: dec!(20.00),
            order_fee: dec!(0.50),
            monthly_price: dec!(49.00),
            bank: BankTransferTarget {
                bank_name: "Commonwealth Bank".to_string(),
                account_name: "OrderDesk Pty Ltd".to_string(),
                account_number: "062-000 12345678".to_string(),
            },
        },
    }
}

pub fn merchant(id: MerchantId, currency: Currency, parent: Option<MerchantId>) -> Merchant {
    let name = match id.0 {
        1 => "Warung Utama",
        2 => "Jakarta Branch",
        3 => "Sydney Kitchen",
        4 => "Toko Sebelah",
        5 => "Melbourne Branch",
        _ => "Merchant",
    };
    Merchant {
        id,
        name: name.to_string(),
        currency,
        parent_merchant_id: parent,
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub billing: BillingService,
}

/// Five merchants, the sample plan, and a clock frozen at [`T0`]
pub async fn fixture() -> Fixture {
    let clock = Arc::new(FixedClock::new(T0));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    store.set_active_plan(Some(sample_plan())).await;
    for m in [
        merchant(IDR_MERCHANT, Currency::Idr, None),
        merchant(IDR_BRANCH, Currency::Idr, Some(IDR_MERCHANT)),
        merchant(AUD_MERCHANT, Currency::Aud, None),
        merchant(OTHER_IDR_MERCHANT, Currency::Idr, None),
        merchant(AUD_BRANCH, Currency::Aud, Some(IDR_MERCHANT)),
    ] {
        store.add_merchant(m).await;
    }

    let billing = BillingService::new(store.clone(), clock.clone());

    Fixture {
        store,
        clock,
        billing,
    }
}

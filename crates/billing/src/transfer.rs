//! Balance transfers between branches of one ownership group

use std::sync::Arc;

use orderdesk_shared::{HistoryEventType, MerchantId, TransactionType, TriggeredBy};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::history::{self, HistoryEntryBuilder};
use crate::models::{Balance, Merchant, Subscription};
use crate::store::{LedgerPosting, SettlementStore, TransferCommit, TransferLegs, TransferSnapshot};

#[derive(Clone)]
pub struct TransferService {
    store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
}

impl TransferService {
    pub fn new(store: Arc<dyn SettlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Move `amount` from one merchant's balance to another's
    ///
    /// Both balance rows are locked in ascending merchant order; either both
    /// legs are posted or neither is.
    pub async fn transfer(
        &self,
        from: MerchantId,
        to: MerchantId,
        amount: Decimal,
        note: Option<&str>,
        acting_user_id: Option<Uuid>,
    ) -> BillingResult<TransferCommit> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(
                "Transfer amount must be positive".to_string(),
            ));
        }
        if amount.normalize().scale() > 2 {
            return Err(BillingError::Validation(format!(
                "Amount {} has more than two decimal places",
                amount
            )));
        }
        if from == to {
            return Err(BillingError::Validation(
                "Cannot transfer to the same merchant".to_string(),
            ));
        }

        let now = self.clock.now();
        let note = note.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string);

        let result = self
            .store
            .apply_transfer(
                from,
                to,
                Box::new(move |snapshot| transfer_legs(snapshot, amount, note, acting_user_id, now)),
            )
            .await;

        match &result {
            Ok(commit) => tracing::info!(
                from_merchant_id = %from,
                to_merchant_id = %to,
                amount = %amount,
                from_balance = %commit.from_balance.balance,
                to_balance = %commit.to_balance.balance,
                "Transferred balance"
            ),
            Err(e) => tracing::warn!(
                from_merchant_id = %from,
                to_merchant_id = %to,
                amount = %amount,
                error = %e,
                "Balance transfer refused"
            ),
        }
        result
    }
}

fn transfer_legs(
    snapshot: &TransferSnapshot,
    amount: Decimal,
    note: Option<String>,
    acting_user_id: Option<Uuid>,
    now: OffsetDateTime,
) -> BillingResult<TransferLegs> {
    let from = &snapshot.from_merchant;
    let to = &snapshot.to_merchant;

    if !from.shares_group_with(to) {
        return Err(BillingError::Validation(format!(
            "Merchants {} and {} do not belong to the same group",
            from.id, to.id
        )));
    }
    if from.currency != to.currency {
        return Err(BillingError::Validation(format!(
            "Currency mismatch: {} uses {}, {} uses {}",
            from.id, from.currency, to.id, to.currency
        )));
    }

    let available = snapshot.from_balance.balance;
    if available < amount {
        return Err(BillingError::InsufficientBalance {
            required: amount,
            available,
        });
    }

    let suffix = note.as_deref().map(|n| format!(": {}", n)).unwrap_or_default();
    let flow_id = format!("transfer-{}-{}-{}", from.id, to.id, now.unix_timestamp());

    let debit = LedgerPosting {
        transaction_type: TransactionType::Adjustment,
        amount: -amount,
        description: format!("Transfer to {} (#{}){}", to.name, to.id, suffix),
        payment_request_id: None,
        require_sufficient_funds: true,
        marks_topup: false,
        created_at: now,
    };
    let credit = LedgerPosting {
        transaction_type: TransactionType::Adjustment,
        amount,
        description: format!("Transfer from {} (#{}){}", from.name, from.id, suffix),
        payment_request_id: None,
        require_sufficient_funds: false,
        marks_topup: false,
        created_at: now,
    };

    let side = |merchant: &Merchant,
                counterparty: &Merchant,
                balance: &Balance,
                subscription: &Option<Subscription>,
                delta: Decimal,
                direction: &str| {
        let current = subscription
            .clone()
            .unwrap_or_else(|| Subscription::absent(merchant.id, now));
        HistoryEntryBuilder::new(
            merchant.id,
            HistoryEventType::BalanceTransfer,
            current.snapshot(Some(balance.balance)),
            current.snapshot(Some(balance.balance + delta)),
            now,
        )
        .reason(format!("Balance transfer {} merchant {}", direction, counterparty.id))
        .meta(history::FLOW_ID, flow_id.clone())
        .meta("direction", if delta.is_sign_negative() { "OUT" } else { "IN" })
        .meta("counterpartyMerchantId", counterparty.id.0)
        .meta("amount", amount.to_string())
        .meta("note", note.clone())
        .triggered_by(TriggeredBy::Merchant, acting_user_id)
        .build()
    };

    Ok(TransferLegs {
        debit_history: side(
            from,
            to,
            &snapshot.from_balance,
            &snapshot.from_subscription,
            -amount,
            "to",
        ),
        credit_history: side(
            to,
            from,
            &snapshot.to_balance,
            &snapshot.to_subscription,
            amount,
            "from",
        ),
        debit,
        credit,
    })
}

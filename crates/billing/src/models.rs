//! Persisted records of the settlement engine

use orderdesk_shared::{
    Currency, HistoryEventType, MerchantId, PaymentRequestId, PaymentRequestStatus,
    PaymentRequestType, SubscriptionStatus, SubscriptionType, TransactionType, TriggeredBy,
};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::pricing::BankTransferTarget;

/// Free-form audit metadata attached to a history entry
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Tenant identity as seen by the settlement engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub name: String,
    pub currency: Currency,
    pub parent_merchant_id: Option<MerchantId>,
}

impl Merchant {
    /// Root of the ownership group this merchant belongs to
    pub fn group_root(&self) -> MerchantId {
        self.parent_merchant_id.unwrap_or(self.id)
    }

    /// Siblings under one parent, or a parent and one of its branches
    pub fn shares_group_with(&self, other: &Merchant) -> bool {
        self.group_root() == other.group_root()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub merchant_id: MerchantId,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Kept after switching away from MONTHLY so an unexpired period can be resumed
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub suspend_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Stand-in for a merchant without a subscription row
    pub fn absent(merchant_id: MerchantId, now: OffsetDateTime) -> Self {
        Self {
            merchant_id,
            subscription_type: SubscriptionType::None,
            status: SubscriptionStatus::Suspended,
            trial_ends_at: None,
            current_period_end: None,
            suspend_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// End date that governs validity for the current type
    pub fn governing_end(&self) -> Option<OffsetDateTime> {
        match self.subscription_type {
            SubscriptionType::Trial => self.trial_ends_at,
            SubscriptionType::Monthly => self.current_period_end,
            SubscriptionType::Deposit | SubscriptionType::None => None,
        }
    }

    pub fn snapshot(&self, balance: Option<Decimal>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscription_type: self.subscription_type,
            status: self.status,
            balance,
            period_end: self.governing_end(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub id: i64,
    pub merchant_id: MerchantId,
    pub balance: Decimal,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_topup_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Immutable ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceTransaction {
    pub id: i64,
    pub balance_id: i64,
    pub transaction_type: TransactionType,
    /// Negative for debits
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub payment_request_id: Option<PaymentRequestId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRequest {
    pub id: PaymentRequestId,
    pub merchant_id: MerchantId,
    pub request_type: PaymentRequestType,
    pub status: PaymentRequestStatus,
    pub amount: Decimal,
    pub months_requested: Option<i32>,
    pub currency: Currency,
    /// Transfer target captured at creation time
    pub bank: BankTransferTarget,
    pub transfer_notes: Option<String>,
    pub transfer_proof_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub confirmed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub verified_at: Option<OffsetDateTime>,
    pub verified_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rejected_at: Option<OffsetDateTime>,
    pub rejection_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PaymentRequest {
    /// PENDING past its deadline; such a row is flipped to EXPIRED on the next read
    pub fn is_overdue(&self, now: OffsetDateTime) -> bool {
        self.status == PaymentRequestStatus::Pending && self.expires_at <= now
    }
}

/// Payment request about to be inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaymentRequest {
    pub merchant_id: MerchantId,
    pub request_type: PaymentRequestType,
    pub amount: Decimal,
    pub months_requested: Option<i32>,
    pub currency: Currency,
    pub bank: BankTransferTarget,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Subscription state captured on either side of a history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    pub balance: Option<Decimal>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
}

/// History entry about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryEntry {
    pub merchant_id: MerchantId,
    pub event_type: HistoryEventType,
    pub previous: SubscriptionSnapshot,
    pub new: SubscriptionSnapshot,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub triggered_by: TriggeredBy,
    pub triggered_by_user_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionHistoryEntry {
    pub id: i64,
    pub merchant_id: MerchantId,
    pub event_type: HistoryEventType,
    pub previous: SubscriptionSnapshot,
    pub new: SubscriptionSnapshot,
    pub reason: Option<String>,
    pub metadata: Metadata,
    pub triggered_by: TriggeredBy,
    pub triggered_by_user_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl NewHistoryEntry {
    pub fn into_entry(self, id: i64) -> SubscriptionHistoryEntry {
        SubscriptionHistoryEntry {
            id,
            merchant_id: self.merchant_id,
            event_type: self.event_type,
            previous: self.previous,
            new: self.new,
            reason: self.reason,
            metadata: self.metadata,
            triggered_by: self.triggered_by,
            triggered_by_user_id: self.triggered_by_user_id,
            created_at: self.created_at,
        }
    }
}

/// Offset pagination shared by every list operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset: offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT, 0)
    }
}

//! Domain enums and identifiers
//!
//! Every enum is persisted as its SCREAMING_SNAKE_CASE name in a TEXT column,
//! so `as_str` and `FromStr` must stay in sync with the migrations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Surrogate key of a merchant (tenant)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct MerchantId(pub i64);

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surrogate key of a payment request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct PaymentRequestId(pub i64);

impl fmt::Display for PaymentRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returned when a stored or user-supplied string names no known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// Merchant currency; selects which pricing profile applies
    Currency, "currency" {
        Idr => "IDR",
        Aud => "AUD",
    }
}

text_enum! {
    /// How a merchant pays for the service
    SubscriptionType, "subscription type" {
        /// No subscription row exists yet
        None => "NONE",
        Trial => "TRIAL",
        Monthly => "MONTHLY",
        /// Prepaid balance, debited per order
        Deposit => "DEPOSIT",
    }
}

text_enum! {
    SubscriptionStatus, "subscription status" {
        Active => "ACTIVE",
        Suspended => "SUSPENDED",
    }
}

text_enum! {
    PaymentRequestType, "payment request type" {
        DepositTopup => "DEPOSIT_TOPUP",
        MonthlySubscription => "MONTHLY_SUBSCRIPTION",
    }
}

text_enum! {
    PaymentRequestStatus, "payment request status" {
        Pending => "PENDING",
        Confirmed => "CONFIRMED",
        Verified => "VERIFIED",
        Rejected => "REJECTED",
        Cancelled => "CANCELLED",
        Expired => "EXPIRED",
    }
}

impl PaymentRequestStatus {
    /// PENDING and CONFIRMED requests block a merchant from opening another one
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentRequestStatus::Pending | PaymentRequestStatus::Confirmed)
    }
}

text_enum! {
    /// Kind of a balance ledger row
    TransactionType, "transaction type" {
        Topup => "TOPUP",
        OrderFee => "ORDER_FEE",
        CompletedOrderEmailFee => "COMPLETED_ORDER_EMAIL_FEE",
        Adjustment => "ADJUSTMENT",
        Subscription => "SUBSCRIPTION",
    }
}

impl TransactionType {
    /// Rows counted as usage in the usage summary
    pub fn is_usage_fee(&self) -> bool {
        matches!(
            self,
            TransactionType::OrderFee | TransactionType::CompletedOrderEmailFee
        )
    }
}

text_enum! {
    /// Event recorded in the subscription history
    HistoryEventType, "history event type" {
        TrialStarted => "TRIAL_STARTED",
        TypeSwitched => "TYPE_SWITCHED",
        AutoSwitch => "AUTO_SWITCH",
        PaymentVerified => "PAYMENT_VERIFIED",
        SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
        Suspended => "SUSPENDED",
        Reactivated => "REACTIVATED",
        BalanceTransfer => "BALANCE_TRANSFER",
    }
}

impl HistoryEventType {
    /// Flow type used when an entry's metadata carries none
    pub fn default_flow_type(&self) -> &'static str {
        match self {
            HistoryEventType::TrialStarted => "TRIAL",
            HistoryEventType::TypeSwitched => "TYPE_SWITCH",
            HistoryEventType::AutoSwitch => "AUTO_SWITCH",
            HistoryEventType::PaymentVerified => "PAYMENT_VERIFICATION",
            HistoryEventType::SubscriptionRenewed => "BALANCE_RENEWAL",
            HistoryEventType::Suspended | HistoryEventType::Reactivated => "STATUS_CHANGE",
            HistoryEventType::BalanceTransfer => "BALANCE_TRANSFER",
        }
    }
}

text_enum! {
    /// Who caused a history entry
    TriggeredBy, "trigger" {
        Merchant => "MERCHANT",
        Staff => "STAFF",
        System => "SYSTEM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_text() {
        for t in TransactionType::ALL {
            assert_eq!(t.as_str().parse::<TransactionType>().unwrap(), *t);
        }
        for s in PaymentRequestStatus::ALL {
            assert_eq!(s.to_string().parse::<PaymentRequestStatus>().unwrap(), *s);
        }
    }

    #[test]
    fn test_unknown_variant_is_rejected() {
        let err = "WEEKLY".parse::<SubscriptionType>().unwrap_err();
        assert_eq!(err.kind, "subscription type");
        assert_eq!(err.to_string(), "unknown subscription type 'WEEKLY'");
    }

    #[test]
    fn test_open_statuses() {
        let open: Vec<_> = PaymentRequestStatus::ALL
            .iter()
            .filter(|s| s.is_open())
            .collect();
        assert_eq!(
            open,
            vec![&PaymentRequestStatus::Pending, &PaymentRequestStatus::Confirmed]
        );
    }
}

//! Subscription history
//!
//! Entries are appended inside the same transaction as the state change they
//! describe, so a failed append fails the change. Metadata is normalized when
//! an entry is built and again when it is read, which keeps legacy rows and
//! new rows in one shape for reporting.

use std::sync::Arc;

use orderdesk_shared::{HistoryEventType, MerchantId, TriggeredBy};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Metadata, NewHistoryEntry, Page, SubscriptionHistoryEntry, SubscriptionSnapshot};
use crate::store::SettlementStore;

pub const FLOW_ID: &str = "flowId";
pub const FLOW_TYPE: &str = "flowType";
pub const PERIOD_FROM: &str = "periodFrom";
pub const PERIOD_TO: &str = "periodTo";
pub const DAYS_DELTA: &str = "daysDelta";
pub const REQUEST_ID: &str = "requestId";
pub const VOUCHER_CODE: &str = "voucherCode";
pub const ORDER_ID: &str = "orderId";

/// Fill in derivable metadata keys
///
/// - `flowType` defaults to the event type's flow
/// - `flowId` is derived from `requestId`, `voucherCode` or `orderId` (first
///   present wins), else from the entry id when known
/// - a missing `periodFrom`/`periodTo` is derived from the other one and `daysDelta`
pub fn normalize_metadata(
    event_type: HistoryEventType,
    entry_id: Option<i64>,
    raw: &Metadata,
) -> Metadata {
    let mut metadata = raw.clone();

    if !has_value(&metadata, FLOW_TYPE) {
        metadata.insert(
            FLOW_TYPE.to_string(),
            Value::String(event_type.default_flow_type().to_string()),
        );
    }

    if !has_value(&metadata, FLOW_ID) {
        let derived = [
            (REQUEST_ID, "payment"),
            (VOUCHER_CODE, "voucher"),
            (ORDER_ID, "order"),
        ]
        .iter()
        .find_map(|(key, prefix)| scalar_text(&metadata, key).map(|v| format!("{}-{}", prefix, v)))
        .or_else(|| entry_id.map(|id| format!("history-{}", id)));

        if let Some(flow_id) = derived {
            metadata.insert(FLOW_ID.to_string(), Value::String(flow_id));
        }
    }

    let days_delta = metadata.get(DAYS_DELTA).and_then(Value::as_i64);
    let period_from = timestamp(&metadata, PERIOD_FROM);
    let period_to = timestamp(&metadata, PERIOD_TO);

    if let Some(days) = days_delta {
        match (period_from, period_to) {
            (Some(from), None) => {
                if let Some(to) = format_timestamp(from + Duration::days(days)) {
                    metadata.insert(PERIOD_TO.to_string(), Value::String(to));
                }
            }
            (None, Some(to)) => {
                if let Some(from) = format_timestamp(to - Duration::days(days)) {
                    metadata.insert(PERIOD_FROM.to_string(), Value::String(from));
                }
            }
            _ => {}
        }
    }

    metadata
}

fn has_value(metadata: &Metadata, key: &str) -> bool {
    match metadata.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn scalar_text(metadata: &Metadata, key: &str) -> Option<String> {
    match metadata.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(metadata: &Metadata, key: &str) -> Option<OffsetDateTime> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

pub fn format_timestamp(at: OffsetDateTime) -> Option<String> {
    at.format(&Rfc3339).ok()
}

/// Builder for [`NewHistoryEntry`]
pub struct HistoryEntryBuilder {
    entry: NewHistoryEntry,
}

impl HistoryEntryBuilder {
    pub fn new(
        merchant_id: MerchantId,
        event_type: HistoryEventType,
        previous: SubscriptionSnapshot,
        new: SubscriptionSnapshot,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            entry: NewHistoryEntry {
                merchant_id,
                event_type,
                previous,
                new,
                reason: None,
                metadata: Metadata::new(),
                triggered_by: TriggeredBy::System,
                triggered_by_user_id: None,
                created_at: at,
            },
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.entry.reason = Some(reason.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.entry.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Attach a timestamp in RFC 3339 form; skipped if it cannot be formatted
    pub fn meta_time(self, key: &str, at: OffsetDateTime) -> Self {
        match format_timestamp(at) {
            Some(text) => self.meta(key, text),
            None => self,
        }
    }

    pub fn triggered_by(mut self, by: TriggeredBy, user_id: Option<Uuid>) -> Self {
        self.entry.triggered_by = by;
        self.entry.triggered_by_user_id = user_id;
        self
    }

    /// Normalize metadata and produce the entry to append
    pub fn build(mut self) -> NewHistoryEntry {
        self.entry.metadata =
            normalize_metadata(self.entry.event_type, None, &self.entry.metadata);
        self.entry
    }
}

/// Read side of the history, used by reporting and support tooling
#[derive(Clone)]
pub struct HistoryService {
    store: Arc<dyn SettlementStore>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self { store }
    }

    pub async fn list(
        &self,
        merchant_id: MerchantId,
        page: Page,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        if self.store.merchant(merchant_id).await?.is_none() {
            return Err(BillingError::NotFound(format!(
                "Merchant {} not found",
                merchant_id
            )));
        }

        let mut entries = self.store.history(merchant_id, page).await?;
        for entry in &mut entries {
            entry.metadata = normalize_metadata(entry.event_type, Some(entry.id), &entry.metadata);
        }
        Ok(entries)
    }
}

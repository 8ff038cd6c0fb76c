//! Payment gateway event payloads
//!
//! Only the fields the reconciler reads are modelled; everything else in the
//! gateway's JSON is ignored so new fields never break parsing.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Event envelope: `{ id, type, created, data: { object } }`
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Event types the reconciler acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    CheckoutAsyncPaymentSucceeded,
    CheckoutExpired,
    CheckoutAsyncPaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted,
            "checkout.session.async_payment_succeeded" => Self::CheckoutAsyncPaymentSucceeded,
            "checkout.session.expired" => Self::CheckoutExpired,
            "checkout.session.async_payment_failed" => Self::CheckoutAsyncPaymentFailed,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            other => Self::Other(other.to_string()),
        }
    }
}

impl GatewayEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// When the gateway produced the event
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn checkout_session(&self) -> BillingResult<CheckoutSessionObject> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::InvalidInput(format!("Expected checkout session object: {}", e))
        })
    }

    pub fn subscription(&self) -> BillingResult<SubscriptionObject> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::InvalidInput(format!("Expected subscription object: {}", e)))
    }
}

/// A reference that may arrive as a bare id or as an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Object { id: String },
}

impl ObjectRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object { id } => id,
        }
    }
}

/// `metadata.checkout_type` values set when a session is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutType {
    Subscription,
    MediaPurchase,
    UploadFee,
    UploadCredits,
}

impl CheckoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::MediaPurchase => "media_purchase",
            Self::UploadFee => "upload_fee",
            Self::UploadCredits => "upload_credits",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "subscription" => Some(Self::Subscription),
            "media_purchase" => Some(Self::MediaPurchase),
            "upload_fee" => Some(Self::UploadFee),
            "upload_credits" => Some(Self::UploadCredits),
            _ => None,
        }
    }
}

/// Metadata keys shared by checkout creation and the reconciler
pub mod metadata_keys {
    pub const CHECKOUT_TYPE: &str = "checkout_type";
    pub const USER_ID: &str = "user_id";
    pub const TIER: &str = "tier";
    pub const PURCHASE_ID: &str = "purchase_id";
    pub const PENDING_UPLOAD_ID: &str = "pending_upload_id";
    pub const CREDITS: &str = "credits";
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    #[serde(default)]
    pub subscription: Option<ObjectRef>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    /// `paid`, `unpaid` or `no_payment_required`
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn checkout_type(&self) -> Option<CheckoutType> {
        match self.metadata.get(metadata_keys::CHECKOUT_TYPE) {
            Some(value) => CheckoutType::parse(value),
            // Sessions created outside this service still carry a subscription
            None if self.subscription.is_some() => Some(CheckoutType::Subscription),
            None => None,
        }
    }

    /// Async payment methods complete the session before the money arrives
    pub fn is_awaiting_payment(&self) -> bool {
        self.payment_status.as_deref() == Some("unpaid")
    }

    pub fn metadata_uuid(&self, key: &str) -> Option<Uuid> {
        self.metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
    }

    pub fn customer_ref(&self) -> Option<String> {
        self.customer.as_ref().map(|c| c.id().to_string())
    }

    pub fn subscription_ref(&self) -> Option<String> {
        self.subscription.as_ref().map(|s| s.id().to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ObjectRef>,
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<ObjectRef>,
}

/// How a subscription status maps onto membership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// `active`, `trialing`
    Entitled,
    /// `canceled`, `unpaid`, `incomplete_expired`
    Ended,
    /// `past_due`: keep the tier while the gateway retries payment
    PastDue,
    /// `incomplete`, `paused` and anything unknown
    Pending,
}

impl SubscriptionObject {
    pub fn state(&self) -> SubscriptionState {
        match self.status.as_str() {
            "active" | "trialing" => SubscriptionState::Entitled,
            "canceled" | "unpaid" | "incomplete_expired" => SubscriptionState::Ended,
            "past_due" => SubscriptionState::PastDue,
            _ => SubscriptionState::Pending,
        }
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    pub fn customer_ref(&self) -> Option<String> {
        self.customer.as_ref().map(|c| c.id().to_string())
    }

    pub fn metadata_user_id(&self) -> Option<Uuid> {
        self.metadata
            .get(metadata_keys::USER_ID)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    pub fn price_ids(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .flat_map(|items| items.data.iter())
            .filter_map(|item| item.price.as_ref().map(ObjectRef::id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_checkout_event() {
        let raw = json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": { "id": "sub_1", "object": "subscription" },
                "payment_status": "paid",
                "metadata": { "checkout_type": "subscription", "tier": "basic" },
                "unrelated": [1, 2, 3]
            }}
        });
        let event: GatewayEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.kind(), EventKind::CheckoutCompleted);
        assert_eq!(event.created_at().unix_timestamp(), 1_700_000_000);

        let session = event.checkout_session().unwrap();
        assert_eq!(session.checkout_type(), Some(CheckoutType::Subscription));
        assert_eq!(session.customer_ref().as_deref(), Some("cus_1"));
        assert_eq!(session.subscription_ref().as_deref(), Some("sub_1"));
        assert!(!session.is_awaiting_payment());
    }

    #[test]
    fn test_unknown_checkout_type() {
        let session: CheckoutSessionObject = serde_json::from_value(json!({
            "id": "cs_2",
            "metadata": { "checkout_type": "gift_card" }
        }))
        .unwrap();
        assert_eq!(session.checkout_type(), None);
    }

    #[test]
    fn test_subscription_states_and_prices() {
        let sub: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "past_due",
            "current_period_end": 1_700_086_400,
            "items": { "data": [ { "price": { "id": "price_basic" } } ] }
        }))
        .unwrap();
        assert_eq!(sub.state(), SubscriptionState::PastDue);
        assert_eq!(sub.price_ids().collect::<Vec<_>>(), vec!["price_basic"]);
        assert_eq!(sub.period_end().map(|t| t.unix_timestamp()), Some(1_700_086_400));

        for (status, state) in [
            ("active", SubscriptionState::Entitled),
            ("trialing", SubscriptionState::Entitled),
            ("canceled", SubscriptionState::Ended),
            ("incomplete_expired", SubscriptionState::Ended),
            ("incomplete", SubscriptionState::Pending),
        ] {
            let sub = SubscriptionObject {
                status: status.into(),
                ..sub.clone()
            };
            assert_eq!(sub.state(), state, "status {}", status);
        }
    }

    #[test]
    fn test_unknown_event_type() {
        assert_eq!(
            EventKind::parse("invoice.paid"),
            EventKind::Other("invoice.paid".into())
        );
    }
}

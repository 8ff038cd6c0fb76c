//! Payment gateway client
//!
//! The reconciler never calls the gateway; it only consumes its webhooks.
//! Checkout initiation and manual membership actions go through the
//! [`PaymentGateway`] trait so they can be exercised without network access.

use std::collections::HashMap;

use async_trait::async_trait;
use mediamart_shared::MembershipTier;
use serde::Serialize;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionSubscriptionData,
    Currency, CustomerId, Subscription, SubscriptionId, UpdateSubscription,
    UpdateSubscriptionItems,
};

use crate::error::{BillingError, BillingResult};

/// Subscription price ids per paid tier
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub basic: Option<String>,
    pub advanced: Option<String>,
    pub premium: Option<String>,
}

impl PriceIds {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            basic: var("STRIPE_PRICE_BASIC"),
            advanced: var("STRIPE_PRICE_ADVANCED"),
            premium: var("STRIPE_PRICE_PREMIUM"),
        }
    }

    pub fn price_id_for_tier(&self, tier: MembershipTier) -> Option<&str> {
        match tier {
            MembershipTier::Viewer => None,
            MembershipTier::Basic => self.basic.as_deref(),
            MembershipTier::Advanced => self.advanced.as_deref(),
            MembershipTier::Premium => self.premium.as_deref(),
        }
    }

    pub fn tier_for_price_id(&self, price_id: &str) -> Option<MembershipTier> {
        [
            MembershipTier::Basic,
            MembershipTier::Advanced,
            MembershipTier::Premium,
        ]
        .into_iter()
        .find(|tier| self.price_id_for_tier(*tier) == Some(price_id))
    }
}

/// Gateway credentials and checkout settings
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub prices: PriceIds,
    /// Base URL for checkout success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Read from the environment, refusing to start without secrets
    pub fn from_env() -> BillingResult<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{} must be set", name)))
        };

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("PAYMENT_WEBHOOK_SECRET")?,
            prices: PriceIds::from_env(),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url.trim_end_matches('/')
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/checkout/cancelled", self.app_base_url.trim_end_matches('/'))
    }
}

/// What the buyer is charged for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutLine {
    /// Recurring subscription price
    Subscription { price_id: String },
    /// One-off amount with an inline product description
    OneOff {
        name: String,
        description: Option<String>,
        unit_amount_cents: i64,
        quantity: u64,
    },
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub customer_ref: Option<String>,
    pub line: CheckoutLine,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSessionInfo {
    pub session_id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(&self, request: CheckoutRequest) -> BillingResult<CheckoutSessionInfo>;

    /// Cancel immediately. A subscription the gateway no longer knows is
    /// treated as already cancelled.
    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()>;

    /// Move the subscription's single item to a new price
    async fn change_subscription_price(
        &self,
        subscription_ref: &str,
        price_id: &str,
        tier: MembershipTier,
    ) -> BillingResult<()>;
}

/// Stripe-backed gateway
#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn parse_subscription_id(subscription_ref: &str) -> BillingResult<SubscriptionId> {
        subscription_ref
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription id: {}", e)))
    }
}

fn is_missing_subscription(err: &stripe::StripeError) -> bool {
    let message = err.to_string();
    message.contains("resource_missing")
        || message.contains("No such subscription")
        || message.contains("canceled subscription")
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout(&self, request: CheckoutRequest) -> BillingResult<CheckoutSessionInfo> {
        let customer = request
            .customer_ref
            .as_deref()
            .map(|c| {
                c.parse::<CustomerId>()
                    .map_err(|e| BillingError::InvalidInput(format!("Invalid customer id: {}", e)))
            })
            .transpose()?;

        let success_url = self.config.success_url();
        let cancel_url = self.config.cancel_url();

        let (mode, line_item, subscription_data) = match &request.line {
            CheckoutLine::Subscription { price_id } => (
                CheckoutSessionMode::Subscription,
                CreateCheckoutSessionLineItems {
                    price: Some(price_id.clone()),
                    quantity: Some(1),
                    ..Default::default()
                },
                // Copy metadata onto the subscription so its own events can be
                // routed back to the user
                Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(request.metadata.clone()),
                    ..Default::default()
                }),
            ),
            CheckoutLine::OneOff {
                name,
                description,
                unit_amount_cents,
                quantity,
            } => (
                CheckoutSessionMode::Payment,
                CreateCheckoutSessionLineItems {
                    price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                        currency: Currency::USD,
                        unit_amount: Some(*unit_amount_cents),
                        product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: name.clone(),
                            description: description.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    quantity: Some(*quantity),
                    ..Default::default()
                },
                None,
            ),
        };

        let params = CreateCheckoutSession {
            customer,
            mode: Some(mode),
            line_items: Some(vec![line_item]),
            subscription_data,
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        };

        let session = CheckoutSession::create(&self.client, params).await?;

        tracing::info!(
            session_id = %session.id,
            checkout_type = ?request.metadata.get("checkout_type"),
            "Created checkout session"
        );

        Ok(CheckoutSessionInfo {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn cancel_subscription(&self, subscription_ref: &str) -> BillingResult<()> {
        let sub_id = Self::parse_subscription_id(subscription_ref)?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        match Subscription::cancel(&self.client, &sub_id, params).await {
            Ok(subscription) => {
                tracing::info!(subscription_id = %subscription.id, "Cancelled subscription");
                Ok(())
            }
            Err(e) if is_missing_subscription(&e) => {
                tracing::info!(
                    subscription_id = %subscription_ref,
                    "Subscription already cancelled at gateway"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn change_subscription_price(
        &self,
        subscription_ref: &str,
        price_id: &str,
        tier: MembershipTier,
    ) -> BillingResult<()> {
        let sub_id = Self::parse_subscription_id(subscription_ref)?;

        let current = Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let mut metadata = current.metadata.clone();
        metadata.insert("tier".to_string(), tier.as_str().to_string());

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        Subscription::update(&self.client, &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription_ref,
            tier = %tier,
            "Changed subscription price"
        );
        Ok(())
    }
}

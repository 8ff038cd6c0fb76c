//! Notification dispatch
//!
//! Template rendering and transport belong to the email provider; the core
//! only needs a boolean delivery result. A failed send never rolls back the
//! ledger change that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::store::LedgerStore;

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const SEND_ATTEMPTS: usize = 3;

/// Kinds of notification the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MembershipActivated,
    MembershipCancelled,
    PurchaseCompleted,
    MediaSold,
    UploadPublished,
    ExpirationReminder,
    ContentExpired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MembershipActivated => "membership_activated",
            Self::MembershipCancelled => "membership_cancelled",
            Self::PurchaseCompleted => "purchase_completed",
            Self::MediaSold => "media_sold",
            Self::UploadPublished => "upload_published",
            Self::ExpirationReminder => "expiration_reminder",
            Self::ContentExpired => "content_expired",
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            Self::MembershipActivated => "Your membership is active",
            Self::MembershipCancelled => "Your membership has been cancelled",
            Self::PurchaseCompleted => "Your purchase is ready",
            Self::MediaSold => "Your media was sold",
            Self::UploadPublished => "Your upload is published",
            Self::ExpirationReminder => "Your purchased content expires soon",
            Self::ContentExpired => "Your purchased content has expired",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: Uuid,
    pub email: String,
}

/// Delivery channel for notifications
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Returns whether the notification was accepted for delivery
    async fn send(&self, recipient: &Recipient, kind: NotificationKind, data: &Value) -> bool;
}

/// Resend credentials
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
}

impl EmailConfig {
    /// `RESEND_API_KEY` and `EMAIL_FROM`; `None` when the key is absent
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty())?;
        let from = std::env::var("EMAIL_FROM")
            .ok()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| "MediaMart <notifications@mediamart.app>".to_string());
        Some(Self { api_key, from })
    }
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: String,
    tags: [ResendTag<'a>; 1],
}

#[derive(Serialize)]
struct ResendTag<'a> {
    name: &'static str,
    value: &'a str,
}

/// Sends notifications through the Resend HTTP API.
///
/// Without an API key every send is logged and reported as not delivered.
#[derive(Clone)]
pub struct ResendDispatcher {
    client: reqwest::Client,
    config: Option<EmailConfig>,
}

impl ResendDispatcher {
    pub fn new(config: Option<EmailConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    async fn post_once(&self, config: &EmailConfig, body: &ResendEmail<'_>) -> Result<(), String> {
        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("Resend returned {}", response.status()))
        }
    }
}

/// Runs `op` up to `SEND_ATTEMPTS` times with jittered exponential backoff
async fn with_retry<F, Fut, T, E>(base_delay_ms: u64, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let strategy = ExponentialBackoff::from_millis(base_delay_ms)
        .map(jitter)
        .take(SEND_ATTEMPTS - 1);
    Retry::start(strategy, op).await
}

#[async_trait]
impl NotificationDispatcher for ResendDispatcher {
    async fn send(&self, recipient: &Recipient, kind: NotificationKind, data: &Value) -> bool {
        let Some(config) = &self.config else {
            tracing::debug!(
                user_id = %recipient.user_id,
                kind = %kind,
                "Email notifications disabled; skipping"
            );
            return false;
        };

        let body = ResendEmail {
            from: &config.from,
            to: [&recipient.email],
            subject: kind.subject(),
            text: render_text(kind, data),
            tags: [ResendTag {
                name: "kind",
                value: kind.as_str(),
            }],
        };

        match with_retry(200, || self.post_once(config, &body)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    user_id = %recipient.user_id,
                    kind = %kind,
                    error = %e,
                    "Notification delivery failed"
                );
                false
            }
        }
    }
}

/// Plain-text body. Rich templates live with the email provider.
fn render_text(kind: NotificationKind, data: &Value) -> String {
    let title = data.get("title").and_then(Value::as_str).unwrap_or("your media");
    match kind {
        NotificationKind::MembershipActivated => format!(
            "Your {} membership is now active.",
            data.get("tier").and_then(Value::as_str).unwrap_or("new")
        ),
        NotificationKind::MembershipCancelled => {
            "Your membership was cancelled. You are now on the free Viewer plan.".to_string()
        }
        NotificationKind::PurchaseCompleted => format!(
            "Your purchase of \"{}\" is complete. You have 10 days to download it.",
            title
        ),
        NotificationKind::MediaSold => format!("\"{}\" was just purchased.", title),
        NotificationKind::UploadPublished => format!("\"{}\" is now published.", title),
        NotificationKind::ExpirationReminder => {
            let days = data.get("threshold_days").and_then(Value::as_u64).unwrap_or(0);
            let mut text = format!(
                "Some of your purchased content will be deleted in {} day(s):\n",
                days
            );
            if let Some(items) = data.get("items").and_then(Value::as_array) {
                for item in items {
                    let item_title = item.get("title").and_then(Value::as_str).unwrap_or("media");
                    let left = item.get("days_left").and_then(Value::as_i64).unwrap_or(0);
                    text.push_str(&format!("- {} ({} day(s) left)\n", item_title, left));
                }
            }
            text
        }
        NotificationKind::ContentExpired => {
            format!("Access to \"{}\" has ended and the file was removed.", title)
        }
    }
}

/// Whether dispatch waits for the delivery result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Spawn delivery onto the runtime and return immediately
    Detached,
    /// Await delivery before returning
    Inline,
}

/// Resolves recipients from the ledger and hands notifications to a dispatcher
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn LedgerStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    mode: DispatchMode,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        mode: DispatchMode,
    ) -> Self {
        Self {
            store,
            dispatcher,
            mode,
        }
    }

    /// Look up the user's contact address and deliver, returning the result
    pub async fn send_now(&self, user_id: Uuid, kind: NotificationKind, data: Value) -> bool {
        let email = match self.store.contact_email(user_id).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, kind = %kind, "No contact email for user");
                return false;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    kind = %kind,
                    error = %e,
                    "Failed to look up contact email"
                );
                return false;
            }
        };

        let recipient = Recipient { user_id, email };
        let delivered = self.dispatcher.send(&recipient, kind, &data).await;
        if delivered {
            tracing::debug!(user_id = %user_id, kind = %kind, "Notification sent");
        }
        delivered
    }

    /// Fire-and-forget delivery. The caller never sees the result.
    pub async fn dispatch(&self, user_id: Uuid, kind: NotificationKind, data: Value) {
        match self.mode {
            DispatchMode::Inline => {
                self.send_now(user_id, kind, data).await;
            }
            DispatchMode::Detached => {
                let notifier = self.clone();
                tokio::spawn(async move {
                    notifier.send_now(user_id, kind, data).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedgerStore;
    use crate::testing::RecordingDispatcher;
    use serde_json::json;

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&NotificationKind::ExpirationReminder).unwrap();
        assert_eq!(json, "\"expiration_reminder\"");
    }

    #[test]
    fn test_reminder_text_lists_items() {
        let data = json!({
            "threshold_days": 3,
            "items": [ { "title": "Harbor", "days_left": 3 } ]
        });
        let text = render_text(NotificationKind::ExpirationReminder, &data);
        assert!(text.contains("3 day(s)"));
        assert!(text.contains("- Harbor (3 day(s) left)"));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failures() {
        let mut attempts = 0;
        let result: Result<usize, String> = with_retry(1, || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < SEND_ATTEMPTS {
                    Err(format!("attempt {} failed", attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(SEND_ATTEMPTS));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_bounded_attempts() {
        let mut attempts = 0;
        let result: Result<(), String> = with_retry(1, || {
            attempts += 1;
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, SEND_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_disabled_dispatcher_reports_failure() {
        let dispatcher = ResendDispatcher::new(None);
        assert!(!dispatcher.is_enabled());
        let recipient = Recipient {
            user_id: Uuid::new_v4(),
            email: "a@example.com".into(),
        };
        assert!(
            !dispatcher
                .send(&recipient, NotificationKind::MediaSold, &json!({}))
                .await
        );
    }

    #[tokio::test]
    async fn test_notifier_without_contact_does_not_send() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let notifier = Notifier::new(store, dispatcher.clone(), DispatchMode::Inline);

        let sent = notifier
            .send_now(Uuid::new_v4(), NotificationKind::MediaSold, json!({}))
            .await;
        assert!(!sent);
        assert!(dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_notifier_resolves_contact() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let user_id = Uuid::new_v4();
        store.register_contact(user_id, "buyer@example.com").await;
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let notifier = Notifier::new(store, dispatcher.clone(), DispatchMode::Inline);

        notifier
            .dispatch(user_id, NotificationKind::PurchaseCompleted, json!({"title": "Harbor"}))
            .await;

        let sent = dispatcher.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].email, "buyer@example.com");
        assert_eq!(sent[0].kind, NotificationKind::PurchaseCompleted);
    }
}

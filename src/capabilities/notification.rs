//! Notification dispatch
//!
//! Templates render to a subject/body pair. Delivery goes through a
//! `NotificationChannel`: a webhook in production, an in-process outbox
//! as fallback and in tests.

use crate::capabilities::{CapabilityExecutor, ExecutorError};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

pub const TEMPLATES: [&str; 4] = ["order_update", "shipping", "payment", "custom"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub recipient: String,
    pub template: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, notification: &Notification) -> std::result::Result<(), ExecutorError>;
}

// ===== Rendering =====

fn field(fields: &Map<String, Value>, key: &str, default: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

fn required(fields: &Map<String, Value>, template: &str, key: &str) -> std::result::Result<String, ExecutorError> {
    let value = field(fields, key, "");
    if value.is_empty() {
        return Err(ExecutorError::Rejected(format!(
            "template '{}' requires field '{}'",
            template, key
        )));
    }
    Ok(value)
}

/// Subject and body for `template`. Unknown templates and missing
/// required fields are rejected.
pub fn render(template: &str, fields: &Map<String, Value>) -> std::result::Result<(String, String), ExecutorError> {
    let name = field(fields, "customer_name", "Customer");

    match template {
        "order_update" => {
            let order_id = required(fields, template, "order_id")?;
            Ok((
                format!("Order Update - Order #{}", order_id),
                format!(
                    "Hello {},\n\nYour order #{} status has been updated to: {}\n\n{}\n\nTrack your order: {}\n",
                    name,
                    order_id,
                    field(fields, "status", "N/A"),
                    field(fields, "message", ""),
                    field(fields, "tracking_url", "N/A"),
                ),
            ))
        }
        "shipping" => {
            let order_id = required(fields, template, "order_id")?;
            Ok((
                format!("Your Order Has Shipped - Order #{}", order_id),
                format!(
                    "Hello {},\n\nYour order #{} has been shipped.\n\nTracking Number: {}\nCarrier: {}\nEstimated Delivery: {}\n",
                    name,
                    order_id,
                    field(fields, "tracking_number", "N/A"),
                    field(fields, "carrier", "N/A"),
                    field(fields, "estimated_delivery", "N/A"),
                ),
            ))
        }
        "payment" => {
            let order_id = required(fields, template, "order_id")?;
            Ok((
                format!("Payment Confirmation - Order #{}", order_id),
                format!(
                    "Hello {},\n\nYour payment for order #{} has been confirmed.\n\nAmount: {}\nPayment Method: {}\nTransaction ID: {}\n",
                    name,
                    order_id,
                    field(fields, "amount", "0.00"),
                    field(fields, "payment_method", "N/A"),
                    field(fields, "transaction_id", "N/A"),
                ),
            ))
        }
        "custom" => Ok((
            field(fields, "subject", "Notification from Customer Support"),
            required(fields, template, "body")?,
        )),
        other => Err(ExecutorError::Rejected(format!(
            "unknown template '{}', expected one of {}",
            other,
            TEMPLATES.join(", ")
        ))),
    }
}

// ===== Channels =====

pub struct WebhookChannel {
    client: Client,
    url: Option<String>,
}

impl WebhookChannel {
    pub fn new(url: Option<&str>) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            url: url.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> std::result::Result<(), ExecutorError> {
        let url = self.url.as_ref().ok_or_else(|| {
            ExecutorError::Unreachable("NOTIFY_WEBHOOK_URL is not configured".to_string())
        })?;

        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| ExecutorError::Unreachable(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(ExecutorError::Rejected(format!("webhook refused notification: {}", status)));
        }
        if !status.is_success() {
            return Err(ExecutorError::Unreachable(format!("webhook returned {}", status)));
        }
        Ok(())
    }
}

/// Keeps every notification in memory instead of sending it
#[derive(Default)]
pub struct OutboxChannel {
    sent: RwLock<Vec<Notification>>,
}

impl OutboxChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    pub async fn last_for(&self, recipient: &str) -> Option<Notification> {
        self.sent
            .read()
            .await
            .iter()
            .rev()
            .find(|n| n.recipient.eq_ignore_ascii_case(recipient))
            .cloned()
    }
}

#[async_trait::async_trait]
impl NotificationChannel for OutboxChannel {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn deliver(&self, notification: &Notification) -> std::result::Result<(), ExecutorError> {
        info!(
            recipient = %notification.recipient,
            template = %notification.template,
            "Notification queued in outbox"
        );
        self.sent.write().await.push(notification.clone());
        Ok(())
    }
}

// ===== Executor =====

pub struct SendNotification {
    channel: std::sync::Arc<dyn NotificationChannel>,
}

impl SendNotification {
    pub fn new(channel: std::sync::Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for SendNotification {
    fn label(&self) -> &'static str {
        self.channel.name()
    }

    async fn execute(&self, params: &Value) -> std::result::Result<Value, ExecutorError> {
        let recipient = params
            .get("recipient")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let template = params
            .get("template")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let empty = Map::new();
        let fields = params
            .get("fields")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let (subject, body) = render(&template, fields)?;
        let notification = Notification {
            recipient,
            template: template.clone(),
            subject,
            body,
            created_at: Utc::now(),
        };
        self.channel.deliver(&notification).await?;

        Ok(json!({
            "delivered": true,
            "status": "sent",
            "template": template,
            "channel": self.channel.name(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{send_notification_spec, CapabilityRegistry, SEND_NOTIFICATION};
    use std::sync::Arc;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_shipping_template_uses_defaults() {
        let (subject, body) =
            render("shipping", &fields(json!({"order_id": "ORD-12345", "carrier": "UPS"}))).unwrap();
        assert_eq!(subject, "Your Order Has Shipped - Order #ORD-12345");
        assert!(body.contains("Carrier: UPS"));
        assert!(body.contains("Tracking Number: N/A"));
        assert!(body.starts_with("Hello Customer"));
    }

    #[test]
    fn test_missing_order_id_is_rejected() {
        let err = render("payment", &Map::new()).unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected(_)));
    }

    #[test]
    fn test_unknown_template_is_rejected() {
        assert!(render("birthday", &Map::new()).is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_webhook_falls_back_to_outbox() {
        let outbox = Arc::new(OutboxChannel::new());
        let mut registry = CapabilityRegistry::new(Duration::from_secs(1));
        registry.register(
            send_notification_spec(),
            Arc::new(SendNotification::new(Arc::new(WebhookChannel::new(None)))),
            Arc::new(SendNotification::new(outbox.clone())),
        );

        let outcome = registry
            .invoke(
                SEND_NOTIFICATION,
                &json!({
                    "recipient": "jane.doe@example.com",
                    "template": "order_update",
                    "fields": {"order_id": "ORD-12345", "status": "shipped"}
                }),
            )
            .await
            .unwrap();

        assert!(outcome.degraded);
        assert_eq!(outcome.data["channel"], "outbox");
        let sent = outbox.last_for("jane.doe@example.com").await.unwrap();
        assert!(sent.body.contains("updated to: shipped"));
    }
}

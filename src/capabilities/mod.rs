//! Capability registry
//!
//! Each capability declares a parameter schema and a result schema, and
//! carries a primary and a fallback executor. `invoke` never panics and
//! never propagates an executor failure as anything but a
//! `CapabilityError`, so the conversation can always continue.
//!
//! Capabilities do not touch session state; whatever is worth
//! remembering is returned in the result for the orchestrator to judge.

pub mod directory;
pub mod notification;
pub mod verification;

pub use directory::{AccountRecord, InMemoryDirectory, OrderRecord, SupportApiClient};
pub use notification::{Notification, NotificationChannel, OutboxChannel, WebhookChannel};
pub use verification::VerificationCodes;

use crate::config::AgentConfig;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const ACCOUNT_LOOKUP: &str = "account_lookup";
pub const ORDER_LOOKUP: &str = "order_lookup";
pub const ISSUE_VERIFICATION_CODE: &str = "issue_verification_code";
pub const VALIDATE_VERIFICATION_CODE: &str = "validate_verification_code";
pub const SEND_NOTIFICATION: &str = "send_notification";

/// Both executors failed, or the request itself was unusable
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Capability '{capability}' failed: {cause}")]
pub struct CapabilityError {
    pub capability: String,
    pub cause: String,
}

impl CapabilityError {
    pub fn new(capability: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            cause: cause.into(),
        }
    }
}

/// Failure of a single executor
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("dependency unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    /// Definitive answer from the backend (unknown order, bad template).
    /// A fallback would only repeat it.
    #[error("rejected: {0}")]
    Rejected(String),
}

// ===== Schemas =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Email,
    Boolean,
    Integer,
    Object,
}

impl FieldKind {
    fn json_type(&self) -> &'static str {
        match self {
            FieldKind::String | FieldKind::Email => "string",
            FieldKind::Boolean => "boolean",
            FieldKind::Integer => "integer",
            FieldKind::Object => "object",
        }
    }

    fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match (self, value) {
            (FieldKind::String, Value::String(s)) if !s.trim().is_empty() => Ok(()),
            (FieldKind::String, Value::String(_)) => Err("must not be empty".to_string()),
            (FieldKind::Email, Value::String(s)) => {
                if is_plausible_email(s) {
                    Ok(())
                } else {
                    Err(format!("'{}' is not a valid email address", s))
                }
            }
            (FieldKind::Boolean, Value::Bool(_)) => Ok(()),
            (FieldKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (FieldKind::Object, Value::Object(_)) => Ok(()),
            (kind, other) => Err(format!("expected {}, got {}", kind.json_type(), other)),
        }
    }
}

pub fn is_plausible_email(raw: &str) -> bool {
    let email = raw.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
                && !domain.contains('@')
        }
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<FieldSpec>,
    pub result: Vec<FieldSpec>,
}

impl CapabilitySpec {
    fn validate(fields: &[FieldSpec], value: &Value) -> std::result::Result<(), String> {
        let object = value
            .as_object()
            .ok_or_else(|| "expected a JSON object".to_string())?;

        for field in fields {
            match object.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => field
                    .kind
                    .check(value)
                    .map_err(|e| format!("field '{}' {}", field.name, e))?,
            }
        }
        Ok(())
    }

    pub fn validate_params(&self, params: &Value) -> std::result::Result<(), String> {
        Self::validate(&self.params, params)
    }

    pub fn validate_result(&self, result: &Value) -> std::result::Result<(), String> {
        Self::validate(&self.result, result)
    }

    /// JSON-schema style description of the parameters
    pub fn parameters_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.params {
            properties.insert(
                field.name.to_string(),
                json!({"type": field.kind.json_type(), "description": field.description}),
            );
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ===== Executors =====

#[async_trait::async_trait]
pub trait CapabilityExecutor: Send + Sync {
    fn label(&self) -> &'static str;
    async fn execute(&self, params: &Value) -> std::result::Result<Value, ExecutorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityOutcome {
    pub data: Value,
    /// Produced by the fallback executor
    pub degraded: bool,
}

struct Capability {
    spec: CapabilitySpec,
    primary: Arc<dyn CapabilityExecutor>,
    fallback: Arc<dyn CapabilityExecutor>,
}

pub struct CapabilityRegistry {
    capabilities: HashMap<String, Capability>,
    timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            capabilities: HashMap::new(),
            timeout,
        }
    }

    pub fn register(
        &mut self,
        spec: CapabilitySpec,
        primary: Arc<dyn CapabilityExecutor>,
        fallback: Arc<dyn CapabilityExecutor>,
    ) {
        self.capabilities.insert(
            spec.name.to_string(),
            Capability {
                spec,
                primary,
                fallback,
            },
        );
    }

    pub fn spec(&self, name: &str) -> Option<&CapabilitySpec> {
        self.capabilities.get(name).map(|c| &c.spec)
    }

    /// All specs, sorted by name
    pub fn specs(&self) -> Vec<CapabilitySpec> {
        let mut specs: Vec<CapabilitySpec> =
            self.capabilities.values().map(|c| c.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(b.name));
        specs
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    async fn run(
        &self,
        spec: &CapabilitySpec,
        executor: &Arc<dyn CapabilityExecutor>,
        params: &Value,
    ) -> std::result::Result<Value, ExecutorError> {
        let data = tokio::time::timeout(self.timeout, executor.execute(params))
            .await
            .map_err(|_| ExecutorError::Timeout(self.timeout))??;

        spec.validate_result(&data)
            .map_err(ExecutorError::Malformed)?;
        Ok(data)
    }

    pub async fn invoke(
        &self,
        name: &str,
        params: &Value,
    ) -> std::result::Result<CapabilityOutcome, CapabilityError> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| CapabilityError::new(name, "unknown capability"))?;

        capability
            .spec
            .validate_params(params)
            .map_err(|e| CapabilityError::new(name, format!("invalid parameters: {}", e)))?;

        let start = Instant::now();
        let primary_error = match self.run(&capability.spec, &capability.primary, params).await {
            Ok(data) => {
                debug!(
                    capability = name,
                    executor = capability.primary.label(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Capability succeeded"
                );
                return Ok(CapabilityOutcome {
                    data,
                    degraded: false,
                });
            }
            Err(ExecutorError::Rejected(reason)) => {
                return Err(CapabilityError::new(name, reason));
            }
            Err(e) => e,
        };

        warn!(
            capability = name,
            executor = capability.primary.label(),
            error = %primary_error,
            "Primary executor failed, trying fallback"
        );

        match self.run(&capability.spec, &capability.fallback, params).await {
            Ok(data) => Ok(CapabilityOutcome {
                data,
                degraded: true,
            }),
            Err(ExecutorError::Rejected(reason)) => Err(CapabilityError::new(name, reason)),
            Err(fallback_error) => {
                warn!(
                    capability = name,
                    executor = capability.fallback.label(),
                    error = %fallback_error,
                    "Fallback executor failed"
                );
                Err(CapabilityError::new(
                    name,
                    format!("primary {}; fallback {}", primary_error, fallback_error),
                ))
            }
        }
    }
}

// ===== Specs =====

pub fn account_lookup_spec() -> CapabilitySpec {
    CapabilitySpec {
        name: ACCOUNT_LOOKUP,
        description: "Look up a customer account by email address",
        params: vec![FieldSpec::required("email", FieldKind::Email, "Customer email")],
        result: vec![
            FieldSpec::required("account_id", FieldKind::String, "Account identifier"),
            FieldSpec::required("tier", FieldKind::String, "Account tier"),
            FieldSpec::required("email", FieldKind::Email, "Email on file"),
            FieldSpec::optional("name", FieldKind::String, "Customer name"),
        ],
    }
}

pub fn order_lookup_spec() -> CapabilitySpec {
    CapabilitySpec {
        name: ORDER_LOOKUP,
        description: "Look up an order's status and tracking details by order id",
        params: vec![FieldSpec::required("order_id", FieldKind::String, "Order id, e.g. ORD-12345")],
        result: vec![
            FieldSpec::required("order_id", FieldKind::String, "Order identifier"),
            FieldSpec::required("status", FieldKind::String, "Fulfilment status"),
            FieldSpec::required("customer_email", FieldKind::Email, "Email of the ordering customer"),
            FieldSpec::optional("tracking_number", FieldKind::String, "Carrier tracking number"),
            FieldSpec::optional("carrier", FieldKind::String, "Carrier name"),
            FieldSpec::optional("estimated_delivery", FieldKind::String, "Estimated delivery date"),
        ],
    }
}

pub fn issue_verification_code_spec() -> CapabilitySpec {
    CapabilitySpec {
        name: ISSUE_VERIFICATION_CODE,
        description: "Send a one-time verification code to the customer's email on file",
        params: vec![
            FieldSpec::required("email", FieldKind::Email, "Email from a lookup result"),
            FieldSpec::optional("purpose", FieldKind::String, "What the code protects"),
        ],
        result: vec![
            FieldSpec::required("acknowledged", FieldKind::Boolean, "Code was sent"),
            FieldSpec::required("expires_in_secs", FieldKind::Integer, "Code lifetime"),
        ],
    }
}

pub fn validate_verification_code_spec() -> CapabilitySpec {
    CapabilitySpec {
        name: VALIDATE_VERIFICATION_CODE,
        description: "Check a verification code the customer read back",
        params: vec![
            FieldSpec::required("email", FieldKind::Email, "Email the code was sent to"),
            FieldSpec::required("code", FieldKind::String, "Six-digit code"),
        ],
        result: vec![
            FieldSpec::required("verified", FieldKind::Boolean, "Code matched"),
            FieldSpec::required("reason", FieldKind::String, "verified, no_code_issued, expired or mismatch"),
        ],
    }
}

pub fn send_notification_spec() -> CapabilitySpec {
    CapabilitySpec {
        name: SEND_NOTIFICATION,
        description: "Send a templated notification (order_update, shipping, payment, custom)",
        params: vec![
            FieldSpec::required("recipient", FieldKind::Email, "Recipient email"),
            FieldSpec::required("template", FieldKind::String, "Template name"),
            FieldSpec::optional("fields", FieldKind::Object, "Template fields"),
        ],
        result: vec![
            FieldSpec::required("delivered", FieldKind::Boolean, "Delivery acknowledged"),
            FieldSpec::required("status", FieldKind::String, "Delivery status"),
        ],
    }
}

/// Registry with the five support capabilities: HTTP/webhook primaries,
/// local directory/outbox fallbacks.
pub fn create_default_registry(
    config: &AgentConfig,
    directory: Arc<InMemoryDirectory>,
    outbox: Arc<OutboxChannel>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new(config.capability_timeout);

    let api = SupportApiClient::new(config.support_api_base_url.as_deref());
    let webhook: Arc<dyn NotificationChannel> =
        Arc::new(WebhookChannel::new(config.notify_webhook_url.as_deref()));
    let outbox_channel: Arc<dyn NotificationChannel> = outbox;
    let codes = Arc::new(VerificationCodes::new(config.verification_code_ttl));

    registry.register(
        account_lookup_spec(),
        Arc::new(directory::HttpAccountLookup::new(api.clone())),
        Arc::new(directory::DirectoryAccountLookup::new(Arc::clone(&directory))),
    );
    registry.register(
        order_lookup_spec(),
        Arc::new(directory::HttpOrderLookup::new(api)),
        Arc::new(directory::DirectoryOrderLookup::new(directory)),
    );

    registry.register(
        issue_verification_code_spec(),
        Arc::new(verification::IssueCode::new(Arc::clone(&codes), Arc::clone(&webhook))),
        Arc::new(verification::IssueCode::new(Arc::clone(&codes), Arc::clone(&outbox_channel))),
    );
    let validate: Arc<dyn CapabilityExecutor> = Arc::new(verification::ValidateCode::new(codes));
    registry.register(validate_verification_code_spec(), Arc::clone(&validate), validate);

    registry.register(
        send_notification_spec(),
        Arc::new(notification::SendNotification::new(webhook)),
        Arc::new(notification::SendNotification::new(outbox_channel)),
    );

    registry
}

//! Account and order lookups
//!
//! Primary executors call the support backend over HTTP; the fallback
//! reads a local directory seeded from JSON.

use crate::agent::extract::normalize_order_id;
use crate::capabilities::{CapabilityExecutor, ExecutorError};
use crate::error::OrchestrationError;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

type ExecResult = std::result::Result<Value, ExecutorError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountRecord {
    pub account_id: String,
    pub email: String,
    pub tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub order_id: String,
    pub status: String,
    pub customer_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_delivery: Option<String>,
    #[serde(default)]
    pub items: Vec<String>,
}

fn str_param<'a>(params: &'a Value, key: &str) -> std::result::Result<&'a str, ExecutorError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| ExecutorError::Rejected(format!("missing '{}'", key)))
}

fn to_value<T: Serialize>(record: &T) -> ExecResult {
    serde_json::to_value(record).map_err(|e| ExecutorError::Malformed(e.to_string()))
}

// ===== HTTP backend =====

#[derive(Clone)]
pub struct SupportApiClient {
    client: Client,
    base_url: String,
}

impl SupportApiClient {
    /// `None` when no base URL is configured
    pub fn new(base_url: Option<&str>) -> Option<Self> {
        let base_url = base_url?.trim();
        if base_url.is_empty() {
            return None;
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> ExecResult {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::Timeout(Duration::from_secs(30))
                } else {
                    ExecutorError::Unreachable(format!("support API request failed for {}: {}", path, e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ExecutorError::Rejected(format!("not found: {}", body)));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| ExecutorError::Malformed(format!("invalid JSON response: {}", e)))?;

        if status.is_client_error() {
            return Err(ExecutorError::Rejected(format!("support API returned {}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(ExecutorError::Unreachable(format!(
                "support API returned {} for {}",
                status, path
            )));
        }

        // some deployments wrap payloads as {"data": {...}}
        match body {
            Value::Object(mut map) if map.contains_key("data") && map.len() <= 2 => {
                Ok(map.remove("data").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }
}

fn not_configured() -> ExecutorError {
    ExecutorError::Unreachable("SUPPORT_API_BASE_URL is not configured".to_string())
}

pub struct HttpAccountLookup {
    api: Option<SupportApiClient>,
}

impl HttpAccountLookup {
    pub fn new(api: Option<SupportApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for HttpAccountLookup {
    fn label(&self) -> &'static str {
        "support_api"
    }

    async fn execute(&self, params: &Value) -> ExecResult {
        let api = self.api.as_ref().ok_or_else(not_configured)?;
        let email = str_param(params, "email")?;
        api.post_json("/api/v1/accounts/lookup", &json!({ "email": email }))
            .await
    }
}

pub struct HttpOrderLookup {
    api: Option<SupportApiClient>,
}

impl HttpOrderLookup {
    pub fn new(api: Option<SupportApiClient>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for HttpOrderLookup {
    fn label(&self) -> &'static str {
        "support_api"
    }

    async fn execute(&self, params: &Value) -> ExecResult {
        let api = self.api.as_ref().ok_or_else(not_configured)?;
        let raw = str_param(params, "order_id")?;
        let order_id = normalize_order_id(raw).unwrap_or_else(|| raw.to_string());
        api.post_json("/api/v1/orders/lookup", &json!({ "order_id": order_id }))
            .await
    }
}

// ===== Local directory =====

#[derive(Debug, Default, Deserialize)]
struct DirectorySeed {
    #[serde(default)]
    accounts: Vec<AccountRecord>,
    #[serde(default)]
    orders: Vec<OrderRecord>,
}

/// Accounts keyed by lowercased email, orders by normalized id
#[derive(Default)]
pub struct InMemoryDirectory {
    accounts: Arc<RwLock<HashMap<String, AccountRecord>>>,
    orders: Arc<RwLock<HashMap<String, OrderRecord>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let seed: DirectorySeed = serde_json::from_str(raw)?;
        Ok(Self::from_records(seed.accounts, seed.orders))
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::Config(format!("Cannot read directory seed {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    fn from_records(accounts: Vec<AccountRecord>, orders: Vec<OrderRecord>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|a| (a.email.trim().to_lowercase(), a))
            .collect();
        let orders = orders
            .into_iter()
            .map(|o| (order_key(&o.order_id), o))
            .collect();

        Self {
            accounts: Arc::new(RwLock::new(accounts)),
            orders: Arc::new(RwLock::new(orders)),
        }
    }

    /// Small seed used by the demo binaries and tests
    pub fn with_demo_data() -> Self {
        Self::from_records(
            vec![AccountRecord {
                account_id: "ACC-1001".to_string(),
                email: "jane.doe@example.com".to_string(),
                tier: "gold".to_string(),
                name: Some("Jane Doe".to_string()),
            }],
            vec![
                OrderRecord {
                    order_id: "ORD-12345".to_string(),
                    status: "shipped".to_string(),
                    customer_email: "jane.doe@example.com".to_string(),
                    customer_name: Some("Jane Doe".to_string()),
                    tracking_number: Some("1Z999AA10123456784".to_string()),
                    carrier: Some("UPS".to_string()),
                    estimated_delivery: Some("2024-06-14".to_string()),
                    items: vec!["Wireless Headphones".to_string()],
                },
                OrderRecord {
                    order_id: "ORD-67890".to_string(),
                    status: "processing".to_string(),
                    customer_email: "sam.lee@example.com".to_string(),
                    customer_name: Some("Sam Lee".to_string()),
                    tracking_number: None,
                    carrier: None,
                    estimated_delivery: None,
                    items: vec!["Laptop Stand".to_string(), "USB-C Hub".to_string()],
                },
            ],
        )
    }

    pub async fn insert_account(&self, account: AccountRecord) {
        self.accounts
            .write()
            .await
            .insert(account.email.trim().to_lowercase(), account);
    }

    pub async fn insert_order(&self, order: OrderRecord) {
        self.orders.write().await.insert(order_key(&order.order_id), order);
    }

    pub async fn account(&self, email: &str) -> Option<AccountRecord> {
        self.accounts
            .read()
            .await
            .get(&email.trim().to_lowercase())
            .cloned()
    }

    pub async fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.read().await.get(&order_key(order_id)).cloned()
    }
}

fn order_key(raw: &str) -> String {
    normalize_order_id(raw).unwrap_or_else(|| raw.trim().to_uppercase())
}

pub struct DirectoryAccountLookup {
    directory: Arc<InMemoryDirectory>,
}

impl DirectoryAccountLookup {
    pub fn new(directory: Arc<InMemoryDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for DirectoryAccountLookup {
    fn label(&self) -> &'static str {
        "local_directory"
    }

    async fn execute(&self, params: &Value) -> ExecResult {
        let email = str_param(params, "email")?;
        match self.directory.account(email).await {
            Some(account) => to_value(&account),
            None => Err(ExecutorError::Rejected(format!("no account for {}", email))),
        }
    }
}

pub struct DirectoryOrderLookup {
    directory: Arc<InMemoryDirectory>,
}

impl DirectoryOrderLookup {
    pub fn new(directory: Arc<InMemoryDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for DirectoryOrderLookup {
    fn label(&self) -> &'static str {
        "local_directory"
    }

    async fn execute(&self, params: &Value) -> ExecResult {
        let order_id = str_param(params, "order_id")?;
        match self.directory.order(order_id).await {
            Some(order) => to_value(&order),
            None => Err(ExecutorError::Rejected(format!("order {} not found", order_id))),
        }
    }
}

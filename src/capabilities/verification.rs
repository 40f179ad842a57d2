//! One-time email verification codes
//!
//! A code is six digits, bound to one email, expires after the configured
//! TTL and is consumed by the first successful validation. Reissuing
//! replaces any outstanding code for that email. The code itself only
//! ever travels through the notification channel.

use crate::capabilities::{CapabilityExecutor, ExecutorError, Notification, NotificationChannel};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    Verified,
    NoCodeIssued,
    Expired,
    Mismatch,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::Verified => "verified",
            ValidationReason::NoCodeIssued => "no_code_issued",
            ValidationReason::Expired => "expired",
            ValidationReason::Mismatch => "mismatch",
        }
    }
}

#[derive(Debug, Clone)]
struct IssuedCode {
    code: String,
    purpose: String,
    expires_at: Instant,
}

pub struct VerificationCodes {
    codes: RwLock<HashMap<String, IssuedCode>>,
    ttl: Duration,
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

fn generate_code() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 1_000_000;
    format!("{:06}", n)
}

impl VerificationCodes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh code for `email`, replacing any previous one
    pub async fn issue(&self, email: &str, purpose: &str) -> String {
        let code = generate_code();
        self.codes.write().await.insert(
            email_key(email),
            IssuedCode {
                code: code.clone(),
                purpose: purpose.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        code
    }

    pub async fn revoke(&self, email: &str) {
        self.codes.write().await.remove(&email_key(email));
    }

    pub async fn validate(&self, email: &str, code: &str) -> ValidationReason {
        let key = email_key(email);
        let mut codes = self.codes.write().await;

        let Some(issued) = codes.get(&key) else {
            return ValidationReason::NoCodeIssued;
        };

        if Instant::now() >= issued.expires_at {
            codes.remove(&key);
            return ValidationReason::Expired;
        }

        if issued.code != code.trim() {
            return ValidationReason::Mismatch;
        }

        debug!(purpose = %issued.purpose, "Verification code consumed");
        codes.remove(&key);
        ValidationReason::Verified
    }

    /// Drop expired codes; returns how many
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut codes = self.codes.write().await;
        let before = codes.len();
        codes.retain(|_, c| c.expires_at > now);
        before - codes.len()
    }
}

fn expiry_text(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs < 60 {
        format!("{} seconds", secs)
    } else {
        format!("{} minutes", secs / 60)
    }
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub struct IssueCode {
    codes: Arc<VerificationCodes>,
    channel: Arc<dyn NotificationChannel>,
}

impl IssueCode {
    pub fn new(codes: Arc<VerificationCodes>, channel: Arc<dyn NotificationChannel>) -> Self {
        Self { codes, channel }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for IssueCode {
    fn label(&self) -> &'static str {
        self.channel.name()
    }

    async fn execute(&self, params: &Value) -> std::result::Result<Value, ExecutorError> {
        let email = params
            .get("email")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let purpose = params
            .get("purpose")
            .and_then(Value::as_str)
            .unwrap_or("verification");

        let code = self.codes.issue(email, purpose).await;
        let ttl = self.codes.ttl();

        let notification = Notification {
            recipient: email.to_string(),
            template: "verification_code".to_string(),
            subject: format!("Your Verification Code - {}", title_case(purpose)),
            body: format!(
                "Hello,\n\nYour verification code is: {}\n\nThis code will expire in {}.\n\nIf you didn't request this code, please ignore this email.\n",
                code,
                expiry_text(ttl)
            ),
            created_at: Utc::now(),
        };

        if let Err(e) = self.channel.deliver(&notification).await {
            self.codes.revoke(email).await;
            return Err(e);
        }

        info!(channel = self.channel.name(), "Verification code issued");
        Ok(json!({
            "acknowledged": true,
            "expires_in_secs": ttl.as_secs(),
        }))
    }
}

pub struct ValidateCode {
    codes: Arc<VerificationCodes>,
}

impl ValidateCode {
    pub fn new(codes: Arc<VerificationCodes>) -> Self {
        Self { codes }
    }
}

#[async_trait::async_trait]
impl CapabilityExecutor for ValidateCode {
    fn label(&self) -> &'static str {
        "local_codes"
    }

    async fn execute(&self, params: &Value) -> std::result::Result<Value, ExecutorError> {
        let email = params.get("email").and_then(Value::as_str).unwrap_or_default();
        let code = params.get("code").and_then(Value::as_str).unwrap_or_default();

        let reason = self.codes.validate(email, code).await;
        Ok(json!({
            "verified": reason == ValidationReason::Verified,
            "reason": reason.as_str(),
        }))
    }
}

/// Pull the six-digit code out of a delivered verification message
pub fn code_from_message(body: &str) -> Option<String> {
    body.split(|c: char| !c.is_ascii_digit())
        .find(|t| t.len() == 6)
        .map(str::to_string)
}

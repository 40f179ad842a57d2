//! Per-conversation state
//!
//! A `SessionState` is created on the first turn, mutated only by the
//! orchestrator, and persisted as one value at the end of each turn.

pub mod history;
pub mod locks;

pub use history::{is_well_paired, prune_history, window};
pub use locks::SessionLocks;

use crate::models::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Tracking,
    Return,
    Refund,
    Replacement,
    Verification,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessKind::Tracking => "tracking",
            ProcessKind::Return => "return",
            ProcessKind::Refund => "refund",
            ProcessKind::Replacement => "replacement",
            ProcessKind::Verification => "verification",
        };
        write!(f, "{}", s)
    }
}

/// Multi-turn process in progress, with its private working data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveProcess {
    pub kind: ProcessKind,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl ActiveProcess {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            started_at: Utc::now(),
            data: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    pub history: Vec<Message>,
    #[serde(default)]
    pub remembered_order_id: Option<String>,
    #[serde(default)]
    pub remembered_account_id: Option<String>,
    /// Customer email as returned by a lookup capability
    #[serde(default)]
    pub lookup_email: Option<String>,
    #[serde(default)]
    pub active_process: Option<ActiveProcess>,
    /// Set only after a validation capability confirmed the code
    #[serde(default)]
    pub verified_email: Option<String>,
    #[serde(default)]
    pub iteration_count: u64,
    #[serde(default)]
    pub turn_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
            remembered_order_id: None,
            remembered_account_id: None,
            lookup_email: None,
            active_process: None,
            verified_email: None,
            iteration_count: 0,
            turn_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn facts(&self) -> RememberedFacts {
        let pending_verification_email = self
            .active_process
            .as_ref()
            .filter(|p| p.kind == ProcessKind::Verification)
            .and_then(|p| p.data.get("email"))
            .and_then(Value::as_str)
            .map(str::to_string);

        RememberedFacts {
            order_id: self.remembered_order_id.clone(),
            account_id: self.remembered_account_id.clone(),
            lookup_email: self.lookup_email.clone(),
            active_process: self.active_process.as_ref().map(|p| p.kind),
            pending_verification_email,
            verified_email: self.verified_email.clone(),
        }
    }

    /// Whether `email` is grounded in a lookup result or a prior verification
    pub fn knows_email(&self, email: &str) -> bool {
        let matches = |known: &Option<String>| {
            known
                .as_deref()
                .map_or(false, |k| k.eq_ignore_ascii_case(email.trim()))
        };
        matches(&self.lookup_email) || matches(&self.verified_email)
    }

    pub fn start_process(&mut self, kind: ProcessKind) {
        if self.active_process.as_ref().map(|p| p.kind) != Some(kind) {
            self.active_process = Some(ActiveProcess::new(kind));
        }
    }

    pub fn clear_process(&mut self) {
        self.active_process = None;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Remembered session fields handed to the oracle each iteration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RememberedFacts {
    pub order_id: Option<String>,
    pub account_id: Option<String>,
    pub lookup_email: Option<String>,
    pub active_process: Option<ProcessKind>,
    pub pending_verification_email: Option<String>,
    pub verified_email: Option<String>,
}

impl RememberedFacts {
    pub fn is_verified(&self) -> bool {
        self.verified_email.is_some()
    }
}

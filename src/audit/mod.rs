//! Turn audit log
//!
//! Every finished turn is appended with its trace and a SHA-256
//! fingerprint of the user input, so a stored entry can be checked
//! against the text it claims to answer.

use crate::models::{TurnOutcome, TurnTrace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub turn_id: Uuid,
    pub session_id: String,
    pub input: String,
    pub input_hash: String,
    pub outcome: TurnOutcome,
    pub trace: Arc<TurnTrace>,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only, in-memory
pub struct AuditLog {
    entries: Arc<RwLock<HashMap<Uuid, AuditEntry>>>,
    by_session: Arc<RwLock<HashMap<String, Vec<Uuid>>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            by_session: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record(&self, input: &str, trace: TurnTrace) -> Uuid {
        let turn_id = trace.turn_id;
        let entry = AuditEntry {
            turn_id,
            session_id: trace.session_id.clone(),
            input: input.to_string(),
            input_hash: input_fingerprint(input),
            outcome: trace.outcome,
            trace: Arc::new(trace),
            recorded_at: Utc::now(),
        };

        let session_id = entry.session_id.clone();
        self.entries.write().await.insert(turn_id, entry);
        self.by_session
            .write()
            .await
            .entry(session_id)
            .or_default()
            .push(turn_id);
        turn_id
    }

    pub async fn get(&self, turn_id: Uuid) -> Option<AuditEntry> {
        self.entries.read().await.get(&turn_id).cloned()
    }

    /// Turn ids for a session, oldest first
    pub async fn list_for_session(&self, session_id: &str) -> Vec<Uuid> {
        self.by_session
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// False for unknown turns and for entries whose input no longer
    /// matches its fingerprint
    pub async fn verify_integrity(&self, turn_id: Uuid) -> bool {
        match self.entries.read().await.get(&turn_id) {
            Some(entry) => input_fingerprint(&entry.input) == entry.input_hash,
            None => false,
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn input_fingerprint(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

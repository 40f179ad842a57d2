//! Core data models shared across the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    CapabilityResult,
}

/// One capability invocation requested by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallDescriptor {
    pub call_id: String,
    pub name: String,
    pub params: Value,
}

/// A single entry in a session's history.
///
/// An assistant message with `calls` must be followed by exactly one
/// `CapabilityResult` message per call id before any other message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            calls: Vec::new(),
            call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Assistant message declaring capability calls
    pub fn assistant_calls(calls: Vec<CallDescriptor>) -> Self {
        let mut msg = Self::new(MessageRole::Assistant, String::new());
        msg.calls = calls;
        msg
    }

    pub fn capability_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageRole::CapabilityResult, content);
        msg.call_id = Some(call_id.into());
        msg
    }

    pub fn declares_calls(&self) -> bool {
        self.role == MessageRole::Assistant && !self.calls.is_empty()
    }

    /// A message the user would see as a reply
    pub fn is_user_facing(&self) -> bool {
        matches!(self.role, MessageRole::User)
            || (self.role == MessageRole::Assistant && self.calls.is_empty())
    }
}

//
// ================= Capability Calls =================
//

/// Turn-scoped record of one capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCallRecord {
    pub call_id: String,
    pub name: String,
    pub params: Value,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub degraded: bool,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl CapabilityCallRecord {
    /// Stable signature used by the loop guard
    pub fn signature(&self) -> String {
        call_signature(&self.name, &self.params)
    }
}

/// `name(params)` with params in canonical (sorted-key) JSON form.
pub fn call_signature(name: &str, params: &Value) -> String {
    let mut out = String::with_capacity(name.len() + 32);
    out.push_str(name);
    out.push('(');
    write_canonical(params, &mut out);
    out.push(')');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

//
// ================= Turn Output =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Oracle answered and every dispatched call was paired
    Completed,
    IterationExceeded,
    LoopDetected,
    OracleUnavailable,
    /// Internal error; nothing persisted for this turn
    Aborted,
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::IterationExceeded => "iteration_exceeded",
            TurnOutcome::LoopDetected => "loop_detected",
            TurnOutcome::OracleUnavailable => "oracle_unavailable",
            TurnOutcome::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Side-channel trace of one turn. Diagnostics live here, never in the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnTrace {
    pub turn_id: Uuid,
    pub session_id: String,
    pub outcome: TurnOutcome,
    pub iterations: u32,
    pub oracle_attempts: u32,
    pub calls: Vec<CapabilityCallRecord>,
    pub retrieved_node_ids: Vec<String>,
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl TurnTrace {
    pub fn new(session_id: &str) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            outcome: TurnOutcome::Completed,
            iterations: 0,
            oracle_attempts: 0,
            calls: Vec::new(),
            retrieved_node_ids: Vec::new(),
            diagnostics: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub session_id: String,
    pub answer: String,
    pub trace: TurnTrace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_ignores_key_order() {
        let a = json!({"order_id": "ORD-1", "include": true});
        let b = json!({"include": true, "order_id": "ORD-1"});
        assert_eq!(call_signature("order_lookup", &a), call_signature("order_lookup", &b));
    }

    #[test]
    fn test_message_roles() {
        let calls = Message::assistant_calls(vec![CallDescriptor {
            call_id: "c1".to_string(),
            name: "order_lookup".to_string(),
            params: json!({}),
        }]);
        assert!(calls.declares_calls());
        assert!(!calls.is_user_facing());
        assert!(Message::assistant("hi").is_user_facing());
        assert_eq!(Message::capability_result("c1", "{}").call_id.as_deref(), Some("c1"));
    }
}

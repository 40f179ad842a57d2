//! Decision oracle
//!
//! The oracle is a black box from context to decision: either a final
//! answer or a batch of capability requests. The orchestrator consumes
//! the decision with an explicit match; nothing else about the oracle's
//! reasoning is trusted.

pub mod gemini;
pub mod rules;

pub use gemini::GeminiOracle;
pub use rules::RuleBasedOracle;

use crate::capabilities::CapabilitySpec;
use crate::error::OrchestrationError;
use crate::knowledge::RetrievalResult;
use crate::models::{CapabilityCallRecord, Message, MessageRole};
use crate::session::RememberedFacts;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRequest {
    pub name: String,
    pub params: Value,
}

impl CapabilityRequest {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Decision {
    Answer(String),
    CallCapabilities(Vec<CapabilityRequest>),
}

/// Retrieved knowledge shown to the oracle for this turn only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnippet {
    pub node_id: String,
    pub label: String,
    pub content: String,
    pub score: f64,
}

impl ContextSnippet {
    pub fn from_retrieval(result: &RetrievalResult) -> Vec<Self> {
        result
            .hits
            .iter()
            .map(|hit| Self {
                node_id: hit.node.id.clone(),
                label: hit.node.label.clone(),
                content: hit.node.content.clone(),
                score: hit.score,
            })
            .collect()
    }
}

/// Everything the oracle sees for one decision
#[derive(Debug, Clone)]
pub struct OracleContext {
    /// Pruned, well-paired history ending with this turn's messages
    pub history: Vec<Message>,
    pub retrieved: Vec<ContextSnippet>,
    pub facts: RememberedFacts,
    pub capabilities: Vec<CapabilitySpec>,
    /// Calls already dispatched in this turn, oldest first
    pub calls_this_turn: Vec<CapabilityCallRecord>,
}

impl OracleContext {
    pub fn latest_user_input(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    pub fn last_call(&self) -> Option<&CapabilityCallRecord> {
        self.calls_this_turn.last()
    }
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    fn name(&self) -> &'static str;

    /// `OracleUnavailable` when the backend cannot be reached; the
    /// orchestrator retries with backoff.
    async fn decide(&self, context: &OracleContext) -> Result<Decision>;
}

// ===== Scripted =====

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Decide(Decision),
    Unavailable(String),
}

/// Replays a fixed script, then repeats `then` (or answers) forever.
/// Records every context it was shown.
pub struct ScriptedOracle {
    steps: Mutex<VecDeque<ScriptStep>>,
    then: Option<Decision>,
    seen: Mutex<Vec<OracleContext>>,
}

impl ScriptedOracle {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            then: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn decisions(decisions: Vec<Decision>) -> Self {
        Self::new(decisions.into_iter().map(ScriptStep::Decide).collect())
    }

    pub fn repeating(decision: Decision) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            then: Some(decision),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn then(mut self, decision: Decision) -> Self {
        self.then = Some(decision);
        self
    }

    pub fn contexts(&self) -> Vec<OracleContext> {
        self.seen
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn consultations(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn decide(&self, context: &OracleContext) -> Result<Decision> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(context.clone());
        }

        let next = self
            .steps
            .lock()
            .map_err(|_| OrchestrationError::OracleUnavailable("script lock poisoned".to_string()))?
            .pop_front();

        match next {
            Some(ScriptStep::Decide(decision)) => Ok(decision),
            Some(ScriptStep::Unavailable(reason)) => Err(OrchestrationError::OracleUnavailable(reason)),
            None => Ok(self
                .then
                .clone()
                .unwrap_or_else(|| Decision::Answer("Is there anything else I can help with?".to_string()))),
        }
    }
}

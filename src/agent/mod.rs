//! Conversation orchestrator - runs one turn at a time per session
//!
//! LOAD → PRUNE → RETRIEVE → (REASON → DISPATCH)* → RESPOND → PERSIST
//!
//! The orchestrator is the only writer of `SessionState`. Capabilities
//! return values; what gets remembered is decided in `absorb_result`.

pub mod extract;
pub mod loop_guard;

#[cfg(test)]
mod tests;

use crate::audit::AuditLog;
use crate::capabilities::{
    create_default_registry, is_plausible_email, CapabilityError, CapabilityRegistry,
    InMemoryDirectory, OutboxChannel, ACCOUNT_LOOKUP, ISSUE_VERIFICATION_CODE, ORDER_LOOKUP,
    VALIDATE_VERIFICATION_CODE,
};
use crate::config::{AgentConfig, RetryPolicy, SessionConfig};
use crate::error::OrchestrationError;
use crate::knowledge::KnowledgeIndex;
use crate::models::{
    CallDescriptor, CapabilityCallRecord, Message, TurnOutcome, TurnResponse, TurnTrace,
};
use crate::oracle::{
    CapabilityRequest, ContextSnippet, Decision, DecisionOracle, GeminiOracle, OracleContext,
    RuleBasedOracle,
};
use crate::session::{
    is_well_paired, prune_history, window, ActiveProcess, ProcessKind, SessionLocks, SessionState,
};
use crate::state::{build_state_store, StateStore};
use crate::Result;
use chrono::Utc;
use loop_guard::LoopGuard;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const APOLOGY: &str =
    "I'm sorry, I'm having trouble answering right now. Please try again in a moment.";

pub const FALLBACK_ANSWER: &str =
    "I'm sorry, I couldn't finish that request. Could you rephrase it or tell me a bit more about what you need?";

pub struct Orchestrator {
    session: SessionConfig,
    retry: RetryPolicy,
    oracle: Arc<dyn DecisionOracle>,
    registry: Arc<CapabilityRegistry>,
    knowledge: Arc<KnowledgeIndex>,
    store: Arc<dyn StateStore>,
    locks: SessionLocks,
    audit: AuditLog,
}

impl Orchestrator {
    pub fn new(
        config: &AgentConfig,
        oracle: Arc<dyn DecisionOracle>,
        registry: Arc<CapabilityRegistry>,
        knowledge: Arc<KnowledgeIndex>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            session: config.session.clone(),
            retry: config.oracle_retry.clone(),
            oracle,
            registry,
            knowledge,
            store,
            locks: SessionLocks::new(),
            audit: AuditLog::new(),
        }
    }

    /// Wire every component from configuration. The outbox collects
    /// notifications whenever the webhook is unavailable.
    pub async fn from_config(config: &AgentConfig) -> Result<(Self, Arc<OutboxChannel>)> {
        let store = build_state_store(config.database_url.as_deref());

        let knowledge = Arc::new(KnowledgeIndex::new(
            config.graph.clone(),
            config.retrieval.clone(),
            Arc::clone(&store),
        ));
        if let Err(e) = knowledge.rebuild_from_dir(&config.knowledge_dir).await {
            warn!(
                dir = %config.knowledge_dir.display(),
                error = %e,
                "Knowledge base not built, trying persisted snapshot"
            );
            if !knowledge.load_persisted().await? {
                warn!("No knowledge graph available, retrieval disabled until rebuild");
            }
        }

        let directory = match &config.directory_seed {
            Some(path) => InMemoryDirectory::load(path)?,
            None => InMemoryDirectory::with_demo_data(),
        };
        let outbox = Arc::new(OutboxChannel::new());
        let registry = create_default_registry(config, Arc::new(directory), Arc::clone(&outbox));

        let oracle: Arc<dyn DecisionOracle> = if config.gemini_api_key.is_empty() {
            info!("GEMINI_API_KEY not set, using rule-based oracle");
            Arc::new(RuleBasedOracle::new())
        } else {
            Arc::new(GeminiOracle::new(config.gemini_api_key.clone())?)
        };

        let orchestrator = Self::new(config, oracle, Arc::new(registry), knowledge, store);
        Ok((orchestrator, outbox))
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeIndex> {
        &self.knowledge
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn oracle_name(&self) -> &'static str {
        self.oracle.name()
    }

    /// Run one turn. Always yields an answer; failures show up in the
    /// trace only.
    pub async fn handle_turn(&self, session_id: &str, input: &str) -> TurnResponse {
        let start = Instant::now();
        let mut trace = TurnTrace::new(session_id);

        // held until the turn returns or is dropped
        let _turn = self.locks.acquire(session_id).await;

        info!(
            session_id,
            turn_id = %trace.turn_id,
            oracle = self.oracle.name(),
            "Orchestrator: turn started"
        );

        let answer = match self.run_turn(session_id, input, &mut trace).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(session_id, error = %e, "Turn aborted, state left untouched");
                trace.outcome = TurnOutcome::Aborted;
                trace.diagnostics.push(format!("aborted: {}", e));
                APOLOGY.to_string()
            }
        };

        trace.elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            session_id,
            outcome = %trace.outcome,
            iterations = trace.iterations,
            calls = trace.calls.len(),
            elapsed_ms = trace.elapsed_ms,
            "Orchestrator: turn finished"
        );

        self.audit.record(input, trace.clone()).await;

        TurnResponse {
            session_id: session_id.to_string(),
            answer,
            trace,
        }
    }

    /// Delete persisted state for a session
    pub async fn end_session(&self, session_id: &str) -> Result<bool> {
        let deleted = {
            let _turn = self.locks.acquire(session_id).await;
            self.store.delete_session(session_id).await?
        };
        self.locks.forget(session_id);
        info!(session_id, deleted, "Session ended");
        Ok(deleted)
    }

    pub async fn evict_idle(&self, max_idle: chrono::Duration) -> Result<usize> {
        let evicted = self.store.evict_idle(max_idle).await?;
        if evicted > 0 {
            info!(evicted, "Evicted idle sessions");
        }
        Ok(evicted)
    }

    /// Last persisted state, if any
    pub async fn session(&self, session_id: &str) -> Result<Option<SessionState>> {
        self.store.load_session(session_id).await
    }

    async fn run_turn(&self, session_id: &str, input: &str, trace: &mut TurnTrace) -> Result<String> {
        if session_id.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "session id must not be empty".to_string(),
            ));
        }

        // === LOAD ===
        let mut state = self.load_or_create(session_id, trace).await?;

        // === PRUNE ===
        let removed = prune_history(&mut state.history, self.session.history_cap);
        if removed > 0 {
            debug!(session_id, removed, "History pruned before turn");
        }

        absorb_input(&mut state, input);

        // === RETRIEVE ===
        let retrieved = self.retrieve(input, trace).await;

        state.history.push(Message::user(input));

        // === REASON / DISPATCH ===
        let answer = self.reason(&mut state, &retrieved, trace).await;

        if !is_well_paired(&state.history) {
            return Err(OrchestrationError::State(
                "history has an unpaired capability call".to_string(),
            ));
        }
        state.history.push(Message::assistant(answer.as_str()));

        // === PERSIST ===
        prune_history(&mut state.history, self.session.history_cap);
        state.turn_count += 1;
        state.touch();
        self.store.save_session(&state).await?;

        Ok(answer)
    }

    async fn load_or_create(&self, session_id: &str, trace: &mut TurnTrace) -> Result<SessionState> {
        match self.store.load_session(session_id).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => {
                debug!(session_id, "Creating new session");
                Ok(SessionState::new(session_id))
            }
            Err(OrchestrationError::SessionCorrupt { reason, .. }) => {
                warn!(session_id, reason = %reason, "Session state corrupt, starting fresh");
                trace.diagnostics.push(format!("session state corrupt: {}", reason));
                Ok(SessionState::new(session_id))
            }
            Err(e) => Err(e),
        }
    }

    async fn retrieve(&self, input: &str, trace: &mut TurnTrace) -> Vec<ContextSnippet> {
        if !self.knowledge.retrieval_config().enabled {
            return Vec::new();
        }

        match self.knowledge.retrieve_default(input).await {
            Ok(result) => {
                debug!(hits = result.hits.len(), "Retrieved knowledge context");
                trace.retrieved_node_ids = result.node_ids();
                ContextSnippet::from_retrieval(&result)
            }
            Err(e) => {
                debug!(error = %e, "Retrieval skipped");
                trace.diagnostics.push(format!("retrieval skipped: {}", e));
                Vec::new()
            }
        }
    }

    /// The bounded reasoning loop. Returns the answer text; the caller
    /// appends it to history.
    async fn reason(
        &self,
        state: &mut SessionState,
        retrieved: &[ContextSnippet],
        trace: &mut TurnTrace,
    ) -> String {
        let mut guard = LoopGuard::new(self.session.loop_guard_repeats);
        let capabilities = self.registry.specs();

        for iteration in 1..=self.session.max_iterations {
            let context = OracleContext {
                history: window(&state.history, self.session.history_cap),
                retrieved: retrieved.to_vec(),
                facts: state.facts(),
                capabilities: capabilities.clone(),
                calls_this_turn: trace.calls.clone(),
            };

            let decision = match self.consult(&context, trace).await {
                Some(decision) => decision,
                None => {
                    trace.outcome = TurnOutcome::OracleUnavailable;
                    return APOLOGY.to_string();
                }
            };
            trace.iterations = iteration;

            match decision {
                Decision::Answer(text) => {
                    trace.outcome = TurnOutcome::Completed;
                    let text = text.trim();
                    if text.is_empty() {
                        trace.diagnostics.push("oracle returned an empty answer".to_string());
                        return FALLBACK_ANSWER.to_string();
                    }
                    return text.to_string();
                }
                Decision::CallCapabilities(requests) if requests.is_empty() => {
                    trace.diagnostics.push(format!(
                        "iteration {}: oracle requested an empty call batch",
                        iteration
                    ));
                }
                Decision::CallCapabilities(requests) => {
                    let batch = requests.iter().map(|r| (r.name.as_str(), &r.params));
                    if let Err(signature) = guard.admit(batch) {
                        warn!(
                            session_id = %state.session_id,
                            iteration,
                            signature = %signature,
                            "Loop guard tripped"
                        );
                        trace.outcome = TurnOutcome::LoopDetected;
                        trace.diagnostics.push(format!("repeated call {}", signature));
                        return FALLBACK_ANSWER.to_string();
                    }

                    self.dispatch(state, requests, trace).await;
                    state.iteration_count += 1;
                }
            }
        }

        warn!(
            session_id = %state.session_id,
            max_iterations = self.session.max_iterations,
            "Iteration bound reached"
        );
        trace.outcome = TurnOutcome::IterationExceeded;
        FALLBACK_ANSWER.to_string()
    }

    /// Ask the oracle, retrying with bounded backoff
    async fn consult(&self, context: &OracleContext, trace: &mut TurnTrace) -> Option<Decision> {
        for attempt in 1..=self.retry.max_attempts {
            trace.oracle_attempts += 1;

            match self.oracle.decide(context).await {
                Ok(decision) => return Some(decision),
                Err(e) => {
                    warn!(oracle = self.oracle.name(), attempt, error = %e, "Oracle call failed");
                    trace.diagnostics.push(format!("oracle attempt {}: {}", attempt, e));
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                    }
                }
            }
        }
        None
    }

    /// Append the call group, then run each call in order so later calls
    /// see what earlier ones taught the session.
    async fn dispatch(
        &self,
        state: &mut SessionState,
        requests: Vec<CapabilityRequest>,
        trace: &mut TurnTrace,
    ) {
        let calls: Vec<CallDescriptor> = requests
            .into_iter()
            .map(|r| CallDescriptor {
                call_id: Uuid::new_v4().to_string(),
                name: r.name,
                params: r.params,
            })
            .collect();

        state.history.push(Message::assistant_calls(calls.clone()));

        for call in calls {
            let start = Instant::now();

            let outcome = match ground_identity(state, &call) {
                Ok(()) => self.registry.invoke(&call.name, &call.params).await,
                Err(e) => Err(e),
            };

            let elapsed_ms = start.elapsed().as_millis() as u64;
            let (content, record) = match outcome {
                Ok(outcome) => {
                    debug!(
                        capability = %call.name,
                        degraded = outcome.degraded,
                        elapsed_ms,
                        "Capability call succeeded"
                    );
                    let content = json!({
                        "ok": true,
                        "degraded": outcome.degraded,
                        "data": outcome.data,
                    });
                    let record = CapabilityCallRecord {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        params: call.params.clone(),
                        success: true,
                        result: outcome.data,
                        error: None,
                        degraded: outcome.degraded,
                        timestamp: Utc::now(),
                        elapsed_ms,
                    };
                    (content, record)
                }
                Err(e) => {
                    warn!(capability = %call.name, error = %e, "Capability call failed");
                    let content = json!({ "ok": false, "error": e.to_string() });
                    let record = CapabilityCallRecord {
                        call_id: call.call_id.clone(),
                        name: call.name.clone(),
                        params: call.params.clone(),
                        success: false,
                        result: Value::Null,
                        error: Some(e.to_string()),
                        degraded: false,
                        timestamp: Utc::now(),
                        elapsed_ms,
                    };
                    (content, record)
                }
            };

            absorb_result(state, &record);
            state
                .history
                .push(Message::capability_result(call.call_id, content.to_string()));
            trace.calls.push(record);
        }
    }
}

/// Order ids and process intents mentioned by the user
fn absorb_input(state: &mut SessionState, input: &str) {
    let signals = extract::analyze(input);

    if let Some(order_id) = signals.order_id {
        if state.remembered_order_id.as_deref() != Some(order_id.as_str()) {
            debug!(session_id = %state.session_id, order_id = %order_id, "Remembering order id");
            // the lookup email belonged to the previous order
            state.lookup_email = None;
            state.remembered_order_id = Some(order_id);
        }
    }

    if signals.cancel {
        if let Some(process) = &state.active_process {
            debug!(session_id = %state.session_id, process = %process.kind, "Process cancelled");
        }
        state.clear_process();
    } else if let Some(kind) = signals.process {
        state.start_process(kind);
    }
}

/// Verification may only target an email the session learned from a
/// capability result. Implausible emails are left to parameter validation.
fn ground_identity(state: &SessionState, call: &CallDescriptor) -> std::result::Result<(), CapabilityError> {
    if call.name != ISSUE_VERIFICATION_CODE && call.name != VALIDATE_VERIFICATION_CODE {
        return Ok(());
    }

    let email = call.params.get("email").and_then(Value::as_str).unwrap_or_default();
    if is_plausible_email(email) && !state.knows_email(email) {
        return Err(CapabilityError::new(
            call.name.as_str(),
            "email is not grounded in a lookup result",
        ));
    }
    Ok(())
}

/// Copy the authoritative parts of a successful result into the session
fn absorb_result(state: &mut SessionState, record: &CapabilityCallRecord) {
    if !record.success {
        return;
    }

    let result_str = |key: &str| record.result.get(key).and_then(Value::as_str);
    let param_email = record
        .params
        .get("email")
        .and_then(Value::as_str)
        .map(|e| e.trim().to_lowercase());

    match record.name.as_str() {
        ORDER_LOOKUP => {
            if let Some(order_id) = result_str("order_id").and_then(extract::normalize_order_id) {
                state.remembered_order_id = Some(order_id);
            }
            if let Some(email) = result_str("customer_email") {
                state.lookup_email = Some(email.to_lowercase());
            }
        }
        ACCOUNT_LOOKUP => {
            if let Some(account_id) = result_str("account_id") {
                state.remembered_account_id = Some(account_id.to_string());
            }
            if let Some(email) = result_str("email") {
                state.lookup_email = Some(email.to_lowercase());
            }
        }
        ISSUE_VERIFICATION_CODE => {
            let resume = state
                .active_process
                .as_ref()
                .map(|p| p.kind)
                .filter(|kind| *kind != ProcessKind::Verification)
                .or_else(|| resumed_process(state));

            let mut process = ActiveProcess::new(ProcessKind::Verification);
            if let Some(email) = param_email {
                process.data.insert("email".to_string(), json!(email));
            }
            if let Some(kind) = resume {
                process.data.insert("resume".to_string(), json!(kind));
            }
            state.active_process = Some(process);
        }
        VALIDATE_VERIFICATION_CODE => {
            let verified = record
                .result
                .get("verified")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if verified {
                info!(session_id = %state.session_id, "Identity verified");
                state.verified_email = param_email;
                state.active_process = resumed_process(state).map(ActiveProcess::new);
            }
        }
        _ => {}
    }
}

/// Process that a pending verification interrupted
fn resumed_process(state: &SessionState) -> Option<ProcessKind> {
    state
        .active_process
        .as_ref()
        .filter(|p| p.kind == ProcessKind::Verification)
        .and_then(|p| p.data.get("resume"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

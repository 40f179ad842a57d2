use super::*;
use crate::capabilities::verification::code_from_message;
use crate::capabilities::{create_default_registry, InMemoryDirectory, OutboxChannel};
use crate::knowledge::builder::tests::sample_kb;
use crate::knowledge::KnowledgeGraph;
use crate::oracle::{RuleBasedOracle, ScriptStep, ScriptedOracle};
use crate::state::InMemoryStateStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.oracle_retry.initial_backoff = Duration::from_millis(1);
    config.oracle_retry.max_backoff = Duration::from_millis(2);
    config
}

struct Harness {
    orchestrator: Orchestrator,
    outbox: Arc<OutboxChannel>,
}

async fn harness(
    oracle: Arc<dyn DecisionOracle>,
    config: AgentConfig,
    store: Arc<dyn StateStore>,
) -> Harness {
    let outbox = Arc::new(OutboxChannel::new());
    let registry = create_default_registry(
        &config,
        Arc::new(InMemoryDirectory::with_demo_data()),
        Arc::clone(&outbox),
    );
    let knowledge = Arc::new(KnowledgeIndex::new(
        config.graph.clone(),
        config.retrieval.clone(),
        Arc::new(InMemoryStateStore::new()),
    ));
    knowledge.rebuild(&sample_kb()).await.unwrap();

    Harness {
        orchestrator: Orchestrator::new(&config, oracle, Arc::new(registry), knowledge, store),
        outbox,
    }
}

fn call(name: &str, params: Value) -> Decision {
    Decision::CallCapabilities(vec![CapabilityRequest::new(name, params)])
}

fn answer(text: &str) -> Decision {
    Decision::Answer(text.to_string())
}

/// Oracle backed by a closure over the context
struct FnOracle<F>(F);

#[async_trait]
impl<F> DecisionOracle for FnOracle<F>
where
    F: Fn(&OracleContext) -> Result<Decision> + Send + Sync,
{
    fn name(&self) -> &'static str {
        "fn"
    }

    async fn decide(&self, context: &OracleContext) -> Result<Decision> {
        (self.0)(context)
    }
}

/// Stalls on its first consultation, answers afterwards
struct StallingOracle {
    stalled: AtomicBool,
}

#[async_trait]
impl DecisionOracle for StallingOracle {
    fn name(&self) -> &'static str {
        "stalling"
    }

    async fn decide(&self, _context: &OracleContext) -> Result<Decision> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(answer("Back again."))
    }
}

/// Loads nothing, refuses every session write
struct ReadOnlyStore;

#[async_trait]
impl StateStore for ReadOnlyStore {
    async fn load_session(&self, _session_id: &str) -> Result<Option<SessionState>> {
        Ok(None)
    }

    async fn save_session(&self, _state: &SessionState) -> Result<()> {
        Err(OrchestrationError::State("store is read-only".to_string()))
    }

    async fn delete_session(&self, _session_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn evict_idle(&self, _max_idle: chrono::Duration) -> Result<usize> {
        Ok(0)
    }

    async fn save_graph_snapshot(&self, _graph: &KnowledgeGraph) -> Result<()> {
        Ok(())
    }

    async fn load_graph_snapshot(&self) -> Result<Option<KnowledgeGraph>> {
        Ok(None)
    }
}

fn call_names(response: &TurnResponse) -> Vec<&str> {
    response.trace.calls.iter().map(|c| c.name.as_str()).collect()
}

#[tokio::test]
async fn test_return_policy_is_top_hit() {
    let h = harness(
        Arc::new(ScriptedOracle::decisions(vec![])),
        test_config(),
        Arc::new(InMemoryStateStore::new()),
    )
    .await;

    let result = h
        .orchestrator
        .knowledge()
        .retrieve("what is your return policy", 1, 2)
        .await
        .unwrap();
    assert_eq!(result.node_ids(), vec!["return_policy".to_string()]);
}

#[tokio::test]
async fn test_policy_question_answered_from_retrieved_context() {
    let h = harness(
        Arc::new(RuleBasedOracle::new()),
        test_config(),
        Arc::new(InMemoryStateStore::new()),
    )
    .await;

    let response = h
        .orchestrator
        .handle_turn("s1", "How long does shipping take?")
        .await;
    assert_eq!(response.trace.outcome, TurnOutcome::Completed);
    assert_eq!(response.trace.retrieved_node_ids[0], "shipping_policy");
    assert!(response.answer.starts_with("Shipping Policy:"));
    assert!(response.trace.calls.is_empty());
}

#[tokio::test]
async fn test_tracking_flow_verifies_before_revealing_status() {
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(Arc::new(RuleBasedOracle::new()), test_config(), store.clone()).await;

    let first = h
        .orchestrator
        .handle_turn("s1", "Where is my order ORD-12345?")
        .await;
    assert_eq!(first.trace.outcome, TurnOutcome::Completed);
    assert_eq!(call_names(&first), vec![ORDER_LOOKUP, ISSUE_VERIFICATION_CODE]);
    // support API is not configured, the directory answered
    assert!(first.trace.calls[0].degraded);
    assert!(first.answer.contains("j***@example.com"));
    assert!(!first.answer.contains("shipped"));

    let sent = h.outbox.last_for("jane.doe@example.com").await.unwrap();
    let code = code_from_message(&sent.body).unwrap();

    let second = h.orchestrator.handle_turn("s1", &code).await;
    assert_eq!(call_names(&second), vec![VALIDATE_VERIFICATION_CODE, ORDER_LOOKUP]);
    assert_eq!(
        second.answer,
        "Your order ORD-12345 is shipped. Carrier: UPS. Tracking number: 1Z999AA10123456784. Estimated delivery: 2024-06-14."
    );

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(state.verified_email.as_deref(), Some("jane.doe@example.com"));
    assert_eq!(
        state.active_process.map(|p| p.kind),
        Some(ProcessKind::Tracking)
    );
    assert_eq!(state.turn_count, 2);
}

#[tokio::test]
async fn test_wrong_code_is_not_verified() {
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(Arc::new(RuleBasedOracle::new()), test_config(), store.clone()).await;

    h.orchestrator.handle_turn("s1", "track ORD-12345").await;
    let sent = h.outbox.last_for("jane.doe@example.com").await.unwrap();
    let code = code_from_message(&sent.body).unwrap();
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let response = h.orchestrator.handle_turn("s1", wrong).await;
    assert_eq!(call_names(&response), vec![VALIDATE_VERIFICATION_CODE]);
    assert!(response.answer.contains("doesn't match"));

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert!(state.verified_email.is_none());
}

#[tokio::test]
async fn test_verification_email_comes_from_lookup() {
    let oracle = Arc::new(ScriptedOracle::decisions(vec![
        call(ORDER_LOOKUP, json!({"order_id": "ORD-12345"})),
        call(ISSUE_VERIFICATION_CODE, json!({"email": "jane.doe@example.com"})),
        answer("I've sent you a code."),
    ]));
    let h = harness(oracle, test_config(), Arc::new(InMemoryStateStore::new())).await;

    let response = h.orchestrator.handle_turn("s1", "where is ORD-12345").await;
    assert!(response.trace.calls.iter().all(|c| c.success));
    assert_eq!(h.outbox.sent().await.len(), 1);
}

#[tokio::test]
async fn test_empty_verification_email_is_capability_error() {
    let oracle = Arc::new(ScriptedOracle::decisions(vec![
        call(ORDER_LOOKUP, json!({"order_id": "ORD-12345"})),
        call(ISSUE_VERIFICATION_CODE, json!({"email": ""})),
        answer("Sorry, something went wrong."),
    ]));
    let h = harness(oracle, test_config(), Arc::new(InMemoryStateStore::new())).await;

    let response = h.orchestrator.handle_turn("s1", "where is ORD-12345").await;
    assert_eq!(response.trace.outcome, TurnOutcome::Completed);

    let issue = &response.trace.calls[1];
    assert!(!issue.success);
    assert!(issue.error.as_deref().unwrap().contains("invalid parameters"));
    assert!(h.outbox.sent().await.is_empty());
}

#[tokio::test]
async fn test_fabricated_verification_email_is_rejected() {
    let oracle = Arc::new(ScriptedOracle::decisions(vec![
        call(ORDER_LOOKUP, json!({"order_id": "ORD-12345"})),
        call(ISSUE_VERIFICATION_CODE, json!({"email": "someone.else@example.com"})),
        answer("Sorry, something went wrong."),
    ]));
    let h = harness(oracle.clone(), test_config(), Arc::new(InMemoryStateStore::new())).await;

    let response = h.orchestrator.handle_turn("s1", "where is ORD-12345").await;
    let issue = &response.trace.calls[1];
    assert!(!issue.success);
    assert!(issue.error.as_deref().unwrap().contains("not grounded"));
    assert!(h.outbox.sent().await.is_empty());

    // the failure reached the oracle as a paired result
    let last = &oracle.contexts()[2];
    assert_eq!(last.calls_this_turn.len(), 2);
    assert!(is_well_paired(&last.history));
}

#[tokio::test]
async fn test_follow_up_sees_remembered_order() {
    let oracle = Arc::new(ScriptedOracle::decisions(vec![
        answer("Let me look into that."),
        answer("Sure, let's start a return."),
    ]));
    let h = harness(oracle.clone(), test_config(), Arc::new(InMemoryStateStore::new())).await;

    h.orchestrator.handle_turn("s1", "Where is my order ORD-12345?").await;
    h.orchestrator.handle_turn("s1", "return this").await;

    let contexts = oracle.contexts();
    assert_eq!(contexts.len(), 2);
    let facts = &contexts[1].facts;
    assert_eq!(facts.order_id.as_deref(), Some("ORD-12345"));
    assert_eq!(facts.active_process, Some(ProcessKind::Return));
    assert_eq!(contexts[1].latest_user_input(), Some("return this"));
}

#[tokio::test]
async fn test_repeated_call_trips_loop_guard() {
    let oracle = Arc::new(ScriptedOracle::repeating(call(
        ORDER_LOOKUP,
        json!({"order_id": "ORD-12345"}),
    )));
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(oracle.clone(), test_config(), store.clone()).await;

    let response = h.orchestrator.handle_turn("s1", "where is ORD-12345").await;
    assert_eq!(response.trace.outcome, TurnOutcome::LoopDetected);
    assert!(!response.answer.is_empty());
    assert_eq!(response.trace.calls.len(), 2);
    assert_eq!(oracle.consultations(), 3);

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert!(is_well_paired(&state.history));
}

#[tokio::test]
async fn test_iteration_bound_forces_fallback() {
    let mut config = test_config();
    config.session.max_iterations = 4;
    // a different order each time, so the loop guard never trips
    let oracle = Arc::new(FnOracle(|ctx: &OracleContext| -> Result<Decision> {
        Ok(call(
            ORDER_LOOKUP,
            json!({ "order_id": format!("ORD-{}", 100 + ctx.calls_this_turn.len()) }),
        ))
    }));
    let h = harness(oracle, config, Arc::new(InMemoryStateStore::new())).await;

    let response = h.orchestrator.handle_turn("s1", "find my orders").await;
    assert_eq!(response.trace.outcome, TurnOutcome::IterationExceeded);
    assert_eq!(response.trace.iterations, 4);
    assert_eq!(response.trace.calls.len(), 4);
    assert_eq!(response.answer, FALLBACK_ANSWER);
}

#[tokio::test]
async fn test_history_stays_bounded_and_paired() {
    let mut config = test_config();
    config.session.history_cap = 12;
    let oracle = Arc::new(FnOracle(|ctx: &OracleContext| -> Result<Decision> {
        if ctx.calls_this_turn.is_empty() {
            Ok(call(ORDER_LOOKUP, json!({"order_id": "ORD-12345"})))
        } else {
            Ok(answer("Your order is on its way."))
        }
    }));
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(oracle, config, store.clone()).await;

    for i in 0..500 {
        h.orchestrator
            .handle_turn("s1", &format!("status update {}", i))
            .await;
        let state = store.load_session("s1").await.unwrap().unwrap();
        assert!(state.history.len() <= 12);
        assert!(is_well_paired(&state.history));
    }

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(state.turn_count, 500);
    assert_eq!(state.iteration_count, 500);
}

#[tokio::test]
async fn test_oracle_retried_then_answers() {
    let oracle = Arc::new(ScriptedOracle::new(vec![
        ScriptStep::Unavailable("503".to_string()),
        ScriptStep::Decide(answer("Hello! How can I help?")),
    ]));
    let h = harness(oracle, test_config(), Arc::new(InMemoryStateStore::new())).await;

    let response = h.orchestrator.handle_turn("s1", "hi").await;
    assert_eq!(response.answer, "Hello! How can I help?");
    assert_eq!(response.trace.outcome, TurnOutcome::Completed);
    assert_eq!(response.trace.oracle_attempts, 2);
    assert!(!response.answer.contains("503"));
}

#[tokio::test]
async fn test_oracle_down_apologizes_and_keeps_state() {
    let oracle = Arc::new(ScriptedOracle::new(vec![
        ScriptStep::Unavailable("down".to_string()),
        ScriptStep::Unavailable("down".to_string()),
        ScriptStep::Unavailable("down".to_string()),
    ]));
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(oracle, test_config(), store.clone()).await;

    let response = h.orchestrator.handle_turn("s1", "track ORD-12345").await;
    assert_eq!(response.answer, APOLOGY);
    assert_eq!(response.trace.outcome, TurnOutcome::OracleUnavailable);
    assert_eq!(response.trace.oracle_attempts, 3);

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-12345"));
    assert_eq!(state.history[0].content, "track ORD-12345");
}

#[tokio::test]
async fn test_corrupt_session_starts_fresh() {
    let store = Arc::new(InMemoryStateStore::new());
    store.insert_raw("s1", "{ not json").await;
    let h = harness(
        Arc::new(ScriptedOracle::decisions(vec![answer("Hi there.")])),
        test_config(),
        store.clone(),
    )
    .await;

    let response = h.orchestrator.handle_turn("s1", "hello").await;
    assert_eq!(response.trace.outcome, TurnOutcome::Completed);
    assert!(response.trace.diagnostics.iter().any(|d| d.contains("corrupt")));

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(state.turn_count, 1);
    assert_eq!(state.history.len(), 2);
}

#[tokio::test]
async fn test_persistence_failure_aborts_turn() {
    let h = harness(
        Arc::new(ScriptedOracle::decisions(vec![answer("Saved?")])),
        test_config(),
        Arc::new(ReadOnlyStore),
    )
    .await;

    let response = h.orchestrator.handle_turn("s1", "hello").await;
    assert_eq!(response.trace.outcome, TurnOutcome::Aborted);
    assert_eq!(response.answer, APOLOGY);
    assert!(!response.answer.contains("read-only"));
    assert!(response.trace.diagnostics.iter().any(|d| d.contains("read-only")));
}

#[tokio::test]
async fn test_cancelled_turn_releases_lock_and_persists_nothing() {
    let oracle = Arc::new(StallingOracle {
        stalled: AtomicBool::new(false),
    });
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(oracle, test_config(), store.clone()).await;

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        h.orchestrator.handle_turn("s1", "hello"),
    )
    .await;
    assert!(cancelled.is_err());
    assert!(store.load_session("s1").await.unwrap().is_none());

    let response = h.orchestrator.handle_turn("s1", "hello again").await;
    assert_eq!(response.answer, "Back again.");
    let state = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(state.turn_count, 1);
}

#[tokio::test]
async fn test_same_session_turns_do_not_lose_updates() {
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(
        Arc::new(ScriptedOracle::repeating(answer("ok"))),
        test_config(),
        store.clone(),
    )
    .await;

    tokio::join!(
        h.orchestrator.handle_turn("s1", "first"),
        h.orchestrator.handle_turn("s1", "second"),
        h.orchestrator.handle_turn("s2", "other"),
    );

    let state = store.load_session("s1").await.unwrap().unwrap();
    assert_eq!(state.turn_count, 2);
    assert_eq!(state.history.len(), 4);
}

#[tokio::test]
async fn test_end_session_deletes_state() {
    let store = Arc::new(InMemoryStateStore::new());
    let h = harness(
        Arc::new(ScriptedOracle::repeating(answer("ok"))),
        test_config(),
        store.clone(),
    )
    .await;

    h.orchestrator.handle_turn("s1", "hello").await;
    assert!(h.orchestrator.end_session("s1").await.unwrap());
    assert!(h.orchestrator.session("s1").await.unwrap().is_none());
    assert!(!h.orchestrator.end_session("s1").await.unwrap());
}

#[tokio::test]
async fn test_turns_are_audited() {
    let h = harness(
        Arc::new(ScriptedOracle::repeating(answer("ok"))),
        test_config(),
        Arc::new(InMemoryStateStore::new()),
    )
    .await;

    let response = h.orchestrator.handle_turn("s1", "hello").await;
    let audit = h.orchestrator.audit();
    assert_eq!(audit.list_for_session("s1").await, vec![response.trace.turn_id]);
    assert!(audit.verify_integrity(response.trace.turn_id).await);
}

#[test]
fn test_cancellation_clears_process() {
    let mut state = SessionState::new("s1");
    absorb_input(&mut state, "I want to return ORD-12345");
    assert_eq!(state.active_process.as_ref().map(|p| p.kind), Some(ProcessKind::Return));
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-12345"));

    absorb_input(&mut state, "actually, never mind");
    assert!(state.active_process.is_none());
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-12345"));
}

#[test]
fn test_cancel_order_request_keeps_refund_process() {
    let mut state = SessionState::new("s1");
    absorb_input(&mut state, "can I cancel my order ORD-1 and get a refund");
    assert_eq!(state.active_process.as_ref().map(|p| p.kind), Some(ProcessKind::Refund));
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-1"));
}

#[test]
fn test_spelled_out_order_number_is_remembered() {
    let mut state = SessionState::new("s1");
    absorb_input(&mut state, "track ORD-12345");
    state.lookup_email = Some("jane.doe@example.com".to_string());

    absorb_input(&mut state, "see RECORD5 in my notes");
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-12345"));
    assert!(state.lookup_email.is_some());

    absorb_input(&mut state, "my order number is 67890");
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-67890"));
    assert!(state.lookup_email.is_none());
}

#[test]
fn test_new_order_forgets_lookup_email() {
    let mut state = SessionState::new("s1");
    absorb_input(&mut state, "track ORD-12345");
    state.lookup_email = Some("jane.doe@example.com".to_string());

    absorb_input(&mut state, "and ORD-12345 again");
    assert!(state.lookup_email.is_some());

    absorb_input(&mut state, "what about ord_67890");
    assert_eq!(state.remembered_order_id.as_deref(), Some("ORD-67890"));
    assert!(state.lookup_email.is_none());
}

#[test]
fn test_validation_resumes_interrupted_process() {
    let mut state = SessionState::new("s1");
    state.start_process(ProcessKind::Tracking);

    let mut record = CapabilityCallRecord {
        call_id: "c1".to_string(),
        name: ISSUE_VERIFICATION_CODE.to_string(),
        params: json!({"email": "Jane.Doe@example.com"}),
        success: true,
        result: json!({"acknowledged": true, "expires_in_secs": 300}),
        error: None,
        degraded: false,
        timestamp: Utc::now(),
        elapsed_ms: 1,
    };
    absorb_result(&mut state, &record);
    assert_eq!(
        state.facts().pending_verification_email.as_deref(),
        Some("jane.doe@example.com")
    );

    record.name = VALIDATE_VERIFICATION_CODE.to_string();
    record.result = json!({"verified": true, "reason": "verified"});
    absorb_result(&mut state, &record);
    assert_eq!(state.verified_email.as_deref(), Some("jane.doe@example.com"));
    assert_eq!(state.active_process.map(|p| p.kind), Some(ProcessKind::Tracking));
}

//! Deterministic oracle for offline use
//!
//! Drives the order tracking flow (lookup, verification code, validation,
//! status) and answers policy questions from retrieved snippets. It only
//! reads the context it is given, like any other oracle.

use crate::agent::extract;
use crate::capabilities::{
    ACCOUNT_LOOKUP, ISSUE_VERIFICATION_CODE, ORDER_LOOKUP, SEND_NOTIFICATION, VALIDATE_VERIFICATION_CODE,
};
use crate::models::CapabilityCallRecord;
use crate::oracle::{CapabilityRequest, Decision, DecisionOracle, OracleContext};
use crate::session::ProcessKind;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub const ASK_FOR_ORDER_NUMBER: &str =
    "Yes, I can help you track your order! Can you please share your order number?";

#[derive(Debug, Default)]
pub struct RuleBasedOracle;

impl RuleBasedOracle {
    pub fn new() -> Self {
        Self
    }
}

fn call(name: &str, params: Value) -> Decision {
    Decision::CallCapabilities(vec![CapabilityRequest::new(name, params)])
}

fn answer(text: impl Into<String>) -> Decision {
    Decision::Answer(text.into())
}

/// `j***@example.com`
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@{}", first, domain)
        }
        None => "your email".to_string(),
    }
}

fn data_str<'a>(record: &'a CapabilityCallRecord, key: &str) -> Option<&'a str> {
    record.result.get(key).and_then(Value::as_str)
}

fn same_email(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn order_summary(record: &CapabilityCallRecord) -> String {
    let order_id = data_str(record, "order_id").unwrap_or("your order");
    let status = data_str(record, "status").unwrap_or("being processed");
    let mut text = format!("Your order {} is {}.", order_id, status);

    if let Some(carrier) = data_str(record, "carrier") {
        text.push_str(&format!(" Carrier: {}.", carrier));
    }
    if let Some(tracking) = data_str(record, "tracking_number") {
        text.push_str(&format!(" Tracking number: {}.", tracking));
    }
    if let Some(eta) = data_str(record, "estimated_delivery") {
        text.push_str(&format!(" Estimated delivery: {}.", eta));
    }
    text
}

impl RuleBasedOracle {
    /// React to the most recent capability result of this turn
    fn after_call(&self, context: &OracleContext, last: &CapabilityCallRecord) -> Decision {
        let facts = &context.facts;

        match (last.name.as_str(), last.success) {
            (ORDER_LOOKUP, true) => {
                let customer_email = data_str(last, "customer_email");
                if same_email(customer_email, facts.verified_email.as_deref()) {
                    return answer(order_summary(last));
                }
                match facts.lookup_email.as_deref() {
                    Some(email) => call(
                        ISSUE_VERIFICATION_CODE,
                        json!({"email": email, "purpose": "order tracking"}),
                    ),
                    None => answer(
                        "I found the order but couldn't confirm the email on file. Please contact support.",
                    ),
                }
            }
            (ORDER_LOOKUP, false) => answer(
                "I couldn't find that order. Could you double-check the order number?",
            ),
            (ISSUE_VERIFICATION_CODE, true) => {
                let email = last
                    .params
                    .get("email")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                answer(format!(
                    "For your security, I've sent a 6-digit verification code to {}. Please reply with the code to continue.",
                    mask_email(email)
                ))
            }
            (ISSUE_VERIFICATION_CODE, false) => answer(
                "I wasn't able to send a verification code right now. Please try again in a moment.",
            ),
            (VALIDATE_VERIFICATION_CODE, true) => {
                let verified = last.result.get("verified").and_then(Value::as_bool).unwrap_or(false);
                if verified {
                    return match &facts.order_id {
                        Some(order_id) => call(ORDER_LOOKUP, json!({ "order_id": order_id })),
                        None => answer("Thanks, you're verified. How can I help you?"),
                    };
                }
                match data_str(last, "reason") {
                    Some("expired") => answer(
                        "That code has expired. Ask me to track your order again and I'll send a new one.",
                    ),
                    Some("no_code_issued") => answer(
                        "I don't have an active code for you. Share your order number and I'll send one.",
                    ),
                    _ => answer("That code doesn't match. Please check it and try again."),
                }
            }
            (VALIDATE_VERIFICATION_CODE, false) => {
                answer("I couldn't check that code right now. Please try again in a moment.")
            }
            (ACCOUNT_LOOKUP, true) => answer(format!(
                "I found your account ({} tier). What would you like to do?",
                data_str(last, "tier").unwrap_or("standard")
            )),
            (SEND_NOTIFICATION, true) => answer("Done, I've sent you a notification."),
            _ => answer("Sorry, I couldn't complete that just now. Is there anything else I can help with?"),
        }
    }

    fn from_input(&self, context: &OracleContext, input: &str) -> Decision {
        let facts = &context.facts;

        if extract::is_cancellation(input) {
            return answer("No problem, I've stopped that. Is there anything else I can help with?");
        }

        if let (Some(email), Some(code)) = (
            facts.pending_verification_email.as_deref(),
            extract::find_verification_code(input),
        ) {
            return call(VALIDATE_VERIFICATION_CODE, json!({"email": email, "code": code}));
        }

        let policy_hint = context
            .retrieved
            .first()
            .map(|s| format!(" {}", s.content))
            .unwrap_or_default();

        match facts.active_process {
            Some(ProcessKind::Tracking) | Some(ProcessKind::Verification) => match &facts.order_id {
                Some(order_id) => call(ORDER_LOOKUP, json!({ "order_id": order_id })),
                None => answer(ASK_FOR_ORDER_NUMBER),
            },
            Some(kind @ (ProcessKind::Return | ProcessKind::Refund | ProcessKind::Replacement)) => {
                match &facts.order_id {
                    Some(order_id) => answer(format!(
                        "I can help you with a {} for order {}.{}",
                        kind, order_id, policy_hint
                    )),
                    None => answer(format!(
                        "I can help you with a {}. Which order is it for? Please share the order number.{}",
                        kind, policy_hint
                    )),
                }
            }
            None => match context.retrieved.first() {
                Some(snippet) => answer(format!("{}: {}", snippet.label, snippet.content)),
                None => answer(
                    "I can help with orders, returns, refunds and shipping. Could you tell me a bit more about what you need?",
                ),
            },
        }
    }
}

#[async_trait]
impl DecisionOracle for RuleBasedOracle {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn decide(&self, context: &OracleContext) -> Result<Decision> {
        if let Some(last) = context.last_call() {
            return Ok(self.after_call(context, last));
        }
        let input = context.latest_user_input().unwrap_or_default();
        Ok(self.from_input(context, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::oracle::ContextSnippet;
    use crate::session::RememberedFacts;
    use chrono::Utc;

    fn context(input: &str, facts: RememberedFacts) -> OracleContext {
        OracleContext {
            history: vec![Message::user(input)],
            retrieved: Vec::new(),
            facts,
            capabilities: Vec::new(),
            calls_this_turn: Vec::new(),
        }
    }

    fn record(name: &str, params: Value, result: Value) -> CapabilityCallRecord {
        CapabilityCallRecord {
            call_id: "c1".to_string(),
            name: name.to_string(),
            params,
            success: true,
            result,
            error: None,
            degraded: false,
            timestamp: Utc::now(),
            elapsed_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_tracking_without_order_asks_for_it() {
        let facts = RememberedFacts {
            active_process: Some(ProcessKind::Tracking),
            ..RememberedFacts::default()
        };
        let decision = RuleBasedOracle.decide(&context("track my order", facts)).await.unwrap();
        assert_eq!(decision, Decision::Answer(ASK_FOR_ORDER_NUMBER.to_string()));
    }

    #[tokio::test]
    async fn test_unverified_lookup_requests_code_for_lookup_email() {
        let facts = RememberedFacts {
            order_id: Some("ORD-12345".to_string()),
            lookup_email: Some("jane.doe@example.com".to_string()),
            active_process: Some(ProcessKind::Tracking),
            ..RememberedFacts::default()
        };
        let mut ctx = context("where is ORD-12345", facts);
        ctx.calls_this_turn.push(record(
            ORDER_LOOKUP,
            json!({"order_id": "ORD-12345"}),
            json!({"order_id": "ORD-12345", "status": "shipped", "customer_email": "jane.doe@example.com"}),
        ));

        match RuleBasedOracle.decide(&ctx).await.unwrap() {
            Decision::CallCapabilities(requests) => {
                assert_eq!(requests[0].name, ISSUE_VERIFICATION_CODE);
                assert_eq!(requests[0].params["email"], "jane.doe@example.com");
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verified_lookup_answers_with_status() {
        let facts = RememberedFacts {
            verified_email: Some("jane.doe@example.com".to_string()),
            ..RememberedFacts::default()
        };
        let mut ctx = context("123456", facts);
        ctx.calls_this_turn.push(record(
            ORDER_LOOKUP,
            json!({"order_id": "ORD-12345"}),
            json!({"order_id": "ORD-12345", "status": "shipped", "customer_email": "jane.doe@example.com", "carrier": "UPS"}),
        ));

        let decision = RuleBasedOracle.decide(&ctx).await.unwrap();
        assert_eq!(
            decision,
            Decision::Answer("Your order ORD-12345 is shipped. Carrier: UPS.".to_string())
        );
    }

    #[tokio::test]
    async fn test_policy_question_uses_top_snippet() {
        let mut ctx = context("what is your return policy", RememberedFacts::default());
        ctx.retrieved.push(ContextSnippet {
            node_id: "return_policy".to_string(),
            label: "Return Policy".to_string(),
            content: "Returns are accepted within 30 days.".to_string(),
            score: 1.0,
        });
        let decision = RuleBasedOracle.decide(&ctx).await.unwrap();
        assert_eq!(
            decision,
            Decision::Answer("Return Policy: Returns are accepted within 30 days.".to_string())
        );
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("jane.doe@example.com"), "j***@example.com");
    }
}

//! Gemini-backed decision oracle
//!
//! History maps onto Gemini contents: assistant call groups become
//! `functionCall` parts, capability results become `functionResponse`
//! parts. Any function call in the reply means a capability batch.

use crate::capabilities::CapabilitySpec;
use crate::error::OrchestrationError;
use crate::gemini::{Content, FunctionDeclaration, GeminiClient, GeminiRequest, GenerationConfig, Part, Tool};
use crate::models::{Message, MessageRole};
use crate::oracle::{CapabilityRequest, Decision, DecisionOracle, OracleContext};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

const SYSTEM_PROMPT: &str = r#"You are a customer-support assistant for an online store.

Rules:
- Use the available functions to look things up or act; never invent order details, emails or codes.
- Order details are shown only after the customer's email has been verified with a code.
- The email for verification must be the one returned by an order or account lookup.
- Remember the order number and process from earlier in the conversation.
- If the customer changes their mind mid-process, acknowledge it and adapt.
- Answer policy questions from the knowledge snippets when they are relevant.
- Keep replies short and friendly; do not mention internal tools or error details."#;

pub struct GeminiOracle {
    client: GeminiClient,
}

impl GeminiOracle {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key)?,
        })
    }

    pub fn from_client(client: GeminiClient) -> Self {
        Self { client }
    }

    fn system_instruction(context: &OracleContext) -> String {
        let facts = &context.facts;
        let mut prompt = String::from(SYSTEM_PROMPT);

        prompt.push_str("\n\n## Session\n");
        prompt.push_str(&format!(
            "Current order: {}\nCurrent process: {}\nEmail on file from lookup: {}\nVerified email: {}\n",
            facts.order_id.as_deref().unwrap_or("None"),
            facts
                .active_process
                .map(|p| p.to_string())
                .unwrap_or_else(|| "None".to_string()),
            facts.lookup_email.as_deref().unwrap_or("None"),
            facts.verified_email.as_deref().unwrap_or("None"),
        ));
        if let Some(pending) = &facts.pending_verification_email {
            prompt.push_str(&format!("A verification code was sent to {}.\n", pending));
        }

        if !context.retrieved.is_empty() {
            prompt.push_str("\n## Knowledge\n");
            for snippet in &context.retrieved {
                prompt.push_str(&format!("- {}: {}\n", snippet.label, snippet.content));
            }
        }

        prompt
    }

    fn declarations(specs: &[CapabilitySpec]) -> Vec<Tool> {
        if specs.is_empty() {
            return Vec::new();
        }
        vec![Tool {
            function_declarations: specs
                .iter()
                .map(|spec| FunctionDeclaration {
                    name: spec.name.to_string(),
                    description: spec.description.to_string(),
                    parameters: spec.parameters_schema(),
                })
                .collect(),
        }]
    }

    pub(crate) fn contents(history: &[Message]) -> Vec<Content> {
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut contents: Vec<Content> = Vec::new();

        for msg in history {
            let (role, part) = match msg.role {
                // system text goes into the system instruction
                MessageRole::System => continue,
                MessageRole::User => ("user", vec![Part::text(&msg.content)]),
                MessageRole::Assistant if msg.declares_calls() => {
                    for call in &msg.calls {
                        call_names.insert(call.call_id.as_str(), call.name.as_str());
                    }
                    (
                        "model",
                        msg.calls
                            .iter()
                            .map(|c| Part::call(&c.name, c.params.clone()))
                            .collect(),
                    )
                }
                MessageRole::Assistant => ("model", vec![Part::text(&msg.content)]),
                MessageRole::CapabilityResult => {
                    let name = msg
                        .call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id))
                        .copied()
                        .unwrap_or("unknown");
                    let response = serde_json::from_str::<Value>(&msg.content)
                        .unwrap_or_else(|_| json!({ "content": msg.content }));
                    ("user", vec![Part::response(name, response)])
                }
            };

            // consecutive function responses share one content block
            match contents.last_mut() {
                Some(last)
                    if msg.role == MessageRole::CapabilityResult
                        && last.role.as_deref() == Some(role)
                        && last.parts.iter().all(|p| p.function_response.is_some()) =>
                {
                    last.parts.extend(part)
                }
                _ => contents.push(Content::new(Some(role), part)),
            }
        }

        contents
    }

    pub(crate) fn decision_from_parts(parts: Vec<Part>) -> Result<Decision> {
        let mut requests = Vec::new();
        let mut text = String::new();

        for part in parts {
            if let Some(call) = part.function_call {
                let params = if call.args.is_null() { json!({}) } else { call.args };
                requests.push(CapabilityRequest::new(call.name, params));
            } else if let Some(t) = part.text {
                text.push_str(&t);
            }
        }

        if !requests.is_empty() {
            return Ok(Decision::CallCapabilities(requests));
        }
        if text.trim().is_empty() {
            return Err(OrchestrationError::OracleUnavailable(
                "Gemini returned neither text nor function calls".to_string(),
            ));
        }
        Ok(Decision::Answer(text.trim().to_string()))
    }
}

#[async_trait]
impl DecisionOracle for GeminiOracle {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn decide(&self, context: &OracleContext) -> Result<Decision> {
        let request = GeminiRequest {
            contents: Self::contents(&context.history),
            tools: Self::declarations(&context.capabilities),
            generation_config: GenerationConfig::default(),
            system_instruction: Content::new(None, vec![Part::text(Self::system_instruction(context))]),
        };

        let parts = self.client.generate(&request).await?;
        Self::decision_from_parts(parts)
    }
}

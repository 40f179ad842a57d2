//! Support Agent Orchestrator
//!
//! A customer-support agent that:
//! - Keeps per-session state (remembered order, process, verified identity)
//! - Retrieves policy context from a keyword-built knowledge graph
//! - Lets a decision oracle call capabilities with primary/fallback executors
//! - Bounds every turn by an iteration limit and a repeated-call guard
//! - Persists session state once, at the end of a turn
//!
//! TURN LOOP:
//! LOAD → PRUNE → RETRIEVE → (REASON → DISPATCH)* → RESPOND → PERSIST

pub mod agent;
pub mod api;
pub mod audit;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod gemini;
pub mod knowledge;
pub mod models;
pub mod oracle;
pub mod session;
pub mod state;

pub use error::Result;

// Re-export common types
pub use agent::Orchestrator;
pub use config::AgentConfig;
pub use models::*;

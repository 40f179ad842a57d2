//! Runtime configuration
//!
//! Every knob has a default; values come from the environment
//! (binaries load `.env` via `dotenv` first).

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Bounds for the reasoning loop and the history window
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of messages kept in a session's history
    pub history_cap: usize,
    /// Oracle consultations allowed per turn
    pub max_iterations: u32,
    /// How many times one (name, params) signature may be requested per turn
    pub loop_guard_repeats: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_cap: 40,
            max_iterations: 8,
            loop_guard_repeats: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub top_k: usize,
    pub max_depth: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            max_depth: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Jaccard overlap above which two nodes get a topical edge.
    /// Empirically tuned; there is no derivation behind 0.3.
    pub topical_threshold: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            topical_threshold: 0.3,
        }
    }
}

/// Bounded exponential backoff for oracle calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub session: SessionConfig,
    pub retrieval: RetrievalConfig,
    pub graph: GraphConfig,
    pub oracle_retry: RetryPolicy,
    pub capability_timeout: Duration,
    pub verification_code_ttl: Duration,
    pub knowledge_dir: PathBuf,
    /// JSON seed for the local account/order directory; demo data when unset
    pub directory_seed: Option<PathBuf>,
    pub gemini_api_key: String,
    pub database_url: Option<String>,
    pub support_api_base_url: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub api_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            retrieval: RetrievalConfig::default(),
            graph: GraphConfig::default(),
            oracle_retry: RetryPolicy::default(),
            capability_timeout: Duration::from_secs(5),
            verification_code_ttl: Duration::from_secs(300),
            knowledge_dir: PathBuf::from("data/knowledge"),
            directory_seed: None,
            gemini_api_key: String::new(),
            database_url: None,
            support_api_base_url: None,
            notify_webhook_url: None,
            api_port: 8080,
        }
    }
}

impl AgentConfig {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            session: SessionConfig {
                history_cap: parse_var("HISTORY_WINDOW", defaults.session.history_cap)?,
                max_iterations: parse_var("MAX_ITERATIONS", defaults.session.max_iterations)?,
                loop_guard_repeats: parse_var(
                    "LOOP_GUARD_REPEATS",
                    defaults.session.loop_guard_repeats,
                )?,
            },
            retrieval: RetrievalConfig {
                enabled: parse_var("RETRIEVAL_ENABLED", defaults.retrieval.enabled)?,
                top_k: parse_var("RETRIEVAL_TOP_K", defaults.retrieval.top_k)?,
                max_depth: parse_var("RETRIEVAL_MAX_DEPTH", defaults.retrieval.max_depth)?,
            },
            graph: GraphConfig {
                topical_threshold: parse_var(
                    "TOPICAL_EDGE_THRESHOLD",
                    defaults.graph.topical_threshold,
                )?,
            },
            oracle_retry: RetryPolicy {
                max_attempts: parse_var("ORACLE_MAX_ATTEMPTS", defaults.oracle_retry.max_attempts)?,
                initial_backoff: Duration::from_millis(parse_var(
                    "ORACLE_INITIAL_BACKOFF_MS",
                    defaults.oracle_retry.initial_backoff.as_millis() as u64,
                )?),
                ..defaults.oracle_retry.clone()
            },
            capability_timeout: Duration::from_millis(parse_var(
                "CAPABILITY_TIMEOUT_MS",
                defaults.capability_timeout.as_millis() as u64,
            )?),
            verification_code_ttl: Duration::from_secs(parse_var(
                "VERIFICATION_CODE_TTL_SECS",
                defaults.verification_code_ttl.as_secs(),
            )?),
            knowledge_dir: env::var("KNOWLEDGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_dir),
            directory_seed: non_empty_var("DIRECTORY_SEED").map(PathBuf::from),
            gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
            database_url: non_empty_var("POSTGRES_URL").or_else(|| non_empty_var("DATABASE_URL")),
            support_api_base_url: non_empty_var("SUPPORT_API_BASE_URL"),
            notify_webhook_url: non_empty_var("NOTIFY_WEBHOOK_URL"),
            api_port: match non_empty_var("PORT").or_else(|| non_empty_var("API_PORT")) {
                Some(raw) => raw.parse().map_err(|_| {
                    OrchestrationError::Config(format!("Invalid port: {}", raw))
                })?,
                None => defaults.api_port,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.history_cap < 4 {
            return Err(OrchestrationError::Config(
                "HISTORY_WINDOW must be at least 4".to_string(),
            ));
        }
        if self.session.max_iterations == 0 {
            return Err(OrchestrationError::Config(
                "MAX_ITERATIONS must be at least 1".to_string(),
            ));
        }
        if self.session.loop_guard_repeats == 0 {
            return Err(OrchestrationError::Config(
                "LOOP_GUARD_REPEATS must be at least 1".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(OrchestrationError::Config(
                "RETRIEVAL_TOP_K must be at least 1".to_string(),
            ));
        }
        let threshold = self.graph.topical_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(OrchestrationError::Config(format!(
                "TOPICAL_EDGE_THRESHOLD must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.oracle_retry.max_attempts == 0 {
            return Err(OrchestrationError::Config(
                "ORACLE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match non_empty_var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            OrchestrationError::Config(format!("Invalid value for {}: {}", key, raw))
        }),
        None => Ok(default),
    }
}

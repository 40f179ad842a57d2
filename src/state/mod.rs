//! State persistence layer
//!
//! Session states are keyed `session:{id}`; the knowledge graph snapshot
//! lives under one fixed key. Payloads are JSON and round-trip exactly.
//! In-memory for development, Postgres when a database URL is configured.

use crate::error::OrchestrationError;
use crate::knowledge::KnowledgeGraph;
use crate::session::SessionState;
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

pub const GRAPH_SNAPSHOT_KEY: &str = "knowledge_graph:snapshot";

const KIND_SESSION: &str = "session";
const KIND_GRAPH: &str = "graph";

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Trait for state persistence
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// `Ok(None)` for an unknown session, `SessionCorrupt` when the stored
    /// payload no longer deserializes.
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>>;

    /// Replace the stored state in one write
    async fn save_session(&self, state: &SessionState) -> Result<()>;

    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    /// Drop sessions not updated within `max_idle`; returns how many
    async fn evict_idle(&self, max_idle: chrono::Duration) -> Result<usize>;

    async fn save_graph_snapshot(&self, graph: &KnowledgeGraph) -> Result<()>;

    async fn load_graph_snapshot(&self) -> Result<Option<KnowledgeGraph>>;
}

fn decode_session(session_id: &str, payload: &str) -> Result<SessionState> {
    serde_json::from_str(payload).map_err(|e| OrchestrationError::SessionCorrupt {
        session_id: session_id.to_string(),
        reason: e.to_string(),
    })
}

fn decode_graph(payload: &str) -> Result<KnowledgeGraph> {
    serde_json::from_str(payload).map_err(|e| {
        OrchestrationError::State(format!("Knowledge graph snapshot unreadable: {}", e))
    })
}

// ===== In-memory =====

#[derive(Debug, Clone)]
struct StoredEntry {
    kind: &'static str,
    payload: String,
    updated_at: DateTime<Utc>,
}

/// In-memory state store for development and tests
pub struct InMemoryStateStore {
    entries: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store a raw session payload as-is
    pub async fn insert_raw(&self, session_id: &str, payload: &str) {
        self.entries.write().await.insert(
            session_key(session_id),
            StoredEntry {
                kind: KIND_SESSION,
                payload: payload.to_string(),
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn session_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.kind == KIND_SESSION)
            .count()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>> {
        let entries = self.entries.read().await;
        entries
            .get(&session_key(session_id))
            .map(|entry| decode_session(session_id, &entry.payload))
            .transpose()
    }

    async fn save_session(&self, state: &SessionState) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        self.entries.write().await.insert(
            session_key(&state.session_id),
            StoredEntry {
                kind: KIND_SESSION,
                payload,
                updated_at: state.updated_at,
            },
        );
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&session_key(session_id))
            .is_some())
    }

    async fn evict_idle(&self, max_idle: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_idle;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.kind != KIND_SESSION || e.updated_at >= cutoff);
        Ok(before - entries.len())
    }

    async fn save_graph_snapshot(&self, graph: &KnowledgeGraph) -> Result<()> {
        let payload = serde_json::to_string(graph)?;
        self.entries.write().await.insert(
            GRAPH_SNAPSHOT_KEY.to_string(),
            StoredEntry {
                kind: KIND_GRAPH,
                payload,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load_graph_snapshot(&self) -> Result<Option<KnowledgeGraph>> {
        let entries = self.entries.read().await;
        entries
            .get(GRAPH_SNAPSHOT_KEY)
            .map(|entry| decode_graph(&entry.payload))
            .transpose()
    }
}

// ===== Postgres =====

pub struct PostgresStateStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresStateStore {
    /// Lazily connecting pool; the schema is created on first use
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS agent_state (
                      key TEXT PRIMARY KEY,
                      kind TEXT NOT NULL,
                      payload TEXT NOT NULL,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_agent_state_kind_time
                    ON agent_state (kind, updated_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::Database(format!("Failed to initialize state schema: {}", e))
            })?;

        Ok(())
    }

    async fn upsert(&self, key: &str, kind: &str, payload: &str, updated_at: DateTime<Utc>) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO agent_state (key, kind, payload, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
              SET kind = EXCLUDED.kind,
                  payload = EXCLUDED.payload,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(key)
        .bind(kind)
        .bind(payload)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OrchestrationError::Database(format!("Failed to save {}: {}", key, e)))?;

        Ok(())
    }

    async fn fetch_payload(&self, key: &str) -> Result<Option<String>> {
        self.ensure_schema().await?;

        let row = sqlx::query("SELECT payload FROM agent_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrchestrationError::Database(format!("Failed to load {}: {}", key, e)))?;

        row.map(|r| r.try_get::<String, _>("payload"))
            .transpose()
            .map_err(|e| OrchestrationError::Database(format!("Bad payload column for {}: {}", key, e)))
    }
}

#[async_trait::async_trait]
impl StateStore for PostgresStateStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionState>> {
        self.fetch_payload(&session_key(session_id))
            .await?
            .map(|payload| decode_session(session_id, &payload))
            .transpose()
    }

    async fn save_session(&self, state: &SessionState) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        self.upsert(&session_key(&state.session_id), KIND_SESSION, &payload, state.updated_at)
            .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM agent_state WHERE key = $1")
            .bind(session_key(session_id))
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestrationError::Database(format!("Failed to delete session: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn evict_idle(&self, max_idle: chrono::Duration) -> Result<usize> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM agent_state WHERE kind = $1 AND updated_at < $2")
            .bind(KIND_SESSION)
            .bind(Utc::now() - max_idle)
            .execute(&self.pool)
            .await
            .map_err(|e| OrchestrationError::Database(format!("Failed to evict sessions: {}", e)))?;

        Ok(result.rows_affected() as usize)
    }

    async fn save_graph_snapshot(&self, graph: &KnowledgeGraph) -> Result<()> {
        let payload = serde_json::to_string(graph)?;
        self.upsert(GRAPH_SNAPSHOT_KEY, KIND_GRAPH, &payload, Utc::now())
            .await
    }

    async fn load_graph_snapshot(&self) -> Result<Option<KnowledgeGraph>> {
        self.fetch_payload(GRAPH_SNAPSHOT_KEY)
            .await?
            .map(|payload| decode_graph(&payload))
            .transpose()
    }
}

/// Postgres when a URL is given and the pool can be created,
/// otherwise in-memory.
pub fn build_state_store(database_url: Option<&str>) -> Arc<dyn StateStore> {
    if let Some(url) = database_url {
        match PostgresStateStore::connect_lazy(url) {
            Ok(store) => {
                info!("State backend: postgres");
                return Arc::new(store);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres state backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("State backend: in-memory");
    Arc::new(InMemoryStateStore::new())
}

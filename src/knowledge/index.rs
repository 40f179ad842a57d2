//! Shared, swappable knowledge graph snapshot

use crate::config::{GraphConfig, RetrievalConfig};
use crate::error::OrchestrationError;
use crate::knowledge::records::KnowledgeBase;
use crate::knowledge::{GraphBuilder, GraphRetriever, GraphStats, KnowledgeGraph, RetrievalResult};
use crate::state::StateStore;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Holds the current graph. Readers clone the `Arc` and never see a
/// half-built graph; a rebuild swaps the pointer only after the new
/// graph is complete and persisted.
pub struct KnowledgeIndex {
    current: RwLock<Option<Arc<KnowledgeGraph>>>,
    /// Held across persist and swap so the live and persisted graphs agree
    rebuild_lock: Mutex<()>,
    builder: GraphBuilder,
    retriever: GraphRetriever,
    retrieval: RetrievalConfig,
    store: Arc<dyn StateStore>,
}

impl KnowledgeIndex {
    pub fn new(graph: GraphConfig, retrieval: RetrievalConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            current: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
            builder: GraphBuilder::new(graph),
            retriever: GraphRetriever::default(),
            retrieval,
            store,
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<KnowledgeGraph>> {
        self.current.read().await.clone()
    }

    pub fn retrieval_config(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    /// Retrieve against the current snapshot
    pub async fn retrieve(&self, query: &str, k: usize, max_depth: usize) -> Result<RetrievalResult> {
        let graph = self.snapshot().await.ok_or_else(|| {
            OrchestrationError::Retrieval("Knowledge graph has not been built".to_string())
        })?;
        self.retriever.retrieve(&graph, query, k, max_depth)
    }

    /// Retrieve with the configured `top_k`/`max_depth`
    pub async fn retrieve_default(&self, query: &str) -> Result<RetrievalResult> {
        self.retrieve(query, self.retrieval.top_k, self.retrieval.max_depth)
            .await
    }

    /// Build a new graph and swap it in. On failure the prior snapshot
    /// stays in place.
    pub async fn rebuild(&self, kb: &KnowledgeBase) -> Result<Arc<KnowledgeGraph>> {
        let _rebuilding = self.rebuild_lock.lock().await;
        let graph = Arc::new(self.builder.build(kb)?);
        self.store.save_graph_snapshot(&graph).await?;

        *self.current.write().await = Some(Arc::clone(&graph));
        info!(fingerprint = %graph.fingerprint(), "Knowledge graph snapshot swapped in");
        Ok(graph)
    }

    pub async fn rebuild_from_dir(&self, dir: &Path) -> Result<Arc<KnowledgeGraph>> {
        let kb = KnowledgeBase::load_dir(dir)?;
        self.rebuild(&kb).await
    }

    /// Install the persisted snapshot, if any. Returns whether one was found.
    pub async fn load_persisted(&self) -> Result<bool> {
        let _rebuilding = self.rebuild_lock.lock().await;
        match self.store.load_graph_snapshot().await {
            Ok(Some(graph)) => {
                info!(nodes = graph.node_count(), "Loaded persisted knowledge graph");
                *self.current.write().await = Some(Arc::new(graph));
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(error = %e, "Persisted knowledge graph unreadable, ignoring");
                Ok(false)
            }
        }
    }

    pub async fn stats(&self) -> Option<GraphStats> {
        self.snapshot().await.map(|g| g.stats())
    }
}

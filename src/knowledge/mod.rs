//! Knowledge graph for non-capability answers
//!
//! Nodes are policy/entity records, edges are typed and weighted.
//! A graph is immutable once built; a knowledge base change means a
//! wholesale rebuild and an atomic swap of the shared snapshot.

pub mod builder;
pub mod index;
pub mod keywords;
pub mod records;
pub mod retriever;

pub use builder::GraphBuilder;
pub use index::KnowledgeIndex;
pub use records::{EntityRecord, KnowledgeBase, PolicyRecord, RelationshipRecord};
pub use retriever::{GraphRetriever, RetrievalHit, RetrievalResult, ScoringWeights};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Relation type for keyword-overlap proximity edges
pub const RELATION_TOPICAL: &str = "topical";
/// Relation type for entity-label-in-policy edges
pub const RELATION_MENTIONED_IN: &str = "mentioned_in";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Policy,
    Entity,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Policy => write!(f, "policy"),
            NodeType::Entity => write!(f, "entity"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub keywords: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub weight: f64,
}

/// Serialized form of a graph; indexes are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    built_at: DateTime<Utc>,
}

/// Immutable, directed multigraph.
///
/// Nodes keep their declaration order; that order is also the final
/// tie-breaker during retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "GraphSnapshot", into = "GraphSnapshot")]
pub struct KnowledgeGraph {
    nodes: Vec<Arc<GraphNode>>,
    edges: Vec<GraphEdge>,
    index: HashMap<String, usize>,
    /// Per node: (neighbor index, edge index), outgoing and incoming
    adjacency: Vec<Vec<(usize, usize)>>,
    built_at: DateTime<Utc>,
}

impl KnowledgeGraph {
    /// Assemble a graph, enforcing that node ids are unique and every
    /// edge endpoint exists.
    pub(crate) fn from_parts(
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
        built_at: DateTime<Utc>,
    ) -> std::result::Result<Self, String> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(format!("duplicate node id '{}'", node.id));
            }
        }

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for (e, edge) in edges.iter().enumerate() {
            let source = *index
                .get(&edge.source)
                .ok_or_else(|| format!("edge source '{}' does not exist", edge.source))?;
            let target = *index
                .get(&edge.target)
                .ok_or_else(|| format!("edge target '{}' does not exist", edge.target))?;
            adjacency[source].push((target, e));
            if source != target {
                adjacency[target].push((source, e));
            }
        }

        Ok(Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            edges,
            index,
            adjacency,
            built_at,
        })
    }

    pub fn nodes(&self) -> &[Arc<GraphNode>] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Arc<GraphNode>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub(crate) fn neighbors(&self, node: usize) -> &[(usize, usize)] {
        &self.adjacency[node]
    }

    pub(crate) fn edge(&self, edge: usize) -> &GraphEdge {
        &self.edges[edge]
    }

    /// Order-independent SHA-256 over the node and edge sets
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = self
            .nodes
            .iter()
            .map(|n| {
                format!(
                    "N|{}|{}|{}|{}|{}",
                    n.id,
                    n.node_type,
                    n.label,
                    n.content,
                    n.keywords.iter().cloned().collect::<Vec<_>>().join(",")
                )
            })
            .collect();
        lines.extend(self.edges.iter().map(|e| {
            format!("E|{}|{}|{}|{:.6}", e.source, e.target, e.relation, e.weight)
        }));
        lines.sort();

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn stats(&self) -> GraphStats {
        let policy_nodes = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Policy)
            .count();
        let topical_edges = self
            .edges
            .iter()
            .filter(|e| e.relation == RELATION_TOPICAL)
            .count();

        GraphStats {
            nodes: self.nodes.len(),
            policy_nodes,
            entity_nodes: self.nodes.len() - policy_nodes,
            edges: self.edges.len(),
            topical_edges,
            fingerprint: self.fingerprint(),
            built_at: self.built_at,
        }
    }
}

impl TryFrom<GraphSnapshot> for KnowledgeGraph {
    type Error = String;

    fn try_from(snapshot: GraphSnapshot) -> std::result::Result<Self, Self::Error> {
        Self::from_parts(snapshot.nodes, snapshot.edges, snapshot.built_at)
    }
}

impl From<KnowledgeGraph> for GraphSnapshot {
    fn from(graph: KnowledgeGraph) -> Self {
        Self {
            nodes: graph
                .nodes
                .into_iter()
                .map(|n| Arc::try_unwrap(n).unwrap_or_else(|shared| (*shared).clone()))
                .collect(),
            edges: graph.edges,
            built_at: graph.built_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub policy_nodes: usize,
    pub entity_nodes: usize,
    pub edges: usize,
    pub topical_edges: usize,
    pub fingerprint: String,
    pub built_at: DateTime<Utc>,
}

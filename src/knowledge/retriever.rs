//! Deterministic traversal-based retrieval
//!
//! query -> keywords -> seed nodes -> breadth-first expansion -> ranked hits.
//! Everything here is a pure function of (graph, query, k, max_depth).

use crate::error::OrchestrationError;
use crate::knowledge::{keywords, GraphNode, KnowledgeGraph};
use crate::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Weights of the final score. `decay` is applied per hop to the
/// relevance carried from a parent node.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub seed: f64,
    pub depth: f64,
    pub overlap: f64,
    pub decay: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            seed: 0.5,
            depth: 0.3,
            overlap: 0.2,
            decay: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievalHit {
    pub node: Arc<GraphNode>,
    pub score: f64,
    pub depth: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RetrievalResult {
    pub query_keywords: BTreeSet<String>,
    pub hits: Vec<RetrievalHit>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.hits.iter().map(|h| h.node.id.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct GraphRetriever {
    weights: ScoringWeights,
}

impl GraphRetriever {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn retrieve(
        &self,
        graph: &KnowledgeGraph,
        query: &str,
        k: usize,
        max_depth: usize,
    ) -> Result<RetrievalResult> {
        if k == 0 {
            return Err(OrchestrationError::Retrieval(
                "k must be at least 1".to_string(),
            ));
        }

        let query_keywords = keywords::extract(query);
        if query_keywords.is_empty() {
            return Ok(RetrievalResult::default());
        }
        let query_size = query_keywords.len() as f64;

        // (depth, relevance) per node, set once the node is visited
        let mut visited: Vec<Option<(usize, f64)>> = vec![None; graph.node_count()];
        let mut frontier = Vec::new();

        for (i, node) in graph.nodes().iter().enumerate() {
            let shared = keywords::overlap(&query_keywords, &node.keywords);
            if shared > 0 {
                visited[i] = Some((0, shared as f64 / query_size));
                frontier.push(i);
            }
        }

        if frontier.is_empty() {
            debug!(query, "No seed nodes for query");
            return Ok(RetrievalResult {
                query_keywords,
                hits: Vec::new(),
            });
        }

        for depth in 1..=max_depth {
            let mut reached: Vec<(usize, f64)> = Vec::new();

            for &parent in &frontier {
                let parent_relevance = visited[parent].map_or(0.0, |(_, r)| r);
                for &(neighbor, edge) in graph.neighbors(parent) {
                    if visited[neighbor].is_some() {
                        continue;
                    }
                    let relevance =
                        parent_relevance * graph.edge(edge).weight * self.weights.decay;
                    match reached.iter_mut().find(|(n, _)| *n == neighbor) {
                        Some(entry) => {
                            if relevance > entry.1 {
                                entry.1 = relevance;
                            }
                        }
                        None => reached.push((neighbor, relevance)),
                    }
                }
            }

            if reached.is_empty() {
                break;
            }

            frontier.clear();
            for (node, relevance) in reached {
                visited[node] = Some((depth, relevance));
                frontier.push(node);
            }
            frontier.sort_unstable();
        }

        let mut scored: Vec<(usize, usize, f64)> = visited
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|(depth, relevance)| (i, depth, relevance)))
            .map(|(i, depth, relevance)| {
                let node = &graph.nodes()[i];
                let local = keywords::overlap(&query_keywords, &node.keywords) as f64 / query_size;
                let score = self.weights.seed * relevance
                    + self.weights.depth / (1.0 + depth as f64)
                    + self.weights.overlap * local;
                (i, depth, score)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);

        let hits = scored
            .into_iter()
            .map(|(i, depth, score)| RetrievalHit {
                node: Arc::clone(&graph.nodes()[i]),
                score,
                depth,
            })
            .collect();

        Ok(RetrievalResult {
            query_keywords,
            hits,
        })
    }
}

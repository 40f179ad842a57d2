//! Knowledge graph construction
//!
//! One node per policy/entity record. Declared relationships become
//! edges after endpoint resolution; topical and mention edges are
//! derived from keyword sets so proximity needs no embeddings.

use crate::config::GraphConfig;
use crate::error::OrchestrationError;
use crate::knowledge::records::{KnowledgeBase, RelationshipRecord};
use crate::knowledge::{
    keywords, GraphEdge, GraphNode, KnowledgeGraph, NodeType, RELATION_MENTIONED_IN,
    RELATION_TOPICAL,
};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const MENTION_EDGE_WEIGHT: f64 = 0.6;

pub struct GraphBuilder {
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }

    /// Build a fresh graph. Fails only on an empty or malformed knowledge
    /// base; unresolved relationship endpoints are dropped with a warning.
    pub fn build(&self, kb: &KnowledgeBase) -> Result<KnowledgeGraph> {
        if kb.is_empty() {
            return Err(OrchestrationError::Build(
                "Knowledge base has no policy or entity records".to_string(),
            ));
        }

        let nodes = Self::collect_nodes(kb)?;
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut edges = Vec::new();
        let mut dropped = 0usize;

        for (i, rel) in kb.relationships.iter().enumerate() {
            Self::check_relationship(i, rel)?;

            let source = Self::resolve(&nodes, &index, &rel.source, rel.source_type);
            let target = Self::resolve(&nodes, &index, &rel.target, rel.target_type);

            match (source, target) {
                (Some(s), Some(t)) if s != t => edges.push(GraphEdge {
                    source: nodes[s].id.clone(),
                    target: nodes[t].id.clone(),
                    relation: rel.relation.clone(),
                    weight: rel.weight,
                }),
                (Some(_), Some(_)) => {
                    debug!(source = %rel.source, target = %rel.target, "Dropping self-referencing relationship");
                    dropped += 1;
                }
                _ => {
                    warn!(
                        source = %rel.source,
                        target = %rel.target,
                        relation = %rel.relation,
                        source_resolved = source.is_some(),
                        target_resolved = target.is_some(),
                        "Dropping relationship with unresolved endpoint"
                    );
                    dropped += 1;
                }
            }
        }

        edges.extend(Self::mention_edges(&nodes));
        edges.extend(Self::topical_edges(&nodes, self.config.topical_threshold));

        let graph = KnowledgeGraph::from_parts(nodes, edges, Utc::now())
            .map_err(OrchestrationError::Build)?;

        info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            dropped_relationships = dropped,
            "Knowledge graph built"
        );

        Ok(graph)
    }

    fn collect_nodes(kb: &KnowledgeBase) -> Result<Vec<GraphNode>> {
        let policies = kb.policies.iter().map(|p| {
            (NodeType::Policy, &p.id, &p.label, &p.content, p.category.clone())
        });
        let entities = kb
            .entities
            .iter()
            .map(|e| (NodeType::Entity, &e.id, &e.label, &e.content, None));

        let mut seen = HashMap::new();
        let mut nodes = Vec::with_capacity(kb.policies.len() + kb.entities.len());

        for (node_type, id, label, content, category) in policies.chain(entities) {
            let id = id.trim();
            if id.is_empty() || label.trim().is_empty() {
                return Err(OrchestrationError::Build(format!(
                    "{} record #{} is missing an id or label",
                    node_type,
                    nodes.len()
                )));
            }
            if seen.insert(id.to_string(), node_type).is_some() {
                return Err(OrchestrationError::Build(format!(
                    "Duplicate record id '{}'",
                    id
                )));
            }

            nodes.push(GraphNode {
                id: id.to_string(),
                node_type,
                label: label.trim().to_string(),
                content: content.clone(),
                category,
                keywords: keywords::extract(&format!("{} {}", label, content)),
            });
        }

        Ok(nodes)
    }

    fn check_relationship(position: usize, rel: &RelationshipRecord) -> Result<()> {
        if rel.source.trim().is_empty() || rel.target.trim().is_empty() {
            return Err(OrchestrationError::Build(format!(
                "Relationship #{} has an empty endpoint",
                position
            )));
        }
        if !rel.weight.is_finite() || !(0.0..=1.0).contains(&rel.weight) {
            return Err(OrchestrationError::Build(format!(
                "Relationship #{} weight {} is outside [0, 1]",
                position, rel.weight
            )));
        }
        Ok(())
    }

    /// Exact id first, then the same-typed node with the largest keyword
    /// overlap. Ties go to the earliest-declared node.
    fn resolve(
        nodes: &[GraphNode],
        index: &HashMap<&str, usize>,
        reference: &str,
        node_type: Option<NodeType>,
    ) -> Option<usize> {
        if let Some(&i) = index.get(reference.trim()) {
            if node_type.map_or(true, |t| nodes[i].node_type == t) {
                return Some(i);
            }
        }

        let wanted = keywords::extract(reference);
        if wanted.is_empty() {
            return None;
        }

        let mut best: Option<(usize, usize)> = None;
        for (i, node) in nodes.iter().enumerate() {
            if node_type.map_or(false, |t| node.node_type != t) {
                continue;
            }
            let score = keywords::overlap(&wanted, &node.keywords);
            if score == 0 {
                continue;
            }
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((i, score));
            }
        }

        if let Some((i, score)) = best {
            debug!(reference, resolved = %nodes[i].id, overlap = score, "Resolved endpoint by keyword overlap");
        }
        best.map(|(i, _)| i)
    }

    fn mention_edges(nodes: &[GraphNode]) -> Vec<GraphEdge> {
        let mut edges = Vec::new();
        for entity in nodes.iter().filter(|n| n.node_type == NodeType::Entity) {
            let label_tokens = keywords::extract(&entity.label);
            if label_tokens.is_empty() {
                continue;
            }
            for policy in nodes.iter().filter(|n| n.node_type == NodeType::Policy) {
                if label_tokens.is_subset(&policy.keywords) {
                    edges.push(GraphEdge {
                        source: entity.id.clone(),
                        target: policy.id.clone(),
                        relation: RELATION_MENTIONED_IN.to_string(),
                        weight: MENTION_EDGE_WEIGHT,
                    });
                }
            }
        }
        edges
    }

    fn topical_edges(nodes: &[GraphNode], threshold: f64) -> Vec<GraphEdge> {
        let mut edges = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let similarity = keywords::jaccard(&a.keywords, &b.keywords);
                if similarity > threshold {
                    edges.push(GraphEdge {
                        source: a.id.clone(),
                        target: b.id.clone(),
                        relation: RELATION_TOPICAL.to_string(),
                        weight: similarity,
                    });
                }
            }
        }
        edges
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new(GraphConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::knowledge::records::{EntityRecord, PolicyRecord};

    pub(crate) fn sample_kb() -> KnowledgeBase {
        KnowledgeBase {
            policies: vec![
                PolicyRecord {
                    id: "return_policy".to_string(),
                    label: "Return Policy".to_string(),
                    content: "Items can be returned within 30 days of delivery in original packaging."
                        .to_string(),
                    category: Some("returns".to_string()),
                },
                PolicyRecord {
                    id: "refund_policy".to_string(),
                    label: "Refund Policy".to_string(),
                    content: "Refunds are issued to the original payment method after the returned item is inspected."
                        .to_string(),
                    category: Some("returns".to_string()),
                },
                PolicyRecord {
                    id: "shipping_policy".to_string(),
                    label: "Shipping Policy".to_string(),
                    content: "Standard shipping takes 3-5 business days. Express shipping delivers next day."
                        .to_string(),
                    category: Some("shipping".to_string()),
                },
            ],
            entities: vec![EntityRecord {
                id: "electronics".to_string(),
                label: "Electronics".to_string(),
                content: "Phones, laptops and accessories; returned electronics need original packaging."
                    .to_string(),
            }],
            relationships: vec![
                RelationshipRecord {
                    source: "return_policy".to_string(),
                    target: "refund_policy".to_string(),
                    relation: "leads_to".to_string(),
                    weight: 0.9,
                    source_type: None,
                    target_type: None,
                },
                RelationshipRecord {
                    source: "electronics".to_string(),
                    target: "return_policy".to_string(),
                    relation: "governed_by".to_string(),
                    weight: 0.7,
                    source_type: None,
                    target_type: None,
                },
            ],
        }
    }

    fn relationship(source: &str, target: &str, target_type: Option<NodeType>) -> RelationshipRecord {
        RelationshipRecord {
            source: source.to_string(),
            target: target.to_string(),
            relation: "related_to".to_string(),
            weight: 0.5,
            source_type: None,
            target_type,
        }
    }

    #[test]
    fn test_builds_one_node_per_record() {
        let graph = GraphBuilder::default().build(&sample_kb()).unwrap();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.nodes()[0].id, "return_policy");
        assert!(graph.nodes()[0].keywords.contains("return"));
        assert!(!graph.nodes()[0].keywords.contains("the"));
    }

    #[test]
    fn test_empty_knowledge_base_fails() {
        let err = GraphBuilder::default().build(&KnowledgeBase::default()).unwrap_err();
        assert!(matches!(err, OrchestrationError::Build(_)));
    }

    #[test]
    fn test_duplicate_ids_fail() {
        let mut kb = sample_kb();
        kb.entities.push(EntityRecord {
            id: "return_policy".to_string(),
            label: "Dup".to_string(),
            content: String::new(),
        });
        assert!(GraphBuilder::default().build(&kb).is_err());
    }

    #[test]
    fn test_unresolved_endpoint_is_dropped_not_fatal() {
        let mut kb = sample_kb();
        kb.relationships.push(relationship("return_policy", "zzz-unknown-qqq", None));
        let graph = GraphBuilder::default().build(&kb).unwrap();
        assert!(graph.edges().iter().all(|e| e.target != "zzz-unknown-qqq"));
    }

    #[test]
    fn test_keyword_fallback_prefers_best_overlap_then_earliest() {
        let mut kb = sample_kb();
        kb.relationships.clear();
        // "policy" alone ties across all three policies: earliest wins
        kb.relationships.push(relationship("electronics", "policy", Some(NodeType::Policy)));
        // "shipping policy" overlaps shipping_policy on two keywords
        kb.relationships.push(relationship("electronics", "shipping policy", Some(NodeType::Policy)));

        let graph = GraphBuilder::default().build(&kb).unwrap();
        let declared: Vec<&GraphEdge> = graph
            .edges()
            .iter()
            .filter(|e| e.relation == "related_to")
            .collect();

        assert_eq!(declared.len(), 2);
        assert_eq!(declared[0].target, "return_policy");
        assert_eq!(declared[1].target, "shipping_policy");
    }

    #[test]
    fn test_out_of_range_weight_is_malformed() {
        let mut kb = sample_kb();
        kb.relationships[0].weight = 1.5;
        assert!(GraphBuilder::default().build(&kb).is_err());
    }

    #[test]
    fn test_topical_edges_follow_threshold() {
        let strict = GraphBuilder::new(GraphConfig { topical_threshold: 1.0 })
            .build(&sample_kb())
            .unwrap();
        assert_eq!(strict.stats().topical_edges, 0);

        let loose = GraphBuilder::new(GraphConfig { topical_threshold: 0.05 })
            .build(&sample_kb())
            .unwrap();
        assert!(loose.stats().topical_edges > 0);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let builder = GraphBuilder::default();
        let a = builder.build(&sample_kb()).unwrap();
        let b = builder.build(&sample_kb()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut reordered = sample_kb();
        reordered.relationships.reverse();
        let c = builder.build(&reordered).unwrap();
        assert_eq!(a.fingerprint(), c.fingerprint());
    }
}

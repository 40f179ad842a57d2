//! Declarative knowledge base input
//!
//! A knowledge base directory holds up to three JSON files:
//! `policies.json`, `entities.json` and `relationships.json`.
//! Each file is either a bare array of records or an object wrapping
//! the array under the file's name (`{"policies": [...]}`).

use crate::error::OrchestrationError;
use crate::knowledge::NodeType;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRecord {
    pub id: String,
    pub label: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipRecord {
    pub source: String,
    pub target: String,
    #[serde(default = "default_relation")]
    pub relation: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Restricts keyword fallback resolution of `source` to this node type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<NodeType>,
}

fn default_relation() -> String {
    "related_to".to_string()
}

fn default_weight() -> f64 {
    0.5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub policies: Vec<PolicyRecord>,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub relationships: Vec<RelationshipRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordFile<T> {
    Bare(Vec<T>),
    Wrapped(serde_json::Map<String, serde_json::Value>),
}

impl KnowledgeBase {
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.entities.is_empty()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| OrchestrationError::Build(format!("Malformed knowledge base: {}", e)))
    }

    /// Load the record files found in `dir`. Missing files are skipped;
    /// a file that exists but does not parse fails the load.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(OrchestrationError::Build(format!(
                "Knowledge base directory not found: {}",
                dir.display()
            )));
        }

        let kb = Self {
            policies: read_records(dir, "policies")?,
            entities: read_records(dir, "entities")?,
            relationships: read_records(dir, "relationships")?,
        };

        info!(
            dir = %dir.display(),
            policies = kb.policies.len(),
            entities = kb.entities.len(),
            relationships = kb.relationships.len(),
            "Knowledge base loaded"
        );

        Ok(kb)
    }
}

fn read_records<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Vec<T>> {
    let path = dir.join(format!("{}.json", name));
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(&path)?;
    let malformed = |e: serde_json::Error| {
        OrchestrationError::Build(format!("Malformed {}: {}", path.display(), e))
    };

    match serde_json::from_str::<RecordFile<T>>(&raw).map_err(malformed)? {
        RecordFile::Bare(records) => Ok(records),
        RecordFile::Wrapped(mut map) => {
            let inner = map.remove(name).ok_or_else(|| {
                OrchestrationError::Build(format!(
                    "{} has no top-level \"{}\" array",
                    path.display(),
                    name
                ))
            })?;
            serde_json::from_value(inner).map_err(malformed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_defaults() {
        let kb = KnowledgeBase::from_json(
            r#"{"policies": [{"id": "p1", "label": "Returns", "content": "30 days"}],
                "relationships": [{"source": "p1", "target": "p2"}]}"#,
        )
        .unwrap();
        assert_eq!(kb.relationships[0].relation, "related_to");
        assert_eq!(kb.relationships[0].weight, 0.5);
        assert!(kb.entities.is_empty());
    }

    #[test]
    fn test_malformed_json_is_build_error() {
        let err = KnowledgeBase::from_json("{not json").unwrap_err();
        assert!(matches!(err, OrchestrationError::Build(_)));
    }

    #[test]
    fn test_load_bundled_knowledge_base() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("data/knowledge");
        let kb = KnowledgeBase::load_dir(&dir).unwrap();
        assert!(!kb.policies.is_empty());
        assert!(!kb.entities.is_empty());
        assert!(!kb.relationships.is_empty());
    }

    #[test]
    fn test_missing_dir_is_build_error() {
        let err = KnowledgeBase::load_dir(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, OrchestrationError::Build(_)));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParqueError, Result};

/// Identity of a document: a namespace plus a namespace-local id,
/// rendered as the opaque form `ns/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub namespace: String,
    pub local_id: String,
}

impl EntityId {
    pub fn new(namespace: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_id: local_id.into(),
        }
    }

    /// Parse the combined `ns/id` form.
    pub fn parse(combined: &str) -> Result<Self> {
        match combined.split_once('/') {
            Some((ns, id)) if !ns.is_empty() && !id.is_empty() => Ok(Self::new(ns, id)),
            _ => Err(ParqueError::Validation {
                field: "entity_id".to_string(),
                reason: format!("expected `ns/id`, got `{combined}`"),
            }),
        }
    }

    /// The event-log target form `ns:id`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.namespace, self.local_id)
    }

    /// Parse the event target form `ns:id`.
    pub fn from_target(target: &str) -> Result<Self> {
        match target.split_once(':') {
            Some((ns, id)) if !ns.is_empty() && !id.is_empty() => Ok(Self::new(ns, id)),
            _ => Err(ParqueError::Validation {
                field: "target".to_string(),
                reason: format!("expected `ns:id`, got `{target}`"),
            }),
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.local_id)
    }
}

/// A reconstructed document: identity, audit trail, and arbitrary user fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Combined identity of this document
    pub id: EntityId,

    /// Type tag (e.g. "Post", "Author")
    #[serde(rename = "type")]
    pub entity_type: String,

    /// Monotonically non-decreasing version; every mutation increments it
    pub version: u64,

    /// Audit fields
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,

    /// Arbitrary user fields
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(id: EntityId, entity_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
            version: 0,
            created_at: now,
            created_by: None,
            updated_at: now,
            updated_by: None,
            deleted_at: None,
            deleted_by: None,
            fields: serde_json::Map::new(),
        }
    }

    /// Soft-deleted entities remain readable only when the caller opts in.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn get_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Field accessor that also resolves the builtin `$id`, `$type` and audit
    /// columns the query layer sorts and filters on.
    pub fn projected_value(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "$id" => Some(serde_json::Value::String(self.id.to_string())),
            "$type" => Some(serde_json::Value::String(self.entity_type.clone())),
            "version" => Some(serde_json::json!(self.version)),
            "createdAt" => Some(serde_json::json!(self.created_at)),
            "updatedAt" => Some(serde_json::json!(self.updated_at)),
            "deletedAt" => self.deleted_at.map(|t| serde_json::json!(t)),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Render the entity as a flat JSON document (used by projection,
    /// export and the FTS indexer).
    pub fn to_document(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        doc.insert("$id".to_string(), serde_json::json!(self.id.to_string()));
        doc.insert("$type".to_string(), serde_json::json!(self.entity_type));
        doc.insert("version".to_string(), serde_json::json!(self.version));
        doc.insert("createdAt".to_string(), serde_json::json!(self.created_at));
        doc.insert("updatedAt".to_string(), serde_json::json!(self.updated_at));
        if let Some(deleted_at) = self.deleted_at {
            doc.insert("deletedAt".to_string(), serde_json::json!(deleted_at));
        }
        for (k, v) in &self.fields {
            doc.insert(k.clone(), v.clone());
        }
        serde_json::Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_parse() {
        let id = EntityId::parse("posts/p-1").unwrap();
        assert_eq!(id.namespace, "posts");
        assert_eq!(id.local_id, "p-1");
        assert_eq!(id.to_string(), "posts/p-1");
        assert_eq!(id.target(), "posts:p-1");
    }

    #[test]
    fn test_entity_id_parse_rejects_malformed() {
        assert!(EntityId::parse("no-slash").is_err());
        assert!(EntityId::parse("/missing-ns").is_err());
        assert!(EntityId::parse("missing-id/").is_err());
    }

    #[test]
    fn test_target_round_trip() {
        let id = EntityId::new("users", "u1");
        assert_eq!(EntityId::from_target(&id.target()).unwrap(), id);
    }

    #[test]
    fn test_soft_delete_flag() {
        let mut entity = Entity::new(EntityId::new("posts", "p1"), "Post", Utc::now());
        assert!(!entity.is_deleted());
        entity.deleted_at = Some(Utc::now());
        assert!(entity.is_deleted());
    }

    #[test]
    fn test_projected_builtins() {
        let entity = Entity::new(EntityId::new("posts", "p1"), "Post", Utc::now());
        assert_eq!(
            entity.projected_value("$id"),
            Some(serde_json::json!("posts/p1"))
        );
        assert_eq!(
            entity.projected_value("$type"),
            Some(serde_json::json!("Post"))
        );
        assert_eq!(entity.projected_value("missing"), None);
    }
}

//! Relationship engine: declared edges with O(1) reverse lookup.
//!
//! Two multimaps per database: the forward map `(source, relation) →
//! targets` materialized from the entities' own fields, and the persisted
//! reverse index `(target_ns, target_id, relation) → sources` that inverts
//! every link at mutation time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::error::{ParqueError, RelationshipErrorKind, RelationshipOp, Result};
use crate::update::UnlinkTargets;

/// A declared relation: forward from `source_ns.name` to `target_ns`, with
/// the reverse lookup exposed under `inverse` on the target namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDef {
    pub source_ns: String,
    pub name: String,
    pub target_ns: String,
    pub inverse: String,
    /// Singular relations replace their previous target on re-link
    pub singular: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelationshipStats {
    pub declared_relations: usize,
    pub forward_entries: usize,
    pub reverse_entries: usize,
    pub links_added: u64,
    pub links_removed: u64,
}

/// Snapshot of the engine for persistence alongside a branch.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRelationships {
    forward: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    reverse: BTreeMap<String, BTreeSet<String>>,
}

pub struct RelationshipEngine {
    /// `source_ns.relation` → definition
    defs: DashMap<String, RelationDef>,

    /// `target_ns.inverse` → forward definition key
    inverse_defs: DashMap<String, String>,

    /// source entity id → relation → target local ids
    forward: DashMap<String, HashMap<String, BTreeSet<String>>>,

    /// `target_ns/target_id#inverse` → source entity ids
    reverse: DashMap<String, BTreeSet<String>>,

    counters: parking_lot::Mutex<(u64, u64)>,
}

impl RelationshipEngine {
    pub fn new() -> Self {
        Self {
            defs: DashMap::new(),
            inverse_defs: DashMap::new(),
            forward: DashMap::new(),
            reverse: DashMap::new(),
            counters: parking_lot::Mutex::new((0, 0)),
        }
    }

    /// Declare a relation. Typically driven by the schema layer at startup.
    pub fn declare(&self, def: RelationDef) {
        let key = format!("{}.{}", def.source_ns, def.name);
        self.inverse_defs
            .insert(format!("{}.{}", def.target_ns, def.inverse), key.clone());
        self.defs.insert(key, def);
    }

    pub fn definition(&self, source_ns: &str, relation: &str) -> Option<RelationDef> {
        self.defs
            .get(&format!("{source_ns}.{relation}"))
            .map(|d| d.clone())
    }

    /// All declared relations.
    pub fn definitions(&self) -> Vec<RelationDef> {
        self.defs.iter().map(|d| d.value().clone()).collect()
    }

    fn require_definition(
        &self,
        op: RelationshipOp,
        source_ns: &str,
        relation: &str,
    ) -> Result<RelationDef> {
        self.definition(source_ns, relation)
            .ok_or_else(|| ParqueError::Relationship {
                operation: op,
                ns: source_ns.to_string(),
                relation: relation.to_string(),
                target_id: None,
                kind: RelationshipErrorKind::UndefinedRelation,
            })
    }

    fn reverse_key(def: &RelationDef, target_id: &str) -> String {
        format!("{}/{}#{}", def.target_ns, target_id, def.inverse)
    }

    /// Record `source.relation → targets`. Targets are local ids in the
    /// relation's target namespace. A singular relation atomically replaces
    /// its previous reverse entry.
    pub fn link(&self, source: &EntityId, relation: &str, targets: &[String]) -> Result<()> {
        let def = self.require_definition(RelationshipOp::Link, &source.namespace, relation)?;
        let source_id = source.to_string();

        let mut forward = self.forward.entry(source_id.clone()).or_default();
        let slot = forward.entry(relation.to_string()).or_default();

        if def.singular {
            for previous in slot.iter() {
                if let Some(mut set) = self.reverse.get_mut(&Self::reverse_key(&def, previous)) {
                    set.remove(&source_id);
                }
            }
            slot.clear();
        }

        let mut added = 0u64;
        for target in targets {
            if slot.insert(target.clone()) {
                self.reverse
                    .entry(Self::reverse_key(&def, target))
                    .or_default()
                    .insert(source_id.clone());
                added += 1;
            }
        }
        drop(forward);

        self.counters.lock().0 += added;
        Ok(())
    }

    /// Remove forward entries and their mirrored reverse entries.
    pub fn unlink(
        &self,
        source: &EntityId,
        relation: &str,
        removal: &UnlinkTargets,
    ) -> Result<()> {
        let def = self.require_definition(RelationshipOp::Unlink, &source.namespace, relation)?;
        let source_id = source.to_string();

        let removed: Vec<String> = {
            let Some(mut forward) = self.forward.get_mut(&source_id) else {
                return Ok(());
            };
            let Some(slot) = forward.get_mut(relation) else {
                return Ok(());
            };
            match removal {
                UnlinkTargets::All => {
                    let all: Vec<String> = slot.iter().cloned().collect();
                    slot.clear();
                    all
                }
                UnlinkTargets::Ids(ids) => ids
                    .iter()
                    .filter(|id| slot.remove(*id))
                    .cloned()
                    .collect(),
            }
        };

        for target in &removed {
            if let Some(mut set) = self.reverse.get_mut(&Self::reverse_key(&def, target)) {
                set.remove(&source_id);
            }
        }
        self.counters.lock().1 += removed.len() as u64;
        Ok(())
    }

    /// Hard delete of a source: every forward entry and its mirrored
    /// reverse entry goes away.
    pub fn remove_source(&self, source: &EntityId) {
        let source_id = source.to_string();
        let Some((_, relations)) = self.forward.remove(&source_id) else {
            return;
        };
        let mut removed = 0u64;
        for (relation, targets) in relations {
            let Some(def) = self.definition(&source.namespace, &relation) else {
                continue;
            };
            for target in targets {
                if let Some(mut set) = self.reverse.get_mut(&Self::reverse_key(&def, &target)) {
                    set.remove(&source_id);
                    removed += 1;
                }
            }
        }
        self.counters.lock().1 += removed;
    }

    /// Forward lookup: target local ids of `source.relation`.
    pub fn targets_of(&self, source: &EntityId, relation: &str) -> Vec<String> {
        self.forward
            .get(&source.to_string())
            .and_then(|relations| relations.get(relation).map(|t| t.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Reverse lookup: source entity ids pointing at `ns/id` through the
    /// reverse relation `relation`. O(1) map access plus the page copy;
    /// results are in stable (sorted) order for value-based pagination.
    pub fn related(&self, ns: &str, id: &str, relation: &str) -> Result<Vec<String>> {
        // Validate the name: it must be the inverse side of some declared
        // relation on this namespace.
        let key = format!("{ns}.{relation}");
        if !self.inverse_defs.contains_key(&key) {
            return Err(ParqueError::Relationship {
                operation: RelationshipOp::Hydrate,
                ns: ns.to_string(),
                relation: relation.to_string(),
                target_id: None,
                kind: RelationshipErrorKind::UndefinedRelation,
            });
        }
        Ok(self
            .reverse
            .get(&format!("{ns}/{id}#{relation}"))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn stats(&self) -> RelationshipStats {
        let (added, removed) = *self.counters.lock();
        RelationshipStats {
            declared_relations: self.defs.len(),
            forward_entries: self
                .forward
                .iter()
                .map(|e| e.value().values().map(BTreeSet::len).sum::<usize>())
                .sum(),
            reverse_entries: self.reverse.iter().map(|e| e.value().len()).sum(),
            links_added: added,
            links_removed: removed,
        }
    }

    fn forward_snapshot(&self) -> BTreeMap<String, BTreeMap<String, BTreeSet<String>>> {
        self.forward
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            })
            .collect()
    }

    fn reverse_snapshot(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.reverse
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Canonical serialization of the forward map alone, for independent
    /// verification in commit manifests.
    pub fn forward_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.forward_snapshot()).unwrap_or_default()
    }

    /// Canonical serialization of the reverse index alone.
    pub fn reverse_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.reverse_snapshot()).unwrap_or_default()
    }

    /// Serialize both multimaps for persistence with a branch.
    pub fn to_bytes(&self) -> Vec<u8> {
        let persisted = PersistedRelationships {
            forward: self.forward_snapshot(),
            reverse: self.reverse_snapshot(),
        };
        serde_json::to_vec(&persisted).unwrap_or_default()
    }

    /// Restore the multimaps; relation declarations are re-applied by the
    /// schema layer, not persisted here.
    pub fn load_bytes(&self, data: &[u8]) -> Result<()> {
        let persisted: PersistedRelationships = serde_json::from_slice(data)?;
        self.forward.clear();
        self.reverse.clear();
        for (source, relations) in persisted.forward {
            self.forward
                .insert(source, relations.into_iter().collect());
        }
        for (key, sources) in persisted.reverse {
            self.reverse.insert(key, sources);
        }
        Ok(())
    }

    /// Drop every edge (branch delete).
    pub fn clear(&self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

impl Default for RelationshipEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RelationshipEngine {
        let engine = RelationshipEngine::new();
        engine.declare(RelationDef {
            source_ns: "posts".to_string(),
            name: "author".to_string(),
            target_ns: "authors".to_string(),
            inverse: "posts".to_string(),
            singular: true,
        });
        engine.declare(RelationDef {
            source_ns: "posts".to_string(),
            name: "tags".to_string(),
            target_ns: "tags".to_string(),
            inverse: "posts".to_string(),
            singular: false,
        });
        engine
    }

    fn post(n: u32) -> EntityId {
        EntityId::new("posts", format!("p{n}"))
    }

    #[test]
    fn test_link_updates_both_maps() {
        let engine = engine();
        engine.link(&post(1), "author", &["a1".to_string()]).unwrap();

        assert_eq!(engine.targets_of(&post(1), "author"), vec!["a1"]);
        assert_eq!(
            engine.related("authors", "a1", "posts").unwrap(),
            vec!["posts/p1"]
        );
    }

    #[test]
    fn test_singular_relink_replaces_reverse_entry() {
        let engine = engine();
        engine.link(&post(1), "author", &["a1".to_string()]).unwrap();
        engine.link(&post(1), "author", &["a2".to_string()]).unwrap();

        assert!(engine.related("authors", "a1", "posts").unwrap().is_empty());
        assert_eq!(
            engine.related("authors", "a2", "posts").unwrap(),
            vec!["posts/p1"]
        );
        assert_eq!(engine.targets_of(&post(1), "author"), vec!["a2"]);
    }

    #[test]
    fn test_multi_relation_accumulates() {
        let engine = engine();
        engine
            .link(&post(1), "tags", &["t1".to_string(), "t2".to_string()])
            .unwrap();
        engine.link(&post(1), "tags", &["t3".to_string()]).unwrap();

        assert_eq!(engine.targets_of(&post(1), "tags"), vec!["t1", "t2", "t3"]);
        assert_eq!(
            engine.related("tags", "t1", "posts").unwrap(),
            vec!["posts/p1"]
        );
    }

    #[test]
    fn test_unlink_specific_and_all() {
        let engine = engine();
        engine
            .link(&post(1), "tags", &["t1".to_string(), "t2".to_string()])
            .unwrap();

        engine
            .unlink(&post(1), "tags", &UnlinkTargets::Ids(vec!["t1".to_string()]))
            .unwrap();
        assert!(engine.related("tags", "t1", "posts").unwrap().is_empty());
        assert_eq!(engine.targets_of(&post(1), "tags"), vec!["t2"]);

        engine.unlink(&post(1), "tags", &UnlinkTargets::All).unwrap();
        assert!(engine.related("tags", "t2", "posts").unwrap().is_empty());
    }

    #[test]
    fn test_hard_delete_removes_mirrored_entries() {
        let engine = engine();
        engine.link(&post(1), "author", &["a1".to_string()]).unwrap();
        engine.link(&post(2), "author", &["a1".to_string()]).unwrap();

        engine.remove_source(&post(1));
        assert_eq!(
            engine.related("authors", "a1", "posts").unwrap(),
            vec!["posts/p2"]
        );
    }

    #[test]
    fn test_undefined_relation_errors() {
        let engine = engine();
        let err = engine
            .link(&post(1), "nonexistent", &["x".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            ParqueError::Relationship {
                kind: RelationshipErrorKind::UndefinedRelation,
                operation: RelationshipOp::Link,
                ..
            }
        ));
        assert!(engine.related("authors", "a1", "bogus").is_err());
    }

    #[test]
    fn test_many_sources_single_lookup() {
        let engine = engine();
        for i in 0..100 {
            engine.link(&post(i), "author", &["a1".to_string()]).unwrap();
        }
        let related = engine.related("authors", "a1", "posts").unwrap();
        assert_eq!(related.len(), 100);
    }

    #[test]
    fn test_forward_and_reverse_serialize_independently() {
        let engine = engine();
        engine.link(&post(1), "author", &["a1".to_string()]).unwrap();

        let forward = engine.forward_bytes();
        let reverse = engine.reverse_bytes();
        assert_ne!(forward, reverse);

        // Forward is keyed by source, reverse by target#inverse.
        let forward_json: serde_json::Value = serde_json::from_slice(&forward).unwrap();
        assert_eq!(forward_json["posts/p1"]["author"], serde_json::json!(["a1"]));
        let reverse_json: serde_json::Value = serde_json::from_slice(&reverse).unwrap();
        assert_eq!(
            reverse_json["authors/a1#posts"],
            serde_json::json!(["posts/p1"])
        );

        // Stable for equal state.
        assert_eq!(engine.forward_bytes(), forward);
        assert_eq!(engine.reverse_bytes(), reverse);
    }

    #[test]
    fn test_persistence_round_trip() {
        let engine = engine();
        engine.link(&post(1), "author", &["a1".to_string()]).unwrap();
        engine
            .link(&post(1), "tags", &["t1".to_string(), "t2".to_string()])
            .unwrap();

        let bytes = engine.to_bytes();
        let restored = RelationshipEngine::new();
        restored.declare(RelationDef {
            source_ns: "posts".to_string(),
            name: "author".to_string(),
            target_ns: "authors".to_string(),
            inverse: "posts".to_string(),
            singular: true,
        });
        restored.load_bytes(&bytes).unwrap();

        assert_eq!(
            restored.related("authors", "a1", "posts").unwrap(),
            vec!["posts/p1"]
        );
        assert_eq!(restored.targets_of(&post(1), "tags"), vec!["t1", "t2"]);
    }
}

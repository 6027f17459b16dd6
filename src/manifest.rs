//! Branch/commit semantics over the segment sets.
//!
//! A namespace manifest is the mutable pointer advanced by the compactor; a
//! commit freezes the whole database (collections, relationship hashes,
//! event-log position) under a content hash; branches are named refs onto
//! commits. Commits are immutable, branches move.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bloom::SegmentBloomIndex;
use crate::error::{ParqueError, Result};
use crate::hash_index::HashIndex;
use crate::object_store::ObjectStore;
use crate::query::SegmentHandle;
use crate::segment::SegmentReader;

/// One segment referenced by a namespace manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentRef {
    pub name: String,
    pub entity_count: u64,
    pub event_log_offset: u64,
}

/// The consistent segment set for one namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceManifest {
    pub namespace: String,
    pub segments: Vec<SegmentRef>,
    /// Highest event-log offset covered by the segment set
    pub event_log_offset: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Per-collection state inside a commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionState {
    pub row_count: u64,
    pub data_hash: String,
    pub schema_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelationshipHashes {
    pub fwd_hash: String,
    pub rev_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventLogPosition {
    pub segment_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitState {
    pub collections: BTreeMap<String, CollectionState>,
    pub relationships: RelationshipHashes,
    pub event_log_position: EventLogPosition,
}

/// An immutable commit manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    pub ts: DateTime<Utc>,
    pub author: String,
    pub parents: Vec<String>,
    pub state: CommitState,
}

impl Commit {
    pub fn new(
        message: impl Into<String>,
        author: impl Into<String>,
        parents: Vec<String>,
        state: CommitState,
    ) -> Self {
        let message = message.into();
        let author = author.into();
        let ts = Utc::now();

        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        hasher.update(author.as_bytes());
        hasher.update(ts.to_rfc3339().as_bytes());
        for parent in &parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update(serde_json::to_vec(&state).unwrap_or_default());
        let hash: String = format!("{:x}", hasher.finalize()).chars().take(40).collect();

        Self {
            hash,
            message,
            ts,
            author,
            parents,
            state,
        }
    }
}

/// Diff between two commits, by collection hash comparison.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub relationships_changed: bool,
}

pub fn diff(a: &Commit, b: &Commit) -> CommitDiff {
    let mut out = CommitDiff {
        relationships_changed: a.state.relationships != b.state.relationships,
        ..Default::default()
    };
    for (ns, state) in &b.state.collections {
        match a.state.collections.get(ns) {
            None => out.added.push(ns.clone()),
            Some(prev)
                if prev.data_hash != state.data_hash || prev.schema_hash != state.schema_hash =>
            {
                out.modified.push(ns.clone())
            }
            Some(_) => {}
        }
    }
    for ns in a.state.collections.keys() {
        if !b.state.collections.contains_key(ns) {
            out.removed.push(ns.clone());
        }
    }
    out
}

fn commit_path(hash: &str) -> String {
    format!("commits/{hash}.json")
}

fn ref_path(branch: &str) -> String {
    format!("refs/{branch}")
}

fn manifest_path(namespace: &str) -> String {
    format!("manifests/{namespace}.json")
}

/// The in-memory segment catalog plus its durable manifests and refs.
///
/// The compactor publishes through [`SegmentCatalog::publish`], which
/// atomically (single-key write) advances the namespace manifest; readers
/// pick up new segment sets on the next query.
pub struct SegmentCatalog {
    store: Arc<dyn ObjectStore>,
    /// Object prefix for segments and index artifacts (PARQUET_PREFIX)
    prefix: String,
    namespaces: DashMap<String, Vec<SegmentHandle>>,
    offsets: DashMap<String, u64>,
}

impl SegmentCatalog {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            namespaces: DashMap::new(),
            offsets: DashMap::new(),
        }
    }

    /// Object path of a segment (or artifact) under the configured prefix.
    pub fn object_path(&self, name: &str) -> String {
        format!("{}/{name}", self.prefix)
    }

    /// Load every persisted namespace manifest and its segment handles.
    pub async fn load(&self) -> Result<()> {
        let manifests = self.store.list("manifests/").await?;
        for meta in manifests {
            let data = self.store.read(&meta.path).await?;
            let manifest: NamespaceManifest = serde_json::from_slice(&data)?;
            let mut handles = Vec::with_capacity(manifest.segments.len());
            for segment_ref in &manifest.segments {
                match self.load_handle(segment_ref).await {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        tracing::warn!("skipping unreadable segment {}: {e}", segment_ref.name)
                    }
                }
            }
            tracing::info!(
                "📂 loaded {} segment(s) for namespace {}",
                handles.len(),
                manifest.namespace
            );
            self.offsets
                .insert(manifest.namespace.clone(), manifest.event_log_offset);
            self.namespaces.insert(manifest.namespace, handles);
        }
        Ok(())
    }

    async fn load_handle(&self, segment_ref: &SegmentRef) -> Result<SegmentHandle> {
        let path = self.object_path(&segment_ref.name);
        let data = self.store.read(&path).await?;
        let meta = SegmentReader::read_meta(&data)?;

        let stem = segment_ref.name.trim_end_matches(".parquet");
        // A corrupt or missing index artifact downgrades to a plain scan.
        let bloom = match self.store.read(&self.object_path(&format!("{stem}.bloom"))).await {
            Ok(bytes) => SegmentBloomIndex::from_bytes(&bytes).ok().map(Arc::new),
            Err(_) => None,
        };
        let hash = match self.store.read(&self.object_path(&format!("{stem}.hash"))).await {
            Ok(bytes) => HashIndex::from_bytes(&bytes).ok().map(Arc::new),
            Err(_) => None,
        };

        Ok(SegmentHandle {
            name: segment_ref.name.clone(),
            object_path: path,
            meta,
            bloom,
            hash,
        })
    }

    /// Publish a new segment for a namespace and persist the manifest.
    pub async fn publish(
        &self,
        namespace: &str,
        handle: SegmentHandle,
        event_log_offset: u64,
    ) -> Result<()> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .push(handle);
        self.offsets.insert(namespace.to_string(), event_log_offset);
        self.persist_manifest(namespace).await
    }

    async fn persist_manifest(&self, namespace: &str) -> Result<()> {
        let manifest = NamespaceManifest {
            namespace: namespace.to_string(),
            segments: self
                .segments(namespace)
                .iter()
                .map(|h| SegmentRef {
                    name: h.name.clone(),
                    entity_count: h.meta.entity_count,
                    event_log_offset: h.meta.event_log_offset,
                })
                .collect(),
            event_log_offset: self.covered_offset(namespace),
            updated_at: Some(Utc::now()),
        };
        self.store
            .write(
                &manifest_path(namespace),
                &serde_json::to_vec_pretty(&manifest)?,
            )
            .await
    }

    pub fn segments(&self, namespace: &str) -> Vec<SegmentHandle> {
        self.namespaces
            .get(namespace)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Event-log offset covered by the published segment set.
    pub fn covered_offset(&self, namespace: &str) -> u64 {
        self.offsets.get(namespace).map(|o| *o).unwrap_or(0)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.iter().map(|e| e.key().clone()).collect()
    }
}

/// Durable commit/branch store.
pub struct BranchStore {
    store: Arc<dyn ObjectStore>,
}

impl BranchStore {
    pub const DEFAULT_BRANCH: &'static str = "main";

    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Persist a commit and advance a branch ref to it.
    pub async fn commit_to_branch(&self, branch: &str, commit: &Commit) -> Result<()> {
        self.store
            .write(&commit_path(&commit.hash), &serde_json::to_vec_pretty(commit)?)
            .await?;
        self.store
            .write(&ref_path(branch), commit.hash.as_bytes())
            .await?;
        tracing::info!("✅ committed {} to branch {branch}", commit.hash);
        Ok(())
    }

    pub async fn read_commit(&self, hash: &str) -> Result<Commit> {
        let data = self.store.read(&commit_path(hash)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Resolve a branch name to its head commit hash.
    pub async fn head(&self, branch: &str) -> Result<Option<String>> {
        if !self.store.exists(&ref_path(branch)).await? {
            return Ok(None);
        }
        let data = self.store.read(&ref_path(branch)).await?;
        Ok(Some(String::from_utf8(data).map_err(|_| {
            ParqueError::Internal(format!("branch ref {branch} is not utf-8"))
        })?))
    }

    /// Walk the first-parent chain from a branch head, newest first.
    pub async fn log(&self, branch: &str, max: usize) -> Result<Vec<Commit>> {
        let mut commits = Vec::new();
        let Some(mut cursor) = self.head(branch).await? else {
            return Ok(commits);
        };
        while commits.len() < max {
            let commit = self.read_commit(&cursor).await?;
            let next = commit.parents.first().cloned();
            commits.push(commit);
            match next {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        Ok(commits)
    }

    pub async fn branches(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list("refs/")
            .await?
            .into_iter()
            .filter_map(|meta| meta.path.strip_prefix("refs/").map(str::to_string))
            .collect())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.store.delete(&ref_path(branch)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryStore;

    fn state(collections: &[(&str, &str)]) -> CommitState {
        CommitState {
            collections: collections
                .iter()
                .map(|(ns, hash)| {
                    (
                        ns.to_string(),
                        CollectionState {
                            row_count: 1,
                            data_hash: hash.to_string(),
                            schema_hash: "s1".to_string(),
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_commit_hash_covers_state() {
        let a = Commit::new("msg", "alice", vec![], state(&[("posts", "h1")]));
        let b = Commit::new("msg", "alice", vec![], state(&[("posts", "h2")]));
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 40);
    }

    #[test]
    fn test_diff_classification() {
        let a = Commit::new("a", "x", vec![], state(&[("posts", "h1"), ("users", "h2")]));
        let b = Commit::new(
            "b",
            "x",
            vec![a.hash.clone()],
            state(&[("posts", "h9"), ("tags", "h3")]),
        );

        let d = diff(&a, &b);
        assert_eq!(d.added, vec!["tags"]);
        assert_eq!(d.removed, vec!["users"]);
        assert_eq!(d.modified, vec!["posts"]);
    }

    #[tokio::test]
    async fn test_branch_commit_log() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let branches = BranchStore::new(Arc::clone(&store));

        let c1 = Commit::new("first", "alice", vec![], state(&[("posts", "h1")]));
        branches.commit_to_branch("main", &c1).await.unwrap();

        let c2 = Commit::new("second", "alice", vec![c1.hash.clone()], state(&[("posts", "h2")]));
        branches.commit_to_branch("main", &c2).await.unwrap();

        assert_eq!(branches.head("main").await.unwrap(), Some(c2.hash.clone()));
        assert_eq!(branches.head("missing").await.unwrap(), None);

        let log = branches.log("main", 10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, "second");
        assert_eq!(log[1].message, "first");

        assert_eq!(branches.branches().await.unwrap(), vec!["main"]);
        branches.delete_branch("main").await.unwrap();
        assert_eq!(branches.head("main").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_catalog_publish_and_reload() {
        use crate::config::StorageConfig;
        use crate::entity::{Entity, EntityId};
        use crate::segment::SegmentWriter;
        use chrono::Utc;

        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let catalog = SegmentCatalog::new(Arc::clone(&store), "segments");

        let writer = SegmentWriter::new(StorageConfig::default());
        let entities: Vec<Entity> = (0..5)
            .map(|i| {
                let mut e =
                    Entity::new(EntityId::new("posts", format!("p{i}")), "Post", Utc::now());
                e.version = 1;
                e
            })
            .collect();
        let build = writer.build("posts", entities, 5).unwrap();

        store
            .write(&format!("segments/{}", build.name), &build.data)
            .await
            .unwrap();
        store
            .write(&format!("segments/{}", build.bloom_name()), &build.bloom.to_bytes())
            .await
            .unwrap();
        store
            .write(&format!("segments/{}", build.hash_name()), &build.hash.to_bytes())
            .await
            .unwrap();

        let handle = SegmentHandle {
            name: build.name.clone(),
            object_path: format!("segments/{}", build.name),
            meta: build.meta.clone(),
            bloom: Some(Arc::new(build.bloom.clone())),
            hash: Some(Arc::new(build.hash.clone())),
        };
        catalog.publish("posts", handle, 5).await.unwrap();
        assert_eq!(catalog.covered_offset("posts"), 5);

        // A fresh catalog over the same store reloads everything.
        let reloaded = SegmentCatalog::new(Arc::clone(&store), "segments");
        reloaded.load().await.unwrap();
        let segments = reloaded.segments("posts");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].meta.entity_count, 5);
        assert!(segments[0].bloom.is_some());
        assert!(segments[0].hash.is_some());
        assert_eq!(reloaded.covered_offset("posts"), 5);
    }
}

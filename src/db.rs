//! The ParqueDB facade: document CRUD, queries, relationships, time-travel,
//! branch/commit semantics and background maintenance, wired over the event
//! log, the segment catalog and the object store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::background::{BackgroundRunner, TaskKind};
use crate::breaker::{BreakerStats, CircuitBreakerStore};
use crate::cache::LruCache;
use crate::compactor::{CompactionTask, Compactor, CompactorStats};
use crate::config::ParqueDbConfig;
use crate::cursor::Cursor;
use crate::entity::{Entity, EntityId};
use crate::error::{
    ParqueError, QueryErrorKind, RelationshipErrorKind, RelationshipOp, Result,
};
use crate::event::Event;
use crate::event_log::{EventLog, EventLogStats};
use crate::export::{self, ExportFormat};
use crate::filter::Filter;
use crate::fts::FtsIndex;
use crate::manifest::{
    diff as commit_diff, BranchStore, CollectionState, Commit, CommitDiff, CommitState,
    EventLogPosition, RelationshipHashes, SegmentCatalog,
};
use crate::metrics::MetricsRegistry;
use crate::object_store::{FilesystemStore, InMemoryStore, ObjectStore};
use crate::query::{self, Page, QueryExecutor, QueryOptions, QueryStats};
use crate::reconstruct::Reconstructor;
use crate::relationship::{RelationDef, RelationshipEngine, RelationshipStats};
use crate::snapshot::{SnapshotManager, SnapshotStats, SnapshotType};
use crate::update::UpdateOps;
use crate::vacuum::{Vacuum, VacuumReport};

const RELATIONSHIPS_PATH: &str = "relationships.json";

/// Options for [`ParqueDb::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub include_deleted: bool,
    /// Hydration depth: 0 leaves raw relation ids, 1 walks declared
    /// relations one level
    pub depth: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub namespaces: Vec<String>,
    pub event_log: EventLogStats,
    pub cache: crate::cache::CacheStats,
    pub snapshots: SnapshotStats,
    pub compactor: CompactorStats,
    pub relationships: RelationshipStats,
    pub breaker: BreakerStats,
}

/// An embedded, event-sourced document database over Parquet segments.
pub struct ParqueDb {
    config: ParqueDbConfig,
    log: Arc<EventLog>,
    cache: Arc<LruCache<Entity>>,
    snapshots: Arc<SnapshotManager>,
    reconstructor: Arc<Reconstructor>,
    relationships: Arc<RelationshipEngine>,
    store: Arc<CircuitBreakerStore>,
    catalog: Arc<SegmentCatalog>,
    compactor: Arc<Compactor>,
    executor: QueryExecutor,
    branches: BranchStore,
    background: Arc<BackgroundRunner>,
    metrics: Arc<MetricsRegistry>,

    /// Per-namespace full-text indexes and their configured fields
    fts: DashMap<String, Arc<RwLock<FtsIndex>>>,
    fts_fields: DashMap<String, Vec<String>>,

    /// Writer lanes: mutations serialize per namespace, readers never wait
    write_lanes: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ParqueDb {
    /// Open a database rooted at `config.storage.data_dir`.
    pub async fn open(mut config: ParqueDbConfig) -> Result<Self> {
        config.apply_env();
        config.validate()?;
        let backing: Arc<dyn ObjectStore> =
            Arc::new(FilesystemStore::new(config.storage.data_dir.join("objects"))?);
        Self::open_with_store(config, backing).await
    }

    /// Open an ephemeral database over an in-memory store (tests, demos).
    pub async fn open_in_memory(config: ParqueDbConfig) -> Result<Self> {
        let backing: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        Self::open_with_store(config, backing).await
    }

    async fn open_with_store(
        config: ParqueDbConfig,
        backing: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let store = Arc::new(CircuitBreakerStore::new(backing, config.breaker.clone()));
        let store_dyn: Arc<dyn ObjectStore> = Arc::clone(&store) as Arc<dyn ObjectStore>;

        let log = Arc::new(EventLog::open(
            config.storage.data_dir.join(&config.storage.raw_events_prefix),
            config.event_log.clone(),
        )?);

        let ttl = (config.cache.ttl_seconds > 0)
            .then(|| Duration::from_secs(config.cache.ttl_seconds));
        let cache = Arc::new(LruCache::new(config.cache.max_entries, ttl));
        let snapshots = Arc::new(SnapshotManager::new(config.snapshot.clone()));
        let reconstructor = Arc::new(Reconstructor::new(
            Arc::clone(&log),
            Arc::clone(&snapshots),
            Arc::clone(&cache),
        ));

        let catalog = Arc::new(SegmentCatalog::new(Arc::clone(&store_dyn), config.storage.parquet_prefix.clone()));
        catalog.load().await?;

        let compactor = Arc::new(Compactor::new(
            Arc::clone(&log),
            Arc::clone(&catalog),
            Arc::clone(&store_dyn),
            config.storage.clone(),
            config.compaction.clone(),
        ));

        let relationships = Arc::new(RelationshipEngine::new());
        if store_dyn.exists(RELATIONSHIPS_PATH).await? {
            let data = store_dyn.read(RELATIONSHIPS_PATH).await?;
            if let Err(e) = relationships.load_bytes(&data) {
                tracing::warn!("could not load persisted relationships: {e}");
            }
        }

        let db = Self {
            executor: QueryExecutor::new(Arc::clone(&store_dyn), config.query.clone()),
            branches: BranchStore::new(Arc::clone(&store_dyn)),
            metrics: MetricsRegistry::new(&config.metrics),
            background: Arc::new(BackgroundRunner::new()),
            fts: DashMap::new(),
            fts_fields: DashMap::new(),
            write_lanes: DashMap::new(),
            config,
            log,
            cache,
            snapshots,
            reconstructor,
            relationships,
            store,
            catalog,
            compactor,
        };
        tracing::info!("✅ ParqueDB open: {} namespace(s)", db.catalog.namespaces().len());
        Ok(db)
    }

    fn write_lane(&self, namespace: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_lanes
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Declare a relation for `$link`/`$unlink` and reverse lookups.
    pub fn declare_relation(&self, def: RelationDef) {
        self.relationships.declare(def);
    }

    /// Register a full-text index over `fields` of a namespace. The
    /// persisted artifact is reused when present and intact; a corrupt or
    /// missing artifact triggers a rebuild from current state.
    pub async fn register_text_index(&self, namespace: &str, fields: Vec<String>) -> Result<()> {
        let path = format!("fts/{namespace}.idx");
        let loaded = match self.store.read(&path).await {
            Ok(bytes) => {
                let (index, needs_rebuild) = FtsIndex::load_or_empty(&bytes);
                (!needs_rebuild).then_some(index)
            }
            Err(_) => None,
        };

        let index = match loaded {
            Some(index) => Arc::new(RwLock::new(index)),
            None => {
                let index = Arc::new(RwLock::new(FtsIndex::new()));
                let entities = self.all_current(namespace).await?;
                let mut guard = index.write();
                for entity in &entities {
                    if entity.is_deleted() {
                        continue;
                    }
                    self.fts_index_entity(&mut guard, entity, &fields);
                }
                drop(guard);
                index
            }
        };

        self.fts_fields.insert(namespace.to_string(), fields);
        self.fts.insert(namespace.to_string(), index);
        tracing::info!("✅ full-text index registered for {namespace}");
        Ok(())
    }

    fn fts_index_entity(&self, index: &mut FtsIndex, entity: &Entity, fields: &[String]) {
        let texts: Vec<(String, String)> = fields
            .iter()
            .filter_map(|field| {
                entity
                    .get_field(field)
                    .and_then(Value::as_str)
                    .map(|text| (field.clone(), text.to_string()))
            })
            .collect();
        let refs: Vec<(&str, &str)> = texts
            .iter()
            .map(|(f, t)| (f.as_str(), t.as_str()))
            .collect();
        index.index_document(&entity.id.to_string(), &refs, &self.config.fts);
    }

    fn fts_refresh(&self, entity: &Entity) {
        let namespace = &entity.id.namespace;
        let (Some(index), Some(fields)) = (
            self.fts.get(namespace),
            self.fts_fields.get(namespace).map(|f| f.clone()),
        ) else {
            return;
        };
        let mut guard = index.write();
        if entity.is_deleted() {
            guard.remove_document(&entity.id.to_string());
        } else {
            self.fts_index_entity(&mut guard, entity, &fields);
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create a document. The event is durably appended before the call
    /// returns.
    pub async fn create(
        &self,
        namespace: &str,
        id: &str,
        doc: Value,
        actor: Option<String>,
    ) -> Result<Entity> {
        let entity_id = EntityId::new(namespace, id);
        let lane = self.write_lane(namespace);
        let _guard = lane.lock().await;
        let timer = self.metrics.mutation_duration_seconds.start_timer();

        if let Some(existing) = self.reconstructor.current(&entity_id)? {
            if !existing.is_deleted() {
                self.metrics.mutation_errors_total.inc();
                return Err(ParqueError::Validation {
                    field: "$id".to_string(),
                    reason: format!("{entity_id} already exists (version {})", existing.version),
                });
            }
        }

        self.log.append(Event::create(&entity_id, doc, actor))?;
        self.metrics.events_appended_total.inc();
        self.metrics.mutations_total.with_label_values(&["create"]).inc();

        self.reconstructor.cache_invalidate(&entity_id);
        let entity = self
            .reconstructor
            .current(&entity_id)?
            .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?;
        self.fts_refresh(&entity);
        timer.observe_duration();
        Ok(entity)
    }

    /// Apply an update document (`$set`, `$unset`, `$inc`, `$push`,
    /// `$pull`, `$link`, `$unlink`). Optimistic concurrency through
    /// `expected_version`.
    pub async fn update(
        &self,
        namespace: &str,
        id: &str,
        update_doc: Value,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<Entity> {
        let entity_id = EntityId::new(namespace, id);
        let lane = self.write_lane(namespace);
        let _guard = lane.lock().await;
        let timer = self.metrics.mutation_duration_seconds.start_timer();

        let current = match expected_version {
            Some(expected) => self.reconstructor.check_version(&entity_id, expected)?,
            None => self
                .reconstructor
                .current(&entity_id)?
                .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?,
        };
        if current.is_deleted() {
            self.metrics.mutation_errors_total.inc();
            return Err(ParqueError::entity_not_found(&entity_id));
        }

        let ops = UpdateOps::parse(&update_doc)?;
        if ops.is_empty() {
            return Err(ParqueError::Validation {
                field: "update".to_string(),
                reason: "update document has no operators".to_string(),
            });
        }
        self.validate_links(&entity_id, &ops)?;

        self.log.append(Event::update(
            &entity_id,
            Some(current.to_document()),
            update_doc,
            actor,
        ))?;
        self.metrics.events_appended_total.inc();
        self.metrics.mutations_total.with_label_values(&["update"]).inc();

        // Mirror relationship changes into the reverse index.
        for link in &ops.link {
            self.relationships
                .link(&entity_id, &link.relation, &link.targets)?;
            self.metrics.relationship_links_total.inc();
        }
        for unlink in &ops.unlink {
            self.relationships
                .unlink(&entity_id, &unlink.relation, &unlink.removal)?;
            self.metrics.relationship_unlinks_total.inc();
        }

        self.reconstructor.cache_invalidate(&entity_id);
        let entity = self
            .reconstructor
            .current(&entity_id)?
            .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?;
        self.fts_refresh(&entity);
        self.maybe_auto_snapshot(&entity);
        timer.observe_duration();
        Ok(entity)
    }

    /// Links require a declared relation and a live target.
    fn validate_links(&self, source: &EntityId, ops: &UpdateOps) -> Result<()> {
        for link in &ops.link {
            let def = self
                .relationships
                .definition(&source.namespace, &link.relation)
                .ok_or_else(|| ParqueError::Relationship {
                    operation: RelationshipOp::Link,
                    ns: source.namespace.clone(),
                    relation: link.relation.clone(),
                    target_id: None,
                    kind: RelationshipErrorKind::UndefinedRelation,
                })?;
            for target in &link.targets {
                let target_id = EntityId::new(&def.target_ns, target);
                match self.reconstructor.current(&target_id)? {
                    None => {
                        return Err(ParqueError::Relationship {
                            operation: RelationshipOp::Link,
                            ns: source.namespace.clone(),
                            relation: link.relation.clone(),
                            target_id: Some(target.clone()),
                            kind: RelationshipErrorKind::TargetMissing,
                        })
                    }
                    Some(entity) if entity.is_deleted() => {
                        return Err(ParqueError::Relationship {
                            operation: RelationshipOp::Link,
                            ns: source.namespace.clone(),
                            relation: link.relation.clone(),
                            target_id: Some(target.clone()),
                            kind: RelationshipErrorKind::TargetDeleted,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        for unlink in &ops.unlink {
            if self
                .relationships
                .definition(&source.namespace, &unlink.relation)
                .is_none()
            {
                return Err(ParqueError::Relationship {
                    operation: RelationshipOp::Unlink,
                    ns: source.namespace.clone(),
                    relation: unlink.relation.clone(),
                    target_id: None,
                    kind: RelationshipErrorKind::UndefinedRelation,
                });
            }
        }
        Ok(())
    }

    /// Soft-delete (default) or hard-delete a document. Hard deletion also
    /// removes the entity's edges and snapshots.
    pub async fn delete(
        &self,
        namespace: &str,
        id: &str,
        expected_version: Option<u64>,
        actor: Option<String>,
        hard: bool,
    ) -> Result<()> {
        let entity_id = EntityId::new(namespace, id);
        let lane = self.write_lane(namespace);
        let _guard = lane.lock().await;

        let current = match expected_version {
            Some(expected) => self.reconstructor.check_version(&entity_id, expected)?,
            None => self
                .reconstructor
                .current(&entity_id)?
                .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?,
        };
        if current.is_deleted() && !hard {
            return Err(ParqueError::entity_not_found(&entity_id));
        }

        self.log
            .append(Event::delete(&entity_id, Some(current.to_document()), actor))?;
        self.metrics.events_appended_total.inc();
        self.metrics.mutations_total.with_label_values(&["delete"]).inc();

        if hard {
            self.relationships.remove_source(&entity_id);
            self.snapshots.remove_entity(&entity_id);
        }
        self.reconstructor.cache_invalidate(&entity_id);
        if let Some(entity) = self.reconstructor.current(&entity_id)? {
            self.fts_refresh(&entity);
        }
        Ok(())
    }

    fn maybe_auto_snapshot(&self, entity: &Entity) {
        let entity_id = entity.id.clone();
        let count = self.reconstructor.event_count(&entity_id);
        if !self
            .snapshots
            .should_snapshot(&entity_id, count, entity.updated_at)
        {
            return;
        }

        // Fire-and-forget: snapshot failures land in metrics and the
        // background failure queue, never at the mutating caller.
        let snapshots = Arc::clone(&self.snapshots);
        let state = entity.clone();
        let metrics = Arc::clone(&self.metrics);
        self.background.spawn(TaskKind::AutoSnapshot, async move {
            snapshots.create_snapshot(state, count, Utc::now(), SnapshotType::Automatic)?;
            metrics.snapshots_created_total.inc();
            Ok(())
        });
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetch one document. With `depth=1` declared relations are hydrated
    /// one level; inbound relations are truncated at `max_inbound` with a
    /// continuation token.
    pub async fn get(&self, namespace: &str, id: &str, options: &GetOptions) -> Result<Value> {
        let entity_id = EntityId::new(namespace, id);
        let entity = self
            .reconstructor
            .current(&entity_id)?
            .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?;
        if entity.is_deleted() && !options.include_deleted {
            return Err(ParqueError::entity_not_found(&entity_id));
        }

        let mut doc = entity.to_document();
        if options.depth > 0 {
            self.hydrate(&entity, &mut doc).await?;
        }
        Ok(doc)
    }

    /// Typed accessor used internally and by tests.
    pub fn get_entity(&self, namespace: &str, id: &str, include_deleted: bool) -> Result<Entity> {
        let entity_id = EntityId::new(namespace, id);
        let entity = self
            .reconstructor
            .current(&entity_id)?
            .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?;
        if entity.is_deleted() && !include_deleted {
            return Err(ParqueError::entity_not_found(&entity_id));
        }
        Ok(entity)
    }

    async fn hydrate(&self, entity: &Entity, doc: &mut Value) -> Result<()> {
        let Some(map) = doc.as_object_mut() else {
            return Ok(());
        };

        // Outbound: replace raw relation ids with target documents.
        let outbound: Vec<(String, RelationDef)> = entity
            .fields
            .keys()
            .filter_map(|field| {
                self.relationships
                    .definition(&entity.id.namespace, field)
                    .map(|def| (field.clone(), def))
            })
            .collect();
        for (relation, def) in outbound {
            let target_ids = self.relationships.targets_of(&entity.id, &relation);
            let mut docs = Vec::with_capacity(target_ids.len());
            for target in &target_ids {
                let target_id = EntityId::new(&def.target_ns, target);
                if let Some(target_entity) = self.reconstructor.current(&target_id)? {
                    if !target_entity.is_deleted() {
                        docs.push(target_entity.to_document());
                    }
                }
            }
            let value = if def.singular {
                docs.into_iter().next().unwrap_or(Value::Null)
            } else {
                Value::Array(docs)
            };
            map.insert(relation, value);
        }

        // Inbound: attach reverse relation id lists, truncated at the
        // configured bound with a continuation token.
        let max_inbound = self.config.query.max_inbound;
        for key in self.inbound_relations(&entity.id.namespace) {
            let sources = self
                .relationships
                .related(&entity.id.namespace, &entity.id.local_id, &key)?;
            let total = sources.len();
            let page: Vec<Value> = sources
                .iter()
                .take(max_inbound)
                .map(|id| Value::String(id.clone()))
                .collect();
            let mut inbound = serde_json::Map::new();
            inbound.insert("items".to_string(), Value::Array(page));
            inbound.insert("total".to_string(), serde_json::json!(total));
            if total > max_inbound {
                let token = Cursor::new(
                    &[],
                    sources[max_inbound - 1].clone(),
                    Vec::new(),
                )
                .encode();
                inbound.insert("nextToken".to_string(), Value::String(token));
            }
            map.insert(key, Value::Object(inbound));
        }
        Ok(())
    }

    /// Inverse relation names declared against a namespace.
    fn inbound_relations(&self, namespace: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .relationships
            .definitions()
            .into_iter()
            .filter(|def| def.target_ns == namespace)
            .map(|def| def.inverse)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Point-in-time read: entity state as of `timestamp`.
    pub async fn revert_to(
        &self,
        namespace: &str,
        id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Entity> {
        self.reconstructor.at(&EntityId::new(namespace, id), timestamp)
    }

    /// Query a namespace: filter + projection + sort + pagination, with
    /// pushdown against the published segment set.
    pub async fn find(
        &self,
        namespace: &str,
        filter_doc: &Value,
        options: QueryOptions,
    ) -> Result<Page> {
        let label = self.metrics.bounded_label(namespace).to_string();
        let timer = self
            .metrics
            .query_duration_seconds
            .with_label_values(&[&label])
            .start_timer();
        self.metrics.queries_total.with_label_values(&[&label]).inc();

        let filter = Filter::parse(filter_doc)?;
        let filter = self.resolve_text_filter(namespace, filter).await?;

        let segments = self.catalog.segments(namespace);
        let live = self.live_tail(namespace).await?;
        let page = self.executor.find(&segments, live, &filter, &options).await?;

        self.metrics
            .query_rows_scanned
            .with_label_values(&[&label])
            .inc_by(page.stats.rows_scanned);
        if page.stats.used_early_termination {
            self.metrics.query_early_terminations.inc();
        }
        timer.observe_duration();
        Ok(page)
    }

    /// Count matching documents; ignores limit/skip.
    pub async fn count(&self, namespace: &str, filter_doc: &Value, include_deleted: bool) -> Result<u64> {
        let filter = Filter::parse(filter_doc)?;
        let filter = self.resolve_text_filter(namespace, filter).await?;
        let segments = self.catalog.segments(namespace);
        let live = self.live_tail(namespace).await?;
        self.executor
            .count(&segments, live, &filter, include_deleted)
            .await
    }

    /// Resolve `$text` nodes: FTS index when registered, otherwise a
    /// deterministic linear-scan fallback (or a typed rejection when the
    /// fallback is disabled).
    async fn resolve_text_filter(&self, namespace: &str, filter: Filter) -> Result<Filter> {
        if !filter.has_text() {
            return Ok(filter);
        }
        if let Some(index) = self.fts.get(namespace) {
            let index = Arc::clone(&index);
            let config = self.config.fts.clone();
            return filter.resolve_text(&move |query| {
                index.read().matching_doc_ids(query, &config)
            });
        }
        if !self.config.query.text_scan_fallback {
            return Err(ParqueError::query(
                QueryErrorKind::InvalidFilter,
                format!("$text requires a full-text index on {namespace}"),
            ));
        }

        // Fallback: build a transient index over every string field of the
        // namespace's current entities.
        let entities = self.all_current(namespace).await?;
        let mut scratch = FtsIndex::new();
        for entity in &entities {
            if entity.is_deleted() {
                continue;
            }
            let texts: Vec<(String, String)> = entity
                .fields
                .iter()
                .filter_map(|(field, value)| {
                    value.as_str().map(|text| (field.clone(), text.to_string()))
                })
                .collect();
            let refs: Vec<(&str, &str)> =
                texts.iter().map(|(f, t)| (f.as_str(), t.as_str())).collect();
            scratch.index_document(&entity.id.to_string(), &refs, &self.config.fts);
        }
        let config = self.config.fts.clone();
        filter.resolve_text(&move |query| scratch.matching_doc_ids(query, &config))
    }

    /// Current state of every entity touched by events beyond the offset
    /// covered by published segments.
    async fn live_tail(&self, namespace: &str) -> Result<Vec<Entity>> {
        let covered = self.catalog.covered_offset(namespace);
        let head = self.log.head_offset(namespace);
        if head <= covered {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut live = Vec::new();
        for event in self.log.range(namespace, covered, head) {
            let Ok(entity_id) = EntityId::from_target(&event.target) else {
                continue;
            };
            if !seen.insert(entity_id.clone()) {
                continue;
            }
            if let Some(entity) = self.reconstructor.current(&entity_id)? {
                live.push(entity);
            }
        }
        Ok(live)
    }

    /// Every current entity of a namespace (segments + live tail).
    async fn all_current(&self, namespace: &str) -> Result<Vec<Entity>> {
        let segments = self.catalog.segments(namespace);
        let live = self.live_tail(namespace).await?;
        let page = self
            .executor
            .find(
                &segments,
                live,
                &Filter::All,
                &QueryOptions {
                    include_deleted: true,
                    ..Default::default()
                },
            )
            .await?;
        page.items
            .iter()
            .filter_map(|doc| doc["$id"].as_str())
            .map(|id| self.get_entity_by_full_id(id))
            .collect()
    }

    fn get_entity_by_full_id(&self, full_id: &str) -> Result<Entity> {
        let entity_id = EntityId::parse(full_id)?;
        self.reconstructor
            .current(&entity_id)?
            .ok_or_else(|| ParqueError::entity_not_found(&entity_id))
    }

    /// Reverse-relationship lookup with pagination, filtering and sorting.
    /// O(1) index access plus O(page) materialization through the cache.
    pub async fn get_related(
        &self,
        namespace: &str,
        id: &str,
        relation: &str,
        filter_doc: &Value,
        options: QueryOptions,
    ) -> Result<Page> {
        let source_ids = self.relationships.related(namespace, id, relation)?;
        let filter = Filter::parse(filter_doc)?;
        let (limit, skip) = validate_pagination(&options)?;
        let cursor = match &options.cursor {
            Some(token) => Some(Cursor::decode(token, &options.sort)?),
            None => None,
        };

        let mut matched = Vec::new();
        let mut scanned = 0u64;
        for source in &source_ids {
            let Ok(entity_id) = EntityId::parse(source) else {
                continue;
            };
            scanned += 1;
            let Some(entity) = self.reconstructor.current(&entity_id)? else {
                continue;
            };
            if entity.is_deleted() && !options.include_deleted {
                continue;
            }
            if filter.matches(&entity) {
                matched.push(entity);
            }
        }

        query::sort_entities(&mut matched, &options.sort);
        if let Some(cursor) = &cursor {
            let boundary_id = cursor.id.clone();
            // Resume strictly after the cursor row in the sorted order.
            if let Some(pos) = matched.iter().position(|e| e.id.to_string() == boundary_id) {
                matched.drain(..=pos);
            }
        }

        let total = matched.len() as u64;
        let after_skip: Vec<Entity> = matched.into_iter().skip(skip).collect();
        let page_len = limit.unwrap_or(after_skip.len()).min(after_skip.len());
        let has_more = after_skip.len() > page_len;
        let items: Vec<Entity> = after_skip.into_iter().take(page_len).collect();

        let next_cursor = has_more.then(|| {
            items
                .last()
                .map(|last| {
                    Cursor::new(&options.sort, last.id.to_string(), query::sort_tuple(last, &options.sort))
                        .encode()
                })
                .unwrap_or_default()
        });

        Ok(Page {
            items: items
                .iter()
                .map(|e| query::project(e, options.project.as_deref()))
                .collect(),
            total,
            has_more,
            next_cursor,
            stats: QueryStats {
                rows_scanned: scanned,
                rows_returned: page_len as u64,
                used_early_termination: false,
                row_groups_pruned: 0,
            },
        })
    }

    // ------------------------------------------------------------------
    // Snapshots, commits, maintenance
    // ------------------------------------------------------------------

    /// Create a manual snapshot for an entity.
    pub async fn create_snapshot(&self, namespace: &str, id: &str) -> Result<()> {
        let entity_id = EntityId::new(namespace, id);
        let entity = self
            .reconstructor
            .current(&entity_id)?
            .ok_or_else(|| ParqueError::entity_not_found(&entity_id))?;
        let seq = self.reconstructor.event_count(&entity_id);
        self.snapshots
            .create_snapshot(entity, seq, Utc::now(), SnapshotType::Manual)?;
        self.metrics.snapshots_created_total.inc();
        Ok(())
    }

    /// Flush buffered events and persist the relationship index.
    pub async fn flush(&self) -> Result<()> {
        self.log.flush()?;
        self.metrics.event_log_flushes_total.inc();
        self.store
            .write(RELATIONSHIPS_PATH, &self.relationships.to_bytes())
            .await?;
        for entry in self.fts.iter() {
            let path = format!("fts/{}.idx", entry.key());
            let bytes = entry.value().read().to_bytes();
            self.store.write(&path, &bytes).await?;
        }
        Ok(())
    }

    /// Run compaction windows to completion (also scheduled in the
    /// background when enabled).
    pub async fn compact(&self) -> Result<usize> {
        self.compactor.tick().await
    }

    /// Freeze the database state into a commit on `branch`.
    pub async fn commit(
        &self,
        branch: &str,
        message: &str,
        author: &str,
    ) -> Result<Commit> {
        use sha2::{Digest, Sha256};

        self.flush().await?;

        let mut collections = std::collections::BTreeMap::new();
        let mut namespaces: Vec<String> = self
            .catalog
            .namespaces()
            .into_iter()
            .chain(self.log.namespaces())
            .collect();
        namespaces.sort();
        namespaces.dedup();

        for namespace in namespaces {
            let entities = self.all_current(&namespace).await?;
            let row_count = entities.iter().filter(|e| !e.is_deleted()).count() as u64;

            let mut data_hasher = Sha256::new();
            let mut schema_fields: Vec<&String> = Vec::new();
            for entity in &entities {
                data_hasher.update(entity.id.to_string().as_bytes());
                data_hasher.update(entity.version.to_be_bytes());
                schema_fields.extend(entity.fields.keys());
            }
            schema_fields.sort();
            schema_fields.dedup();
            let mut schema_hasher = Sha256::new();
            for field in schema_fields {
                schema_hasher.update(field.as_bytes());
            }

            collections.insert(
                namespace,
                CollectionState {
                    row_count,
                    data_hash: format!("{:x}", data_hasher.finalize())
                        .chars()
                        .take(16)
                        .collect(),
                    schema_hash: format!("{:x}", schema_hasher.finalize())
                        .chars()
                        .take(16)
                        .collect(),
                },
            );
        }

        // The two relationship maps hash independently so each half can be
        // verified on its own when inspecting a commit.
        let short_hash = |bytes: &[u8]| -> String {
            format!("{:x}", Sha256::digest(bytes)).chars().take(16).collect()
        };
        let fwd_hash = short_hash(&self.relationships.forward_bytes());
        let rev_hash = short_hash(&self.relationships.reverse_bytes());

        let parents = match self.branches.head(branch).await? {
            Some(head) => vec![head],
            None => Vec::new(),
        };

        let state = CommitState {
            collections,
            relationships: RelationshipHashes { fwd_hash, rev_hash },
            event_log_position: EventLogPosition {
                segment_id: "log".to_string(),
                offset: self
                    .log
                    .namespaces()
                    .iter()
                    .map(|ns| self.log.head_offset(ns))
                    .sum(),
            },
        };

        let commit = Commit::new(message, author, parents, state);
        self.branches.commit_to_branch(branch, &commit).await?;
        Ok(commit)
    }

    pub async fn log_commits(&self, branch: &str, max: usize) -> Result<Vec<Commit>> {
        self.branches.log(branch, max).await
    }

    pub async fn diff_commits(&self, a: &str, b: &str) -> Result<CommitDiff> {
        let a = self.branches.read_commit(a).await?;
        let b = self.branches.read_commit(b).await?;
        Ok(commit_diff(&a, &b))
    }

    pub async fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        self.branches.head(branch).await
    }

    /// Reclaim expired orphaned segment files.
    pub async fn vacuum(&self, dry_run: bool) -> Result<VacuumReport> {
        let store: Arc<dyn ObjectStore> = Arc::clone(&self.store) as Arc<dyn ObjectStore>;
        Vacuum::new(store, self.config.storage.parquet_prefix.clone(), self.config.storage.retention_ms)
            .run(dry_run)
            .await
    }

    /// Export a namespace in a CLI text format.
    pub async fn export(&self, namespace: &str, format: ExportFormat) -> Result<String> {
        let mut entities = self.all_current(namespace).await?;
        entities.retain(|e| !e.is_deleted());
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        export::export_text(&entities, format)
    }

    /// Export a namespace's current entities as Parquet bytes.
    pub async fn export_parquet(&self, namespace: &str) -> Result<Vec<u8>> {
        let mut entities = self.all_current(namespace).await?;
        entities.retain(|e| !e.is_deleted());
        export::export_parquet(namespace, entities, &self.config.storage)
    }

    /// Import entities from Parquet bytes as CREATE events.
    pub async fn import_parquet(&self, data: &[u8]) -> Result<usize> {
        let entities = export::import_parquet(data)?;
        let count = entities.len();
        for entity in entities {
            let mut doc = serde_json::Map::new();
            doc.insert("$type".to_string(), Value::String(entity.entity_type.clone()));
            for (k, v) in &entity.fields {
                doc.insert(k.clone(), v.clone());
            }
            self.create(
                &entity.id.namespace,
                &entity.id.local_id,
                Value::Object(doc),
                entity.created_by.clone(),
            )
            .await?;
        }
        Ok(count)
    }

    /// Start the background compaction and cache-cleanup loops.
    pub fn start_background_tasks(&self) {
        if self.config.compaction.auto_compact {
            let task = CompactionTask::new(
                Arc::clone(&self.compactor),
                self.config.compaction.tick_interval_seconds,
                self.background.cancellation_token(),
            );
            self.background
                .spawn(TaskKind::Compaction, async move {
                    task.run().await;
                    Ok(())
                });
        }

        let cache = Arc::clone(&self.cache);
        let cancel = self.background.cancellation_token();
        self.background.spawn(TaskKind::CacheCleanup, async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = cache.evict_expired();
                        if swept > 0 {
                            tracing::debug!("cache cleanup: {swept} expired entries");
                        }
                    }
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        });
    }

    /// Flush and stop background work. Cancelled tasks drop pending work.
    pub async fn shutdown(&self) -> Result<()> {
        self.background.shutdown();
        self.flush().await?;
        tracing::info!("ParqueDB shut down");
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        let mut namespaces: Vec<String> = self
            .catalog
            .namespaces()
            .into_iter()
            .chain(self.log.namespaces())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        DbStats {
            namespaces,
            event_log: self.log.stats(),
            cache: self.cache.stats(),
            snapshots: self.snapshots.stats(),
            compactor: self.compactor.stats(),
            relationships: self.relationships.stats(),
            breaker: self.store.stats(),
        }
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.export_text()
    }

    pub fn config(&self) -> &ParqueDbConfig {
        &self.config
    }
}

pub(crate) fn validate_pagination(options: &QueryOptions) -> Result<(Option<usize>, usize)> {
    let limit = match options.limit {
        Some(l) if l < 0 => {
            return Err(ParqueError::query(
                QueryErrorKind::InvalidPagination,
                format!("negative limit {l}"),
            ))
        }
        Some(l) => Some(l as usize),
        None => None,
    };
    let skip = match options.skip {
        Some(s) if s < 0 => {
            return Err(ParqueError::query(
                QueryErrorKind::InvalidPagination,
                format!("negative skip {s}"),
            ))
        }
        Some(s) => s as usize,
        None => 0,
    };
    Ok((limit, skip))
}

// Facade behavior is covered by the integration tests.

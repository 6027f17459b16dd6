//! Query executor: filter + projection + sort + pagination over a
//! namespace, with predicate pushdown against segment statistics and index
//! artifacts, bounded row-group read concurrency, and early termination.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::bloom::SegmentBloomIndex;
use crate::config::QueryConfig;
use crate::cursor::{Cursor, SortKey};
use crate::entity::Entity;
use crate::error::{ParqueError, QueryErrorKind, Result};
use crate::filter::Filter;
use crate::hash_index::HashIndex;
use crate::object_store::ObjectStore;
use crate::segment::{index_key, json_lt, SegmentMeta, SegmentReader};

/// A published segment visible to the executor: object location, footer
/// descriptor, and its loaded index artifacts.
#[derive(Clone)]
pub struct SegmentHandle {
    pub name: String,
    pub object_path: String,
    pub meta: SegmentMeta,
    pub bloom: Option<Arc<SegmentBloomIndex>>,
    pub hash: Option<Arc<HashIndex>>,
}

/// Query options; `limit`/`skip` arrive as signed values so negatives can be
/// rejected as `InvalidPagination` instead of silently wrapping.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub sort: Vec<SortKey>,
    pub project: Option<Vec<String>>,
    pub cursor: Option<String>,
    pub include_deleted: bool,
}

impl QueryOptions {
    fn validated(&self) -> Result<(Option<usize>, usize)> {
        let limit = match self.limit {
            Some(l) if l < 0 => {
                return Err(ParqueError::query(
                    QueryErrorKind::InvalidPagination,
                    format!("negative limit {l}"),
                ))
            }
            Some(l) => Some(l as usize),
            None => None,
        };
        let skip = match self.skip {
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
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryStats {
    pub rows_scanned: u64,
    pub rows_returned: u64,
    pub used_early_termination: bool,
    pub row_groups_pruned: u64,
}

/// Paginated query result.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: Vec<Value>,
    pub total: u64,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub stats: QueryStats,
}

pub struct QueryExecutor {
    store: Arc<dyn ObjectStore>,
    config: QueryConfig,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn ObjectStore>, config: QueryConfig) -> Self {
        Self { store, config }
    }

    /// Evaluate a find query. `segments` is the namespace's published
    /// segment set in manifest order; `live` holds the current state of
    /// every entity in the mutable event-log tail (these override segment
    /// rows with the same id).
    pub async fn find(
        &self,
        segments: &[SegmentHandle],
        live: Vec<Entity>,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Page> {
        let (limit, skip) = options.validated()?;
        let cursor = match &options.cursor {
            Some(token) => Some(Cursor::decode(token, &options.sort)?),
            None => None,
        };

        let mut scan = Scan::new(filter, options, &live);
        let unsorted = options.sort.is_empty();
        // Early termination applies only to unsorted scans: with a sort we
        // must see every qualifying row before ordering.
        let early_stop_at = match (unsorted, limit) {
            (true, Some(limit)) => Some(skip + limit),
            _ => None,
        };

        // Unsorted + cursor resumes in scan order: discard until the cursor
        // id passes by.
        let mut resume_skip = if unsorted { cursor.as_ref().map(|c| c.id.clone()) } else { None };

        'segments: for handle in segments {
            let candidates = self.candidate_row_groups(handle, filter, &mut scan.stats);
            if candidates.is_empty() {
                continue;
            }
            let data = bytes::Bytes::from(self.store.read(&handle.object_path).await?);

            // Bounded read concurrency: at most `default_concurrency` row
            // groups are decoded at a time, sharing one segment buffer.
            for batch in candidates.chunks(self.config.default_concurrency) {
                let reads = batch.iter().map(|&rg| {
                    let data = data.clone();
                    tokio::task::spawn_blocking(move || {
                        SegmentReader::read_row_groups(data, Some(vec![rg]))
                    })
                });
                for joined in futures::future::join_all(reads).await {
                    let rows = joined
                        .map_err(|e| ParqueError::Internal(format!("row-group read: {e}")))??;
                    scan.stats.rows_scanned += rows.len() as u64;
                    for entity in rows {
                        scan.offer_segment_row(entity, &mut resume_skip);
                    }
                }
                if let Some(stop) = early_stop_at {
                    if scan.matched.len() >= stop && resume_skip.is_none() {
                        scan.stats.used_early_termination = true;
                        scan.terminated_early = true;
                        break 'segments;
                    }
                }
            }
        }

        if !scan.terminated_early {
            scan.offer_live_tail(&mut resume_skip, early_stop_at);
        }

        scan.finish(limit, skip, cursor, options)
    }

    /// Count matching rows. Ignores `limit`/`skip`, honors
    /// `include_deleted`.
    pub async fn count(
        &self,
        segments: &[SegmentHandle],
        live: Vec<Entity>,
        filter: &Filter,
        include_deleted: bool,
    ) -> Result<u64> {
        let options = QueryOptions {
            include_deleted,
            ..Default::default()
        };
        let page = self.find(segments, live, filter, &options).await?;
        Ok(page.total)
    }

    /// Row groups that survive pushdown for one segment: the namespace
    /// bloom filter first, then per-row-group hash/bloom probes for the
    /// leading equality conjuncts, then min/max statistics.
    fn candidate_row_groups(
        &self,
        handle: &SegmentHandle,
        filter: &Filter,
        stats: &mut QueryStats,
    ) -> Vec<usize> {
        let total = handle.meta.row_groups.len();
        let mut surviving: HashSet<usize> = (0..total).collect();

        for (field, value) in filter.leading_equalities() {
            let key = index_key(&field, &value);

            if let Some(bloom) = &handle.bloom {
                let candidates: HashSet<usize> =
                    bloom.candidate_row_groups(key.as_bytes()).into_iter().collect();
                surviving.retain(|rg| candidates.contains(rg));
            }
            if let Some(hash) = &handle.hash {
                let candidates: HashSet<usize> = hash
                    .lookup(key.as_bytes())
                    .into_iter()
                    .map(|rg| rg as usize)
                    .collect();
                surviving.retain(|rg| candidates.contains(rg));
            }
        }

        // Min/max statistics prune row groups the filter provably excludes.
        surviving.retain(|&rg| {
            let rg_stats = &handle.meta.row_groups[rg];
            let by_field: HashMap<&str, &crate::segment::FieldStats> = rg_stats
                .fields
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect();
            !filter.excludes_row_group(&by_field)
        });

        stats.row_groups_pruned += (total - surviving.len()) as u64;
        let mut ordered: Vec<usize> = surviving.into_iter().collect();
        ordered.sort_unstable();
        ordered
    }
}

/// Mutable scan state shared by the segment and live-tail passes.
struct Scan<'a> {
    filter: &'a Filter,
    options: &'a QueryOptions,
    /// id → current state for everything in the event-log tail
    live_by_id: HashMap<String, &'a Entity>,
    emitted: HashSet<String>,
    matched: Vec<Entity>,
    stats: QueryStats,
    terminated_early: bool,
}

impl<'a> Scan<'a> {
    fn new(filter: &'a Filter, options: &'a QueryOptions, live: &'a [Entity]) -> Self {
        Self {
            filter,
            options,
            live_by_id: live.iter().map(|e| (e.id.to_string(), e)).collect(),
            emitted: HashSet::new(),
            matched: Vec::new(),
            stats: QueryStats::default(),
            terminated_early: false,
        }
    }

    fn accepts(&self, entity: &Entity) -> bool {
        (self.options.include_deleted || !entity.is_deleted()) && self.filter.matches(entity)
    }

    /// Offer one row read from a segment. The live tail overrides it; ids
    /// are emitted once, at their first appearance in scan order.
    fn offer_segment_row(&mut self, entity: Entity, resume_skip: &mut Option<String>) {
        let id = entity.id.to_string();
        if !self.emitted.insert(id.clone()) {
            return;
        }
        let current = match self.live_by_id.get(&id) {
            Some(live) => (*live).clone(),
            None => entity,
        };
        if !self.accepts(&current) {
            return;
        }
        if let Some(cursor_id) = resume_skip {
            let passed = *cursor_id == id;
            if passed {
                *resume_skip = None;
            }
            return;
        }
        self.matched.push(current);
    }

    /// After the segments, append live-tail entities that never appeared in
    /// a segment, in id order for determinism.
    fn offer_live_tail(&mut self, resume_skip: &mut Option<String>, early_stop_at: Option<usize>) {
        let mut fresh: Vec<&Entity> = self
            .live_by_id
            .values()
            .filter(|e| !self.emitted.contains(&e.id.to_string()))
            .copied()
            .collect();
        fresh.sort_by(|a, b| a.id.cmp(&b.id));

        for entity in fresh {
            self.stats.rows_scanned += 1;
            let id = entity.id.to_string();
            self.emitted.insert(id.clone());
            if !self.accepts(entity) {
                continue;
            }
            if let Some(cursor_id) = resume_skip {
                if *cursor_id == id {
                    *resume_skip = None;
                }
                continue;
            }
            self.matched.push(entity.clone());
            if let Some(stop) = early_stop_at {
                if self.matched.len() >= stop {
                    self.stats.used_early_termination = true;
                    self.terminated_early = true;
                    return;
                }
            }
        }
    }

    fn finish(
        mut self,
        limit: Option<usize>,
        skip: usize,
        cursor: Option<Cursor>,
        options: &QueryOptions,
    ) -> Result<Page> {
        if !options.sort.is_empty() {
            sort_entities(&mut self.matched, &options.sort);
            if let Some(cursor) = &cursor {
                let boundary = (cursor.sort_keys.clone(), cursor.id.clone());
                self.matched.retain(|entity| {
                    composite_cmp(&sort_tuple(entity, &options.sort), &entity.id.to_string(), &boundary, &options.sort)
                        == std::cmp::Ordering::Greater
                });
            }
        }

        let total_matched = self.matched.len() as u64;
        let after_skip: Vec<Entity> = self.matched.into_iter().skip(skip).collect();
        let page_len = limit.unwrap_or(after_skip.len()).min(after_skip.len());
        let has_more = self.terminated_early || after_skip.len() > page_len;
        let page_items: Vec<Entity> = after_skip.into_iter().take(page_len).collect();

        let next_cursor = if has_more {
            page_items.last().map(|last| {
                Cursor::new(
                    &options.sort,
                    last.id.to_string(),
                    sort_tuple(last, &options.sort),
                )
                .encode()
            })
        } else {
            None
        };

        self.stats.rows_returned = page_items.len() as u64;
        let items = page_items
            .iter()
            .map(|entity| project(entity, options.project.as_deref()))
            .collect();

        Ok(Page {
            items,
            total: total_matched,
            has_more,
            next_cursor,
            stats: self.stats,
        })
    }
}

pub(crate) fn sort_tuple(entity: &Entity, sort: &[SortKey]) -> Vec<Value> {
    sort.iter()
        .map(|key| entity.projected_value(&key.field).unwrap_or(Value::Null))
        .collect()
}

/// Compare JSON sort values: nulls sort before any value.
fn json_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    if a == b {
        return Ordering::Equal;
    }
    if json_lt(a, b) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn composite_cmp(
    keys: &[Value],
    id: &str,
    boundary: &(Vec<Value>, String),
    sort: &[SortKey],
) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for (idx, key) in sort.iter().enumerate() {
        let a = keys.get(idx).unwrap_or(&Value::Null);
        let b = boundary.0.get(idx).unwrap_or(&Value::Null);
        let ord = json_cmp(a, b);
        let ord = if key.direction < 0 { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    id.cmp(&boundary.1)
}

pub(crate) fn sort_entities(entities: &mut [Entity], sort: &[SortKey]) {
    entities.sort_by(|a, b| {
        use std::cmp::Ordering;
        for key in sort {
            let av = a.projected_value(&key.field).unwrap_or(Value::Null);
            let bv = b.projected_value(&key.field).unwrap_or(Value::Null);
            let ord = json_cmp(&av, &bv);
            let ord = if key.direction < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        // Ties broken by $id ascending.
        a.id.cmp(&b.id)
    });
}

/// Keep only requested fields; `$id` is always present.
pub(crate) fn project(entity: &Entity, fields: Option<&[String]>) -> Value {
    let doc = entity.to_document();
    let Some(fields) = fields else {
        return doc;
    };
    let Value::Object(full) = doc else {
        return doc;
    };
    let mut out = serde_json::Map::new();
    out.insert("$id".to_string(), full["$id"].clone());
    for field in fields {
        if let Some(value) = full.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    Value::Object(out)
}

//! Columnar segment layer: compacts reconstructed entities into immutable
//! Parquet files, content-addressed by hash.
//!
//! Each segment's footer carries custom key/value metadata with per-row-group
//! statistics for the user fields (the Parquet builtin stats only cover the
//! fixed columns) plus the list of index artifacts built against the segment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, StringBuilder, TimestampMicrosecondArray, TimestampMicrosecondBuilder,
    UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::bloom::SegmentBloomIndex;
use crate::config::StorageConfig;
use crate::entity::{Entity, EntityId};
use crate::error::{ParqueError, Result, StorageErrorKind};
use crate::hash_index::HashIndex;

/// Footer metadata key carrying the segment descriptor.
const META_KEY: &str = "parquedb.segment";

/// Per-field statistics for one row group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldStats {
    pub min: Option<serde_json::Value>,
    pub max: Option<serde_json::Value>,
    pub null_count: u64,
}

/// Statistics for one row group, keyed by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RowGroupStats {
    pub rows: u64,
    pub fields: BTreeMap<String, FieldStats>,
}

/// Descriptor stored in the Parquet footer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SegmentMeta {
    pub namespace: String,
    pub entity_count: u64,
    pub row_groups: Vec<RowGroupStats>,
    /// Index artifact object names built against this segment
    pub index_artifacts: Vec<String>,
    /// Highest event-log offset folded into this segment
    pub event_log_offset: u64,
}

/// A fully built segment: Parquet bytes plus its index artifacts, ready to
/// be published through the object store.
pub struct SegmentBuild {
    /// Content-addressed object name, `seg-<hash>.parquet`
    pub name: String,
    pub data: Vec<u8>,
    pub meta: SegmentMeta,
    pub bloom: SegmentBloomIndex,
    pub hash: HashIndex,
}

impl SegmentBuild {
    pub fn bloom_name(&self) -> String {
        format!("{}.bloom", self.name.trim_end_matches(".parquet"))
    }

    pub fn hash_name(&self) -> String {
        format!("{}.hash", self.name.trim_end_matches(".parquet"))
    }
}

fn segment_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("entity_id", DataType::Utf8, false),
        Field::new("entity_type", DataType::Utf8, false),
        Field::new("version", DataType::UInt64, false),
        Field::new(
            "created_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new("created_by", DataType::Utf8, true),
        Field::new(
            "updated_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new("updated_by", DataType::Utf8, true),
        Field::new(
            "deleted_at",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            true,
        ),
        Field::new("deleted_by", DataType::Utf8, true),
        Field::new("fields", DataType::Utf8, false),
    ]))
}

/// Canonical byte form of `(field, value)` shared by the bloom and hash
/// index builders and the query-side probes.
pub fn index_key(field: &str, value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("{field}={s}"),
        other => format!("{field}={other}"),
    }
}

/// Writes one namespace's entities into an immutable Parquet segment.
pub struct SegmentWriter {
    config: StorageConfig,
}

impl SegmentWriter {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Build a segment from reconstructed entities. Entities are written in
    /// id order so row-group statistics stay selective.
    pub fn build(
        &self,
        namespace: &str,
        mut entities: Vec<Entity>,
        event_log_offset: u64,
    ) -> Result<SegmentBuild> {
        if entities.is_empty() {
            return Err(ParqueError::Internal(
                "refusing to build an empty segment".to_string(),
            ));
        }
        entities.sort_by(|a, b| a.id.cmp(&b.id));

        let schema = segment_schema();
        let chunk_size = self.config.row_group_size.max(1);

        // Per-row-group statistics and index values, aligned with the
        // batches handed to the writer.
        let mut row_groups = Vec::new();
        let mut index_values: Vec<Vec<String>> = Vec::new();
        let mut batches = Vec::new();
        for chunk in entities.chunks(chunk_size) {
            row_groups.push(row_group_stats(chunk));
            index_values.push(chunk.iter().flat_map(entity_index_keys).collect());
            batches.push(entities_to_batch(&schema, chunk)?);
        }

        let bloom = SegmentBloomIndex::build(&index_values, self.config.bloom_fpr);
        let hash = HashIndex::build(&index_values);

        // The segment is content-addressed, so full artifact names cannot be
        // embedded in the footer; the footer lists artifact kinds and the
        // names derive from the segment name (`<stem>.bloom`, `<stem>.hash`).
        let meta = SegmentMeta {
            namespace: namespace.to_string(),
            entity_count: entities.len() as u64,
            row_groups,
            index_artifacts: vec!["bloom".to_string(), "hash".to_string()],
            event_log_offset,
        };

        let meta_json = serde_json::to_string(&meta)?;
        let props = WriterProperties::builder()
            .set_compression(self.config.compression.to_parquet())
            .set_max_row_group_size(chunk_size)
            .set_key_value_metadata(Some(vec![KeyValue::new(
                META_KEY.to_string(),
                meta_json,
            )]))
            .build();

        let mut data = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut data, Arc::clone(&schema), Some(props))?;
        for batch in &batches {
            writer.write(batch)?;
        }
        writer.close()?;

        let digest = Sha256::digest(&data);
        let hash_hex: String = format!("{digest:x}").chars().take(16).collect();
        let name = format!("seg-{hash_hex}.parquet");

        tracing::debug!(
            "built segment {name} for {namespace}: {} entities, {} row group(s), {} bytes",
            meta.entity_count,
            meta.row_groups.len(),
            data.len()
        );

        Ok(SegmentBuild {
            name,
            data,
            meta,
            bloom,
            hash,
        })
    }
}

/// Index keys for every scalar top-level field of an entity, plus its id.
fn entity_index_keys(entity: &Entity) -> Vec<String> {
    let mut keys = vec![index_key("$id", &serde_json::json!(entity.id.to_string()))];
    for (field, value) in &entity.fields {
        match value {
            serde_json::Value::Object(_) => {}
            serde_json::Value::Array(items) => {
                for item in items {
                    if !item.is_object() && !item.is_array() {
                        keys.push(index_key(field, item));
                    }
                }
            }
            scalar => keys.push(index_key(field, scalar)),
        }
    }
    keys
}

fn row_group_stats(entities: &[Entity]) -> RowGroupStats {
    let mut fields: BTreeMap<String, FieldStats> = BTreeMap::new();
    let mut seen: HashMap<String, u64> = HashMap::new();

    for entity in entities {
        for (name, value) in &entity.fields {
            if value.is_object() || value.is_array() {
                continue;
            }
            *seen.entry(name.clone()).or_default() += 1;
            let stats = fields.entry(name.clone()).or_default();
            if value.is_null() {
                continue;
            }
            if stats.min.as_ref().map(|m| json_lt(value, m)).unwrap_or(true) {
                stats.min = Some(value.clone());
            }
            if stats.max.as_ref().map(|m| json_lt(m, value)).unwrap_or(true) {
                stats.max = Some(value.clone());
            }
        }
    }

    // Entities missing a field count as nulls for that field's stats.
    for (name, stats) in fields.iter_mut() {
        let present = seen.get(name).copied().unwrap_or(0);
        let nulls_inline = entities
            .iter()
            .filter(|e| e.fields.get(name).map(|v| v.is_null()).unwrap_or(false))
            .count() as u64;
        stats.null_count = (entities.len() as u64 - present) + nulls_inline;
    }

    RowGroupStats {
        rows: entities.len() as u64,
        fields,
    }
}

/// Total order over scalar JSON values: null < number < string < bool.
pub fn json_lt(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            Value::Bool(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(0.0) < y.as_f64().unwrap_or(0.0)
        }
        (Value::String(x), Value::String(y)) => x < y,
        (Value::Bool(x), Value::Bool(y)) => x < y,
        _ => rank(a) < rank(b),
    }
}

fn entities_to_batch(schema: &Arc<Schema>, entities: &[Entity]) -> Result<RecordBatch> {
    let mut entity_id = StringBuilder::new();
    let mut entity_type = StringBuilder::new();
    let mut version = UInt64Builder::new();
    let mut created_at = TimestampMicrosecondBuilder::new();
    let mut created_by = StringBuilder::new();
    let mut updated_at = TimestampMicrosecondBuilder::new();
    let mut updated_by = StringBuilder::new();
    let mut deleted_at = TimestampMicrosecondBuilder::new();
    let mut deleted_by = StringBuilder::new();
    let mut fields = StringBuilder::new();

    for entity in entities {
        entity_id.append_value(entity.id.to_string());
        entity_type.append_value(&entity.entity_type);
        version.append_value(entity.version);
        created_at.append_value(entity.created_at.timestamp_micros());
        append_opt(&mut created_by, &entity.created_by);
        updated_at.append_value(entity.updated_at.timestamp_micros());
        append_opt(&mut updated_by, &entity.updated_by);
        match entity.deleted_at {
            Some(ts) => deleted_at.append_value(ts.timestamp_micros()),
            None => deleted_at.append_null(),
        }
        append_opt(&mut deleted_by, &entity.deleted_by);
        fields.append_value(serde_json::to_string(&entity.fields)?);
    }

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(entity_id.finish()),
        Arc::new(entity_type.finish()),
        Arc::new(version.finish()),
        Arc::new(created_at.finish()),
        Arc::new(created_by.finish()),
        Arc::new(updated_at.finish()),
        Arc::new(updated_by.finish()),
        Arc::new(deleted_at.finish()),
        Arc::new(deleted_by.finish()),
        Arc::new(fields.finish()),
    ];

    Ok(RecordBatch::try_new(Arc::clone(schema), arrays)?)
}

fn append_opt(builder: &mut StringBuilder, value: &Option<String>) {
    match value {
        Some(v) => builder.append_value(v),
        None => builder.append_null(),
    }
}

/// Read-side companion of [`SegmentWriter`].
pub struct SegmentReader;

impl SegmentReader {
    /// Extract the segment descriptor from the Parquet footer.
    pub fn read_meta(data: &[u8]) -> Result<SegmentMeta> {
        let bytes = bytes::Bytes::copy_from_slice(data);
        let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
        let kv = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|kvs| kvs.iter().find(|kv| kv.key == META_KEY))
            .and_then(|kv| kv.value.clone())
            .ok_or_else(|| ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                detail: "segment footer missing descriptor".to_string(),
            })?;
        Ok(serde_json::from_str(&kv)?)
    }

    /// Read the selected row groups back into entities. `None` reads the
    /// whole segment. Takes `Bytes` so concurrent readers share one buffer.
    pub fn read_row_groups(data: bytes::Bytes, selection: Option<Vec<usize>>) -> Result<Vec<Entity>> {
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(data)?;
        if let Some(groups) = selection {
            builder = builder.with_row_groups(groups);
        }
        let reader = builder.build()?;

        let mut entities = Vec::new();
        for batch in reader {
            let batch = batch?;
            entities.extend(batch_to_entities(&batch)?);
        }
        Ok(entities)
    }
}

fn batch_to_entities(batch: &RecordBatch) -> Result<Vec<Entity>> {
    let string_col = |idx: usize, name: &str| -> Result<&arrow::array::StringArray> {
        batch
            .column(idx)
            .as_any()
            .downcast_ref::<arrow::array::StringArray>()
            .ok_or_else(|| ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                detail: format!("invalid {name} column"),
            })
    };
    let ts_col = |idx: usize, name: &str| -> Result<&TimestampMicrosecondArray> {
        batch
            .column(idx)
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .ok_or_else(|| ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                detail: format!("invalid {name} column"),
            })
    };

    let entity_ids = string_col(0, "entity_id")?;
    let entity_types = string_col(1, "entity_type")?;
    let versions = batch
        .column(2)
        .as_any()
        .downcast_ref::<arrow::array::UInt64Array>()
        .ok_or_else(|| ParqueError::Storage {
            kind: StorageErrorKind::Corrupted,
            detail: "invalid version column".to_string(),
        })?;
    let created_ats = ts_col(3, "created_at")?;
    let created_bys = string_col(4, "created_by")?;
    let updated_ats = ts_col(5, "updated_at")?;
    let updated_bys = string_col(6, "updated_by")?;
    let deleted_ats = ts_col(7, "deleted_at")?;
    let deleted_bys = string_col(8, "deleted_by")?;
    let fields = string_col(9, "fields")?;

    let timestamp = |micros: i64| {
        DateTime::from_timestamp_micros(micros).ok_or_else(|| ParqueError::Storage {
            kind: StorageErrorKind::Corrupted,
            detail: format!("invalid timestamp {micros}"),
        })
    };
    let opt_string = |arr: &arrow::array::StringArray, i: usize| {
        if arr.is_null(i) {
            None
        } else {
            Some(arr.value(i).to_string())
        }
    };

    let mut entities = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        entities.push(Entity {
            id: EntityId::parse(entity_ids.value(i))?,
            entity_type: entity_types.value(i).to_string(),
            version: versions.value(i),
            created_at: timestamp(created_ats.value(i))?,
            created_by: opt_string(created_bys, i),
            updated_at: timestamp(updated_ats.value(i))?,
            updated_by: opt_string(updated_bys, i),
            deleted_at: if deleted_ats.is_null(i) {
                None
            } else {
                Some(timestamp(deleted_ats.value(i))?)
            },
            deleted_by: opt_string(deleted_bys, i),
            fields: serde_json::from_str(fields.value(i))?,
        });
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn entities(count: usize) -> Vec<Entity> {
        (0..count)
            .map(|i| {
                let mut e = Entity::new(
                    EntityId::new("posts", format!("p{i:04}")),
                    "Post",
                    Utc::now(),
                );
                e.version = 1;
                e.fields.insert("title".to_string(), json!(format!("title {i}")));
                e.fields.insert("views".to_string(), json!(i));
                e
            })
            .collect()
    }

    fn writer() -> SegmentWriter {
        SegmentWriter::new(StorageConfig {
            row_group_size: 10,
            ..Default::default()
        })
    }

    #[test]
    fn test_build_and_read_round_trip() {
        let build = writer().build("posts", entities(25), 25).unwrap();
        assert!(build.name.starts_with("seg-"));
        assert_eq!(build.meta.entity_count, 25);
        assert_eq!(build.meta.row_groups.len(), 3);

        let read = SegmentReader::read_row_groups(bytes::Bytes::from(build.data.clone()), None).unwrap();
        assert_eq!(read.len(), 25);
        assert_eq!(read[0].id.to_string(), "posts/p0000");
        assert_eq!(read[0].fields["views"], json!(0));
    }

    #[test]
    fn test_footer_meta_round_trip() {
        let build = writer().build("posts", entities(25), 99).unwrap();
        let meta = SegmentReader::read_meta(&build.data).unwrap();
        assert_eq!(meta.namespace, "posts");
        assert_eq!(meta.entity_count, 25);
        assert_eq!(meta.event_log_offset, 99);
        assert_eq!(meta.row_groups.len(), 3);
        assert_eq!(meta.row_groups[0].rows, 10);
    }

    #[test]
    fn test_row_group_selection_reads_subset() {
        let build = writer().build("posts", entities(25), 25).unwrap();
        let read = SegmentReader::read_row_groups(bytes::Bytes::from(build.data.clone()), Some(vec![1])).unwrap();
        assert_eq!(read.len(), 10);
        assert_eq!(read[0].id.to_string(), "posts/p0010");
    }

    #[test]
    fn test_row_group_stats_min_max() {
        let build = writer().build("posts", entities(25), 25).unwrap();
        let rg0 = &build.meta.row_groups[0];
        let views = &rg0.fields["views"];
        assert_eq!(views.min, Some(json!(0)));
        assert_eq!(views.max, Some(json!(9)));
        assert_eq!(views.null_count, 0);
    }

    #[test]
    fn test_bloom_covers_row_group_values() {
        let build = writer().build("posts", entities(25), 25).unwrap();
        // Every value present in the segment must be a bloom candidate.
        for i in 0..25 {
            let key = index_key("views", &json!(i));
            assert!(build.bloom.might_contain(key.as_bytes()));
        }
        // The hash index narrows to the owning row group.
        let key = index_key("title", &json!("title 12"));
        assert_eq!(build.hash.lookup(key.as_bytes()), vec![1]);
    }

    #[test]
    fn test_content_addressed_name_is_stable_for_same_input() {
        let input = entities(5);
        let a = writer().build("posts", input.clone(), 5).unwrap();
        let b = writer().build("posts", input, 5).unwrap();
        assert_eq!(a.name, b.name);
    }

    #[test]
    fn test_compression_codecs_accepted() {
        use crate::config::CompressionCodec;
        for codec in [
            CompressionCodec::Uncompressed,
            CompressionCodec::Snappy,
            CompressionCodec::Zstd,
            CompressionCodec::Gzip,
            CompressionCodec::Lz4,
        ] {
            let writer = SegmentWriter::new(StorageConfig {
                compression: codec,
                row_group_size: 10,
                ..Default::default()
            });
            let build = writer.build("posts", entities(5), 5).unwrap();
            assert_eq!(
                SegmentReader::read_row_groups(bytes::Bytes::from(build.data.clone()), None).unwrap().len(),
                5
            );
        }
    }

    #[test]
    fn test_empty_segment_refused() {
        assert!(writer().build("posts", Vec::new(), 0).is_err());
    }

    #[test]
    fn test_deleted_entities_round_trip() {
        let mut all = entities(3);
        all[1].deleted_at = Some(Utc::now());
        all[1].deleted_by = Some("admin".to_string());

        let build = writer().build("posts", all, 3).unwrap();
        let read = SegmentReader::read_row_groups(bytes::Bytes::from(build.data.clone()), None).unwrap();
        assert!(read[1].is_deleted());
        assert_eq!(read[1].deleted_by.as_deref(), Some("admin"));
        assert!(!read[0].is_deleted());
    }
}

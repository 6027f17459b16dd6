//! Export and import: Parquet round-trips plus the text formats the CLI
//! serves (`json`, `ndjson`, `csv`).

use crate::config::StorageConfig;
use crate::entity::Entity;
use crate::error::{ParqueError, Result};
use crate::segment::{SegmentReader, SegmentWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Ndjson,
    Csv,
}

impl ExportFormat {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "ndjson" => Ok(Self::Ndjson),
            "csv" => Ok(Self::Csv),
            other => Err(ParqueError::Validation {
                field: "format".to_string(),
                reason: format!("unknown export format `{other}`"),
            }),
        }
    }
}

/// Export entities to Parquet bytes. `import_parquet` restores an
/// equivalent entity set (audit fields included, since the segment schema
/// carries them).
pub fn export_parquet(
    namespace: &str,
    entities: Vec<Entity>,
    config: &StorageConfig,
) -> Result<Vec<u8>> {
    let writer = SegmentWriter::new(config.clone());
    let count = entities.len() as u64;
    let build = writer.build(namespace, entities, count)?;
    Ok(build.data)
}

pub fn import_parquet(data: &[u8]) -> Result<Vec<Entity>> {
    SegmentReader::read_row_groups(bytes::Bytes::copy_from_slice(data), None)
}

/// Render entities in one of the CLI text formats.
pub fn export_text(entities: &[Entity], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => {
            let docs: Vec<serde_json::Value> = entities.iter().map(Entity::to_document).collect();
            Ok(serde_json::to_string_pretty(&docs)?)
        }
        ExportFormat::Ndjson => {
            let mut out = String::new();
            for entity in entities {
                out.push_str(&serde_json::to_string(&entity.to_document())?);
                out.push('\n');
            }
            Ok(out)
        }
        ExportFormat::Csv => export_csv(entities),
    }
}

fn export_csv(entities: &[Entity]) -> Result<String> {
    // Header: fixed columns, then the sorted union of user fields.
    let mut user_fields: Vec<String> = entities
        .iter()
        .flat_map(|e| e.fields.keys().cloned())
        .collect();
    user_fields.sort();
    user_fields.dedup();

    let mut out = String::new();
    out.push_str("$id,$type,version");
    for field in &user_fields {
        out.push(',');
        out.push_str(&csv_escape(field));
    }
    out.push('\n');

    for entity in entities {
        out.push_str(&csv_escape(&entity.id.to_string()));
        out.push(',');
        out.push_str(&csv_escape(&entity.entity_type));
        out.push(',');
        out.push_str(&entity.version.to_string());
        for field in &user_fields {
            out.push(',');
            if let Some(value) = entity.fields.get(field) {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&csv_escape(&rendered));
            }
        }
        out.push('\n');
    }
    Ok(out)
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use chrono::Utc;
    use serde_json::json;

    fn entities() -> Vec<Entity> {
        (0..5)
            .map(|i| {
                let mut e = Entity::new(
                    EntityId::new("posts", format!("p{i}")),
                    "Post",
                    Utc::now(),
                );
                e.version = i + 1;
                e.fields.insert("title".to_string(), json!(format!("t{i}")));
                e.fields.insert("views".to_string(), json!(i * 10));
                e
            })
            .collect()
    }

    #[test]
    fn test_parquet_round_trip_restores_entity_set() {
        let config = StorageConfig::default();
        let original = entities();
        let bytes = export_parquet("posts", original.clone(), &config).unwrap();
        let restored = import_parquet(&bytes).unwrap();

        assert_eq!(restored.len(), original.len());
        for (a, b) in original.iter().zip(restored.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.version, b.version);
            assert_eq!(a.fields, b.fields);
        }
    }

    #[test]
    fn test_json_and_ndjson() {
        let text = export_text(&entities(), ExportFormat::Json).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.len(), 5);
        assert_eq!(parsed[0]["$id"], json!("posts/p0"));

        let text = export_text(&entities(), ExportFormat::Ndjson).unwrap();
        assert_eq!(text.lines().count(), 5);
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["title"], json!("t0"));
    }

    #[test]
    fn test_csv_header_and_escaping() {
        let mut rows = entities();
        rows[0]
            .fields
            .insert("title".to_string(), json!("has, comma \"quoted\""));

        let text = export_text(&rows, ExportFormat::Csv).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "$id,$type,version,title,views");
        let first = lines.next().unwrap();
        assert!(first.starts_with("posts/p0,Post,1,"));
        assert!(first.contains("\"has, comma \"\"quoted\"\"\""));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse("JSON").unwrap(), ExportFormat::Json);
        assert_eq!(ExportFormat::parse("ndjson").unwrap(), ExportFormat::Ndjson);
        assert!(ExportFormat::parse("parquet-ish").is_err());
    }
}

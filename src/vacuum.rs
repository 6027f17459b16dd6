//! Vacuum workflow: reclaims orphaned segment and index files.
//!
//! An orphan is a file under the segment prefix that no live namespace
//! manifest references. Orphans younger than the retention period are never
//! deleted, even when unreferenced, so an in-flight compaction that has
//! written its segment but not yet advanced the manifest cannot lose data.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::manifest::NamespaceManifest;
use crate::object_store::ObjectStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct VacuumReport {
    pub files_scanned: u64,
    pub orphans_found: u64,
    pub files_deleted: u64,
    pub bytes_recovered: u64,
    pub dry_run: bool,
    /// Deletion errors; partial success is still reported
    pub errors: Vec<String>,
}

pub struct Vacuum {
    store: Arc<dyn ObjectStore>,
    /// Object prefix holding segments and index artifacts
    prefix: String,
    retention_ms: i64,
}

impl Vacuum {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, retention_ms: i64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            retention_ms,
        }
    }

    /// Collect every object name referenced by a live namespace manifest:
    /// the segments themselves plus their derived index artifacts.
    async fn live_references(&self) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        for meta in self.store.list("manifests/").await? {
            let data = self.store.read(&meta.path).await?;
            let manifest: NamespaceManifest = match serde_json::from_slice(&data) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!("unreadable manifest {}: {e}; keeping everything", meta.path);
                    // An unreadable manifest makes every file potentially
                    // live; bail out rather than guess.
                    return Err(e.into());
                }
            };
            for segment in &manifest.segments {
                let stem = segment.name.trim_end_matches(".parquet");
                referenced.insert(format!("{}/{}", self.prefix, segment.name));
                referenced.insert(format!("{}/{stem}.bloom", self.prefix));
                referenced.insert(format!("{}/{stem}.hash", self.prefix));
            }
        }
        Ok(referenced)
    }

    /// Scan for orphans and (unless `dry_run`) delete the expired ones.
    pub async fn run(&self, dry_run: bool) -> Result<VacuumReport> {
        let referenced = self.live_references().await?;
        let cutoff = Utc::now() - Duration::milliseconds(self.retention_ms);

        let mut report = VacuumReport {
            dry_run,
            ..Default::default()
        };

        for object in self.store.list(&format!("{}/", self.prefix)).await? {
            report.files_scanned += 1;
            if referenced.contains(&object.path) {
                continue;
            }
            report.orphans_found += 1;

            if object.last_modified > cutoff {
                tracing::debug!(
                    "orphan {} is within retention ({}); keeping",
                    object.path,
                    object.last_modified
                );
                continue;
            }
            if dry_run {
                continue;
            }

            match self.store.delete(&object.path).await {
                Ok(()) => {
                    report.files_deleted += 1;
                    report.bytes_recovered += object.size;
                    tracing::info!("🗑️ vacuumed orphan {} ({} bytes)", object.path, object.size);
                }
                Err(e) => {
                    report.errors.push(format!("{}: {e}", object.path));
                }
            }
        }

        tracing::info!(
            "vacuum complete: {} scanned, {} orphan(s), {} deleted, {} bytes recovered{}",
            report.files_scanned,
            report.orphans_found,
            report.files_deleted,
            report.bytes_recovered,
            if dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }
}

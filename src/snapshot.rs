use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SnapshotConfig;
use crate::entity::{Entity, EntityId};
use crate::error::{EventErrorKind, ParqueError, Result};

/// Reconstructed entity state at an event sequence. Replaying events with
/// sequence greater than `seq` over `state` yields the same result as
/// replaying from creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier
    pub id: Uuid,

    /// Entity this snapshot represents
    pub entity_id: EntityId,

    /// Number of events folded into `state` (events `0..seq`)
    pub seq: u64,

    /// The reconstructed state at `seq`
    pub state: Entity,

    /// Timestamp of the last event included
    pub as_of: DateTime<Utc>,

    /// Timestamp when this snapshot was created
    pub created_at: DateTime<Utc>,

    pub snapshot_type: SnapshotType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotStats {
    pub total_snapshots: usize,
    pub total_entities: usize,
    pub snapshots_created: u64,
    pub snapshots_pruned: u64,
}

/// Manages per-entity snapshots to bound event replay cost.
pub struct SnapshotManager {
    /// Snapshots organized by entity, newest first
    snapshots: Arc<RwLock<HashMap<EntityId, Vec<Snapshot>>>>,

    config: SnapshotConfig,

    stats: Arc<RwLock<SnapshotStats>>,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            config,
            stats: Arc::new(RwLock::new(SnapshotStats::default())),
        }
    }

    /// Record a new snapshot. Snapshotting a deleted entity is refused.
    pub fn create_snapshot(
        &self,
        state: Entity,
        seq: u64,
        as_of: DateTime<Utc>,
        snapshot_type: SnapshotType,
    ) -> Result<Snapshot> {
        if state.is_deleted() {
            return Err(ParqueError::Event {
                operation: "snapshot".to_string(),
                entity_id: Some(state.id.to_string()),
                kind: EventErrorKind::OnDeleted,
            });
        }

        let entity_id = state.id.clone();
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            entity_id: entity_id.clone(),
            seq,
            state,
            as_of,
            created_at: Utc::now(),
            snapshot_type,
        };

        let mut snapshots = self.snapshots.write();
        let entity_snapshots = snapshots.entry(entity_id.clone()).or_default();
        entity_snapshots.push(snapshot.clone());
        entity_snapshots.sort_by(|a, b| b.seq.cmp(&a.seq));

        let mut pruned = 0;
        if entity_snapshots.len() > self.config.max_snapshots_per_entity {
            pruned = entity_snapshots.len() - self.config.max_snapshots_per_entity;
            entity_snapshots.truncate(self.config.max_snapshots_per_entity);
        }

        let mut stats = self.stats.write();
        stats.snapshots_created += 1;
        stats.snapshots_pruned += pruned as u64;
        stats.total_snapshots = snapshots.values().map(Vec::len).sum();
        stats.total_entities = snapshots.len();
        drop(stats);

        tracing::debug!(
            "📸 snapshot for {entity_id} at seq {seq} ({:?})",
            snapshot.snapshot_type
        );
        Ok(snapshot)
    }

    /// Latest snapshot for an entity, if any.
    pub fn latest(&self, entity_id: &EntityId) -> Option<Snapshot> {
        self.snapshots
            .read()
            .get(entity_id)
            .and_then(|snaps| snaps.first().cloned())
    }

    /// Best snapshot whose last included event is at or before `as_of`.
    pub fn latest_at(&self, entity_id: &EntityId, as_of: DateTime<Utc>) -> Option<Snapshot> {
        self.snapshots.read().get(entity_id).and_then(|snaps| {
            snaps
                .iter()
                .filter(|s| s.as_of <= as_of)
                .max_by_key(|s| s.seq)
                .cloned()
        })
    }

    /// Decide whether the auto-snapshot policy fires: either enough events
    /// accumulated since the last snapshot, or the last snapshot is too old.
    pub fn should_snapshot(
        &self,
        entity_id: &EntityId,
        event_count: u64,
        last_event_time: DateTime<Utc>,
    ) -> bool {
        if !self.config.auto_snapshot {
            return false;
        }
        let threshold = self.config.auto_snapshot_threshold as u64;
        match self.latest(entity_id) {
            None => event_count >= threshold,
            Some(latest) => {
                event_count.saturating_sub(latest.seq) >= threshold
                    || (last_event_time - latest.as_of).num_seconds()
                        >= self.config.time_threshold_seconds
            }
        }
    }

    /// Drop all snapshots for an entity (hard delete, branch delete).
    pub fn remove_entity(&self, entity_id: &EntityId) -> usize {
        let mut snapshots = self.snapshots.write();
        let removed = snapshots.remove(entity_id).map(|v| v.len()).unwrap_or(0);
        let mut stats = self.stats.write();
        stats.total_snapshots = stats.total_snapshots.saturating_sub(removed);
        stats.total_entities = snapshots.len();
        removed
    }

    pub fn stats(&self) -> SnapshotStats {
        (*self.stats.read()).clone()
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(n: u64) -> Entity {
        let mut e = Entity::new(EntityId::new("posts", "p1"), "Post", Utc::now());
        e.version = n;
        e
    }

    fn manager() -> SnapshotManager {
        SnapshotManager::new(SnapshotConfig::default())
    }

    #[test]
    fn test_create_and_latest() {
        let m = manager();
        m.create_snapshot(entity(1), 10, Utc::now(), SnapshotType::Manual)
            .unwrap();
        m.create_snapshot(entity(2), 20, Utc::now(), SnapshotType::Automatic)
            .unwrap();

        let latest = m.latest(&EntityId::new("posts", "p1")).unwrap();
        assert_eq!(latest.seq, 20);
        assert_eq!(latest.state.version, 2);
    }

    #[test]
    fn test_latest_at_picks_covering_snapshot() {
        let m = manager();
        let t1 = Utc::now();
        m.create_snapshot(entity(1), 10, t1, SnapshotType::Automatic)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = Utc::now();
        m.create_snapshot(entity(2), 20, t2, SnapshotType::Automatic)
            .unwrap();

        let id = EntityId::new("posts", "p1");
        assert_eq!(m.latest_at(&id, t1).unwrap().seq, 10);
        assert_eq!(m.latest_at(&id, t2).unwrap().seq, 20);
    }

    #[test]
    fn test_snapshot_on_deleted_refused() {
        let m = manager();
        let mut deleted = entity(3);
        deleted.deleted_at = Some(Utc::now());

        let err = m
            .create_snapshot(deleted, 5, Utc::now(), SnapshotType::Manual)
            .unwrap_err();
        assert!(matches!(
            err,
            ParqueError::Event {
                kind: EventErrorKind::OnDeleted,
                ..
            }
        ));
    }

    #[test]
    fn test_pruning_keeps_newest() {
        let m = SnapshotManager::new(SnapshotConfig {
            max_snapshots_per_entity: 3,
            ..Default::default()
        });
        for seq in 0..6 {
            m.create_snapshot(entity(seq), seq * 10, Utc::now(), SnapshotType::Automatic)
                .unwrap();
        }
        let latest = m.latest(&EntityId::new("posts", "p1")).unwrap();
        assert_eq!(latest.seq, 50);
        assert_eq!(m.stats().total_snapshots, 3);
        assert_eq!(m.stats().snapshots_pruned, 3);
    }

    #[test]
    fn test_should_snapshot_dual_trigger() {
        let m = SnapshotManager::new(SnapshotConfig {
            auto_snapshot_threshold: 100,
            time_threshold_seconds: 3600,
            ..Default::default()
        });
        let id = EntityId::new("posts", "p1");

        assert!(!m.should_snapshot(&id, 50, Utc::now()));
        assert!(m.should_snapshot(&id, 100, Utc::now()));

        m.create_snapshot(entity(1), 100, Utc::now(), SnapshotType::Automatic)
            .unwrap();
        assert!(!m.should_snapshot(&id, 150, Utc::now()));
        assert!(m.should_snapshot(&id, 200, Utc::now()));
        assert!(m.should_snapshot(&id, 101, Utc::now() + chrono::Duration::hours(2)));
    }
}

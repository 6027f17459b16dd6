use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// Process-wide monotonic counter so that ids minted within the same
/// millisecond still sort in append order.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Sortable lexicographic event identifier. Ordering by id equals ordering
/// by append time: the id is the zero-padded hex timestamp followed by a
/// monotonic sequence component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate(ts: DateTime<Utc>) -> Self {
        let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:012x}-{:08x}", ts.timestamp_millis(), seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mutation operator recorded by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOp {
    Create,
    Update,
    Delete,
}

/// An immutable, append-only fact describing a single mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Sortable lexicographic identifier
    pub id: EventId,

    /// Timestamp when the mutation occurred
    pub ts: DateTime<Utc>,

    /// Mutation operator
    pub op: EventOp,

    /// Target entity in `ns:id` form
    pub target: String,

    /// State before the mutation (DELETE records the deleted state here)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,

    /// Mutation payload: full document for CREATE, update operators for UPDATE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,

    /// Who performed the mutation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

impl Event {
    pub fn create(entity: &EntityId, after: serde_json::Value, actor: Option<String>) -> Self {
        Self::with_op(entity, EventOp::Create, None, Some(after), actor)
    }

    pub fn update(
        entity: &EntityId,
        before: Option<serde_json::Value>,
        ops: serde_json::Value,
        actor: Option<String>,
    ) -> Self {
        Self::with_op(entity, EventOp::Update, before, Some(ops), actor)
    }

    pub fn delete(
        entity: &EntityId,
        before: Option<serde_json::Value>,
        actor: Option<String>,
    ) -> Self {
        Self::with_op(entity, EventOp::Delete, before, None, actor)
    }

    fn with_op(
        entity: &EntityId,
        op: EventOp,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        actor: Option<String>,
    ) -> Self {
        let ts = Utc::now();
        Self {
            id: EventId::generate(ts),
            ts,
            op,
            target: entity.target(),
            before,
            after,
            actor,
        }
    }

    /// Namespace component of the target.
    pub fn namespace(&self) -> &str {
        self.target.split(':').next().unwrap_or(&self.target)
    }

    /// True when this event mutates the given entity. Compared without
    /// materializing the target string; this sits on the replay hot path.
    pub fn touches(&self, entity: &EntityId) -> bool {
        let ns = entity.namespace.as_str();
        let id = entity.local_id.as_str();
        self.target.len() == ns.len() + id.len() + 1
            && self.target.as_bytes()[ns.len()] == b':'
            && self.target.starts_with(ns)
            && self.target.ends_with(id)
    }
}

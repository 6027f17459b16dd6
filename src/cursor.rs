//! Opaque, value-based pagination cursors.
//!
//! A cursor encodes the last row's sort-key tuple plus its id, together with
//! a hash of the sort spec that produced it. Being value-based rather than
//! file-based, cursors survive compaction; changing the sort while
//! paginating is detected through the hash and rejected.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ParqueError, QueryErrorKind, Result};

/// One sort key: field name and direction (+1 ascending, -1 descending).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// Hash of the sort spec this cursor was minted under
    pub sort_spec_hash: String,

    /// Entity id of the last returned row
    pub id: String,

    /// Sort-key values of the last returned row, in sort-spec order
    pub sort_keys: Vec<serde_json::Value>,
}

/// Stable hash of a sort spec; an empty spec hashes too, so unsorted
/// pagination is protected the same way.
pub fn sort_spec_hash(sort: &[SortKey]) -> String {
    let mut hasher = Sha256::new();
    for key in sort {
        hasher.update(key.field.as_bytes());
        hasher.update([key.direction as u8]);
    }
    let digest = hasher.finalize();
    format!("{digest:x}").chars().take(16).collect()
}

impl Cursor {
    pub fn new(sort: &[SortKey], id: String, sort_keys: Vec<serde_json::Value>) -> Self {
        Self {
            sort_spec_hash: sort_spec_hash(sort),
            id,
            sort_keys,
        }
    }

    /// Serialize to the opaque wire form.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode and validate against the query's sort spec.
    pub fn decode(token: &str, sort: &[SortKey]) -> Result<Self> {
        let invalid = |detail: &str| {
            ParqueError::query(QueryErrorKind::InvalidCursor, format!("invalid cursor: {detail}"))
        };

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| invalid("not base64"))?;
        let cursor: Self =
            serde_json::from_slice(&bytes).map_err(|_| invalid("malformed payload"))?;

        if cursor.sort_spec_hash != sort_spec_hash(sort) {
            return Err(invalid("sort spec changed between pages"));
        }
        if cursor.sort_keys.len() != sort.len() {
            return Err(invalid("sort key arity mismatch"));
        }
        Ok(cursor)
    }
}

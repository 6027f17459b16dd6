use serde_json::{Map, Value};

use crate::entity::Entity;
use crate::error::{ParqueError, Result};

/// Parsed update document: `{$set, $unset, $inc, $push, $pull, $link, $unlink}`.
///
/// `$link`/`$unlink` are carried through to the relationship engine; the
/// remaining operators mutate the entity's own fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOps {
    pub set: Map<String, Value>,
    pub unset: Vec<String>,
    pub inc: Map<String, Value>,
    pub push: Map<String, Value>,
    pub pull: Map<String, Value>,
    pub link: Vec<LinkOp>,
    pub unlink: Vec<UnlinkOp>,
}

/// One `$link` entry: relation name plus one or more target ids.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOp {
    pub relation: String,
    pub targets: Vec<String>,
}

/// One `$unlink` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UnlinkOp {
    pub relation: String,
    pub removal: UnlinkTargets,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnlinkTargets {
    All,
    Ids(Vec<String>),
}

impl UpdateOps {
    /// Parse an update document. Unknown `$` operators and non-object
    /// operator payloads are rejected.
    pub fn parse(doc: &Value) -> Result<Self> {
        let obj = doc.as_object().ok_or_else(|| ParqueError::Validation {
            field: "update".to_string(),
            reason: "update document must be an object".to_string(),
        })?;

        let mut ops = UpdateOps::default();
        for (key, value) in obj {
            match key.as_str() {
                "$set" => ops.set = expect_object(key, value)?,
                "$unset" => {
                    ops.unset = expect_object(key, value)?.keys().cloned().collect();
                }
                "$inc" => {
                    let fields = expect_object(key, value)?;
                    for (field, delta) in &fields {
                        if !delta.is_number() {
                            return Err(ParqueError::Validation {
                                field: field.clone(),
                                reason: "$inc requires a numeric delta".to_string(),
                            });
                        }
                    }
                    ops.inc = fields;
                }
                "$push" => ops.push = expect_object(key, value)?,
                "$pull" => ops.pull = expect_object(key, value)?,
                "$link" => {
                    for (relation, targets) in expect_object(key, value)? {
                        ops.link.push(LinkOp {
                            relation,
                            targets: id_list(&targets)?,
                        });
                    }
                }
                "$unlink" => {
                    for (relation, targets) in expect_object(key, value)? {
                        let removal = if targets == Value::String("$all".to_string()) {
                            UnlinkTargets::All
                        } else {
                            UnlinkTargets::Ids(id_list(&targets)?)
                        };
                        ops.unlink.push(UnlinkOp { relation, removal });
                    }
                }
                other => {
                    return Err(ParqueError::Validation {
                        field: other.to_string(),
                        reason: "unknown update operator".to_string(),
                    })
                }
            }
        }
        Ok(ops)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.push.is_empty()
            && self.pull.is_empty()
            && self.link.is_empty()
            && self.unlink.is_empty()
    }

    /// Apply the field operators to an entity. Relationship operators are
    /// mirrored onto the entity's own field so the forward map can be
    /// materialized from the document alone. Does not touch `version` or the
    /// audit fields; the reconstructor owns those.
    pub fn apply(&self, entity: &mut Entity) {
        for (field, value) in &self.set {
            entity.fields.insert(field.clone(), value.clone());
        }
        for field in &self.unset {
            entity.fields.remove(field);
        }
        for (field, delta) in &self.inc {
            let current = entity.fields.get(field).cloned().unwrap_or(Value::from(0));
            entity
                .fields
                .insert(field.clone(), numeric_add(&current, delta));
        }
        for (field, value) in &self.push {
            match entity.fields.get_mut(field) {
                Some(Value::Array(items)) => items.push(value.clone()),
                _ => {
                    entity
                        .fields
                        .insert(field.clone(), Value::Array(vec![value.clone()]));
                }
            }
        }
        for (field, needle) in &self.pull {
            if let Some(Value::Array(items)) = entity.fields.get_mut(field) {
                items.retain(|item| item != needle);
            }
        }
        for link in &self.link {
            apply_link(entity, link);
        }
        for unlink in &self.unlink {
            apply_unlink(entity, unlink);
        }
    }
}

fn expect_object(op: &str, value: &Value) -> Result<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or_else(|| ParqueError::Validation {
            field: op.to_string(),
            reason: "operator payload must be an object".to_string(),
        })
}

fn id_list(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(id) => Ok(vec![id.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ParqueError::Validation {
                        field: "$link".to_string(),
                        reason: "relation targets must be id strings".to_string(),
                    })
            })
            .collect(),
        _ => Err(ParqueError::Validation {
            field: "$link".to_string(),
            reason: "relation targets must be an id or array of ids".to_string(),
        }),
    }
}

fn numeric_add(current: &Value, delta: &Value) -> Value {
    match (current.as_i64(), delta.as_i64()) {
        (Some(a), Some(b)) => Value::from(a + b),
        _ => {
            let a = current.as_f64().unwrap_or(0.0);
            let b = delta.as_f64().unwrap_or(0.0);
            serde_json::Number::from_f64(a + b)
                .map(Value::Number)
                .unwrap_or(Value::from(0))
        }
    }
}

fn apply_link(entity: &mut Entity, link: &LinkOp) {
    match entity.fields.get_mut(&link.relation) {
        Some(Value::Array(items)) => {
            for target in &link.targets {
                let value = Value::String(target.clone());
                if !items.contains(&value) {
                    items.push(value);
                }
            }
        }
        Some(existing) if link.targets.len() == 1 => {
            *existing = Value::String(link.targets[0].clone());
        }
        _ => {
            let value = if link.targets.len() == 1 {
                Value::String(link.targets[0].clone())
            } else {
                Value::Array(link.targets.iter().cloned().map(Value::String).collect())
            };
            entity.fields.insert(link.relation.clone(), value);
        }
    }
}

fn apply_unlink(entity: &mut Entity, unlink: &UnlinkOp) {
    match &unlink.removal {
        UnlinkTargets::All => {
            entity.fields.remove(&unlink.relation);
        }
        UnlinkTargets::Ids(ids) => match entity.fields.get_mut(&unlink.relation) {
            Some(Value::Array(items)) => {
                items.retain(|item| {
                    item.as_str().map(|s| !ids.iter().any(|id| id == s)).unwrap_or(true)
                });
                if items.is_empty() {
                    entity.fields.remove(&unlink.relation);
                }
            }
            Some(Value::String(current)) => {
                if ids.iter().any(|id| id == current) {
                    entity.fields.remove(&unlink.relation);
                }
            }
            _ => {}
        },
    }
}

//! Filter DSL: a tree of MongoDB-dialect operators evaluated against
//! reconstructed entities, plus the guard rails applied to SQL-like filter
//! input before it is translated into this dialect.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::entity::Entity;
use crate::error::{ParqueError, QueryErrorKind, Result};
use crate::segment::{json_lt, FieldStats};

/// Maximum operator nesting accepted by the parser.
const MAX_FILTER_DEPTH: usize = 15;

/// One comparison applied to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(String),
}

/// Parsed filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row
    All,
    /// All conditions on one field
    Field(String, Vec<Condition>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// `$text` query, resolved by the executor through the FTS index
    Text(String),
    /// Internal: entity id allow-list a `Text` node resolves into
    IdIn(HashSet<String>),
}

fn invalid(detail: impl Into<String>) -> ParqueError {
    ParqueError::query(QueryErrorKind::InvalidFilter, detail)
}

impl Filter {
    /// Parse a filter document. `{}` (or JSON null) matches everything;
    /// `{field: value}` is an implicit `$eq`.
    pub fn parse(doc: &Value) -> Result<Self> {
        Self::parse_at(doc, 0)
    }

    fn parse_at(doc: &Value, depth: usize) -> Result<Self> {
        if depth > MAX_FILTER_DEPTH {
            return Err(invalid(format!(
                "filter nesting exceeds {MAX_FILTER_DEPTH} levels"
            )));
        }
        let obj = match doc {
            Value::Null => return Ok(Self::All),
            Value::Object(obj) => obj,
            other => return Err(invalid(format!("filter must be an object, got {other}"))),
        };
        if obj.is_empty() {
            return Ok(Self::All);
        }

        let mut clauses = Vec::new();
        for (key, value) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let items = value
                        .as_array()
                        .ok_or_else(|| invalid(format!("{key} expects an array")))?;
                    let parsed: Vec<Filter> = items
                        .iter()
                        .map(|item| Self::parse_at(item, depth + 1))
                        .collect::<Result<_>>()?;
                    if parsed.is_empty() {
                        return Err(invalid(format!("{key} must not be empty")));
                    }
                    clauses.push(if key == "$and" {
                        Self::And(parsed)
                    } else {
                        Self::Or(parsed)
                    });
                }
                "$not" => {
                    clauses.push(Self::Not(Box::new(Self::parse_at(value, depth + 1)?)));
                }
                "$text" => {
                    let query = value
                        .as_str()
                        .ok_or_else(|| invalid("$text expects a string query"))?;
                    clauses.push(Self::Text(query.to_string()));
                }
                field if field.starts_with('$') => {
                    return Err(invalid(format!("unknown top-level operator {field}")));
                }
                field => {
                    clauses.push(Self::Field(
                        field.to_string(),
                        parse_conditions(field, value)?,
                    ));
                }
            }
        }

        Ok(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::And(clauses)
        })
    }

    /// Evaluate against an entity. `Text` nodes must have been resolved
    /// into `IdIn` first; an unresolved node matches nothing.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::All => true,
            Self::Field(field, conditions) => {
                let value = entity.projected_value(field);
                conditions.iter().all(|c| condition_matches(c, value.as_ref()))
            }
            Self::And(filters) => filters.iter().all(|f| f.matches(entity)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(entity)),
            Self::Not(filter) => !filter.matches(entity),
            Self::Text(_) => false,
            Self::IdIn(ids) => ids.contains(&entity.id.to_string()),
        }
    }

    /// Replace every `Text` node using the provided resolver (normally the
    /// namespace's FTS index).
    pub fn resolve_text<F>(&self, resolver: &F) -> Result<Self>
    where
        F: Fn(&str) -> Result<HashSet<String>>,
    {
        Ok(match self {
            Self::Text(query) => Self::IdIn(resolver(query)?),
            Self::And(filters) => Self::And(
                filters
                    .iter()
                    .map(|f| f.resolve_text(resolver))
                    .collect::<Result<_>>()?,
            ),
            Self::Or(filters) => Self::Or(
                filters
                    .iter()
                    .map(|f| f.resolve_text(resolver))
                    .collect::<Result<_>>()?,
            ),
            Self::Not(filter) => Self::Not(Box::new(filter.resolve_text(resolver)?)),
            other => other.clone(),
        })
    }

    /// Does any node reference `$text`?
    pub fn has_text(&self) -> bool {
        match self {
            Self::Text(_) => true,
            Self::And(filters) | Self::Or(filters) => filters.iter().any(Filter::has_text),
            Self::Not(filter) => filter.has_text(),
            _ => false,
        }
    }

    /// Leading equality conjuncts eligible for hash/bloom index probes:
    /// top-level `field = value` pairs (including inside `$and`).
    pub fn leading_equalities(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        self.collect_equalities(&mut out);
        out
    }

    fn collect_equalities(&self, out: &mut Vec<(String, Value)>) {
        match self {
            Self::Field(field, conditions) => {
                for condition in conditions {
                    if let Condition::Eq(value) = condition {
                        if !value.is_object() && !value.is_array() {
                            out.push((field.clone(), value.clone()));
                        }
                    }
                }
            }
            Self::And(filters) => {
                for filter in filters {
                    filter.collect_equalities(out);
                }
            }
            _ => {}
        }
    }

    /// Conservative row-group pruning decision: true when the row-group
    /// statistics prove no row can satisfy this filter. Only top-level
    /// conjuncts prune; everything else returns false (cannot prune).
    pub fn excludes_row_group(&self, stats: &HashMap<&str, &FieldStats>) -> bool {
        match self {
            Self::Field(field, conditions) => {
                let Some(field_stats) = stats.get(field.as_str()) else {
                    return false;
                };
                conditions
                    .iter()
                    .any(|c| condition_excluded_by_stats(c, field_stats))
            }
            Self::And(filters) => filters.iter().any(|f| f.excludes_row_group(stats)),
            _ => false,
        }
    }
}

fn parse_conditions(field: &str, value: &Value) -> Result<Vec<Condition>> {
    let Some(obj) = value.as_object() else {
        // Implicit equality.
        return Ok(vec![Condition::Eq(value.clone())]);
    };
    if obj.keys().next().map(|k| !k.starts_with('$')).unwrap_or(true) {
        // A plain object value is an equality match on the object.
        return Ok(vec![Condition::Eq(value.clone())]);
    }

    let mut conditions = Vec::new();
    for (op, operand) in obj {
        let array_operand = |op: &str| -> Result<Vec<Value>> {
            operand
                .as_array()
                .cloned()
                .ok_or_else(|| invalid(format!("{op} on `{field}` expects an array")))
        };
        conditions.push(match op.as_str() {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$in" => Condition::In(array_operand("$in")?),
            "$nin" => Condition::Nin(array_operand("$nin")?),
            "$exists" => Condition::Exists(operand.as_bool().unwrap_or(true)),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| invalid(format!("$regex on `{field}` expects a string")))?;
                regex::Regex::new(pattern)
                    .map_err(|e| invalid(format!("bad regex on `{field}`: {e}")))?;
                Condition::Regex(pattern.to_string())
            }
            other => return Err(invalid(format!("unknown operator {other} on `{field}`"))),
        });
    }
    Ok(conditions)
}

fn condition_matches(condition: &Condition, value: Option<&Value>) -> bool {
    match condition {
        Condition::Exists(expected) => value.is_some() == *expected,
        Condition::Ne(operand) => value != Some(operand),
        Condition::Nin(operands) => match value {
            Some(v) => !operands.contains(v),
            None => true,
        },
        _ => {
            let Some(value) = value else { return false };
            match condition {
                Condition::Eq(operand) => match value {
                    // Equality against an array matches any element.
                    Value::Array(items) => items.contains(operand) || value == operand,
                    _ => value == operand,
                },
                Condition::Gt(operand) => json_lt(operand, value),
                Condition::Gte(operand) => !json_lt(value, operand),
                Condition::Lt(operand) => json_lt(value, operand),
                Condition::Lte(operand) => !json_lt(operand, value),
                Condition::In(operands) => operands.contains(value),
                Condition::Regex(pattern) => value
                    .as_str()
                    .map(|s| {
                        regex::Regex::new(pattern)
                            .map(|re| re.is_match(s))
                            .unwrap_or(false)
                    })
                    .unwrap_or(false),
                Condition::Ne(_) | Condition::Nin(_) | Condition::Exists(_) => unreachable!(),
            }
        }
    }
}

/// True when the statistics prove no value in the row group satisfies the
/// condition.
fn condition_excluded_by_stats(condition: &Condition, stats: &FieldStats) -> bool {
    let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
        // No min/max recorded (all nulls): only presence checks prune.
        return matches!(condition, Condition::Eq(v) if !v.is_null());
    };
    match condition {
        Condition::Eq(v) => json_lt(v, min) || json_lt(max, v),
        Condition::Gt(v) => !json_lt(v, max),
        Condition::Gte(v) => json_lt(max, v),
        Condition::Lt(v) => !json_lt(min, v),
        Condition::Lte(v) => json_lt(v, min),
        Condition::In(vs) => vs.iter().all(|v| json_lt(v, min) || json_lt(max, v)),
        _ => false,
    }
}

/// Guard rails for SQL-like filter input before translation.
pub mod sql_guard {
    use super::*;

    const FORBIDDEN_KEYWORDS: &[&str] = &[
        "UNION", "DROP", "TRUNCATE", "ALTER", "CREATE", "EXEC", "EXECUTE", "INTO", "OUTFILE",
        "LOAD_FILE",
    ];

    const RESERVED_WORDS: &[&str] = &[
        "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "TABLE", "INDEX", "INSERT",
        "UPDATE", "DELETE", "JOIN", "GROUP", "ORDER", "BY", "HAVING", "LIMIT",
    ];

    fn injection(detail: impl Into<String>) -> ParqueError {
        ParqueError::query(QueryErrorKind::InjectionDetected, detail)
    }

    /// Validate a SQL-like filter expression before translation. Rejects
    /// multi-statement input, comment markers, dangerous keywords,
    /// unbalanced parentheses, and nesting depth over 15.
    pub fn validate_filter_expression(input: &str) -> Result<()> {
        if input.contains(';') {
            return Err(injection("multi-statement input"));
        }
        if input.contains("--") || input.contains("/*") || input.contains("#") {
            return Err(injection("comment marker"));
        }

        let upper = input.to_uppercase();
        for keyword in FORBIDDEN_KEYWORDS {
            if upper
                .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .any(|word| word == *keyword)
            {
                return Err(injection(format!("forbidden keyword {keyword}")));
            }
        }

        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for ch in input.chars() {
            match ch {
                '(' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| injection("unbalanced parentheses"))?;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(injection("unbalanced parentheses"));
        }
        if max_depth > 15 {
            return Err(injection("nesting depth over 15"));
        }
        Ok(())
    }

    /// Table / identifier names: `^[A-Za-z_][A-Za-z0-9_]{0,63}$`, not a
    /// reserved word.
    pub fn validate_identifier(name: &str) -> Result<()> {
        let valid_shape = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false)
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_shape {
            return Err(injection(format!("invalid identifier `{name}`")));
        }
        let upper = name.to_uppercase();
        if RESERVED_WORDS.contains(&upper.as_str()) || FORBIDDEN_KEYWORDS.contains(&upper.as_str())
        {
            return Err(injection(format!("reserved word `{name}`")));
        }
        Ok(())
    }

    /// Escape `%`, `_` and `\` in a LIKE pattern. Single-pass; applying it
    /// twice double-escapes, so callers escape exactly once.
    pub fn escape_like_pattern(pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len());
        for ch in pattern.chars() {
            if matches!(ch, '%' | '_' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    }
}

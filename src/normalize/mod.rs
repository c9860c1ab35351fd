//! Normalizer: raw API payloads → flat table rows.
//!
//! Pure and deterministic. Each payload maps to one root record of its
//! entity table plus zero or more child records, following the field
//! maps in [`schema`]. Every record carries the canonical JSON of the
//! object it was derived from for archival.

pub mod coerce;
pub mod schema;

use serde_json::Value;

use crate::types::{EntityKind, RawPayload, SqlValue, SyncError};
use schema::{ChildSpec, TableSchema};

/// One flattened row for a target table.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub table: &'static TableSchema,
    /// Column values in `table.columns` order.
    pub values: Vec<SqlValue>,
    /// Canonical JSON of the source object.
    pub payload: String,
}

impl PartialEq for EntityRecord {
    fn eq(&self, other: &Self) -> bool {
        self.table.name == other.table.name
            && self.values == other.values
            && self.payload == other.payload
    }
}

impl EntityRecord {
    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.table.column_index(column).map(|i| &self.values[i])
    }

    /// Natural key values in key order.
    pub fn key_values(&self) -> Vec<&SqlValue> {
        self.table
            .key
            .iter()
            .filter_map(|k| self.value(k))
            .collect()
    }

    /// `col=value` rendering of the natural key for logs and errors.
    pub fn key_display(&self) -> String {
        self.table
            .key
            .iter()
            .map(|k| match self.value(k) {
                Some(v) => format!("{k}={v}"),
                None => format!("{k}=?"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The records derived from one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPayload {
    pub root: EntityRecord,
    /// Child rows, each carrying the root's natural key.
    pub children: Vec<EntityRecord>,
}

impl NormalizedPayload {
    pub fn record_count(&self) -> usize {
        1 + self.children.len()
    }
}

/// Normalize one payload of `kind`.
pub fn normalize(kind: EntityKind, payload: &RawPayload) -> Result<NormalizedPayload, SyncError> {
    let table = schema::schema_for(kind);
    let doc = payload.as_value();
    if !doc.is_object() {
        return Err(SyncError::SchemaMismatch {
            entity: kind,
            field: "$".to_string(),
            expected: "object",
            found: coerce::describe(doc),
        });
    }

    let root = map_record(kind, table, doc, payload.canonical(), "", None)?;

    let mut children = Vec::new();
    for child in table.children {
        expand_child(kind, child, doc, &mut children)?;
    }

    Ok(NormalizedPayload { root, children })
}

/// Normalize a whole page, failing on the first mismatch.
pub fn normalize_page(
    kind: EntityKind,
    payloads: &[RawPayload],
) -> Result<Vec<NormalizedPayload>, SyncError> {
    payloads.iter().map(|p| normalize(kind, p)).collect()
}

fn expand_child(
    kind: EntityKind,
    child: &ChildSpec,
    parent: &Value,
    out: &mut Vec<EntityRecord>,
) -> Result<(), SyncError> {
    let items = match lookup(parent, child.path) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(SyncError::SchemaMismatch {
                entity: kind,
                field: child.path.to_string(),
                expected: "array",
                found: coerce::describe(other),
            })
        }
    };

    for (i, item) in items.iter().enumerate() {
        let prefix = format!("{}[{i}]", child.path);
        if !item.is_object() {
            return Err(SyncError::SchemaMismatch {
                entity: kind,
                field: prefix,
                expected: "object",
                found: coerce::describe(item),
            });
        }
        let record = map_record(
            kind,
            child.table,
            item,
            item.to_string(),
            &prefix,
            Some((child, parent)),
        )?;
        out.push(record);
    }
    Ok(())
}

fn map_record(
    kind: EntityKind,
    table: &'static TableSchema,
    source: &Value,
    payload: String,
    prefix: &str,
    parent: Option<(&ChildSpec, &Value)>,
) -> Result<EntityRecord, SyncError> {
    let mut values = Vec::with_capacity(table.columns.len());

    for column in table.columns {
        let (raw, field) = match parent.and_then(|(spec, doc)| {
            spec.inherit
                .iter()
                .find(|i| i.column == column.column)
                .map(|i| (lookup(doc, i.path), i.path.to_string()))
        }) {
            Some(inherited) => inherited,
            None => (lookup(source, column.path), join_path(prefix, column.path)),
        };

        let value = match raw {
            Some(v) => coerce::coerce(column.kind, v).ok_or_else(|| SyncError::SchemaMismatch {
                entity: kind,
                field: field.clone(),
                expected: column.kind.expected(),
                found: coerce::describe(v),
            })?,
            None => SqlValue::Null,
        };

        if column.required && value == SqlValue::Null {
            return Err(SyncError::SchemaMismatch {
                entity: kind,
                field,
                expected: column.kind.expected(),
                found: match raw {
                    Some(v) => coerce::describe(v),
                    None => "missing".to_string(),
                },
            });
        }
        values.push(value);
    }

    Ok(EntityRecord {
        table,
        values,
        payload,
    })
}

/// Follow a dotted path through nested objects.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(doc, |node, segment| node.get(segment))
}

fn join_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}.{path}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

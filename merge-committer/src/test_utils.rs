//! Builders for change events shared by unit and integration tests.

use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};

use crate::event::{ChangeEvent, ChangeKind, PrimaryKey};
use crate::position::Offset;

/// An upsert of `{"id": key, "m_time": modified_secs, "v": value}`.
pub fn upsert(key: i64, modified_secs: i64, value: &str, offset: Offset) -> ChangeEvent {
    let mut fields = Map::new();
    fields.insert("id".to_string(), json!(key));
    fields.insert("m_time".to_string(), json!(modified_secs));
    fields.insert("v".to_string(), json!(value));
    event(key, modified_secs, ChangeKind::Upsert, fields, offset)
}

/// A delete marker `{"id": key, "m_time": modified_secs, "op": "D"}`.
pub fn delete(key: i64, modified_secs: i64, offset: Offset) -> ChangeEvent {
    let mut fields = Map::new();
    fields.insert("id".to_string(), json!(key));
    fields.insert("m_time".to_string(), json!(modified_secs));
    fields.insert("op".to_string(), json!("D"));
    event(key, modified_secs, ChangeKind::Delete, fields, offset)
}

/// A table row as stored by the table stores: `{"id": key, "v": value}`.
pub fn row(key: i64, value: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("id".to_string(), json!(key));
    fields.insert("v".to_string(), json!(value));
    fields
}

fn event(
    key: i64,
    modified_secs: i64,
    kind: ChangeKind,
    fields: Map<String, Value>,
    offset: Offset,
) -> ChangeEvent {
    ChangeEvent {
        primary_key: PrimaryKey::Int(key),
        modification_time: Utc
            .timestamp_opt(modified_secs, 0)
            .single()
            .unwrap_or_default(),
        kind,
        fields,
        offset,
    }
}

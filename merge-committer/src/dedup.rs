//! Deduplicator - collapses a batch to one row per primary key.
//!
//! The winning event for a key is the one with the greatest modification time.
//! On equal modification times the event that arrived last in the batch wins.
//! Winners are projected onto the target table's columns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{ChangeEvent, ChangeKind, PrimaryKey};
use crate::schema::ColumnSet;

/// Errors raised when a batch cannot be aligned with the target table's columns.
/// These need schema or operator intervention and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaMismatch {
    #[error("target table has no primary key column {0}")]
    MissingKeyColumn(String),
    #[error("row {key} is missing required column {column}")]
    MissingRequiredColumn { key: String, column: String },
}

/// The latest version of one logical row within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupedRow {
    pub primary_key: PrimaryKey,
    pub kind: ChangeKind,
    pub fields: Map<String, Value>,
}

impl DedupedRow {
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    key_column: String,
}

impl Deduplicator {
    pub fn new(key_column: &str) -> Self {
        Self {
            key_column: key_column.to_owned(),
        }
    }

    /// Deduplicate `events` and project the winners onto `schema`.
    /// Rows come back ordered by primary key.
    pub fn deduplicate(
        &self,
        events: &[ChangeEvent],
        schema: &ColumnSet,
    ) -> Result<Vec<DedupedRow>, SchemaMismatch> {
        if !schema.contains(&self.key_column) {
            return Err(SchemaMismatch::MissingKeyColumn(self.key_column.clone()));
        }

        select_latest(events)
            .into_values()
            .map(|event| self.project(event, schema))
            .collect()
    }

    fn project(&self, event: &ChangeEvent, schema: &ColumnSet) -> Result<DedupedRow, SchemaMismatch> {
        // delete markers are handed to the table store as they arrived
        if event.is_delete() {
            return Ok(DedupedRow {
                primary_key: event.primary_key.clone(),
                kind: event.kind,
                fields: event.fields.clone(),
            });
        }

        let mut fields = Map::with_capacity(schema.len());
        for column in schema.columns() {
            match event.fields.get(&column.name) {
                Some(value) if !(column.required && value.is_null()) => {
                    fields.insert(column.name.clone(), value.clone());
                }
                _ if column.required => {
                    return Err(SchemaMismatch::MissingRequiredColumn {
                        key: event.primary_key.to_string(),
                        column: column.name.clone(),
                    })
                }
                _ => {}
            }
        }
        // the key always carries the decoded value, whatever type the payload used
        fields.insert(self.key_column.clone(), event.primary_key.to_value());

        Ok(DedupedRow {
            primary_key: event.primary_key.clone(),
            kind: event.kind,
            fields,
        })
    }
}

/// Pick the latest event per key. Later arrivals win ties.
pub fn select_latest(events: &[ChangeEvent]) -> BTreeMap<PrimaryKey, &ChangeEvent> {
    let mut latest: BTreeMap<PrimaryKey, &ChangeEvent> = BTreeMap::new();
    for event in events {
        latest
            .entry(event.primary_key.clone())
            .and_modify(|current| {
                if event.modification_time >= current.modification_time {
                    *current = event;
                }
            })
            .or_insert(event);
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Offset;
    use crate::schema::Column;
    use crate::test_utils::{delete, upsert};
    use serde_json::json;

    fn schema() -> ColumnSet {
        ColumnSet::new(vec![
            Column::required("id"),
            Column::optional("m_time"),
            Column::optional("v"),
        ])
    }

    #[test]
    fn test_latest_wins() {
        let events = vec![
            upsert(1, 10, "A", Offset::new(0, 0)),
            upsert(1, 20, "B", Offset::new(0, 1)),
            upsert(2, 5, "C", Offset::new(0, 2)),
        ];

        let rows = Deduplicator::new("id").deduplicate(&events, &schema()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].primary_key, PrimaryKey::Int(1));
        assert_eq!(rows[0].fields.get("v"), Some(&json!("B")));
        assert_eq!(rows[1].primary_key, PrimaryKey::Int(2));
        assert_eq!(rows[1].fields.get("v"), Some(&json!("C")));
    }

    #[test]
    fn test_out_of_order_arrival_still_picks_latest() {
        let events = vec![
            upsert(1, 20, "newer", Offset::new(0, 0)),
            upsert(1, 10, "older", Offset::new(0, 1)),
        ];

        let rows = Deduplicator::new("id").deduplicate(&events, &schema()).unwrap();

        assert_eq!(rows[0].fields.get("v"), Some(&json!("newer")));
    }

    #[test]
    fn test_tie_break_last_arrival_wins() {
        let events = vec![
            upsert(1, 10, "first", Offset::new(0, 0)),
            upsert(1, 10, "second", Offset::new(1, 0)),
            upsert(1, 10, "third", Offset::new(0, 1)),
        ];

        let rows = Deduplicator::new("id").deduplicate(&events, &schema()).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.get("v"), Some(&json!("third")));
    }

    #[test]
    fn test_deduplicate_is_idempotent() {
        let events = vec![
            upsert(3, 1, "x", Offset::new(0, 0)),
            upsert(1, 2, "y", Offset::new(0, 1)),
            upsert(3, 1, "z", Offset::new(0, 2)),
            upsert(2, 9, "w", Offset::new(0, 3)),
        ];
        let dedup = Deduplicator::new("id");

        let first = dedup.deduplicate(&events, &schema()).unwrap();
        let second = dedup.deduplicate(&events, &schema()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_projection_drops_unknown_fields() {
        let mut event = upsert(1, 10, "A", Offset::new(0, 0));
        event.fields.insert("extra".to_string(), json!(42));

        let rows = Deduplicator::new("id").deduplicate(&[event], &schema()).unwrap();

        let columns: Vec<&str> = rows[0].fields.keys().map(|k| k.as_str()).collect();
        assert_eq!(columns, vec!["id", "m_time", "v"]);
    }

    #[test]
    fn test_missing_optional_column_is_omitted() {
        let mut event = upsert(1, 10, "A", Offset::new(0, 0));
        event.fields.remove("v");

        let rows = Deduplicator::new("id").deduplicate(&[event], &schema()).unwrap();

        assert!(!rows[0].fields.contains_key("v"));
    }

    #[test]
    fn test_missing_required_column_is_schema_mismatch() {
        let schema = ColumnSet::new(vec![Column::required("id"), Column::required("owner")]);
        let events = vec![upsert(7, 10, "A", Offset::new(0, 0))];

        let err = Deduplicator::new("id").deduplicate(&events, &schema).unwrap_err();

        assert_eq!(
            err,
            SchemaMismatch::MissingRequiredColumn {
                key: "7".to_string(),
                column: "owner".to_string()
            }
        );
    }

    #[test]
    fn test_null_in_required_column_is_schema_mismatch() {
        let schema = ColumnSet::new(vec![Column::required("id"), Column::required("v")]);
        let mut event = upsert(7, 10, "A", Offset::new(0, 0));
        event.fields.insert("v".to_string(), json!(null));

        assert!(Deduplicator::new("id")
            .deduplicate(&[event], &schema)
            .is_err());
    }

    #[test]
    fn test_missing_key_column_is_schema_mismatch() {
        let schema = ColumnSet::new(vec![Column::optional("v")]);
        let events = vec![upsert(7, 10, "A", Offset::new(0, 0))];

        assert_eq!(
            Deduplicator::new("id").deduplicate(&events, &schema),
            Err(SchemaMismatch::MissingKeyColumn("id".to_string()))
        );
    }

    #[test]
    fn test_delete_marker_passes_through_unprojected() {
        let schema = ColumnSet::new(vec![Column::required("id"), Column::required("owner")]);
        let events = vec![delete(4, 10, Offset::new(0, 0))];

        let rows = Deduplicator::new("id").deduplicate(&events, &schema).unwrap();

        assert!(rows[0].is_delete());
        assert_eq!(rows[0].fields, events[0].fields);
    }

    #[test]
    fn test_delete_after_upsert_wins() {
        let events = vec![
            upsert(4, 10, "A", Offset::new(0, 0)),
            delete(4, 11, Offset::new(0, 1)),
        ];

        let rows = Deduplicator::new("id").deduplicate(&events, &schema()).unwrap();

        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_delete());
    }
}

//! Merge Planner - turns deduplicated rows into a single logical upsert.
//!
//! A `MergeSpec` means: replace every row whose key matches an upsert with that
//! upsert, hand delete markers to the table store, and leave every other row
//! untouched. Planning performs no I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dedup::DedupedRow;
use crate::event::PrimaryKey;
use crate::schema::{ColumnSet, TableId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub table: TableId,
    pub key_column: String,
    /// Target columns in table order.
    pub columns: Vec<String>,
    pub upserts: Vec<DedupedRow>,
    pub deletes: Vec<DedupedRow>,
}

impl MergeSpec {
    pub fn row_count(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PrimaryKey> {
        self.upserts
            .iter()
            .chain(self.deletes.iter())
            .map(|r| &r.primary_key)
    }

    /// Upserts grouped by the columns they carry, columns in table order. A
    /// column a row leaves out takes its default on insert and keeps its current
    /// value on update.
    pub fn upsert_groups(&self) -> Vec<UpsertGroup<'_>> {
        let mut groups: BTreeMap<Vec<&str>, Vec<&Map<String, Value>>> = BTreeMap::new();
        for upsert in &self.upserts {
            let columns = self
                .columns
                .iter()
                .map(String::as_str)
                .filter(|c| upsert.fields.contains_key(*c))
                .collect();
            groups.entry(columns).or_default().push(&upsert.fields);
        }
        groups
            .into_iter()
            .map(|(columns, rows)| UpsertGroup { columns, rows })
            .collect()
    }

    /// Apply the merge to an in-memory keyed table. Applying the same spec twice
    /// leaves the table as applying it once.
    pub fn apply_to(&self, rows: &mut BTreeMap<PrimaryKey, Map<String, Value>>) {
        for upsert in &self.upserts {
            rows.entry(upsert.primary_key.clone())
                .or_default()
                .extend(upsert.fields.clone());
        }
        for delete in &self.deletes {
            rows.remove(&delete.primary_key);
        }
    }
}

/// Upserted rows sharing one column list.
#[derive(Debug, PartialEq)]
pub struct UpsertGroup<'a> {
    pub columns: Vec<&'a str>,
    pub rows: Vec<&'a Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct MergePlanner {
    table: TableId,
    key_column: String,
}

impl MergePlanner {
    pub fn new(table: TableId, key_column: &str) -> Self {
        Self {
            table,
            key_column: key_column.to_owned(),
        }
    }

    pub fn plan(&self, schema: &ColumnSet, rows: Vec<DedupedRow>) -> MergeSpec {
        let (deletes, upserts): (Vec<DedupedRow>, Vec<DedupedRow>) =
            rows.into_iter().partition(|r| r.is_delete());

        MergeSpec {
            table: self.table.clone(),
            key_column: self.key_column.clone(),
            columns: schema.names().map(str::to_owned).collect(),
            upserts,
            deletes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::Deduplicator;
    use crate::position::Offset;
    use crate::schema::Column;
    use crate::test_utils::{delete, row, upsert};
    use serde_json::json;

    fn schema() -> ColumnSet {
        ColumnSet::new(vec![Column::required("id"), Column::optional("v")])
    }

    fn plan(events: &[crate::event::ChangeEvent]) -> MergeSpec {
        let rows = Deduplicator::new("id").deduplicate(events, &schema()).unwrap();
        MergePlanner::new(TableId::new("db.events"), "id").plan(&schema(), rows)
    }

    #[test]
    fn test_merge_replaces_matching_and_leaves_others() {
        let spec = plan(&[
            upsert(1, 10, "A", Offset::new(0, 0)),
            upsert(1, 20, "B", Offset::new(0, 1)),
            upsert(2, 5, "C", Offset::new(0, 2)),
        ]);

        let mut table = BTreeMap::new();
        table.insert(PrimaryKey::Int(1), row(1, "old-1"));
        table.insert(PrimaryKey::Int(2), row(2, "old-2"));
        table.insert(PrimaryKey::Int(3), row(3, "untouched"));

        spec.apply_to(&mut table);

        assert_eq!(table.len(), 3);
        assert_eq!(table[&PrimaryKey::Int(1)].get("v"), Some(&json!("B")));
        assert_eq!(table[&PrimaryKey::Int(2)].get("v"), Some(&json!("C")));
        assert_eq!(table[&PrimaryKey::Int(3)], row(3, "untouched"));
    }

    #[test]
    fn test_plan_separates_deletes() {
        let spec = plan(&[
            upsert(1, 10, "A", Offset::new(0, 0)),
            delete(2, 10, Offset::new(0, 1)),
        ]);

        assert_eq!(spec.upserts.len(), 1);
        assert_eq!(spec.deletes.len(), 1);
        assert_eq!(spec.row_count(), 2);
        assert_eq!(spec.columns, vec!["id".to_string(), "v".to_string()]);
        assert_eq!(
            spec.keys().cloned().collect::<Vec<_>>(),
            vec![PrimaryKey::Int(1), PrimaryKey::Int(2)]
        );
    }

    #[test]
    fn test_apply_is_idempotent() {
        let spec = plan(&[
            upsert(1, 10, "A", Offset::new(0, 0)),
            delete(2, 10, Offset::new(0, 1)),
        ]);
        let mut table = BTreeMap::new();
        table.insert(PrimaryKey::Int(2), row(2, "gone"));
        table.insert(PrimaryKey::Int(5), row(5, "kept"));

        spec.apply_to(&mut table);
        let once = table.clone();
        spec.apply_to(&mut table);

        assert_eq!(table, once);
        assert!(!table.contains_key(&PrimaryKey::Int(2)));
    }

    #[test]
    fn test_upserts_group_by_carried_columns() {
        let schema = ColumnSet::new(vec![
            Column::required("id"),
            Column::optional("v"),
            Column::optional("created_at"),
        ]);
        let mut stamped = upsert(2, 10, "B", Offset::new(0, 1));
        stamped
            .fields
            .insert("created_at".to_string(), json!("2024-01-01T00:00:00Z"));
        let events = vec![upsert(1, 10, "A", Offset::new(0, 0)), stamped];
        let rows = Deduplicator::new("id").deduplicate(&events, &schema).unwrap();
        let spec = MergePlanner::new(TableId::new("db.events"), "id").plan(&schema, rows);

        let groups = spec.upsert_groups();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].columns, vec!["id", "v"]);
        assert_eq!(groups[0].rows[0].get("id"), Some(&json!(1)));
        assert_eq!(groups[1].columns, vec!["id", "v", "created_at"]);
        assert_eq!(groups[1].rows[0].get("id"), Some(&json!(2)));
    }

    #[test]
    fn test_omitted_column_keeps_existing_value() {
        let spec = plan(&[upsert(1, 10, "A", Offset::new(0, 0))]);
        let mut existing = row(1, "old");
        existing.insert("created_at".to_string(), json!("2024-01-01T00:00:00Z"));
        let mut table = BTreeMap::new();
        table.insert(PrimaryKey::Int(1), existing);

        spec.apply_to(&mut table);

        assert_eq!(table[&PrimaryKey::Int(1)].get("v"), Some(&json!("A")));
        assert_eq!(
            table[&PrimaryKey::Int(1)].get("created_at"),
            Some(&json!("2024-01-01T00:00:00Z"))
        );
    }
}

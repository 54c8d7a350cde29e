use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tracing::debug;

use crate::merge::MergeSpec;
use crate::schema::{Column, ColumnSet, TableId};
use crate::sql::{quote_identifier, split_qualified, InvalidIdentifier};
use crate::store::{StoreError, TableStore};

/// Table store writing straight into a Postgres table.
///
/// Rows travel as a JSONB array expanded with `jsonb_populate_recordset`, so the
/// database performs type coercion against the table's own row type. Upserts and
/// deletes run in one transaction.
#[derive(Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn invalid_identifier(table: &TableId, error: InvalidIdentifier) -> StoreError {
    StoreError::Apply {
        table: table.clone(),
        message: error.to_string(),
        permanent: true,
    }
}

/// Cardinality violations (class 21), data exceptions (class 22) and integrity
/// violations (class 23) fail the same way on every retry.
fn permanent_sqlstate(code: &str) -> bool {
    ["21", "22", "23"].iter().any(|class| code.starts_with(class))
}

fn apply_error(table: &TableId, error: sqlx::Error) -> StoreError {
    let permanent = match &error {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| permanent_sqlstate(&code)),
        _ => false,
    };
    StoreError::Apply {
        table: table.clone(),
        message: error.to_string(),
        permanent,
    }
}

fn upsert_statement(table: &str, key: &str, columns: &[String]) -> String {
    let column_list = columns.join(", ");
    let updates = columns
        .iter()
        .filter(|c| *c != key)
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>();

    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({key}) {on_conflict}"
    )
}

fn delete_statement(table: &str, key: &str) -> String {
    format!(
        "DELETE FROM {table} WHERE {key} IN \
         (SELECT {key} FROM jsonb_populate_recordset(NULL::{table}, $1))"
    )
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn read_schema(&self, table: &TableId) -> Result<ColumnSet, StoreError> {
        let (schema, name) = split_qualified(table.as_str());

        let columns: Vec<(String, bool)> = sqlx::query_as(
            r#"
SELECT column_name::TEXT, (is_nullable = 'NO' AND column_default IS NULL) AS required
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            return Err(StoreError::UnknownTable(table.clone()));
        }

        Ok(columns
            .into_iter()
            .map(|(name, required)| Column { name, required })
            .collect())
    }

    async fn apply_merge(&self, merge: &MergeSpec) -> Result<(), StoreError> {
        let table = quote_identifier(merge.table.as_str())
            .map_err(|e| invalid_identifier(&merge.table, e))?;
        let key = quote_identifier(&merge.key_column)
            .map_err(|e| invalid_identifier(&merge.table, e))?;
        let groups = merge.upsert_groups();

        let mut tx = self.pool.begin().await?;

        for group in groups {
            let columns = group
                .columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid_identifier(&merge.table, e))?;
            let result = sqlx::query(&upsert_statement(&table, &key, &columns))
                .bind(Json(group.rows))
                .execute(&mut *tx)
                .await
                .map_err(|e| apply_error(&merge.table, e))?;
            debug!(
                table = %merge.table,
                columns = columns.len(),
                rows = result.rows_affected(),
                "upserted rows"
            );
        }

        if !merge.deletes.is_empty() {
            let keys: Vec<Value> = merge
                .deletes
                .iter()
                .map(|r| {
                    let mut key_only = Map::new();
                    key_only.insert(merge.key_column.clone(), r.primary_key.to_value());
                    Value::Object(key_only)
                })
                .collect();
            let result = sqlx::query(&delete_statement(&table, &key))
                .bind(Json(keys))
                .execute(&mut *tx)
                .await
                .map_err(|e| apply_error(&merge.table, e))?;
            debug!(table = %merge.table, rows = result.rows_affected(), "deleted rows");
        }

        tx.commit()
            .await
            .map_err(|e| apply_error(&merge.table, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupedRow;
    use crate::event::{ChangeKind, PrimaryKey};
    use crate::test_utils::row;

    #[test]
    fn test_upsert_statement_updates_non_key_columns() {
        let statement = upsert_statement(
            "\"db\".\"events\"",
            "\"id\"",
            &["\"id\"".to_string(), "\"v\"".to_string()],
        );

        assert_eq!(
            statement,
            "INSERT INTO \"db\".\"events\" (\"id\", \"v\") \
             SELECT \"id\", \"v\" FROM jsonb_populate_recordset(NULL::\"db\".\"events\", $1) \
             ON CONFLICT (\"id\") DO UPDATE SET \"v\" = EXCLUDED.\"v\""
        );
    }

    #[test]
    fn test_key_only_table_does_nothing_on_conflict() {
        let statement = upsert_statement("\"t\"", "\"id\"", &["\"id\"".to_string()]);
        assert!(statement.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_delete_statement() {
        assert_eq!(
            delete_statement("\"t\"", "\"id\""),
            "DELETE FROM \"t\" WHERE \"id\" IN \
             (SELECT \"id\" FROM jsonb_populate_recordset(NULL::\"t\", $1))"
        );
    }

    #[test]
    fn test_upsert_lists_only_carried_columns() {
        let table = TableId::new("db.events");
        let spec = MergeSpec {
            table: table.clone(),
            key_column: "id".to_string(),
            columns: vec!["id".to_string(), "v".to_string(), "created_at".to_string()],
            upserts: vec![DedupedRow {
                primary_key: PrimaryKey::Int(1),
                kind: ChangeKind::Upsert,
                fields: row(1, "x"),
            }],
            deletes: vec![],
        };

        let groups = spec.upsert_groups();
        let columns = groups[0]
            .columns
            .iter()
            .map(|c| quote_identifier(c).unwrap())
            .collect::<Vec<_>>();
        let statement = upsert_statement("\"db\".\"events\"", "\"id\"", &columns);

        assert!(!statement.contains("created_at"));
        assert!(statement.ends_with("DO UPDATE SET \"v\" = EXCLUDED.\"v\""));
    }

    #[test]
    fn test_permanent_sqlstate_classes() {
        assert!(permanent_sqlstate("21000"));
        assert!(permanent_sqlstate("22P02"));
        assert!(permanent_sqlstate("23502"));
        assert!(!permanent_sqlstate("40001"));
        assert!(!permanent_sqlstate("57P01"));
    }
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::lock::{Lease, LockError, LockService};
use crate::schema::TableId;
use crate::sql::{quote_identifier, InvalidIdentifier};

/// Lock service backed by a Postgres table with one row per locked resource.
///
/// A lease is taken with a conditional upsert that only overwrites a row held by
/// the same holder or whose expiry has passed, so the database clock decides expiry.
#[derive(Clone)]
pub struct PgLockService {
    pool: PgPool,
    table: String,
}

impl PgLockService {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, InvalidIdentifier> {
        Ok(Self {
            pool,
            table: quote_identifier(table)?,
        })
    }

    /// Create the lock table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), LockError> {
        let statement = format!(
            r#"
CREATE TABLE IF NOT EXISTS {} (
    resource TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    lease_expiry TIMESTAMPTZ NOT NULL
)
            "#,
            self.table
        );
        sqlx::query(&statement).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_acquire(
        &self,
        resource: &TableId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LockError> {
        let statement = format!(
            r#"
INSERT INTO {table} AS l (resource, holder, lease_expiry)
VALUES ($1, $2, NOW() + make_interval(secs => $3))
ON CONFLICT (resource) DO UPDATE
    SET holder = EXCLUDED.holder, lease_expiry = EXCLUDED.lease_expiry
    WHERE l.holder = EXCLUDED.holder OR l.lease_expiry <= NOW()
RETURNING lease_expiry
            "#,
            table = self.table
        );

        let granted: Option<DateTime<Utc>> = sqlx::query_scalar(&statement)
            .bind(resource.as_str())
            .bind(holder)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(lease_expiry) = granted {
            return Ok(Lease {
                resource: resource.clone(),
                holder: holder.to_owned(),
                lease_expiry,
            });
        }

        let current: Option<(String, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT holder, lease_expiry FROM {} WHERE resource = $1",
            self.table
        ))
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;

        // the row may have been released between both statements; report contention and let the caller retry
        let (holder, lease_expiry) = current.unwrap_or_else(|| (String::new(), Utc::now()));
        Err(LockError::Contention {
            resource: resource.clone(),
            holder,
            lease_expiry,
        })
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LockError> {
        let statement = format!(
            r#"
UPDATE {}
SET lease_expiry = NOW() + make_interval(secs => $3)
WHERE resource = $1 AND holder = $2 AND lease_expiry > NOW()
RETURNING lease_expiry
            "#,
            self.table
        );

        let renewed: Option<DateTime<Utc>> = sqlx::query_scalar(&statement)
            .bind(lease.resource.as_str())
            .bind(&lease.holder)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        match renewed {
            Some(lease_expiry) => Ok(Lease {
                lease_expiry,
                ..lease.clone()
            }),
            None => Err(LockError::LeaseLost(lease.resource.clone())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE resource = $1 AND holder = $2",
            self.table
        ))
        .bind(lease.resource.as_str())
        .bind(&lease.holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::TableId;

pub mod coordinator;
pub mod memory;
pub mod postgres;

pub use coordinator::{LockCoordinator, LockGuard, LockState};
pub use memory::MemoryLockService;
pub use postgres::PgLockService;

/// An exclusive, time-bounded claim on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: TableId,
    pub holder: String,
    pub lease_expiry: DateTime<Utc>,
}

/// Enumeration of errors raised while acquiring, renewing or releasing a lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock on {resource} is held by {holder} until {lease_expiry}")]
    Contention {
        resource: TableId,
        holder: String,
        lease_expiry: DateTime<Utc>,
    },
    #[error("lock service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("gave up acquiring lock on {resource} after {attempts} attempts")]
    AcquireTimeout { resource: TableId, attempts: u32 },
    #[error("lease on {0} was lost")]
    LeaseLost(TableId),
    #[error("lock acquisition was cancelled")]
    Cancelled,
}

impl LockError {
    /// Contention and transport failures go away on their own; everything else does not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Contention { .. } | LockError::ServiceUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for LockError {
    fn from(error: sqlx::Error) -> Self {
        LockError::ServiceUnavailable(error.to_string())
    }
}

/// Wall-clock expiry of a lease granted now for `ttl`.
pub(crate) fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A lock service offering leases over named resources.
/// Every operation is idempotent and safe to retry.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Obtain the lease for `resource`, or extend it if `holder` already owns it.
    /// Fails with `Contention` while another holder's lease is unexpired.
    async fn try_acquire(
        &self,
        resource: &TableId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LockError>;

    /// Push the expiry of a held lease out by `ttl`.
    /// Fails with `LeaseLost` if the lease expired or changed hands.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LockError>;

    /// Give the lease up. Releasing a lease that is no longer held succeeds.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}

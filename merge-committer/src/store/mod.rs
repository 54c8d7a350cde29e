use async_trait::async_trait;
use thiserror::Error;

use crate::merge::MergeSpec;
use crate::schema::{ColumnSet, TableId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTableStore;
pub use postgres::PgTableStore;

/// Enumeration of errors raised by the table store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    UnknownTable(TableId),
    #[error("merge into {table} failed: {message}")]
    Apply {
        table: TableId,
        message: String,
        /// Set when retrying the same merge cannot succeed.
        permanent: bool,
    },
    #[error("table store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::UnknownTable(_) => false,
            StoreError::Apply { permanent, .. } => !permanent,
            StoreError::Unavailable(_) => true,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

/// The table holding the deduplicated snapshot.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Current columns of `table`, in table order.
    async fn read_schema(&self, table: &TableId) -> Result<ColumnSet, StoreError>;

    /// Apply `merge` atomically: readers see either none or all of it.
    async fn apply_merge(&self, merge: &MergeSpec) -> Result<(), StoreError>;
}

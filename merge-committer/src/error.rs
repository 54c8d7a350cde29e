use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::dedup::SchemaMismatch;
use crate::lock::LockError;
use crate::schema::TableId;
use crate::source::SourceError;
use crate::store::StoreError;

/// Reasons a commit cycle did not complete.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("commit lock on {resource} is held by {holder}")]
    LockContention { resource: TableId, holder: String },
    #[error("lock service unavailable: {0}")]
    LockServiceUnavailable(String),
    #[error("gave up acquiring commit lock on {resource} after {attempts} attempts")]
    AcquireTimeout { resource: TableId, attempts: u32 },
    #[error("commit lock on {0} was lost before the merge completed")]
    LeaseLost(TableId),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaMismatch),
    #[error("failed to apply merge: {0}")]
    StoreApply(#[from] StoreError),
    #[error("merge was committed but the checkpoint could not be saved: {0}")]
    CheckpointPersist(#[source] CheckpointError),
    #[error("failed to load checkpoint: {0}")]
    CheckpointLoad(#[source] CheckpointError),
    #[error("commit was cancelled")]
    Cancelled,
    #[error("stream source failed: {0}")]
    Source(#[from] SourceError),
}

impl From<LockError> for CommitError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Contention {
                resource, holder, ..
            } => CommitError::LockContention { resource, holder },
            LockError::ServiceUnavailable(message) => CommitError::LockServiceUnavailable(message),
            LockError::AcquireTimeout { resource, attempts } => {
                CommitError::AcquireTimeout { resource, attempts }
            }
            LockError::LeaseLost(resource) => CommitError::LeaseLost(resource),
            LockError::Cancelled => CommitError::Cancelled,
        }
    }
}

impl CommitError {
    /// Errors that stop the controller: retrying cannot fix them, or continuing
    /// would hide a persistence failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            CommitError::SchemaMismatch(_)
            | CommitError::CheckpointPersist(_)
            | CommitError::CheckpointLoad(_) => true,
            CommitError::StoreApply(e) => !e.is_retryable(),
            _ => false,
        }
    }

    /// Errors after which the same batch can be replayed on the next cycle.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, CommitError::Cancelled)
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CommitError::LockContention { .. } => "lock_contention",
            CommitError::LockServiceUnavailable(_) => "lock_service_unavailable",
            CommitError::AcquireTimeout { .. } => "acquire_timeout",
            CommitError::LeaseLost(_) => "lease_lost",
            CommitError::SchemaMismatch(_) => "schema_mismatch",
            CommitError::StoreApply(_) => "store_apply",
            CommitError::CheckpointPersist(_) => "checkpoint_persist",
            CommitError::CheckpointLoad(_) => "checkpoint_load",
            CommitError::Cancelled => "cancelled",
            CommitError::Source(_) => "source",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_classification() {
        let table = TableId::new("t");

        assert!(CommitError::from(SchemaMismatch::MissingKeyColumn("id".into())).is_fatal());
        assert!(CommitError::CheckpointPersist(CheckpointError::Unavailable("x".into())).is_fatal());
        assert!(CommitError::AcquireTimeout {
            resource: table.clone(),
            attempts: 3
        }
        .is_retryable());
        assert!(CommitError::LeaseLost(table.clone()).is_retryable());
        assert!(CommitError::from(StoreError::Apply {
            table: table.clone(),
            message: "boom".into(),
            permanent: false
        })
        .is_retryable());
        assert!(CommitError::from(StoreError::Apply {
            table,
            message: "bad row".into(),
            permanent: true
        })
        .is_fatal());
        assert!(!CommitError::Cancelled.is_retryable());
        assert!(!CommitError::Cancelled.is_fatal());
    }

    #[test]
    fn test_lock_errors_map_onto_taxonomy() {
        let table = TableId::new("t");
        assert!(matches!(
            CommitError::from(LockError::LeaseLost(table.clone())),
            CommitError::LeaseLost(t) if t == table
        ));
        assert!(matches!(
            CommitError::from(LockError::ServiceUnavailable("down".into())),
            CommitError::LockServiceUnavailable(_)
        ));
        assert!(matches!(
            CommitError::from(LockError::Cancelled),
            CommitError::Cancelled
        ));
    }

    #[rstest]
    #[case::unknown_table(StoreError::UnknownTable(TableId::new("t")), true, "store_apply")]
    #[case::transient_apply(
        StoreError::Apply { table: TableId::new("t"), message: "deadlock detected".into(), permanent: false },
        false,
        "store_apply"
    )]
    #[case::rejected_rows(
        StoreError::Apply { table: TableId::new("t"), message: "value too long".into(), permanent: true },
        true,
        "store_apply"
    )]
    #[case::unavailable(StoreError::Unavailable("pool timed out".into()), false, "store_apply")]
    fn test_store_errors(#[case] error: StoreError, #[case] fatal: bool, #[case] kind: &str) {
        let error = CommitError::from(error);
        assert_eq!(error.is_fatal(), fatal);
        assert_eq!(error.is_retryable(), !fatal);
        assert_eq!(error.kind(), kind);
    }
}

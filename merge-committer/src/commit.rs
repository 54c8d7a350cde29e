//! Commit Executor - the only writer of the table snapshot and the checkpoint.
//!
//! Per batch: skip if empty, acquire the table lock, read the schema, dedup and
//! plan against it, apply the merge, then advance the checkpoint and release.
//! The checkpoint moves only after the table store reported success.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::dedup::Deduplicator;
use crate::error::CommitError;
use crate::lock::{LockCoordinator, LockGuard};
use crate::merge::{MergePlanner, MergeSpec};
use crate::metrics_consts::{
    APPLY_ATTEMPTS, CHECKPOINT_OFFSET, COMMITS_TOTAL, COMMIT_DURATION_MS, EMPTY_BATCHES_SKIPPED,
    ROWS_DEDUPLICATED,
};
use crate::position::StreamPosition;
use crate::retry::RetryPolicy;
use crate::schema::TableId;
use crate::store::TableStore;
use crate::window::Batch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The batch held no events; nothing was locked, written or checkpointed.
    Skipped,
    Committed {
        rows: usize,
        position: StreamPosition,
    },
}

pub struct CommitExecutor {
    table: TableId,
    lock: LockCoordinator,
    store: Arc<dyn TableStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    deduplicator: Deduplicator,
    planner: MergePlanner,
    apply_retry: RetryPolicy,
    committed: StreamPosition,
}

impl CommitExecutor {
    pub fn new(
        lock: LockCoordinator,
        store: Arc<dyn TableStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        key_column: &str,
        apply_retry: RetryPolicy,
    ) -> Self {
        let table = lock.resource().clone();
        Self {
            deduplicator: Deduplicator::new(key_column),
            planner: MergePlanner::new(table.clone(), key_column),
            table,
            lock,
            store,
            checkpoints,
            apply_retry,
            committed: StreamPosition::new(),
        }
    }

    /// Resume from a previously saved position.
    pub fn resume_from(&mut self, position: StreamPosition) {
        self.committed = position;
    }

    /// Position covered by the last successful commit.
    pub fn committed(&self) -> &StreamPosition {
        &self.committed
    }

    pub fn lock(&self) -> &LockCoordinator {
        &self.lock
    }

    pub async fn commit(
        &mut self,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<CommitOutcome, CommitError> {
        if batch.is_empty() {
            metrics::counter!(EMPTY_BATCHES_SKIPPED).increment(1);
            debug!(batch_id = batch.id, "empty batch, nothing to commit");
            return Ok(CommitOutcome::Skipped);
        }

        let started = Instant::now();
        let guard = self.lock.acquire(cancel).await.inspect_err(|e| {
            metrics::counter!(COMMITS_TOTAL, "outcome" => "lock_failed").increment(1);
            warn!(batch_id = batch.id, error = %e, "could not acquire commit lock");
        })?;

        let applied = self.apply_under_lock(batch, &guard, cancel).await;

        let result = match applied {
            Ok(rows) => self.advance_checkpoint(batch).await.map(|position| {
                CommitOutcome::Committed { rows, position }
            }),
            Err(e) => Err(e),
        };

        // best effort, an unreleased lease just expires
        drop(guard.release().await);

        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) => e.kind(),
        };
        metrics::counter!(COMMITS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(COMMIT_DURATION_MS).record(started.elapsed().as_millis() as f64);

        if let Ok(CommitOutcome::Committed { rows, position }) = &result {
            info!(
                batch_id = batch.id,
                events = batch.len(),
                rows,
                position = %position,
                "committed batch"
            );
        }
        result
    }

    /// Steps run while holding the lock, up to and including a successful apply.
    async fn apply_under_lock(
        &self,
        batch: &Batch,
        guard: &LockGuard,
        cancel: &CancellationToken,
    ) -> Result<usize, CommitError> {
        let schema = tokio::select! {
            biased;
            _ = guard.lost().cancelled() => return Err(CommitError::LeaseLost(self.table.clone())),
            _ = cancel.cancelled() => return Err(CommitError::Cancelled),
            schema = self.store.read_schema(&self.table) => schema?,
        };

        let rows = self.deduplicator.deduplicate(&batch.events, &schema)?;
        metrics::counter!(ROWS_DEDUPLICATED).increment(rows.len() as u64);
        let merge = self.planner.plan(&schema, rows);
        debug!(
            batch_id = batch.id,
            events = batch.len(),
            upserts = merge.upserts.len(),
            deletes = merge.deletes.len(),
            "planned merge"
        );

        self.apply_with_retry(&merge, guard, cancel).await?;
        Ok(merge.row_count())
    }

    async fn apply_with_retry(
        &self,
        merge: &MergeSpec,
        guard: &LockGuard,
        cancel: &CancellationToken,
    ) -> Result<(), CommitError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let applied = tokio::select! {
                biased;
                _ = guard.lost().cancelled() => return Err(CommitError::LeaseLost(self.table.clone())),
                _ = cancel.cancelled() => return Err(CommitError::Cancelled),
                applied = self.store.apply_merge(merge) => applied,
            };

            match applied {
                Ok(()) => {
                    metrics::counter!(APPLY_ATTEMPTS, "outcome" => "applied").increment(1);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && self.apply_retry.should_retry(attempt) => {
                    metrics::counter!(APPLY_ATTEMPTS, "outcome" => "retry").increment(1);
                    let backoff = self.apply_retry.retry_interval(attempt);
                    warn!(
                        table = %self.table,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "merge apply failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = guard.lost().cancelled() => return Err(CommitError::LeaseLost(self.table.clone())),
                        _ = cancel.cancelled() => return Err(CommitError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    metrics::counter!(APPLY_ATTEMPTS, "outcome" => "failed").increment(1);
                    return Err(e.into());
                }
            }
        }
    }

    async fn advance_checkpoint(&mut self, batch: &Batch) -> Result<StreamPosition, CommitError> {
        let mut position = self.committed.clone();
        position.merge(&batch.next_offsets);

        let checkpoint = Checkpoint::new(position.clone(), batch.id);
        self.checkpoints
            .save(&checkpoint)
            .await
            .map_err(CommitError::CheckpointPersist)?;

        for (partition, offset) in position.partitions() {
            metrics::gauge!(CHECKPOINT_OFFSET, "partition" => partition.to_string())
                .set(offset as f64);
        }
        self.committed = position.clone();
        Ok(position)
    }
}

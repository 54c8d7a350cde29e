use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::commit::{CommitExecutor, CommitOutcome};
use crate::config::ControllerConfig;
use crate::error::CommitError;
use crate::lock::{LockCoordinator, LockService};
use crate::metrics_consts::BATCH_REPLAYS;
use crate::position::StreamPosition;
use crate::server::ControllerHealth;
use crate::source::StreamSource;
use crate::store::TableStore;
use crate::window::{Batch, WindowAccumulator};

/// Counters for one `Controller::run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub committed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub rows: u64,
}

/// Drives micro-batch cycles for one table: accumulate a window, commit it, and
/// replay it from the stream when the commit did not go through.
pub struct Controller<S> {
    config: ControllerConfig,
    source: S,
    accumulator: WindowAccumulator,
    executor: CommitExecutor,
    checkpoints: Arc<dyn CheckpointStore>,
    health: ControllerHealth,
}

impl<S> Controller<S>
where
    S: StreamSource,
{
    pub fn new(
        config: ControllerConfig,
        source: S,
        locks: Arc<dyn LockService>,
        store: Arc<dyn TableStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let coordinator = LockCoordinator::new(
            locks,
            config.table.clone(),
            &config.controller_id,
            config.lock_lease_ttl,
            config.acquire_retry.clone(),
        );
        let executor = CommitExecutor::new(
            coordinator,
            store,
            checkpoints.clone(),
            &config.primary_key,
            config.apply_retry.clone(),
        );

        Self {
            accumulator: WindowAccumulator::new(config.window.clone()),
            config,
            source,
            executor,
            checkpoints,
            health: ControllerHealth::new(),
        }
    }

    pub fn with_health(mut self, health: ControllerHealth) -> Self {
        self.health = health;
        self
    }

    pub fn committed(&self) -> &StreamPosition {
        self.executor.committed()
    }

    /// Run cycles until cancelled, the source ends, or a fatal error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunSummary, CommitError> {
        let checkpoint = self
            .checkpoints
            .load()
            .await
            .map_err(CommitError::CheckpointLoad)
            .inspect_err(|_| self.health.report_halted())?;

        let resume = checkpoint.map(|c| {
            info!(
                table = %self.config.table,
                batch_id = c.batch_id,
                position = %c.position,
                committed_at = %c.committed_at,
                "resuming from checkpoint"
            );
            c.position
        });

        if let Err(e) = self
            .source
            .start(self.config.starting_offset_policy, resume.as_ref())
            .await
        {
            self.health.report_halted();
            return Err(e.into());
        }
        self.executor.resume_from(resume.unwrap_or_default());
        self.health.report_healthy(self.liveness_deadline());

        info!(
            table = %self.config.table,
            controller_id = %self.config.controller_id,
            policy = %self.config.starting_offset_policy,
            window_secs = self.config.window.window_size.as_secs(),
            "controller started"
        );

        let mut summary = RunSummary::default();
        while !cancel.is_cancelled() {
            let batch = match self.accumulator.next_batch(&mut self.source, cancel).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(table = %self.config.table, error = %e, "failed to read from stream");
                    summary.failed += 1;
                    self.replay(&e.partial).await?;
                    self.pause(cancel).await;
                    continue;
                }
            };
            if cancel.is_cancelled() {
                // never commit a window cut short by shutdown
                break;
            }
            summary.batches += 1;

            let span = info_span!("commit_cycle", table = %self.config.table, batch_id = batch.id);
            let result = self.executor.commit(&batch, cancel).instrument(span).await;

            match result {
                Ok(CommitOutcome::Skipped) => summary.skipped += 1,
                Ok(CommitOutcome::Committed { rows, .. }) => {
                    summary.committed += 1;
                    summary.rows += rows as u64;
                }
                Err(CommitError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!(
                        table = %self.config.table,
                        batch_id = batch.id,
                        error = ?e,
                        "halting controller"
                    );
                    self.health.report_halted();
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        table = %self.config.table,
                        batch_id = batch.id,
                        error = %e,
                        "commit failed, batch will be replayed"
                    );
                    summary.failed += 1;
                    self.replay(&batch).await?;
                    self.health.report_healthy(self.liveness_deadline());
                    self.pause(cancel).await;
                    continue;
                }
            }

            self.health.report_healthy(self.liveness_deadline());
            if batch.end_of_stream {
                info!(table = %self.config.table, "stream ended");
                break;
            }
        }

        info!(
            table = %self.config.table,
            batches = summary.batches,
            committed = summary.committed,
            failed = summary.failed,
            position = %self.executor.committed(),
            "controller stopped"
        );
        Ok(summary)
    }

    /// Rewind the source so an uncommitted batch is read again. Every partition
    /// the batch touched goes back to its committed position, or to the batch's
    /// first offset when nothing was committed there yet.
    ///
    /// A failed rewind stops the controller: reading on would let a later commit
    /// advance the checkpoint past events that were never applied.
    async fn replay(&mut self, batch: &Batch) -> Result<(), CommitError> {
        let committed = self.executor.committed();
        let rewind_to: StreamPosition = batch
            .first_offsets
            .partitions()
            .map(|(partition, first)| (partition, committed.get(partition).unwrap_or(first)))
            .collect();
        if rewind_to.is_empty() {
            return Ok(());
        }

        metrics::counter!(BATCH_REPLAYS).increment(1);
        if let Err(e) = self.source.rewind(&rewind_to).await {
            error!(
                table = %self.config.table,
                error = ?e,
                position = %rewind_to,
                "failed to rewind stream, halting controller"
            );
            self.health.report_halted();
            return Err(e.into());
        }
        debug!(table = %self.config.table, position = %rewind_to, "rewound stream for replay");
        Ok(())
    }

    async fn pause(&self, cancel: &CancellationToken) {
        let retry = &self.config.acquire_retry;
        let wait = retry.maximum_interval.unwrap_or(retry.initial_interval);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Longest a healthy cycle can take: two windows, one lease, and every
    /// acquire and apply retry backing off for as long as allowed.
    fn liveness_deadline(&self) -> Duration {
        let acquire = &self.config.acquire_retry;
        let apply = &self.config.apply_retry;
        self.config
            .window
            .window_size
            .saturating_mul(2)
            .saturating_add(self.config.lock_lease_ttl)
            .saturating_add(acquire.longest_interval().saturating_mul(acquire.max_attempts))
            .saturating_add(apply.longest_interval().saturating_mul(apply.max_attempts))
    }
}

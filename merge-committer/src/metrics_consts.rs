// ==== Window metrics ====
/// Histogram for time spent collecting one window
pub const BATCH_COLLECTION_DURATION_MS: &str = "merge_committer_batch_collection_duration_ms";

/// Histogram for number of events per batch
pub const BATCH_SIZE: &str = "merge_committer_batch_size_events";

/// Counter for records consumed from the stream that could not be decoded (with reason label)
pub const EVENTS_SKIPPED: &str = "merge_committer_events_skipped_total";

/// Counter for batches that held no events and were not committed
pub const EMPTY_BATCHES_SKIPPED: &str = "merge_committer_empty_batches_skipped_total";

/// Counter for replays after a failed cycle
pub const BATCH_REPLAYS: &str = "merge_committer_batch_replays_total";

// ==== Commit metrics ====
/// Counter for rows left after deduplication
pub const ROWS_DEDUPLICATED: &str = "merge_committer_rows_deduplicated_total";

/// Counter for commit attempts (with outcome label: committed or the error kind)
pub const COMMITS_TOTAL: &str = "merge_committer_commits_total";

/// Histogram for lock-to-release commit duration
pub const COMMIT_DURATION_MS: &str = "merge_committer_commit_duration_ms";

/// Counter for merge apply attempts (with outcome label: applied/retry/failed)
pub const APPLY_ATTEMPTS: &str = "merge_committer_apply_attempts_total";

/// Gauge for the committed next offset (with partition label)
pub const CHECKPOINT_OFFSET: &str = "merge_committer_checkpoint_offset";

// ==== Lock metrics ====
/// Counter for lock acquire attempts (with outcome label: acquired/contention/unavailable/error)
pub const LOCK_ACQUIRE_ATTEMPTS: &str = "merge_committer_lock_acquire_attempts_total";

/// Counter for lease renewals (with outcome label: renewed/retry/lost)
pub const LOCK_RENEWALS: &str = "merge_committer_lock_renewals_total";

/// Counter for lock releases (with outcome label: released/expire)
pub const LOCK_RELEASES: &str = "merge_committer_lock_releases_total";

/// Gauge set to 1 while this controller holds the commit lock
pub const LOCK_HELD: &str = "merge_committer_lock_held";

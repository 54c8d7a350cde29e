use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::event::PrimaryKey;
use crate::merge::MergeSpec;
use crate::schema::{ColumnSet, TableId};
use crate::store::{StoreError, TableStore};

pub type Rows = BTreeMap<PrimaryKey, Map<String, Value>>;

/// In-memory table store holding a single table.
///
/// Merges apply all-or-nothing under a mutex. Failures and slow applies can be
/// injected, and the highest number of overlapping applies is recorded so tests
/// can check that commits never ran concurrently.
#[derive(Clone)]
pub struct MemoryTableStore {
    table: TableId,
    schema: Arc<Mutex<ColumnSet>>,
    rows: Arc<Mutex<Rows>>,
    failing_applies: Arc<AtomicU32>,
    fail_permanently: Arc<AtomicBool>,
    apply_delay: Arc<Mutex<Duration>>,
    applied: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MemoryTableStore {
    pub fn new(table: TableId, schema: ColumnSet) -> Self {
        Self {
            table,
            schema: Arc::new(Mutex::new(schema)),
            rows: Arc::new(Mutex::new(BTreeMap::new())),
            failing_applies: Arc::new(AtomicU32::new(0)),
            fail_permanently: Arc::new(AtomicBool::new(false)),
            apply_delay: Arc::new(Mutex::new(Duration::ZERO)),
            applied: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_rows(self, rows: Rows) -> Self {
        *self.rows.lock().unwrap_or_else(|e| e.into_inner()) = rows;
        self
    }

    pub fn rows(&self) -> Rows {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_schema(&self, schema: ColumnSet) {
        *self.schema.lock().unwrap_or_else(|e| e.into_inner()) = schema;
    }

    /// Fail the next `count` applies with a retryable error, leaving the table unchanged.
    pub fn fail_next_applies(&self, count: u32) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    /// Make every apply fail with an error marked permanent.
    pub fn fail_permanently(&self, fail: bool) {
        self.fail_permanently.store(fail, Ordering::SeqCst);
    }

    /// Hold every apply for `delay` before it takes effect.
    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Number of merges that took effect.
    pub fn applied_merges(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// Highest number of applies observed running at the same time.
    pub fn max_concurrent_applies(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_table(&self, table: &TableId) -> Result<(), StoreError> {
        if *table != self.table {
            return Err(StoreError::UnknownTable(table.clone()));
        }
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn read_schema(&self, table: &TableId) -> Result<ColumnSet, StoreError> {
        self.check_table(table)?;
        Ok(self.schema.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn apply_merge(&self, merge: &MergeSpec) -> Result<(), StoreError> {
        self.check_table(&merge.table)?;
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let delay = *self.apply_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_permanently.load(Ordering::SeqCst) {
            return Err(StoreError::Apply {
                table: merge.table.clone(),
                message: "injected permanent failure".to_string(),
                permanent: true,
            });
        }
        if self
            .failing_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Apply {
                table: merge.table.clone(),
                message: "injected apply failure".to_string(),
                permanent: false,
            });
        }

        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        merge.apply_to(&mut rows);
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

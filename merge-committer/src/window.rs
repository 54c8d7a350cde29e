//! Window Accumulator - groups the events of one time window into a batch
//!
//! A window closes when its duration elapses, when the source reports the end of
//! the stream, when the optional event cap is reached, or on cancellation. Batches
//! are rebuilt after a failed commit by rewinding the source and accumulating again.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::ChangeEvent;
use crate::metrics_consts::{BATCH_COLLECTION_DURATION_MS, BATCH_SIZE};
use crate::position::{Offset, StreamPosition};
use crate::source::{Polled, SourceError, StreamSource};

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub window_size: Duration,
    /// Upper bound on a single poll, so cancellation and the window deadline are noticed promptly.
    pub poll_interval: Duration,
    pub max_batch_events: Option<usize>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_secs(100),
            poll_interval: Duration::from_millis(500),
            max_batch_events: None,
        }
    }
}

/// The change events observed during one window, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub id: u64,
    pub events: Vec<ChangeEvent>,
    /// Offset of the first record read per partition, skipped records included.
    pub first_offsets: StreamPosition,
    /// Next offset to read per partition once this batch is committed.
    pub next_offsets: StreamPosition,
    pub end_of_stream: bool,
}

impl Batch {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.observe(&event.offset);
        self.events.push(event);
    }

    /// Record a consumed offset that produced no event.
    pub fn observe(&mut self, offset: &Offset) {
        if self.first_offsets.get(offset.partition).is_none() {
            self.first_offsets.advance_to(offset.partition, offset.offset);
        }
        self.next_offsets.advance_past(offset);
    }
}

/// A poll failed part way through a window. `partial` holds what was read before
/// the failure so the caller knows which offsets to replay.
#[derive(Error, Debug)]
#[error("window {} interrupted after {} events: {source}", .partial.id, .partial.len())]
pub struct WindowError {
    #[source]
    pub source: SourceError,
    pub partial: Batch,
}

pub struct WindowAccumulator {
    config: WindowConfig,
    next_batch_id: u64,
}

impl WindowAccumulator {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            next_batch_id: 1,
        }
    }

    /// Read from `source` until the window closes and hand back what was seen.
    /// The returned batch may be empty.
    pub async fn next_batch<S>(
        &mut self,
        source: &mut S,
        cancel: &CancellationToken,
    ) -> Result<Batch, WindowError>
    where
        S: StreamSource + ?Sized,
    {
        let started = Instant::now();
        let deadline = started + self.config.window_size;

        let mut batch = Batch::new(self.next_batch_id);
        self.next_batch_id += 1;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self
                .config
                .max_batch_events
                .is_some_and(|max| batch.len() >= max)
            {
                break;
            }

            let wait = self.config.poll_interval.min(deadline - now);
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = source.poll(wait) => match polled {
                    Ok(polled) => polled,
                    Err(source) => return Err(WindowError { source, partial: batch }),
                },
            };

            match polled {
                Polled::Event(event) => batch.push(event),
                Polled::Skipped(offset) => batch.observe(&offset),
                Polled::Idle => {}
                Polled::EndOfStream => {
                    batch.end_of_stream = true;
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        metrics::histogram!(BATCH_COLLECTION_DURATION_MS).record(elapsed.as_millis() as f64);
        metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);
        debug!(
            batch_id = batch.id,
            events = batch.len(),
            next_offsets = %batch.next_offsets,
            elapsed_ms = elapsed.as_millis() as u64,
            "window closed"
        );

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemoryStreamSource, StartingOffsetPolicy};
    use crate::test_utils::upsert;

    async fn started(source: MemoryStreamSource) -> MemoryStreamSource {
        let mut source = source;
        source
            .start(StartingOffsetPolicy::Earliest, None)
            .await
            .unwrap();
        source
    }

    fn config(window_secs: u64) -> WindowConfig {
        WindowConfig {
            window_size: Duration::from_secs(window_secs),
            poll_interval: Duration::from_millis(100),
            max_batch_events: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_collects_until_deadline() {
        let source = MemoryStreamSource::from_events(vec![
            upsert(1, 10, "a", Offset::new(0, 0)),
            upsert(2, 10, "b", Offset::new(0, 1)),
        ]);
        let mut source = started(source).await;
        let mut accumulator = WindowAccumulator::new(config(5));

        let batch = accumulator
            .next_batch(&mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch.id, 1);
        assert_eq!(batch.len(), 2);
        assert!(!batch.end_of_stream);
        assert_eq!(batch.first_offsets.get(0), Some(0));
        assert_eq!(batch.next_offsets.get(0), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_window_and_sequential_ids() {
        let mut source = started(MemoryStreamSource::new()).await;
        let mut accumulator = WindowAccumulator::new(config(1));
        let cancel = CancellationToken::new();

        let first = accumulator.next_batch(&mut source, &cancel).await.unwrap();
        let second = accumulator.next_batch(&mut source, &cancel).await.unwrap();

        assert!(first.is_empty());
        assert!(first.next_offsets.is_empty());
        assert_eq!((first.id, second.id), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_closes_window_early() {
        let source = MemoryStreamSource::from_events(vec![upsert(1, 10, "a", Offset::new(0, 0))]);
        source.close();
        let mut source = started(source).await;
        let mut accumulator = WindowAccumulator::new(config(3600));

        let batch = accumulator
            .next_batch(&mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert!(batch.end_of_stream);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_batch_events_caps_window() {
        let source = MemoryStreamSource::from_events(vec![
            upsert(1, 10, "a", Offset::new(0, 0)),
            upsert(2, 10, "b", Offset::new(0, 1)),
            upsert(3, 10, "c", Offset::new(0, 2)),
        ]);
        let mut source = started(source).await;
        let mut accumulator = WindowAccumulator::new(WindowConfig {
            max_batch_events: Some(2),
            ..config(3600)
        });
        let cancel = CancellationToken::new();

        let first = accumulator.next_batch(&mut source, &cancel).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.next_offsets.get(0), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_window() {
        let mut source = started(MemoryStreamSource::new()).await;
        let mut accumulator = WindowAccumulator::new(config(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = accumulator.next_batch(&mut source, &cancel).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_records_advance_offsets_only() {
        let source = MemoryStreamSource::new();
        let decoder = crate::event::EventDecoder::new("id", "m_time");
        source.push_payload(&decoder, Offset::new(0, 0), b"not json");
        source.push_event(upsert(1, 10, "a", Offset::new(0, 1)));
        source.close();
        let mut source = started(source).await;
        let mut accumulator = WindowAccumulator::new(config(10));

        let batch = accumulator
            .next_batch(&mut source, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.first_offsets.get(0), Some(0));
        assert_eq!(batch.next_offsets.get(0), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_hands_back_partial_window() {
        let mut source = MemoryStreamSource::from_events(vec![upsert(1, 10, "a", Offset::new(0, 0))]);
        let mut accumulator = WindowAccumulator::new(config(10));

        // never started, so the first poll fails
        let err = accumulator
            .next_batch(&mut source, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.source, SourceError::NotStarted));
        assert_eq!(err.partial.id, 1);
        assert!(err.partial.is_empty());
    }
}

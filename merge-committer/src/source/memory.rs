use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::event::{ChangeEvent, EventDecoder, ParseError};
use crate::position::{Offset, StreamPosition};
use crate::source::{Polled, SourceError, StartingOffsetPolicy, StreamSource};

type Record = (Offset, Result<ChangeEvent, ParseError>);

/// A process-local stream with per-partition read positions, mirroring how a
/// partitioned log is consumed. Records can be appended while it is being read.
#[derive(Clone, Default)]
pub struct MemoryStreamSource {
    inner: Arc<Mutex<MemoryStream>>,
}

#[derive(Default)]
struct MemoryStream {
    records: Vec<Record>,
    next_offsets: BTreeMap<i32, i64>,
    started: bool,
    closed: bool,
}

impl MemoryStream {
    fn first_offset(&self, partition: i32) -> i64 {
        self.records
            .iter()
            .filter(|(o, _)| o.partition == partition)
            .map(|(o, _)| o.offset)
            .min()
            .unwrap_or(0)
    }

    fn end_offset(&self, partition: i32) -> i64 {
        self.records
            .iter()
            .filter(|(o, _)| o.partition == partition)
            .map(|(o, _)| o.offset + 1)
            .max()
            .unwrap_or(0)
    }

    fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.records.iter().map(|(o, _)| o.partition).collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }

    fn next_record(&mut self) -> Option<Record> {
        let next_offsets = &self.next_offsets;
        let found = self.records.iter().find(|(offset, _)| {
            offset.offset >= *next_offsets.get(&offset.partition).unwrap_or(&0)
        })?;
        let found = found.clone();
        self.next_offsets
            .insert(found.0.partition, found.0.offset + 1);
        Some(found)
    }
}

impl MemoryStreamSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        let source = Self::new();
        for event in events {
            source.push_event(event);
        }
        source
    }

    pub fn push_event(&self, event: ChangeEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.push((event.offset, Ok(event)));
    }

    /// Append a raw payload, decoded the way the Kafka source decodes messages.
    pub fn push_payload(&self, decoder: &EventDecoder, offset: Offset, payload: &[u8]) {
        let decoded = decoder.decode(payload, offset);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.records.push((offset, decoded));
    }

    /// Signal that no more records will be appended. Polls past the last record
    /// then report `EndOfStream`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
    }
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn start(
        &mut self,
        policy: StartingOffsetPolicy,
        checkpoint: Option<&StreamPosition>,
    ) -> Result<(), SourceError> {
        if policy == StartingOffsetPolicy::FromCheckpoint && checkpoint.is_none() {
            return Err(SourceError::MissingCheckpoint);
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut next_offsets = BTreeMap::new();
        for partition in inner.partitions() {
            let next = match checkpoint.and_then(|c| c.get(partition)) {
                Some(next) => next,
                None if policy == StartingOffsetPolicy::Latest => inner.end_offset(partition),
                None => inner.first_offset(partition),
            };
            next_offsets.insert(partition, next);
        }
        if let Some(checkpoint) = checkpoint {
            for (partition, next) in checkpoint.partitions() {
                next_offsets.entry(partition).or_insert(next);
            }
        }
        inner.next_offsets = next_offsets;
        inner.started = true;
        Ok(())
    }

    async fn rewind(&mut self, position: &StreamPosition) -> Result<(), SourceError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (partition, next) in position.partitions() {
            inner.next_offsets.insert(partition, next);
        }
        Ok(())
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Polled, SourceError> {
        let closed = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.started {
                return Err(SourceError::NotStarted);
            }
            match inner.next_record() {
                Some((_, Ok(event))) => return Ok(Polled::Event(event)),
                Some((offset, Err(_))) => return Ok(Polled::Skipped(offset)),
                None => inner.closed,
            }
        };

        if closed {
            return Ok(Polled::EndOfStream);
        }
        tokio::time::sleep(max_wait).await;
        Ok(Polled::Idle)
    }
}

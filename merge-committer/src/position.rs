//! Stream positions.
//!
//! Offsets are only comparable within a partition. A `StreamPosition` records,
//! for each partition, the next offset to read, and only ever moves forward.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Location of a single record in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Offset {
    pub partition: i32,
    pub offset: i64,
}

impl Offset {
    pub fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// Next offset to read, per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamPosition {
    next_offsets: BTreeMap<i32, i64>,
}

impl StreamPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.next_offsets.is_empty()
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        self.next_offsets.get(&partition).copied()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.next_offsets.iter().map(|(p, o)| (*p, *o))
    }

    /// Set the next offset for a partition. Never moves a partition backwards.
    pub fn advance_to(&mut self, partition: i32, next_offset: i64) {
        self.next_offsets
            .entry(partition)
            .and_modify(|current| {
                if next_offset > *current {
                    *current = next_offset;
                }
            })
            .or_insert(next_offset);
    }

    /// Record that `offset` has been consumed.
    pub fn advance_past(&mut self, offset: &Offset) {
        self.advance_to(offset.partition, offset.offset + 1);
    }

    /// Fold another position into this one, keeping the furthest offset per partition.
    pub fn merge(&mut self, other: &StreamPosition) {
        for (partition, next_offset) in other.partitions() {
            self.advance_to(partition, next_offset);
        }
    }
}

impl FromIterator<(i32, i64)> for StreamPosition {
    fn from_iter<T: IntoIterator<Item = (i32, i64)>>(iter: T) -> Self {
        let mut position = StreamPosition::new();
        for (partition, next_offset) in iter {
            position.advance_to(partition, next_offset);
        }
        position
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .next_offsets
            .iter()
            .map(|(p, o)| format!("{p}:{o}"))
            .collect();
        write!(f, "[{}]", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_never_goes_backwards() {
        let mut position = StreamPosition::new();
        position.advance_to(0, 100);
        position.advance_to(0, 50);

        assert_eq!(position.get(0), Some(100));
    }

    #[test]
    fn test_advance_past_stores_next_offset() {
        let mut position = StreamPosition::new();
        position.advance_past(&Offset::new(3, 41));

        assert_eq!(position.get(3), Some(42));
        assert_eq!(position.get(0), None);
    }

    #[test]
    fn test_merge_keeps_furthest_offsets() {
        let mut committed: StreamPosition = [(0, 10), (1, 5)].into_iter().collect();
        let batch: StreamPosition = [(1, 8), (2, 3)].into_iter().collect();

        committed.merge(&batch);

        assert_eq!(committed.get(0), Some(10));
        assert_eq!(committed.get(1), Some(8));
        assert_eq!(committed.get(2), Some(3));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let position: StreamPosition = [(0, 7)].into_iter().collect();
        let json = serde_json::to_string(&position).unwrap();
        assert_eq!(json, r#"{"0":7}"#);

        let back: StreamPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, position);
    }
}

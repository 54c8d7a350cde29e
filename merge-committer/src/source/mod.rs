use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::event::ChangeEvent;
use crate::position::{Offset, StreamPosition};

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaSourceConfig, KafkaStreamSource};
pub use memory::MemoryStreamSource;

/// Where to begin reading partitions that have no checkpointed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartingOffsetPolicy {
    Earliest,
    Latest,
    /// Resume only: refuse to start without a stored checkpoint.
    FromCheckpoint,
}

impl FromStr for StartingOffsetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earliest" | "trim_horizon" => Ok(StartingOffsetPolicy::Earliest),
            "latest" => Ok(StartingOffsetPolicy::Latest),
            "checkpoint" | "from_checkpoint" => Ok(StartingOffsetPolicy::FromCheckpoint),
            invalid => Err(format!("{invalid} is not a valid starting offset policy")),
        }
    }
}

impl fmt::Display for StartingOffsetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartingOffsetPolicy::Earliest => write!(f, "earliest"),
            StartingOffsetPolicy::Latest => write!(f, "latest"),
            StartingOffsetPolicy::FromCheckpoint => write!(f, "checkpoint"),
        }
    }
}

/// Enumeration of errors raised while reading the change stream.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} does not exist or has no partitions")]
    UnknownTopic(String),
    #[error("starting offset policy requires a checkpoint but none was found")]
    MissingCheckpoint,
    #[error("stream source was polled before it was started")]
    NotStarted,
}

/// Result of a single poll of the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Event(ChangeEvent),
    /// A record that could not be decoded. It is consumed but never committed to the table.
    Skipped(Offset),
    /// Nothing arrived within the poll wait.
    Idle,
    /// The source will not produce any more records.
    EndOfStream,
}

/// Reads change events with offsets at or past a position, in arrival order.
#[async_trait]
pub trait StreamSource: Send {
    /// Position the source before the first poll. Partitions present in `checkpoint`
    /// resume from it, all others follow `policy`.
    async fn start(
        &mut self,
        policy: StartingOffsetPolicy,
        checkpoint: Option<&StreamPosition>,
    ) -> Result<(), SourceError>;

    /// Move the listed partitions back to the given next offsets so a batch can be rebuilt.
    async fn rewind(&mut self, position: &StreamPosition) -> Result<(), SourceError>;

    async fn poll(&mut self, max_wait: Duration) -> Result<Polled, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_starting_offset_policy() {
        assert_eq!(
            "LATEST".parse::<StartingOffsetPolicy>(),
            Ok(StartingOffsetPolicy::Latest)
        );
        assert_eq!(
            "TRIM_HORIZON".parse::<StartingOffsetPolicy>(),
            Ok(StartingOffsetPolicy::Earliest)
        );
        assert_eq!(
            "checkpoint".parse::<StartingOffsetPolicy>(),
            Ok(StartingOffsetPolicy::FromCheckpoint)
        );
        assert!("sometime".parse::<StartingOffsetPolicy>().is_err());
    }
}

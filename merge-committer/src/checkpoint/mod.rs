use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::StreamPosition;

pub mod file;
pub mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Stream progress whose batches are fully committed to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Next offset to read, per partition.
    pub position: StreamPosition,
    /// Id of the batch whose commit produced this checkpoint.
    pub batch_id: u64,
    pub committed_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(position: StreamPosition, batch_id: u64) -> Self {
        Self {
            position,
            batch_id,
            committed_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for the committed checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last saved checkpoint, or `None` before the first commit.
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Durably replace the saved checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

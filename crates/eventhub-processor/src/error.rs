//! Error types for the event processor

use crate::consumer::ReceiveError;
use crate::handler::HandlerError;
use eventhub_checkpoint::CheckpointStoreError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Event processor already started")]
    AlreadyStarted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Checkpoint store error: {0}")]
    Store(#[from] CheckpointStoreError),

    #[error("Invalid partition ownership data from checkpoint store: {0}")]
    CorruptOwnership(String),

    #[error("Nothing to checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("There are no partitions in event hub {0}")]
    NoPartitions(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Receive error: {0}")]
    Receive(#[from] ReceiveError),

    #[error("Error processing event: {0}")]
    Handler(#[from] HandlerError),
}

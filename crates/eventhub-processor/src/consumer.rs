//! Receive Layer Boundary
//!
//! The processor does not speak the broker protocol itself. It needs two
//! things from whatever does: the list of partition ids, and a stream of
//! events for one partition starting at a position.
//!
//! ## Exclusive Receivers
//!
//! `ReceiveOptions::owner_level` asks for an exclusive receiver. Opening a
//! receiver with an owner level at least as high as the current one closes
//! the current receiver's stream. The closed side only sees a normal end of
//! stream, which is indistinguishable from any other link closure.

use async_trait::async_trait;
use eventhub_core::{EventData, EventPosition};
use futures::stream::BoxStream;
use thiserror::Error;

/// Events received from one partition, in partition order.
pub type EventStream = BoxStream<'static, std::result::Result<EventData, ReceiveError>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Receiver with owner level {current} already exists on partition {partition_id}; requested {requested}")]
    OwnerLevelConflict {
        partition_id: String,
        requested: i64,
        current: i64,
    },

    #[error("Link error: {0}")]
    Link(String),
}

/// Per-receiver options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Exclusive receiver level (`None` for a non-exclusive receiver)
    pub owner_level: Option<i64>,

    /// Events buffered ahead of the consumer
    pub prefetch_count: usize,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            owner_level: Some(0),
            prefetch_count: 300,
        }
    }
}

/// Connection to an event hub, as used by the processor.
#[async_trait]
pub trait EventHubConsumer: Send + Sync {
    fn fully_qualified_namespace(&self) -> &str;

    fn event_hub_name(&self) -> &str;

    async fn partition_ids(&self) -> std::result::Result<Vec<String>, ReceiveError>;

    /// Open a receiver on a partition starting at `position`.
    async fn receive(
        &self,
        partition_id: &str,
        position: EventPosition,
        options: ReceiveOptions,
    ) -> std::result::Result<EventStream, ReceiveError>;
}

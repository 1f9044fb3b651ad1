//! Contexts handed to [`EventHandler`](crate::EventHandler) callbacks

use crate::error::{ProcessorError, Result};
use eventhub_checkpoint::{Checkpoint, CheckpointStore};
use eventhub_core::EventData;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identity of one partition within a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
}

/// Why a partition pump closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor was stopped.
    EventProcessorShutdown,
    /// The receive stream ended or failed, or event processing failed.
    LostPartitionOwnership,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EventProcessorShutdown => write!(f, "EVENT_PROCESSOR_SHUTDOWN"),
            CloseReason::LostPartitionOwnership => write!(f, "LOST_PARTITION_OWNERSHIP"),
        }
    }
}

/// One received event plus a handle to checkpoint it.
pub struct EventContext {
    partition: PartitionContext,
    event: EventData,
    owner_id: String,
    store: Arc<dyn CheckpointStore>,
}

impl EventContext {
    pub(crate) fn new(
        partition: PartitionContext,
        event: EventData,
        owner_id: String,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            partition,
            event,
            owner_id,
            store,
        }
    }

    pub fn partition_context(&self) -> &PartitionContext {
        &self.partition
    }

    pub fn event(&self) -> &EventData {
        &self.event
    }

    pub fn into_event(self) -> EventData {
        self.event
    }

    /// Record this event as the partition's last processed position.
    ///
    /// Returns the checkpoint's new eTag.
    pub async fn update_checkpoint(&self) -> Result<String> {
        let mut checkpoint = Checkpoint::new(
            self.partition.fully_qualified_namespace.clone(),
            self.partition.event_hub_name.clone(),
            self.partition.consumer_group.clone(),
            self.partition.partition_id.clone(),
        )
        .with_owner_id(self.owner_id.clone());
        checkpoint.offset = self.event.offset;
        checkpoint.sequence_number = self.event.sequence_number;

        if checkpoint.offset.is_none() && checkpoint.sequence_number.is_none() {
            return Err(ProcessorError::InvalidCheckpoint(format!(
                "event on partition {} has no offset or sequence number",
                self.partition.partition_id
            )));
        }

        let e_tag = self.store.update_checkpoint(checkpoint).await?;

        debug!(
            partition_id = %self.partition.partition_id,
            offset = ?self.event.offset,
            sequence_number = ?self.event.sequence_number,
            "Checkpoint updated"
        );

        Ok(e_tag)
    }
}

/// An error reported by the processor.
///
/// `partition_id` is `None` for load-balancing failures and set for
/// failures of a single partition pump.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: Option<String>,
    pub error: Arc<ProcessorError>,
}

impl ErrorContext {
    pub(crate) fn for_cycle(
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
        error: ProcessorError,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_string(),
            event_hub_name: event_hub_name.to_string(),
            consumer_group: consumer_group.to_string(),
            partition_id: None,
            error: Arc::new(error),
        }
    }

    pub(crate) fn for_partition(partition: &PartitionContext, error: ProcessorError) -> Self {
        Self {
            fully_qualified_namespace: partition.fully_qualified_namespace.clone(),
            event_hub_name: partition.event_hub_name.clone(),
            consumer_group: partition.consumer_group.clone(),
            partition_id: Some(partition.partition_id.clone()),
            error: Arc::new(error),
        }
    }
}

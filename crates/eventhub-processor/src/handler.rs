//! Application Callbacks
//!
//! An [`EventHandler`] receives every event from every partition this
//! instance owns, plus lifecycle notifications for each partition pump and
//! every error the processor reports.

use crate::context::{CloseReason, ErrorContext, EventContext, PartitionContext};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Error returned by application event processing.
///
/// Returning it from [`EventHandler::process_event`] closes the partition's
/// pump with [`CloseReason::LostPartitionOwnership`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Callbacks invoked by the processor.
///
/// Calls for one partition are sequential and in partition order. Calls for
/// different partitions run concurrently, so implementations must be
/// Send + Sync.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called once when a pump starts, before its first event.
    async fn initialize(&self, _context: &PartitionContext) {}

    async fn process_event(&self, context: EventContext) -> Result<(), HandlerError>;

    /// Called for load-balancing failures (no partition id) and for
    /// failures that closed a partition pump.
    async fn process_error(&self, context: ErrorContext) {
        warn!(
            event_hub = %context.event_hub_name,
            consumer_group = %context.consumer_group,
            partition_id = ?context.partition_id,
            error = %context.error,
            "Unhandled event processor error"
        );
    }

    /// Called once when a pump that started is closed.
    async fn close(&self, _context: &PartitionContext, _reason: CloseReason) {}
}

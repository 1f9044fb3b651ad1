//! Checkpoint Store Type Definitions
//!
//! ## PartitionOwnership
//! A claim record asserting which processor instance reads a partition.
//! `(fully_qualified_namespace, event_hub_name, consumer_group, partition_id)`
//! is the unique key. The store assigns `last_modified_time` and `e_tag` on
//! every successful write; requests leave them as they were last read (or
//! `None` for a first-ever claim).
//!
//! ## Checkpoint
//! The last processed position of a partition for a consumer group. Written
//! by application code, read once when a partition pump starts.
//!
//! ## Design Decisions
//!
//! - Timestamps are i64 (milliseconds since epoch)
//! - An empty `owner_id` means the claim was released
//! - Scope comparisons (namespace, hub, consumer group) ignore ASCII case

use serde::{Deserialize, Serialize};

/// Ownership claim for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    /// Fully qualified namespace, e.g. `contoso.servicebus.windows.net`
    pub fully_qualified_namespace: String,

    /// Event hub name
    pub event_hub_name: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Partition ID
    pub partition_id: String,

    /// Claiming instance (empty when released)
    pub owner_id: String,

    /// Store-assigned time of the last successful write (ms since epoch)
    pub last_modified_time: Option<i64>,

    /// Store-assigned optimistic concurrency token
    pub e_tag: Option<String>,
}

impl PartitionOwnership {
    /// A claim request for a partition that has never been owned.
    pub fn new(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            event_hub_name: event_hub_name.into(),
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            owner_id: String::new(),
            last_modified_time: None,
            e_tag: None,
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_e_tag(mut self, e_tag: Option<String>) -> Self {
        self.e_tag = e_tag;
        self
    }

    /// Whether this record belongs to the given namespace/hub/consumer group.
    pub fn is_in_scope(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> bool {
        self.fully_qualified_namespace
            .eq_ignore_ascii_case(fully_qualified_namespace)
            && self.event_hub_name.eq_ignore_ascii_case(event_hub_name)
            && self.consumer_group.eq_ignore_ascii_case(consumer_group)
    }

    /// Whether the claim was released (no owner).
    pub fn is_released(&self) -> bool {
        self.owner_id.is_empty()
    }
}

/// Last processed position for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,

    /// Instance that wrote the checkpoint
    pub owner_id: Option<String>,

    /// Offset of the last processed event
    pub offset: Option<i64>,

    /// Sequence number of the last processed event
    pub sequence_number: Option<i64>,
}

impl Checkpoint {
    pub fn new(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            event_hub_name: event_hub_name.into(),
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            owner_id: None,
            offset: None,
            sequence_number: None,
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn is_in_scope(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> bool {
        self.fully_qualified_namespace
            .eq_ignore_ascii_case(fully_qualified_namespace)
            && self.event_hub_name.eq_ignore_ascii_case(event_hub_name)
            && self.consumer_group.eq_ignore_ascii_case(consumer_group)
    }
}

//! Event Data Structure
//!
//! An event is the unit of data appended to a partition. Events published by
//! producers only carry a body, properties and an optional partition key. The
//! service stamps the remaining fields (offset, sequence number, enqueued
//! time) when the event is appended to a partition, so a received event
//! always has them set.
//!
//! ## Example
//! ```ignore
//! let event = EventData::new(Bytes::from(r#"{"action": "click"}"#))
//!     .with_partition_key("user-42")
//!     .with_property("content-type", "application/json");
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single event in a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Payload
    pub body: Bytes,

    /// Application properties
    pub properties: HashMap<String, String>,

    /// Partition key used by the publisher, if any
    pub partition_key: Option<String>,

    /// Offset of this event in the partition (set by the service)
    pub offset: Option<i64>,

    /// Sequence number of this event in the partition (set by the service)
    pub sequence_number: Option<i64>,

    /// Enqueued time in milliseconds since epoch (set by the service)
    pub enqueued_time: Option<i64>,
}

impl EventData {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: HashMap::new(),
            partition_key: None,
            offset: None,
            sequence_number: None,
            enqueued_time: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Body interpreted as UTF-8, if it is valid UTF-8
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Estimate the size of this event in bytes
    pub fn estimated_size(&self) -> usize {
        self.body.len()
            + self
                .properties
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + self.partition_key.as_ref().map(|k| k.len()).unwrap_or(0)
    }
}

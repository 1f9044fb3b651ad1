//! Event Hub Checkpoint Store
//!
//! This crate defines the durable state shared by every processor instance in
//! a consumer group, and the contract any persistence backend must honor.
//!
//! ## What Is Stored
//!
//! - **Partition ownership**: which instance currently reads each partition.
//!   Claims are written with eTag-conditioned (optimistic) writes; two
//!   instances may race for a partition but only one write can win.
//! - **Checkpoints**: the last processed position of each partition, written
//!   by application code and read when a partition pump starts.
//!
//! The store is the only thing processor instances share. There is no
//! instance-to-instance communication.
//!
//! ## Backends
//!
//! - **InMemoryCheckpointStore**: process-local, for tests and demos
//! - **SqliteCheckpointStore**: SQLite through SQLx
//!
//! ## Usage Example
//!
//! ```ignore
//! use eventhub_checkpoint::{CheckpointStore, InMemoryCheckpointStore, PartitionOwnership};
//!
//! let store = InMemoryCheckpointStore::new();
//!
//! // First-ever claim: no eTag
//! let claimed = store
//!     .claim_ownership(vec![
//!         PartitionOwnership::new("ns", "hub", "$Default", "0").with_owner_id("owner-a"),
//!     ])
//!     .await?;
//!
//! // Renewal must present the eTag the store handed back
//! let renewed = store.claim_ownership(claimed).await?;
//! ```

pub mod error;
pub mod memory;
pub mod store;
pub mod types;

pub use error::{CheckpointStoreError, Result};
pub use memory::InMemoryCheckpointStore;
pub use store::SqliteCheckpointStore;
pub use types::*;

use async_trait::async_trait;

/// Ownership and checkpoint store contract.
///
/// ## Ownership Semantics
///
/// `claim_ownership` attempts every requested record independently. A write
/// succeeds only if the store's current eTag for the key equals the request's
/// eTag, or if the store has no record and the request carries no eTag. On
/// success the store assigns a fresh eTag and `last_modified_time`. Only the
/// successful records are returned; callers must treat that subset as
/// authoritative.
///
/// ## Checkpoint Semantics
///
/// `update_checkpoint` is an unconditional upsert. The caller is assumed to be
/// the current owner of the partition.
///
/// ## Thread Safety
///
/// Implementations must be Send + Sync so they can be shared via
/// `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// List every ownership record for the consumer group, including stale
    /// and released ones. No records is an empty list, not an error.
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>>;

    /// Attempt to write each requested claim; returns only those that won.
    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>>;

    /// List every checkpoint for the consumer group.
    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>>;

    /// Create or overwrite a checkpoint; returns the new eTag.
    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<String>;
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh opaque eTag value.
pub(crate) fn new_e_tag() -> String {
    uuid::Uuid::new_v4().to_string()
}

//! In-Memory Checkpoint Store
//!
//! Process-local implementation of [`CheckpointStore`]. Several processor
//! instances in the same process can share one store through an `Arc`, which
//! is how the coordination tests simulate a fleet.
//!
//! Records are kept in maps keyed by the full identity tuple, so the eTag
//! check and the write happen under a single lock acquisition.

use crate::{error::Result, new_e_tag, now_ms, types::*, CheckpointStore};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

type RecordKey = (String, String, String, String);

/// In-memory store for ownership and checkpoints
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    ownership: RwLock<HashMap<RecordKey, PartitionOwnership>>,
    checkpoints: RwLock<HashMap<RecordKey, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record as-is, bypassing the eTag check.
    ///
    /// Used to seed a store with existing claims (for example, claims whose
    /// `last_modified_time` is already in the past).
    pub async fn insert_ownership(&self, ownership: PartitionOwnership) {
        let key = ownership_key(&ownership);
        self.ownership.write().await.insert(key, ownership);
    }
}

// Scope parts are compared without case, so they are keyed lowercased
fn record_key(
    fully_qualified_namespace: &str,
    event_hub_name: &str,
    consumer_group: &str,
    partition_id: &str,
) -> RecordKey {
    (
        fully_qualified_namespace.to_ascii_lowercase(),
        event_hub_name.to_ascii_lowercase(),
        consumer_group.to_ascii_lowercase(),
        partition_id.to_string(),
    )
}

fn ownership_key(o: &PartitionOwnership) -> RecordKey {
    record_key(
        &o.fully_qualified_namespace,
        &o.event_hub_name,
        &o.consumer_group,
        &o.partition_id,
    )
}

fn checkpoint_key(c: &Checkpoint) -> RecordKey {
    record_key(
        &c.fully_qualified_namespace,
        &c.event_hub_name,
        &c.consumer_group,
        &c.partition_id,
    )
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        let ownership = self.ownership.read().await;
        let mut records: Vec<PartitionOwnership> = ownership
            .values()
            .filter(|o| o.is_in_scope(fully_qualified_namespace, event_hub_name, consumer_group))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(records)
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        let mut ownership = self.ownership.write().await;
        let mut claimed = Vec::with_capacity(requested.len());

        for mut request in requested {
            let key = ownership_key(&request);
            let current_e_tag = ownership.get(&key).and_then(|o| o.e_tag.clone());

            if current_e_tag != request.e_tag {
                debug!(
                    partition_id = %request.partition_id,
                    owner_id = %request.owner_id,
                    "Ownership claim rejected: eTag mismatch"
                );
                continue;
            }

            request.e_tag = Some(new_e_tag());
            request.last_modified_time = Some(now_ms());
            ownership.insert(key, request.clone());
            claimed.push(request);
        }

        Ok(claimed)
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        let mut records: Vec<Checkpoint> = checkpoints
            .values()
            .filter(|c| c.is_in_scope(fully_qualified_namespace, event_hub_name, consumer_group))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(records)
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<String> {
        let key = checkpoint_key(&checkpoint);
        self.checkpoints.write().await.insert(key, checkpoint);
        Ok(new_e_tag())
    }
}

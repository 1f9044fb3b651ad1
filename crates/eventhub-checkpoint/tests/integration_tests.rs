//! Integration tests for checkpoint store implementations
//!
//! These tests verify that every backend (in-memory, SQLite) behaves
//! identically and correctly implements the CheckpointStore trait.

use eventhub_checkpoint::{
    Checkpoint, CheckpointStore, InMemoryCheckpointStore, PartitionOwnership,
    SqliteCheckpointStore,
};
use std::sync::Arc;

const NAMESPACE: &str = "contoso.servicebus.windows.net";
const HUB: &str = "telemetry";
const GROUP: &str = "$Default";

fn claim_request(partition_id: &str, owner_id: &str) -> PartitionOwnership {
    PartitionOwnership::new(NAMESPACE, HUB, GROUP, partition_id).with_owner_id(owner_id)
}

// ============================================================================
// In-memory Tests
// ============================================================================

#[tokio::test]
async fn test_memory_ownership_workflow() {
    let store = InMemoryCheckpointStore::new();
    test_ownership_workflow(&store).await;
}

#[tokio::test]
async fn test_memory_release_and_reclaim() {
    let store = InMemoryCheckpointStore::new();
    test_release_and_reclaim(&store).await;
}

#[tokio::test]
async fn test_memory_checkpoints() {
    let store = InMemoryCheckpointStore::new();
    test_checkpoint_operations(&store).await;
}

#[tokio::test]
async fn test_memory_scope_casing() {
    let store = InMemoryCheckpointStore::new();
    test_scope_casing(&store).await;
}

#[tokio::test]
async fn test_memory_concurrent_claims() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    test_concurrent_claims(store).await;
}

// ============================================================================
// SQLite Tests
// ============================================================================

#[tokio::test]
async fn test_sqlite_ownership_workflow() {
    let store = SqliteCheckpointStore::new_in_memory().await.unwrap();
    test_ownership_workflow(&store).await;
}

#[tokio::test]
async fn test_sqlite_release_and_reclaim() {
    let store = SqliteCheckpointStore::new_in_memory().await.unwrap();
    test_release_and_reclaim(&store).await;
}

#[tokio::test]
async fn test_sqlite_checkpoints() {
    let store = SqliteCheckpointStore::new_in_memory().await.unwrap();
    test_checkpoint_operations(&store).await;
}

#[tokio::test]
async fn test_sqlite_scope_casing() {
    let store = SqliteCheckpointStore::new_in_memory().await.unwrap();
    test_scope_casing(&store).await;
}

#[tokio::test]
async fn test_sqlite_concurrent_claims() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("concurrent_claims.db");

    let store: Arc<dyn CheckpointStore> =
        Arc::new(SqliteCheckpointStore::new(&db_path).await.unwrap());
    test_concurrent_claims(store).await;
}

#[tokio::test]
async fn test_sqlite_persists_across_reopen() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("reopen.db");

    {
        let store = SqliteCheckpointStore::new(&db_path).await.unwrap();
        store
            .claim_ownership(vec![claim_request("0", "owner-a")])
            .await
            .unwrap();
        store
            .update_checkpoint(Checkpoint::new(NAMESPACE, HUB, GROUP, "0").with_offset(512))
            .await
            .unwrap();
    }

    let store = SqliteCheckpointStore::new(&db_path).await.unwrap();
    let ownership = store.list_ownership(NAMESPACE, HUB, GROUP).await.unwrap();
    assert_eq!(ownership.len(), 1);
    assert_eq!(ownership[0].owner_id, "owner-a");

    let checkpoints = store.list_checkpoints(NAMESPACE, HUB, GROUP).await.unwrap();
    assert_eq!(checkpoints[0].offset, Some(512));
}

// ============================================================================
// Shared Test Implementations
// ============================================================================

async fn test_ownership_workflow<S: CheckpointStore>(store: &S) {
    assert!(store
        .list_ownership(NAMESPACE, HUB, GROUP)
        .await
        .unwrap()
        .is_empty());

    // Claim two partitions for owner-a
    let claimed = store
        .claim_ownership(vec![claim_request("0", "owner-a"), claim_request("1", "owner-a")])
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);
    for ownership in &claimed {
        assert!(ownership.e_tag.is_some());
        assert!(ownership.last_modified_time.is_some());
    }

    // owner-b steals partition 1 using the eTag it read
    let listed = store.list_ownership(NAMESPACE, HUB, GROUP).await.unwrap();
    let partition_1 = listed.iter().find(|o| o.partition_id == "1").unwrap();
    let steal = claim_request("1", "owner-b").with_e_tag(partition_1.e_tag.clone());
    let stolen = store.claim_ownership(vec![steal]).await.unwrap();
    assert_eq!(stolen.len(), 1);

    // owner-a's renewal of both only succeeds for partition 0
    let renewed = store.claim_ownership(claimed).await.unwrap();
    assert_eq!(renewed.len(), 1);
    assert_eq!(renewed[0].partition_id, "0");

    let listed = store.list_ownership(NAMESPACE, HUB, GROUP).await.unwrap();
    let owners: Vec<(&str, &str)> = listed
        .iter()
        .map(|o| (o.partition_id.as_str(), o.owner_id.as_str()))
        .collect();
    assert_eq!(owners, vec![("0", "owner-a"), ("1", "owner-b")]);

    // Other consumer groups are isolated
    assert!(store
        .list_ownership(NAMESPACE, HUB, "analytics")
        .await
        .unwrap()
        .is_empty());
}

async fn test_release_and_reclaim<S: CheckpointStore>(store: &S) {
    let claimed = store
        .claim_ownership(vec![claim_request("0", "owner-a")])
        .await
        .unwrap();

    // Release: same eTag, empty owner
    let release: Vec<PartitionOwnership> = claimed
        .into_iter()
        .map(|o| o.with_owner_id(""))
        .collect();
    let released = store.claim_ownership(release).await.unwrap();
    assert_eq!(released.len(), 1);

    let listed = store.list_ownership(NAMESPACE, HUB, GROUP).await.unwrap();
    assert_eq!(listed.len(), 1, "released records are kept");
    assert!(listed[0].is_released());

    let reclaim = claim_request("0", "owner-b").with_e_tag(listed[0].e_tag.clone());
    assert_eq!(store.claim_ownership(vec![reclaim]).await.unwrap().len(), 1);
}

async fn test_scope_casing<S: CheckpointStore>(store: &S) {
    store
        .claim_ownership(vec![claim_request("0", "owner-a")])
        .await
        .unwrap();

    // Same key spelled in another case is not a first claim
    let recased = PartitionOwnership::new(
        NAMESPACE.to_uppercase(),
        HUB.to_uppercase(),
        GROUP.to_lowercase(),
        "0",
    )
    .with_owner_id("owner-b");
    assert!(store.claim_ownership(vec![recased]).await.unwrap().is_empty());

    let listed = store.list_ownership(NAMESPACE, HUB, GROUP).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].owner_id, "owner-a");

    store
        .update_checkpoint(Checkpoint::new(NAMESPACE, HUB, GROUP, "0").with_offset(5))
        .await
        .unwrap();
    store
        .update_checkpoint(
            Checkpoint::new(NAMESPACE.to_uppercase(), HUB, GROUP, "0").with_offset(9),
        )
        .await
        .unwrap();

    let checkpoints = store.list_checkpoints(NAMESPACE, HUB, GROUP).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].offset, Some(9));
}

async fn test_checkpoint_operations<S: CheckpointStore>(store: &S) {
    assert!(store
        .list_checkpoints(NAMESPACE, HUB, GROUP)
        .await
        .unwrap()
        .is_empty());

    store
        .update_checkpoint(
            Checkpoint::new(NAMESPACE, HUB, GROUP, "0")
                .with_owner_id("owner-a")
                .with_offset(100)
                .with_sequence_number(5),
        )
        .await
        .unwrap();
    store
        .update_checkpoint(
            Checkpoint::new(NAMESPACE, HUB, GROUP, "1")
                .with_owner_id("owner-a")
                .with_sequence_number(9),
        )
        .await
        .unwrap();

    // Unconditional overwrite, no monotonicity enforced
    store
        .update_checkpoint(
            Checkpoint::new(NAMESPACE, HUB, GROUP, "0")
                .with_owner_id("owner-b")
                .with_offset(50)
                .with_sequence_number(2),
        )
        .await
        .unwrap();

    let checkpoints = store.list_checkpoints(NAMESPACE, HUB, GROUP).await.unwrap();
    assert_eq!(checkpoints.len(), 2);

    let partition_0 = checkpoints.iter().find(|c| c.partition_id == "0").unwrap();
    assert_eq!(partition_0.offset, Some(50));
    assert_eq!(partition_0.sequence_number, Some(2));
    assert_eq!(partition_0.owner_id.as_deref(), Some("owner-b"));

    let partition_1 = checkpoints.iter().find(|c| c.partition_id == "1").unwrap();
    assert_eq!(partition_1.offset, None);
    assert_eq!(partition_1.sequence_number, Some(9));
}

async fn test_concurrent_claims(store: Arc<dyn CheckpointStore>) {
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim_ownership(vec![claim_request("0", &format!("owner-{}", i))])
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        winners += handle.await.unwrap().len();
    }
    assert_eq!(winners, 1, "exactly one first-time claim may win");
}

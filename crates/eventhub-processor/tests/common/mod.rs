//! Shared fixtures for processor integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use eventhub_checkpoint::{
    now_ms, Checkpoint, CheckpointStore, CheckpointStoreError, PartitionOwnership,
};
use eventhub_processor::{
    CloseReason, ErrorContext, EventContext, EventHandler, HandlerError, InMemoryEventHub,
    PartitionBasedLoadBalancer, PartitionContext, PartitionPumpManager, ProcessorConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

pub const NAMESPACE: &str = "contoso.servicebus.windows.net";
pub const HUB: &str = "telemetry";
pub const GROUP: &str = "$Default";

/// Handler that records everything it sees, optionally checkpointing each
/// event.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<(String, String)>>,
    pub errors: Mutex<Vec<(Option<String>, String)>>,
    pub closes: Mutex<Vec<(String, CloseReason)>>,
    pub checkpoint_each_event: bool,
}

impl RecordingHandler {
    pub fn checkpointing() -> Self {
        Self {
            checkpoint_each_event: true,
            ..Default::default()
        }
    }

    /// Bodies received, in arrival order.
    pub fn bodies(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<(Option<String>, String)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<(String, CloseReason)> {
        self.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn process_event(&self, context: EventContext) -> Result<(), HandlerError> {
        let body = context.event().body_as_str().unwrap_or_default().to_string();
        self.events
            .lock()
            .unwrap()
            .push((context.partition_context().partition_id.clone(), body));

        if self.checkpoint_each_event {
            context
                .update_checkpoint()
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
        }
        Ok(())
    }

    async fn process_error(&self, context: ErrorContext) {
        self.errors
            .lock()
            .unwrap()
            .push((context.partition_id.clone(), context.error.to_string()));
    }

    async fn close(&self, context: &PartitionContext, reason: CloseReason) {
        self.closes
            .lock()
            .unwrap()
            .push((context.partition_id.clone(), reason));
    }
}

/// One simulated processor instance without the timer.
pub struct Instance {
    pub owner_id: String,
    pub handler: Arc<RecordingHandler>,
    pub pump_manager: Arc<PartitionPumpManager>,
    pub balancer: Arc<PartitionBasedLoadBalancer>,
}

pub fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        consumer_group: GROUP.to_string(),
        load_balancing_update_interval: Duration::from_millis(100),
        partition_ownership_expiration_interval: Duration::from_secs(60),
        store_operation_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn hub(partition_count: usize) -> Arc<InMemoryEventHub> {
    Arc::new(InMemoryEventHub::with_partition_count(NAMESPACE, HUB, partition_count))
}

pub fn instance(
    owner_id: &str,
    config: &ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    hub: Arc<InMemoryEventHub>,
    seed: u64,
) -> Instance {
    let handler = Arc::new(RecordingHandler::default());
    let pump_manager = Arc::new(PartitionPumpManager::new(
        owner_id,
        config.clone(),
        hub.clone(),
        store.clone(),
        handler.clone(),
    ));
    let balancer = PartitionBasedLoadBalancer::new(
        owner_id,
        config,
        store,
        hub,
        pump_manager.clone(),
        handler.clone(),
    )
    .with_rng_seed(seed);

    Instance {
        owner_id: owner_id.to_string(),
        handler,
        pump_manager,
        balancer: Arc::new(balancer),
    }
}

/// Active owner -> number of partitions, read from the store.
pub async fn active_counts(
    store: &dyn CheckpointStore,
    config: &ProcessorConfig,
) -> HashMap<String, usize> {
    let limit = config.partition_ownership_expiration_interval.as_millis() as i64;
    let now = now_ms();
    let mut counts = HashMap::new();
    for o in store.list_ownership(NAMESPACE, HUB, GROUP).await.unwrap() {
        let fresh = o.last_modified_time.map(|t| now - t < limit).unwrap_or(false);
        if fresh && !o.owner_id.is_empty() {
            *counts.entry(o.owner_id).or_insert(0) += 1;
        }
    }
    counts
}

pub async fn owned_by(store: &dyn CheckpointStore, owner_id: &str) -> Vec<String> {
    store
        .list_ownership(NAMESPACE, HUB, GROUP)
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.owner_id == owner_id)
        .map(|o| o.partition_id)
        .collect()
}

/// A record already in the store, written `age` ago.
pub fn seeded_record(partition_id: &str, owner_id: &str, age: Duration) -> PartitionOwnership {
    let mut record =
        PartitionOwnership::new(NAMESPACE, HUB, GROUP, partition_id).with_owner_id(owner_id);
    record.last_modified_time = Some(now_ms() - age.as_millis() as i64);
    record.e_tag = Some(format!("seeded-{}", partition_id));
    record
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Store wrapper whose behaviour tests can steer.
///
/// - `fail`: `list_ownership` fails while set
/// - `barrier`: `list_ownership` waits at the barrier first
/// - `gate`: `list_ownership` signals `entered` and waits for `release`
pub struct ControlledStore {
    pub inner: Arc<dyn CheckpointStore>,
    pub fail: AtomicBool,
    pub barrier: Option<Barrier>,
    pub gate: Option<(Notify, Notify)>,
}

impl ControlledStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
            barrier: None,
            gate: None,
        }
    }

    pub fn with_barrier(mut self, parties: usize) -> Self {
        self.barrier = Some(Barrier::new(parties));
        self
    }

    pub fn with_gate(mut self) -> Self {
        self.gate = Some((Notify::new(), Notify::new()));
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub async fn wait_entered(&self) {
        if let Some((entered, _)) = &self.gate {
            entered.notified().await;
        }
    }

    pub fn release(&self) {
        if let Some((_, release)) = &self.gate {
            release.notify_one();
        }
    }
}

#[async_trait]
impl CheckpointStore for ControlledStore {
    async fn list_ownership(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> eventhub_checkpoint::Result<Vec<PartitionOwnership>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CheckpointStoreError::Unavailable(
                "injected outage".to_string(),
            ));
        }
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        let records = self
            .inner
            .list_ownership(fully_qualified_namespace, event_hub_name, consumer_group)
            .await;
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        records
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> eventhub_checkpoint::Result<Vec<PartitionOwnership>> {
        self.inner.claim_ownership(requested).await
    }

    async fn list_checkpoints(
        &self,
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> eventhub_checkpoint::Result<Vec<Checkpoint>> {
        self.inner
            .list_checkpoints(fully_qualified_namespace, event_hub_name, consumer_group)
            .await
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> eventhub_checkpoint::Result<String> {
        self.inner.update_checkpoint(checkpoint).await
    }
}

/// Poll the store until every listed owner holds exactly its count.
pub async fn wait_for_counts(
    store: &dyn CheckpointStore,
    config: &ProcessorConfig,
    expected: &[(&str, usize)],
) {
    for _ in 0..300 {
        let counts = active_counts(store, config).await;
        if expected
            .iter()
            .all(|(owner, count)| counts.get(*owner).copied().unwrap_or(0) == *count)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "ownership never reached {:?}, last seen {:?}",
        expected,
        active_counts(store, config).await
    );
}

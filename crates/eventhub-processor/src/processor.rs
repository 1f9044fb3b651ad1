//! Event Processor Client
//!
//! Drives the load balancer on a timer and exposes the start/stop lifecycle.
//!
//! ## Lifecycle
//!
//! 1. **Build**: supply a checkpoint store, an event hub consumer and a handler
//! 2. **Start**: spawn the load-balancing timer (first tick after a short
//!    random jitter, then fixed delay)
//! 3. **Run**: claim partitions, pump events into the handler
//! 4. **Stop**: stop the timer, close every pump, release ownership so other
//!    instances can take over without waiting for expiry
//!
//! ## Example
//!
//! ```ignore
//! use eventhub_processor::EventProcessorClient;
//! use std::sync::Arc;
//!
//! let processor = EventProcessorClient::builder()
//!     .consumer_group("$Default")
//!     .checkpoint_store(Arc::new(store))
//!     .consumer(Arc::new(hub))
//!     .handler(Arc::new(MyHandler))
//!     .build()?;
//!
//! processor.start().await?;
//! // ... process events ...
//! processor.stop().await?;
//! ```

use crate::config::{LoadBalancingStrategy, ProcessorConfig};
use crate::consumer::EventHubConsumer;
use crate::error::{ProcessorError, Result};
use crate::handler::EventHandler;
use crate::load_balancer::PartitionBasedLoadBalancer;
use crate::pump_manager::PartitionPumpManager;
use eventhub_checkpoint::CheckpointStore;
use eventhub_core::EventPosition;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound of the random delay before the first load-balancing tick.
const MAX_INITIAL_JITTER: Duration = Duration::from_secs(1);

struct RunningState {
    cancel: CancellationToken,
    timer: JoinHandle<()>,
}

/// Consumes every partition of an event hub cooperatively with other
/// instances of the same consumer group.
///
/// # Thread Safety
///
/// Send + Sync; share via `Arc<EventProcessorClient>`.
pub struct EventProcessorClient {
    identifier: String,
    config: ProcessorConfig,
    load_balancer: Arc<PartitionBasedLoadBalancer>,
    pump_manager: Arc<PartitionPumpManager>,
    running: RwLock<Option<RunningState>>,
}

impl EventProcessorClient {
    pub fn builder() -> EventProcessorClientBuilder {
        EventProcessorClientBuilder::new()
    }

    /// Start load balancing and event processing.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted`: the processor is running
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(ProcessorError::AlreadyStarted);
        }

        info!(
            owner_id = %self.identifier,
            consumer_group = %self.config.consumer_group,
            strategy = %self.config.load_balancing_strategy,
            interval_ms = self.config.load_balancing_update_interval.as_millis() as u64,
            "Starting event processor"
        );

        let cancel = CancellationToken::new();
        let interval = self.config.load_balancing_update_interval;
        let jitter_bound = interval.min(MAX_INITIAL_JITTER);
        let jitter = if jitter_bound.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..jitter_bound)
        };

        let task = LoadBalancingTask {
            load_balancer: Arc::clone(&self.load_balancer),
            cancel: cancel.clone(),
            initial_delay: jitter,
            interval,
        };
        let timer = tokio::spawn(task.run());

        *running = Some(RunningState { cancel, timer });

        info!(owner_id = %self.identifier, "Event processor started");
        Ok(())
    }

    /// Stop processing and release ownership. A no-op if not running.
    pub async fn stop(&self) -> Result<()> {
        let Some(state) = self.running.write().await.take() else {
            debug!(owner_id = %self.identifier, "Event processor not running, skipping stop");
            return Ok(());
        };

        info!(owner_id = %self.identifier, "Stopping event processor");

        state.cancel.cancel();
        if let Err(e) = state.timer.await {
            warn!(owner_id = %self.identifier, error = %e, "Load balancing task failed");
        }

        self.pump_manager.stop_all_partition_pumps().await;

        let timeout = self.config.shutdown_release_timeout;
        match tokio::time::timeout(timeout, self.load_balancer.relinquish_ownership()).await {
            Ok(Ok(released)) => {
                info!(owner_id = %self.identifier, released, "Event processor stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(owner_id = %self.identifier, error = %e, "Failed to release ownership");
                Err(e)
            }
            Err(_) => {
                warn!(owner_id = %self.identifier, "Timed out releasing ownership");
                Err(ProcessorError::Timeout {
                    operation: "relinquish_ownership",
                    timeout,
                })
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.read().await.is_some()
    }

    /// Owner id this instance claims partitions with.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Partition ids with a live pump on this instance.
    pub async fn owned_partition_ids(&self) -> Vec<String> {
        self.pump_manager.partition_pump_ids().await
    }
}

/// Timer loop driving the load balancer.
struct LoadBalancingTask {
    load_balancer: Arc<PartitionBasedLoadBalancer>,
    cancel: CancellationToken,
    initial_delay: Duration,
    interval: Duration,
}

impl LoadBalancingTask {
    async fn run(self) {
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.initial_delay) => {}
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.load_balancer.load_balance() => {}
            }

            // Fixed delay between the end of one cycle and the next
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!(
            owner_id = %self.load_balancer.owner_id(),
            "Load balancing task stopped"
        );
    }
}

/// Builder for [`EventProcessorClient`]
pub struct EventProcessorClientBuilder {
    identifier: Option<String>,
    config: ProcessorConfig,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    consumer: Option<Arc<dyn EventHubConsumer>>,
    handler: Option<Arc<dyn EventHandler>>,
    rng_seed: Option<u64>,
}

impl EventProcessorClientBuilder {
    pub fn new() -> Self {
        Self {
            identifier: None,
            config: ProcessorConfig::default(),
            checkpoint_store: None,
            consumer: None,
            handler: None,
            rng_seed: None,
        }
    }

    /// Set the owner id (default: random UUID)
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.config.consumer_group = consumer_group.into();
        self
    }

    pub fn load_balancing_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.config.load_balancing_strategy = strategy;
        self
    }

    pub fn load_balancing_update_interval(mut self, interval: Duration) -> Self {
        self.config.load_balancing_update_interval = interval;
        self
    }

    pub fn partition_ownership_expiration_interval(mut self, interval: Duration) -> Self {
        self.config.partition_ownership_expiration_interval = interval;
        self
    }

    /// Start position for partitions without a checkpoint
    pub fn default_initial_position(mut self, position: EventPosition) -> Self {
        self.config.default_initial_position = position;
        self
    }

    /// Start position for one partition without a checkpoint
    pub fn initial_partition_event_position(
        mut self,
        partition_id: impl Into<String>,
        position: EventPosition,
    ) -> Self {
        self.config
            .initial_partition_event_position
            .insert(partition_id.into(), position);
        self
    }

    pub fn store_operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_operation_timeout = timeout;
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: usize) -> Self {
        self.config.prefetch_count = prefetch_count;
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn consumer(mut self, consumer: Arc<dyn EventHubConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Seed the load balancer's random choices (for reproducible tests)
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the processor.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig`: invalid configuration, or a missing store,
    ///   consumer or handler
    pub fn build(self) -> Result<EventProcessorClient> {
        self.config.validate()?;

        let store = self
            .checkpoint_store
            .ok_or_else(|| ProcessorError::InvalidConfig("checkpoint store is required".to_string()))?;
        let consumer = self
            .consumer
            .ok_or_else(|| ProcessorError::InvalidConfig("event hub consumer is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| ProcessorError::InvalidConfig("event handler is required".to_string()))?;

        let identifier = match self.identifier {
            Some(id) if id.trim().is_empty() => {
                return Err(ProcessorError::InvalidConfig(
                    "identifier must not be empty".to_string(),
                ))
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let pump_manager = Arc::new(PartitionPumpManager::new(
            identifier.clone(),
            self.config.clone(),
            Arc::clone(&consumer),
            Arc::clone(&store),
            Arc::clone(&handler),
        ));

        let mut load_balancer = PartitionBasedLoadBalancer::new(
            identifier.clone(),
            &self.config,
            store,
            consumer,
            Arc::clone(&pump_manager),
            handler,
        );
        if let Some(seed) = self.rng_seed {
            load_balancer = load_balancer.with_rng_seed(seed);
        }

        Ok(EventProcessorClient {
            identifier,
            config: self.config,
            load_balancer: Arc::new(load_balancer),
            pump_manager,
            running: RwLock::new(None),
        })
    }
}

impl Default for EventProcessorClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventContext;
    use crate::handler::HandlerError;
    use crate::in_memory::InMemoryEventHub;
    use async_trait::async_trait;
    use eventhub_checkpoint::InMemoryCheckpointStore;

    struct NoopHandler;

    #[async_trait]
    impl EventHandler for NoopHandler {
        async fn process_event(&self, _context: EventContext) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    fn builder() -> EventProcessorClientBuilder {
        EventProcessorClient::builder()
            .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
            .consumer(Arc::new(InMemoryEventHub::with_partition_count("ns", "hub", 2)))
            .handler(Arc::new(NoopHandler))
    }

    #[test]
    fn test_build_generates_identifier() {
        let a = builder().build().unwrap();
        let b = builder().build().unwrap();
        assert!(!a.identifier().is_empty());
        assert_ne!(a.identifier(), b.identifier());
    }

    #[test]
    fn test_build_uses_supplied_identifier() {
        let processor = builder().identifier("instance-1").build().unwrap();
        assert_eq!(processor.identifier(), "instance-1");
    }

    #[test]
    fn test_build_requires_components() {
        let result = EventProcessorClient::builder()
            .handler(Arc::new(NoopHandler))
            .build();
        assert!(matches!(result, Err(ProcessorError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_rejects_short_expiration() {
        let result = builder()
            .load_balancing_update_interval(Duration::from_secs(10))
            .partition_ownership_expiration_interval(Duration::from_secs(5))
            .build();
        assert!(matches!(result, Err(ProcessorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let processor = builder().build().unwrap();
        processor.start().await.unwrap();

        assert!(matches!(
            processor.start().await,
            Err(ProcessorError::AlreadyStarted)
        ));

        processor.stop().await.unwrap();
        assert!(!processor.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let processor = builder().build().unwrap();
        processor.stop().await.unwrap();
        processor.stop().await.unwrap();
    }
}

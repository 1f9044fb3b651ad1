//! Event Processor Demo Binary
//!
//! Runs one processor instance against an in-process event hub, with a
//! publisher task appending events through the producer's partition
//! resolver. Point several instances at the same SQLite file to watch them
//! split the partitions.
//!
//! # Environment Variables
//!
//! - `EVENTHUB_NAMESPACE`: Fully qualified namespace (default: local.eventhub)
//! - `EVENTHUB_NAME`: Event hub name (default: telemetry)
//! - `EVENTHUB_PARTITIONS`: Partition count (default: 4)
//! - `CONSUMER_GROUP`: Consumer group (default: $Default)
//! - `CHECKPOINT_STORE`: SQLite path, or `memory` (default: ./data/checkpoints.db)
//! - `LOAD_BALANCING_STRATEGY`: balanced or greedy (default: balanced)
//! - `UPDATE_INTERVAL_SECS`: Seconds between load-balancing cycles (default: 10)
//! - `OWNERSHIP_EXPIRATION_SECS`: Seconds before a claim is abandoned (default: 60)
//! - `OWNER_ID`: Instance identifier (default: random UUID)
//!
//! # Example
//!
//! ```bash
//! export CHECKPOINT_STORE=./data/checkpoints.db
//! export LOAD_BALANCING_STRATEGY=greedy
//! cargo run --bin eventhub-processor
//! ```

use async_trait::async_trait;
use eventhub_checkpoint::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
use eventhub_core::EventData;
use eventhub_processor::{
    CloseReason, ErrorContext, EventContext, EventHandler, EventProcessorClient, HandlerError,
    InMemoryEventHub, LoadBalancingStrategy, PartitionContext,
};
use eventhub_producer::PartitionResolver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Checkpoint after this many events per instance.
const CHECKPOINT_EVERY: u64 = 10;

/// Logs events and checkpoints periodically.
struct LoggingHandler {
    processed: AtomicU64,
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn initialize(&self, context: &PartitionContext) {
        info!(partition_id = %context.partition_id, "Partition processing started");
    }

    async fn process_event(&self, context: EventContext) -> Result<(), HandlerError> {
        let event = context.event();
        info!(
            partition_id = %context.partition_context().partition_id,
            sequence_number = ?event.sequence_number,
            partition_key = ?event.partition_key,
            body = event.body_as_str().unwrap_or("<binary>"),
            "Event received"
        );

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % CHECKPOINT_EVERY == 0 {
            context
                .update_checkpoint()
                .await
                .map_err(|e| HandlerError::new(format!("checkpoint failed: {}", e)))?;
        }
        Ok(())
    }

    async fn process_error(&self, context: ErrorContext) {
        error!(
            partition_id = ?context.partition_id,
            error = %context.error,
            "Processor error"
        );
    }

    async fn close(&self, context: &PartitionContext, reason: CloseReason) {
        info!(
            partition_id = %context.partition_id,
            reason = %reason,
            "Partition processing closed"
        );
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_secs(name: &str, default: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default))
}

async fn publish(
    hub: Arc<InMemoryEventHub>,
    partition_ids: Vec<String>,
    cancel: CancellationToken,
) {
    let resolver = PartitionResolver::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        // Every other event is keyed so related readings land together
        let key = (sequence % 2 == 0).then(|| format!("device-{}", sequence % 5));
        let partition_id = match resolver.assign(key.as_deref(), &partition_ids) {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(error = %e, "Cannot assign partition");
                return;
            }
        };

        let mut event = EventData::new(format!("reading-{}", sequence));
        if let Some(key) = key {
            event = event.with_partition_key(key);
        }
        if let Err(e) = hub.append(&partition_id, event).await {
            warn!(partition_id = %partition_id, error = %e, "Failed to publish event");
        }
        sequence += 1;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let namespace = env_or("EVENTHUB_NAMESPACE", "local.eventhub");
    let event_hub_name = env_or("EVENTHUB_NAME", "telemetry");
    let partition_count = std::env::var("EVENTHUB_PARTITIONS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4);
    let consumer_group = env_or("CONSUMER_GROUP", eventhub_processor::DEFAULT_CONSUMER_GROUP);
    let store_location = env_or("CHECKPOINT_STORE", "./data/checkpoints.db");
    let strategy: LoadBalancingStrategy = env_or("LOAD_BALANCING_STRATEGY", "balanced").parse()?;
    let update_interval = env_secs("UPDATE_INTERVAL_SECS", 10);
    let expiration = env_secs("OWNERSHIP_EXPIRATION_SECS", 60);

    info!("Configuration:");
    info!("  Event hub: {}/{}", namespace, event_hub_name);
    info!("  Partitions: {}", partition_count);
    info!("  Consumer group: {}", consumer_group);
    info!("  Checkpoint store: {}", store_location);
    info!("  Strategy: {}", strategy);
    info!("  Update interval: {:?}", update_interval);
    info!("  Ownership expiration: {:?}", expiration);

    let store: Arc<dyn CheckpointStore> = if store_location == "memory" {
        Arc::new(InMemoryCheckpointStore::new())
    } else {
        if let Some(parent) = std::path::Path::new(&store_location).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Arc::new(SqliteCheckpointStore::new(&store_location).await?)
    };

    let hub = Arc::new(InMemoryEventHub::with_partition_count(
        namespace,
        event_hub_name,
        partition_count,
    ));
    let partition_ids: Vec<String> = (0..partition_count).map(|i| i.to_string()).collect();

    let mut builder = EventProcessorClient::builder()
        .consumer_group(consumer_group)
        .load_balancing_strategy(strategy)
        .load_balancing_update_interval(update_interval)
        .partition_ownership_expiration_interval(expiration)
        .checkpoint_store(store)
        .consumer(hub.clone())
        .handler(Arc::new(LoggingHandler {
            processed: AtomicU64::new(0),
        }));
    if let Ok(owner_id) = std::env::var("OWNER_ID") {
        builder = builder.identifier(owner_id);
    }
    let processor = builder.build()?;

    processor.start().await?;
    info!(owner_id = %processor.identifier(), "Event processor running, press Ctrl+C to stop");

    let cancel = CancellationToken::new();
    let publisher = tokio::spawn(publish(hub, partition_ids, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cancel.cancel();
    let _ = publisher.await;
    processor.stop().await?;

    info!("Event processor stopped");
    Ok(())
}

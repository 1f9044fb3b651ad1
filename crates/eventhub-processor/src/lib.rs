//! Event Hub Processor - Cooperative Partition Consumption
//!
//! Consumes every partition of an event hub with a fleet of processes that
//! never talk to each other. Each instance periodically reads the shared
//! checkpoint store, decides whether to claim, steal or just renew
//! partitions, and pumps events from the partitions it owns into
//! application code.
//!
//! ## Components
//!
//! - **EventProcessorClient**: start/stop lifecycle and the load-balancing timer
//! - **PartitionBasedLoadBalancer**: the claim/steal/renew algorithm
//! - **PartitionPumpManager**: one consumption task per owned partition
//! - **EventHubConsumer**: the receive layer boundary, with `InMemoryEventHub`
//! - **EventHandler**: application callbacks
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use eventhub_checkpoint::InMemoryCheckpointStore;
//! use eventhub_processor::{
//!     EventContext, EventHandler, EventProcessorClient, HandlerError, InMemoryEventHub,
//! };
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn process_event(&self, context: EventContext) -> Result<(), HandlerError> {
//!         println!("{:?}", context.event().body_as_str());
//!         context
//!             .update_checkpoint()
//!             .await
//!             .map_err(|e| HandlerError::new(e.to_string()))?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let processor = EventProcessorClient::builder()
//!     .checkpoint_store(Arc::new(InMemoryCheckpointStore::new()))
//!     .consumer(Arc::new(InMemoryEventHub::with_partition_count("ns", "hub", 4)))
//!     .handler(Arc::new(Printer))
//!     .build()?;
//!
//! processor.start().await?;
//! // ... process events ...
//! processor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod handler;
pub mod in_memory;
pub mod load_balancer;
pub mod processor;
pub mod pump_manager;

pub use config::{LoadBalancingStrategy, ProcessorConfig, DEFAULT_CONSUMER_GROUP};
pub use consumer::{EventHubConsumer, EventStream, ReceiveError, ReceiveOptions};
pub use context::{CloseReason, ErrorContext, EventContext, PartitionContext};
pub use error::{ProcessorError, Result};
pub use handler::{EventHandler, HandlerError};
pub use in_memory::InMemoryEventHub;
pub use load_balancer::{BalanceDecision, CycleOutcome, PartitionBasedLoadBalancer};
pub use processor::{EventProcessorClient, EventProcessorClientBuilder};
pub use pump_manager::{PartitionPumpManager, PumpState};

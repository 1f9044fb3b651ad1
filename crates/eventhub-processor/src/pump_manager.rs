//! Partition Pump Manager
//!
//! Owns the live consumption task ("pump") of every partition this instance
//! has claimed. At most one pump per partition id exists at a time.
//!
//! ## Pump Lifecycle
//!
//! ```text
//! NotStarted ──▶ Running ──▶ Closed(EVENT_PROCESSOR_SHUTDOWN)   stop requested
//!                       └──▶ Closed(LOST_PARTITION_OWNERSHIP)   stream ended, receive
//!                                                              or handler failure
//! ```
//!
//! A closed pump is never restarted. A later claim for the same partition
//! creates a new pump.
//!
//! ## Task Layout
//!
//! Each pump runs a reader task that moves events from the receive stream
//! into a bounded channel (capacity `prefetch_count`), and a dispatch loop
//! that hands them to [`EventHandler::process_event`] one at a time. Both
//! observe the pump's cancellation token.
//!
//! A pump that ends on its own reports the failure (if any), closes with
//! `LOST_PARTITION_OWNERSHIP` and removes itself from the map, so the
//! partition can be claimed again. A panic in a handler callback counts as
//! a handler failure.
//!
//! Stopping a pump finishes in a spawned task, so `close` still runs if the
//! caller of a stop is dropped midway.

use crate::config::ProcessorConfig;
use crate::consumer::{EventHubConsumer, EventStream, ReceiveError, ReceiveOptions};
use crate::context::{CloseReason, ErrorContext, EventContext, PartitionContext};
use crate::error::{ProcessorError, Result};
use crate::handler::{EventHandler, HandlerError};
use eventhub_checkpoint::{Checkpoint, CheckpointStore, PartitionOwnership};
use eventhub_core::{EventData, EventPosition};
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable state of one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    NotStarted,
    Running,
    Closed(CloseReason),
}

/// How a pump's dispatch loop ended.
#[derive(Debug)]
enum PumpExit {
    Cancelled,
    StreamEnded,
    ReceiveFailed(ReceiveError),
    HandlerFailed(HandlerError),
}

impl PumpExit {
    fn into_error(self) -> Option<ProcessorError> {
        match self {
            PumpExit::Cancelled | PumpExit::StreamEnded => None,
            PumpExit::ReceiveFailed(e) => Some(ProcessorError::Receive(e)),
            PumpExit::HandlerFailed(e) => Some(ProcessorError::Handler(e)),
        }
    }
}

struct PartitionPump {
    pump_id: u64,
    context: PartitionContext,
    cancel: CancellationToken,
    state: Arc<RwLock<PumpState>>,
    task: JoinHandle<PumpExit>,
}

type PumpMap = Arc<RwLock<HashMap<String, PartitionPump>>>;

/// Manages the partition pumps of one processor instance.
pub struct PartitionPumpManager {
    owner_id: String,
    config: ProcessorConfig,
    consumer: Arc<dyn EventHubConsumer>,
    store: Arc<dyn CheckpointStore>,
    handler: Arc<dyn EventHandler>,
    pumps: PumpMap,
    next_pump_id: AtomicU64,
}

impl PartitionPumpManager {
    pub fn new(
        owner_id: impl Into<String>,
        config: ProcessorConfig,
        consumer: Arc<dyn EventHubConsumer>,
        store: Arc<dyn CheckpointStore>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            config,
            consumer,
            store,
            handler,
            pumps: Arc::new(RwLock::new(HashMap::new())),
            next_pump_id: AtomicU64::new(1),
        }
    }

    fn partition_context(&self, partition_id: &str) -> PartitionContext {
        PartitionContext {
            fully_qualified_namespace: self.consumer.fully_qualified_namespace().to_string(),
            event_hub_name: self.consumer.event_hub_name().to_string(),
            consumer_group: self.config.consumer_group.clone(),
            partition_id: partition_id.to_string(),
        }
    }

    /// Position a new pump starts from.
    ///
    /// Checkpoint offset first, then checkpoint sequence number (both
    /// exclusive), then the configured initial position.
    pub fn starting_position(
        &self,
        partition_id: &str,
        checkpoint: Option<&Checkpoint>,
    ) -> EventPosition {
        if let Some(offset) = checkpoint.and_then(|c| c.offset) {
            return EventPosition::from_offset(offset);
        }
        if let Some(sequence_number) = checkpoint.and_then(|c| c.sequence_number) {
            return EventPosition::from_sequence_number(sequence_number);
        }
        self.config.initial_position(partition_id)
    }

    /// Start a pump for a claimed partition.
    ///
    /// Returns `Ok(false)` without doing anything if a live pump already
    /// exists for the partition. Fails if the receive stream cannot be
    /// opened; nothing is registered in that case.
    pub async fn start_partition_pump(
        &self,
        ownership: &PartitionOwnership,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<bool> {
        let partition_id = ownership.partition_id.clone();

        // Held across the receive call so two starts for one partition serialize
        let mut pumps = self.pumps.write().await;

        if let Some(existing) = pumps.get(&partition_id) {
            let closed = matches!(*existing.state.read().await, PumpState::Closed(_));
            if !closed && !existing.task.is_finished() {
                debug!(
                    owner_id = %self.owner_id,
                    partition_id = %partition_id,
                    "Pump already running"
                );
                return Ok(false);
            }
        }

        let position = self.starting_position(&partition_id, checkpoint);
        let options = ReceiveOptions {
            owner_level: self.config.owner_level,
            prefetch_count: self.config.prefetch_count,
        };
        let stream = self
            .consumer
            .receive(&partition_id, position, options)
            .await?;

        let pump_id = self.next_pump_id.fetch_add(1, Ordering::SeqCst);
        let context = self.partition_context(&partition_id);
        let cancel = CancellationToken::new();
        let state = Arc::new(RwLock::new(PumpState::NotStarted));

        let pump_task = PumpTask {
            pump_id,
            context: context.clone(),
            owner_id: self.owner_id.clone(),
            handler: Arc::clone(&self.handler),
            store: Arc::clone(&self.store),
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            prefetch_count: self.config.prefetch_count,
            pumps: Arc::clone(&self.pumps),
        };
        let task = tokio::spawn(pump_task.run(stream));

        pumps.insert(
            partition_id.clone(),
            PartitionPump {
                pump_id,
                context,
                cancel,
                state,
                task,
            },
        );

        info!(
            owner_id = %self.owner_id,
            partition_id = %partition_id,
            position = %position,
            "Partition pump started"
        );

        Ok(true)
    }

    /// Stop one pump. Returns false if there was no pump for the partition.
    pub async fn stop_partition_pump(&self, partition_id: &str, reason: CloseReason) -> bool {
        let Some(pump) = self.pumps.write().await.remove(partition_id) else {
            return false;
        };

        // Already out of the map; the spawned task is the only closer left
        let closing = self.spawn_shut_down(pump, reason);
        if let Err(e) = closing.await {
            error!(
                owner_id = %self.owner_id,
                partition_id = %partition_id,
                error = %e,
                "Partition pump shutdown failed"
            );
        }
        true
    }

    /// Stop every pump with `EVENT_PROCESSOR_SHUTDOWN`.
    pub async fn stop_all_partition_pumps(&self) {
        let pumps: Vec<PartitionPump> = self.pumps.write().await.drain().map(|(_, p)| p).collect();
        if pumps.is_empty() {
            return;
        }

        info!(
            owner_id = %self.owner_id,
            count = pumps.len(),
            "Stopping all partition pumps"
        );

        for pump in &pumps {
            pump.cancel.cancel();
        }
        let closing: Vec<JoinHandle<()>> = pumps
            .into_iter()
            .map(|pump| self.spawn_shut_down(pump, CloseReason::EventProcessorShutdown))
            .collect();
        for result in futures::future::join_all(closing).await {
            if let Err(e) = result {
                error!(owner_id = %self.owner_id, error = %e, "Partition pump shutdown failed");
            }
        }
    }

    fn spawn_shut_down(&self, pump: PartitionPump, reason: CloseReason) -> JoinHandle<()> {
        tokio::spawn(shut_down(
            pump,
            reason,
            Arc::clone(&self.handler),
            self.owner_id.clone(),
        ))
    }

    /// Partition ids with a registered pump, sorted.
    pub async fn partition_pump_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pumps.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn pump_state(&self, partition_id: &str) -> Option<PumpState> {
        let pumps = self.pumps.read().await;
        match pumps.get(partition_id) {
            Some(pump) => Some(*pump.state.read().await),
            None => None,
        }
    }
}

async fn shut_down(
    pump: PartitionPump,
    reason: CloseReason,
    handler: Arc<dyn EventHandler>,
    owner_id: String,
) {
    pump.cancel.cancel();

    match pump.task.await {
        Ok(PumpExit::Cancelled) => {
            *pump.state.write().await = PumpState::Closed(reason);
            handler.close(&pump.context, reason).await;
            info!(
                owner_id = %owner_id,
                partition_id = %pump.context.partition_id,
                reason = %reason,
                "Partition pump closed"
            );
        }
        // Closed itself before the stop landed
        Ok(_) => {}
        Err(e) => {
            error!(
                owner_id = %owner_id,
                partition_id = %pump.context.partition_id,
                error = %e,
                "Partition pump task failed"
            );
        }
    }
}

/// Everything a running pump needs, moved into its task.
struct PumpTask {
    pump_id: u64,
    context: PartitionContext,
    owner_id: String,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
    state: Arc<RwLock<PumpState>>,
    prefetch_count: usize,
    pumps: PumpMap,
}

impl PumpTask {
    async fn run(self, stream: EventStream) -> PumpExit {
        let exit = self.dispatch(stream).await;

        if let PumpExit::Cancelled = exit {
            // The stopper owns closing
            return exit;
        }

        let partition_id = self.context.partition_id.clone();
        *self.state.write().await = PumpState::Closed(CloseReason::LostPartitionOwnership);

        warn!(
            owner_id = %self.owner_id,
            partition_id = %partition_id,
            exit = ?exit,
            "Partition pump ended, closing with lost ownership"
        );

        if let Some(error) = exit.into_error() {
            self.handler
                .process_error(ErrorContext::for_partition(&self.context, error))
                .await;
        }
        self.handler
            .close(&self.context, CloseReason::LostPartitionOwnership)
            .await;

        let mut pumps = self.pumps.write().await;
        if pumps.get(&partition_id).map(|p| p.pump_id) == Some(self.pump_id) {
            pumps.remove(&partition_id);
        }

        PumpExit::StreamEnded
    }

    async fn dispatch(&self, stream: EventStream) -> PumpExit {
        let initialized = AssertUnwindSafe(self.handler.initialize(&self.context))
            .catch_unwind()
            .await;
        if let Err(panic) = initialized {
            return PumpExit::HandlerFailed(panicked("initialize", panic));
        }
        *self.state.write().await = PumpState::Running;

        let (tx, mut rx) = mpsc::channel(self.prefetch_count);
        let reader_cancel = self.cancel.child_token();
        let reader = tokio::spawn(forward_events(stream, tx, reader_cancel.clone()));

        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break PumpExit::Cancelled,
                item = rx.recv() => match item {
                    None => break PumpExit::StreamEnded,
                    Some(Err(e)) => break PumpExit::ReceiveFailed(e),
                    Some(Ok(event)) => {
                        let context = EventContext::new(
                            self.context.clone(),
                            event,
                            self.owner_id.clone(),
                            Arc::clone(&self.store),
                        );
                        match AssertUnwindSafe(self.handler.process_event(context))
                            .catch_unwind()
                            .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => break PumpExit::HandlerFailed(e),
                            Err(panic) => {
                                break PumpExit::HandlerFailed(panicked("process_event", panic))
                            }
                        }
                    }
                }
            }
        };

        reader_cancel.cancel();
        let _ = reader.await;
        exit
    }
}

fn panicked(callback: &str, payload: Box<dyn Any + Send>) -> HandlerError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    HandlerError::new(format!("{} panicked: {}", callback, message))
}

async fn forward_events(
    mut stream: EventStream,
    tx: mpsc::Sender<std::result::Result<EventData, ReceiveError>>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };

        // Dropping the sender ends the dispatch loop
        let Some(item) = item else { return };
        let failed = item.is_err();

        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tx.send(item) => {
                if sent.is_err() {
                    return;
                }
            }
        }

        if failed {
            return;
        }
    }
}

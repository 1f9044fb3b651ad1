//! In-Memory Event Hub
//!
//! A process-local [`EventHubConsumer`] with appendable partition logs. It
//! backs the coordination tests and the demo binary.
//!
//! - Appended events get an offset (running byte position), a sequence
//!   number (index in the partition) and an enqueued time.
//! - Receivers tail their partition: they yield every stored event from the
//!   start position, then wait for new appends.
//! - Exclusive receivers follow owner-level rules: a new receiver with an
//!   owner level at least as high as the current one ends the current
//!   receiver's stream; a lower one is rejected.

use crate::consumer::{EventHubConsumer, EventStream, ReceiveError, ReceiveOptions};
use async_trait::async_trait;
use eventhub_core::{EventData, EventPosition};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Result<T> = std::result::Result<T, ReceiveError>;

/// In-memory event hub with a fixed set of partitions
pub struct InMemoryEventHub {
    fully_qualified_namespace: String,
    event_hub_name: String,
    partition_ids: Vec<String>,
    partitions: HashMap<String, Arc<PartitionLog>>,
    next_receiver_id: AtomicU64,
}

struct PartitionLog {
    state: Mutex<LogState>,
    appended: watch::Sender<usize>,
}

#[derive(Default)]
struct LogState {
    events: Vec<EventData>,
    next_offset: i64,
    exclusive: Option<ExclusiveReceiver>,
}

struct ExclusiveReceiver {
    id: u64,
    owner_level: i64,
    closed: CancellationToken,
    close_error: Arc<std::sync::Mutex<Option<ReceiveError>>>,
}

impl InMemoryEventHub {
    pub fn new<I, S>(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        partition_ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let partition_ids: Vec<String> = partition_ids.into_iter().map(Into::into).collect();
        let partitions = partition_ids
            .iter()
            .map(|id| {
                let (appended, _) = watch::channel(0);
                let log = PartitionLog {
                    state: Mutex::new(LogState::default()),
                    appended,
                };
                (id.clone(), Arc::new(log))
            })
            .collect();

        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            event_hub_name: event_hub_name.into(),
            partition_ids,
            partitions,
            next_receiver_id: AtomicU64::new(1),
        }
    }

    /// Hub with partitions named `"0"..count`.
    pub fn with_partition_count(
        fully_qualified_namespace: impl Into<String>,
        event_hub_name: impl Into<String>,
        count: usize,
    ) -> Self {
        Self::new(
            fully_qualified_namespace,
            event_hub_name,
            (0..count).map(|i| i.to_string()),
        )
    }

    fn log(&self, partition_id: &str) -> Result<&Arc<PartitionLog>> {
        self.partitions
            .get(partition_id)
            .ok_or_else(|| ReceiveError::PartitionNotFound(partition_id.to_string()))
    }

    /// Append an event; returns it with the service-assigned fields set.
    pub async fn append(&self, partition_id: &str, mut event: EventData) -> Result<EventData> {
        let log = self.log(partition_id)?;

        let count = {
            let mut state = log.state.lock().await;
            event.offset = Some(state.next_offset);
            event.sequence_number = Some(state.events.len() as i64);
            event.enqueued_time = Some(eventhub_checkpoint::now_ms());
            state.next_offset += event.body.len().max(1) as i64;
            state.events.push(event.clone());
            state.events.len()
        };

        log.appended.send_replace(count);
        Ok(event)
    }

    pub async fn event_count(&self, partition_id: &str) -> Result<usize> {
        Ok(self.log(partition_id)?.state.lock().await.events.len())
    }

    /// Close the current exclusive receiver of a partition.
    ///
    /// With an error, the receiver's stream yields it before ending;
    /// without one, the stream just ends.
    pub async fn disconnect(&self, partition_id: &str, error: Option<ReceiveError>) -> Result<bool> {
        let log = self.log(partition_id)?;
        let mut state = log.state.lock().await;
        match state.exclusive.take() {
            Some(receiver) => {
                if let Ok(mut slot) = receiver.close_error.lock() {
                    *slot = error;
                }
                receiver.closed.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn start_index(events: &[EventData], position: EventPosition) -> usize {
    let first_matching = |predicate: &dyn Fn(&EventData) -> bool| {
        events
            .iter()
            .position(|e| predicate(e))
            .unwrap_or(events.len())
    };

    match position {
        EventPosition::Earliest => 0,
        EventPosition::Latest => events.len(),
        EventPosition::Offset { offset, inclusive } => first_matching(&|e| {
            let o = e.offset.unwrap_or_default();
            if inclusive {
                o >= offset
            } else {
                o > offset
            }
        }),
        // Sequence numbers are partition indexes
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive,
        } => {
            let start = if inclusive {
                sequence_number
            } else {
                sequence_number.saturating_add(1)
            };
            start.max(0) as usize
        }
        EventPosition::EnqueuedTime(t) => {
            first_matching(&|e| e.enqueued_time.unwrap_or_default() > t)
        }
    }
}

struct ReceiverState {
    log: Arc<PartitionLog>,
    next_index: usize,
    closed: CancellationToken,
    close_error: Arc<std::sync::Mutex<Option<ReceiveError>>>,
    notified: watch::Receiver<usize>,
}

impl ReceiverState {
    async fn next_item(&mut self) -> Option<Result<EventData>> {
        loop {
            if self.closed.is_cancelled() {
                return self.take_close_error().map(Err);
            }

            let _seen = *self.notified.borrow_and_update();
            let next = {
                let state = self.log.state.lock().await;
                state.events.get(self.next_index).cloned()
            };
            if let Some(event) = next {
                self.next_index += 1;
                return Some(Ok(event));
            }

            tokio::select! {
                _ = self.closed.cancelled() => {}
                changed = self.notified.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn take_close_error(&self) -> Option<ReceiveError> {
        self.close_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl EventHubConsumer for InMemoryEventHub {
    fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    fn event_hub_name(&self) -> &str {
        &self.event_hub_name
    }

    async fn partition_ids(&self) -> Result<Vec<String>> {
        Ok(self.partition_ids.clone())
    }

    async fn receive(
        &self,
        partition_id: &str,
        position: EventPosition,
        options: ReceiveOptions,
    ) -> Result<EventStream> {
        let log = Arc::clone(self.log(partition_id)?);
        let closed = CancellationToken::new();
        let close_error = Arc::new(std::sync::Mutex::new(None));

        let next_index = {
            let mut state = log.state.lock().await;

            if let Some(owner_level) = options.owner_level {
                if let Some(current) = &state.exclusive {
                    if current.owner_level > owner_level {
                        return Err(ReceiveError::OwnerLevelConflict {
                            partition_id: partition_id.to_string(),
                            requested: owner_level,
                            current: current.owner_level,
                        });
                    }
                }

                let id = self.next_receiver_id.fetch_add(1, Ordering::SeqCst);
                if let Some(previous) = state.exclusive.replace(ExclusiveReceiver {
                    id,
                    owner_level,
                    closed: closed.clone(),
                    close_error: Arc::clone(&close_error),
                }) {
                    debug!(
                        partition_id = %partition_id,
                        previous_receiver = previous.id,
                        receiver = id,
                        owner_level,
                        "Exclusive receiver replaced"
                    );
                    previous.closed.cancel();
                }
            }

            start_index(&state.events, position)
        };

        let receiver = ReceiverState {
            notified: log.appended.subscribe(),
            log,
            next_index,
            closed,
            close_error,
        };

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.next_item().await.map(|item| (item, receiver))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn hub() -> InMemoryEventHub {
        InMemoryEventHub::with_partition_count("ns", "hub", 2)
    }

    async fn next(stream: &mut EventStream) -> Option<Result<EventData>> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream stalled")
    }

    #[tokio::test]
    async fn test_append_assigns_positions() {
        let hub = hub();
        let first = hub.append("0", EventData::new("abc")).await.unwrap();
        let second = hub.append("0", EventData::new("de")).await.unwrap();

        assert_eq!(first.sequence_number, Some(0));
        assert_eq!(first.offset, Some(0));
        assert_eq!(second.sequence_number, Some(1));
        assert_eq!(second.offset, Some(3));
        assert!(second.enqueued_time.is_some());
    }

    #[tokio::test]
    async fn test_receive_after_max_sequence_number_waits() {
        let hub = hub();
        hub.append("0", EventData::new("a")).await.unwrap();

        let mut stream = hub
            .receive(
                "0",
                EventPosition::from_sequence_number(i64::MAX),
                ReceiveOptions::default(),
            )
            .await
            .unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let hub = hub();
        let result = hub.append("9", EventData::new("x")).await;
        assert_eq!(result.unwrap_err(), ReceiveError::PartitionNotFound("9".to_string()));
    }

    #[tokio::test]
    async fn test_receive_from_positions() {
        let hub = hub();
        for body in ["a", "b", "c", "d"] {
            hub.append("0", EventData::new(body)).await.unwrap();
        }

        let mut earliest = hub
            .receive("0", EventPosition::Earliest, ReceiveOptions { owner_level: None, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(next(&mut earliest).await.unwrap().unwrap().body_as_str(), Some("a"));

        let mut after_seq = hub
            .receive("0", EventPosition::from_sequence_number(1), ReceiveOptions { owner_level: None, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(next(&mut after_seq).await.unwrap().unwrap().body_as_str(), Some("c"));

        let mut after_offset = hub
            .receive("0", EventPosition::from_offset(2), ReceiveOptions { owner_level: None, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(next(&mut after_offset).await.unwrap().unwrap().body_as_str(), Some("d"));
    }

    #[tokio::test]
    async fn test_latest_tails_new_events() {
        let hub = hub();
        hub.append("1", EventData::new("old")).await.unwrap();

        let mut stream = hub
            .receive("1", EventPosition::Latest, ReceiveOptions::default())
            .await
            .unwrap();

        hub.append("1", EventData::new("new")).await.unwrap();
        assert_eq!(next(&mut stream).await.unwrap().unwrap().body_as_str(), Some("new"));
    }

    #[tokio::test]
    async fn test_equal_owner_level_preempts() {
        let hub = hub();
        let mut first = hub
            .receive("0", EventPosition::Earliest, ReceiveOptions::default())
            .await
            .unwrap();
        let _second = hub
            .receive("0", EventPosition::Earliest, ReceiveOptions::default())
            .await
            .unwrap();

        assert!(next(&mut first).await.is_none(), "preempted stream ends normally");
    }

    #[tokio::test]
    async fn test_lower_owner_level_rejected() {
        let hub = hub();
        let _high = hub
            .receive(
                "0",
                EventPosition::Earliest,
                ReceiveOptions { owner_level: Some(5), ..Default::default() },
            )
            .await
            .unwrap();

        let result = hub
            .receive("0", EventPosition::Earliest, ReceiveOptions::default())
            .await;
        assert!(matches!(result, Err(ReceiveError::OwnerLevelConflict { current: 5, .. })));
    }

    #[tokio::test]
    async fn test_disconnect_with_error() {
        let hub = hub();
        let mut stream = hub
            .receive("0", EventPosition::Earliest, ReceiveOptions::default())
            .await
            .unwrap();

        assert!(hub
            .disconnect("0", Some(ReceiveError::Link("detached".to_string())))
            .await
            .unwrap());

        assert_eq!(
            next(&mut stream).await.unwrap().unwrap_err(),
            ReceiveError::Link("detached".to_string())
        );
        assert!(next(&mut stream).await.is_none());
    }
}

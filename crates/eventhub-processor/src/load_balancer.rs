//! Partition-Based Load Balancer
//!
//! Converges this instance's share of partitions toward an even split using
//! nothing but periodic reads and optimistic writes to the checkpoint store.
//! There is no coordinator: every instance runs the same randomized
//! algorithm and the store's eTag check decides races.
//!
//! ## One Cycle
//!
//! 1. List ownership records and the event hub's partition ids (cached).
//! 2. Validate every record; a corrupt record fails the cycle.
//! 3. Keep the *active* records: modified within the inactivity limit and
//!    owned by someone. Everything else is claimable.
//! 4. Stop local pumps for partitions another owner actively holds.
//! 5. Decide:
//!    - no active records at all: claim a random partition (bootstrap)
//!    - fleet balanced: renew only
//!    - this instance is under-loaded: claim an unclaimed partition, or
//!      steal one from the most loaded owner
//!    - otherwise: renew only
//! 6. One `claim_ownership` call with the new claim plus renewals of every
//!    partition this instance actively owns.
//! 7. Start (or verify) a pump for every granted record, resuming from its
//!    checkpoint.
//!
//! ## Balance Rule
//!
//! With `n` partitions and `k` active owners (this instance included), the
//! fleet is balanced iff every owner holds `n / k` or `n / k + 1` partitions
//! and exactly `n % k` owners hold `n / k + 1`.
//!
//! ## Failures
//!
//! Store failures, timeouts, corrupt records and an empty partition list
//! abort the cycle. [`PartitionBasedLoadBalancer::load_balance`] reports
//! them to the handler without partition context; the next tick retries.

use crate::config::{LoadBalancingStrategy, ProcessorConfig};
use crate::consumer::EventHubConsumer;
use crate::context::{CloseReason, ErrorContext, PartitionContext};
use crate::error::{ProcessorError, Result};
use crate::handler::EventHandler;
use crate::pump_manager::PartitionPumpManager;
use eventhub_checkpoint::{now_ms, Checkpoint, CheckpointStore, PartitionOwnership};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What one cycle decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceDecision {
    /// No active owners anywhere; claim a random partition.
    Bootstrap(String),
    /// Only renew this instance's current claims.
    Renew,
    /// Claim one more partition, stolen from `stolen_from` if set.
    Claim {
        partition_id: String,
        stolen_from: Option<String>,
    },
}

impl BalanceDecision {
    pub fn partition_to_claim(&self) -> Option<&str> {
        match self {
            BalanceDecision::Bootstrap(partition_id) => Some(partition_id),
            BalanceDecision::Claim { partition_id, .. } => Some(partition_id),
            BalanceDecision::Renew => None,
        }
    }
}

/// Result of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub decision: BalanceDecision,
    /// Partition ids the store granted this cycle (new claim and renewals)
    pub claimed: Vec<String>,
}

impl CycleOutcome {
    /// Whether the new claim (if any) was granted.
    pub fn claim_granted(&self) -> bool {
        self.decision
            .partition_to_claim()
            .map(|id| self.claimed.iter().any(|c| c == id))
            .unwrap_or(false)
    }
}

struct PartitionIdCache {
    ids: Vec<String>,
    fetched_at: Instant,
}

/// Load balancer for one processor instance.
pub struct PartitionBasedLoadBalancer {
    owner_id: String,
    fully_qualified_namespace: String,
    event_hub_name: String,
    consumer_group: String,
    strategy: LoadBalancingStrategy,
    inactive_time_limit: Duration,
    store_operation_timeout: Duration,
    partition_ids_refresh_interval: Duration,
    store: Arc<dyn CheckpointStore>,
    consumer: Arc<dyn EventHubConsumer>,
    pump_manager: Arc<PartitionPumpManager>,
    handler: Arc<dyn EventHandler>,
    rng: std::sync::Mutex<StdRng>,
    in_flight: Mutex<()>,
    more_partitions_to_claim: Mutex<bool>,
    partition_ids: Mutex<Option<PartitionIdCache>>,
}

impl PartitionBasedLoadBalancer {
    pub fn new(
        owner_id: impl Into<String>,
        config: &ProcessorConfig,
        store: Arc<dyn CheckpointStore>,
        consumer: Arc<dyn EventHubConsumer>,
        pump_manager: Arc<PartitionPumpManager>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            fully_qualified_namespace: consumer.fully_qualified_namespace().to_string(),
            event_hub_name: consumer.event_hub_name().to_string(),
            consumer_group: config.consumer_group.clone(),
            strategy: config.load_balancing_strategy,
            inactive_time_limit: config.partition_ownership_expiration_interval,
            store_operation_timeout: config.store_operation_timeout,
            partition_ids_refresh_interval: config.partition_ids_refresh_interval,
            store,
            consumer,
            pump_manager,
            handler,
            rng: std::sync::Mutex::new(StdRng::from_entropy()),
            in_flight: Mutex::new(()),
            more_partitions_to_claim: Mutex::new(false),
            partition_ids: Mutex::new(None),
        }
    }

    /// Use a fixed seed for bootstrap and steal choices.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = std::sync::Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn pump_manager(&self) -> &Arc<PartitionPumpManager> {
        &self.pump_manager
    }

    /// Timer entry point.
    ///
    /// Skips immediately (returns false) if a cycle is already in flight.
    /// Under the greedy strategy it keeps cycling while the previous cycle
    /// won a new claim. Failures are reported to the handler.
    pub async fn load_balance(&self) -> bool {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!(owner_id = %self.owner_id, "Load balancing already in progress, skipping");
            return false;
        };

        let mut iterations = 0usize;
        loop {
            iterations += 1;
            if let Err(e) = self.cycle().await {
                self.report_cycle_error(e).await;
                break;
            }

            if self.strategy != LoadBalancingStrategy::Greedy {
                break;
            }
            if !*self.more_partitions_to_claim.lock().await {
                break;
            }
            // Each continuing iteration won a partition
            if iterations > self.cached_partition_count().await {
                break;
            }
        }

        true
    }

    /// Run exactly one cycle, returning its outcome.
    ///
    /// Returns `Ok(None)` if a cycle is already in flight. Failures are
    /// returned, not reported.
    pub async fn run_cycle(&self) -> Result<Option<CycleOutcome>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(None);
        };
        self.cycle().await.map(Some)
    }

    /// Clear this instance's owner id on every record it holds, so others
    /// can claim them without waiting for the inactivity limit.
    ///
    /// Returns the number of records released.
    pub async fn relinquish_ownership(&self) -> Result<usize> {
        let records = self.list_ownership().await?;
        let released: Vec<PartitionOwnership> = records
            .into_iter()
            .filter(|o| o.owner_id == self.owner_id)
            .map(|mut o| {
                o.owner_id = String::new();
                o
            })
            .collect();

        if released.is_empty() {
            return Ok(0);
        }

        let requested = released.len();
        let granted = self
            .with_timeout("claim_ownership", self.store.claim_ownership(released))
            .await?;

        info!(
            owner_id = %self.owner_id,
            requested,
            released = granted.len(),
            "Relinquished partition ownership"
        );

        Ok(granted.len())
    }

    async fn cycle(&self) -> Result<CycleOutcome> {
        let records = self.list_ownership().await?;
        let partition_ids = self.partition_ids().await?;

        for record in &records {
            self.validate(record)?;
        }

        let now = now_ms();
        let inactive_ms = self.inactive_time_limit.as_millis() as i64;
        let all: HashMap<String, PartitionOwnership> = records
            .into_iter()
            .map(|o| (o.partition_id.clone(), o))
            .collect();
        let active: HashMap<&str, &PartitionOwnership> = all
            .values()
            .filter(|o| {
                !o.owner_id.is_empty()
                    && o.last_modified_time
                        .map(|t| now - t < inactive_ms)
                        .unwrap_or(false)
            })
            .map(|o| (o.partition_id.as_str(), o))
            .collect();

        self.stop_pumps_owned_elsewhere(&active).await;

        let mut owners: HashMap<String, Vec<String>> = HashMap::new();
        for o in active.values() {
            owners
                .entry(o.owner_id.clone())
                .or_default()
                .push(o.partition_id.clone());
        }
        owners.entry(self.owner_id.clone()).or_default();

        let decision = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            if active.is_empty() {
                match partition_ids.choose(&mut *rng) {
                    Some(id) => BalanceDecision::Bootstrap(id.clone()),
                    None => return Err(self.no_partitions()),
                }
            } else {
                let claimed: HashSet<&str> = active.keys().copied().collect();
                plan(&self.owner_id, &partition_ids, &claimed, &owners, &mut *rng)
            }
        };

        self.log_decision(&decision, &owners, partition_ids.len());

        let mut requests = Vec::new();
        if let Some(partition_id) = decision.partition_to_claim() {
            let e_tag = all.get(partition_id).and_then(|o| o.e_tag.clone());
            requests.push(
                PartitionOwnership::new(
                    self.fully_qualified_namespace.clone(),
                    self.event_hub_name.clone(),
                    self.consumer_group.clone(),
                    partition_id,
                )
                .with_owner_id(self.owner_id.clone())
                .with_e_tag(e_tag),
            );
        }
        for o in active.values() {
            if o.owner_id == self.owner_id
                && decision.partition_to_claim() != Some(o.partition_id.as_str())
            {
                requests.push((*o).clone());
            }
        }

        let granted = if requests.is_empty() {
            Vec::new()
        } else {
            self.with_timeout("claim_ownership", self.store.claim_ownership(requests))
                .await?
        };

        let outcome = CycleOutcome {
            claimed: granted.iter().map(|o| o.partition_id.clone()).collect(),
            decision,
        };
        *self.more_partitions_to_claim.lock().await = outcome.claim_granted();

        if let Some(partition_id) = outcome.decision.partition_to_claim() {
            if outcome.claim_granted() {
                info!(owner_id = %self.owner_id, partition_id = %partition_id, "Claimed partition");
            } else {
                debug!(owner_id = %self.owner_id, partition_id = %partition_id, "Lost claim race");
            }
        }

        if !granted.is_empty() {
            self.start_pumps(&granted).await?;
        }

        Ok(outcome)
    }

    async fn start_pumps(&self, granted: &[PartitionOwnership]) -> Result<()> {
        let checkpoints: HashMap<String, Checkpoint> = self
            .with_timeout(
                "list_checkpoints",
                self.store.list_checkpoints(
                    &self.fully_qualified_namespace,
                    &self.event_hub_name,
                    &self.consumer_group,
                ),
            )
            .await?
            .into_iter()
            .filter(|c| {
                c.is_in_scope(
                    &self.fully_qualified_namespace,
                    &self.event_hub_name,
                    &self.consumer_group,
                )
            })
            .map(|c| (c.partition_id.clone(), c))
            .collect();

        for ownership in granted {
            let checkpoint = checkpoints.get(&ownership.partition_id);
            if let Err(e) = self
                .pump_manager
                .start_partition_pump(ownership, checkpoint)
                .await
            {
                error!(
                    owner_id = %self.owner_id,
                    partition_id = %ownership.partition_id,
                    error = %e,
                    "Failed to start partition pump"
                );
                let context = PartitionContext {
                    fully_qualified_namespace: self.fully_qualified_namespace.clone(),
                    event_hub_name: self.event_hub_name.clone(),
                    consumer_group: self.consumer_group.clone(),
                    partition_id: ownership.partition_id.clone(),
                };
                self.handler
                    .process_error(ErrorContext::for_partition(&context, e))
                    .await;
            }
        }

        Ok(())
    }

    async fn stop_pumps_owned_elsewhere(&self, active: &HashMap<&str, &PartitionOwnership>) {
        for partition_id in self.pump_manager.partition_pump_ids().await {
            let Some(owner) = active.get(partition_id.as_str()) else {
                continue;
            };
            if owner.owner_id != self.owner_id {
                warn!(
                    owner_id = %self.owner_id,
                    partition_id = %partition_id,
                    new_owner = %owner.owner_id,
                    "Partition owned by another processor, stopping pump"
                );
                self.pump_manager
                    .stop_partition_pump(&partition_id, CloseReason::LostPartitionOwnership)
                    .await;
            }
        }
    }

    fn validate(&self, ownership: &PartitionOwnership) -> Result<()> {
        if !ownership.is_in_scope(
            &self.fully_qualified_namespace,
            &self.event_hub_name,
            &self.consumer_group,
        ) {
            return Err(ProcessorError::CorruptOwnership(format!(
                "record for partition '{}' is scoped to {}/{}/{}",
                ownership.partition_id,
                ownership.fully_qualified_namespace,
                ownership.event_hub_name,
                ownership.consumer_group
            )));
        }
        if ownership.partition_id.is_empty() {
            return Err(ProcessorError::CorruptOwnership(
                "record has no partition id".to_string(),
            ));
        }
        if ownership.last_modified_time.is_none() {
            return Err(ProcessorError::CorruptOwnership(format!(
                "record for partition '{}' has no last modified time",
                ownership.partition_id
            )));
        }
        if ownership.e_tag.is_none() {
            return Err(ProcessorError::CorruptOwnership(format!(
                "record for partition '{}' has no eTag",
                ownership.partition_id
            )));
        }
        Ok(())
    }

    fn log_decision(
        &self,
        decision: &BalanceDecision,
        owners: &HashMap<String, Vec<String>>,
        partition_count: usize,
    ) {
        let owned = owners.get(&self.owner_id).map(Vec::len).unwrap_or(0);
        match decision {
            BalanceDecision::Bootstrap(partition_id) => info!(
                owner_id = %self.owner_id,
                partition_id = %partition_id,
                partition_count,
                "No active owners, bootstrapping with a random partition"
            ),
            BalanceDecision::Renew => debug!(
                owner_id = %self.owner_id,
                owned,
                owners = owners.len(),
                partition_count,
                "Renewing current ownership"
            ),
            BalanceDecision::Claim {
                partition_id,
                stolen_from: Some(victim),
            } => info!(
                owner_id = %self.owner_id,
                partition_id = %partition_id,
                stolen_from = %victim,
                owned,
                "Stealing partition"
            ),
            BalanceDecision::Claim {
                partition_id,
                stolen_from: None,
            } => info!(
                owner_id = %self.owner_id,
                partition_id = %partition_id,
                owned,
                "Claiming unowned partition"
            ),
        }
    }

    async fn report_cycle_error(&self, e: ProcessorError) {
        error!(
            owner_id = %self.owner_id,
            event_hub = %self.event_hub_name,
            consumer_group = %self.consumer_group,
            error = %e,
            "Load balancing cycle failed"
        );
        self.handler
            .process_error(ErrorContext::for_cycle(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
                e,
            ))
            .await;
    }

    async fn list_ownership(&self) -> Result<Vec<PartitionOwnership>> {
        self.with_timeout(
            "list_ownership",
            self.store.list_ownership(
                &self.fully_qualified_namespace,
                &self.event_hub_name,
                &self.consumer_group,
            ),
        )
        .await
    }

    async fn partition_ids(&self) -> Result<Vec<String>> {
        let mut cache = self.partition_ids.lock().await;
        if let Some(cached) = cache.as_ref() {
            if !cached.ids.is_empty()
                && cached.fetched_at.elapsed() < self.partition_ids_refresh_interval
            {
                return Ok(cached.ids.clone());
            }
        }

        let ids = self
            .with_timeout("partition_ids", self.consumer.partition_ids())
            .await?;
        if ids.is_empty() {
            return Err(self.no_partitions());
        }

        debug!(
            owner_id = %self.owner_id,
            partition_count = ids.len(),
            "Refreshed partition ids"
        );
        *cache = Some(PartitionIdCache {
            ids: ids.clone(),
            fetched_at: Instant::now(),
        });
        Ok(ids)
    }

    async fn cached_partition_count(&self) -> usize {
        self.partition_ids
            .lock()
            .await
            .as_ref()
            .map(|c| c.ids.len())
            .unwrap_or(0)
    }

    fn no_partitions(&self) -> ProcessorError {
        ProcessorError::NoPartitions(self.event_hub_name.clone())
    }

    async fn with_timeout<T, E>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<T, E>>,
    ) -> Result<T>
    where
        ProcessorError: From<E>,
    {
        match tokio::time::timeout(self.store_operation_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProcessorError::Timeout {
                operation,
                timeout: self.store_operation_timeout,
            }),
        }
    }
}

/// Decide the non-bootstrap action for `owner_id`.
///
/// `claimed` holds the partition ids with an active owner; `owners` maps
/// every active owner (including `owner_id`) to its partitions.
pub fn plan(
    owner_id: &str,
    partition_ids: &[String],
    claimed: &HashSet<&str>,
    owners: &HashMap<String, Vec<String>>,
    rng: &mut StdRng,
) -> BalanceDecision {
    let partition_count = partition_ids.len();

    if is_load_balanced(partition_count, owners) {
        return BalanceDecision::Renew;
    }
    if !should_own_more_partitions(owner_id, partition_count, owners) {
        return BalanceDecision::Renew;
    }

    let unclaimed: Vec<&String> = partition_ids
        .iter()
        .filter(|id| !claimed.contains(id.as_str()))
        .collect();
    if let Some(partition_id) = unclaimed.choose(rng) {
        return BalanceDecision::Claim {
            partition_id: (*partition_id).clone(),
            stolen_from: None,
        };
    }

    match find_partition_to_steal(owner_id, owners, rng) {
        Some((victim, partition_id)) => BalanceDecision::Claim {
            partition_id,
            stolen_from: Some(victim),
        },
        None => BalanceDecision::Renew,
    }
}

/// Every owner holds `n / k` or `n / k + 1` partitions and exactly `n % k`
/// of them hold the larger count.
pub fn is_load_balanced(partition_count: usize, owners: &HashMap<String, Vec<String>>) -> bool {
    let owner_count = owners.len();
    if owner_count == 0 {
        return false;
    }

    let min_per_owner = partition_count / owner_count;
    let extra = partition_count % owner_count;

    let mut with_extra = 0;
    for partitions in owners.values() {
        let count = partitions.len();
        if count < min_per_owner || count > min_per_owner + 1 {
            return false;
        }
        if count == min_per_owner + 1 {
            with_extra += 1;
        }
    }

    with_extra == extra
}

/// Whether `owner_id` is below its fair share or tied for the fewest
/// partitions.
pub fn should_own_more_partitions(
    owner_id: &str,
    partition_count: usize,
    owners: &HashMap<String, Vec<String>>,
) -> bool {
    if owners.is_empty() {
        return true;
    }

    let min_per_owner = partition_count / owners.len();
    let own = owners.get(owner_id).map(Vec::len).unwrap_or(0);
    let fewest = owners.values().map(Vec::len).min().unwrap_or(0);

    own < min_per_owner || own == fewest
}

/// Pick a random partition of the most loaded other owner.
///
/// Ties between equally loaded owners go to the smallest owner id.
pub fn find_partition_to_steal(
    owner_id: &str,
    owners: &HashMap<String, Vec<String>>,
    rng: &mut StdRng,
) -> Option<(String, String)> {
    let (victim, partitions) = owners
        .iter()
        .filter(|(id, partitions)| id.as_str() != owner_id && !partitions.is_empty())
        .max_by(|(a_id, a), (b_id, b)| a.len().cmp(&b.len()).then_with(|| b_id.cmp(a_id)))?;

    partitions
        .choose(rng)
        .map(|partition_id| (victim.clone(), partition_id.clone()))
}

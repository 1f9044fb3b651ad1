//! Processor Configuration
//!
//! All knobs an embedding application can turn. `ProcessorConfig::default()`
//! is usable as-is; `EventProcessorClientBuilder` exposes each field as a
//! fluent setter.

use crate::error::{ProcessorError, Result};
use eventhub_core::EventPosition;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// How aggressively an instance claims partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    /// Claim at most one partition per load-balancing tick.
    #[default]
    Balanced,
    /// Keep claiming within one tick while there is more to claim.
    Greedy,
}

impl FromStr for LoadBalancingStrategy {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(LoadBalancingStrategy::Balanced),
            "greedy" => Ok(LoadBalancingStrategy::Greedy),
            other => Err(ProcessorError::InvalidConfig(format!(
                "unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingStrategy::Balanced => write!(f, "BALANCED"),
            LoadBalancingStrategy::Greedy => write!(f, "GREEDY"),
        }
    }
}

/// Event processor configuration.
///
/// # Fields
///
/// * `consumer_group` - Consumer group to read as (default: `$Default`)
/// * `load_balancing_strategy` - Balanced or greedy claiming (default: balanced)
/// * `load_balancing_update_interval` - Delay between load-balancing cycles (default: 10s)
/// * `partition_ownership_expiration_interval` - Claims older than this are abandoned (default: 60s)
/// * `default_initial_position` - Start position when no checkpoint exists (default: latest)
/// * `initial_partition_event_position` - Per-partition start position overrides
/// * `store_operation_timeout` - Bound on each store / partition-list call (default: 60s)
/// * `shutdown_release_timeout` - Bound on the ownership release at shutdown (default: 10s)
/// * `partition_ids_refresh_interval` - Age after which partition ids are re-fetched (default: 5min)
/// * `prefetch_count` - Per-partition buffered event capacity (default: 300)
/// * `owner_level` - Exclusive receiver level requested per partition (default: 0)
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub consumer_group: String,
    pub load_balancing_strategy: LoadBalancingStrategy,
    pub load_balancing_update_interval: Duration,
    pub partition_ownership_expiration_interval: Duration,
    pub default_initial_position: EventPosition,
    pub initial_partition_event_position: HashMap<String, EventPosition>,
    pub store_operation_timeout: Duration,
    pub shutdown_release_timeout: Duration,
    pub partition_ids_refresh_interval: Duration,
    pub prefetch_count: usize,
    pub owner_level: Option<i64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            load_balancing_strategy: LoadBalancingStrategy::Balanced,
            load_balancing_update_interval: Duration::from_secs(10),
            partition_ownership_expiration_interval: Duration::from_secs(60),
            default_initial_position: EventPosition::Latest,
            initial_partition_event_position: HashMap::new(),
            store_operation_timeout: Duration::from_secs(60),
            shutdown_release_timeout: Duration::from_secs(10),
            partition_ids_refresh_interval: Duration::from_secs(300),
            prefetch_count: 300,
            owner_level: Some(0),
        }
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.consumer_group.trim().is_empty() {
            return Err(ProcessorError::InvalidConfig(
                "consumer group must not be empty".to_string(),
            ));
        }
        if self.load_balancing_update_interval.is_zero() {
            return Err(ProcessorError::InvalidConfig(
                "load balancing update interval must be positive".to_string(),
            ));
        }
        if self.partition_ownership_expiration_interval <= self.load_balancing_update_interval {
            return Err(ProcessorError::InvalidConfig(format!(
                "partition ownership expiration interval ({:?}) must be greater than the load balancing update interval ({:?})",
                self.partition_ownership_expiration_interval, self.load_balancing_update_interval
            )));
        }
        if self.prefetch_count == 0 {
            return Err(ProcessorError::InvalidConfig(
                "prefetch count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Start position for a partition that has no checkpoint.
    pub fn initial_position(&self, partition_id: &str) -> EventPosition {
        self.initial_partition_event_position
            .get(partition_id)
            .copied()
            .unwrap_or(self.default_initial_position)
    }
}

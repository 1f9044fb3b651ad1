//! Event Hub Producer Partitioning
//!
//! Producers that send events without an explicit partition id rely on the
//! service gateway to pick one. When a partition key is supplied, the
//! gateway hashes it with Bob Jenkins' lookup3; this crate reproduces that
//! hash bit for bit so a client can predict (and batch by) the partition a
//! key lands on. Without a key, assignment is round robin.
//!
//! ```ignore
//! use eventhub_producer::PartitionResolver;
//!
//! let partitions = vec!["0".to_string(), "1".to_string(), "2".to_string()];
//! let resolver = PartitionResolver::new();
//!
//! let by_key = resolver.assign(Some("user-42"), &partitions)?;
//! let next = resolver.assign(None, &partitions)?;
//! ```

pub mod error;
pub mod partition_resolver;

pub use error::{PartitionResolverError, Result};
pub use partition_resolver::{generate_hash_code, lookup3_hash, PartitionResolver};

//! Partition Resolver
//!
//! Maps an outgoing event to a partition.
//!
//! ## Key Hashing
//!
//! The key's UTF-8 bytes are hashed with lookup3 (`hashlittle2`, both seeds
//! zero): 4-byte little-endian words are mixed in 12-byte blocks, the tail is
//! folded in byte by byte, and a final avalanche produces two 32-bit words.
//! Their XOR, truncated to a signed 16-bit value, is the hash code. The
//! partition index is `abs(hash % partition_count)`.
//!
//! This must match the service gateway exactly. Any change here silently
//! breaks key affinity between producers that let the service pick the
//! partition and producers that resolve it locally.
//!
//! ## Round Robin
//!
//! A shared counter advances on every call. When it would overflow it
//! restarts at index 0 instead of jumping to a negative value.

use crate::error::{PartitionResolverError, Result};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::trace;

/// Counter value before the first round-robin call
const STARTING_INDEX: i32 = -1;

/// Assigns partitions for outgoing events
#[derive(Debug)]
pub struct PartitionResolver {
    pointer: AtomicI32,
}

impl Default for PartitionResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionResolver {
    pub fn new() -> Self {
        Self {
            pointer: AtomicI32::new(STARTING_INDEX),
        }
    }

    /// Key-based assignment when a key is given, round robin otherwise.
    pub fn assign<'a>(&self, partition_key: Option<&str>, partitions: &'a [String]) -> Result<&'a str> {
        match partition_key {
            Some(key) => assign_for_partition_key(key, partitions),
            None => self.assign_round_robin(partitions),
        }
    }

    /// Next partition in cyclic order, starting from index 0.
    pub fn assign_round_robin<'a>(&self, partitions: &'a [String]) -> Result<&'a str> {
        if partitions.is_empty() {
            return Err(PartitionResolverError::NoPartitions);
        }

        let previous = self
            .pointer
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(next_index(current))
            })
            .unwrap_or(STARTING_INDEX);
        let current = next_index(previous);

        let index = current as usize % partitions.len();
        trace!(index, "Round-robin partition assignment");
        Ok(partitions[index].as_str())
    }

    /// Partition for a key, identical to the service gateway's choice.
    pub fn assign_for_partition_key<'a>(
        &self,
        partition_key: &str,
        partitions: &'a [String],
    ) -> Result<&'a str> {
        assign_for_partition_key(partition_key, partitions)
    }
}

fn next_index(current: i32) -> i32 {
    current.checked_add(1).unwrap_or(0)
}

fn assign_for_partition_key<'a>(partition_key: &str, partitions: &'a [String]) -> Result<&'a str> {
    if partitions.is_empty() {
        return Err(PartitionResolverError::NoPartitions);
    }

    let hash = generate_hash_code(partition_key) as i32;
    let index = (hash % partitions.len() as i32).unsigned_abs() as usize;
    trace!(partition_key, hash, index, "Key-based partition assignment");
    Ok(partitions[index].as_str())
}

/// 16-bit hash code of a partition key.
pub fn generate_hash_code(partition_key: &str) -> i16 {
    let (c, b) = lookup3_hash(partition_key.as_bytes(), 0, 0);
    (c ^ b) as i16
}

/// lookup3 `hashlittle2`: returns the primary (`c`) and secondary (`b`)
/// 32-bit hashes of `data`.
pub fn lookup3_hash(data: &[u8], seed1: u32, seed2: u32) -> (u32, u32) {
    let initial = 0xdead_beef_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(seed1);
    let mut a = initial;
    let mut b = initial;
    let mut c = initial.wrapping_add(seed2);

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(read_u32_le(&rest[0..4]));
        b = b.wrapping_add(read_u32_le(&rest[4..8]));
        c = c.wrapping_add(read_u32_le(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    if rest.is_empty() {
        return (c, b);
    }

    // Zero-padded tail: same as the byte-wise fall-through cases
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(read_u32_le(&tail[0..4]));
    b = b.wrapping_add(read_u32_le(&tail[4..8]));
    c = c.wrapping_add(read_u32_le(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);

    (c, b)
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);

    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);

    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);

    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);

    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);

    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));

    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));

    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));

    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));

    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));

    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));

    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

//! Key hashing and partition assignment.
//!
//! The mapping from application key to partition number must be stable for the lifetime of a
//! record: the same key always lands in the same partition, across processes and restarts. The
//! hash function is therefore frozen here and must never change.

/// Number of partitions the coordinator distributes across the fleet. Frozen design constant.
pub const PARTITION_COUNT: u16 = 256;

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a 32-bit hash over the UTF-8 bytes of `key`.
///
/// Frozen: do not swap algorithms. Doing so silently reassigns every existing record's partition
/// and breaks the stable-partitioning invariant for records already written.
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Compute the partition number for `key`: `hash(key) mod 256`.
pub fn partition_for_key(key: &str) -> u16 {
    (fnv1a_32(key) % PARTITION_COUNT as u32) as u16
}

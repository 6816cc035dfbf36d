use crate::types::CohortKey;

/// 64-bit hash with good avalanche behaviour (xxHash64-style finaliser).
pub fn hash64(bytes: &[u8]) -> u64 {
    const PRIME1: u64 = 0x9E3779B185EBCA87;
    const PRIME2: u64 = 0xC2B2AE3D27D4EB4F;
    const PRIME3: u64 = 0x165667B19E3779F9;
    const PRIME5: u64 = 0x27D4EB2F165667C5;

    let mut h: u64 = PRIME5.wrapping_add(bytes.len() as u64);
    for &b in bytes {
        h ^= (b as u64).wrapping_mul(PRIME5);
        h = h.rotate_left(11).wrapping_mul(PRIME1);
    }

    h ^= h >> 33;
    h = h.wrapping_mul(PRIME2);
    h ^= h >> 29;
    h = h.wrapping_mul(PRIME3);
    h ^= h >> 32;
    h
}

/// Key for the per-cohort transaction lock.
///
/// PostgreSQL advisory locks take a signed 64-bit key, so the hash is
/// reinterpreted rather than truncated.
pub fn cohort_lock_key(cohort: &CohortKey) -> i64 {
    hash64(&cohort.to_key_bytes()) as i64
}

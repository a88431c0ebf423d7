/// Key hashing algorithms shared with peer memcached clients
///
/// The byte and endianness conventions below decide which server owns a key.
/// Changing any of them re-shuffles key ownership for every client of the
/// cluster, so they are fixed per algorithm and covered by known-value tests.
use serde::{Deserialize, Serialize};
use std::fmt;

/// MD5 digests computed per unit of server weight on the ring
pub const RING_DIGESTS_PER_WEIGHT: u32 = 40;

/// Ring points taken from each digest
pub const POINTS_PER_DIGEST: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashingAlgorithm {
    /// Java string hash over UTF-16 code units
    Native,
    /// `h = 33 * h + c` over UTF-16 code units
    OldCompat,
    /// Upper CRC32 bits of the UTF-8 key
    #[default]
    NewCompat,
    /// MD5 on a consistent-hash ring
    Consistent,
}

impl HashingAlgorithm {
    /// Whether keys are placed on a ring rather than in a modulo table
    pub fn is_consistent(&self) -> bool {
        matches!(self, HashingAlgorithm::Consistent)
    }

    /// Signed hash of a key under this algorithm
    pub fn hash(&self, key: &str) -> i64 {
        match self {
            HashingAlgorithm::Native => i64::from(native_hash(key)),
            HashingAlgorithm::OldCompat => old_compat_hash(key),
            HashingAlgorithm::NewCompat => i64::from(new_compat_hash(key)),
            HashingAlgorithm::Consistent => i64::from(md5_hash(key)),
        }
    }

    /// Index into a modulo table of `len` slots
    pub fn bucket(&self, key: &str, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let bucket = self.hash(key) % len as i64;
        bucket.unsigned_abs() as usize
    }
}

impl fmt::Display for HashingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashingAlgorithm::Native => "native",
            HashingAlgorithm::OldCompat => "old_compat",
            HashingAlgorithm::NewCompat => "new_compat",
            HashingAlgorithm::Consistent => "consistent",
        };
        f.write_str(name)
    }
}

pub fn native_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

pub fn old_compat_hash(key: &str) -> i64 {
    key.encode_utf16()
        .fold(0i64, |h, c| h.wrapping_mul(33).wrapping_add(i64::from(c)))
}

pub fn new_compat_hash(key: &str) -> u32 {
    (crc32fast::hash(key.as_bytes()) >> 16) & 0x7fff
}

/// Little-endian u32 from the first four MD5 digest bytes
pub fn md5_hash(key: &str) -> u32 {
    let digest = md5::compute(key.as_bytes());
    le_point(&digest.0, 0)
}

/// Ring points owned by one server: `weight * 40` digests of `"<addr>-<n>"`,
/// four points per digest.
///
/// The count depends on this server's weight alone, not on the cluster total.
pub fn ring_points(addr: &str, weight: u32) -> Vec<u32> {
    let digests = weight.saturating_mul(RING_DIGESTS_PER_WEIGHT);
    let mut points = Vec::with_capacity(digests as usize * POINTS_PER_DIGEST);
    for n in 0..digests {
        let digest = md5::compute(format!("{}-{}", addr, n).as_bytes());
        for h in 0..POINTS_PER_DIGEST {
            points.push(le_point(&digest.0, h * 4));
        }
    }
    points
}

fn le_point(digest: &[u8; 16], offset: usize) -> u32 {
    u32::from_le_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

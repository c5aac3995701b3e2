use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use crc32fast::Hasher;

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh 32-bit value for journal nonces and log salts. The clock, the
/// process id and a per-process counter are folded together through crc32,
/// so two calls in the same nanosecond still differ.
pub fn random_u32() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut hasher = Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&NONCE_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hasher.finalize()
}

/// Checksum stored after each rollback-journal record: the journal nonce
/// plus every 200th byte of the page image, counting back from
/// `page_size - 200` and stopping before offset 0.
pub fn journal_checksum(nonce: u32, data: &[u8]) -> u32 {
    let mut sum = nonce;
    let mut at = data.len() as isize - 200;
    while at > 0 {
        sum = sum.wrapping_add(data[at as usize] as u32);
        at -= 200;
    }
    sum
}

/// Cumulative WAL checksum: two running sums over 32-bit words, continued
/// from `seed`. `data` must be a multiple of 8 bytes.
pub fn wal_checksum(data: &[u8], seed: (u32, u32), big_endian: bool) -> (u32, u32) {
    let word = |b: &[u8]| {
        let bytes = [b[0], b[1], b[2], b[3]];
        if big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    };
    let (mut s1, mut s2) = seed;
    for chunk in data.chunks_exact(8) {
        let x0 = word(&chunk[0..4]);
        let x1 = word(&chunk[4..8]);
        s1 = s1.wrapping_add(x0).wrapping_add(s2);
        s2 = s2.wrapping_add(x1).wrapping_add(s1);
    }
    (s1, s2)
}

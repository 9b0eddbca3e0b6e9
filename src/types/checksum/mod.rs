#![forbid(unsafe_code)]
//! CRC32 protecting redo groups.

use crc32fast::Hasher;

/// Checksum of one redo group, bound to the LSN it was written at.
pub fn redo_crc32(start_lsn: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&start_lsn.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Returns true when `crc` matches the group at `start_lsn`.
pub fn verify_redo_crc32(start_lsn: u64, payload: &[u8], crc: u32) -> bool {
    redo_crc32(start_lsn, payload) == crc
}

#![forbid(unsafe_code)]

//! CRC32 seals for on-disk structures.
//!
//! Every seal mixes in a tag (the superblock slot or the session number) so
//! an intact structure copied to the wrong place fails verification.

use crate::types::{LineageError, Result};

/// Width of a seal appended to a sealed buffer.
pub const SEAL_LEN: usize = 4;

/// CRC32 over `tag` (big-endian) followed by `payload`.
pub fn tagged_crc32(tag: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tag.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Appends the big-endian seal of `out` under `tag`.
pub fn append_seal(tag: u64, out: &mut Vec<u8>) {
    let crc = tagged_crc32(tag, out);
    out.extend_from_slice(&crc.to_be_bytes());
}

/// Splits a sealed buffer into its body and stored seal.
pub fn split_seal(bytes: &[u8]) -> Result<(&[u8], u32)> {
    if bytes.len() < SEAL_LEN {
        return Err(LineageError::Corruption("sealed buffer truncated"));
    }
    let (body, seal) = bytes.split_at(bytes.len() - SEAL_LEN);
    Ok((body, u32::from_be_bytes([seal[0], seal[1], seal[2], seal[3]])))
}

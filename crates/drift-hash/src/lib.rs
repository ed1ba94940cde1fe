//! # drift-hash
//!
//! Checksum flavors used for content fingerprints and duplicate
//! detection, plus the password scrambler.
//!
//! All identity fingerprints (`host_id`, `job_id`, `dir_id`, ...) are
//! CRC-32 over the canonical textual form, so they stay stable across
//! endian changes. CRC-32C uses the hardware instruction when the CPU
//! has one; MurmurHash3 is the third selectable flavor for the
//! duplicate-check store.

pub mod scramble;

use std::io::Read;

use thiserror::Error;

/// Seed used when a checksum chain starts from scratch.
pub const INITIAL_CRC: u32 = !0u32;

/// Block size for the streaming helpers.
const STREAM_BLOCK: usize = 4096;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, HashError>;

/// Selectable checksum flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcFlavor {
    Crc32,
    Crc32c,
    Murmur3,
}

/// Classic table-driven CRC-32, continuing from `init`.
pub fn get_checksum(init: u32, buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    hasher.update(buf);
    hasher.finalize()
}

/// CRC-32C (Castagnoli), hardware-accelerated when available.
pub fn get_checksum_crc32c(init: u32, buf: &[u8]) -> u32 {
    crc32c::crc32c_append(init, buf)
}

/// Seedable 32-bit MurmurHash3.
pub fn get_checksum_murmur3(seed: u32, buf: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = buf.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= buf.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Checksum of a byte slice in the requested flavor.
pub fn checksum(flavor: CrcFlavor, init: u32, buf: &[u8]) -> u32 {
    match flavor {
        CrcFlavor::Crc32 => get_checksum(init, buf),
        CrcFlavor::Crc32c => get_checksum_crc32c(init, buf),
        CrcFlavor::Murmur3 => get_checksum_murmur3(init, buf),
    }
}

/// Checksum an entire `Read` stream in 4 KiB blocks.
///
/// MurmurHash3 cannot be chained block-wise, so the stream is buffered
/// for that flavor; CRC flavors stream with constant memory.
pub fn checksum_reader<R: Read>(flavor: CrcFlavor, init: u32, reader: &mut R) -> Result<u32> {
    match flavor {
        CrcFlavor::Murmur3 => {
            let mut all = Vec::new();
            reader.read_to_end(&mut all)?;
            Ok(get_checksum_murmur3(init, &all))
        }
        _ => {
            let mut crc = init;
            let mut buf = [0u8; STREAM_BLOCK];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc = checksum(flavor, crc, &buf[..n]);
            }
            Ok(crc)
        }
    }
}

/// CRC-32 fingerprint of a canonical identity string.
pub fn fingerprint(canonical: &[u8]) -> u32 {
    crc32fast::hash(canonical)
}

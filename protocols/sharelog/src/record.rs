use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Size of an encoded share record in bytes. Sharelog files are plain
/// concatenations of records, so every valid file length is a multiple of
/// this.
pub const SHARE_SIZE: usize = 44;

/// Outcome of a submitted proof-of-work attempt.
///
/// Only accepted shares contribute to hashrate; rejects are tracked
/// separately for reject-rate reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareResult {
    Reject = 0,
    Accept = 1,
}

impl From<u32> for ShareResult {
    fn from(v: u32) -> Self {
        if v == 1 {
            ShareResult::Accept
        } else {
            ShareResult::Reject
        }
    }
}

/// A single share as submitted by a miner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Share {
    pub job_id: u64,
    /// Stable per-worker hash id; never 0 for a valid share.
    pub worker_hash_id: i64,
    /// Owning account; never 0 for a valid share.
    pub user_id: i32,
    /// IPv4 of the submitter, octets in big-endian numeric order.
    pub ip: u32,
    pub result: ShareResult,
    /// UNIX seconds at submission.
    pub timestamp: u32,
    /// Integer share weight in difficulty units.
    pub share: u64,
    /// Compact difficulty bits of the job's block template, used to derive
    /// the network difficulty for scoring.
    pub block_bits: u32,
}

#[derive(Debug, Error)]
pub enum ShareDecodeError {
    #[error("share record must be {SHARE_SIZE} bytes, got {actual}")]
    InvalidLength { actual: usize },
}

impl Share {
    /// Encode into the fixed-width little-endian wire form.
    pub fn encode(&self) -> [u8; SHARE_SIZE] {
        let mut buf = [0u8; SHARE_SIZE];
        buf[0..8].copy_from_slice(&self.job_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.worker_hash_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.user_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.ip.to_le_bytes());
        buf[24..28].copy_from_slice(&(self.result as u32).to_le_bytes());
        buf[28..32].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[32..40].copy_from_slice(&self.share.to_le_bytes());
        buf[40..44].copy_from_slice(&self.block_bits.to_le_bytes());
        buf
    }

    /// Decode a record from `buf`, which must be exactly [`SHARE_SIZE`]
    /// bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ShareDecodeError> {
        if buf.len() != SHARE_SIZE {
            return Err(ShareDecodeError::InvalidLength { actual: buf.len() });
        }

        let u32_at = |off: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[off..off + 4]);
            u32::from_le_bytes(bytes)
        };
        let u64_at = |off: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[off..off + 8]);
            u64::from_le_bytes(bytes)
        };

        Ok(Share {
            job_id: u64_at(0),
            worker_hash_id: u64_at(8) as i64,
            user_id: u32_at(16) as i32,
            ip: u32_at(20),
            result: ShareResult::from(u32_at(24)),
            timestamp: u32_at(28),
            share: u64_at(32),
            block_bits: u32_at(40),
        })
    }

    /// A share is processable when it names a real worker and account,
    /// carries a timestamp, and (for accepts) has non-zero weight.
    pub fn is_valid(&self) -> bool {
        self.worker_hash_id != 0
            && self.user_id != 0
            && self.timestamp > 0
            && (self.share > 0 || self.result == ShareResult::Reject)
    }

    /// Per-share score: share weight relative to the network difficulty of
    /// the job it solved. Clamped to 1.0 when the weight exceeds the
    /// network difficulty (a block-solving share earns exactly one block).
    pub fn score(&self) -> f64 {
        if self.share == 0 || self.block_bits == 0 {
            return 0.0;
        }
        let network_difficulty = bits_to_difficulty(self.block_bits);
        if network_difficulty < self.share as f64 {
            return 1.0;
        }
        self.share as f64 / network_difficulty
    }

    /// Dotted-quad rendering of the submitter address.
    pub fn ip_str(&self) -> String {
        Ipv4Addr::from(self.ip).to_string()
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "share(job: {}, worker: {}, user: {}, ip: {}, result: {:?}, time: {}, share: {})",
            self.job_id,
            self.worker_hash_id,
            self.user_id,
            self.ip_str(),
            self.result,
            self.timestamp,
            self.share
        )
    }
}

/// Expand compact difficulty bits into a difficulty value relative to the
/// maximum target.
pub fn bits_to_difficulty(bits: u32) -> f64 {
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 {
        return 0.0;
    }
    let mut shift = (bits >> 24) & 0xff;
    let mut diff = f64::from(0xffffu32) / mantissa as f64;
    while shift < 29 {
        diff *= 256.0;
        shift += 1;
    }
    while shift > 29 {
        diff /= 256.0;
        shift -= 1;
    }
    diff
}

//! Shared share-statistics primitives for the stats roles.
//!
//! The live stats server and the sharelog parser both aggregate the same
//! share stream, just over different horizons: sliding windows for live
//! hashrate and fixed calendar buckets for hourly/daily history. The
//! building blocks live here so both services use identical window math.

pub mod day;
pub mod window;
pub mod worker;

use std::time::{SystemTime, UNIX_EPOCH};

pub use day::{ShareStats, ShareStatsDay, BLOCK_REWARD};
pub use window::TimeBucketedSum;
pub use worker::{merge_status, WorkerShares, WorkerStatus, SLIDING_WINDOW_SECONDS};

/// Identifies one worker of one account. `worker_id == 0` is the
/// aggregated-user key; `(0, 0)` is the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub user_id: i32,
    pub worker_id: i64,
}

impl WorkerKey {
    pub fn new(user_id: i32, worker_id: i64) -> Self {
        Self { user_id, worker_id }
    }
}

/// Get current Unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Estimate hashrate in TH/s from accepted share weight over `secs`
/// seconds. Each unit of difficulty represents 2^32 expected hashes.
pub fn share_to_hashrate_t(accept: u64, secs: u64) -> f64 {
    if secs == 0 {
        return 0.0;
    }
    accept as f64 * 4_294_967_296.0 / secs as f64 / 1e12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_to_hashrate_t() {
        // 1000 difficulty over 10s: 1000 * 2^32 / 10 = 429.4967296 GH/s
        let t = share_to_hashrate_t(1000, 10);
        assert!((t - 0.4294967296).abs() < 1e-12);

        assert_eq!(share_to_hashrate_t(1000, 0), 0.0);
    }

    #[test]
    fn test_worker_key_aggregates() {
        let worker = WorkerKey::new(7, 42);
        let user = WorkerKey::new(7, 0);
        let pool = WorkerKey::new(0, 0);
        assert_ne!(worker, user);
        assert_ne!(user, pool);
        assert_eq!(user, WorkerKey::new(7, 0));
    }
}

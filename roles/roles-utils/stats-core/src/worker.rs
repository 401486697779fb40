//! Per-entity sliding-window share aggregation.

use std::sync::Mutex;

use serde::Serialize;
use sharelog::{Share, ShareResult};

use crate::window::TimeBucketedSum;

/// Width of the accept window in seconds. Shares older than this are
/// observed but dropped, and an entity with no share for this long is
/// expired.
pub const SLIDING_WINDOW_SECONDS: u64 = 3600;

/// Point-in-time snapshot of one worker's (or user's, or the pool's)
/// windowed counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerStatus {
    pub accept_1m: u64,
    pub accept_5m: u64,
    pub accept_15m: u64,
    pub accept_1h: u64,
    pub reject_15m: u64,
    pub reject_1h: u64,
    pub accept_count: u32,
    pub last_share_ip: u32,
    pub last_share_time: u32,
}

struct SharesInner {
    /// Accepted weight, second-indexed buckets over one hour.
    accept_share_sec: TimeBucketedSum<u64>,
    /// Rejected weight, minute-indexed buckets over one hour.
    reject_share_min: TimeBucketedSum<u64>,
    accept_count: u32,
    last_share_ip: u32,
    last_share_time: u32,
}

/// Thread-safe sliding-window aggregator for one index entry. The owning
/// index hands out shared handles; the internal mutex serialises the
/// ingest thread against the flush threads.
pub struct WorkerShares {
    inner: Mutex<SharesInner>,
}

impl WorkerShares {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SharesInner {
                accept_share_sec: TimeBucketedSum::new(SLIDING_WINDOW_SECONDS as usize),
                reject_share_min: TimeBucketedSum::new((SLIDING_WINDOW_SECONDS / 60) as usize),
                accept_count: 0,
                last_share_ip: 0,
                last_share_time: 0,
            }),
        }
    }

    /// Fold one share into the windows. Shares older than the window
    /// relative to `now` are dropped. Future-dated shares are allowed;
    /// only "too old" is tested.
    ///
    /// `last_share_ip`/`last_share_time` are taken from every in-window
    /// share, even one older than the current `last_share_time` — the
    /// fields track the most recently *received* share, not the most
    /// recent by submission time.
    pub fn process_share(&self, share: &Share, now: u64) {
        if now > u64::from(share.timestamp) + SLIDING_WINDOW_SECONDS {
            return;
        }
        let mut inner = self.inner.lock().unwrap();

        match share.result {
            ShareResult::Accept => {
                inner.accept_count += 1;
                inner
                    .accept_share_sec
                    .insert(u64::from(share.timestamp), share.share);
            }
            ShareResult::Reject => {
                inner
                    .reject_share_min
                    .insert(u64::from(share.timestamp) / 60, share.share);
            }
        }

        inner.last_share_ip = share.ip;
        inner.last_share_time = share.timestamp;
    }

    /// Snapshot the windowed counters relative to `now`.
    pub fn status(&self, now: u64) -> WorkerStatus {
        let inner = self.inner.lock().unwrap();
        WorkerStatus {
            accept_1m: inner.accept_share_sec.sum(now, 60),
            accept_5m: inner.accept_share_sec.sum(now, 300),
            accept_15m: inner.accept_share_sec.sum(now, 900),
            accept_1h: inner.accept_share_sec.sum(now, 3600),
            reject_15m: inner.reject_share_min.sum(now / 60, 15),
            reject_1h: inner.reject_share_min.sum(now / 60, 60),
            accept_count: inner.accept_count,
            last_share_ip: inner.last_share_ip,
            last_share_time: inner.last_share_time,
        }
    }

    /// An entry with no share for a full window is eligible for the
    /// expiry sweep.
    pub fn is_expired(&self, now: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        u64::from(inner.last_share_time) + SLIDING_WINDOW_SECONDS < now
    }
}

impl Default for WorkerShares {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum a batch of statuses into one. `last_share_ip` follows the entry
/// with the greatest `last_share_time`.
pub fn merge_status(statuses: &[WorkerStatus]) -> WorkerStatus {
    let mut merged = WorkerStatus::default();
    for s in statuses {
        merged.accept_1m += s.accept_1m;
        merged.accept_5m += s.accept_5m;
        merged.accept_15m += s.accept_15m;
        merged.accept_1h += s.accept_1h;
        merged.reject_15m += s.reject_15m;
        merged.reject_1h += s.reject_1h;
        merged.accept_count += s.accept_count;
        if s.last_share_time > merged.last_share_time {
            merged.last_share_time = s.last_share_time;
            merged.last_share_ip = s.last_share_ip;
        }
    }
    merged
}

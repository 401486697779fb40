//! Calendar-day share aggregation for the sharelog parser.

use std::sync::Mutex;

use serde::Serialize;
use sharelog::{Share, ShareResult};

/// Block reward in base units, used to turn accumulated score into
/// estimated earnings.
pub const BLOCK_REWARD: i64 = 1_250_000_000;

/// Aggregate over one hour or one day.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ShareStats {
    pub share_accept: u64,
    pub share_reject: u64,
    pub reject_rate: f64,
    pub score: f64,
    pub earn: i64,
}

impl ShareStats {
    fn from_parts(accept: u64, reject: u64, score: f64) -> Self {
        let reject_rate = if reject != 0 {
            reject as f64 / (accept + reject) as f64
        } else {
            0.0
        };
        Self {
            share_accept: accept,
            share_reject: reject,
            reject_rate,
            score,
            earn: (score * BLOCK_REWARD as f64) as i64,
        }
    }
}

#[derive(Default)]
struct DayInner {
    share_accept_1h: [u64; 24],
    share_reject_1h: [u64; 24],
    score_1h: [f64; 24],
    share_accept_1d: u64,
    share_reject_1d: u64,
    score_1d: f64,
    /// Bit `i` set means hour bucket `i` changed since the last flush.
    modified_hours: u32,
}

/// 24-hour share statistics for one worker, user, or the pool. Written by
/// the parse loop, read (and mask-cleared) by the DB flush.
pub struct ShareStatsDay {
    inner: Mutex<DayInner>,
}

impl ShareStatsDay {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DayInner::default()),
        }
    }

    /// Fold a share into the hour bucket `hour_idx` (must be in `0..24`).
    pub fn process_share(&self, hour_idx: usize, share: &Share) {
        assert!(hour_idx < 24);
        let mut inner = self.inner.lock().unwrap();

        match share.result {
            ShareResult::Accept => {
                inner.share_accept_1h[hour_idx] += share.share;
                inner.share_accept_1d += share.share;
                inner.score_1h[hour_idx] += share.score();
                inner.score_1d += share.score();
            }
            ShareResult::Reject => {
                inner.share_reject_1h[hour_idx] += share.share;
                inner.share_reject_1d += share.share;
            }
        }
        inner.modified_hours |= 1 << hour_idx;
    }

    /// Aggregate for one hour of the day. Out-of-range indices yield
    /// zeroed stats.
    pub fn stats_hour(&self, hour_idx: usize) -> ShareStats {
        if hour_idx > 23 {
            return ShareStats::default();
        }
        let inner = self.inner.lock().unwrap();
        ShareStats::from_parts(
            inner.share_accept_1h[hour_idx],
            inner.share_reject_1h[hour_idx],
            inner.score_1h[hour_idx],
        )
    }

    /// Aggregate for the whole day.
    pub fn stats_day(&self) -> ShareStats {
        let inner = self.inner.lock().unwrap();
        ShareStats::from_parts(inner.share_accept_1d, inner.share_reject_1d, inner.score_1d)
    }

    pub fn modified_hours(&self) -> u32 {
        self.inner.lock().unwrap().modified_hours
    }

    /// Stats for every hour whose modified bit is set, oldest hour first.
    pub fn hour_rows(&self) -> Vec<(usize, ShareStats)> {
        let inner = self.inner.lock().unwrap();
        (0..24)
            .filter(|i| inner.modified_hours & (1 << i) != 0)
            .map(|i| {
                (
                    i,
                    ShareStats::from_parts(
                        inner.share_accept_1h[i],
                        inner.share_reject_1h[i],
                        inner.score_1h[i],
                    ),
                )
            })
            .collect()
    }

    /// Clear the modified-hours mask after a flush has generated its rows.
    pub fn clear_modified(&self) {
        self.inner.lock().unwrap().modified_hours = 0;
    }
}

impl Default for ShareStatsDay {
    fn default() -> Self {
        Self::new()
    }
}

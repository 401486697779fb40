//! Periodic flush of the live indices into `mining_workers`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use pool_db::{flush_via_temp_table, DbError};
use stats_core::{unix_timestamp, WorkerStatus};
use tracing::{error, info, warn};

use crate::server::StatsServer;

const FIELDS: &str = "`worker_id`,`puid`,`group_id`,`accept_1m`,`accept_5m`,`accept_15m`,\
`reject_15m`,`accept_1h`,`reject_1h`,`accept_count`,`last_share_ip`,`last_share_time`,\
`created_at`,`updated_at`";

const UPDATE_COLS: [&str; 10] = [
    "accept_1m",
    "accept_5m",
    "accept_15m",
    "reject_15m",
    "accept_1h",
    "reject_1h",
    "accept_count",
    "last_share_ip",
    "last_share_time",
    "updated_at",
];

/// Kick off one flush tick. Skipped when the previous flush is still
/// running; the guard flag is always cleared when the work finishes.
pub fn flush_workers_and_users(server: Arc<StatsServer>) {
    info!("flush to DB...");
    if server.is_inserting.swap(true, Ordering::SeqCst) {
        warn!("last DB flush is not finished yet, ignore");
        return;
    }

    tokio::spawn(async move {
        if let Err(e) = flush_thread(&server).await {
            error!("flush workers to DB failed: {}", e);
        }
        server.is_inserting.store(false, Ordering::SeqCst);
    });
}

async fn flush_thread(server: &Arc<StatsServer>) -> Result<(), DbError> {
    let Some(pool) = &server.db else {
        return Ok(());
    };
    let began = unix_timestamp();
    let now = unix_timestamp();
    let now_str = datetime_str(now);

    // one row per worker and per user, copied out under the read lock
    let mut values: Vec<String> = Vec::new();
    let (worker_count, user_count) = {
        let indexes = server.indexes.read().unwrap();
        for (key, entry) in &indexes.workers {
            values.push(worker_row(
                key.worker_id,
                key.user_id,
                &entry.status(now),
                &now_str,
            ));
        }
        for (&user_id, entry) in &indexes.users {
            values.push(worker_row(0, user_id, &entry.status(now), &now_str));
        }
        (indexes.workers.len(), indexes.users.len())
    };

    if values.is_empty() {
        info!("flush to DB: no active workers");
        return Ok(());
    }

    let mut conn = pool.acquire().await?;
    flush_via_temp_table(&mut conn, "mining_workers", FIELDS, &values, &UPDATE_COLS).await?;

    let flushed = unix_timestamp();
    server.last_flush_time.store(flushed, Ordering::Relaxed);
    if let Some(path) = &server.config.file_last_flush_time {
        // monitoring systems watch this file for flush liveness
        if let Err(e) = std::fs::write(path, flushed.to_string()) {
            error!("write last flush time file failed: {}", e);
        }
    }

    info!(
        "flush to DB... done, workers: {}, users: {}, time: {}s",
        worker_count,
        user_count,
        unix_timestamp() - began
    );
    Ok(())
}

fn datetime_str(ts: u64) -> String {
    Utc.timestamp_opt(ts as i64, 0)
        .single()
        .map(|d| d.format("%F %T").to_string())
        .unwrap_or_default()
}

/// Render one `mining_workers` row. A user row is a worker row with
/// `worker_id == 0`; either way the row starts in the default group of
/// its account.
fn worker_row(worker_id: i64, user_id: i32, status: &WorkerStatus, now_str: &str) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},'{}','{}','{}','{}'",
        worker_id,
        user_id,
        -user_id, // default group id
        status.accept_1m,
        status.accept_5m,
        status.accept_15m,
        status.reject_15m,
        status.accept_1h,
        status.reject_1h,
        status.accept_count,
        std::net::Ipv4Addr::from(status.last_share_ip),
        datetime_str(u64::from(status.last_share_time)),
        now_str,
        now_str
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_row_shape() {
        let status = WorkerStatus {
            accept_1m: 1,
            accept_5m: 2,
            accept_15m: 3,
            accept_1h: 4,
            reject_15m: 5,
            reject_1h: 6,
            accept_count: 7,
            last_share_ip: 0x0a000001,
            last_share_time: 1_468_331_100,
        };
        let row = worker_row(42, 7, &status, "2016-07-12 13:45:00");
        assert_eq!(
            row,
            "42,7,-7,1,2,3,5,4,6,7,'10.0.0.1','2016-07-12 13:45:00',\
             '2016-07-12 13:45:00','2016-07-12 13:45:00'"
        );
    }

    #[test]
    fn test_user_row_uses_worker_id_zero() {
        let row = worker_row(0, 9, &WorkerStatus::default(), "2016-07-12 13:45:00");
        assert!(row.starts_with("0,9,-9,"));
    }

    #[test]
    fn test_datetime_str() {
        assert_eq!(datetime_str(1_468_331_100), "2016-07-12 13:45:00");
    }
}

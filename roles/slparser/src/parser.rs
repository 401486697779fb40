//! Incremental parsing of one day's sharelog file into per-key
//! [`ShareStatsDay`] aggregates, and the temp-table flush into the stats
//! tables.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{TimeZone, Utc};
use pool_db::flush_via_temp_table;
use sharelog::{day_begin_ts, sharelog_path, Share, SHARE_SIZE};
use sqlx::MySqlPool;
use stats_core::{unix_timestamp, ShareStats, ShareStatsDay, WorkerKey};
use thiserror::Error;
use tracing::{error, info, warn};

/// Upper bound of records consumed per `process_growing` call.
const MAX_ELEMENTS_PER_READ: usize = 2_000_000;

/// Read chunk granularity in records.
const READ_CHUNK_RECORDS: usize = 16_384;

/// Expired rows are deleted from the stats tables at most this often.
const REMOVE_EXPIRED_INTERVAL: u64 = 3600;

const UPDATE_COLS: [&str; 6] = [
    "share_accept",
    "share_reject",
    "reject_rate",
    "score",
    "earn",
    "updated_at",
];

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("sharelog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] pool_db::DbError),
}

struct ParserIo {
    file: Option<File>,
    last_position: u64,
}

/// Parser for a single day's sharelog file. The worker loop feeds it by
/// calling `process_growing`; HTTP handlers read the aggregate map through
/// shared handles.
pub struct ShareLogParser {
    /// UTC midnight of the day this parser covers.
    date_start: u32,
    /// The day rendered as YYYYMMDD, the key prefix for hour/day rows.
    day_number: i64,
    file_path: PathBuf,
    io: Mutex<ParserIo>,
    stats: RwLock<HashMap<WorkerKey, Arc<ShareStatsDay>>>,
    db: Option<MySqlPool>,
    last_remove_expired: Mutex<u64>,
}

impl ShareLogParser {
    pub fn new(data_dir: &std::path::Path, timestamp: u32, db: Option<MySqlPool>) -> Self {
        let date_start = day_begin_ts(timestamp);
        let day_number = Utc
            .timestamp_opt(i64::from(date_start), 0)
            .single()
            .map(|d| d.format("%Y%m%d").to_string())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let mut stats = HashMap::new();
        stats.insert(WorkerKey::new(0, 0), Arc::new(ShareStatsDay::new()));

        Self {
            date_start,
            day_number,
            file_path: sharelog_path(data_dir, date_start),
            io: Mutex::new(ParserIo {
                file: None,
                last_position: 0,
            }),
            stats: RwLock::new(stats),
            db,
            last_remove_expired: Mutex::new(0),
        }
    }

    pub fn date_start(&self) -> u32 {
        self.date_start
    }

    pub fn file_path(&self) -> &std::path::Path {
        &self.file_path
    }

    /// Make sure the day file exists, creating it empty if the writer has
    /// not opened the day yet.
    pub fn init(&self) -> Result<(), ParserError> {
        if !self.file_path.exists() {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            info!("created sharelog file: {}", self.file_path.display());
        }
        Ok(())
    }

    /// Read newly appended records since the last call, up to
    /// [`MAX_ELEMENTS_PER_READ`], and fold them into the aggregates.
    /// Returns the number of records consumed; 0 means no new data.
    pub fn process_growing(&self) -> Result<usize, ParserError> {
        let mut io = self.io.lock().unwrap();

        if io.file.is_none() {
            io.file = Some(File::open(&self.file_path)?);
        }
        let start_position = io.last_position;
        let file = io.file.as_mut().unwrap();
        // the read cursor is managed here, not by the file handle
        file.seek(SeekFrom::Start(start_position))?;

        let mut chunk = vec![0u8; READ_CHUNK_RECORDS * SHARE_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        let mut records = 0usize;

        'read: loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&chunk[..n]);

            let mut offset = 0;
            while pending.len() - offset >= SHARE_SIZE {
                self.parse_record(&pending[offset..offset + SHARE_SIZE]);
                offset += SHARE_SIZE;
                records += 1;
                if records >= MAX_ELEMENTS_PER_READ {
                    pending.drain(..offset);
                    break 'read;
                }
            }
            pending.drain(..offset);
        }

        // a partial record at the tail is left for the next call
        io.last_position = start_position + (records * SHARE_SIZE) as u64;
        debug_assert_eq!(io.last_position % SHARE_SIZE as u64, 0);

        Ok(records)
    }

    fn parse_record(&self, buf: &[u8]) {
        let share = match Share::decode(buf) {
            Ok(share) => share,
            Err(e) => {
                error!("undecodable share: {}", e);
                return;
            }
        };
        if !share.is_valid() {
            error!("invalid share: {}", share);
            return;
        }

        let delta = i64::from(share.timestamp) - i64::from(self.date_start);
        if delta < 0 || delta / 3600 >= 24 {
            warn!("share outside day file, offset {}s: {}", delta, share);
            return;
        }
        let hour_idx = (delta / 3600) as usize;

        let wkey = WorkerKey::new(share.user_id, share.worker_hash_id);
        let ukey = WorkerKey::new(share.user_id, 0);
        let pkey = WorkerKey::new(0, 0);

        for key in [wkey, ukey, pkey] {
            let entry = {
                let stats = self.stats.read().unwrap();
                stats.get(&key).cloned()
            };
            let entry = match entry {
                Some(entry) => entry,
                None => {
                    let mut stats = self.stats.write().unwrap();
                    stats
                        .entry(key)
                        .or_insert_with(|| Arc::new(ShareStatsDay::new()))
                        .clone()
                }
            };
            entry.process_share(hour_idx, &share);
        }
    }

    /// Replay the whole file in one pass. Used when re-aggregating a
    /// finished day, where nothing will be appended anymore.
    pub fn process_unchanged(&self) -> Result<usize, ParserError> {
        let mut total = 0;
        loop {
            let records = self.process_growing()?;
            if records == 0 {
                return Ok(total);
            }
            total += records;
        }
    }

    /// Whether the read cursor has caught up with the file's current size.
    pub fn is_reach_eof(&self) -> bool {
        let size = match std::fs::metadata(&self.file_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!("stat failed for {}: {}", self.file_path.display(), e);
                return true;
            }
        };
        self.io.lock().unwrap().last_position == size
    }

    /// Shared handle for one key's day aggregate, if any share created it.
    pub fn stats_day_handle(&self, key: &WorkerKey) -> Option<Arc<ShareStatsDay>> {
        self.stats.read().unwrap().get(key).cloned()
    }

    /// Flush every aggregate with a non-zero modified-hours mask into the
    /// six stats tables, then clean out expired rows.
    pub async fn flush_to_db(&self) -> Result<(), ParserError> {
        let Some(pool) = &self.db else {
            info!("no database configured, skipping stats flush");
            return Ok(());
        };

        let began = unix_timestamp();
        let rows = self.generate_rows();
        let total = rows.total();

        let mut conn = pool.acquire().await.map_err(pool_db::DbError::from)?;

        let hour_fields = "`share_accept`,`share_reject`,`reject_rate`,`score`,`earn`,`created_at`,`updated_at`";

        flush_via_temp_table(
            &mut conn,
            "stats_workers_hour",
            &format!("`worker_id`,`puid`,`hour`,{}", hour_fields),
            &rows.workers_hour,
            &UPDATE_COLS,
        )
        .await?;
        flush_via_temp_table(
            &mut conn,
            "stats_users_hour",
            &format!("`puid`,`hour`,{}", hour_fields),
            &rows.users_hour,
            &UPDATE_COLS,
        )
        .await?;
        flush_via_temp_table(
            &mut conn,
            "stats_pool_hour",
            &format!("`hour`,{}", hour_fields),
            &rows.pool_hour,
            &UPDATE_COLS,
        )
        .await?;

        flush_via_temp_table(
            &mut conn,
            "stats_workers_day",
            &format!("`worker_id`,`puid`,`day`,{}", hour_fields),
            &rows.workers_day,
            &UPDATE_COLS,
        )
        .await?;
        flush_via_temp_table(
            &mut conn,
            "stats_users_day",
            &format!("`puid`,`day`,{}", hour_fields),
            &rows.users_day,
            &UPDATE_COLS,
        )
        .await?;
        flush_via_temp_table(
            &mut conn,
            "stats_pool_day",
            &format!("`day`,{}", hour_fields),
            &rows.pool_day,
            &UPDATE_COLS,
        )
        .await?;

        info!(
            "flush to DB done, items: {}, time: {}s",
            total,
            unix_timestamp() - began
        );

        self.remove_expired_from_db().await;
        Ok(())
    }

    fn generate_rows(&self) -> FlushRows {
        // hold shared references so row generation runs without the map
        // lock
        let snapshot: Vec<(WorkerKey, Arc<ShareStatsDay>)> = {
            let stats = self.stats.read().unwrap();
            stats
                .iter()
                .filter(|(_, day)| day.modified_hours() != 0)
                .map(|(k, day)| (*k, day.clone()))
                .collect()
        };

        let mut rows = FlushRows::default();
        let now_str = Utc::now().format("%F %T").to_string();

        for (key, day) in &snapshot {
            for (hour_idx, stats) in day.hour_rows() {
                let hour = self.day_number * 100 + hour_idx as i64;
                let values = stats_values(&stats, &now_str);
                match row_class(key) {
                    RowClass::Worker => rows
                        .workers_hour
                        .push(format!("{},{},{},{}", key.worker_id, key.user_id, hour, values)),
                    RowClass::User => rows
                        .users_hour
                        .push(format!("{},{},{}", key.user_id, hour, values)),
                    RowClass::Pool => rows.pool_hour.push(format!("{},{}", hour, values)),
                }
            }

            let day_stats = day.stats_day();
            let values = stats_values(&day_stats, &now_str);
            match row_class(key) {
                RowClass::Worker => rows.workers_day.push(format!(
                    "{},{},{},{}",
                    key.worker_id, key.user_id, self.day_number, values
                )),
                RowClass::User => rows
                    .users_day
                    .push(format!("{},{},{}", key.user_id, self.day_number, values)),
                RowClass::Pool => rows
                    .pool_day
                    .push(format!("{},{}", self.day_number, values)),
            }

            // rows for this key are generated, further shares set the mask
            // again
            day.clear_modified();
        }

        rows
    }

    /// Delete aged rows: worker days after 90 days, worker hours after 3
    /// days, user hours after 30 days. Runs at most once per hour.
    pub async fn remove_expired_from_db(&self) {
        let Some(pool) = &self.db else {
            return;
        };

        let now = unix_timestamp();
        {
            let mut last = self.last_remove_expired.lock().unwrap();
            if *last + REMOVE_EXPIRED_INTERVAL > now {
                return;
            }
            *last = now;
        }

        let day_cutoff = |days: u64| {
            Utc.timestamp_opt((now - days * 86_400) as i64, 0)
                .single()
                .map(|d| d.format("%Y%m%d").to_string())
                .unwrap_or_default()
        };
        let hour_cutoff = |hours: u64| {
            Utc.timestamp_opt((now - hours * 3600) as i64, 0)
                .single()
                .map(|d| d.format("%Y%m%d%H").to_string())
                .unwrap_or_default()
        };

        let deletes = [
            format!(
                "DELETE FROM `stats_workers_day` WHERE `day` < '{}'",
                day_cutoff(90)
            ),
            format!(
                "DELETE FROM `stats_workers_hour` WHERE `hour` < '{}'",
                hour_cutoff(24 * 3)
            ),
            format!(
                "DELETE FROM `stats_users_hour` WHERE `hour` < '{}'",
                hour_cutoff(24 * 30)
            ),
        ];

        for sql in deletes {
            match sqlx::query(&sql).execute(pool).await {
                Ok(result) => info!("removed expired stats rows: {}", result.rows_affected()),
                Err(e) => error!("remove expired stats failed: {}", e),
            }
        }
    }
}

enum RowClass {
    Worker,
    User,
    Pool,
}

fn row_class(key: &WorkerKey) -> RowClass {
    if key.user_id != 0 && key.worker_id != 0 {
        RowClass::Worker
    } else if key.user_id != 0 {
        RowClass::User
    } else {
        RowClass::Pool
    }
}

fn stats_values(stats: &ShareStats, now_str: &str) -> String {
    format!(
        "{},{},{},{},{},'{}','{}'",
        stats.share_accept,
        stats.share_reject,
        stats.reject_rate,
        stats.score,
        stats.earn,
        now_str,
        now_str
    )
}

#[derive(Default)]
struct FlushRows {
    workers_hour: Vec<String>,
    users_hour: Vec<String>,
    pool_hour: Vec<String>,
    workers_day: Vec<String>,
    users_day: Vec<String>,
    pool_day: Vec<String>,
}

impl FlushRows {
    fn total(&self) -> usize {
        self.workers_hour.len()
            + self.users_hour.len()
            + self.pool_hour.len()
            + self.workers_day.len()
            + self.users_day.len()
            + self.pool_day.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::ShareResult;
    use std::io::Write;

    // 2016-07-12 00:00:00 UTC
    const DAY: u32 = 1_468_281_600;

    fn share(user: i32, worker: i64, hour: u32, result: ShareResult, weight: u64) -> Share {
        Share {
            job_id: 1,
            worker_hash_id: worker,
            user_id: user,
            ip: 0x0a000001,
            result,
            timestamp: DAY + hour * 3600 + 30,
            share: weight,
            block_bits: 0x1d00ffff,
        }
    }

    fn append_shares(path: &std::path::Path, shares: &[Share]) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        for s in shares {
            file.write_all(&s.encode()).unwrap();
        }
        file.flush().unwrap();
    }

    #[test]
    fn test_process_growing_aggregates_three_keys() {
        let dir = tempfile::tempdir().unwrap();
        let parser = ShareLogParser::new(dir.path(), DAY, None);
        parser.init().unwrap();

        let mut shares = Vec::new();
        for _ in 0..10 {
            shares.push(share(7, 42, 3, ShareResult::Accept, 1));
        }
        for _ in 0..5 {
            shares.push(share(7, 42, 4, ShareResult::Accept, 1));
        }
        append_shares(parser.file_path(), &shares);

        assert_eq!(parser.process_growing().unwrap(), 15);
        assert_eq!(parser.process_growing().unwrap(), 0);
        assert!(parser.is_reach_eof());

        for key in [
            WorkerKey::new(7, 42),
            WorkerKey::new(7, 0),
            WorkerKey::new(0, 0),
        ] {
            let day = parser.stats_day_handle(&key).unwrap();
            assert_eq!(day.stats_hour(3).share_accept, 10);
            assert_eq!(day.stats_hour(4).share_accept, 5);
            assert_eq!(day.stats_day().share_accept, 15);
        }
    }

    #[test]
    fn test_growing_file_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let parser = ShareLogParser::new(dir.path(), DAY, None);
        parser.init().unwrap();

        append_shares(parser.file_path(), &[share(7, 42, 0, ShareResult::Accept, 2)]);
        assert_eq!(parser.process_growing().unwrap(), 1);
        assert!(parser.is_reach_eof());

        // the file grows under the parser
        append_shares(parser.file_path(), &[share(7, 42, 1, ShareResult::Accept, 3)]);
        assert!(!parser.is_reach_eof());
        assert_eq!(parser.process_growing().unwrap(), 1);

        let pool = parser.stats_day_handle(&WorkerKey::new(0, 0)).unwrap();
        assert_eq!(pool.stats_day().share_accept, 5);
    }

    #[test]
    fn test_partial_tail_record_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let parser = ShareLogParser::new(dir.path(), DAY, None);
        parser.init().unwrap();

        let full = share(7, 42, 0, ShareResult::Accept, 1).encode();
        let mut bytes = full.to_vec();
        bytes.extend_from_slice(&full[..10]); // writer mid-append

        let mut file = OpenOptions::new()
            .append(true)
            .open(parser.file_path())
            .unwrap();
        file.write_all(&bytes).unwrap();

        assert_eq!(parser.process_growing().unwrap(), 1);
        assert!(!parser.is_reach_eof());

        // the rest of the record arrives
        file.write_all(&full[10..]).unwrap();
        assert_eq!(parser.process_growing().unwrap(), 1);
        assert!(parser.is_reach_eof());
    }

    #[test]
    fn test_process_unchanged_replays_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let parser = ShareLogParser::new(dir.path(), DAY, None);
        parser.init().unwrap();

        let shares: Vec<Share> = (0..40)
            .map(|i| share(7, 42, (i % 24) as u32, ShareResult::Accept, 1))
            .collect();
        append_shares(parser.file_path(), &shares);

        assert_eq!(parser.process_unchanged().unwrap(), 40);
        assert!(parser.is_reach_eof());

        let pool = parser.stats_day_handle(&WorkerKey::new(0, 0)).unwrap();
        assert_eq!(pool.stats_day().share_accept, 40);
    }

    #[test]
    fn test_out_of_day_share_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let parser = ShareLogParser::new(dir.path(), DAY, None);
        parser.init().unwrap();

        let mut late = share(7, 42, 0, ShareResult::Accept, 1);
        late.timestamp = DAY - 1;
        let mut early = share(7, 42, 0, ShareResult::Accept, 1);
        early.timestamp = DAY + 86_400;
        append_shares(parser.file_path(), &[late, early]);

        assert_eq!(parser.process_growing().unwrap(), 2);
        let pool = parser.stats_day_handle(&WorkerKey::new(0, 0)).unwrap();
        assert_eq!(pool.stats_day().share_accept, 0);
    }

    #[test]
    fn test_generate_rows_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let parser = ShareLogParser::new(dir.path(), DAY, None);
        parser.init().unwrap();

        let mut shares = Vec::new();
        for _ in 0..10 {
            shares.push(share(7, 42, 3, ShareResult::Accept, 1));
        }
        for _ in 0..5 {
            shares.push(share(7, 42, 4, ShareResult::Accept, 1));
        }
        append_shares(parser.file_path(), &shares);
        parser.process_growing().unwrap();

        let rows = parser.generate_rows();
        // one worker, one user, one pool key, two modified hours each
        assert_eq!(rows.workers_hour.len(), 2);
        assert_eq!(rows.users_hour.len(), 2);
        assert_eq!(rows.pool_hour.len(), 2);
        assert_eq!(rows.workers_day.len(), 1);
        assert_eq!(rows.users_day.len(), 1);
        assert_eq!(rows.pool_day.len(), 1);

        assert!(rows.pool_hour[0].starts_with("2016071203,10,0,"));
        assert!(rows.pool_hour[1].starts_with("2016071204,5,0,"));
        assert!(rows.pool_day[0].starts_with("20160712,15,0,"));
        assert!(rows.workers_hour[0].starts_with("42,7,2016071203,"));
        assert!(rows.users_hour[0].starts_with("7,2016071203,"));

        // generation cleared the masks
        let pool = parser.stats_day_handle(&WorkerKey::new(0, 0)).unwrap();
        assert_eq!(pool.modified_hours(), 0);
        assert!(parser.generate_rows().pool_hour.is_empty());
    }
}

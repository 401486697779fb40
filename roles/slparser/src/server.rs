//! Orchestrates the day parser: keeps it fed, flushes on cadence, and
//! switches to the next day's file at UTC midnight.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{Timelike, Utc};
use serde_json::{json, Value};
use sqlx::MySqlPool;
use stats_core::{share_to_hashrate_t, unix_timestamp, ShareStats, WorkerKey};
use tracing::{debug, error, info};

use crate::parser::{ParserError, ShareLogParser};

/// The new day's file is only adopted once the clock is at least this far
/// past midnight.
const DAY_SWITCH_GRACE_SECS: u64 = 5;

pub struct ParserServer {
    running: AtomicBool,
    data_dir: PathBuf,
    db: Option<MySqlPool>,
    flush_interval: u64,
    uptime: u64,
    pub request_count: AtomicU64,
    pub response_bytes: AtomicU64,
    parser: RwLock<Option<Arc<ShareLogParser>>>,
}

impl ParserServer {
    pub fn new(data_dir: impl Into<PathBuf>, db: Option<MySqlPool>, flush_interval: u64) -> Self {
        Self {
            running: AtomicBool::new(true),
            data_dir: data_dir.into(),
            db,
            flush_interval,
            uptime: unix_timestamp(),
            request_count: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
            parser: RwLock::new(None),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Replace the current parser with one for the day containing `ts`.
    pub fn init_parser(&self, ts: u64) -> Result<(), ParserError> {
        let parser = Arc::new(ShareLogParser::new(&self.data_dir, ts as u32, self.db.clone()));
        parser.init()?;
        info!("parser initialized for {}", parser.file_path().display());
        *self.parser.write().unwrap() = Some(parser);
        Ok(())
    }

    pub fn current_parser(&self) -> Option<Arc<ShareLogParser>> {
        self.parser.read().unwrap().clone()
    }

    /// The parser worker: drain new records, flush on cadence, roll over
    /// at day boundaries. Runs until `stop`.
    pub async fn run_worker(self: Arc<Self>) {
        info!("sharelog parser worker started");
        let mut last_flush: u64 = 0;

        while self.is_running() {
            let parser = match self.current_parser() {
                Some(parser) => parser,
                None => {
                    if let Err(e) = self.init_parser(unix_timestamp()) {
                        error!("parser init failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        continue;
                    }
                    continue;
                }
            };

            while self.is_running() {
                match parser.process_growing() {
                    Ok(0) => break,
                    Ok(n) => debug!("processed shares: {}", n),
                    Err(e) => {
                        error!("process sharelog failed: {}", e);
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;

            let now = unix_timestamp();
            if now > last_flush + self.flush_interval {
                if let Err(e) = parser.flush_to_db().await {
                    error!("flush stats to DB failed: {}", e);
                }
                last_flush = unix_timestamp();
            }

            self.try_switch_day(&parser).await;
        }
        info!("sharelog parser worker stopped");
    }

    /// Switch to the new day's file once (a) the grace period past
    /// midnight has elapsed, (b) the old file is fully consumed, and (c)
    /// the writer has created the new file.
    async fn try_switch_day(&self, parser: &Arc<ShareLogParser>) {
        let now = unix_timestamp();
        let day_begin = now - (now % 86_400);

        if day_begin == u64::from(parser.date_start()) {
            return; // still today
        }

        let new_path = sharelog::sharelog_path(&self.data_dir, now as u32);
        if now > day_begin + DAY_SWITCH_GRACE_SECS
            && parser.is_reach_eof()
            && new_path.exists()
        {
            if let Err(e) = parser.flush_to_db().await {
                error!("final flush before day switch failed: {}", e);
            }
            if let Err(e) = self.init_parser(now) {
                error!("day switch failed: {}", e);
            }
        }
    }

    /// Per-worker share stats for the requested hours. Hour `24` is the
    /// day total; `-23..=0` address hours of today relative to the
    /// current hour.
    pub fn share_stats(&self, user_id: i32, worker_ids: &[i64], hours: &[i32]) -> Value {
        let parser = self.current_parser();
        let current_hour = Utc::now().hour() as i32;

        let mut data = serde_json::Map::new();
        for &worker_id in worker_ids {
            let key = WorkerKey::new(user_id, worker_id);
            let day = parser.as_ref().and_then(|p| p.stats_day_handle(&key));

            let entries: Vec<Value> = hours
                .iter()
                .map(|&hour| {
                    let stats = match &day {
                        Some(day) if hour == 24 => day.stats_day(),
                        Some(day) if (-23..=0).contains(&hour) => {
                            let idx = current_hour + hour;
                            if (0..24).contains(&idx) {
                                day.stats_hour(idx as usize)
                            } else {
                                ShareStats::default()
                            }
                        }
                        _ => ShareStats::default(),
                    };
                    json!({
                        "hour": hour,
                        "accept": stats.share_accept,
                        "reject": stats.share_reject,
                        "reject_rate": stats.reject_rate,
                        "earn": stats.earn,
                    })
                })
                .collect();

            data.insert(worker_id.to_string(), Value::Array(entries));
        }
        Value::Object(data)
    }

    /// Pool aggregate for today and the current hour, as served on `/`.
    pub fn server_status(&self) -> Value {
        let uptime = unix_timestamp() - self.uptime;
        let parser = self.current_parser();

        let pool = parser
            .as_ref()
            .and_then(|p| p.stats_day_handle(&WorkerKey::new(0, 0)));
        let (today, curr_hour) = match &pool {
            Some(day) => (day.stats_day(), day.stats_hour(Utc::now().hour() as usize)),
            None => (ShareStats::default(), ShareStats::default()),
        };

        let mut now = unix_timestamp();
        if now % 3600 == 0 {
            now += 2; // keep the rate denominators non-zero
        }

        json!({
            "err_no": 0,
            "err_msg": "",
            "data": {
                "uptime": format_uptime(uptime),
                "request": self.request_count.load(Ordering::Relaxed),
                "repbytes": self.response_bytes.load(Ordering::Relaxed),
                "pool": {
                    "today": stats_with_hashrate(&today, now % 86_400),
                    "curr_hour": stats_with_hashrate(&curr_hour, now % 3600),
                },
            },
        })
    }
}

fn stats_with_hashrate(stats: &ShareStats, secs: u64) -> Value {
    json!({
        "hashrate_t": share_to_hashrate_t(stats.share_accept, secs),
        "accept": stats.share_accept,
        "reject": stats.share_reject,
        "reject_rate": stats.reject_rate,
        "earn": stats.earn,
    })
}

pub fn format_uptime(secs: u64) -> String {
    format!(
        "{:04} d {:02} h {:02} m {:02} s",
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::{Share, ShareResult};
    use std::io::Write;

    fn write_share(path: &std::path::Path, ts: u32, weight: u64) {
        let share = Share {
            job_id: 1,
            worker_hash_id: 42,
            user_id: 7,
            ip: 0,
            result: ShareResult::Accept,
            timestamp: ts,
            share: weight,
            block_bits: 0x1d00ffff,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(&share.encode()).unwrap();
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0000 d 00 h 00 m 00 s");
        assert_eq!(format_uptime(90_061), "0001 d 01 h 01 m 01 s");
    }

    #[tokio::test]
    async fn test_share_stats_for_current_day() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ParserServer::new(dir.path(), None, 60));

        let now = unix_timestamp();
        server.init_parser(now).unwrap();
        let parser = server.current_parser().unwrap();

        write_share(parser.file_path(), now as u32, 8);
        parser.process_growing().unwrap();

        // hour 0 is "this hour"; 24 is the day total
        let data = server.share_stats(7, &[42, 0], &[0, 24]);
        let worker = &data["42"];
        assert_eq!(worker[0]["hour"], 0);
        assert_eq!(worker[0]["accept"], 8);
        assert_eq!(worker[1]["hour"], 24);
        assert_eq!(worker[1]["accept"], 8);

        // worker_id 0 addresses the user aggregate
        assert_eq!(data["0"][1]["accept"], 8);
    }

    #[tokio::test]
    async fn test_share_stats_unknown_worker_zeroed() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ParserServer::new(dir.path(), None, 60));
        server.init_parser(unix_timestamp()).unwrap();

        let data = server.share_stats(9, &[5], &[24, -1]);
        assert_eq!(data["5"][0]["accept"], 0);
        assert_eq!(data["5"][1]["accept"], 0);
    }

    #[tokio::test]
    async fn test_server_status_shape() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ParserServer::new(dir.path(), None, 60));
        server.init_parser(unix_timestamp()).unwrap();

        let status = server.server_status();
        assert_eq!(status["err_no"], 0);
        assert!(status["data"]["pool"]["today"].get("hashrate_t").is_some());
        assert!(status["data"]["pool"]["curr_hour"].get("accept").is_some());
    }
}

//! Core state of the live stats server: the worker/user indices, the
//! share-consumer loop, and the periodic flush/sweep scheduling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use msg_log::{ConsumeError, LogConsumer};
use pool_redis::PoolRedis;
use serde_json::{json, Value};
use sharelog::{Share, SHARE_SIZE};
use sqlx::MySqlPool;
use stats_core::{merge_status, unix_timestamp, WorkerKey, WorkerShares, WorkerStatus};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::{db_flush, redis_flush};

/// Expired index entries are swept at this cadence.
const EXPIRED_CLEAN_INTERVAL: u64 = 60 * 30;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// The three maps guarded by the single index lock. The lock protects the
/// map structure only; per-entry mutation goes through each entry's own
/// mutex.
#[derive(Default)]
pub struct LiveIndexes {
    pub workers: HashMap<WorkerKey, Arc<WorkerShares>>,
    pub users: HashMap<i32, Arc<WorkerShares>>,
    pub user_worker_count: HashMap<i32, u32>,
}

pub struct StatsServer {
    running: AtomicBool,
    /// Set while catching up on history; flushes are held back so stale
    /// zero hashrates never reach the external stores.
    initializing: AtomicBool,
    pub is_inserting: AtomicBool,
    pub is_update_redis: AtomicBool,

    pub indexes: RwLock<LiveIndexes>,
    /// Aggregate across the whole pool, key (0, 0).
    pub pool_shares: WorkerShares,

    pub total_worker_count: AtomicU64,
    pub total_user_count: AtomicU64,
    last_share_time: AtomicU64,
    pub last_flush_time: AtomicU64,

    uptime: u64,
    pub request_count: AtomicU64,
    pub response_bytes: AtomicU64,

    pub config: Config,
    pub db: Option<MySqlPool>,
    pub redis_group: Vec<PoolRedis>,
    pub redis_events: Option<PoolRedis>,
}

impl StatsServer {
    pub fn new(
        config: Config,
        db: Option<MySqlPool>,
        redis_group: Vec<PoolRedis>,
        redis_events: Option<PoolRedis>,
    ) -> Self {
        Self {
            running: AtomicBool::new(true),
            initializing: AtomicBool::new(true),
            is_inserting: AtomicBool::new(false),
            is_update_redis: AtomicBool::new(false),
            indexes: RwLock::new(LiveIndexes::default()),
            pool_shares: WorkerShares::new(),
            total_worker_count: AtomicU64::new(0),
            total_user_count: AtomicU64::new(0),
            last_share_time: AtomicU64::new(0),
            last_flush_time: AtomicU64::new(0),
            uptime: unix_timestamp(),
            request_count: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
            config,
            db,
            redis_group,
            redis_events,
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::Relaxed)
    }

    /// Decode and fold one sharelog payload into the indices.
    pub fn consume_share_payload(&self, payload: &[u8]) {
        if payload.len() != SHARE_SIZE {
            error!(
                "sharelog message size({}) is not: {}",
                payload.len(),
                SHARE_SIZE
            );
            return;
        }
        let share = match Share::decode(payload) {
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
        self.process_share(&share, unix_timestamp());
    }

    pub fn process_share(&self, share: &Share, now: u64) {
        self.last_share_time
            .store(u64::from(share.timestamp), Ordering::Relaxed);

        // too old for every window, observed but dropped
        if now > u64::from(share.timestamp) + stats_core::SLIDING_WINDOW_SECONDS {
            return;
        }
        self.pool_shares.process_share(share, now);

        let key = WorkerKey::new(share.user_id, share.worker_hash_id);

        let (worker_entry, user_entry) = {
            let indexes = self.indexes.read().unwrap();
            (
                indexes.workers.get(&key).cloned(),
                indexes.users.get(&share.user_id).cloned(),
            )
        };

        // mutate in place when present; otherwise build outside the write
        // lock and insert
        let new_worker = match worker_entry {
            Some(entry) => {
                entry.process_share(share, now);
                None
            }
            None => {
                let entry = Arc::new(WorkerShares::new());
                entry.process_share(share, now);
                Some(entry)
            }
        };
        let new_user = match user_entry {
            Some(entry) => {
                entry.process_share(share, now);
                None
            }
            None => {
                let entry = Arc::new(WorkerShares::new());
                entry.process_share(share, now);
                Some(entry)
            }
        };

        if new_worker.is_some() || new_user.is_some() {
            let mut indexes = self.indexes.write().unwrap();
            if let Some(entry) = new_worker {
                indexes.workers.insert(key, entry);
                *indexes.user_worker_count.entry(share.user_id).or_insert(0) += 1;
                self.total_worker_count.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(entry) = new_user {
                indexes.users.insert(share.user_id, entry);
                self.total_user_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every index entry whose last share is a full window old.
    pub fn remove_expired_workers(&self, now: u64) {
        let mut expired_workers = 0usize;
        let mut expired_users = 0usize;

        let mut indexes = self.indexes.write().unwrap();

        let expired_keys: Vec<WorkerKey> = indexes
            .workers
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();
        for key in expired_keys {
            indexes.workers.remove(&key);
            expired_workers += 1;
            self.total_worker_count.fetch_sub(1, Ordering::Relaxed);

            let remove_user = match indexes.user_worker_count.get_mut(&key.user_id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if remove_user {
                indexes.user_worker_count.remove(&key.user_id);
            }
        }

        let expired_users_keys: Vec<i32> = indexes
            .users
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for user_id in expired_users_keys {
            indexes.users.remove(&user_id);
            expired_users += 1;
            self.total_user_count.fetch_sub(1, Ordering::Relaxed);
        }

        drop(indexes);
        info!(
            "removed expired workers: {}, users: {}",
            expired_workers, expired_users
        );
    }

    /// Resolve a batch of keys to statuses. `worker_id == 0` addresses the
    /// user aggregate; unknown keys yield a zeroed status.
    pub fn worker_status_batch(&self, keys: &[WorkerKey], now: u64) -> Vec<WorkerStatus> {
        let entries: Vec<Option<Arc<WorkerShares>>> = {
            let indexes = self.indexes.read().unwrap();
            keys.iter()
                .map(|key| {
                    if key.worker_id == 0 {
                        indexes.users.get(&key.user_id).cloned()
                    } else {
                        indexes.workers.get(key).cloned()
                    }
                })
                .collect()
        };

        entries
            .iter()
            .map(|entry| {
                entry
                    .as_ref()
                    .map(|e| e.status(now))
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn user_worker_count(&self, user_id: i32) -> u32 {
        let indexes = self.indexes.read().unwrap();
        indexes
            .user_worker_count
            .get(&user_id)
            .copied()
            .unwrap_or(0)
    }

    /// The `/` endpoint payload.
    pub fn server_status(&self) -> Value {
        let now = unix_timestamp();
        let pool = self.pool_shares.status(now);

        json!({
            "err_no": 0,
            "err_msg": "",
            "data": {
                "uptime": crate::api::format_uptime(now - self.uptime),
                "request": self.request_count.load(Ordering::Relaxed),
                "repbytes": self.response_bytes.load(Ordering::Relaxed),
                "pool": {
                    "accept": [pool.accept_1m, pool.accept_5m, pool.accept_15m, pool.accept_1h],
                    "reject": [0, 0, pool.reject_15m, pool.reject_1h],
                    "accept_count": pool.accept_count,
                    "workers": self.total_worker_count.load(Ordering::Relaxed),
                    "users": self.total_user_count.load(Ordering::Relaxed),
                },
            },
        })
    }

    /// The `/worker_status` endpoint payload for parsed arguments.
    pub fn worker_status_response(
        &self,
        user_id: i32,
        worker_ids: &[i64],
        is_merge: bool,
    ) -> Value {
        let now = unix_timestamp();
        let keys: Vec<WorkerKey> = worker_ids
            .iter()
            .map(|&worker_id| WorkerKey::new(user_id, worker_id))
            .collect();
        let statuses = self.worker_status_batch(&keys, now);

        let mut data = serde_json::Map::new();
        if is_merge {
            let merged = merge_status(&statuses);
            data.insert("0".to_string(), status_json(&merged, None));
        } else {
            for (key, status) in keys.iter().zip(statuses.iter()) {
                let workers = if key.worker_id == 0 {
                    Some(self.user_worker_count(user_id))
                } else {
                    None
                };
                data.insert(key.worker_id.to_string(), status_json(status, workers));
            }
        }
        Value::Object(data)
    }

    /// The share-consumer loop. Also drives the flush ticks and expiry
    /// sweeps, so consuming and flushing never race on the tick state.
    pub async fn run_consume<C: LogConsumer>(
        self: Arc<Self>,
        mut consumer: C,
    ) -> Result<(), ConsumeError> {
        info!("start sharelog consume loop");
        let mut last_clean = unix_timestamp();
        let mut last_flush_tick = unix_timestamp();
        let flush_interval = self.config.flush_db_interval_secs;

        while self.is_running() {
            let mut no_new_shares = false;
            match consumer.poll(POLL_TIMEOUT).await {
                Ok(Some(message)) => self.consume_share_payload(&message.payload),
                Ok(None) => no_new_shares = true,
                Err(e @ ConsumeError::UnknownTopic(_)) => {
                    error!("consume fatal: {}", e);
                    self.stop();
                    return Err(e);
                }
                Err(e) => {
                    warn!("consume error: {}", e);
                    continue;
                }
            }

            let now = unix_timestamp();

            if self.is_initializing() {
                // don't flush while consuming history shares, or user
                // hashrates would be published as zero after a restart
                if last_flush_tick + flush_interval < now {
                    let last_share = self.last_share_time.load(Ordering::Relaxed);
                    if !no_new_shares && last_share + 60 < now {
                        info!("consuming history shares, last share time: {}", last_share);
                        last_flush_tick = now;
                    } else {
                        self.initializing.store(false, Ordering::Relaxed);
                        info!("initializing done");
                    }
                }
                continue;
            }

            if last_clean + EXPIRED_CLEAN_INTERVAL < now {
                self.remove_expired_workers(now);
                last_clean = now;
            }

            if last_flush_tick + flush_interval < now {
                if self.db.is_some() {
                    db_flush::flush_workers_and_users(self.clone());
                }
                if !self.redis_group.is_empty() {
                    redis_flush::flush_workers_and_users(self.clone());
                }
                last_flush_tick = now;
            }
        }

        info!("stop sharelog consume loop");
        Ok(())
    }
}

fn status_json(status: &WorkerStatus, workers: Option<u32>) -> Value {
    let mut obj = json!({
        "accept": [status.accept_1m, status.accept_5m, status.accept_15m, status.accept_1h],
        "reject": [0, 0, status.reject_15m, status.reject_1h],
        "accept_count": status.accept_count,
        "last_share_ip": std::net::Ipv4Addr::from(status.last_share_ip).to_string(),
        "last_share_time": status.last_share_time,
    });
    if let Some(count) = workers {
        obj["workers"] = json!(count);
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelog::ShareResult;

    fn test_server() -> StatsServer {
        StatsServer::new(Config::for_tests(), None, Vec::new(), None)
    }

    fn share(user: i32, worker: i64, ts: u32, result: ShareResult, weight: u64) -> Share {
        Share {
            job_id: 1,
            worker_hash_id: worker,
            user_id: user,
            ip: 0x0a000001,
            result,
            timestamp: ts,
            share: weight,
            block_bits: 0x1d00ffff,
        }
    }

    #[test]
    fn test_ingest_updates_worker_and_user() {
        let server = test_server();
        let now: u64 = 1_468_331_100;

        for _ in 0..100 {
            server.process_share(&share(7, 42, now as u32 - 30, ShareResult::Accept, 1), now);
        }

        let statuses = server.worker_status_batch(&[WorkerKey::new(7, 42)], now);
        assert_eq!(statuses[0].accept_1m, 100);
        assert_eq!(statuses[0].accept_5m, 100);
        assert_eq!(statuses[0].accept_15m, 100);
        assert_eq!(statuses[0].accept_1h, 100);
        assert_eq!(statuses[0].accept_count, 100);

        // the user aggregate and the pool see the same stream
        let user = server.worker_status_batch(&[WorkerKey::new(7, 0)], now);
        assert_eq!(user[0].accept_1h, 100);
        assert_eq!(server.pool_shares.status(now).accept_1h, 100);

        assert_eq!(server.total_worker_count.load(Ordering::Relaxed), 1);
        assert_eq!(server.total_user_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_two_workers_roll_up_to_user() {
        let server = test_server();
        let now: u64 = 1_468_331_100;

        for _ in 0..100 {
            server.process_share(&share(7, 42, now as u32 - 30, ShareResult::Accept, 1), now);
        }
        for _ in 0..50 {
            server.process_share(&share(7, 43, now as u32 - 60, ShareResult::Reject, 1), now);
        }

        let user = server.worker_status_batch(&[WorkerKey::new(7, 0)], now);
        assert_eq!(user[0].accept_1h, 100);
        assert_eq!(user[0].reject_1h, 50);
        assert_eq!(server.user_worker_count(7), 2);
        assert_eq!(server.total_worker_count.load(Ordering::Relaxed), 2);
        assert_eq!(server.total_user_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_counts_match_index_sizes() {
        let server = test_server();
        let now: u64 = 1_468_331_100;

        for user in 1..=3 {
            for worker in 1..=4 {
                server.process_share(
                    &share(user, worker, now as u32, ShareResult::Accept, 1),
                    now,
                );
            }
        }

        let indexes = server.indexes.read().unwrap();
        assert_eq!(
            server.total_worker_count.load(Ordering::Relaxed) as usize,
            indexes.workers.len()
        );
        let counted: u32 = indexes.user_worker_count.values().sum();
        assert_eq!(server.total_worker_count.load(Ordering::Relaxed), u64::from(counted));
        assert_eq!(
            server.total_user_count.load(Ordering::Relaxed) as usize,
            indexes.users.len()
        );
    }

    #[test]
    fn test_expiry_sweep_is_idempotent() {
        let server = test_server();
        let now: u64 = 1_468_331_100;

        server.process_share(&share(7, 42, now as u32, ShareResult::Accept, 1), now);
        server.process_share(&share(8, 50, (now - 7200) as u32, ShareResult::Accept, 1), now - 7200);

        let later = now + 1;
        server.remove_expired_workers(later);

        {
            let indexes = server.indexes.read().unwrap();
            assert_eq!(indexes.workers.len(), 1);
            assert!(indexes.workers.contains_key(&WorkerKey::new(7, 42)));
            assert_eq!(indexes.users.len(), 1);
            assert!(!indexes.user_worker_count.contains_key(&8));
        }
        assert_eq!(server.total_worker_count.load(Ordering::Relaxed), 1);

        // second sweep with no intervening shares changes nothing
        server.remove_expired_workers(later);
        {
            let indexes = server.indexes.read().unwrap();
            assert_eq!(indexes.workers.len(), 1);
            assert_eq!(indexes.users.len(), 1);
        }
        assert_eq!(server.total_worker_count.load(Ordering::Relaxed), 1);
        assert_eq!(server.total_user_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_worker_status_merge_response() {
        let server = test_server();
        let now = unix_timestamp();

        for _ in 0..10 {
            server.process_share(&share(7, 42, now as u32 - 5, ShareResult::Accept, 2), now);
        }
        for _ in 0..4 {
            server.process_share(&share(7, 43, now as u32 - 3, ShareResult::Accept, 1), now);
        }

        let merged = server.worker_status_response(7, &[42, 43], true);
        assert_eq!(merged["0"]["accept"][3], 24);
        assert_eq!(merged["0"]["accept_count"], 14);

        let split = server.worker_status_response(7, &[42, 0], false);
        assert_eq!(split["42"]["accept"][3], 20);
        assert_eq!(split["0"]["accept"][3], 24);
        // worker_id 0 carries the live worker count
        assert_eq!(split["0"]["workers"], 2);
        assert_eq!(split["42"]["last_share_ip"], "10.0.0.1");
    }

    #[test]
    fn test_invalid_payloads_dropped() {
        let server = test_server();
        server.consume_share_payload(&[0u8; 10]);
        server.consume_share_payload(&[0u8; SHARE_SIZE]); // all-zero share is invalid
        assert_eq!(server.total_worker_count.load(Ordering::Relaxed), 0);
    }
}

//! Periodic flush of the live indices into the key/value store.
//!
//! A pool of connections splits the worker and user sets by index range;
//! each slice is written as one pipeline of HMSET/EXPIRE/PUBLISH commands,
//! followed by ZADD batches for the enabled sorted-set indexes.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use pool_redis::{PoolRedis, ReplyClass};
use stats_core::{unix_timestamp, WorkerKey, WorkerStatus};
use tracing::{error, info, warn};

use crate::config::{self, Config};
use crate::server::StatsServer;

pub fn key_mining_worker(prefix: &str, user_id: i32, worker_id: i64) -> String {
    format!("{}mining_workers/pu/{}/wk/{}", prefix, user_id, worker_id)
}

pub fn key_mining_user(prefix: &str, user_id: i32) -> String {
    format!("{}mining_workers/pu/{}/all", prefix, user_id)
}

pub fn key_index(prefix: &str, user_id: i32, index_name: &str) -> String {
    format!("{}mining_workers/pu/{}/sort/{}", prefix, user_id, index_name)
}

/// Slice size for splitting `n` entries across `c` connections. Rounds up
/// so the tail entries are covered when `n % c != 0`.
pub fn partition_size(n: usize, c: usize) -> usize {
    if c == 0 {
        return n;
    }
    n / c + usize::from(n % c != 0)
}

type MetricFn = fn(&WorkerStatus) -> u64;

/// The numeric sorted-set metrics, their policy bits, and how to read
/// them off a status snapshot.
fn index_metrics() -> Vec<(u32, &'static str, MetricFn)> {
    let metrics: Vec<(u32, &'static str, MetricFn)> = vec![
        (config::INDEX_ACCEPT_1M, "accept_1m", |s| s.accept_1m),
        (config::INDEX_ACCEPT_5M, "accept_5m", |s| s.accept_5m),
        (config::INDEX_ACCEPT_15M, "accept_15m", |s| s.accept_15m),
        (config::INDEX_REJECT_15M, "reject_15m", |s| s.reject_15m),
        (config::INDEX_ACCEPT_1H, "accept_1h", |s| s.accept_1h),
        (config::INDEX_REJECT_1H, "reject_1h", |s| s.reject_1h),
        (config::INDEX_ACCEPT_COUNT, "accept_count", |s| {
            u64::from(s.accept_count)
        }),
        (config::INDEX_LAST_SHARE_IP, "last_share_ip", |s| {
            u64::from(s.last_share_ip)
        }),
        (config::INDEX_LAST_SHARE_TIME, "last_share_time", |s| {
            u64::from(s.last_share_time)
        }),
    ];
    metrics
}

/// Kick off one Redis flush tick. Skipped while the previous tick still
/// runs; the guard is always cleared afterwards.
pub fn flush_workers_and_users(server: Arc<StatsServer>) {
    info!("flush to redis...");
    if server.is_update_redis.swap(true, Ordering::SeqCst) {
        warn!("last redis flush is not finished yet, ignore");
        return;
    }

    tokio::spawn(async move {
        flush_coordinator(&server).await;
        server.is_update_redis.store(false, Ordering::SeqCst);
    });
}

async fn flush_coordinator(server: &Arc<StatsServer>) {
    let began = unix_timestamp();
    let now = unix_timestamp();

    // one consistent snapshot, taken under the read lock, split across
    // the connection pool by index range
    let (workers, users) = {
        let indexes = server.indexes.read().unwrap();

        let mut workers: Vec<(WorkerKey, WorkerStatus)> = indexes
            .workers
            .iter()
            .map(|(key, entry)| (*key, entry.status(now)))
            .collect();
        workers.sort_by_key(|(key, _)| (key.user_id, key.worker_id));

        let mut users: Vec<(i32, u32, WorkerStatus)> = indexes
            .users
            .iter()
            .map(|(&user_id, entry)| {
                let count = indexes.user_worker_count.get(&user_id).copied().unwrap_or(0);
                (user_id, count, entry.status(now))
            })
            .collect();
        users.sort_by_key(|(user_id, _, _)| *user_id);

        (workers, users)
    };

    let connections = server.redis_group.len();
    let worker_step = partition_size(workers.len(), connections);
    let user_step = partition_size(users.len(), connections);

    let mut tasks = Vec::new();
    for (step, redis) in server.redis_group.iter().enumerate() {
        let worker_slice: Vec<_> = workers
            .iter()
            .skip(step * worker_step)
            .take(worker_step)
            .cloned()
            .collect();
        let user_slice: Vec<_> = users
            .iter()
            .skip(step * user_step)
            .take(user_step)
            .cloned()
            .collect();

        let server = server.clone();
        let redis = redis.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = redis.ping().await {
                error!("can't connect to pool redis {}: {}", step, e);
                return;
            }
            flush_worker_slice(&server.config, &redis, step, &worker_slice).await;
            flush_user_slice(&server.config, &redis, step, &user_slice).await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }

    info!(
        "flush to redis... done, {} workers, {} users, time: {}s",
        workers.len(),
        users.len(),
        unix_timestamp() - began
    );
}

fn push_status_fields(
    pipe: &mut redis::Pipeline,
    key: &str,
    status: &WorkerStatus,
    now: u64,
    worker_count: Option<u32>,
) {
    let cmd = pipe.cmd("HMSET").arg(key);
    if let Some(count) = worker_count {
        cmd.arg("worker_count").arg(count);
    }
    cmd.arg("accept_1m")
        .arg(status.accept_1m)
        .arg("accept_5m")
        .arg(status.accept_5m)
        .arg("accept_15m")
        .arg(status.accept_15m)
        .arg("reject_15m")
        .arg(status.reject_15m)
        .arg("accept_1h")
        .arg(status.accept_1h)
        .arg("reject_1h")
        .arg(status.reject_1h)
        .arg("accept_count")
        .arg(status.accept_count)
        .arg("last_share_ip")
        .arg(Ipv4Addr::from(status.last_share_ip).to_string())
        .arg("last_share_time")
        .arg(status.last_share_time)
        .arg("updated_at")
        .arg(now);
}

async fn flush_worker_slice(
    config: &Config,
    redis: &PoolRedis,
    step: usize,
    workers: &[(WorkerKey, WorkerStatus)],
) {
    if workers.is_empty() {
        info!("redis (thread {}): no active workers", step);
        return;
    }
    let now = unix_timestamp();

    let mut pipe = redis::pipe();
    let mut expected = Vec::new();
    let mut index_buffer: HashMap<(i32, &'static str), Vec<(u64, i64)>> = HashMap::new();

    for (key, status) in workers {
        let rkey = key_mining_worker(&config.redis_key_prefix, key.user_id, key.worker_id);

        push_status_fields(&mut pipe, &rkey, status, now, None);
        expected.push(ReplyClass::Status);

        if config.redis_key_expire > 0 {
            pipe.cmd("EXPIRE").arg(&rkey).arg(config.redis_key_expire);
            expected.push(ReplyClass::Integer);
        }
        if config.redis_publish_policy & config::PUBLISH_WORKER_UPDATE != 0 {
            pipe.cmd("PUBLISH").arg(&rkey).arg("1");
            expected.push(ReplyClass::Integer);
        }
        if config.redis_index_policy != config::INDEX_NONE {
            for (bit, name, metric) in index_metrics() {
                if config.redis_index_policy & bit != 0 {
                    index_buffer
                        .entry((key.user_id, name))
                        .or_default()
                        .push((metric(status), key.worker_id));
                }
            }
        }
    }

    let context = format!("worker flush (thread {})", step);
    if let Err(e) = redis.run_pipeline(&pipe, &expected, &context).await {
        error!("redis (thread {}) worker flush failed: {}", step, e);
        return;
    }

    flush_index_buffer(config, redis, step, index_buffer).await;
    info!(
        "flush workers to redis (thread {}) done, workers: {}",
        step,
        workers.len()
    );
}

async fn flush_user_slice(
    config: &Config,
    redis: &PoolRedis,
    step: usize,
    users: &[(i32, u32, WorkerStatus)],
) {
    if users.is_empty() {
        info!("redis (thread {}): no active users", step);
        return;
    }
    let now = unix_timestamp();

    let mut pipe = redis::pipe();
    let mut expected = Vec::new();

    for (user_id, worker_count, status) in users {
        let rkey = key_mining_user(&config.redis_key_prefix, *user_id);

        push_status_fields(&mut pipe, &rkey, status, now, Some(*worker_count));
        expected.push(ReplyClass::Status);

        if config.redis_key_expire > 0 {
            pipe.cmd("EXPIRE").arg(&rkey).arg(config.redis_key_expire);
            expected.push(ReplyClass::Integer);
        }
        if config.redis_publish_policy & config::PUBLISH_USER_UPDATE != 0 {
            pipe.cmd("PUBLISH").arg(&rkey).arg(worker_count.to_string());
            expected.push(ReplyClass::Integer);
        }
    }

    let context = format!("user flush (thread {})", step);
    if let Err(e) = redis.run_pipeline(&pipe, &expected, &context).await {
        error!("redis (thread {}) user flush failed: {}", step, e);
        return;
    }
    info!(
        "flush users to redis (thread {}) done, users: {}",
        step,
        users.len()
    );
}

async fn flush_index_buffer(
    config: &Config,
    redis: &PoolRedis,
    step: usize,
    buffer: HashMap<(i32, &'static str), Vec<(u64, i64)>>,
) {
    if buffer.is_empty() {
        return;
    }

    let mut pipe = redis::pipe();
    let mut expected = Vec::new();
    for ((user_id, name), entries) in &buffer {
        let cmd = pipe
            .cmd("ZADD")
            .arg(key_index(&config.redis_key_prefix, *user_id, name));
        for (score, worker_id) in entries {
            cmd.arg(*score).arg(*worker_id);
        }
        expected.push(ReplyClass::Integer);
    }

    let context = format!("index flush (thread {})", step);
    if let Err(e) = redis.run_pipeline(&pipe, &expected, &context).await {
        error!("redis (thread {}) index flush failed: {}", step, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layouts() {
        assert_eq!(
            key_mining_worker("bpool/", 7, 42),
            "bpool/mining_workers/pu/7/wk/42"
        );
        assert_eq!(key_mining_user("", 7), "mining_workers/pu/7/all");
        assert_eq!(
            key_index("bpool/", 7, "accept_1h"),
            "bpool/mining_workers/pu/7/sort/accept_1h"
        );
    }

    #[test]
    fn test_partition_covers_tail() {
        // 10 workers over 3 connections: [0,4), [4,8), [8,10)
        let step = partition_size(10, 3);
        assert_eq!(step, 4);

        let items: Vec<usize> = (0..10).collect();
        let mut seen: Vec<&usize> = Vec::new();
        for thread in 0..3 {
            let slice: Vec<_> = items.iter().skip(thread * step).take(step).collect();
            match thread {
                0 => assert_eq!(slice.len(), 4),
                1 => assert_eq!(slice.len(), 4),
                _ => assert_eq!(slice.len(), 2),
            }
            seen.extend(slice);
        }
        // every entry is flushed exactly once
        assert_eq!(seen.len(), 10);

        assert_eq!(partition_size(9, 3), 3);
        assert_eq!(partition_size(0, 3), 0);
        assert_eq!(partition_size(5, 1), 5);
    }

    #[test]
    fn test_index_metrics_cover_policy_bits() {
        let metrics = index_metrics();
        assert_eq!(metrics.len(), 9);

        let status = WorkerStatus {
            accept_1m: 1,
            accept_5m: 2,
            accept_15m: 3,
            accept_1h: 4,
            reject_15m: 5,
            reject_1h: 6,
            accept_count: 7,
            last_share_ip: 8,
            last_share_time: 9,
        };
        let by_name: HashMap<&str, u64> = metrics
            .iter()
            .map(|(_, name, metric)| (*name, metric(&status)))
            .collect();
        assert_eq!(by_name["accept_1m"], 1);
        assert_eq!(by_name["reject_1h"], 6);
        assert_eq!(by_name["accept_count"], 7);
        assert_eq!(by_name["last_share_time"], 9);
    }
}

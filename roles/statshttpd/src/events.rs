//! Common-events consumer: JSON events from the `common_events` topic.
//! Only `worker_update` is handled; anything else is accepted and
//! ignored.

use std::sync::Arc;
use std::time::Duration;

use msg_log::{ConsumeError, LogConsumer};
use pool_db::DbError;
use pool_redis::{alpha_num_rank, PoolRedis, ReplyClass};
use serde::Deserialize;
use sqlx::MySqlPool;
use stats_core::unix_timestamp;
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::redis_flush::{key_index, key_mining_worker};
use crate::server::StatsServer;

const POLL_TIMEOUT: Duration = Duration::from_secs(3);

/// Worker names and agents are capped at this many characters.
const MAX_WORKER_NAME_LENGTH: usize = 20;

#[derive(Debug, Deserialize)]
struct CommonEvent {
    #[serde(rename = "type")]
    kind: String,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WorkerUpdate {
    user_id: i32,
    worker_id: i64,
    worker_name: String,
    miner_agent: String,
}

/// Normalise a submitted worker name: trim ASCII whitespace, strip
/// control characters, bound the length.
pub fn filter_worker_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_WORKER_NAME_LENGTH)
        .collect()
}

pub async fn run_consume<C: LogConsumer>(server: Arc<StatsServer>, mut consumer: C) {
    info!("start common events consume loop");

    while server.is_running() {
        match consumer.poll(POLL_TIMEOUT).await {
            Ok(Some(message)) => consume_common_event(&server, &message.payload).await,
            Ok(None) => continue,
            Err(e @ ConsumeError::UnknownTopic(_)) => {
                error!("consume fatal: {}", e);
                server.stop();
                return;
            }
            Err(e) => {
                warn!("consume error: {}", e);
                continue;
            }
        }
    }
    info!("stop common events consume loop");
}

async fn consume_common_event(server: &Arc<StatsServer>, payload: &[u8]) {
    let event: CommonEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("decode common event failure: {}", e);
            return;
        }
    };
    if event.kind != "worker_update" {
        debug!("ignoring common event type: {}", event.kind);
        return;
    }

    let update: WorkerUpdate = match serde_json::from_value(event.content) {
        Ok(update) => update,
        Err(e) => {
            error!("common event `worker_update` missing some fields: {}", e);
            return;
        }
    };

    let worker_name = filter_worker_name(&update.worker_name);
    let miner_agent = filter_worker_name(&update.miner_agent);

    if let Some(pool) = &server.db {
        if let Err(e) = update_worker_status_db(
            pool,
            update.user_id,
            update.worker_id,
            &worker_name,
            &miner_agent,
        )
        .await
        {
            error!("update worker name to DB failed: {}", e);
        }
    }

    if let Some(redis) = &server.redis_events {
        update_worker_status_redis(
            &server.config,
            redis,
            update.user_id,
            update.worker_id,
            &worker_name,
            &miner_agent,
        )
        .await;
    }
}

/// Write the worker's name/agent into `mining_workers`. A row sitting in
/// group 0 was soft-deleted and moves back to the account's default
/// group. A missing row is inserted with `ON DUPLICATE KEY UPDATE`, since
/// the statistics flusher may insert the same key concurrently.
async fn update_worker_status_db(
    pool: &MySqlPool,
    user_id: i32,
    worker_id: i64,
    worker_name: &str,
    miner_agent: &str,
) -> Result<(), DbError> {
    let now_str = chrono::Utc::now().format("%F %T").to_string();

    let existing: Option<(i32,)> =
        sqlx::query_as("SELECT `group_id` FROM `mining_workers` WHERE `puid`=? AND `worker_id`=?")
            .bind(user_id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(DbError::from)?;

    match existing {
        Some((group_id,)) => {
            let group_id = if group_id == 0 { -user_id } else { group_id };
            sqlx::query(
                "UPDATE `mining_workers` SET `group_id`=?, `worker_name`=?, `miner_agent`=?, \
                 `updated_at`=? WHERE `puid`=? AND `worker_id`=?",
            )
            .bind(group_id)
            .bind(worker_name)
            .bind(miner_agent)
            .bind(&now_str)
            .bind(user_id)
            .bind(worker_id)
            .execute(pool)
            .await
            .map_err(DbError::from)?;
        }
        None => {
            sqlx::query(
                "INSERT INTO `mining_workers`(`puid`,`worker_id`,`group_id`,`worker_name`,\
                 `miner_agent`,`created_at`,`updated_at`) VALUES(?,?,?,?,?,?,?) \
                 ON DUPLICATE KEY UPDATE `worker_name`=?, `miner_agent`=?, `updated_at`=?",
            )
            .bind(user_id)
            .bind(worker_id)
            .bind(-user_id) // default group id
            .bind(worker_name)
            .bind(miner_agent)
            .bind(&now_str)
            .bind(&now_str)
            .bind(worker_name)
            .bind(miner_agent)
            .bind(&now_str)
            .execute(pool)
            .await
            .map_err(DbError::from)?;
        }
    }
    Ok(())
}

/// Mirror the name/agent update into the key/value store, including the
/// string-metric sorted sets and the update notification.
async fn update_worker_status_redis(
    config: &Config,
    redis: &PoolRedis,
    user_id: i32,
    worker_id: i64,
    worker_name: &str,
    miner_agent: &str,
) {
    let key = key_mining_worker(&config.redis_key_prefix, user_id, worker_id);
    let now = unix_timestamp();

    let mut pipe = redis::pipe();
    let mut expected = Vec::new();

    pipe.cmd("HMSET")
        .arg(&key)
        .arg("worker_name")
        .arg(worker_name)
        .arg("miner_agent")
        .arg(miner_agent)
        .arg("updated_at")
        .arg(now);
    expected.push(ReplyClass::Status);

    if config.redis_key_expire > 0 {
        pipe.cmd("EXPIRE").arg(&key).arg(config.redis_key_expire);
        expected.push(ReplyClass::Integer);
    }

    if config.redis_index_policy & config::INDEX_WORKER_NAME != 0 {
        pipe.cmd("ZADD")
            .arg(key_index(&config.redis_key_prefix, user_id, "worker_name"))
            .arg(alpha_num_rank(worker_name))
            .arg(worker_id);
        expected.push(ReplyClass::Integer);
    }
    if config.redis_index_policy & config::INDEX_MINER_AGENT != 0 {
        pipe.cmd("ZADD")
            .arg(key_index(&config.redis_key_prefix, user_id, "miner_agent"))
            .arg(alpha_num_rank(miner_agent))
            .arg(worker_id);
        expected.push(ReplyClass::Integer);
    }

    if config.redis_publish_policy & config::PUBLISH_WORKER_UPDATE != 0 {
        // "0" marks a name update rather than a stats refresh
        pipe.cmd("PUBLISH").arg(&key).arg("0");
        expected.push(ReplyClass::Integer);
    }

    if let Err(e) = redis.run_pipeline(&pipe, &expected, "worker update").await {
        error!("update worker name to redis failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_worker_name() {
        assert_eq!(filter_worker_name("  rig-01  "), "rig-01");
        assert_eq!(filter_worker_name("rig\x01\x02-01"), "rig-01");
        assert_eq!(filter_worker_name("\tminer\n"), "miner");
        assert_eq!(
            filter_worker_name("a-very-long-worker-name-that-keeps-going"),
            "a-very-long-worker-n"
        );
        assert_eq!(filter_worker_name(""), "");
    }

    #[test]
    fn test_common_event_parsing() {
        let payload = br#"{"type":"worker_update","content":{"user_id":7,"worker_id":42,"worker_name":"rig-01","miner_agent":"cgminer/4.10"}}"#;
        let event: CommonEvent = serde_json::from_slice(payload).unwrap();
        assert_eq!(event.kind, "worker_update");

        let update: WorkerUpdate = serde_json::from_value(event.content).unwrap();
        assert_eq!(update.user_id, 7);
        assert_eq!(update.worker_id, 42);
        assert_eq!(update.worker_name, "rig-01");
        assert_eq!(update.miner_agent, "cgminer/4.10");
    }

    #[test]
    fn test_other_event_types_parse_but_are_ignorable() {
        let payload = br#"{"type":"miner_connect","content":{"ip":"10.0.0.1"}}"#;
        let event: CommonEvent = serde_json::from_slice(payload).unwrap();
        assert_ne!(event.kind, "worker_update");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let payload = br#"{"type":"worker_update","content":{"user_id":7}}"#;
        let event: CommonEvent = serde_json::from_slice(payload).unwrap();
        assert!(serde_json::from_value::<WorkerUpdate>(event.content).is_err());
    }
}

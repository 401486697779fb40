use redis::aio::ConnectionManager;
use redis::{Client, Pipeline, Value};
use tracing::info;

use crate::error::RedisError;

/// Reply kind expected from one pipelined command. Used to validate
/// pipeline responses per command class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// Simple-string status reply, must be "OK" (HMSET).
    Status,
    /// Integer reply (EXPIRE, PUBLISH, ZADD).
    Integer,
}

fn matches_class(value: &Value, class: ReplyClass) -> bool {
    match class {
        ReplyClass::Status => matches!(value, Value::Okay)
            || matches!(value, Value::SimpleString(s) if s == "OK"),
        ReplyClass::Integer => matches!(value, Value::Int(_)),
    }
}

/// One logical connection to the key/value store. Cloning shares the
/// underlying multiplexed connection; independent flusher connections are
/// made with separate `new` calls.
#[derive(Clone)]
pub struct PoolRedis {
    manager: ConnectionManager,
}

impl PoolRedis {
    pub async fn new(redis_url: &str) -> Result<Self, RedisError> {
        let client =
            Client::open(redis_url).map_err(|e| RedisError::ConnectionError(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisError::ConnectionError(e.to_string()))?;
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<(), RedisError> {
        redis::cmd("PING")
            .query_async::<()>(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)
    }

    /// Drain a pipeline and validate each reply against its expected
    /// class. Mismatched replies are logged and counted, not fatal; only
    /// transport failures return an error.
    ///
    /// `expected` must carry one entry per command in the pipeline.
    pub async fn run_pipeline(
        &self,
        pipe: &Pipeline,
        expected: &[ReplyClass],
        context: &str,
    ) -> Result<usize, RedisError> {
        let replies: Vec<Value> = pipe
            .query_async(&mut self.manager.clone())
            .await
            .map_err(RedisError::from)?;

        let mut mismatches = 0;
        for (i, (reply, class)) in replies.iter().zip(expected.iter()).enumerate() {
            if !matches_class(reply, *class) {
                mismatches += 1;
                info!(
                    "redis {} reply mismatch, item index: {}, expected: {:?}, reply: {:?}",
                    context, i, class, reply
                );
            }
        }
        Ok(mismatches)
    }
}

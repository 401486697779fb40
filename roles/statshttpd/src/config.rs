use serde::Deserialize;
use std::{env, fs};

// redis_publish_policy bits
pub const PUBLISH_NONE: u32 = 0;
pub const PUBLISH_WORKER_UPDATE: u32 = 1;
pub const PUBLISH_USER_UPDATE: u32 = 2;

// redis_index_policy bits, one per sorted-set metric
pub const INDEX_NONE: u32 = 0;
pub const INDEX_ACCEPT_1M: u32 = 1;
pub const INDEX_ACCEPT_5M: u32 = 2;
pub const INDEX_ACCEPT_15M: u32 = 4;
pub const INDEX_REJECT_15M: u32 = 8;
pub const INDEX_ACCEPT_1H: u32 = 16;
pub const INDEX_REJECT_1H: u32 = 32;
pub const INDEX_ACCEPT_COUNT: u32 = 64;
pub const INDEX_LAST_SHARE_IP: u32 = 128;
pub const INDEX_LAST_SHARE_TIME: u32 = 256;
pub const INDEX_WORKER_NAME: u32 = 512;
pub const INDEX_MINER_AGENT: u32 = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub sharelog_listen_address: String,
    pub events_listen_address: String,
    pub httpd_listen_address: String,
    pub mysql_url: Option<String>,
    pub redis_url: Option<String>,
    pub redis_concurrency: u32,
    pub redis_key_prefix: String,
    pub redis_key_expire: i64,
    pub redis_publish_policy: u32,
    pub redis_index_policy: u32,
    pub flush_db_interval_secs: u64,
    pub file_last_flush_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatshttpdConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    db: DbConfig,
    #[serde(default)]
    redis: RedisConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    sharelog_listen_address: Option<String>,
    events_listen_address: Option<String>,
    httpd_listen_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sharelog_listen_address: Some("127.0.0.1:9095".to_string()),
            events_listen_address: Some("127.0.0.1:9096".to_string()),
            httpd_listen_address: Some("127.0.0.1:9097".to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DbConfig {
    mysql_url: Option<String>,
    flush_db_interval_secs: Option<u64>,
    file_last_flush_time: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RedisConfig {
    url: Option<String>,
    concurrency: Option<u32>,
    key_prefix: Option<String>,
    key_expire: Option<i64>,
    publish_policy: Option<u32>,
    index_policy: Option<u32>,
}

impl Config {
    pub fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = env::args().collect();

        let config_path = args
            .iter()
            .position(|arg| arg == "--config" || arg == "-c")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str());

        let config_str = config_path
            .map(fs::read_to_string)
            .transpose()?
            .unwrap_or_default();
        let file_config: StatshttpdConfig = if config_str.is_empty() {
            StatshttpdConfig {
                server: ServerConfig::default(),
                db: DbConfig::default(),
                redis: RedisConfig::default(),
            }
        } else {
            toml::from_str(&config_str)?
        };

        let httpd_listen_address = args
            .iter()
            .position(|arg| arg == "--httpd-address" || arg == "-h")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .or(file_config.server.httpd_listen_address)
            .ok_or("Missing required config: server.httpd_listen_address")?;

        let sharelog_listen_address = file_config
            .server
            .sharelog_listen_address
            .ok_or("Missing required config: server.sharelog_listen_address")?;
        let events_listen_address = file_config
            .server
            .events_listen_address
            .ok_or("Missing required config: server.events_listen_address")?;

        Ok(Config {
            sharelog_listen_address,
            events_listen_address,
            httpd_listen_address,
            mysql_url: file_config.db.mysql_url,
            redis_url: file_config.redis.url,
            redis_concurrency: file_config.redis.concurrency.unwrap_or(1).max(1),
            redis_key_prefix: file_config.redis.key_prefix.unwrap_or_default(),
            redis_key_expire: file_config.redis.key_expire.unwrap_or(0),
            redis_publish_policy: file_config.redis.publish_policy.unwrap_or(PUBLISH_NONE),
            redis_index_policy: file_config.redis.index_policy.unwrap_or(INDEX_NONE),
            flush_db_interval_secs: file_config.db.flush_db_interval_secs.unwrap_or(20),
            file_last_flush_time: file_config.db.file_last_flush_time,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            sharelog_listen_address: "127.0.0.1:0".to_string(),
            events_listen_address: "127.0.0.1:0".to_string(),
            httpd_listen_address: "127.0.0.1:0".to_string(),
            mysql_url: None,
            redis_url: None,
            redis_concurrency: 3,
            redis_key_prefix: String::new(),
            redis_key_expire: 0,
            redis_publish_policy: PUBLISH_NONE,
            redis_index_policy: INDEX_NONE,
            flush_db_interval_secs: 20,
            file_last_flush_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_deserialization() {
        let toml_str = r#"
            [server]
            sharelog_listen_address = "127.0.0.1:9095"
            events_listen_address = "127.0.0.1:9096"
            httpd_listen_address = "0.0.0.0:8080"

            [db]
            mysql_url = "mysql://pool:pw@127.0.0.1/pooldb"
            flush_db_interval_secs = 15
            file_last_flush_time = "/tmp/statshttpd_flush"

            [redis]
            url = "redis://127.0.0.1/"
            concurrency = 4
            key_prefix = "bpool/"
            key_expire = 7200
            publish_policy = 3
            index_policy = 511
        "#;
        let config: StatshttpdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.redis.concurrency, Some(4));
        assert_eq!(config.redis.key_prefix, Some("bpool/".to_string()));
        assert_eq!(config.redis.publish_policy, Some(3));
        assert_eq!(config.db.flush_db_interval_secs, Some(15));
    }

    #[test]
    fn test_policy_bits_are_distinct() {
        let bits = [
            INDEX_ACCEPT_1M,
            INDEX_ACCEPT_5M,
            INDEX_ACCEPT_15M,
            INDEX_REJECT_15M,
            INDEX_ACCEPT_1H,
            INDEX_REJECT_1H,
            INDEX_ACCEPT_COUNT,
            INDEX_LAST_SHARE_IP,
            INDEX_LAST_SHARE_TIME,
            INDEX_WORKER_NAME,
            INDEX_MINER_AGENT,
        ];
        let mut combined = 0u32;
        for bit in bits {
            assert_eq!(combined & bit, 0);
            combined |= bit;
        }
    }
}

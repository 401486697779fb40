use serde::Deserialize;
use std::{env, fs};

#[derive(Debug, Clone)]
pub struct Config {
    pub httpd_listen_address: String,
    pub data_dir: String,
    pub mysql_url: Option<String>,
    pub flush_db_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SlparserConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    sharelog: SharelogConfig,
    #[serde(default)]
    db: DbConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    httpd_listen_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            httpd_listen_address: Some("127.0.0.1:9093".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SharelogConfig {
    data_dir: Option<String>,
}

impl Default for SharelogConfig {
    fn default() -> Self {
        Self {
            data_dir: Some("./sharelog".to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DbConfig {
    mysql_url: Option<String>,
    flush_db_interval_secs: Option<u64>,
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
        let file_config: SlparserConfig = if config_str.is_empty() {
            SlparserConfig {
                server: ServerConfig::default(),
                sharelog: SharelogConfig::default(),
                db: DbConfig::default(),
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

        let data_dir = args
            .iter()
            .position(|arg| arg == "--data-dir" || arg == "-d")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .or(file_config.sharelog.data_dir)
            .ok_or("Missing required config: sharelog.data_dir")?;

        Ok(Config {
            httpd_listen_address,
            data_dir,
            mysql_url: file_config.db.mysql_url,
            flush_db_interval_secs: file_config.db.flush_db_interval_secs.unwrap_or(30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_deserialization() {
        let toml_str = r#"
            [server]
            httpd_listen_address = "0.0.0.0:8081"

            [sharelog]
            data_dir = "/data/sharelog"

            [db]
            mysql_url = "mysql://pool:pw@127.0.0.1/pooldb"
            flush_db_interval_secs = 15
        "#;
        let config: SlparserConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.server.httpd_listen_address,
            Some("0.0.0.0:8081".to_string())
        );
        assert_eq!(config.sharelog.data_dir, Some("/data/sharelog".to_string()));
        assert_eq!(
            config.db.mysql_url,
            Some("mysql://pool:pw@127.0.0.1/pooldb".to_string())
        );
        assert_eq!(config.db.flush_db_interval_secs, Some(15));
    }

    #[test]
    fn test_db_section_optional() {
        let config: SlparserConfig = toml::from_str("[sharelog]\ndata_dir = \"/x\"\n").unwrap();
        assert!(config.db.mysql_url.is_none());
        assert!(config.db.flush_db_interval_secs.is_none());
    }
}

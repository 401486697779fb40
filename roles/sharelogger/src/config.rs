use serde::Deserialize;
use std::{env, fs};

#[derive(Debug, Clone)]
pub struct Config {
    pub sharelog_listen_address: String,
    pub data_dir: String,
    pub consumer_group: String,
}

#[derive(Debug, Deserialize)]
struct ShareloggerConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    sharelog: SharelogConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    sharelog_listen_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sharelog_listen_address: Some("127.0.0.1:9091".to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SharelogConfig {
    data_dir: Option<String>,
    consumer_group: Option<String>,
}

impl Default for SharelogConfig {
    fn default() -> Self {
        Self {
            data_dir: Some("./sharelog".to_string()),
            consumer_group: Some("sharelogger".to_string()),
        }
    }
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
            .map(|p| fs::read_to_string(p))
            .transpose()?
            .unwrap_or_default();
        let file_config: ShareloggerConfig = if config_str.is_empty() {
            ShareloggerConfig {
                server: ServerConfig::default(),
                sharelog: SharelogConfig::default(),
            }
        } else {
            toml::from_str(&config_str)?
        };

        let sharelog_listen_address = args
            .iter()
            .position(|arg| arg == "--listen-address" || arg == "-l")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .or(file_config.server.sharelog_listen_address)
            .ok_or("Missing required config: server.sharelog_listen_address")?;

        let data_dir = args
            .iter()
            .position(|arg| arg == "--data-dir" || arg == "-d")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .or(file_config.sharelog.data_dir)
            .ok_or("Missing required config: sharelog.data_dir")?;

        let consumer_group = file_config
            .sharelog
            .consumer_group
            .unwrap_or_else(|| "sharelogger".to_string());

        Ok(Config {
            sharelog_listen_address,
            data_dir,
            consumer_group,
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
            sharelog_listen_address = "127.0.0.1:5555"

            [sharelog]
            data_dir = "/data/sharelog"
            consumer_group = "writer-1"
        "#;
        let config: ShareloggerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.server.sharelog_listen_address,
            Some("127.0.0.1:5555".to_string())
        );
        assert_eq!(config.sharelog.data_dir, Some("/data/sharelog".to_string()));
        assert_eq!(
            config.sharelog.consumer_group,
            Some("writer-1".to_string())
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [sharelog]
            data_dir = "/data/sharelog"
        "#;
        let config: ShareloggerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.server.sharelog_listen_address.is_some());
        assert!(config.sharelog.consumer_group.is_none());
    }
}

use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::rtc::DEFAULT_STUN_SERVERS;
use crate::signaling::mqtt::{DEFAULT_BROKER_HOST, DEFAULT_BROKER_PORT};
use crate::signaling::transport::DEFAULT_NAMESPACE;

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub namespace: String,
    pub stun_servers: Vec<String>,
    /// Name sent with contact requests; the user id when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Where contacts and conversations live; the config directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            namespace: DEFAULT_NAMESPACE.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            display_name: None,
            data_dir: None,
        }
    }
}

impl AppConfig {
    /// Load `config.json` from the config directory (defaults when absent),
    /// then apply `PEERCHAT_*` environment overrides.
    pub fn load() -> Result<Self> {
        let path = get_config_dir()?.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let mut contents = String::new();
            File::open(&path)?.read_to_string(&mut contents)?;
            let config: AppConfig = serde_json::from_str(&contents)?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            AppConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = get_config_dir()?.join(CONFIG_FILE);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(host) = env::var("PEERCHAT_BROKER_HOST") {
            self.broker_host = host;
        }
        if let Ok(port) = env::var("PEERCHAT_BROKER_PORT") {
            match port.parse() {
                Ok(port) => self.broker_port = port,
                Err(_) => warn!("Ignoring invalid PEERCHAT_BROKER_PORT '{}'", port),
            }
        }
        if let Ok(namespace) = env::var("PEERCHAT_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(name) = env::var("PEERCHAT_DISPLAY_NAME") {
            self.display_name = Some(name);
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => get_config_dir(),
        }
    }
}

/// Point the config directory somewhere else. Only the first call wins.
pub fn set_config_dir_override(dir: PathBuf) -> bool {
    CONFIG_DIR_OVERRIDE.set(dir).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match CONFIG_DIR_OVERRIDE.get() {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("peerchat"),
    };

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"broker_host": "localhost"}"#).unwrap();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.namespace, "p2p-chat/signaling");
        assert_eq!(config.stun_servers.len(), 3);
        assert!(config.display_name.is_none());
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = AppConfig {
            data_dir: Some(PathBuf::from("/tmp/peerchat-data")),
            ..AppConfig::default()
        };
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/peerchat-data"));
    }
}

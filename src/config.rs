// Configuration loading for the monitor

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_DIR: &str = ".config/netpulse";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "netpulse.db";

/// Remote upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Endpoint receiving the uploaded batches
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Uploads stay disabled until a key is set
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_server_url() -> String {
    "http://127.0.0.1:5000/api/upload".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_key: None,
        }
    }
}

/// A host the latency probe pings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub name: String,
    pub host: String,
}

/// Latency probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_probe_targets")]
    pub targets: Vec<ProbeTarget>,
}

fn default_probe_targets() -> Vec<ProbeTarget> {
    vec![
        ProbeTarget {
            name: "Cloudflare".to_string(),
            host: "1.1.1.1".to_string(),
        },
        ProbeTarget {
            name: "Google".to_string(),
            host: "8.8.8.8".to_string(),
        },
        ProbeTarget {
            name: "IITB".to_string(),
            host: "www.iitb.ac.in".to_string(),
        },
    ]
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            targets: default_probe_targets(),
        }
    }
}

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interface filter: None = monitor all up, non-loopback interfaces
    #[serde(default)]
    pub interfaces: Option<Vec<String>>,

    /// Count ARP frames under a synthetic system bucket
    #[serde(default = "default_true")]
    pub arp_accounting: bool,

    /// Count IP protocols other than TCP/UDP/ICMP under per-protocol buckets
    #[serde(default = "default_true")]
    pub unknown_protocol_accounting: bool,

    /// Override for the traffic database location
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: None,
            arp_accounting: true,
            unknown_protocol_accounting: true,
            database_path: None,
            sync: SyncConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl Config {
    /// Get the config file path, creating the directory if needed
    pub fn config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME environment variable not set")?;
        let config_dir = PathBuf::from(home).join(CONFIG_DIR);

        fs::create_dir_all(&config_dir).context(format!(
            "Failed to create config directory: {:?}",
            config_dir
        ))?;

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            log::debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(&path).context(format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Where the traffic database lives: next to the config file unless
    /// overridden
    pub fn database_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        Ok(Self::config_path()?.with_file_name(DATABASE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert!(config.interfaces.is_none());
        assert!(config.arp_accounting);
        assert!(config.unknown_protocol_accounting);
        assert!(config.database_path.is_none());
        assert_eq!(config.sync.server_url, "http://127.0.0.1:5000/api/upload");
        assert!(config.sync.api_key.is_none());
        assert!(config.probe.enabled);
        let names: Vec<&str> = config.probe.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Cloudflare", "Google", "IITB"]);
    }

    #[test]
    fn test_partial_override_keeps_nested_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"sync": {"api_key": "abc"}, "arp_accounting": false}"#)
                .unwrap();

        assert_eq!(config.sync.api_key.as_deref(), Some("abc"));
        assert_eq!(config.sync.server_url, "http://127.0.0.1:5000/api/upload");
        assert!(!config.arp_accounting);
        assert!(config.unknown_protocol_accounting);
        assert_eq!(config.probe.targets.len(), 3);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.interfaces = Some(vec!["eth0".to_string(), "wlan0".to_string()]);
        config.sync.api_key = Some("secret".to_string());
        config.probe.enabled = false;

        let json = serde_json::to_string_pretty(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(
            deserialized.interfaces.as_deref(),
            Some(["eth0".to_string(), "wlan0".to_string()].as_slice())
        );
        assert_eq!(deserialized.sync.api_key.as_deref(), Some("secret"));
        assert!(!deserialized.probe.enabled);
        assert!(deserialized.arp_accounting);
    }
}

use anyhow::{Context, Result};
use provision_core::deployment::DeploymentConfig;
use provision_core::Choice;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub integrations: IntegrationsConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Preboot choices offered by `apply_preboot`
    #[serde(default = "default_preboots")]
    pub preboot: Vec<PrebootConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_inventory_file")]
    pub inventory_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_inventory_file() -> String {
    "inventory.json".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            inventory_file: default_inventory_file(),
            event_log_dir: default_event_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    #[serde(default = "default_true")]
    pub dns_enabled: bool,

    #[serde(default = "default_true")]
    pub dhcp_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            dns_enabled: true,
            dhcp_enabled: true,
        }
    }
}

/// TCP reachability probing used by `wait_for_ping`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_port")]
    pub port: u16,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Give up on a target after this long
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_probe_port() -> u16 {
    22
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_probe_timeout_secs() -> u64 {
    600
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: default_probe_port(),
            interval_ms: default_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrebootConfig {
    pub id: String,
    pub name: String,
}

fn default_preboots() -> Vec<PrebootConfig> {
    DeploymentConfig::default()
        .preboots
        .into_iter()
        .map(|choice| PrebootConfig {
            id: choice.key,
            name: choice.label,
        })
        .collect()
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                preboot: default_preboots(),
                ..Default::default()
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the inventory file path
    pub fn inventory_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.inventory_file)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn deployment(&self) -> DeploymentConfig {
        DeploymentConfig {
            preboots: self
                .preboot
                .iter()
                .map(|p| Choice::new(p.id.clone(), p.name.clone()))
                .collect(),
        }
    }
}

use crate::config::IntegrationsConfig;
use anyhow::{Context, Result};
use provision_core::services::{DhcpEntry, DnsRecord};
use provision_core::storage::{MemoryAllocator, MemoryAssetStore, MemoryRecordService};
use provision_core::Target;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Everything a transition reads and writes, as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub targets: Vec<Target>,

    /// Remaining hostnames per network environment
    #[serde(default)]
    pub hostname_pools: BTreeMap<String, Vec<String>>,

    /// Remaining addresses per network
    #[serde(default)]
    pub ip_pools: BTreeMap<String, Vec<IpAddr>>,

    #[serde(default)]
    pub dns_records: Vec<DnsRecord>,

    #[serde(default)]
    pub dhcp_entries: Vec<DhcpEntry>,
}

/// In-memory collaborators seeded from an inventory
pub struct Backends {
    pub assets: Arc<MemoryAssetStore>,
    pub allocator: Arc<MemoryAllocator>,
    pub records: Arc<MemoryRecordService>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse inventory {}", path.display()))
    }

    /// Write through a temporary file so a crash never leaves a torn inventory
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content).context("Failed to write inventory")?;
        std::fs::rename(&tmp, path).context("Failed to replace inventory")?;
        Ok(())
    }

    pub fn into_backends(self, integrations: &IntegrationsConfig) -> Backends {
        let records = MemoryRecordService::new(self.dns_records, self.dhcp_entries)
            .with_dns_enabled(integrations.dns_enabled)
            .with_dhcp_enabled(integrations.dhcp_enabled);

        Backends {
            assets: Arc::new(MemoryAssetStore::new(self.targets)),
            allocator: Arc::new(MemoryAllocator::new(
                self.hostname_pools.into_iter().collect(),
                self.ip_pools.into_iter().collect(),
            )),
            records: Arc::new(records),
        }
    }

    /// Current state of the collaborators, ready to be saved
    pub async fn capture(backends: &Backends) -> Self {
        Self {
            targets: backends.assets.targets().await,
            hostname_pools: backends.allocator.hostname_pools().await.into_iter().collect(),
            ip_pools: backends.allocator.address_pools().await.into_iter().collect(),
            dns_records: backends.records.dns().await,
            dhcp_entries: backends.records.dhcp().await,
        }
    }
}

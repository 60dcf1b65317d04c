use crate::error::{IntegrationDisabled, TransitionError};
use crate::services::{
    AssetStore, DhcpEntry, DnsRecord, NetworkAllocator, ReachabilityProber, RecordService,
};
use crate::types::{InterfaceId, IpBinding, Target, TargetId};
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use tokio::sync::RwLock;

/// Asset store held in memory, one lock over the whole map
#[derive(Default)]
pub struct MemoryAssetStore {
    targets: RwLock<BTreeMap<TargetId, Target>>,
    saves: RwLock<Vec<TargetId>>,
}

impl MemoryAssetStore {
    pub fn new(targets: impl IntoIterator<Item = Target>) -> Self {
        Self {
            targets: RwLock::new(targets.into_iter().map(|t| (t.id.clone(), t)).collect()),
            saves: RwLock::new(Vec::new()),
        }
    }

    pub async fn get(&self, id: &TargetId) -> Option<Target> {
        self.targets.read().await.get(id).cloned()
    }

    /// Every stored target, ordered by id
    pub async fn targets(&self) -> Vec<Target> {
        self.targets.read().await.values().cloned().collect()
    }

    /// Ids passed to `save`, in call order
    pub async fn saved(&self) -> Vec<TargetId> {
        self.saves.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AssetStore for MemoryAssetStore {
    async fn load(&self, ids: &[TargetId]) -> Result<Vec<Target>> {
        let targets = self.targets.read().await;
        ids.iter()
            .map(|id| {
                targets
                    .get(id)
                    .cloned()
                    .ok_or_else(|| anyhow::Error::from(TransitionError::TargetNotFound(id.clone())))
            })
            .collect()
    }

    async fn save(&self, target: &Target) -> Result<()> {
        self.targets
            .write()
            .await
            .insert(target.id.clone(), target.clone());
        self.saves.write().await.push(target.id.clone());
        Ok(())
    }

    async fn create_ip_binding(
        &self,
        target: &TargetId,
        interface: &InterfaceId,
        binding: &IpBinding,
    ) -> Result<()> {
        let mut targets = self.targets.write().await;
        let stored = targets
            .get_mut(target)
            .ok_or_else(|| TransitionError::TargetNotFound(target.clone()))?;
        let eth = stored
            .interface_mut(interface)
            .ok_or_else(|| anyhow!("Interface {} not found on {}", interface, target))?;

        if !eth.ips.iter().any(|ip| ip.address == binding.address) {
            eth.ips.push(binding.clone());
        }
        Ok(())
    }
}

/// Allocator handing out pre-seeded pools in order
#[derive(Default)]
pub struct MemoryAllocator {
    hostnames: RwLock<HashMap<String, VecDeque<String>>>,
    addresses: RwLock<HashMap<String, VecDeque<IpAddr>>>,
}

impl MemoryAllocator {
    pub fn new(
        hostnames: HashMap<String, Vec<String>>,
        addresses: HashMap<String, Vec<IpAddr>>,
    ) -> Self {
        Self {
            hostnames: RwLock::new(
                hostnames
                    .into_iter()
                    .map(|(scope, pool)| (scope, pool.into()))
                    .collect(),
            ),
            addresses: RwLock::new(
                addresses
                    .into_iter()
                    .map(|(scope, pool)| (scope, pool.into()))
                    .collect(),
            ),
        }
    }

    /// Remaining hostname pools
    pub async fn hostname_pools(&self) -> HashMap<String, Vec<String>> {
        self.hostnames
            .read()
            .await
            .iter()
            .map(|(scope, pool)| (scope.clone(), pool.iter().cloned().collect()))
            .collect()
    }

    /// Remaining address pools
    pub async fn address_pools(&self) -> HashMap<String, Vec<IpAddr>> {
        self.addresses
            .read()
            .await
            .iter()
            .map(|(scope, pool)| (scope.clone(), pool.iter().copied().collect()))
            .collect()
    }
}

#[async_trait::async_trait]
impl NetworkAllocator for MemoryAllocator {
    async fn issue_next_free_hostname(&self, network_environment: &str) -> Result<String> {
        self.hostnames
            .write()
            .await
            .get_mut(network_environment)
            .and_then(|pool| pool.pop_front())
            .ok_or_else(|| {
                anyhow!(
                    "No free hostname left in network environment {}",
                    network_environment
                )
            })
    }

    async fn issue_next_free_ip(&self, network: &str) -> Result<IpAddr> {
        self.addresses
            .write()
            .await
            .get_mut(network)
            .and_then(|pool| pool.pop_front())
            .ok_or_else(|| anyhow!("No free address left in network {}", network))
    }
}

/// DNS/DHCP record service held in memory
pub struct MemoryRecordService {
    dns: RwLock<Vec<DnsRecord>>,
    dhcp: RwLock<Vec<DhcpEntry>>,
    dns_enabled: bool,
    dhcp_enabled: bool,
    next_dhcp_id: std::sync::atomic::AtomicU64,
}

impl MemoryRecordService {
    pub fn new(dns: Vec<DnsRecord>, dhcp: Vec<DhcpEntry>) -> Self {
        let next_dhcp_id = dhcp.len() as u64 + 1;
        Self {
            dns: RwLock::new(dns),
            dhcp: RwLock::new(dhcp),
            dns_enabled: true,
            dhcp_enabled: true,
            next_dhcp_id: std::sync::atomic::AtomicU64::new(next_dhcp_id),
        }
    }

    pub fn with_dns_enabled(mut self, enabled: bool) -> Self {
        self.dns_enabled = enabled;
        self
    }

    pub fn with_dhcp_enabled(mut self, enabled: bool) -> Self {
        self.dhcp_enabled = enabled;
        self
    }

    pub async fn dns(&self) -> Vec<DnsRecord> {
        self.dns.read().await.clone()
    }

    pub async fn dhcp(&self) -> Vec<DhcpEntry> {
        self.dhcp.read().await.clone()
    }

    fn check_dns(&self) -> Result<()> {
        if self.dns_enabled {
            Ok(())
        } else {
            Err(IntegrationDisabled("DNS".to_string()).into())
        }
    }

    fn check_dhcp(&self) -> Result<()> {
        if self.dhcp_enabled {
            Ok(())
        } else {
            Err(IntegrationDisabled("DHCP".to_string()).into())
        }
    }
}

impl Default for MemoryRecordService {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait::async_trait]
impl RecordService for MemoryRecordService {
    async fn dns_records(&self, addresses: &[IpAddr]) -> Result<Vec<DnsRecord>> {
        self.check_dns()?;
        let wanted: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        Ok(self
            .dns
            .read()
            .await
            .iter()
            .filter(|r| wanted.contains(&r.content))
            .cloned()
            .collect())
    }

    async fn delete_dns_record(&self, id: &str) -> Result<()> {
        self.check_dns()?;
        let mut dns = self.dns.write().await;
        let before = dns.len();
        dns.retain(|r| r.id != id);
        if dns.len() == before {
            return Err(anyhow!("DNS record {} not found", id));
        }
        Ok(())
    }

    async fn dhcp_entries(&self, macs: &[String]) -> Result<Vec<DhcpEntry>> {
        self.check_dhcp()?;
        Ok(self
            .dhcp
            .read()
            .await
            .iter()
            .filter(|e| macs.iter().any(|mac| mac.eq_ignore_ascii_case(&e.mac)))
            .cloned()
            .collect())
    }

    async fn delete_dhcp_entry(&self, id: &str) -> Result<()> {
        self.check_dhcp()?;
        let mut dhcp = self.dhcp.write().await;
        let before = dhcp.len();
        dhcp.retain(|e| e.id != id);
        if dhcp.len() == before {
            return Err(anyhow!("DHCP entry {} not found", id));
        }
        Ok(())
    }

    async fn create_dhcp_entry(&self, mac: &str, address: IpAddr) -> Result<DhcpEntry> {
        self.check_dhcp()?;
        let mut dhcp = self.dhcp.write().await;
        if let Some(existing) = dhcp.iter().find(|e| e.address == address && e.mac != mac) {
            return Err(anyhow!(
                "Address {} is already reserved for {}",
                address,
                existing.mac
            ));
        }

        let id = self
            .next_dhcp_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let entry = DhcpEntry {
            id: format!("dhcp-{}", id),
            mac: mac.to_string(),
            address,
        };
        dhcp.push(entry.clone());
        Ok(entry)
    }
}

/// Prober that reports every target reachable immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

#[async_trait::async_trait]
impl ReachabilityProber for AlwaysReachable {
    async fn wait_reachable(&self, _target: &Target) -> Result<()> {
        Ok(())
    }
}

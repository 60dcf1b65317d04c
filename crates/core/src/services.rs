// Collaborator contracts the transition core calls into

use crate::events::EventLog;
use crate::types::{InterfaceId, IpBinding, Target, TargetId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Persistent store of targets. Both operations are atomic per target.
#[async_trait::async_trait]
pub trait AssetStore: Send + Sync {
    /// Load a batch of targets, in the order requested
    async fn load(&self, ids: &[TargetId]) -> Result<Vec<Target>>;

    /// Save a mutated target
    async fn save(&self, target: &Target) -> Result<()>;

    /// Persist a new IP binding on one interface of a target
    async fn create_ip_binding(
        &self,
        target: &TargetId,
        interface: &InterfaceId,
        binding: &IpBinding,
    ) -> Result<()>;
}

/// Issues network resources. Implementations guarantee no two concurrent
/// callers receive the same value for the same scope.
#[async_trait::async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Next free hostname in a network environment
    async fn issue_next_free_hostname(&self, network_environment: &str) -> Result<String>;

    /// Next free address in a network
    async fn issue_next_free_ip(&self, network: &str) -> Result<IpAddr>;
}

/// A DNS record as reported by the record service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
}

/// A DHCP reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpEntry {
    pub id: String,
    pub mac: String,
    pub address: IpAddr,
}

/// DNS and DHCP record management. Any method may fail with
/// [`crate::error::IntegrationDisabled`] when the integration is switched off.
#[async_trait::async_trait]
pub trait RecordService: Send + Sync {
    /// DNS records pointing at any of the given addresses
    async fn dns_records(&self, addresses: &[IpAddr]) -> Result<Vec<DnsRecord>>;

    async fn delete_dns_record(&self, id: &str) -> Result<()>;

    /// DHCP entries reserved for any of the given MAC addresses
    async fn dhcp_entries(&self, macs: &[String]) -> Result<Vec<DhcpEntry>>;

    async fn delete_dhcp_entry(&self, id: &str) -> Result<()>;

    async fn create_dhcp_entry(&self, mac: &str, address: IpAddr) -> Result<DhcpEntry>;
}

/// Resolves once a target answers on the network
#[async_trait::async_trait]
pub trait ReachabilityProber: Send + Sync {
    async fn wait_reachable(&self, target: &Target) -> Result<()>;
}

/// Bundle of collaborators handed to every step body
#[derive(Clone)]
pub struct Services {
    pub assets: Arc<dyn AssetStore>,
    pub allocator: Arc<dyn NetworkAllocator>,
    pub records: Arc<dyn RecordService>,
    pub prober: Arc<dyn ReachabilityProber>,
    pub event_log: Arc<dyn EventLog>,
}

// Shared fixtures for the integration tests

#![allow(dead_code)]

use provision_core::deployment::{deployment_registry, DeploymentConfig};
use provision_core::services::{DhcpEntry, DnsRecord, Services};
use provision_core::storage::{
    AlwaysReachable, MemoryAllocator, MemoryAssetStore, MemoryEventLog, MemoryRecordService,
};
use provision_core::workflow::{StepRegistry, TransitionCoordinator};
use provision_core::{InterfaceId, IpBinding, NetworkInterface, Resource, Target, TargetKind};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub fn ip(a: u8, b: u8, c: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, a, b, c))
}

pub fn mac(n: u8) -> String {
    format!("aa:bb:cc:00:00:{:02x}", n)
}

/// A target with one non-management interface carrying two addresses and
/// a management interface, drawing from `env-1` and `net-1`
pub fn deployable(id: &str, n: u8) -> Target {
    let mut target = Target::new(id, TargetKind::DataCenterAsset);
    target.hostname = Some(format!("{}.old.example", id));
    target.service_env = Some("se-1".to_string());
    target.configuration_path = Some("cp-1".to_string());
    target.interfaces = vec![
        NetworkInterface {
            id: InterfaceId::new(format!("{}-eth0", id)),
            mac: Some(mac(n)),
            ips: vec![IpBinding::new(ip(0, n, 10)), IpBinding::new(ip(0, n, 11))],
        },
        NetworkInterface {
            id: InterfaceId::new(format!("{}-mgmt", id)),
            mac: Some(mac(100 + n)),
            ips: vec![IpBinding::management(ip(200, n, 1))],
        },
    ];
    target.network_environments = vec![Resource::new("env-1", "DC1 prod")];
    target.networks = vec![Resource::new("net-1", "10.1.0.0/24")];
    target
}

/// DNS records pointing at every non-management address of the targets
pub fn dns_for(targets: &[Target]) -> Vec<DnsRecord> {
    let mut records = Vec::new();
    for target in targets {
        for address in target.ip_addresses() {
            records.push(DnsRecord {
                id: format!("dns-{}", address),
                record_type: "A".to_string(),
                name: format!("{}.old.example", target.id),
                content: address.to_string(),
            });
        }
    }
    records
}

/// DHCP entries for the first non-management interface of the targets
pub fn dhcp_for(targets: &[Target]) -> Vec<DhcpEntry> {
    targets
        .iter()
        .filter_map(|t| {
            let eth = t.first_non_management_interface()?;
            Some(DhcpEntry {
                id: format!("old-{}", t.id),
                mac: eth.mac.clone()?,
                address: eth.ips.first()?.address,
            })
        })
        .collect()
}

pub struct Harness {
    pub assets: Arc<MemoryAssetStore>,
    pub allocator: Arc<MemoryAllocator>,
    pub records: Arc<MemoryRecordService>,
    pub events: Arc<MemoryEventLog>,
}

impl Harness {
    pub fn new(targets: Vec<Target>) -> Self {
        let records = MemoryRecordService::new(dns_for(&targets), dhcp_for(&targets));
        Self::with_records(targets, records)
    }

    pub fn with_records(targets: Vec<Target>, records: MemoryRecordService) -> Self {
        let hostnames = HashMap::from([(
            "env-1".to_string(),
            (1..=50).map(|i| format!("s{:05}.dc1", i)).collect(),
        )]);
        let addresses = HashMap::from([(
            "net-1".to_string(),
            (1..=50).map(|i| ip(1, 0, i)).collect(),
        )]);

        Self {
            assets: Arc::new(MemoryAssetStore::new(targets)),
            allocator: Arc::new(MemoryAllocator::new(hostnames, addresses)),
            records: Arc::new(records),
            events: Arc::new(MemoryEventLog::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            assets: self.assets.clone(),
            allocator: self.allocator.clone(),
            records: self.records.clone(),
            prober: Arc::new(AlwaysReachable),
            event_log: self.events.clone(),
        }
    }

    pub fn coordinator(&self, registry: StepRegistry) -> TransitionCoordinator {
        TransitionCoordinator::new(Arc::new(registry), self.services())
    }

    pub fn deployment(&self) -> TransitionCoordinator {
        let registry = deployment_registry(&DeploymentConfig::default()).unwrap();
        self.coordinator(registry)
    }
}

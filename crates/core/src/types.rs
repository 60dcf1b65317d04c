use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Unique identifier for a transition run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique name of a registered step
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a machine in the asset store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a network interface, unique within the asset store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceId(pub String);

impl InterfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of machine a step can be applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    DataCenterAsset,
    VirtualServer,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::DataCenterAsset => write!(f, "data_center_asset"),
            TargetKind::VirtualServer => write!(f, "virtual_server"),
        }
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_center_asset" => Ok(TargetKind::DataCenterAsset),
            "virtual_server" => Ok(TargetKind::VirtualServer),
            other => Err(format!("unknown target kind: {}", other)),
        }
    }
}

/// A network resource a target may draw from (network environment or network)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
}

impl Resource {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// IP address bound to a network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBinding {
    pub address: IpAddr,
    #[serde(default)]
    pub is_management: bool,
}

impl IpBinding {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            is_management: false,
        }
    }

    pub fn management(address: IpAddr) -> Self {
        Self {
            address,
            is_management: true,
        }
    }
}

/// Network interface of a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: InterfaceId,
    pub mac: Option<String>,
    #[serde(default)]
    pub ips: Vec<IpBinding>,
}

impl NetworkInterface {
    /// An interface carrying a management address is the management interface
    pub fn is_management(&self) -> bool {
        self.ips.iter().any(|ip| ip.is_management)
    }
}

/// The machine being transitioned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub hostname: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    pub service_env: Option<String>,
    pub configuration_path: Option<String>,
    #[serde(default)]
    pub preboot: Option<String>,
    /// Network environments this target may take a hostname from
    #[serde(default)]
    pub network_environments: Vec<Resource>,
    /// Networks this target may take an address from
    #[serde(default)]
    pub networks: Vec<Resource>,
}

impl Target {
    pub fn new(id: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            id: TargetId::new(id),
            kind,
            hostname: None,
            interfaces: Vec::new(),
            service_env: None,
            configuration_path: None,
            preboot: None,
            network_environments: Vec::new(),
            networks: Vec::new(),
        }
    }

    /// All addresses bound to any interface
    pub fn ip_addresses(&self) -> Vec<IpAddr> {
        self.interfaces
            .iter()
            .flat_map(|eth| eth.ips.iter().map(|ip| ip.address))
            .collect()
    }

    /// Interfaces with a MAC that do not carry a management address, ordered by MAC
    pub fn non_management_interfaces(&self) -> Vec<&NetworkInterface> {
        let mut interfaces: Vec<&NetworkInterface> = self
            .interfaces
            .iter()
            .filter(|eth| eth.mac.is_some() && !eth.is_management())
            .collect();
        interfaces.sort_by(|a, b| a.mac.cmp(&b.mac));
        interfaces
    }

    pub fn first_non_management_interface(&self) -> Option<&NetworkInterface> {
        self.non_management_interfaces().into_iter().next()
    }

    pub fn interface(&self, id: &InterfaceId) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|eth| &eth.id == id)
    }

    pub fn interface_mut(&mut self, id: &InterfaceId) -> Option<&mut NetworkInterface> {
        self.interfaces.iter_mut().find(|eth| &eth.id == id)
    }

    /// Field-level differences between an earlier snapshot and this target
    pub fn changes_since(&self, before: &Target) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        let mut compare = |field: &str, old: Option<String>, new: Option<String>| {
            if old != new {
                changes.push(FieldChange {
                    field: field.to_string(),
                    old,
                    new,
                });
            }
        };

        compare("hostname", before.hostname.clone(), self.hostname.clone());
        compare(
            "service_env",
            before.service_env.clone(),
            self.service_env.clone(),
        );
        compare(
            "configuration_path",
            before.configuration_path.clone(),
            self.configuration_path.clone(),
        );
        compare("preboot", before.preboot.clone(), self.preboot.clone());
        compare(
            "ip_addresses",
            Some(format_addresses(&before.ip_addresses())),
            Some(format_addresses(&self.ip_addresses())),
        );

        changes
    }

    /// Take the changed fields from another version of this target, leaving
    /// every other field as it is
    pub fn apply_changes(&mut self, source: &Target, changes: &[FieldChange]) {
        for change in changes {
            match change.field.as_str() {
                "hostname" => self.hostname = source.hostname.clone(),
                "service_env" => self.service_env = source.service_env.clone(),
                "configuration_path" => self.configuration_path = source.configuration_path.clone(),
                "preboot" => self.preboot = source.preboot.clone(),
                "ip_addresses" => self.interfaces = source.interfaces.clone(),
                _ => {}
            }
        }
    }
}

fn format_addresses(addresses: &[IpAddr]) -> String {
    let mut rendered: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
    rendered.sort();
    format!("[{}]", rendered.join(", "))
}

/// A single changed field on a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// An entry of a choice list offered to the form layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Choice {
    pub key: String,
    pub label: String,
}

impl Choice {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
        }
    }
}

/// Status of a transition run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Running,
    Completed,
    Failed,
    Aborted,
    Cancelled,
}

impl RunStatus {
    /// Process exit code for a finished run
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::Failed => 1,
            RunStatus::Aborted => 2,
            RunStatus::Cancelled => 3,
            RunStatus::Planning | RunStatus::Running => 1,
        }
    }
}

/// Why a run never left planning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cycle,
    InvalidPlan,
}

/// Status of one step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// Outcome of one step for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub status: TargetStatus,
    pub message: Option<String>,
}

impl TargetOutcome {
    pub fn success() -> Self {
        Self {
            status: TargetStatus::Success,
            message: None,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: TargetStatus::Skipped,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TargetStatus::Failed,
            message: Some(message.into()),
        }
    }
}

/// Result of executing one step against a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: StepId,
    pub status: StepStatus,
    pub targets: BTreeMap<TargetId, TargetOutcome>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepReport {
    pub fn pending(step: StepId) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            targets: BTreeMap::new(),
            error: None,
            error_kind: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Marks every listed target skipped with the same reason
    pub fn skipped<'a>(
        step: StepId,
        targets: impl IntoIterator<Item = &'a TargetId>,
        reason: &str,
    ) -> Self {
        Self {
            status: StepStatus::Skipped,
            targets: targets
                .into_iter()
                .map(|id| (id.clone(), TargetOutcome::skipped(reason)))
                .collect(),
            error: Some(reason.to_string()),
            completed_at: Some(Utc::now()),
            ..Self::pending(step)
        }
    }

    pub fn failed_targets(&self) -> Vec<TargetId> {
        self.targets
            .iter()
            .filter(|(_, outcome)| outcome.status == TargetStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// First failing target with its message, in target order
    pub fn first_failure(&self) -> Option<(TargetId, String)> {
        self.targets
            .iter()
            .find(|(_, outcome)| outcome.status == TargetStatus::Failed)
            .map(|(id, outcome)| {
                (
                    id.clone(),
                    outcome
                        .message
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string()),
                )
            })
    }
}

/// First failing step/target pair of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePoint {
    pub step: Option<StepId>,
    pub target: Option<TargetId>,
    pub message: String,
}

/// Outcome of a whole transition run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    pub plan: Vec<StepId>,
    pub steps: Vec<StepReport>,
    pub first_failure: Option<FailurePoint>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn step(&self, step: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step.as_str() == step)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_non_management_interfaces_sorted_by_mac() {
        let mut target = Target::new("dc-1", TargetKind::DataCenterAsset);
        target.interfaces = vec![
            NetworkInterface {
                id: InterfaceId::new("eth-b"),
                mac: Some("00:00:00:00:00:0b".to_string()),
                ips: vec![],
            },
            NetworkInterface {
                id: InterfaceId::new("mgmt"),
                mac: Some("00:00:00:00:00:01".to_string()),
                ips: vec![IpBinding::management(ip(1))],
            },
            NetworkInterface {
                id: InterfaceId::new("eth-a"),
                mac: Some("00:00:00:00:00:0a".to_string()),
                ips: vec![IpBinding::new(ip(2))],
            },
            NetworkInterface {
                id: InterfaceId::new("no-mac"),
                mac: None,
                ips: vec![],
            },
        ];

        let ids: Vec<&str> = target
            .non_management_interfaces()
            .iter()
            .map(|eth| eth.id.0.as_str())
            .collect();
        assert_eq!(ids, vec!["eth-a", "eth-b"]);
        assert_eq!(
            target.first_non_management_interface().unwrap().id,
            InterfaceId::new("eth-a")
        );
    }

    #[test]
    fn test_changes_since_reports_changed_fields_only() {
        let mut before = Target::new("vm-1", TargetKind::VirtualServer);
        before.hostname = Some("old.example".to_string());
        before.service_env = Some("env-1".to_string());

        let mut after = before.clone();
        after.hostname = None;

        let changes = after.changes_since(&before);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "hostname");
        assert_eq!(changes[0].old.as_deref(), Some("old.example"));
        assert_eq!(changes[0].new, None);
    }

    #[test]
    fn test_apply_changes_keeps_untouched_fields() {
        let base = Target::new("vm-1", TargetKind::VirtualServer);

        let mut worked = base.clone();
        worked.hostname = Some("s001.dc1".to_string());
        let changes = worked.changes_since(&base);

        // Meanwhile another step changed a different field
        let mut shared = base.clone();
        shared.configuration_path = Some("cp-2".to_string());
        shared.apply_changes(&worked, &changes);

        assert_eq!(shared.hostname.as_deref(), Some("s001.dc1"));
        assert_eq!(shared.configuration_path.as_deref(), Some("cp-2"));
    }

    #[test]
    fn test_run_status_exit_codes() {
        assert_eq!(RunStatus::Completed.exit_code(), 0);
        assert_ne!(RunStatus::Failed.exit_code(), 0);
        assert_ne!(RunStatus::Aborted.exit_code(), 0);
        assert_ne!(RunStatus::Cancelled.exit_code(), 0);
    }

    #[test]
    fn test_target_kind_round_trips_through_str() {
        let kind: TargetKind = "virtual_server".parse().unwrap();
        assert_eq!(kind, TargetKind::VirtualServer);
        assert!("rack".parse::<TargetKind>().is_err());
    }
}

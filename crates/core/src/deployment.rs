// Deployment catalog: cleanup and re-assignment of a machine's network identity

use crate::error::TransitionResult;
use crate::resolver::{resolve_choice_set, Selector, USE_FIRST_MAC};
use crate::types::{Choice, InterfaceId, IpBinding, Target, TargetId, TargetKind};
use crate::workflow::registry::{StepRegistry, StepRegistryBuilder};
use crate::workflow::step::{
    record_failure, ParamSpec, ParamValue, PendingContext, StepAction, StepContext,
    StepDefinition, StepParams, TargetBatch, TargetFailures, OTHER,
};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Label prefix of the "issue the next free value" choices
pub const NEXT_FREE: &str = "<NEXT FREE>";

/// Choice key prefix selecting the next free hostname of a network environment
pub const NEXT_FREE_HOSTNAME: &str = "next_free__network_environment_";

/// Choice key prefix selecting the next free address of a network
pub const NEXT_FREE_IP: &str = "next_free__network_";

/// Target kinds every deployment step applies to
pub const DEPLOYMENT_KINDS: [TargetKind; 2] = [TargetKind::DataCenterAsset, TargetKind::VirtualServer];

/// Site-specific settings of the deployment catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub preboots: Vec<Choice>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            preboots: vec![
                Choice::new("1", "Ubuntu 14.04"),
                Choice::new("2", "Ubuntu 14.10"),
                Choice::new("3", "Ubuntu 15.04"),
            ],
        }
    }
}

// Computed values

/// The service-env shared by the whole batch, if there is one
pub fn autocomplete_service_env(_: &PendingContext, targets: &[Target]) -> Option<String> {
    common_value(targets.iter().map(|t| t.service_env.as_deref()))
}

/// The configuration path shared by the whole batch, if there is one
pub fn autocomplete_configuration_path(_: &PendingContext, targets: &[Target]) -> Option<String> {
    common_value(targets.iter().map(|t| t.configuration_path.as_deref()))
}

fn common_value<'a>(mut values: impl Iterator<Item = Option<&'a str>>) -> Option<String> {
    let first = values.next()??;
    values
        .all(|v| v == Some(first))
        .then(|| first.to_string())
}

/// One "next free hostname" choice per network environment common to the batch
pub fn next_free_hostname_choices(_: &PendingContext, targets: &[Target]) -> Vec<Choice> {
    resolve_choice_set(targets, Selector::NetworkEnvironments)
        .into_iter()
        .map(|env| {
            Choice::new(
                format!("{}{}", NEXT_FREE_HOSTNAME, env.key),
                format!("{} ({})", NEXT_FREE, env.label),
            )
        })
        .collect()
}

/// One "next free IP" choice per network common to the batch. A single
/// target may also take a literal address through the "other" option.
pub fn next_free_ip_choices(_: &PendingContext, targets: &[Target]) -> Vec<Choice> {
    let mut choices: Vec<Choice> = resolve_choice_set(targets, Selector::Networks)
        .into_iter()
        .map(|network| {
            Choice::new(
                format!("{}{}", NEXT_FREE_IP, network.key),
                format!("{} ({})", NEXT_FREE, network.label),
            )
        })
        .collect();
    if targets.len() == 1 {
        choices.push(Choice::new(OTHER, "Other"));
    }
    choices
}

/// Interfaces of a single target, or the "use first" marker for a larger batch
pub fn mac_choices_for_targets(_: &PendingContext, targets: &[Target]) -> Vec<Choice> {
    resolve_choice_set(targets, Selector::MacAddresses)
}

/// Every target needs an interface that can receive a new address
pub fn check_mac_address(targets: &[Target]) -> BTreeMap<TargetId, String> {
    targets
        .iter()
        .filter(|t| t.first_non_management_interface().is_none())
        .map(|t| (t.id.clone(), "Non-management MAC address not found".to_string()))
        .collect()
}

pub fn validate_ip_address(value: &str) -> Result<(), String> {
    value
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a valid IP address", value))
}

fn strip_key<'a>(value: &'a ParamValue, prefix: &str) -> anyhow::Result<&'a str> {
    value
        .as_str()
        .strip_prefix(prefix)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| anyhow!("Unexpected choice '{}'", value.as_str()))
}

// Step bodies

pub struct CleanHostname;

#[async_trait::async_trait]
impl StepAction for CleanHostname {
    async fn run(
        &self,
        _ctx: &StepContext,
        batch: &TargetBatch,
        _params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        for handle in batch.iter() {
            let mut target = handle.lock().await;
            tracing::warn!(target = %target.id, hostname = ?target.hostname, "Clearing hostname");
            target.hostname = None;
        }
        Ok(TargetFailures::new())
    }
}

pub struct CleanDns;

#[async_trait::async_trait]
impl StepAction for CleanDns {
    async fn run(
        &self,
        ctx: &StepContext,
        batch: &TargetBatch,
        _params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let mut failures = TargetFailures::new();

        for handle in batch.iter() {
            let addresses = handle.snapshot().await.ip_addresses();
            if let Err(err) = clean_dns_for(ctx, &addresses).await {
                record_failure(&mut failures, handle.id(), err)?;
            }
        }

        Ok(failures)
    }
}

async fn clean_dns_for(ctx: &StepContext, addresses: &[IpAddr]) -> anyhow::Result<()> {
    let records = ctx.services.records.dns_records(addresses).await?;
    for record in records {
        tracing::warn!(
            "Deleting {} ({} / {} / {}) DNS record",
            record.id,
            record.record_type,
            record.name,
            record.content
        );
        ctx.services
            .records
            .delete_dns_record(&record.id)
            .await
            .with_context(|| format!("Failed to delete DNS record {}", record.id))?;
    }
    Ok(())
}

pub struct CleanIpAddresses;

#[async_trait::async_trait]
impl StepAction for CleanIpAddresses {
    async fn run(
        &self,
        _ctx: &StepContext,
        batch: &TargetBatch,
        _params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        for handle in batch.iter() {
            let mut target = handle.lock().await;
            let id = target.id.clone();
            for eth in target.interfaces.iter_mut() {
                eth.ips.retain(|ip| {
                    if !ip.is_management {
                        tracing::warn!(target = %id, address = %ip.address, "Deleting IP address");
                    }
                    ip.is_management
                });
            }
        }
        Ok(TargetFailures::new())
    }
}

pub struct CleanDhcp;

#[async_trait::async_trait]
impl StepAction for CleanDhcp {
    async fn run(
        &self,
        ctx: &StepContext,
        batch: &TargetBatch,
        _params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let mut failures = TargetFailures::new();

        for handle in batch.iter() {
            let target = handle.snapshot().await;
            let macs: Vec<String> = target
                .non_management_interfaces()
                .iter()
                .filter_map(|eth| eth.mac.clone())
                .collect();
            if macs.is_empty() {
                tracing::debug!(target = %target.id, "No non-management interface, nothing to clean");
                continue;
            }

            if let Err(err) = clean_dhcp_for(ctx, &macs).await {
                record_failure(&mut failures, &target.id, err)?;
            }
        }

        Ok(failures)
    }
}

async fn clean_dhcp_for(ctx: &StepContext, macs: &[String]) -> anyhow::Result<()> {
    for entry in ctx.services.records.dhcp_entries(macs).await? {
        tracing::warn!(mac = %entry.mac, address = %entry.address, "Removing DHCP entry {}", entry.id);
        ctx.services
            .records
            .delete_dhcp_entry(&entry.id)
            .await
            .with_context(|| format!("Failed to delete DHCP entry {}", entry.id))?;
    }
    Ok(())
}

pub struct AssignNewHostname;

#[async_trait::async_trait]
impl StepAction for AssignNewHostname {
    async fn run(
        &self,
        ctx: &StepContext,
        batch: &TargetBatch,
        params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let environment = strip_key(params.require("hostname")?, NEXT_FREE_HOSTNAME)?;
        let mut failures = TargetFailures::new();

        for handle in batch.iter() {
            match ctx.services.allocator.issue_next_free_hostname(environment).await {
                Ok(hostname) => {
                    tracing::info!(target = %handle.id(), "Assigning {}", hostname);
                    handle.lock().await.hostname = Some(hostname);
                }
                Err(err) => record_failure(&mut failures, handle.id(), err)?,
            }
        }

        Ok(failures)
    }
}

/// Persists its own IP bindings and DHCP reservations
pub struct CreateDhcpEntries;

#[async_trait::async_trait]
impl StepAction for CreateDhcpEntries {
    async fn run(
        &self,
        ctx: &StepContext,
        batch: &TargetBatch,
        params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let ip_or_network = params.require("ip_or_network")?;
        // A single target names its interface; a batch uses each target's first one
        let chosen = match params.get("ethernet").map(ParamValue::as_str) {
            Some(key) if batch.len() == 1 && key != USE_FIRST_MAC => Some(InterfaceId::new(key)),
            _ => None,
        };

        let mut failures = TargetFailures::new();
        for handle in batch.iter() {
            let target = handle.snapshot().await;
            let created = create_entry_for(ctx, &target, ip_or_network, chosen.as_ref()).await;
            match created {
                Ok((interface, binding)) => {
                    let mut target = handle.lock().await;
                    if let Some(eth) = target.interface_mut(&interface) {
                        eth.ips.push(binding);
                    }
                }
                Err(err) => record_failure(&mut failures, &target.id, err)?,
            }
        }

        Ok(failures)
    }
}

async fn create_entry_for(
    ctx: &StepContext,
    target: &Target,
    ip_or_network: &ParamValue,
    chosen: Option<&InterfaceId>,
) -> anyhow::Result<(InterfaceId, IpBinding)> {
    let eth = match chosen {
        Some(id) => target
            .interface(id)
            .ok_or_else(|| anyhow!("Interface {} does not belong to {}", id, target.id))?,
        None => target
            .first_non_management_interface()
            .ok_or_else(|| anyhow!("Non-management MAC address not found"))?,
    };
    let mac = eth
        .mac
        .as_deref()
        .ok_or_else(|| anyhow!("Interface {} has no MAC address", eth.id))?;

    let address = match ip_or_network {
        ParamValue::Other(literal) => literal
            .parse::<IpAddr>()
            .with_context(|| format!("'{}' is not a valid IP address", literal))?,
        value => {
            let network = strip_key(value, NEXT_FREE_IP)?;
            ctx.services.allocator.issue_next_free_ip(network).await?
        }
    };

    // Reserve first so a refused reservation leaves no binding behind
    let entry = ctx
        .services
        .records
        .create_dhcp_entry(mac, address)
        .await
        .with_context(|| format!("Failed to reserve {} for {}", address, mac))?;

    let binding = IpBinding::new(address);
    if let Err(err) = ctx
        .services
        .assets
        .create_ip_binding(&target.id, &eth.id, &binding)
        .await
    {
        return Err(match ctx.services.records.delete_dhcp_entry(&entry.id).await {
            Ok(()) => err.context(format!("Released DHCP entry {} after the binding failed", entry.id)),
            Err(release) => err.context(format!(
                "DHCP entry {} for {} left reserved: {:#}",
                entry.id, address, release
            )),
        });
    }

    tracing::info!(
        target = %target.id,
        interface = %eth.id,
        address = %address,
        "Created DHCP entry {} for {}",
        entry.id,
        mac
    );
    Ok((eth.id.clone(), binding))
}

pub struct AssignServiceEnv;

#[async_trait::async_trait]
impl StepAction for AssignServiceEnv {
    async fn run(
        &self,
        _ctx: &StepContext,
        batch: &TargetBatch,
        params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let service_env = params.require("service_env")?.as_str();
        for handle in batch.iter() {
            handle.lock().await.service_env = Some(service_env.to_string());
        }
        Ok(TargetFailures::new())
    }
}

pub struct AssignConfigurationPath;

#[async_trait::async_trait]
impl StepAction for AssignConfigurationPath {
    async fn run(
        &self,
        _ctx: &StepContext,
        batch: &TargetBatch,
        params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let path = params.require("configuration_path")?.as_str();
        for handle in batch.iter() {
            tracing::info!(target = %handle.id(), "Assigning {} configuration path", path);
            handle.lock().await.configuration_path = Some(path.to_string());
        }
        Ok(TargetFailures::new())
    }
}

pub struct ApplyPreboot {
    preboots: Vec<Choice>,
}

#[async_trait::async_trait]
impl StepAction for ApplyPreboot {
    async fn run(
        &self,
        _ctx: &StepContext,
        batch: &TargetBatch,
        params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let key = params.require("preboot")?.as_str();
        let label = self
            .preboots
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.label.as_str())
            .unwrap_or(key);

        for handle in batch.iter() {
            tracing::info!(target = %handle.id(), "Applying preboot {}", label);
            handle.lock().await.preboot = Some(key.to_string());
        }
        Ok(TargetFailures::new())
    }
}

pub struct WaitForPing;

#[async_trait::async_trait]
impl StepAction for WaitForPing {
    async fn run(
        &self,
        ctx: &StepContext,
        batch: &TargetBatch,
        _params: &StepParams,
    ) -> anyhow::Result<TargetFailures> {
        let mut failures = TargetFailures::new();
        for handle in batch.iter() {
            let target = handle.snapshot().await;
            match ctx.services.prober.wait_reachable(&target).await {
                Ok(()) => tracing::info!(target = %target.id, "Target is reachable"),
                Err(err) => record_failure(&mut failures, &target.id, err)?,
            }
        }
        Ok(failures)
    }
}

// Registration

/// Register the deployment steps in their canonical order
pub fn register_deployment_steps(
    builder: &mut StepRegistryBuilder,
    config: &DeploymentConfig,
) -> TransitionResult<()> {
    let steps = vec![
        StepDefinition::new("clean_hostname", "Clean hostname", CleanHostname),
        StepDefinition::new("clean_dns", "Clean DNS entries", CleanDns)
            .run_after(["clean_hostname"])
            .asynchronous(),
        StepDefinition::new("clean_ipaddresses", "Clean IP addresses", CleanIpAddresses)
            .run_after(["clean_dns"]),
        StepDefinition::new("clean_dhcp", "Clean DHCP entries", CleanDhcp)
            .run_after(["clean_dns", "clean_ipaddresses"]),
        StepDefinition::new("assign_new_hostname", "Assign new hostname", AssignNewHostname)
            .run_after(["clean_dns", "clean_dhcp"])
            .param(ParamSpec::choice("hostname", "Hostname", next_free_hostname_choices)),
        StepDefinition::new(
            "create_dhcp_entries",
            "Assign new IP address and create DHCP entries",
            CreateDhcpEntries,
        )
        .run_after(["clean_ipaddresses", "clean_dhcp"])
        .param(
            ParamSpec::choice("ip_or_network", "IP Address", next_free_ip_choices)
                .with_other(validate_ip_address),
        )
        .param(ParamSpec::choice("ethernet", "MAC Address", mac_choices_for_targets))
        .precondition(check_mac_address)
        .disable_save_object(),
        StepDefinition::new("assign_service_env", "Change service-env", AssignServiceEnv)
            .run_after(["clean_dns", "clean_dhcp"])
            .param(
                ParamSpec::text("service_env", "Service-environment")
                    .with_default(autocomplete_service_env),
            ),
        StepDefinition::new(
            "assign_configuration_path",
            "Change configuration_path",
            AssignConfigurationPath,
        )
        .run_after(["clean_dns", "clean_dhcp"])
        .param(
            ParamSpec::text("configuration_path", "Configuration path")
                .with_default(autocomplete_configuration_path),
        ),
        StepDefinition::new(
            "apply_preboot",
            "Apply preboot",
            ApplyPreboot {
                preboots: config.preboots.clone(),
            },
        )
        .param(ParamSpec::static_choice("preboot", "Preboot", config.preboots.clone())),
        StepDefinition::new("wait_for_ping", "Wait for ping", WaitForPing)
            .run_after(["create_dhcp_entries"])
            .asynchronous()
            .disable_save_object(),
    ];

    for step in steps {
        builder.register(step.for_kinds(DEPLOYMENT_KINDS))?;
    }
    Ok(())
}

/// Registry holding only the deployment catalog
pub fn deployment_registry(config: &DeploymentConfig) -> TransitionResult<StepRegistry> {
    let mut builder = StepRegistry::builder();
    register_deployment_steps(&mut builder, config)?;
    builder.build()
}

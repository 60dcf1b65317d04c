use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use provision_core::deployment::deployment_registry;
use provision_core::storage::JsonlEventLog;
use provision_core::workflow::{StepRegistry, TransitionCoordinator, TransitionRequest};
use provision_core::{Services, StepId, TargetId, TargetKind};
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod inventory;
mod prober;

use config::CliConfig;
use inventory::{Backends, Inventory};
use prober::TcpProber;

#[derive(Parser, Debug)]
#[command(name = "provision")]
#[command(about = "Asset provisioning transitions", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "provision.toml")]
    config: PathBuf,

    /// Data directory holding the inventory and the event log
    #[arg(short, long, default_value = "./data", env = "PROVISION_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered steps
    Steps {
        /// Only steps applicable to this target kind
        #[arg(long)]
        kind: Option<TargetKind>,
    },

    /// Print the execution plan of a step selection
    Plan {
        #[arg(long = "step", required = true)]
        steps: Vec<String>,
    },

    /// Print the parameter fields of a step for a batch of targets
    Choices {
        #[arg(long)]
        step: String,

        /// Only this field
        #[arg(long)]
        param: Option<String>,

        #[arg(long = "target", required = true)]
        targets: Vec<String>,

        /// Other steps selected for the same transition
        #[arg(long = "with")]
        with: Vec<String>,
    },

    /// Run a transition against a batch of targets
    Run {
        #[arg(long = "step", required = true)]
        steps: Vec<String>,

        #[arg(long = "target", required = true)]
        targets: Vec<String>,

        /// Raw field value as step.field=value
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<ParamArg>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParamArg {
    step: String,
    field: String,
    value: String,
}

fn parse_param(raw: &str) -> Result<ParamArg, String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected step.field=value, got '{}'", raw))?;
    let (step, field) = key
        .split_once('.')
        .filter(|(step, field)| !step.is_empty() && !field.is_empty())
        .ok_or_else(|| format!("expected step.field before '=', got '{}'", key))?;

    Ok(ParamArg {
        step: step.to_string(),
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Collaborators and coordinator for commands that touch the inventory
struct App {
    backends: Backends,
    event_log: Arc<JsonlEventLog>,
    coordinator: Arc<TransitionCoordinator>,
}

impl App {
    fn open(config: &CliConfig, registry: Arc<StepRegistry>) -> Result<Self> {
        let backends = Inventory::load(&config.inventory_path())?.into_backends(&config.integrations);
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let services = Services {
            assets: backends.assets.clone(),
            allocator: backends.allocator.clone(),
            records: backends.records.clone(),
            prober: Arc::new(TcpProber::new(&config.probe)),
            event_log: event_log.clone(),
        };
        let coordinator = Arc::new(TransitionCoordinator::new(registry, services));

        Ok(Self {
            backends,
            event_log,
            coordinator,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "provision=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = CliConfig::load(&args.config, args.data_dir)?;
    let registry = Arc::new(deployment_registry(&config.deployment())?);

    match args.command {
        Command::Steps { kind } => list_steps(&registry, kind),
        Command::Plan { steps } => {
            let plan = registry_plan(&registry, &steps)?;
            for (i, step) in plan.iter().enumerate() {
                println!("{}. {}", i + 1, step);
            }
        }
        Command::Choices {
            step,
            param,
            targets,
            with,
        } => {
            let app = App::open(&config, registry)?;
            let step = StepId::new(step);
            let mut selection: Vec<StepId> = with.into_iter().map(StepId::new).collect();
            selection.push(step.clone());
            let targets: Vec<TargetId> = targets.into_iter().map(TargetId::new).collect();

            let fields = app
                .coordinator
                .describe_params(&step, &selection, &targets)
                .await?;
            let fields: Vec<_> = fields
                .into_iter()
                .filter(|f| param.as_ref().map_or(true, |p| &f.name == p))
                .collect();
            println!("{}", serde_json::to_string_pretty(&fields)?);
        }
        Command::Run {
            steps,
            targets,
            params,
        } => {
            let app = App::open(&config, registry)?;
            let code = run_transition(&config, &app, steps, targets, params).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

fn list_steps(registry: &StepRegistry, kind: Option<TargetKind>) {
    let steps = match kind {
        Some(kind) => registry.filter_applicable(&[kind]),
        None => registry.iter().cloned().collect(),
    };
    for step in steps {
        let mode = if step.is_async() { "async" } else { "sync" };
        let run_after: Vec<&str> = step.run_after.iter().map(StepId::as_str).collect();
        println!(
            "{:<28} {:<6} {:<48} after: [{}]",
            step.id,
            mode,
            step.label,
            run_after.join(", ")
        );
    }
}

fn registry_plan(registry: &StepRegistry, steps: &[String]) -> Result<Vec<StepId>> {
    let selected: Vec<StepId> = steps.iter().map(StepId::new).collect();
    let plan = provision_core::workflow::StepPlan::build(registry, &selected)?;
    Ok(plan.step_ids())
}

async fn run_transition(
    config: &CliConfig,
    app: &App,
    steps: Vec<String>,
    targets: Vec<String>,
    params: Vec<ParamArg>,
) -> Result<i32> {
    let mut request = TransitionRequest::new(steps, targets);
    for param in params {
        request = request.with_param(param.step, param.field, param.value);
    }
    let run_id = request.run_id;

    tracing::info!("Starting transition {}", run_id);

    // Ctrl-C stops the run before its next step
    let interrupt = {
        let coordinator = app.coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling transition {}", run_id);
                if let Err(err) = coordinator.cancel(run_id).await {
                    tracing::warn!("Failed to cancel transition: {}", err);
                }
            }
        })
    };

    let result = app.coordinator.run(request).await;
    interrupt.abort();
    app.event_log.flush(&run_id).await?;
    let report = result?;

    Inventory::capture(&app.backends)
        .await
        .save(&config.inventory_path())?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(report.status.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use provision_core::{InterfaceId, IpBinding, NetworkInterface, Resource, RunStatus, Target};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("create_dhcp_entries.ip_or_network__other=10.0.0.5").unwrap(),
            ParamArg {
                step: "create_dhcp_entries".to_string(),
                field: "ip_or_network__other".to_string(),
                value: "10.0.0.5".to_string(),
            }
        );
        // Only the first '=' separates the value
        assert_eq!(parse_param("s.f=a=b").unwrap().value, "a=b");
        assert!(parse_param("no-separator").is_err());
        assert!(parse_param("field=value").is_err());
        assert!(parse_param(".field=value").is_err());
    }

    #[test]
    fn test_args_parse_run() {
        let args = Args::try_parse_from([
            "provision",
            "run",
            "--step",
            "clean_hostname",
            "--step",
            "clean_dns",
            "--target",
            "vm-1",
            "--param",
            "apply_preboot.preboot=2",
        ])
        .unwrap();
        match args.command {
            Command::Run { steps, targets, params } => {
                assert_eq!(steps, vec!["clean_hostname", "clean_dns"]);
                assert_eq!(targets, vec!["vm-1"]);
                assert_eq!(params[0].field, "preboot");
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Args::try_parse_from(["provision", "steps", "--kind", "rack"]).is_err());
    }

    #[test]
    fn test_registry_plan_orders_selection() {
        let registry = deployment_registry(&Default::default()).unwrap();
        let plan = registry_plan(
            &registry,
            &["clean_dhcp".to_string(), "clean_hostname".to_string()],
        )
        .unwrap();
        assert_eq!(plan, vec![StepId::new("clean_hostname"), StepId::new("clean_dhcp")]);
    }

    #[tokio::test]
    async fn test_run_writes_inventory_back() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load(&dir.path().join("absent.toml"), dir.path().to_path_buf()).unwrap();

        let mut target = Target::new("vm-1", TargetKind::VirtualServer);
        target.hostname = Some("old.example".to_string());
        target.interfaces.push(NetworkInterface {
            id: InterfaceId::new("eth0"),
            mac: Some("aa:bb:cc:00:00:01".to_string()),
            ips: vec![IpBinding::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))],
        });
        target.network_environments = vec![Resource::new("env-1", "DC1")];
        let inventory = Inventory {
            targets: vec![target],
            hostname_pools: [("env-1".to_string(), vec!["s001.dc1".to_string()])].into(),
            ..Default::default()
        };
        inventory.save(&config.inventory_path()).unwrap();

        let registry = Arc::new(deployment_registry(&config.deployment()).unwrap());
        let app = App::open(&config, registry).unwrap();
        let code = run_transition(
            &config,
            &app,
            vec!["clean_hostname".to_string(), "assign_new_hostname".to_string()],
            vec!["vm-1".to_string()],
            vec![],
        )
        .await
        .unwrap();
        assert_eq!(code, RunStatus::Completed.exit_code());

        let saved = Inventory::load(&config.inventory_path()).unwrap();
        assert_eq!(saved.targets[0].hostname.as_deref(), Some("s001.dc1"));
        assert!(saved.hostname_pools["env-1"].is_empty());
        // The run's audit log was flushed to disk
        assert!(config.event_log_path().join("events").exists());
    }
}

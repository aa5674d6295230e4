/*
* Command line interface
* ----------------------
* cluster-gpu-coordinator
* ├── serve [--port]                      HTTP API
* ├── preflight <config>                  shared-GPU check, no state touched
* ├── populate <config>                   create/update VM records from config
* ├── status [cluster]                    per-cluster summary
* ├── gpus                                live allocation table
* ├── transition <cluster> <vm> <target>  drive a VM to defined/running/paused/stopped/destroyed
* ├── restart <cluster> <vm>
* ├── forget <cluster> <vm>               drop a destroyed VM record
* ├── verify                              records vs. allocation table
* ├── drift                               records vs. hypervisor
* ├── recover                             restore the newest good backup (offline)
* └── init [--force]                      write config/default.toml
*/

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use tracing::{error, info};

use crate::api::routes::{create_router, AppState};
use crate::config::cluster::MergedConfig;
use crate::config::Settings;
use crate::coordinator::Coordinator;
use crate::core::libvirt::VirshHypervisor;
use crate::core::lifecycle::{CleanupOutcome, TransitionOutcome};
use crate::core::vm::VmState;
use crate::state::models::ClusterKind;

#[derive(Parser)]
#[command(name = "cluster-gpu-coordinator")]
#[command(about = "VM state and GPU ownership for the HPC and cloud clusters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file; defaults to the layered config/ directory
    #[arg(short, long, value_name = "SETTINGS")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Report GPUs declared by both clusters
    Preflight { cluster_config: PathBuf },
    /// Create or update VM records from a merged cluster configuration
    Populate { cluster_config: PathBuf },
    /// Show cluster status
    Status { cluster: Option<ClusterKind> },
    /// List live GPU allocations
    Gpus,
    /// Request a lifecycle transition
    Transition {
        cluster: ClusterKind,
        vm: String,
        target: VmState,
    },
    /// Stop (if running) and start a VM
    Restart { cluster: ClusterKind, vm: String },
    /// Remove a destroyed VM from the state
    Forget { cluster: ClusterKind, vm: String },
    /// Check the allocation table against VM records
    Verify,
    /// Compare recorded states with the hypervisor
    Drift,
    /// Restore the state file from its newest valid backup
    Recover,
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::new().context("failed to load settings")?,
    };

    match cli.command {
        Commands::Init { force } => handle_init_command(force),
        Commands::Recover => {
            let (backup, state) = Coordinator::restore_latest_backup(&settings.state)?;
            println!(
                "{} Restored {} cluster(s) from {}",
                "✓".green(),
                state.clusters.len(),
                backup.display()
            );
            Ok(())
        }
        Commands::Preflight { cluster_config } => {
            let coordinator = open(settings)?;
            let config = MergedConfig::from_file(&cluster_config)?;
            let report = coordinator.run_preflight_validation(&config)?;
            println!(
                "{} GPUs declared: {} total, {} shared, {} exclusive",
                "•".cyan(),
                report.summary.total,
                report.summary.shared,
                report.summary.exclusive
            );
            for (addr, clusters) in &report.shared {
                let names: Vec<String> = clusters.iter().map(ToString::to_string).collect();
                println!("  {} {} -> {}", "shared".yellow(), addr, names.join(", "));
            }
            Ok(())
        }
        Commands::Populate { cluster_config } => {
            let coordinator = open(settings)?;
            let config = MergedConfig::from_file(&cluster_config)?;
            let report = coordinator.populate_from_config(&config).await?;
            for name in &report.created {
                println!("{} created {}", "+".green(), name);
            }
            for name in &report.updated {
                println!("{} updated {}", "~".yellow(), name);
            }
            println!("{} {} unchanged", "•".cyan(), report.unchanged.len());
            Ok(())
        }
        Commands::Status { cluster } => {
            let coordinator = open(settings)?;
            let snapshot = coordinator.snapshot().await;
            let kinds: Vec<ClusterKind> = match cluster {
                Some(kind) => vec![kind],
                None => snapshot.clusters.keys().copied().collect(),
            };
            for kind in kinds {
                let status = coordinator.cluster_status(kind).await?;
                println!(
                    "{} ({}): {} VMs, {} running, {} GPUs assigned",
                    status.name.bold(),
                    kind,
                    status.total_vms,
                    status.running,
                    status.gpus_assigned
                );
                for vm in &coordinator.get_cluster_snapshot(kind).await?.vms {
                    let gpus: Vec<&str> = vm.gpus.iter().map(|g| g.as_str()).collect();
                    println!("  - {} [{}] {}", vm.name, paint(vm.state), gpus.join(" "));
                    if let Some(err) = &vm.last_error {
                        println!("      {}", err.red());
                    }
                }
            }
            Ok(())
        }
        Commands::Gpus => {
            let coordinator = open(settings)?;
            let table = coordinator.list_gpu_allocations();
            if table.is_empty() {
                println!("No GPUs allocated");
            }
            for (addr, owner) in table {
                println!("{} -> {}", addr, owner.to_string().green());
            }
            Ok(())
        }
        Commands::Transition {
            cluster,
            vm,
            target,
        } => {
            let coordinator = open(settings)?;
            let outcome = coordinator.request_transition(cluster, &vm, target).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Commands::Restart { cluster, vm } => {
            let coordinator = open(settings)?;
            for outcome in coordinator.restart(cluster, &vm).await? {
                print_outcome(&outcome);
            }
            Ok(())
        }
        Commands::Forget { cluster, vm } => {
            let coordinator = open(settings)?;
            coordinator.forget_vm(cluster, &vm).await?;
            println!("{} {} forgotten", "✓".green(), vm);
            Ok(())
        }
        Commands::Verify => {
            let coordinator = open(settings)?;
            let issues = coordinator.verify_integrity().await;
            if issues.is_empty() {
                println!("{} Allocation table matches VM records", "✓".green());
                return Ok(());
            }
            for issue in &issues {
                println!("{} {}", "✗".red(), serde_json::to_string(issue)?);
            }
            bail!("{} integrity issue(s) found", issues.len())
        }
        Commands::Drift => {
            let coordinator = open(settings)?;
            let reports = coordinator.detect_drift().await;
            if reports.is_empty() {
                println!("{} No drift", "✓".green());
            }
            for report in reports {
                let observed = match (&report.observed, &report.error) {
                    (Some(state), _) => format!("{state:?}"),
                    (None, Some(err)) => err.clone(),
                    (None, None) => "unknown".to_string(),
                };
                println!(
                    "{} {}/{}: recorded {}, hypervisor says {}",
                    "!".yellow(),
                    report.cluster,
                    report.vm,
                    paint(report.recorded),
                    observed
                );
            }
            Ok(())
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(settings.server.port);
            let host = settings.server.host.clone();
            let coordinator = Arc::new(open(settings)?);
            let app = create_router(Arc::new(AppState { coordinator }));

            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("invalid listen address {host}:{port}"))?;
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);
            axum::serve(listener, app).await?;
            Ok(())
        }
    }
}

fn open(settings: Settings) -> Result<Coordinator> {
    let hypervisor = Arc::new(VirshHypervisor::new(settings.hypervisor.connection_uri.clone()));
    Coordinator::open(settings, hypervisor).context("failed to open coordinator state")
}

fn paint(state: VmState) -> ColoredString {
    match state {
        VmState::Running => state.as_str().green(),
        VmState::Error => state.as_str().red(),
        VmState::Paused | VmState::Stopped | VmState::Defined => state.as_str().yellow(),
        _ => state.as_str().normal(),
    }
}

fn print_outcome(outcome: &TransitionOutcome) {
    println!(
        "{} {}/{}: {} -> {}",
        "✓".green(),
        outcome.cluster,
        outcome.vm,
        outcome.from,
        paint(outcome.to)
    );
    if !outcome.released.is_empty() {
        let freed: Vec<&str> = outcome.released.iter().map(|a| a.as_str()).collect();
        println!("  released {}", freed.join(" "));
    }
    if let CleanupOutcome::Partial { failures } = &outcome.cleanup {
        for failure in failures {
            println!("  {} {}", "cleanup:".yellow(), failure);
        }
    }
}

fn handle_init_command(force: bool) -> Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        error!("Configuration already exists. Use --force to overwrite.");
        bail!("{} already exists", target.display());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}

//! hostlbd — cluster guest balancer.
//!
//! # Usage
//!
//! ```text
//! hostlbd run --config /etc/hostlb/hostlb.toml --inventory cluster.json
//! hostlbd plan --config hostlb.toml --inventory cluster.json --json
//! hostlbd check-config --config hostlb.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use hostlb_collector::StateCollector;
use hostlb_core::{BalancerConfig, ClusterProvider, InMemoryProvider, MigrationPlan};
use hostlb_executor::ExecutorSettings;
use hostlb_placement::BalancingEngine;
use hostlbd::{Balancer, LogFormat, logging};

#[derive(Parser)]
#[command(name = "hostlbd", about = "Cluster guest balancer", version)]
struct Cli {
    /// Log line format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run balancing cycles.
    Run {
        /// Path to hostlb.toml.
        #[arg(long, short)]
        config: PathBuf,

        /// Plan only; never migrate.
        #[arg(long)]
        dry_run: bool,

        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,

        /// Cluster inventory (JSON) served by the simulated provider.
        #[arg(long)]
        inventory: Option<PathBuf>,
    },

    /// Compute and print a plan without executing it.
    Plan {
        #[arg(long, short)]
        config: PathBuf,

        #[arg(long)]
        inventory: PathBuf,

        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file.
    CheckConfig {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            dry_run,
            once,
            inventory,
        } => {
            let mut config = load_config(&config)?;
            logging::init(cli.log_format, &config.service.log_level);
            config.execution.dry_run |= dry_run;
            if once {
                config.service.daemon = false;
            }
            let Some(inventory) = inventory else {
                bail!("no hypervisor client is configured; pass --inventory <json>");
            };
            run(config, &inventory).await
        }
        Command::Plan {
            config,
            inventory,
            json,
        } => {
            let config = load_config(&config)?;
            logging::init(cli.log_format, &config.service.log_level);
            plan(config, &inventory, json).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<BalancerConfig> {
    BalancerConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn load_provider(path: &Path) -> anyhow::Result<Arc<dyn ClusterProvider>> {
    let provider = InMemoryProvider::from_file(path)
        .with_context(|| format!("loading inventory {}", path.display()))?;
    Ok(Arc::new(provider))
}

async fn run(config: BalancerConfig, inventory: &Path) -> anyhow::Result<()> {
    let provider = load_provider(inventory)?;
    let balancer = Balancer::new(provider, config)?;

    if !balancer.config().service.daemon {
        let summary = balancer.run_cycle().await?;
        println!("{}", serde_json::to_string_pretty(&summary.to_json())?);
        if !summary.is_success() {
            bail!("some migrations did not complete");
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    balancer.run_service(shutdown_rx).await?;
    info!("hostlbd stopped");
    Ok(())
}

async fn plan(config: BalancerConfig, inventory: &Path, json: bool) -> anyhow::Result<()> {
    let provider = load_provider(inventory)?;
    let engine = BalancingEngine::from_config(&config.balancing)?;
    let state = StateCollector::new(provider, config).collect().await?;
    let plan = engine.plan(&state);

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(())
}

fn print_plan(plan: &MigrationPlan) {
    println!(
        "method {} ({:?}), deviation {:.4} -> {:.4}",
        plan.method, plan.mode, plan.deviation_before, plan.deviation_after
    );
    for (before, after) in plan.before.iter().zip(&plan.after) {
        let flag = if before.maintenance { " [maintenance]" } else { "" };
        println!(
            "  {:<16} {:>6.1}% -> {:>6.1}%{flag}",
            before.node,
            before.load * 100.0,
            after.load * 100.0
        );
    }
    if plan.is_empty() {
        println!("no migrations");
    }
    for (i, action) in plan.actions.iter().enumerate() {
        println!(
            "  {:>3}. {} {} -> {} (score {:+.4})",
            i + 1,
            action.guest,
            action.source,
            action.target,
            action.score_delta
        );
    }
    for diagnostic in &plan.diagnostics {
        println!("note: {diagnostic}");
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let method = config.balancing.method()?;
    let settings = ExecutorSettings::from_config(&config.execution)?;
    println!(
        "{}: ok (method {}, mode {:?}, concurrency {}, dry_run {}, interval {})",
        path.display(),
        method,
        config.balancing.mode,
        settings.concurrency,
        config.execution.dry_run,
        config.service.interval
    );
    Ok(())
}

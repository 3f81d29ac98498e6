//! cloudscaled: the cloudscale daemon.
//!
//! Watches local CPU and memory and keeps at most one overflow VM running
//! while the host is overloaded:
//! - Load sampler (sysinfo)
//! - Compute + SSH through the gcloud CLI
//! - Load balancer reload through the docker CLI
//!
//! # Usage
//!
//! ```text
//! cloudscaled run --config cloudscale.toml
//! cloudscaled status
//! cloudscaled teardown
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use cloudscale_autoscale::{Controller, ControllerDeps, SystemLoadSampler};
use cloudscale_config::ControllerConfig;
use cloudscale_provider::{DockerCli, GcloudCompute, GcloudSsh};

#[derive(Parser)]
#[command(name = "cloudscaled", about = "Load-driven overflow VM controller")]
struct Cli {
    /// TOML config file. Environment variables override its values.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop until interrupted.
    Run {
        /// Run a single iteration and exit.
        #[arg(long)]
        once: bool,
    },
    /// Print current load, instance state, and load balancer backend.
    Status {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Delete the managed instance if it exists.
    Teardown,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = ControllerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let controller = build_controller(config);

    match cli.command {
        Command::Run { once } => run(controller, once).await,
        Command::Status { json } => status(controller, json).await,
        Command::Teardown => teardown(controller).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "info,cloudscaled=debug,cloudscale_autoscale=debug,cloudscale_provider=debug",
        )
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_controller(config: ControllerConfig) -> Controller {
    let sampler = SystemLoadSampler::new(config.policy.sample_window);
    Controller::new(
        config,
        ControllerDeps {
            compute: Arc::new(GcloudCompute::new()),
            remote: Arc::new(GcloudSsh::new()),
            runtime: Arc::new(DockerCli::new()),
            sampler: Arc::new(sampler),
        },
    )
}

async fn run(mut controller: Controller, once: bool) -> anyhow::Result<()> {
    info!(instance = %controller.instance(), "cloudscale daemon starting");

    if once {
        controller.cleanup_on_start().await;
        let outcome = controller.tick().await;
        info!(?outcome, "single iteration complete");
        return Ok(());
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await;

    info!("cloudscale daemon stopped");
    Ok(())
}

async fn status(controller: Controller, json: bool) -> anyhow::Result<()> {
    let sample = controller.sample_load().await?;
    let exists = controller.instance_exists().await;
    let address = if exists {
        Some(controller.external_address().await)
    } else {
        None
    };
    let backend_file = controller.load_balancer().backend_file().display().to_string();
    let backend = controller
        .load_balancer()
        .read_backend()
        .await
        .ok()
        .map(|s| s.trim_end().to_string());

    if json {
        let report = serde_json::json!({
            "instance": controller.instance().to_string(),
            "cpu_percent": sample.cpu_percent,
            "mem_percent": sample.mem_percent,
            "instance_exists": exists,
            "address": address,
            "backend_file": backend_file,
            "backend": backend,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("instance:  {}", controller.instance());
    println!("cpu:       {:.1}%", sample.cpu_percent);
    println!("memory:    {:.1}%", sample.mem_percent);
    match address {
        Some(addr) => println!("running:   yes ({addr})"),
        None => println!("running:   no"),
    }
    match backend {
        Some(line) => println!("backend:   {line} ({backend_file})"),
        None => println!("backend:   <unreadable> ({backend_file})"),
    }
    Ok(())
}

async fn teardown(mut controller: Controller) -> anyhow::Result<()> {
    if !controller.instance_exists().await {
        info!(instance = %controller.instance(), "no managed instance to delete");
        return Ok(());
    }
    controller
        .decommission()
        .await
        .with_context(|| format!("deleting {}", controller.instance()))?;
    Ok(())
}

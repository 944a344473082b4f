use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use p2v_transfer::config::{AppConfig, HostKeyPolicy};
use p2v_transfer::core::{MigrationRequest, Orchestrator};
use p2v_transfer::{context, logging};
use serde::Serialize;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "p2v-transfer")]
#[command(about = "Copy a physical machine's root filesystem onto a freshly booted instance", long_about = None)]
struct Cli {
    /// Block device holding the source root filesystem
    root_dev: String,

    /// Hostname or address of the target instance
    target_host: String,

    /// Unencrypted private key accepted by the target
    private_key: PathBuf,

    /// Transfer even if the source has no modules for the target's kernel
    #[arg(long)]
    skip_kernel_check: bool,

    /// TOML config file (default: /etc/p2v-transfer/config.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read the device table from this file instead of the source's /etc/fstab
    #[arg(long)]
    fstab: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    host_key_policy: Option<HostKeyPolicy>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    simulation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let fstab = match &cli.fstab {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read device table {}", path.display()))?,
        ),
        None => None,
    };

    let request = MigrationRequest {
        root_device: cli.root_dev,
        host: cli.target_host,
        key_file: cli.private_key,
        skip_kernel_check: cli.skip_kernel_check,
        fstab,
    };

    let run_id = Uuid::now_v7();
    let span = info_span!("migration", run_id = %run_id, host = %request.host);

    async {
        info!(
            root_device = %request.root_device,
            simulation = config.simulation,
            "Starting transfer"
        );

        let ctx = context::AppContext::new(config, &request);
        let orchestrator = Orchestrator::new(ctx);
        let interrupt = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        orchestrator.run_until(request, interrupt).await?;
        info!("Transfer finished");
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

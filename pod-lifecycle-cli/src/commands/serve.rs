use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use pod_lifecycle::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_named_target, NamedTarget};

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Configuration file (defaults to ./pod-lifecycle.toml when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Answer probes over the gRPC health protocol instead of HTTP
    #[arg(long)]
    pub grpc: bool,

    /// Port for the selected protocol
    #[arg(long, short)]
    pub port: Option<u32>,

    /// TCP dependency check, repeatable
    #[arg(long = "check", value_name = "NAME=HOST:PORT", value_parser = parse_named_target)]
    pub checks: Vec<NamedTarget>,

    /// HTTP dependency check (2xx required), repeatable
    #[arg(long = "http-check", value_name = "NAME=URL", value_parser = parse_named_target)]
    pub http_checks: Vec<NamedTarget>,

    /// Seconds to wait after startup before reporting ready
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub ready_after: u64,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ProbeConfig::load_from(path),
        None => ProbeConfig::load(),
    }
    .context("Failed to load configuration")?;

    if args.grpc {
        config.mechanism = CheckMechanism::Grpc;
    }
    if let Some(port) = args.port {
        match config.mechanism {
            CheckMechanism::Http => config.http_port = port,
            CheckMechanism::Grpc => config.grpc_port = port,
        }
    }

    init_tracing(&config).context("Failed to initialize tracing")?;

    let mut builder = PodManager::builder().with_config(config);
    for check in args.checks {
        builder = builder.with_checker(check.name, TcpChecker::new(check.target));
    }
    for check in args.http_checks {
        builder = builder.with_checker(check.name, HttpChecker::new(check.target));
    }
    let manager = Arc::new(builder.build().context("Invalid probe configuration")?);

    manager
        .start()
        .await
        .context("Failed to start probe responder")?;

    if let Some(addr) = manager.local_addr() {
        println!(
            "{} {} probes on {}",
            "Serving".green().bold(),
            manager.config().mechanism,
            addr
        );
    }

    let ready_after = Duration::from_secs(args.ready_after);
    let readiness = manager.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ready_after).await;
        readiness.set_ready().await;
    });

    let outcome = manager.run().await?;
    match outcome {
        DrainOutcome::Forced => println!(
            "{} drain deadline elapsed, probe server terminated",
            "Warning:".yellow().bold()
        ),
        _ => println!("{}", "Probe server stopped".bold()),
    }

    Ok(())
}

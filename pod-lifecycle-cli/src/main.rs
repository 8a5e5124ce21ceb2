use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;

use commands::probe::ProbeArgs;
use commands::serve::ServeArgs;

/// podlife - run and query startup, liveness and readiness probes
#[derive(Parser)]
#[command(name = "podlife")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve probes until SIGTERM/SIGINT, then drain
    Serve(ServeArgs),
    /// Query the probes of a running process
    Probe(ProbeArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => commands::serve::execute(args).await,
        Commands::Probe(args) => commands::probe::execute(args).await,
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);

            if let Some(source) = e.source() {
                eprintln!("\n{} {}", "Caused by:".yellow(), source);
            }

            std::process::exit(1);
        }
    }
}

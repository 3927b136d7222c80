use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use roost::config::Config;
use roost::kernel::Kernel;

#[derive(Parser)]
#[command(name = "roost", about = "User-space agent kernel: supervises sandboxed agents and mediates their syscalls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the kernel daemon.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Verify the host environment before running 'serve'. Exits 0 if all
    /// checks pass.
    Check {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(&path),
        None => Config::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = load_config(config)?;
            roost::cli::run_check(&config)
        }
        Commands::Serve { config } => {
            let config = load_config(config)?;
            tracing::info!(
                socket = %config.server.socket_path.display(),
                workers = config.server.worker_threads,
                "starting roost kernel"
            );
            let kernel = Kernel::new(config);
            kernel.run().await
        }
    }
}


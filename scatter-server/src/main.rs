mod config;
mod simulation;

use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "scatter")]
#[command(about = "Ownership and versioning engine for a scattered key-value cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster through writes, reads, joins and leaves
    Simulate {
        /// Path to configuration file
        #[arg(short, long, default_value = "scatter.yaml")]
        config: String,
    },
    /// Load and validate a configuration file, then print it
    CheckConfig {
        #[arg(short, long, default_value = "scatter.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scatter=info,scatter_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config } => {
            tracing::info!("Starting simulation with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            tracing::info!(
                "Nodes: {:?}, segments: {}, bias: {:?}",
                cfg.simulation.nodes,
                cfg.cache.num_segments,
                cfg.cache.bias_acquisition
            );

            let report = match simulation::run(&cfg).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("Simulation failed: {:#}", e);
                    std::process::exit(1);
                }
            };

            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    tracing::error!("Failed to encode report: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::CheckConfig { config } => match Config::from_file(&config) {
            Ok(cfg) => match serde_json::to_string_pretty(&cfg) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    tracing::error!("Failed to encode config: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                tracing::error!("Invalid config: {}", e);
                std::process::exit(1);
            }
        },
    }
}

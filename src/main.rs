//! kafka-keeper - Main Entry Point
//!
//! Starts the consumer and producer, then runs until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use kafka_keeper::config::{ConfigOverrides, KeeperConfig};
use kafka_keeper::observability::{init_logging_with_verbosity, metrics::metrics};
use kafka_keeper::{wait_for_shutdown_signal, KafkaApplication};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Self-healing Kafka producer and consumer
#[derive(Parser)]
#[command(name = "kafka-keeper")]
#[command(about = "Keeps Kafka producer and consumer connections alive")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Comma separated broker list, overrides broker.addresses
    #[arg(long, env = "KAFKA_BROKERS")]
    brokers: Option<String>,

    /// Default topic, overrides topic.default
    #[arg(long, env = "KAFKA_TOPIC")]
    topic: Option<String>,

    /// Deployment environment, overrides runtime.environment
    #[arg(long, env = "APP_ENV")]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the producer and consumer until terminated
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging_with_verbosity(cli.verbose);

    info!("Starting kafka-keeper v{}", env!("CARGO_PKG_VERSION"));

    let overrides = ConfigOverrides {
        brokers: cli.brokers.clone(),
        topic: cli.topic.clone(),
        environment: cli.environment.clone(),
    };

    let config = match load_configuration(&cli.config, &overrides) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
    overrides: &ConfigOverrides,
) -> Result<KeeperConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            KeeperConfig::load_from_file(path)?
        }
        None => {
            let default_paths = ["kafka-keeper.toml", "config/kafka-keeper.toml"];

            match default_paths
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists())
            {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    KeeperConfig::load_from_file(&path)?
                }
                None => {
                    info!("No configuration file found, using defaults");
                    KeeperConfig::default()
                }
            }
        }
    };

    config.apply_overrides(overrides)?;
    Ok(config)
}

async fn run(config: KeeperConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        brokers = %config.bootstrap_servers(),
        topic = %config.topic.default,
        environment = %config.runtime.environment,
        "Application starting"
    );
    metrics().set_app_state("initializing");

    let app = KafkaApplication::from_config(config)?;

    let shutdown_signal = async {
        match wait_for_shutdown_signal().await {
            Ok(name) => info!("Received {}, shutting down gracefully...", name),
            Err(e) => error!("Failed to install signal handlers: {}", e),
        }
    };

    let result = app.run_until(shutdown_signal).await;

    match serde_json::to_string(&metrics().get_metrics()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Final metrics"),
        Err(e) => error!("Failed to serialize metrics: {}", e),
    }

    result.map_err(Into::into)
}

fn handle_config_command(
    config: &KeeperConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

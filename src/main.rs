//! Federation Router - Main Entry Point
//!
//! Runs the scheduler against an MQTT broker, with optional JSON-lines
//! persistence and an HTTP stats server.

use federation_router::config::FederationConfig;
use federation_router::observability::{
    init_default_logging, init_logging, logging::parse_spans_flag, LogFormat, MetricsCollector,
    StatsServer,
};
use federation_router::persistence::JsonlPersistence;
use federation_router::scheduler::Federation;
use federation_router::transport::mqtt::ConnectionState;
use federation_router::transport::MqttWorkerLink;
use clap::{Parser, Subcommand};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn, Level};

/// Inbound worker events buffered between the transport and the scheduler
const INBOUND_CAPACITY: usize = 1024;

/// Adaptive task routing for a federation of workers
#[derive(Parser)]
#[command(name = "federation-router")]
#[command(about = "Adaptive task routing and federation scheduling")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "FEDERATION_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the federation scheduler
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_observability(cli.verbose);

    info!(
        "Starting federation router v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_federation(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_observability(verbose: u8) {
    let level = match verbose {
        0 => return init_default_logging(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = parse_spans_flag(&env::var("LOG_SPANS").unwrap_or_default());
    init_logging(level, format, include_spans);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<FederationConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(FederationConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["federation.toml", "config/federation.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(FederationConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create federation.toml".into())
        }
    }
}

async fn run_federation(config: FederationConfig) -> Result<(), Box<dyn std::error::Error>> {
    let federation_id = config.federation.id.clone();
    info!("Federation starting with id: {}", federation_id);

    let mqtt_config = config
        .mqtt
        .clone()
        .ok_or("The [mqtt] section is required to run the federation")?;
    let credentials = config.mqtt_credentials()?;

    let metrics = Arc::new(MetricsCollector::new());
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let link = Arc::new(
        MqttWorkerLink::connect(
            &federation_id,
            &mqtt_config,
            credentials,
            inbound_tx,
            metrics.clone(),
        )
        .await?,
    );

    let mut federation = Federation::with_metrics(config.clone(), link.clone(), metrics);

    if let Some(persistence) = &config.persistence {
        match JsonlPersistence::open(&persistence.directory).await {
            Ok(store) => federation = federation.resume_from(Arc::new(store)).await,
            Err(e) => warn!(
                directory = %persistence.directory.display(),
                error = %e,
                "Persistence unavailable, running from memory only"
            ),
        }
    }
    let federation = Arc::new(federation);

    let stats_server = Arc::new(StatsServer::new(federation.clone(), config.stats.port));
    tokio::spawn(stats_server.start());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(federation.clone().run(inbound_rx, shutdown_rx));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Federation is running and waiting for workers on MQTT...");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&link) => {
            error!("MQTT connection permanently lost, shutting down federation...");
        }
    }

    info!("Application shutdown initiated");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    link.disconnect().await;
    federation.close().await;

    let stats = federation.stats();
    info!(
        total_tasks = stats.total_tasks,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "Federation stopped"
    );
    Ok(())
}

fn handle_config_command(
    config: FederationConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

/// Resolve once the MQTT link has given up reconnecting
async fn monitor_connection_health(link: &MqttWorkerLink) {
    loop {
        if matches!(
            link.connection_state(),
            ConnectionState::PermanentlyDisconnected(_)
        ) {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

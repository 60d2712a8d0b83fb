//! buslink device core - main entry point

use buslink::backend::{BackendApi, HttpBackend};
use buslink::config::BusLinkConfig;
use buslink::notify::TracingNotifier;
use buslink::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use buslink::pipeline::BusLinkService;
use buslink::protocol::VehicleId;
use buslink::store::Store;
use buslink::transport::mqtt::MqttClient;
use buslink::trips::{GeofenceEvent, GeofenceTransition, TripAggregator};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{Duration, sleep},
};
use tracing::{error, info};

/// Device core for a bus-transit fleet
#[derive(Parser)]
#[command(name = "buslink")]
#[command(about = "Bus-transit device core: MQTT routing, live location and trip aggregation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device core until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Apply one geofence transition against the shared store
    Geofence {
        /// enter or exit
        transition: GeofenceTransition,
        /// Region identifier
        #[arg(long)]
        region: String,
        /// Vehicle; defaults to the device's assigned vehicle
        #[arg(long)]
        vehicle: Option<String>,
    },
    /// Print persisted vehicle snapshots
    Status {
        #[arg(long)]
        vehicle: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting buslink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Geofence {
            transition,
            region,
            vehicle,
        } => handle_geofence_command(&config, transition, region, vehicle).await,
        Commands::Status { vehicle } => handle_status_command(&config, vehicle).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BusLinkConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BusLinkConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["buslink.toml", "config/buslink.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BusLinkConfig::load_from_file(&path)?);
                }
            }

            Err(
                "No configuration file found. Provide one with -c/--config or create buslink.toml"
                    .into(),
            )
        }
    }
}

fn build_backend(
    config: &BusLinkConfig,
) -> Result<Arc<dyn BackendApi>, Box<dyn std::error::Error>> {
    let token = config.get_backend_token()?;
    Ok(Arc::new(HttpBackend::new(&config.backend, token)?))
}

fn resolve_vehicle(
    config: &BusLinkConfig,
    vehicle: Option<String>,
) -> Result<Option<VehicleId>, Box<dyn std::error::Error>> {
    match vehicle {
        Some(raw) => Ok(Some(VehicleId::parse(&raw)?)),
        None => Ok(config.assigned_vehicle()),
    }
}

async fn run_service(config: BusLinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_service_state("initializing");

    let label = format!("{:?}", config.device.role).to_lowercase();
    let transport = MqttClient::new(&label, config.mqtt.clone()).await?;
    let backend = build_backend(&config)?;

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(HealthServer::new(label.clone(), health_port));
    tokio::spawn(health_server.clone().start());

    let mut service = BusLinkService::new(config, transport, backend, Arc::new(TracingNotifier));
    service.set_health_server(health_server);

    let running = service.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Device core running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = async {
            while !running.is_permanently_disconnected() {
                sleep(Duration::from_millis(500)).await;
            }
        } => {
            error!("MQTT connection permanently lost, shutting down...");
        }
    }

    if let Err(e) = running.shutdown().await {
        error!("Error during shutdown: {}", e);
        collector.set_service_state("error");
        return Err(e.into());
    }

    Ok(())
}

fn handle_config_command(
    config: &BusLinkConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn handle_geofence_command(
    config: &BusLinkConfig,
    transition: GeofenceTransition,
    region: String,
    vehicle: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let vehicle = resolve_vehicle(config, vehicle)?
        .ok_or("No vehicle given and none assigned in [device].vehicle_id")?;
    if config.geofence.region(&region).is_none() {
        return Err(format!("Unknown geofence region: {region}").into());
    }

    let store = Store::open(&config.store.path).await?;
    let aggregator = TripAggregator::new(store.clone(), build_backend(config)?);

    let closed = aggregator
        .handle(&GeofenceEvent {
            transition,
            region,
            vehicle,
            at: Utc::now(),
        })
        .await?;

    if let Some(trip) = closed {
        println!("{}", serde_json::to_string_pretty(&trip.summary())?);
    }

    store.close().await;
    Ok(())
}

async fn handle_status_command(
    config: &BusLinkConfig,
    vehicle: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&config.store.path).await?;

    let snapshots = match vehicle {
        Some(raw) => store
            .load_snapshot(&VehicleId::parse(&raw)?)
            .await?
            .into_iter()
            .collect(),
        None => store.load_snapshots().await?,
    };

    let stale_after = Duration::from_secs(config.fleet.stale_after_secs);
    let now = Utc::now();
    for snapshot in &snapshots {
        let status = if snapshot.is_stale(now, stale_after) {
            "offline"
        } else {
            "online"
        };
        println!("{status}\t{}", serde_json::to_string(snapshot)?);
    }

    store.close().await;
    Ok(())
}

use clap::{Parser, Subcommand};
use drivekeeper_core::drive::sanitize_label_value;
use drivekeeper_core::{
    CancellationToken, ControllerConfig, DriveEventHandler, MemoryDriveRepository, NODE_LABEL,
};
use drivekeeper_daemon::{Listener, ListenerConfig};
use drivekeeper_platform::{PlatformDriveFormatter, PlatformDriveMounter, PlatformDriveStatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drivekeeper")]
#[command(about = "Node-local drive lifecycle controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the drives of one node until interrupted
    Run {
        /// JSON controller configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Node this controller manages
        #[arg(short, long)]
        node_id: Option<String>,
        /// JSON file with drive objects; written back on shutdown
        #[arg(short, long)]
        state: Option<PathBuf>,
        /// Number of concurrent reconcile workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// List drives recorded in a state file
    List {
        /// JSON file with drive objects
        #[arg(short, long)]
        state: PathBuf,
        /// Only show drives of this node
        #[arg(short, long)]
        node_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            node_id,
            state,
            workers,
        } => {
            let mut config = match config {
                Some(path) => ControllerConfig::load(&path)?,
                None => ControllerConfig::default(),
            };
            config.apply_env()?;
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            config.validate()?;

            init_logging(&config.log_filter);
            run(config, state).await?;
        }
        Commands::List { state, node_id } => {
            let repository = MemoryDriveRepository::load_json(&state)?;
            let mut drives = repository.snapshot();
            if let Some(node_id) = node_id {
                let label = sanitize_label_value(&node_id);
                drives.retain(|d| d.metadata.labels.get(NODE_LABEL) == Some(&label));
            }
            drives.sort_by(|a, b| a.name().cmp(b.name()));

            if drives.is_empty() {
                println!("No drives found.");
            } else {
                for drive in drives {
                    println!("Drive: {}", drive.name());
                    println!("  Node: {}", drive.node_name());
                    println!("  Status: {}", drive.status.drive_status);
                    if drive.is_formatted() {
                        println!(
                            "  Filesystem: {} ({})",
                            drive.status.filesystem, drive.status.filesystem_uuid
                        );
                    }
                    if drive.is_mounted() {
                        println!("  Mounted at: {}", drive.status.mountpoint);
                    }
                    println!(
                        "  Capacity: {:.2} GB total, {:.2} GB free",
                        drive.status.total_capacity as f64 / 1_073_741_824.0,
                        drive.status.free_capacity as f64 / 1_073_741_824.0
                    );
                    if drive.is_deletion_requested() {
                        println!("  Deletion requested, finalizers: {:?}", drive.metadata.finalizers);
                    }
                    println!();
                }
            }
        }
    }

    Ok(())
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: ControllerConfig, state: Option<PathBuf>) -> anyhow::Result<()> {
    let repository = Arc::new(match &state {
        Some(path) if path.exists() => MemoryDriveRepository::load_json(path)?,
        _ => MemoryDriveRepository::new(),
    });

    let handler = DriveEventHandler::new(
        &config.node_id,
        repository.clone(),
        Arc::new(PlatformDriveFormatter),
        Arc::new(PlatformDriveMounter),
        Arc::new(PlatformDriveStatter),
    )
    .with_layout(config.layout());

    let listener = Listener::new(
        format!("drives@{}", config.node_id),
        Arc::new(handler),
        repository.clone(),
        ListenerConfig::for_node(&config),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for interrupt, shutting down"),
        }
        shutdown.cancel();
    });

    info!(node = %config.node_id, workers = config.workers, "starting drive controller");
    listener.run(cancel).await?;

    if let Some(path) = &state {
        save_state(&repository, path)?;
    }
    Ok(())
}

fn save_state(repository: &MemoryDriveRepository, path: &Path) -> anyhow::Result<()> {
    repository.save_json(path)?;
    info!(path = %path.display(), "saved drive state");
    Ok(())
}

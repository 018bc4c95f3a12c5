//! DSM Server Daemon
//!
//! One process per server rank, launched by `mpirun`. The ranks share the
//! MPI world as their local group, publish the server group at the
//! configured rendezvous file and serve attached clients until one of them
//! sends DONE.
//!
//! # Usage
//!
//! ```bash
//! mpirun -n 4 dsmd --config dsm.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tracing::{error, info};

use dsmbuf::comm::MpiWorld;
use dsmbuf::config::DsmConfig;
use dsmbuf::logging::init_for_rank;
use dsmbuf::manager::DsmManager;
use dsmbuf::server::install_shutdown_handlers;

/// DSM server daemon
#[derive(Parser, Debug)]
#[command(name = "dsmd")]
#[command(about = "Distributed shared memory server daemon")]
struct Args {
    /// Configuration file (defaults apply when absent)
    #[arg(long, default_value = "dsm.toml")]
    config: PathBuf,

    /// Client processes admitted at a time (overrides the configuration)
    #[arg(long)]
    num_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error; overrides the configuration)
    #[arg(long)]
    log_level: Option<String>,
}

/// Server state
struct ServerState {
    config: DsmConfig,
    rank: usize,
    shutdown: Arc<AtomicBool>,
}

fn main() {
    let args = Args::parse();

    // Initialize MPI
    let world = match MpiWorld::initialize() {
        Ok(world) => world,
        Err(e) => {
            eprintln!("dsmd: {}", e);
            std::process::exit(1);
        }
    };
    let rank = world.rank();
    let size = world.size();

    // Load configuration
    let config_path = args.config.to_string_lossy().to_string();
    let mut config = if args.config.exists() {
        match DsmConfig::from_file(&config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Rank {}: Failed to load configuration: {}", rank, e);
                std::process::exit(1);
            }
        }
    } else {
        if rank == 0 {
            eprintln!("{} not found, using default configuration", config_path);
        }
        DsmConfig::default()
    };
    if let Some(n) = args.num_connections {
        config.network.num_connections = n;
    }
    if let Some(level) = &args.log_level {
        config.node.log_level = level.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("Rank {}: Invalid configuration: {}", rank, e);
        std::process::exit(1);
    }

    // Setup logging (only detailed logs from rank 0)
    let log_level = if rank == 0 {
        config.node.log_level.as_str()
    } else {
        "warn"
    };
    init_for_rank(log_level, rank);

    info!("Starting DSM server");
    info!("Rank: {} / {}", rank, size);
    info!("Layout: {:?}", config.buffer.layout);
    info!("Per-server length: {} bytes", config.buffer.length());
    info!("Rendezvous file: {}", config.network.rendezvous_file.display());

    let state = ServerState {
        config,
        rank,
        shutdown: install_shutdown_handlers(),
    };

    // Synchronize all ranks before starting servers
    world.barrier();

    if let Err(e) = run_server(&world, &state) {
        error!("Rank {}: Server error: {}", state.rank, e);
        std::process::exit(1);
    }

    // Synchronize before finalization
    world.barrier();

    info!("Rank {}: DSM server stopped", state.rank);
}

fn run_server(world: &MpiWorld, state: &ServerState) -> Result<(), Box<dyn std::error::Error>> {
    let comm = world.communicator()?;
    let mut manager = DsmManager::publish(&comm, &state.config, Some(state.shutdown.clone()))?;
    manager.destroy()?;
    Ok(())
}

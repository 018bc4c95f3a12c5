//! DSM client tool
//!
//! Attaches to a published server group as a one-process client group,
//! performs one operation and leaves.
//!
//! ```bash
//! dsmctl --config dsm.toml put 1500 "hello"
//! dsmctl --config dsm.toml get 1500 5
//! dsmctl --config dsm.toml shutdown
//! ```

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use dsmbuf::comm::LocalFabric;
use dsmbuf::config::DsmConfig;
use dsmbuf::logging::init_with_hostname;
use dsmbuf::manager::DsmManager;

#[derive(Parser)]
#[command(name = "dsmctl")]
#[command(about = "Read, write and stop a published DSM buffer")]
struct Cli {
    /// Configuration file naming the rendezvous file
    #[arg(long, default_value = "dsm.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write text at a global address
    Put {
        address: u64,
        text: String,
    },

    /// Read bytes at a global address and print them
    Get {
        address: u64,
        length: usize,

        /// Print a hex dump instead of lossy UTF-8
        #[arg(long)]
        hex: bool,
    },

    /// Stop the server group
    Shutdown,
}

fn main() {
    let cli = Cli::parse();
    init_with_hostname(&cli.log_level);

    if let Err(e) = run(&cli) {
        error!("dsmctl failed: {}", e);
        eprintln!("dsmctl: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = if cli.config.exists() {
        DsmConfig::from_file(&cli.config.to_string_lossy())?
    } else {
        DsmConfig::default()
    };

    let comms = LocalFabric::create(1);
    let comm = comms.first().ok_or("no local communicator")?;
    let mut manager = DsmManager::attach(comm, &config)?;
    manager.set_shutdown_on_detach(matches!(cli.command, Commands::Shutdown));

    match &cli.command {
        Commands::Put { address, text } => {
            manager.buffer_mut().put(*address, text.as_bytes())?;
            println!("wrote {} bytes at {}", text.len(), address);
        }
        Commands::Get {
            address,
            length,
            hex,
        } => {
            let mut buf = vec![0u8; *length];
            manager.buffer_mut().get(*address, &mut buf)?;
            let mut stdout = std::io::stdout().lock();
            if *hex {
                for (i, line) in buf.chunks(16).enumerate() {
                    let bytes: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
                    writeln!(stdout, "{:08x}  {}", *address as usize + i * 16, bytes.join(" "))?;
                }
            } else {
                writeln!(stdout, "{}", String::from_utf8_lossy(&buf))?;
            }
        }
        Commands::Shutdown => {
            println!("stopping server group");
        }
    }

    manager.destroy()?;
    Ok(())
}

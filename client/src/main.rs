use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netpulse_client::{ClientConfig, HelperClient, HelperPaths, ProcessTraffic};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netpulse-client")]
#[command(about = "Query the NetPulse helper for per-process connection statistics")]
struct Args {
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Directory holding the helper socket and secret
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Explicit socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Explicit secret path
    #[arg(long)]
    secret: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connection totals for every process
    Stats,
    /// Connections of selected processes (all when no PID is given)
    Process {
        pids: Vec<u32>,
    },
    /// Check that the helper is alive and show session expiry
    Heartbeat,
    /// Ask the helper to stop
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    #[cfg(unix)]
    {
        if nix::unistd::getuid().is_root() {
            eprintln!("Warning: the client does not need root; run it as the desktop user");
        }
    }

    let mut config = match &args.runtime_dir {
        Some(dir) => ClientConfig::from_paths(HelperPaths::in_dir(dir)),
        None => ClientConfig::new(),
    };
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }
    if let Some(secret) = args.secret {
        config = config.with_secret_path(secret);
    }

    let mut client = HelperClient::connect_authenticated(&config)
        .await
        .context("Failed to authenticate with the helper")?;
    info!("Session established");

    match args.command {
        Commands::Stats => {
            let stats = client
                .connection_stats()
                .await
                .context("Failed to fetch connection stats")?;
            println!("{} established connections", stats.total_connections);
            for process in &stats.processes {
                print_traffic(process);
            }
        }

        Commands::Process { pids } => {
            let filter = (!pids.is_empty()).then_some(pids);
            let stats = client
                .process_stats(filter)
                .await
                .context("Failed to fetch process stats")?;
            for detail in &stats.processes {
                print_traffic(&detail.traffic);
                for conn in &detail.connections {
                    println!(
                        "    {}:{} -> {}:{}  tx_queue={} rx_queue={}",
                        conn.local_address,
                        conn.local_port,
                        conn.remote_address,
                        conn.remote_port,
                        conn.tx_queue_bytes,
                        conn.rx_queue_bytes
                    );
                }
            }
        }

        Commands::Heartbeat => {
            let beat = client.heartbeat().await.context("Heartbeat failed")?;
            println!(
                "Helper time {}; session expires at {} ({}s left)",
                beat.server_time,
                beat.session_expires_at,
                beat.session_expires_at.saturating_sub(beat.server_time)
            );
        }

        Commands::Shutdown => {
            let reply = client.shutdown().await.context("Shutdown request failed")?;
            if reply.helper_stopping {
                println!("Helper is stopping");
            } else {
                println!("Session closed; helper keeps running");
            }
        }
    }

    Ok(())
}

fn print_traffic(process: &ProcessTraffic) {
    println!(
        "{:>7}  {:<20} conns={:<4} sent~{} recv~{}",
        process.pid,
        process.process_name,
        process.connection_count,
        process.bytes_sent,
        process.bytes_received
    );
}

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use netpulse_common::{config::HelperPaths, platform_socket::PlatformListener, secret::SecretStore};
use netpulse_helper::{
    identity::{self, SystemInspector},
    settings::HelperSettings,
    tracker::ConnectionTracker,
    HelperServer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netpulse-helper")]
#[command(about = "Privileged NetPulse helper serving per-process connection statistics")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON settings file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the socket and secret (overrides NETPULSE_RUNTIME_DIR)
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Explicit socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting NetPulse helper v{}", env!("CARGO_PKG_VERSION"));
    let running_as_root = nix::unistd::geteuid().is_root();
    if running_as_root {
        info!("Helper running with root privileges");
    } else {
        warn!("Helper not running as root - connections of other users' processes cannot be attributed");
    }

    let settings = match &args.config {
        Some(path) => HelperSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => HelperSettings::default(),
    };

    let expected_uid = identity::resolve_expected_uid()?;

    let mut paths = match &args.runtime_dir {
        Some(dir) => HelperPaths::in_dir(dir),
        None => HelperPaths::for_user(expected_uid),
    };
    if let Some(socket) = args.socket {
        paths.socket_path = socket;
    }

    // Files created as root must belong to the user who will connect.
    let owner = running_as_root.then_some(expected_uid);

    let secret_store = SecretStore::new(&paths.secret_path);
    let secret = secret_store
        .generate_and_store(owner)
        .context("Cannot provision the shared secret")?;

    let result = serve(secret, settings, expected_uid, &paths, owner).await;

    if let Err(e) = secret_store.delete() {
        error!("Failed to erase shared secret: {}", e);
    }

    match &result {
        Ok(()) => info!("Helper stopped normally"),
        Err(e) => error!("Helper error: {:#}", e),
    }
    result
}

async fn serve(
    secret: netpulse_common::SharedSecret,
    settings: HelperSettings,
    expected_uid: u32,
    paths: &HelperPaths,
    owner: Option<u32>,
) -> Result<()> {
    let tracker = Arc::new(ConnectionTracker::new(settings.connection_stale_after()));
    let server = HelperServer::new(
        secret,
        settings,
        expected_uid,
        Arc::new(SystemInspector::new()),
        tracker,
    )
    .context("Invalid helper settings")?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping helper...");
        shutdown.trigger();
    })
    .context("Failed to set signal handler")?;

    let listener = PlatformListener::bind(&paths.socket_path, owner)
        .with_context(|| format!("Failed to bind to socket: {}", paths.socket_path.display()))?;

    server.run(listener).await
}

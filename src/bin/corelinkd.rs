//! Corelink server binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use corelink::config::{init_logging, Config, LoggingConfig};
use corelink::crypto::ServerKey;
use corelink::events::EventPublisher;
use corelink::keystore::{load_or_create_server_key, KeyStore};
use corelink::server::DeviceServer;
use corelink::VERSION;

#[derive(Parser)]
#[command(name = "corelinkd", version = VERSION, about = "Device-cloud server")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable ANSI colors.
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device server.
    Run {
        /// Override the listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Generate a server keypair.
    Keygen {
        /// Where to write the PKCS#8 PEM.
        #[arg(long, default_value = "data/server_key.pem")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    })?;

    let config = if let Some(ref path) = cli.config {
        Config::load(path).with_context(|| format!("loading {}", path.display()))?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Run { listen } => run_server(config, listen).await,
        Commands::Keygen { out } => keygen(&out),
    }
}

async fn run_server(mut config: Config, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    config.validate()?;

    let server_key = load_or_create_server_key(&config.server.server_key_path)
        .context("loading server key")?;
    let keystore = KeyStore::open(&config.server.device_keys_dir)?;
    let publisher = EventPublisher::new(&config.events);

    let server = DeviceServer::new(config, server_key, keystore, publisher);

    tokio::select! {
        result = server.run() => result.map_err(Into::into),
        _ = signal::ctrl_c() => {
            info!("interrupt received");
            server.shutdown();
            Ok(())
        }
    }
}

fn keygen(out: &PathBuf) -> anyhow::Result<()> {
    if out.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", out.display());
    }
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let key = ServerKey::generate()?;
    key.save(out)?;
    info!(path = %out.display(), "server keypair written");
    Ok(())
}

use clap::Parser;
use nostr_relay::{RelayConfig, RelayServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug, Clone)]
#[command(name = "nostr-relay", about = "OpenAgents Nostr relay", version)]
struct Opts {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_tracing();

    let mut config = match &opts.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = opts.bind {
        config.bind_addr = bind;
    }
    config.validate()?;

    info!(bind = %config.bind_addr, url = %config.relay_url, "starting relay");
    let server = RelayServer::new(config);
    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!(?e, "relay exited with error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}

/// `RUST_LOG` filters (default "info"); `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

//! ssrlocal binary
//!
//! Local SOCKS5 proxy client tunnelling through a ShadowsocksR server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ssrlocal_core::Config;
use ssrlocal_proxy::{Environment, ProxyServer};

/// ssrlocal - SOCKS5 to ShadowsocksR tunnel client
#[derive(Parser)]
#[command(name = "ssrlocal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    listen_host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "debug,ssrlocal=trace"
    } else {
        "info,ssrlocal=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = cli.listen_host {
        config.listen_host = host;
    }
    if let Some(port) = cli.listen_port {
        config.listen_port = port;
    }

    // Single-threaded cooperative scheduling: all sessions share one
    // loop thread, state lives behind Rc without locks.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(async move {
        let env = Environment::new(config)?;
        let server = ProxyServer::bind(env.clone()).await?;

        tokio::select! {
            result = server.run() => {
                result?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                env.shutdown_all();
            }
        }

        info!("ssrlocal stopped");
        Ok::<(), ssrlocal_core::ProxyError>(())
    }))?;

    Ok(())
}

//! forgescout daemon.
//!
//! Receives webhook deliveries from configured code-hosting servers and
//! routes accepted events to the discovery layer.

#![forbid(unsafe_code)]

mod config;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "scoutd")]
#[command(author, version, about = "forgescout daemon - webhook receiver")]
struct Cli {
    /// Path to TOML configuration
    #[arg(short, long, default_value = "forgescout.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting forgescout daemon...");

    let config = config::load(&cli.config)?;
    info!("Loaded {} servers from configuration", config.servers.len());
    for s in &config.servers {
        info!(
            server = %s.name,
            url = %s.url,
            has_credentials = s.token.is_some(),
            allow_system_hooks = s.allow_system_hooks,
            "configured server"
        );
    }

    let endpoints = config
        .servers
        .iter()
        .map(|s| server::Endpoint {
            name: s.name.clone(),
            secret: s.secret.clone(),
        })
        .collect();
    let state = server::HttpState::new(endpoints, Box::new(server::LoggingSink));
    let router = server::create_router(state);

    let listen = cli.listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding webhook endpoint to {listen}"))?;
    info!(addr = %listen, "webhook endpoint listening");
    axum::serve(listener, router)
        .await
        .context("serving webhook endpoint")?;
    Ok(())
}

//! Daemon configuration.
//!
//! One TOML file declares the listen address and the code-hosting servers
//! the daemon accepts events from. Each server carries its own inbound
//! shared secret and outbound API credential; both are optional, and a
//! server without credentials simply skips the operations that need them.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// One configured code-hosting server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unique label used in logs and event routing.
    pub name: String,
    /// Base URL of the server's REST API.
    pub url: String,
    /// Outbound API credential. Optional: without it, hook registration
    /// and status publication are skipped.
    #[serde(default)]
    pub token: Option<String>,
    /// Shared secret expected on inbound webhook deliveries.
    #[serde(default)]
    pub secret: Option<String>,
    /// Whether this server permits daemon-managed system hooks.
    #[serde(default)]
    pub allow_system_hooks: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Address the webhook endpoint binds to.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:8773".to_string()
}

/// Load and validate the daemon configuration.
pub fn load(path: &Path) -> Result<DaemonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration from {}", path.display()))?;
    let config: DaemonConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing configuration from {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &DaemonConfig) -> Result<()> {
    let mut names = HashSet::new();
    for server in &config.servers {
        if server.name.is_empty() {
            bail!("server entry with empty name");
        }
        if !names.insert(server.name.as_str()) {
            bail!("duplicate server name {:?}", server.name);
        }
        if server.url.is_empty() {
            bail!("server {:?} has an empty url", server.name);
        }
    }
    Ok(())
}

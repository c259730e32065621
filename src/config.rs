use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::audio::player::MAX_VOLUME;
use crate::id::UserId;
use crate::node::{NodeConfig, ReconnectPolicy};
use crate::sources::autoplay::AutoplayConfig;
use crate::sources::ResolverConfig;

/// Client settings.
///
/// Loaded from an optional `lavx.toml` and `LAVX__*` environment variables
/// (`LAVX__HISTORY_LIMIT=50`, `LAVX__DATA_DIR=/app/data`). When no node is
/// configured, one is built from the `LAVALINK_*` variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Sent as `Client-Name` on every node socket.
    pub client_name: String,
    /// Bot user the nodes act for. Can also be set later on the client.
    pub user_id: Option<UserId>,
    pub nodes: Vec<NodeConfig>,

    // Search
    pub default_search_platform: String,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub autoplay: AutoplayConfig,

    // Playback
    pub history_limit: usize,
    pub default_volume: u16,

    // Nodes
    pub max_reconnect_attempts: Option<u32>,
    pub migrate_on_disconnect: bool,

    pub event_capacity: usize,
    /// Persist queues and history as JSON under this directory; in memory
    /// when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_name: "lavx".to_string(),
            user_id: None,
            nodes: Vec::new(),
            default_search_platform: "ytsearch".to_string(),
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            autoplay: AutoplayConfig::default(),
            history_limit: 30,
            default_volume: 100,
            max_reconnect_attempts: Some(10),
            migrate_on_disconnect: true,
            event_capacity: 256,
            data_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name("lavx").required(false))
            .add_source(
                ::config::Environment::with_prefix("LAVX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if config.nodes.is_empty() {
            config.nodes.push(fallback_node(|key| std::env::var(key).ok())?);
        }
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that would otherwise surface as runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one node must be configured");
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                anyhow::bail!("Node names must not be empty");
            }
            if !names.insert(node.name.as_str()) {
                anyhow::bail!("Duplicate node name: {}", node.name);
            }
        }

        if self.default_volume > MAX_VOLUME {
            anyhow::bail!(
                "Default volume must be between 0 and {}, got: {}",
                MAX_VOLUME,
                self.default_volume
            );
        }
        if self.history_limit == 0 {
            anyhow::bail!("History limit must be greater than 0");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("Event capacity must be greater than 0");
        }
        if self.default_search_platform.trim().is_empty() {
            anyhow::bail!("Default search platform must not be empty");
        }

        compile(&self.allow_list).context("Invalid allow list")?;
        compile(&self.deny_list).context("Invalid deny list")?;
        Ok(())
    }

    pub fn resolver_config(&self) -> Result<ResolverConfig> {
        Ok(ResolverConfig {
            default_platform: self.default_search_platform.clone(),
            allow_list: compile(&self.allow_list)?,
            deny_list: compile(&self.deny_list)?,
            autoplay: self.autoplay.clone(),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            ..Default::default()
        }
    }

    /// Credential-free overview for the startup log.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|node| format!("{}@{}:{}", node.name, node.host, node.port))
            .collect();

        format!(
            "Config Summary:\n  \
            Client: {} (user: {})\n  \
            Nodes: {}\n  \
            Search: {} ({} allowed, {} denied patterns)\n  \
            Playback: {} vol, {} history\n  \
            Recovery: {} reconnects, migrate on disconnect={}\n  \
            Storage: {}",
            self.client_name,
            self.user_id.map_or("pending".to_string(), |id| id.to_string()),
            nodes.join(", "),
            self.default_search_platform,
            self.allow_list.len(),
            self.deny_list.len(),
            self.default_volume,
            self.history_limit,
            self.max_reconnect_attempts
                .map_or("unlimited".to_string(), |max| max.to_string()),
            self.migrate_on_disconnect,
            self.data_dir
                .as_ref()
                .map_or("memory".to_string(), |dir| dir.display().to_string()),
        )
    }
}

/// Single node described by `LAVALINK_HOST`, `LAVALINK_PORT`,
/// `LAVALINK_PASSWORD` and `LAVALINK_SECURE`.
fn fallback_node(var: impl Fn(&str) -> Option<String>) -> Result<NodeConfig> {
    let port = match var("LAVALINK_PORT") {
        Some(port) => port.parse().context("LAVALINK_PORT is not a port")?,
        None => 2333,
    };
    let secure = match var("LAVALINK_SECURE") {
        Some(secure) => secure.parse().context("LAVALINK_SECURE must be true or false")?,
        None => false,
    };

    Ok(NodeConfig {
        name: "main".to_string(),
        host: var("LAVALINK_HOST").unwrap_or_else(|| "localhost".to_string()),
        port,
        password: var("LAVALINK_PASSWORD").unwrap_or_else(|| "youshallnotpass".to_string()),
        secure,
    })
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("bad pattern {pattern:?}")))
        .collect()
}

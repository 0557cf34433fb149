use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{collections::HashSet, path::PathBuf, time::Duration};

use crate::node::{backoff::Backoff, NodeConfig};

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    // Nodos
    pub nodes: Vec<NodeConfig>,
    pub node_reconnect_base_ms: u64,
    pub node_reconnect_max_ms: u64,
    pub node_probe_timeout_ms: u64,

    // Reproducción
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub event_confirm_timeout_ms: u64,
    pub skip_cooldown_secs: u64,

    // Operación
    pub health_log_interval_secs: u64,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Nodos
            nodes: parse_nodes(&env_or("LAVALINK_NODES", "main=localhost:2333"))?,
            node_reconnect_base_ms: env_parse("NODE_RECONNECT_BASE_MS", 1_000)?,
            node_reconnect_max_ms: env_parse("NODE_RECONNECT_MAX_MS", 60_000)?,
            node_probe_timeout_ms: env_parse("NODE_PROBE_TIMEOUT_MS", 5_000)?,

            // Reproducción
            default_volume: env_parse("DEFAULT_VOLUME", 100)?,
            max_queue_size: env_parse("MAX_QUEUE_SIZE", 1_000)?,
            event_confirm_timeout_ms: env_parse("EVENT_CONFIRM_TIMEOUT_MS", 10_000)?,
            skip_cooldown_secs: env_parse("SKIP_COOLDOWN_SECS", 3)?, // Por usuario

            // Operación
            health_log_interval_secs: env_parse("HEALTH_LOG_INTERVAL_SECS", 60)?,
            data_dir: env_or("DATA_DIR", "/app/data").into(),
        };

        // Validar antes de devolver
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that would otherwise surface as odd runtime behaviour.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("At least one node must be configured in LAVALINK_NODES");
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                bail!("Duplicate node id: {}", node.id);
            }
        }

        if self.default_volume > 200 {
            bail!("Default volume must be between 0 and 200, got: {}", self.default_volume);
        }
        if self.max_queue_size == 0 {
            bail!("Max queue size must be greater than 0");
        }
        if self.node_reconnect_base_ms > self.node_reconnect_max_ms {
            bail!(
                "Reconnect base delay ({}ms) exceeds the cap ({}ms)",
                self.node_reconnect_base_ms,
                self.node_reconnect_max_ms
            );
        }

        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.node_reconnect_base_ms),
            Duration::from_millis(self.node_reconnect_max_ms),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.node_probe_timeout_ms)
    }

    pub fn event_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.event_confirm_timeout_ms)
    }

    pub fn skip_cooldown(&self) -> Duration {
        Duration::from_secs(self.skip_cooldown_secs)
    }

    pub fn health_log_interval(&self) -> Duration {
        Duration::from_secs(self.health_log_interval_secs.max(1))
    }

    /// One-line-per-area summary for the startup log.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|n| format!("{}@{}", n.id, n.address))
            .collect();
        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Reconnect: {}ms base, {}ms cap, {}ms probe timeout\n  \
            Playback: {}% vol, {} queue, {}s skip cooldown\n  \
            Data: {}",
            nodes.join(", "),
            self.node_reconnect_base_ms,
            self.node_reconnect_max_ms,
            self.node_probe_timeout_ms,
            self.default_volume,
            self.max_queue_size,
            self.skip_cooldown_secs,
            self.data_dir.display()
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::new("main", "localhost:2333")],
            node_reconnect_base_ms: 1_000,
            node_reconnect_max_ms: 60_000,
            node_probe_timeout_ms: 5_000,

            default_volume: 100,
            max_queue_size: 1_000,
            event_confirm_timeout_ms: 10_000,
            skip_cooldown_secs: 3,

            health_log_interval_secs: 60,
            data_dir: "/app/data".into(),
        }
    }
}

/// Parses `id=host:port` entries separated by commas.
pub fn parse_nodes(raw: &str) -> Result<Vec<NodeConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, address) = entry
                .split_once('=')
                .with_context(|| format!("node entry '{}' is not id=host:port", entry))?;
            let (id, address) = (id.trim(), address.trim());
            if id.is_empty() || address.is_empty() {
                bail!("node entry '{}' is missing its id or address", entry);
            }
            if !address.contains(':') {
                bail!("node address '{}' has no port", address);
            }
            Ok(NodeConfig::new(id, address))
        })
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {}", key, value)),
        _ => Ok(default),
    }
}

//! Server configuration: JSON file with per-field defaults, validated at
//! load time. The CLI layers its overrides on top of whatever was loaded.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP listen port. 5353 by default so the daemon runs unprivileged.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Total cache entries across all shards.
    #[serde(default = "default_cache_capacity")]
    pub cache_total_capacity: usize,
    /// Shard count; must be a power of two.
    #[serde(default = "default_cache_shards")]
    pub cache_shards: usize,
    /// TTL applied to entries installed from upstream.
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u32,
    /// Response-time samples kept before compaction.
    #[serde(default = "default_reservoir_cap")]
    pub reservoir_cap: usize,
    /// Oldest samples discarded per compaction.
    #[serde(default = "default_reservoir_trim")]
    pub reservoir_trim: usize,
    /// Ordered upstream resolvers tried on cache miss.
    #[serde(default)]
    pub upstream_resolvers: Vec<UpstreamAddr>,
    /// Fixed local domains compiled into ready-made replies.
    #[serde(default)]
    pub local_domains: Vec<LocalDomain>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpstreamAddr {
    pub ip: IpAddr,
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDomain {
    pub domain: String,
    pub ip: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            cache_total_capacity: default_cache_capacity(),
            cache_shards: default_cache_shards(),
            default_ttl_seconds: default_ttl_seconds(),
            reservoir_cap: default_reservoir_cap(),
            reservoir_trim: default_reservoir_trim(),
            upstream_resolvers: Vec::new(),
            local_domains: Vec::new(),
        }
    }
}

impl Config {
    pub fn max_per_shard(&self) -> usize {
        self.cache_total_capacity / self.cache_shards
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_shards == 0 || !self.cache_shards.is_power_of_two() {
            anyhow::bail!("cache_shards must be a power of two, got {}", self.cache_shards);
        }
        if self.cache_total_capacity < self.cache_shards {
            anyhow::bail!(
                "cache_total_capacity {} smaller than cache_shards {}",
                self.cache_total_capacity,
                self.cache_shards
            );
        }
        if self.reservoir_trim >= self.reservoir_cap {
            anyhow::bail!(
                "reservoir_trim {} must be below reservoir_cap {}",
                self.reservoir_trim,
                self.reservoir_cap
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    config.validate()?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

fn default_port() -> u16 {
    5353
}

fn default_cache_capacity() -> usize {
    8192
}

fn default_cache_shards() -> usize {
    16
}

fn default_ttl_seconds() -> u32 {
    300
}

fn default_reservoir_cap() -> usize {
    10_000
}

fn default_reservoir_trim() -> usize {
    5_000
}

fn default_dns_port() -> u16 {
    53
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_object_fills_every_default() {
        let config: Config = serde_json::from_value(json!({})).expect("parse");
        assert_eq!(config.port, 5353);
        assert_eq!(config.cache_total_capacity, 8192);
        assert_eq!(config.cache_shards, 16);
        assert_eq!(config.max_per_shard(), 512);
        assert_eq!(config.default_ttl_seconds, 300);
        assert_eq!(config.reservoir_cap, 10_000);
        assert_eq!(config.reservoir_trim, 5_000);
        assert!(config.upstream_resolvers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn upstream_port_defaults_to_53() {
        let config: Config = serde_json::from_value(json!({
            "upstream_resolvers": [
                { "ip": "8.8.8.8" },
                { "ip": "1.1.1.1", "port": 5300 }
            ]
        }))
        .expect("parse");
        assert_eq!(config.upstream_resolvers[0].port, 53);
        assert_eq!(config.upstream_resolvers[1].port, 5300);
    }

    #[test]
    fn local_domains_parse() {
        let config: Config = serde_json::from_value(json!({
            "local_domains": [ { "domain": "router.local", "ip": "192.168.1.1" } ]
        }))
        .expect("parse");
        assert_eq!(config.local_domains[0].domain, "router.local");
        assert_eq!(config.local_domains[0].ip, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn non_power_of_two_shards_fail_validation() {
        let config: Config =
            serde_json::from_value(json!({ "cache_shards": 12 })).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn trim_at_or_above_cap_fails_validation() {
        let config: Config = serde_json::from_value(
            json!({ "reservoir_cap": 100, "reservoir_trim": 100 }),
        )
        .expect("parse");
        assert!(config.validate().is_err());
    }
}

//! Pool-level configuration (`SPEC_FULL.md` §F.2): slow-log policy and
//! per-server IDC placement, the two knobs spec.md §6 lists as
//! "consumed from the topology layer" but which have to come from
//! somewhere concrete for `proxyd` to be runnable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Kind};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    #[serde(default)]
    pub local_idc: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_true")]
    pub slowlog: bool,
    #[serde(default = "default_slowlog_slower_than_ms")]
    pub slowlog_slower_than_ms: u64,
    pub servers: Vec<ServerConfig>,
}

fn default_true() -> bool {
    true
}

fn default_slowlog_slower_than_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: SocketAddr,
    pub protocol: ProtocolName,
    pub pools: HashMap<String, PoolConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolName {
    Memcached,
    Redis,
}

impl From<ProtocolName> for crate::connection::Protocol {
    fn from(name: ProtocolName) -> crate::connection::Protocol {
        match name {
            ProtocolName::Memcached => crate::connection::Protocol::Memcached,
            ProtocolName::Redis => crate::connection::Protocol::Redis,
        }
    }
}

impl Config {
    /// Loads and parses a proxy configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::with(Kind::ConfigError, e))?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Config, Error> {
        toml::from_str(contents).map_err(|e| Error::with(Kind::ConfigError, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        listen = "0.0.0.0:22121"
        protocol = "memcached"

        [pools.cache0]
        slowlog = true
        slowlog_slower_than_ms = 100

        [[pools.cache0.servers]]
        addr = "10.0.0.1:11211"
        local_idc = true

        [[pools.cache0.servers]]
        addr = "10.0.1.1:11211"
        local_idc = false
    "#;

    #[test]
    fn parses_pools_and_servers() {
        let config = Config::from_str(SAMPLE).unwrap();
        assert_eq!(config.protocol, ProtocolName::Memcached);
        let pool = config.pools.get("cache0").unwrap();
        assert!(pool.slowlog);
        assert_eq!(pool.slowlog_slower_than_ms, 100);
        assert_eq!(pool.servers.len(), 2);
        assert!(pool.servers[0].local_idc);
        assert!(!pool.servers[1].local_idc);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::from_str("not valid toml [[[").is_err());
    }
}

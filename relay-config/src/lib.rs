//! Configuration loading for the relay proxy.
//!
//! Mirrors the structure of a typical proxy YAML config: listen addresses,
//! per-stage timeouts, metrics server settings, and the registry's on-disk
//! location. Defaults are applied the same way throughout: a `default_*`
//! free function referenced from `#[serde(default = "...")]`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration for a relay proxy process, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Addresses to accept TLS connections on (e.g. "0.0.0.0:443", "[::]:443").
    pub listen_addrs: Vec<String>,
    /// Timeout settings for the connection state machine.
    pub timeouts: Timeouts,
    /// Prometheus metrics server configuration.
    pub metrics: Metrics,
    /// Backend registry configuration (persistent store location, etc).
    pub registry: RegistryConfig,
    /// Grace period for draining in-flight tunnels on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Timeout settings for proxy operations (all values in seconds).
///
/// These correspond directly to the connection state machine's bounded
/// wall-clock budgets: `client_hello` bounds ACCEPTED -> HANDSHAKEN and the
/// sniff phase, `connect` bounds SELECTED -> TUNNELING, `idle` bounds the
/// steady-state tunnel, and `accept_to_tunnel` is the outer
/// accept-to-first-tunneled-byte deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish the backend connection (default: 10s).
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time to receive a TLS ClientHello or sniff a host (default: 5s).
    #[serde(default = "default_client_hello_timeout")]
    pub client_hello: u64,
    /// Maximum idle time for an established tunnel before it's closed (default: 3s).
    #[serde(default = "default_idle_timeout")]
    pub idle: u64,
    /// Outer deadline from accept to first tunneled byte (default: 10s).
    #[serde(default = "default_accept_to_tunnel_timeout")]
    pub accept_to_tunnel: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            client_hello: default_client_hello_timeout(),
            idle: default_idle_timeout(),
            accept_to_tunnel: default_accept_to_tunnel_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_client_hello_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    3
}

fn default_accept_to_tunnel_timeout() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection and the `/metrics` endpoint.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (e.g., "127.0.0.1:9000").
    pub address: String,
}

/// Backend registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Path to the embedded key-value store backing the registry.
    pub db_path: String,
    /// Name of the process-wide keypair entry (default: "server").
    #[serde(default = "default_keypair_name")]
    pub keypair_name: String,
}

fn default_keypair_name() -> String {
    "server".to_string()
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config = serde_yaml_ng::from_str(&contents)?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// Primarily used for testing and programmatic configuration.
    ///
    /// ```
    /// use relay_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "0.0.0.0:8443"
    /// timeouts: {}
    /// metrics:
    ///   enabled: false
    ///   address: "127.0.0.1:9000"
    /// registry:
    ///   db_path: "/var/lib/relay/registry"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "0.0.0.0:8443");
    /// assert_eq!(config.timeouts.connect, 10);
    /// assert_eq!(config.registry.keypair_name, "server");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }
}

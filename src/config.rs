//! Configuration management
//!
//! Handles loading and validating configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::codec::FrameMode;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening endpoint of the demo service
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host name or address to listen on
    pub host: String,
    /// Port to listen on ("0" picks a free port)
    pub port: String,
    /// Service id reported as the receiver of relayed messages
    #[serde(default = "default_service_id")]
    pub service_id: u32,
}

/// Connection variant created for new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Continuous reads, optional length-prefix framing
    #[default]
    Socket,
    /// Request-driven reads (exact count or delimiter)
    Text,
    /// Websocket frames after an HTTP upgrade
    WebSocket,
}

/// Connection manager settings
#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    /// Connection variant
    #[serde(default)]
    pub protocol: Protocol,
    /// Length-prefix framing: "none", "r", "w", "rw"
    #[serde(default)]
    pub frame: FrameMode,
    /// Idle timeout in seconds; absent leaves the sweeper unarmed, 0 disables
    #[serde(default)]
    pub idle_timeout_secs: Option<u32>,
    /// Interval between idle sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Disable Nagle's algorithm on new connections
    #[serde(default)]
    pub no_delay: bool,
}

impl TcpConfig {
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            frame: FrameMode::default(),
            idle_timeout_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            no_delay: false,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Metrics server bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_service_id() -> u32 { 1 }
fn default_sweep_interval() -> u64 { 10 }
fn default_metrics_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 9090)) }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server.host must not be empty");
        }
        if self.server.port.parse::<u16>().is_err() {
            anyhow::bail!("server.port must be a number in 0..=65535");
        }
        if self.tcp.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be > 0");
        }
        Ok(())
    }
}

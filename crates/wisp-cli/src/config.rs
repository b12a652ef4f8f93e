//! Configuration file for the WISP CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wisp_core::{LimitsPolicy, TransferConfig};
use wisp_transport::{RelayConfig, Socks5Config, StreamHostCandidate};

/// Largest accepted chunk size
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// WISP configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Signaling server and account
    #[serde(default)]
    pub signaling: SignalingConfig,
    /// Local relay offered by senders
    #[serde(default)]
    pub relay: RelaySection,
    /// Third-party proxies, offered in this order after the relay
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
    /// Transfer tuning
    #[serde(default)]
    pub transfer: TransferSection,
    /// Receiver accept policy
    #[serde(default)]
    pub policy: PolicySection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling server (`host:port`)
    #[serde(default = "default_server")]
    pub server: String,
    /// Own identity, `user@domain/resource`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Account password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Local relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Offer the local relay as a candidate
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Listen address; port 0 picks a free port
    #[serde(default = "default_relay_bind")]
    pub bind: String,
    /// Address published to receivers
    #[serde(default = "default_advertise")]
    pub advertise: String,
    /// SOCKS5 handshake timeout for inbound connections
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// A third-party proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    /// Identity of the proxy
    pub host: String,
    /// Hostname or IP address
    pub address: String,
    /// Port
    pub port: u16,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Per-receive timeout in milliseconds
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    /// Abort a receive after this many seconds without data
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Close sessions still negotiating after this many seconds
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    /// TCP connect timeout per candidate
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Hash files before offering them
    #[serde(default = "default_true")]
    pub compute_hash: bool,
}

/// Accept policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicySection {
    /// Largest file accepted, in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    /// Bare identities allowed to send; empty allows everyone
    #[serde(default)]
    pub allowed_senders: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_server() -> String {
    "127.0.0.1:5299".to_string()
}

fn default_true() -> bool {
    true
}

fn default_relay_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_advertise() -> String {
    "127.0.0.1".to_string()
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_chunk_size() -> usize {
    wisp_core::DEFAULT_CHUNK_SIZE
}

fn default_receive_timeout() -> u64 {
    1000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_negotiation_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            identity: None,
            password: None,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_relay_bind(),
            advertise: default_advertise(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            receive_timeout_ms: default_receive_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            negotiation_timeout_secs: default_negotiation_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            compute_hash: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[allow(dead_code)]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("wisp/config.toml")
    }

    /// Load `path`, or the defaults when `path` is the default location and
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or a
    /// non-default path does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() || path != Self::default_path() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse the relay listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn relay_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.relay
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid relay bind address '{}': {e}", self.relay.bind))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_host_port(&self.signaling.server, "Signaling server")?;

        if let Some(identity) = &self.signaling.identity {
            validate_identity(identity)?;
        }

        if self.relay.enabled {
            self.relay_bind_addr()?;
            if self.relay.advertise.is_empty() {
                anyhow::bail!("Relay advertise address is empty");
            }
        }

        for proxy in &self.proxies {
            if proxy.host.is_empty() || proxy.address.is_empty() {
                anyhow::bail!("Proxy entries need both host and address");
            }
            if proxy.port == 0 {
                anyhow::bail!("Proxy '{}' has invalid port: 0", proxy.host);
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!("Chunk size must be between 1 and 16MB");
        }

        if self.transfer.receive_timeout_ms == 0 {
            anyhow::bail!("Receive timeout must be positive");
        }

        if self.transfer.idle_timeout_secs * 1000 < self.transfer.receive_timeout_ms {
            anyhow::bail!("Idle timeout must not be shorter than the receive timeout");
        }

        if self.transfer.negotiation_timeout_secs == 0 || self.transfer.connect_timeout_secs == 0 {
            anyhow::bail!("Negotiation and connect timeouts must be positive");
        }

        Ok(())
    }

    /// Library transfer settings
    #[must_use]
    pub fn transfer_config(&self) -> TransferConfig {
        let socks5 = Socks5Config {
            connect_timeout: Duration::from_secs(self.transfer.connect_timeout_secs),
            ..Socks5Config::default()
        };
        let relay = RelayConfig {
            handshake_timeout: Duration::from_secs(self.relay.handshake_timeout_secs),
            ..RelayConfig::default()
        };

        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            receive_timeout: Duration::from_millis(self.transfer.receive_timeout_ms),
            idle_timeout: Duration::from_secs(self.transfer.idle_timeout_secs),
            negotiation_timeout: Duration::from_secs(self.transfer.negotiation_timeout_secs),
            compute_hash: self.transfer.compute_hash,
            socks5,
            relay,
        }
    }

    /// Configured proxies as stream-host candidates, in order
    #[must_use]
    pub fn proxy_candidates(&self) -> Vec<StreamHostCandidate> {
        self.proxies
            .iter()
            .map(|p| StreamHostCandidate::new(p.host.clone(), p.address.clone(), p.port))
            .collect()
    }

    /// Receiver accept policy
    #[must_use]
    pub fn accept_policy(&self) -> LimitsPolicy {
        LimitsPolicy {
            max_file_size: self.policy.max_file_size,
            allowed_senders: self.policy.allowed_senders.clone(),
        }
    }
}

/// Validate `user@domain/resource`
fn validate_identity(identity: &str) -> anyhow::Result<()> {
    let Some((bare, resource)) = identity.split_once('/') else {
        anyhow::bail!("Identity '{identity}' has no resource (expected user@domain/resource)");
    };
    if resource.is_empty() || !bare.contains('@') || bare.starts_with('@') || bare.ends_with('@') {
        anyhow::bail!("Identity '{identity}' is not of the form user@domain/resource");
    }
    Ok(())
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port_str}"))?;

    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }

    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }

    if host.contains('/') || host.contains('\\') {
        anyhow::bail!("{name} '{addr}' contains invalid characters");
    }

    Ok(())
}

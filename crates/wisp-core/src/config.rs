//! Transfer configuration

use std::time::Duration;
use wisp_transport::{RelayConfig, Socks5Config};

/// Default chunk size for sending (32 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Transfer configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Bytes read from the source file per `send()`
    pub chunk_size: usize,

    /// Timeout for a single `receive()` on the receiving side
    pub receive_timeout: Duration,

    /// Abort a receive after this long without data
    pub idle_timeout: Duration,

    /// Close sessions that have not reached the data phase in this time
    pub negotiation_timeout: Duration,

    /// Hash the file before offering it
    pub compute_hash: bool,

    /// Outbound SOCKS5 connection settings
    pub socks5: Socks5Config,

    /// Local relay settings
    pub relay: RelayConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            receive_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            negotiation_timeout: Duration::from_secs(120),
            compute_hash: true,
            socks5: Socks5Config::default(),
            relay: RelayConfig::default(),
        }
    }
}

//! Stream-host candidates and session destination addresses.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length of a destination address in hex characters (SHA-1).
pub const DST_ADDR_LEN: usize = 40;

/// A stream host the target may connect to.
///
/// Candidate lists are ordered by preference. The order is preserved on the
/// wire and during trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamHostCandidate {
    /// Identity of the stream host (a peer or a proxy)
    #[serde(rename = "host")]
    pub host_identity: String,
    /// Network address (IP or hostname)
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl StreamHostCandidate {
    /// Create a new candidate
    pub fn new(host_identity: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            host_identity: host_identity.into(),
            address: address.into(),
            port,
        }
    }

    /// `address:port` suitable for `TcpStream::connect`
    #[must_use]
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for StreamHostCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.host_identity, self.endpoint())
    }
}

/// How a bytestream was established, derived from which candidate won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Target connected straight to the initiator's published address
    Direct,
    /// Initiator accepted the target's connection on its own relay
    LocalRelay,
    /// Both peers joined through a third-party proxy
    Proxy,
}

impl Strategy {
    /// Classify the candidate `host` given the two session peers.
    ///
    /// `relay_host` is the identity the initiator advertises for its own
    /// listener, if any.
    #[must_use]
    pub fn classify(host: &str, initiator: &str, relay_host: Option<&str>) -> Self {
        if relay_host == Some(host) {
            Strategy::LocalRelay
        } else if host == initiator {
            Strategy::Direct
        } else {
            Strategy::Proxy
        }
    }

    /// Whether the initiator must open its own leg to the stream host
    #[must_use]
    pub fn needs_initiator_leg(self) -> bool {
        matches!(self, Strategy::Proxy)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::LocalRelay => write!(f, "local-relay"),
            Strategy::Proxy => write!(f, "proxy"),
        }
    }
}

/// SOCKS5 destination address identifying one session.
///
/// `hex(SHA1(sid ‖ initiator ‖ target))`, sent as a domain-name address with
/// port 0. Peers and proxies match connections on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DstAddr(String);

impl DstAddr {
    /// Derive the destination address for a session
    #[must_use]
    pub fn derive(sid: &str, initiator: &str, target: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(sid.as_bytes());
        hasher.update(initiator.as_bytes());
        hasher.update(target.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a destination address received in a SOCKS5 request.
    ///
    /// Returns `None` unless it is exactly 40 hex characters. Uppercase is
    /// folded to lowercase.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == DST_ADDR_LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// The hex string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for DstAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_addr_known_vector() {
        // sha1("abc") with the input split across the three fields
        let dst = DstAddr::derive("a", "b", "c");
        assert_eq!(dst.as_str(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_dst_addr_depends_on_direction() {
        let forward = DstAddr::derive("sid1", "alice@example.org/a", "bob@example.org/b");
        let reverse = DstAddr::derive("sid1", "bob@example.org/b", "alice@example.org/a");
        assert_ne!(forward, reverse);
        assert_eq!(forward.as_str().len(), DST_ADDR_LEN);
    }

    #[test]
    fn test_dst_addr_parse() {
        let dst = DstAddr::derive("s", "i", "t");
        assert_eq!(DstAddr::parse(dst.as_str()), Some(dst.clone()));
        assert_eq!(
            DstAddr::parse(&dst.as_str().to_ascii_uppercase()),
            Some(dst)
        );
        assert_eq!(DstAddr::parse("not-hex"), None);
        assert_eq!(DstAddr::parse(&"g".repeat(DST_ADDR_LEN)), None);
    }

    #[test]
    fn test_candidate_wire_format() {
        let candidate = StreamHostCandidate::new("proxy.example.org", "192.0.2.10", 7777);
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "host": "proxy.example.org",
                "address": "192.0.2.10",
                "port": 7777
            })
        );

        let back: StreamHostCandidate = serde_json::from_value(json).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn test_endpoint_formatting() {
        let v4 = StreamHostCandidate::new("h", "127.0.0.1", 8010);
        assert_eq!(v4.endpoint(), "127.0.0.1:8010");

        let v6 = StreamHostCandidate::new("h", "::1", 8010);
        assert_eq!(v6.endpoint(), "[::1]:8010");
    }

    #[test]
    fn test_strategy_classify() {
        let initiator = "alice@example.org/laptop";
        assert_eq!(
            Strategy::classify(initiator, initiator, Some(initiator)),
            Strategy::LocalRelay
        );
        assert_eq!(Strategy::classify(initiator, initiator, None), Strategy::Direct);
        assert_eq!(
            Strategy::classify("proxy.example.org", initiator, Some(initiator)),
            Strategy::Proxy
        );
        assert!(Strategy::Proxy.needs_initiator_leg());
        assert!(!Strategy::LocalRelay.needs_initiator_leg());
    }
}

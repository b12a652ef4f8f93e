//! # WISP Transport
//!
//! Bytestream transport layer for the WISP file transfer protocol.
//!
//! This crate provides:
//! - The [`Bytestream`] trait: an ordered, reliable byte channel bound to one
//!   negotiated session
//! - SOCKS5 stream-host handshakes (client and server side)
//! - Candidate trial across an ordered list of stream hosts
//! - A local relay that accepts the peer's inbound bytestream
//! - A pairing proxy that joins two inbound legs into one bytestream
//! - In-memory bytestreams for tests and in-process transfers
//!
//! ## Connection strategies
//!
//! ```text
//!   Direct / local relay                 Remote proxy
//!
//!   Target ──SOCKS5──▶ Initiator         Target ──SOCKS5──▶ Proxy ◀──SOCKS5── Initiator
//!          (initiator's relay)                     (pairs legs by DST.ADDR)
//! ```
//!
//! Every strategy identifies the session by the destination address
//! `SHA1(sid ‖ initiator ‖ target)`, see [`DstAddr`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytestream;
pub mod candidate;
pub mod connector;
pub mod error;
pub mod memory;
pub mod proxy;
pub mod relay;
pub mod socks5;
pub mod trial;

pub use bytestream::{Bytestream, Received, SharedBytestream, Socks5Bytestream, TransportStats};
pub use candidate::{DstAddr, StreamHostCandidate, Strategy};
pub use connector::{Connector, Socks5Config, TcpConnector};
pub use error::{CandidateFailure, TransportError, TransportResult};
pub use proxy::{ProxyConfig, ProxyServer};
pub use relay::{LocalRelay, RelayConfig, RelayHandle};
pub use trial::{CandidateBytestream, CandidateTrial};

use std::time::Duration;

/// Default read buffer size for a single `receive()` call (32 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Default timeout for the TCP connect to one stream host.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the SOCKS5 handshake on an established TCP connection.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a proxy keeps an unpaired leg open.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(30);

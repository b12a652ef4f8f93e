//! # WISP Core
//!
//! Transfer negotiation and orchestration for WISP, the peer-to-peer
//! single-file transfer protocol.
//!
//! This crate provides:
//! - File offers and the accept policies that judge them
//! - The negotiation state machine, one [`Session`] per transfer
//! - Transfer workers that move file data over an established bytestream
//! - The session manager that owns, tracks, and joins the workers
//! - The signaling boundary, with in-memory and TCP implementations
//! - Sender and receiver drivers built on a single event loop
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Role drivers (EventLoop)                     │
//! │   (sender / receiver orchestration, one event channel)          │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │       Session negotiator      │        Session manager          │
//! │  (offer → accept → transport) │   (transfer tasks, shutdown)    │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                        Transfer workers                         │
//! │   (chunked file send, ordered receive, integrity checks)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   wisp-transport bytestreams                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod manager;
pub mod negotiator;
pub mod offer;
pub mod policy;
pub mod session;
pub mod signal;
pub mod worker;

pub use config::{DEFAULT_CHUNK_SIZE, TransferConfig};
pub use driver::receiver::{FileReceiver, ReceiveReport, ReceiveRequest, receive_files};
pub use driver::sender::{FileSender, RelaySettings, SendRequest, send_file};
pub use driver::{DriverCore, EventHandler, EventLoop, ExitStatus, Flow};
pub use error::{Error, ErrorKind, Result};
pub use event::Event;
pub use manager::{SessionManager, TaskCompletion, TaskId};
pub use negotiator::SessionNegotiator;
pub use offer::{FileRange, TransferOffer, TransportType};
pub use policy::{AcceptAll, AcceptPolicy, Decision, LimitsPolicy, RejectAll, RejectReason};
pub use session::{NegotiationState, Role, Session, SessionId};
pub use signal::{Signaling, Stanza};
pub use worker::{TransferProgress, TransferSummary};

/// Protocol version carried in logs and the CLI banner
pub const PROTOCOL_VERSION: &str = "wisp/1";

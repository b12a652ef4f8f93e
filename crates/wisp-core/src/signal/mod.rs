//! Signaling boundary.
//!
//! Negotiation messages ([`Stanza`]) travel over an external presence and
//! session channel. The [`Signaling`] trait is the seam to that channel:
//! lifecycle changes and inbound stanzas are delivered as
//! [`Event`](crate::event::Event)s on the driver's event channel, and
//! outbound stanzas are enqueued without blocking.
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryHub`]: in-process routing for tests
//! - [`tcp::TcpSignaling`] / [`tcp::SignalServer`]: line-delimited JSON over TCP

pub mod memory;
pub mod tcp;

use crate::error::Result;
use crate::event::EventSender;
use crate::offer::TransferOffer;
use crate::policy::RejectReason;
use crate::session::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wisp_transport::StreamHostCandidate;

/// Negotiation message exchanged between the two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stanza {
    /// Initiator proposes a file and the stream hosts to reach it
    Offer {
        /// Session id chosen by the initiator
        sid: SessionId,
        /// The file offer
        offer: TransferOffer,
        /// Stream hosts in preference order
        candidates: Vec<StreamHostCandidate>,
    },
    /// Target accepts the offer
    Accept {
        /// Session id
        sid: SessionId,
    },
    /// Target declines the offer
    Reject {
        /// Session id
        sid: SessionId,
        /// Why
        reason: RejectReason,
    },
    /// Target connected through the named stream host
    StreamHostUsed {
        /// Session id
        sid: SessionId,
        /// Identity of the stream host that worked
        host: String,
    },
    /// Target could not connect to any stream host
    StreamHostFailed {
        /// Session id
        sid: SessionId,
        /// Failure summary
        error: String,
    },
    /// Either side abandons the session
    Abort {
        /// Session id
        sid: SessionId,
        /// Why
        reason: String,
    },
}

impl Stanza {
    /// Session this stanza belongs to
    #[must_use]
    pub fn sid(&self) -> &SessionId {
        match self {
            Stanza::Offer { sid, .. }
            | Stanza::Accept { sid }
            | Stanza::Reject { sid, .. }
            | Stanza::StreamHostUsed { sid, .. }
            | Stanza::StreamHostFailed { sid, .. }
            | Stanza::Abort { sid, .. } => sid,
        }
    }

    /// Message name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Offer { .. } => "offer",
            Stanza::Accept { .. } => "accept",
            Stanza::Reject { .. } => "reject",
            Stanza::StreamHostUsed { .. } => "streamhost-used",
            Stanza::StreamHostFailed { .. } => "streamhost-failed",
            Stanza::Abort { .. } => "abort",
        }
    }
}

/// Connection to the signaling channel.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Our full identity on the channel
    fn identity(&self) -> &str;

    /// Connect and start delivering events.
    ///
    /// Emits `Event::Connected` once the session is established (and
    /// `Event::TlsReady` when the channel is secured), then `Event::Stanza`
    /// for every inbound message and `Event::Disconnected` when the channel
    /// drops.
    ///
    /// # Errors
    /// Returns `Error::Signaling` if the connection or login fails
    async fn connect(&self, events: EventSender) -> Result<()>;

    /// Enqueue `stanza` for delivery to `to`. Never blocks.
    ///
    /// # Errors
    /// Returns `Error::Signaling` if not connected or the recipient is
    /// known to be unreachable
    fn send(&self, to: &str, stanza: Stanza) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self);
}

//! Events delivered to the driver's event loop.
//!
//! Signaling, relay accepts, candidate trials, worker completions and timers
//! all post to one unbounded channel, so per-session transitions happen
//! strictly in arrival order on a single task.

use crate::error::Error;
use crate::manager::TaskCompletion;
use crate::session::SessionId;
use crate::signal::Stanza;
use std::fmt;
use tokio::sync::mpsc;
use wisp_transport::SharedBytestream;

/// Something the event loop must react to
pub enum Event {
    /// Signaling session established
    Connected,
    /// Signaling channel secured
    TlsReady,
    /// Signaling channel dropped
    Disconnected(Option<String>),
    /// Inbound negotiation message
    Stanza {
        /// Sender identity
        from: String,
        /// The message
        stanza: Stanza,
    },
    /// A bytestream for `sid` is established
    TransportReady {
        /// Session id
        sid: SessionId,
        /// The established channel
        transport: SharedBytestream,
    },
    /// Bytestream establishment for `sid` failed
    TransportFailed {
        /// Session id
        sid: SessionId,
        /// Why
        error: Error,
    },
    /// The negotiation timer for `sid` fired
    NegotiationTimeout {
        /// Session id
        sid: SessionId,
    },
    /// A transfer worker finished
    TaskFinished(TaskCompletion),
    /// Stop the loop
    Shutdown,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connected => write!(f, "Connected"),
            Event::TlsReady => write!(f, "TlsReady"),
            Event::Disconnected(reason) => write!(f, "Disconnected({reason:?})"),
            Event::Stanza { from, stanza } => {
                write!(f, "Stanza({} from {from}, sid {})", stanza.name(), stanza.sid())
            }
            Event::TransportReady { sid, transport } => write!(
                f,
                "TransportReady({sid}, host {:?})",
                transport.stream_host().map(|h| h.host_identity.as_str())
            ),
            Event::TransportFailed { sid, error } => write!(f, "TransportFailed({sid}, {error})"),
            Event::NegotiationTimeout { sid } => write!(f, "NegotiationTimeout({sid})"),
            Event::TaskFinished(completion) => write!(f, "TaskFinished({completion:?})"),
            Event::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Sending half of the event channel
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Receiving half of the event channel
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create an event channel
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

//! In-process signaling hub.
//!
//! Every endpoint registers its event sender with a shared hub; stanzas are
//! routed by exact identity.

use super::{Signaling, Stanza};
use crate::error::{Error, Result};
use crate::event::{Event, EventSender};
use async_trait::async_trait;
use dashmap::DashMap;
use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared routing table for [`MemorySignaling`] endpoints
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<DashMap<String, EventSender>>,
}

impl MemoryHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint for `identity`
    #[must_use]
    pub fn endpoint(&self, identity: impl Into<String>) -> MemorySignaling {
        MemorySignaling {
            identity: identity.into(),
            hub: self.clone(),
            tls: false,
            connected: Mutex::new(false),
        }
    }

    /// Create an endpoint that also reports a secured channel
    #[must_use]
    pub fn secure_endpoint(&self, identity: impl Into<String>) -> MemorySignaling {
        MemorySignaling {
            tls: true,
            ..self.endpoint(identity)
        }
    }

    /// Deliver `stanza` to `to` as if sent by `from`. Returns false if `to`
    /// is not connected.
    pub fn inject(&self, from: &str, to: &str, stanza: Stanza) -> bool {
        self.endpoints.get(to).is_some_and(|events| {
            events
                .send(Event::Stanza {
                    from: from.to_string(),
                    stanza,
                })
                .is_ok()
        })
    }

    /// Disconnect `identity` from the hub, as a dropped connection would
    pub fn drop_peer(&self, identity: &str) -> bool {
        match self.endpoints.remove(identity) {
            Some((_, events)) => {
                let _ = events.send(Event::Disconnected(Some("dropped by hub".to_string())));
                true
            }
            None => false,
        }
    }

    /// Whether `identity` is connected
    #[must_use]
    pub fn is_connected(&self, identity: &str) -> bool {
        self.endpoints.contains_key(identity)
    }
}

/// One endpoint of a [`MemoryHub`]
#[derive(Debug)]
pub struct MemorySignaling {
    identity: String,
    hub: MemoryHub,
    tls: bool,
    connected: Mutex<bool>,
}

#[async_trait]
impl Signaling for MemorySignaling {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn connect(&self, events: EventSender) -> Result<()> {
        if self.hub.endpoints.contains_key(&self.identity) {
            return Err(Error::Signaling(Cow::Owned(format!(
                "{} is already connected",
                self.identity
            ))));
        }

        self.hub
            .endpoints
            .insert(self.identity.clone(), events.clone());
        *self.connected.lock().unwrap_or_else(PoisonError::into_inner) = true;

        let _ = events.send(Event::Connected);
        if self.tls {
            let _ = events.send(Event::TlsReady);
        }
        Ok(())
    }

    fn send(&self, to: &str, stanza: Stanza) -> Result<()> {
        if !*self.connected.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(Error::Signaling(Cow::Borrowed("not connected")));
        }

        tracing::trace!(from = %self.identity, to = %to, stanza = stanza.name(), "Routing stanza");

        if self.hub.inject(&self.identity, to, stanza) {
            Ok(())
        } else {
            Err(Error::Signaling(Cow::Owned(format!("{to} is not connected"))))
        }
    }

    async fn disconnect(&self) {
        let mut connected = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        if *connected {
            self.hub.endpoints.remove(&self.identity);
            *connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use crate::session::SessionId;

    #[tokio::test]
    async fn test_connect_and_route() {
        let hub = MemoryHub::new();
        let alice = hub.secure_endpoint("alice@example.org/a");
        let bob = hub.endpoint("bob@example.org/b");

        let (alice_tx, mut alice_rx) = event::channel();
        let (bob_tx, mut bob_rx) = event::channel();
        alice.connect(alice_tx).await.unwrap();
        bob.connect(bob_tx).await.unwrap();

        assert!(matches!(alice_rx.recv().await, Some(Event::Connected)));
        assert!(matches!(alice_rx.recv().await, Some(Event::TlsReady)));
        assert!(matches!(bob_rx.recv().await, Some(Event::Connected)));

        let sid = SessionId::generate();
        alice
            .send("bob@example.org/b", Stanza::Accept { sid: sid.clone() })
            .unwrap();

        match bob_rx.recv().await {
            Some(Event::Stanza { from, stanza }) => {
                assert_eq!(from, "alice@example.org/a");
                assert_eq!(stanza, Stanza::Accept { sid });
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_absent_peer_fails() {
        let hub = MemoryHub::new();
        let alice = hub.endpoint("alice");
        let (tx, _rx) = event::channel();

        let sid = SessionId::generate();
        assert!(alice.send("bob", Stanza::Accept { sid: sid.clone() }).is_err());

        alice.connect(tx).await.unwrap();
        assert!(alice.send("bob", Stanza::Accept { sid }).is_err());
    }

    #[tokio::test]
    async fn test_drop_peer_reports_disconnect() {
        let hub = MemoryHub::new();
        let alice = hub.endpoint("alice");
        let (tx, mut rx) = event::channel();
        alice.connect(tx).await.unwrap();
        let _ = rx.recv().await;

        assert!(hub.drop_peer("alice"));
        assert!(matches!(rx.recv().await, Some(Event::Disconnected(Some(_)))));
        assert!(!hub.is_connected("alice"));
    }

    #[tokio::test]
    async fn test_duplicate_identity_refused() {
        let hub = MemoryHub::new();
        let (tx, _rx) = event::channel();
        hub.endpoint("alice").connect(tx.clone()).await.unwrap();
        assert!(hub.endpoint("alice").connect(tx).await.is_err());
    }
}

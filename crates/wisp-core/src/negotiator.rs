//! Session negotiator.
//!
//! Turns offers and their replies into sessions and drives each session
//! through the negotiation state machine. The negotiator never performs
//! network I/O: it returns the stanza to send or the action to take, and
//! the driver carries it out.
//!
//! # Negotiation Flow
//!
//! ```text
//! Initiator                                   Target
//!     |                                          |
//!     |-- Offer {sid, offer, candidates} ------->|  policy decides
//!     |<------------------------ Accept {sid} ---|
//!     |                                          |  candidate trial
//!     |<------------ StreamHostUsed {sid, host} -|
//!     |   (proxy host: initiator dials too)      |
//!     |                                          |
//!     |== bytestream (DST.ADDR = SHA1(sid‖i‖t)) =|
//! ```

use crate::error::{Error, Result};
use crate::offer::TransferOffer;
use crate::policy::{Decision, RejectReason};
use crate::session::{BoundTransport, NegotiationState, Role, Session, SessionId};
use crate::signal::Stanza;
use dashmap::DashMap;
use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use wisp_transport::{DstAddr, SharedBytestream, StreamHostCandidate, Strategy};

/// Result of receiving an offer
#[derive(Debug)]
pub enum OfferOutcome {
    /// Offer accepted; start the candidate trial
    Accepted {
        /// Reply to send to the initiator
        reply: Stanza,
        /// Candidates to try, in order
        candidates: Vec<StreamHostCandidate>,
        /// Destination address for the handshake
        dst: DstAddr,
    },
    /// Offer declined
    Rejected {
        /// Reply to send to the initiator
        reply: Stanza,
        /// Why
        reason: RejectReason,
    },
    /// A session with this id already exists; ignore the offer
    Duplicate,
}

/// What the initiator does after the target picked a stream host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    /// Dial the proxy with the session's destination address
    ConnectProxy {
        /// Proxy the target connected to
        candidate: StreamHostCandidate,
        /// Destination address for the handshake
        dst: DstAddr,
    },
    /// The target connected to our relay; the transport arrives from there
    AwaitRelay,
}

/// Result of offering a transport to a session
pub enum BindOutcome {
    /// Transport bound; the session is `TransportReady`
    Bound {
        /// How the channel was established
        strategy: Strategy,
        /// Stream host the channel runs through, if dialed
        host: Option<StreamHostCandidate>,
    },
    /// The session already has a transport or is finished; close this one
    Discarded(SharedBytestream),
    /// No such session; close this one
    Unknown(SharedBytestream),
}

/// Reaped session ids remembered to refuse replayed offers
const FINISHED_ID_CAPACITY: usize = 1024;

/// Ids of reaped sessions, oldest evicted first
#[derive(Debug, Default)]
struct FinishedIds {
    order: VecDeque<SessionId>,
    ids: HashSet<SessionId>,
}

impl FinishedIds {
    fn insert(&mut self, sid: SessionId) {
        if !self.ids.insert(sid.clone()) {
            return;
        }
        self.order.push_back(sid);
        if self.order.len() > FINISHED_ID_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, sid: &SessionId) -> bool {
        self.ids.contains(sid)
    }
}

/// Tracks every negotiation of one local identity
pub struct SessionNegotiator {
    local: String,
    relay_host: Option<String>,
    sessions: DashMap<SessionId, Session>,
    finished: Mutex<FinishedIds>,
}

impl SessionNegotiator {
    /// Create a negotiator for `local`.
    ///
    /// `relay_host` is the identity advertised for our local relay, if we
    /// run one.
    pub fn new(local: impl Into<String>, relay_host: Option<String>) -> Self {
        Self {
            local: local.into(),
            relay_host,
            sessions: DashMap::new(),
            finished: Mutex::new(FinishedIds::default()),
        }
    }

    /// Our identity
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Create an initiator session and the offer stanza to send.
    ///
    /// # Errors
    ///
    /// Returns `Error::OfferInvalid` if `candidates` is empty, the offer does
    /// not validate, or it does not include SOCKS5 bytestreams
    pub fn prepare_offer(
        &self,
        peer: &str,
        offer: TransferOffer,
        candidates: Vec<StreamHostCandidate>,
    ) -> Result<(SessionId, Stanza)> {
        if candidates.is_empty() {
            return Err(Error::offer_invalid("no stream-host candidates"));
        }
        offer.validate()?;
        if !offer.supports_socks5() {
            return Err(Error::offer_invalid("SOCKS5 bytestreams not offered"));
        }

        let sid = loop {
            let sid = SessionId::generate();
            if !self.is_known(&sid) {
                break sid;
            }
        };

        let session = Session::new(
            sid.clone(),
            Role::Initiator,
            self.local.clone(),
            peer,
            offer.clone(),
            candidates.clone(),
        );

        tracing::info!(
            sid = %sid.short(),
            peer = %peer,
            file = %offer.file_name,
            size = offer.file_size,
            candidates = candidates.len(),
            "Offering file"
        );

        self.sessions.insert(sid.clone(), session);

        Ok((
            sid.clone(),
            Stanza::Offer {
                sid,
                offer,
                candidates,
            },
        ))
    }

    /// Handle an inbound offer as the target.
    ///
    /// Offers without SOCKS5 bytestreams are rejected with
    /// `UnsupportedTransport`; malformed ones with `BadRequest`; everything
    /// else goes to `decide`.
    pub fn receive_offer<F>(
        &self,
        from: &str,
        sid: SessionId,
        offer: TransferOffer,
        candidates: Vec<StreamHostCandidate>,
        decide: F,
    ) -> OfferOutcome
    where
        F: FnOnce(&TransferOffer) -> Decision,
    {
        if self.is_known(&sid) {
            tracing::warn!(sid = %sid.short(), peer = %from, "Duplicate offer ignored");
            return OfferOutcome::Duplicate;
        }

        let screened = if !offer.supports_socks5() {
            Some(RejectReason::UnsupportedTransport)
        } else if candidates.is_empty() || offer.validate().is_err() {
            Some(RejectReason::BadRequest)
        } else {
            None
        };

        let decision = match screened {
            Some(reason) => Decision::Reject(reason),
            None => decide(&offer),
        };

        let mut session = Session::new(
            sid.clone(),
            Role::Target,
            self.local.clone(),
            from,
            offer,
            candidates,
        );

        let outcome = match decision {
            Decision::Accept => {
                let advanced = session
                    .transition_to(NegotiationState::Accepted)
                    .and_then(|()| session.transition_to(NegotiationState::TransportPending));
                if let Err(e) = advanced {
                    tracing::error!(sid = %sid.short(), error = %e, "Accepting offer failed");
                    session.close(Some(e));
                    return OfferOutcome::Rejected {
                        reply: Stanza::Reject {
                            sid,
                            reason: RejectReason::BadRequest,
                        },
                        reason: RejectReason::BadRequest,
                    };
                }

                tracing::info!(
                    sid = %sid.short(),
                    peer = %from,
                    file = %session.offer().file_name,
                    size = session.offer().file_size,
                    "Offer accepted"
                );

                OfferOutcome::Accepted {
                    reply: Stanza::Accept { sid: sid.clone() },
                    candidates: session.candidates().to_vec(),
                    dst: session.dst_addr(),
                }
            }
            Decision::Reject(reason) => {
                // Fresh sessions are always Offered
                let _ = session.reject(Some(Error::NegotiationRejected(reason)));
                tracing::info!(sid = %sid.short(), peer = %from, reason = %reason, "Offer rejected");

                OfferOutcome::Rejected {
                    reply: Stanza::Reject {
                        sid: sid.clone(),
                        reason,
                    },
                    reason,
                }
            }
        };

        self.sessions.insert(sid, session);
        outcome
    }

    /// Handle the target's acceptance.
    ///
    /// Returns false if the session had already moved on (the relay can
    /// deliver the transport before the accept arrives).
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSession` if `sid` is not ours with `from`
    pub fn handle_accept(&self, from: &str, sid: &SessionId) -> Result<bool> {
        let mut session = self.session_from(from, sid)?;
        if session.role() != Role::Initiator || session.state() != NegotiationState::Offered {
            return Ok(false);
        }

        session.transition_to(NegotiationState::Accepted)?;
        session.transition_to(NegotiationState::TransportPending)?;
        tracing::info!(sid = %sid.short(), peer = %from, "Offer accepted by peer");
        Ok(true)
    }

    /// Handle the target's rejection. Returns the closed session.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSession` if `sid` is not ours with `from`, or
    /// `Error::InvalidState` if the session is past `Offered`
    pub fn handle_reject(
        &self,
        from: &str,
        sid: &SessionId,
        reason: RejectReason,
    ) -> Result<Session> {
        let mut session = self.session_from(from, sid)?;
        session.reject(Some(Error::NegotiationRejected(reason)))?;
        tracing::info!(sid = %sid.short(), peer = %from, reason = %reason, "Offer rejected by peer");
        Ok(session.value().clone())
    }

    /// Handle the target's choice of stream host.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSession` if `sid` is not ours with `from`, or
    /// `Error::Transport` if `host` was never offered
    pub fn on_stream_host_used(
        &self,
        from: &str,
        sid: &SessionId,
        host: &str,
    ) -> Result<HostAction> {
        let session = self.session_from(from, sid)?;

        let Some(candidate) = session
            .candidates()
            .iter()
            .find(|candidate| candidate.host_identity == host)
        else {
            return Err(Error::Transport(Cow::Owned(format!(
                "peer used unknown stream host {host}"
            ))));
        };

        let strategy = Strategy::classify(host, session.initiator(), self.relay_host.as_deref());
        tracing::debug!(sid = %sid.short(), host = %host, strategy = %strategy, "Peer chose stream host");

        if strategy.needs_initiator_leg() {
            Ok(HostAction::ConnectProxy {
                candidate: candidate.clone(),
                dst: session.dst_addr(),
            })
        } else {
            Ok(HostAction::AwaitRelay)
        }
    }

    /// Handle the target's report that no stream host worked. Returns the
    /// closed session.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSession` if `sid` is not ours with `from`
    pub fn on_stream_host_failed(
        &self,
        from: &str,
        sid: &SessionId,
        error: &str,
    ) -> Result<Option<Session>> {
        self.session_from(from, sid)?;
        Ok(self.close(sid, Some(Error::NoUsableCandidate(error.to_string()))))
    }

    /// Offer an established transport to session `sid`.
    ///
    /// The first transport for a session is bound; later ones are handed
    /// back for the caller to close.
    pub fn bind_transport(&self, sid: &SessionId, transport: SharedBytestream) -> BindOutcome {
        let Some(mut session) = self.sessions.get_mut(sid) else {
            return BindOutcome::Unknown(transport);
        };

        if session.bound().is_some() || session.state().is_terminal() {
            tracing::debug!(sid = %sid.short(), "Discarding extra transport");
            return BindOutcome::Discarded(transport);
        }

        // The target can reach our relay before its accept is processed
        if session.role() == Role::Initiator {
            if session.state() == NegotiationState::Offered {
                let _ = session.transition_to(NegotiationState::Accepted);
            }
            if session.state() == NegotiationState::Accepted {
                let _ = session.transition_to(NegotiationState::TransportPending);
            }
        }

        let host = transport.stream_host().cloned();
        let strategy = match &host {
            Some(host) => Strategy::classify(
                &host.host_identity,
                session.initiator(),
                self.relay_host.as_deref(),
            ),
            None => Strategy::LocalRelay,
        };

        match session.bind(BoundTransport {
            host: host.clone(),
            strategy,
            transport: std::sync::Arc::clone(&transport),
        }) {
            Ok(()) => {
                tracing::info!(sid = %sid.short(), strategy = %strategy, "Bytestream ready");
                BindOutcome::Bound { strategy, host }
            }
            Err(e) => {
                tracing::debug!(sid = %sid.short(), error = %e, "Transport not bound");
                BindOutcome::Discarded(transport)
            }
        }
    }

    /// Move a session into the data phase.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSession` or `Error::InvalidState`
    pub fn begin_data_phase(&self, sid: &SessionId) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(sid)
            .ok_or_else(|| Error::UnknownSession(sid.to_string()))?;
        session.transition_to(NegotiationState::DataPhase)
    }

    /// Close session `sid`, recording `error` if it failed.
    ///
    /// Returns a snapshot of the closed session, still holding its bound
    /// transport so the caller can close it. Returns `None` if the session
    /// is unknown or already finished.
    pub fn close(&self, sid: &SessionId, error: Option<Error>) -> Option<Session> {
        let mut session = self.sessions.get_mut(sid)?;
        if !session.close(error) {
            return None;
        }

        match session.error() {
            Some(e) => tracing::warn!(sid = %sid.short(), error = %e, "Session failed"),
            None => tracing::info!(sid = %sid.short(), "Session closed"),
        }

        let snapshot = session.value().clone();
        session.release_transport();
        Some(snapshot)
    }

    /// Close the session if it has not reached the data phase
    pub fn expire(&self, sid: &SessionId, timeout: Duration) -> Option<Session> {
        let live = self.sessions.get(sid).is_some_and(|session| {
            !session.state().is_terminal() && session.state() != NegotiationState::DataPhase
        });
        if live {
            self.close(sid, Some(Error::NegotiationTimeout(timeout)))
        } else {
            None
        }
    }

    /// Close every live session with `error`
    pub fn fail_all(&self, error: &Error) -> Vec<Session> {
        let live: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| !entry.state().is_terminal())
            .map(|entry| entry.key().clone())
            .collect();

        live.iter()
            .filter_map(|sid| self.close(sid, Some(error.clone())))
            .collect()
    }

    /// Drop the finished session `sid`, keeping only its id so a replayed
    /// offer is still refused. Live sessions are left alone.
    pub fn reap(&self, sid: &SessionId) -> Option<Session> {
        let (_, session) = self
            .sessions
            .remove_if(sid, |_, session| session.state().is_terminal())?;
        self.finished_ids().insert(sid.clone());
        tracing::trace!(sid = %sid.short(), "Session reaped");
        Some(session)
    }

    /// Snapshot of session `sid`
    #[must_use]
    pub fn get(&self, sid: &SessionId) -> Option<Session> {
        self.sessions.get(sid).map(|session| session.value().clone())
    }

    /// Transport bound to session `sid`
    #[must_use]
    pub fn bound_transport(&self, sid: &SessionId) -> Option<SharedBytestream> {
        self.sessions
            .get(sid)
            .and_then(|session| session.bound().map(|bound| std::sync::Arc::clone(&bound.transport)))
    }

    /// Number of sessions not yet reaped
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions that have not finished
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.state().is_terminal())
            .count()
    }

    fn is_known(&self, sid: &SessionId) -> bool {
        self.sessions.contains_key(sid) || self.finished_ids().contains(sid)
    }

    fn finished_ids(&self) -> MutexGuard<'_, FinishedIds> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_from(
        &self,
        from: &str,
        sid: &SessionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, SessionId, Session>> {
        match self.sessions.get_mut(sid) {
            Some(session) if session.peer() == from => Ok(session),
            Some(_) => {
                tracing::warn!(sid = %sid.short(), peer = %from, "Stanza from wrong peer ignored");
                Err(Error::UnknownSession(sid.to_string()))
            }
            None => Err(Error::UnknownSession(sid.to_string())),
        }
    }
}

impl std::fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("local", &self.local)
            .field("relay_host", &self.relay_host)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::offer::TransportType;
    use std::sync::Arc;
    use wisp_transport::memory;

    const ALICE: &str = "alice@example.org/a";
    const BOB: &str = "bob@example.org/b";

    fn offer() -> TransferOffer {
        TransferOffer::new(ALICE, BOB, "a.txt", 5)
    }

    fn relay_candidate() -> StreamHostCandidate {
        StreamHostCandidate::new(ALICE, "127.0.0.1", 8010)
    }

    fn proxy_candidate() -> StreamHostCandidate {
        StreamHostCandidate::new("proxy.example.org", "192.0.2.1", 7777)
    }

    fn stream(host: Option<StreamHostCandidate>) -> SharedBytestream {
        let (a, _b) = memory::pair(host);
        Arc::new(a)
    }

    fn initiator() -> SessionNegotiator {
        SessionNegotiator::new(ALICE, Some(ALICE.to_string()))
    }

    fn target() -> SessionNegotiator {
        SessionNegotiator::new(BOB, None)
    }

    fn offered(negotiator: &SessionNegotiator) -> SessionId {
        negotiator
            .prepare_offer(BOB, offer(), vec![relay_candidate(), proxy_candidate()])
            .unwrap()
            .0
    }

    #[test]
    fn test_offer_without_candidates_is_invalid() {
        let negotiator = initiator();
        let err = negotiator.prepare_offer(BOB, offer(), vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OfferInvalid);
        assert!(negotiator.is_empty());
    }

    #[test]
    fn test_offer_without_socks5_is_invalid() {
        let negotiator = initiator();
        let offer = offer().with_transports(vec![TransportType::InBandBytestreams]);
        let err = negotiator
            .prepare_offer(BOB, offer, vec![relay_candidate()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OfferInvalid);
    }

    #[test]
    fn test_prepare_offer_stanza() {
        let negotiator = initiator();
        let (sid, stanza) = negotiator
            .prepare_offer(BOB, offer(), vec![relay_candidate(), proxy_candidate()])
            .unwrap();

        match stanza {
            Stanza::Offer {
                sid: stanza_sid,
                candidates,
                ..
            } => {
                assert_eq!(stanza_sid, sid);
                assert_eq!(candidates, vec![relay_candidate(), proxy_candidate()]);
            }
            other => panic!("unexpected stanza {other:?}"),
        }
        assert_eq!(negotiator.get(&sid).unwrap().state(), NegotiationState::Offered);
    }

    #[test]
    fn test_receive_offer_accept() {
        let negotiator = target();
        let sid = SessionId::generate();

        match negotiator.receive_offer(ALICE, sid.clone(), offer(), vec![relay_candidate()], |_| {
            Decision::Accept
        }) {
            OfferOutcome::Accepted {
                reply,
                candidates,
                dst,
            } => {
                assert_eq!(reply, Stanza::Accept { sid: sid.clone() });
                assert_eq!(candidates, vec![relay_candidate()]);
                assert_eq!(dst, DstAddr::derive(sid.as_str(), ALICE, BOB));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            negotiator.get(&sid).unwrap().state(),
            NegotiationState::TransportPending
        );
    }

    #[test]
    fn test_receive_offer_unsupported_transport() {
        let negotiator = target();
        let offer = offer().with_transports(vec![TransportType::OutOfBand]);
        let mut asked = false;

        let outcome = negotiator.receive_offer(
            ALICE,
            SessionId::generate(),
            offer,
            vec![relay_candidate()],
            |_| {
                asked = true;
                Decision::Accept
            },
        );

        assert!(matches!(
            outcome,
            OfferOutcome::Rejected {
                reason: RejectReason::UnsupportedTransport,
                ..
            }
        ));
        assert!(!asked);
    }

    #[test]
    fn test_receive_offer_bad_request() {
        let negotiator = target();
        let outcome =
            negotiator.receive_offer(ALICE, SessionId::generate(), offer(), vec![], |_| Decision::Accept);
        assert!(matches!(
            outcome,
            OfferOutcome::Rejected {
                reason: RejectReason::BadRequest,
                ..
            }
        ));

        let mut unsafe_name = offer();
        unsafe_name.file_name = "../../etc/passwd".to_string();
        let outcome = negotiator.receive_offer(
            ALICE,
            SessionId::generate(),
            unsafe_name,
            vec![relay_candidate()],
            |_| Decision::Accept,
        );
        assert!(matches!(
            outcome,
            OfferOutcome::Rejected {
                reason: RejectReason::BadRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_receive_offer_policy_reject() {
        let negotiator = target();
        let sid = SessionId::generate();
        let outcome = negotiator.receive_offer(ALICE, sid.clone(), offer(), vec![relay_candidate()], |_| {
            Decision::Reject(RejectReason::TooLarge)
        });

        assert!(matches!(
            outcome,
            OfferOutcome::Rejected {
                reason: RejectReason::TooLarge,
                ..
            }
        ));
        let session = negotiator.get(&sid).unwrap();
        assert_eq!(session.state(), NegotiationState::Rejected);
        assert_eq!(negotiator.active_count(), 0);
    }

    #[test]
    fn test_duplicate_offer_ignored() {
        let negotiator = target();
        let sid = SessionId::generate();
        negotiator.receive_offer(ALICE, sid.clone(), offer(), vec![relay_candidate()], |_| {
            Decision::Accept
        });
        assert!(matches!(
            negotiator.receive_offer(ALICE, sid, offer(), vec![relay_candidate()], |_| Decision::Accept),
            OfferOutcome::Duplicate
        ));
    }

    #[test]
    fn test_accept_and_reject_from_peer() {
        let negotiator = initiator();
        let sid = offered(&negotiator);

        // Wrong peer
        assert!(negotiator.handle_accept("mallory@example.org/m", &sid).is_err());

        assert!(negotiator.handle_accept(BOB, &sid).unwrap());
        assert!(!negotiator.handle_accept(BOB, &sid).unwrap());
        assert!(negotiator
            .handle_reject(BOB, &sid, RejectReason::Declined)
            .is_err());

        let other = offered(&negotiator);
        let session = negotiator
            .handle_reject(BOB, &other, RejectReason::Declined)
            .unwrap();
        assert_eq!(session.state(), NegotiationState::Rejected);
        assert_eq!(
            session.error(),
            Some(&Error::NegotiationRejected(RejectReason::Declined))
        );
    }

    #[test]
    fn test_stream_host_used_strategies() {
        let negotiator = initiator();
        let sid = offered(&negotiator);
        negotiator.handle_accept(BOB, &sid).unwrap();

        assert_eq!(
            negotiator.on_stream_host_used(BOB, &sid, ALICE).unwrap(),
            HostAction::AwaitRelay
        );

        match negotiator
            .on_stream_host_used(BOB, &sid, "proxy.example.org")
            .unwrap()
        {
            HostAction::ConnectProxy { candidate, dst } => {
                assert_eq!(candidate, proxy_candidate());
                assert_eq!(dst, negotiator.get(&sid).unwrap().dst_addr());
            }
            other => panic!("unexpected action {other:?}"),
        }

        assert!(negotiator
            .on_stream_host_used(BOB, &sid, "evil.example.org")
            .is_err());
    }

    #[test]
    fn test_stream_host_failed_closes() {
        let negotiator = initiator();
        let sid = offered(&negotiator);
        negotiator.handle_accept(BOB, &sid).unwrap();

        let session = negotiator
            .on_stream_host_failed(BOB, &sid, "all refused")
            .unwrap()
            .unwrap();
        assert_eq!(session.state(), NegotiationState::Closed);
        assert_eq!(session.error().unwrap().kind(), ErrorKind::NoUsableCandidate);
    }

    #[test]
    fn test_bind_only_first_transport() {
        let negotiator = target();
        let sid = SessionId::generate();
        negotiator.receive_offer(ALICE, sid.clone(), offer(), vec![relay_candidate()], |_| {
            Decision::Accept
        });

        match negotiator.bind_transport(&sid, stream(Some(relay_candidate()))) {
            BindOutcome::Bound { strategy, host } => {
                assert_eq!(strategy, Strategy::Direct);
                assert_eq!(host, Some(relay_candidate()));
            }
            _ => panic!("expected bind"),
        }
        assert!(matches!(
            negotiator.bind_transport(&sid, stream(None)),
            BindOutcome::Discarded(_)
        ));
        assert!(matches!(
            negotiator.bind_transport(&SessionId::generate(), stream(None)),
            BindOutcome::Unknown(_)
        ));
    }

    #[test]
    fn test_relay_transport_before_accept() {
        let negotiator = initiator();
        let sid = offered(&negotiator);

        match negotiator.bind_transport(&sid, stream(None)) {
            BindOutcome::Bound { strategy, .. } => assert_eq!(strategy, Strategy::LocalRelay),
            _ => panic!("expected bind"),
        }
        assert_eq!(
            negotiator.get(&sid).unwrap().state(),
            NegotiationState::TransportReady
        );

        // Late accept is ignored
        assert!(!negotiator.handle_accept(BOB, &sid).unwrap());
    }

    #[test]
    fn test_data_phase_and_close() {
        let negotiator = initiator();
        let sid = offered(&negotiator);
        assert!(negotiator.begin_data_phase(&sid).is_err());

        negotiator.bind_transport(&sid, stream(None));
        negotiator.begin_data_phase(&sid).unwrap();

        // Data phase is not subject to the negotiation timeout
        assert!(negotiator.expire(&sid, Duration::from_secs(1)).is_none());

        let closed = negotiator.close(&sid, None).unwrap();
        assert!(closed.succeeded());
        assert!(closed.bound().is_some());
        assert!(negotiator.get(&sid).unwrap().bound().is_none());
        assert!(negotiator.close(&sid, None).is_none());
    }

    #[test]
    fn test_expire_pending_session() {
        let negotiator = initiator();
        let sid = offered(&negotiator);

        let session = negotiator.expire(&sid, Duration::from_secs(120)).unwrap();
        assert_eq!(session.error().unwrap().kind(), ErrorKind::NegotiationTimeout);
    }

    #[test]
    fn test_fail_all() {
        let negotiator = initiator();
        let a = offered(&negotiator);
        let b = offered(&negotiator);
        negotiator.handle_reject(BOB, &b, RejectReason::Declined).unwrap();

        let closed = negotiator.fail_all(&Error::connection_lost("signaling dropped"));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id(), &a);
        assert_eq!(negotiator.active_count(), 0);
        assert_eq!(negotiator.len(), 2);
    }

    #[test]
    fn test_reap_drops_finished_sessions() {
        let negotiator = target();
        let mut sids = Vec::new();
        for _ in 0..1000 {
            let sid = SessionId::generate();
            negotiator.receive_offer(ALICE, sid.clone(), offer(), vec![relay_candidate()], |_| {
                Decision::Accept
            });
            negotiator.close(&sid, None).unwrap();
            assert!(negotiator.reap(&sid).is_some());
            sids.push(sid);
        }

        assert_eq!(negotiator.len(), 0);
        assert_eq!(negotiator.active_count(), 0);

        // A replayed offer for a reaped session is still refused
        assert!(matches!(
            negotiator.receive_offer(ALICE, sids[999].clone(), offer(), vec![relay_candidate()], |_| {
                Decision::Accept
            }),
            OfferOutcome::Duplicate
        ));
        assert!(negotiator.is_empty());
    }

    #[test]
    fn test_reap_leaves_live_sessions() {
        let negotiator = initiator();
        let sid = offered(&negotiator);
        assert!(negotiator.reap(&sid).is_none());
        assert_eq!(negotiator.len(), 1);

        negotiator.handle_reject(BOB, &sid, RejectReason::Declined).unwrap();
        assert_eq!(negotiator.reap(&sid).unwrap().state(), NegotiationState::Rejected);
        assert!(negotiator.get(&sid).is_none());
        assert!(negotiator.reap(&sid).is_none());
    }

    #[test]
    fn test_finished_ids_are_bounded() {
        let mut finished = FinishedIds::default();
        let first = SessionId::generate();
        finished.insert(first.clone());
        for _ in 0..FINISHED_ID_CAPACITY {
            finished.insert(SessionId::generate());
        }

        assert_eq!(finished.order.len(), FINISHED_ID_CAPACITY);
        assert_eq!(finished.ids.len(), FINISHED_ID_CAPACITY);
        assert!(!finished.contains(&first));
    }
}

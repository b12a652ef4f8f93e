//! Role drivers - the event loop and the sender/receiver orchestration
//!
//! Every source of work (signaling, the local relay, candidate trials,
//! transfer workers and timers) posts [`Event`]s to one channel. The
//! [`EventLoop`] consumes them on a single task and never awaits network or
//! file I/O while dispatching, so per-session transitions are strictly
//! sequential. Roles customise behaviour through [`EventHandler`], whose
//! methods all have defaults.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wisp_core::driver::receiver::{ReceiveRequest, receive_files};
//! use wisp_core::signal::tcp::TcpSignaling;
//!
//! #[tokio::main]
//! async fn main() {
//!     let signaling = Arc::new(TcpSignaling::new("127.0.0.1:5280", "bob@example.org/desk", None));
//!     let status = receive_files(ReceiveRequest::new("downloads"), signaling).await;
//!     std::process::exit(status.code());
//! }
//! ```

pub mod receiver;
pub mod sender;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::event::{self, Event, EventReceiver, EventSender};
use crate::manager::{SessionManager, TaskCompletion};
use crate::negotiator::{BindOutcome, HostAction, OfferOutcome, SessionNegotiator};
use crate::offer::TransferOffer;
use crate::policy::{Decision, RejectReason};
use crate::session::{NegotiationState, Role, Session, SessionId};
use crate::signal::{Signaling, Stanza};
use crate::worker::{self, Job, ProgressSender};
use std::borrow::Cow;
use std::sync::Arc;
use wisp_transport::{
    CandidateBytestream, CandidateTrial, Connector, DstAddr, LocalRelay, RelayHandle,
    SharedBytestream, StreamHostCandidate, TcpConnector,
};

/// Process outcome of a driver run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The primary task succeeded
    Success,
    /// The primary task failed
    Failure,
}

impl ExitStatus {
    /// Whether this is `Success`
    #[must_use]
    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }

    /// Process exit code
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

/// Whether the event loop keeps running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep dispatching events
    Continue,
    /// Tear down and return
    Stop,
}

/// Sink for human-readable status lines
pub type StatusFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Status sink printing to stdout
pub(crate) fn stdout_status() -> StatusFn {
    Arc::new(|line: &str| println!("{line}"))
}

/// Write `line` to `status`, or to the log when there is no sink
pub(crate) fn emit(status: Option<&StatusFn>, line: &str) {
    match status {
        Some(status) => status(line),
        None => tracing::info!("{line}"),
    }
}

/// Role-specific reactions to driver events.
///
/// Every method has a default; roles override only what they need.
pub trait EventHandler: Send {
    /// Signaling session established
    fn on_connect(&mut self, _core: &DriverCore) -> Flow {
        Flow::Continue
    }

    /// Signaling channel secured
    fn on_tls_ready(&mut self, _core: &DriverCore) -> Flow {
        Flow::Continue
    }

    /// Signaling channel dropped. Open sessions are already closed.
    fn on_disconnect(&mut self, _core: &DriverCore, _reason: Option<&str>) -> Flow {
        Flow::Stop
    }

    /// Decide on an offer that passed structural checks
    fn on_offer_received(
        &mut self,
        _core: &DriverCore,
        _from: &str,
        _sid: &SessionId,
        _offer: &TransferOffer,
    ) -> Decision {
        Decision::Reject(RejectReason::Declined)
    }

    /// A bytestream is bound to `sid`; typically starts the worker
    fn on_transport_ready(&mut self, _core: &DriverCore, _sid: &SessionId) -> Flow {
        Flow::Continue
    }

    /// A session reached `Closed` or `Rejected`. It is dropped from the
    /// negotiator once this returns.
    fn on_session_closed(&mut self, _core: &DriverCore, _session: &Session) -> Flow {
        Flow::Continue
    }
}

/// State shared by the event loop and the handlers
pub struct DriverCore {
    negotiator: SessionNegotiator,
    manager: SessionManager,
    signaling: Arc<dyn Signaling>,
    events: EventSender,
    config: TransferConfig,
    connector: Arc<dyn Connector>,
    progress: Option<ProgressSender>,
    status: Option<StatusFn>,
    relay: Option<RelayHandle>,
    closed: std::sync::Mutex<Vec<Session>>,
}

impl DriverCore {
    /// Our identity
    #[must_use]
    pub fn identity(&self) -> &str {
        self.signaling.identity()
    }

    /// Transfer configuration
    #[must_use]
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Session negotiator
    #[must_use]
    pub fn negotiator(&self) -> &SessionNegotiator {
        &self.negotiator
    }

    /// Task manager
    #[must_use]
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// A sender for the event channel
    #[must_use]
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Address of the local relay, if running
    #[must_use]
    pub fn relay_addr(&self) -> Option<std::net::SocketAddr> {
        self.relay.as_ref().map(RelayHandle::local_addr)
    }

    /// Snapshot of session `sid`
    #[must_use]
    pub fn session(&self, sid: &SessionId) -> Option<Session> {
        self.negotiator.get(sid)
    }

    /// Emit a status line
    pub fn status(&self, line: &str) {
        if let Some(status) = &self.status {
            status(line);
        }
    }

    /// Send a stanza, logging failures. Returns false if it could not be
    /// enqueued.
    pub fn send_stanza(&self, to: &str, stanza: Stanza) -> bool {
        let name = stanza.name();
        let sid = stanza.sid().short().to_string();
        match self.signaling.send(to, stanza) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(to = %to, stanza = name, sid = %sid, error = %e, "Failed to send stanza");
                false
            }
        }
    }

    /// Offer `offer` to `peer` with `candidates` and start the negotiation
    /// timer.
    ///
    /// # Errors
    ///
    /// Returns `Error::OfferInvalid` for a bad offer or `Error::Signaling`
    /// if the offer could not be sent
    pub fn offer(
        &self,
        peer: &str,
        offer: TransferOffer,
        candidates: Vec<StreamHostCandidate>,
    ) -> Result<SessionId> {
        let (sid, stanza) = self.negotiator.prepare_offer(peer, offer, candidates)?;

        if let (Some(relay), Some(session)) = (&self.relay, self.negotiator.get(&sid)) {
            relay.registry().expect(session.dst_addr(), sid.as_str());
        }

        if let Err(e) = self.signaling.send(peer, stanza) {
            self.close_session(&sid, Some(e.clone()));
            return Err(e);
        }

        self.arm_timeout(&sid);
        Ok(sid)
    }

    /// Post `NegotiationTimeout` for `sid` after the configured timeout
    pub fn arm_timeout(&self, sid: &SessionId) {
        let events = self.events.clone();
        let sid = sid.clone();
        let timeout = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::NegotiationTimeout { sid });
        });
    }

    /// Try `candidates` in order off the event path
    pub fn spawn_trial(&self, sid: &SessionId, candidates: Vec<StreamHostCandidate>, dst: DstAddr) {
        let trial = CandidateTrial::new(candidates, dst, Arc::clone(&self.connector));
        let events = self.events.clone();
        let sid = sid.clone();

        tokio::spawn(async move {
            let stream = CandidateBytestream::new(trial);
            let event = match wisp_transport::Bytestream::connect(&stream).await {
                Ok(()) => Event::TransportReady {
                    sid,
                    transport: Arc::new(stream),
                },
                Err(e) => Event::TransportFailed {
                    sid,
                    error: e.into(),
                },
            };
            let _ = events.send(event);
        });
    }

    /// Dial the proxy chosen by the target
    pub fn spawn_proxy_leg(&self, sid: &SessionId, candidate: StreamHostCandidate, dst: DstAddr) {
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let sid = sid.clone();

        tokio::spawn(async move {
            let event = match connector.connect(&candidate, &dst).await {
                Ok(transport) => Event::TransportReady { sid, transport },
                Err(e) => Event::TransportFailed {
                    sid,
                    error: e.into(),
                },
            };
            let _ = events.send(event);
        });
    }

    /// Move `sid` into the data phase and spawn its worker.
    ///
    /// On failure the session is closed with the error.
    ///
    /// # Errors
    ///
    /// Returns the error that closed the session
    pub fn start_transfer(&self, sid: &SessionId, job: Job) -> Result<()> {
        let result = self.try_start_transfer(sid, job);
        if let Err(e) = &result {
            self.close_session(sid, Some(e.clone()));
        }
        result
    }

    fn try_start_transfer(&self, sid: &SessionId, job: Job) -> Result<()> {
        let transport = self
            .negotiator
            .bound_transport(sid)
            .ok_or_else(|| Error::invalid_state("no transport bound"))?;

        self.negotiator.begin_data_phase(sid)?;

        let work = worker::run_job(job, Arc::clone(&transport), self.progress.clone());
        self.manager.create_task(sid.clone(), transport, work)?;
        Ok(())
    }

    /// Close session `sid`, releasing its transport and relay registration.
    ///
    /// Returns false if the session was unknown or already finished.
    pub fn close_session(&self, sid: &SessionId, error: Option<Error>) -> bool {
        match self.negotiator.close(sid, error) {
            Some(session) => {
                self.release(session);
                true
            }
            None => false,
        }
    }

    /// Abort `sid` towards the peer and close it locally
    pub fn abort_session(&self, sid: &SessionId, error: Error) -> bool {
        if let Some(session) = self.negotiator.get(sid) {
            if !session.state().is_terminal() {
                self.send_stanza(
                    session.peer(),
                    Stanza::Abort {
                        sid: sid.clone(),
                        reason: error.to_string(),
                    },
                );
            }
        }
        self.close_session(sid, Some(error))
    }

    fn release(&self, session: Session) {
        if let Some(relay) = &self.relay {
            relay.registry().forget(&session.dst_addr());
        }
        if let Some(bound) = session.bound() {
            close_in_background(Arc::clone(&bound.transport));
        }
        self.closed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(session);
    }

    fn take_closed(&self) -> Vec<Session> {
        std::mem::take(
            &mut *self
                .closed
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

fn close_in_background(transport: SharedBytestream) {
    tokio::spawn(async move {
        if let Err(e) = transport.close().await {
            tracing::debug!(error = %e, "Closing bytestream failed");
        }
    });
}

/// Single-task event loop driving one signaling identity
pub struct EventLoop {
    core: DriverCore,
    events: EventReceiver,
}

impl EventLoop {
    /// Create an event loop over `signaling`
    pub fn new(signaling: Arc<dyn Signaling>, config: TransferConfig) -> Self {
        let (tx, rx) = event::channel();
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config.socks5.clone()));

        Self {
            core: DriverCore {
                negotiator: SessionNegotiator::new(signaling.identity(), None),
                manager: SessionManager::new(tx.clone()),
                signaling,
                events: tx,
                config,
                connector,
                progress: None,
                status: None,
                relay: None,
                closed: std::sync::Mutex::new(Vec::new()),
            },
            events: rx,
        }
    }

    /// Use `connector` for candidate trials and proxy legs
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.core.connector = connector;
        self
    }

    /// Report transfer progress on `progress`
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.core.progress = Some(progress);
        self
    }

    /// Report status lines to `status`
    #[must_use]
    pub fn with_status(mut self, status: StatusFn) -> Self {
        self.core.status = Some(status);
        self
    }

    /// Serve `relay` for the sessions this loop offers.
    ///
    /// The relay is advertised under our own identity.
    #[must_use]
    pub fn with_relay(mut self, relay: LocalRelay) -> Self {
        let identity = self.core.identity().to_string();
        self.core.negotiator = SessionNegotiator::new(identity.clone(), Some(identity));

        let events = self.core.events.clone();
        let handle = relay.spawn(move |sid, stream| match SessionId::parse(&sid) {
            Some(sid) => {
                let _ = events.send(Event::TransportReady {
                    sid,
                    transport: Arc::new(stream),
                });
            }
            None => tracing::warn!(sid = %sid, "Relay accepted stream for malformed session id"),
        });

        self.core.relay = Some(handle);
        self
    }

    /// Shared driver state
    #[must_use]
    pub fn core(&self) -> &DriverCore {
        &self.core
    }

    /// A sender for the event channel
    #[must_use]
    pub fn events(&self) -> EventSender {
        self.core.events.clone()
    }

    /// Connect the signaling channel and dispatch events until a handler
    /// stops the loop, then tear everything down.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signaling` if the signaling connection fails
    pub async fn run<H: EventHandler>(mut self, handler: &mut H) -> Result<()> {
        if let Err(e) = self.core.signaling.connect(self.core.events.clone()).await {
            self.core.status(&format!("connection failed: {e}"));
            self.teardown(handler).await;
            return Err(e);
        }

        while let Some(event) = self.events.recv().await {
            tracing::trace!(event = ?event, "Dispatching event");

            let mut flow = self.dispatch(event, handler);
            if self.notify_closed(handler) == Flow::Stop {
                flow = Flow::Stop;
            }
            if flow == Flow::Stop {
                break;
            }
        }

        self.teardown(handler).await;
        Ok(())
    }

    fn dispatch<H: EventHandler>(&self, event: Event, handler: &mut H) -> Flow {
        let core = &self.core;

        match event {
            Event::Connected => {
                core.status(&format!("connected as {}", core.identity()));
                handler.on_connect(core)
            }
            Event::TlsReady => handler.on_tls_ready(core),
            Event::Disconnected(reason) => {
                core.status(&format!(
                    "disconnected{}",
                    reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
                ));
                let error = Error::ConnectionLost(Cow::Owned(
                    reason.clone().unwrap_or_else(|| "signaling connection closed".to_string()),
                ));
                for session in core.negotiator.fail_all(&error) {
                    core.release(session);
                }
                handler.on_disconnect(core, reason.as_deref())
            }
            Event::Stanza { from, stanza } => {
                Self::handle_stanza(core, handler, &from, stanza);
                Flow::Continue
            }
            Event::TransportReady { sid, transport } => Self::handle_transport(core, handler, sid, transport),
            Event::TransportFailed { sid, error } => {
                if let Some(session) = core.session(&sid) {
                    if session.role() == Role::Target && !session.state().is_terminal() {
                        core.send_stanza(
                            session.peer(),
                            Stanza::StreamHostFailed {
                                sid: sid.clone(),
                                error: error.to_string(),
                            },
                        );
                        core.close_session(&sid, Some(error));
                    } else {
                        core.abort_session(&sid, error);
                    }
                }
                Flow::Continue
            }
            Event::NegotiationTimeout { sid } => {
                if let Some(session) = core.negotiator.expire(&sid, core.config.negotiation_timeout) {
                    core.send_stanza(
                        session.peer(),
                        Stanza::Abort {
                            sid,
                            reason: "negotiation timed out".to_string(),
                        },
                    );
                    core.release(session);
                }
                Flow::Continue
            }
            Event::TaskFinished(TaskCompletion { task, sid, result }) => {
                match &result {
                    Ok(summary) => {
                        tracing::info!(task = %task, sid = %sid.short(), bytes = summary.bytes, "Transfer finished");
                        core.status(&format!(
                            "transfer complete: {} bytes ({})",
                            summary.bytes,
                            summary.path.display()
                        ));
                    }
                    Err(e) => {
                        tracing::info!(task = %task, sid = %sid.short(), error = %e, "Transfer failed");
                    }
                }
                core.close_session(&sid, result.err());
                Flow::Continue
            }
            Event::Shutdown => {
                tracing::info!("Shutdown requested");
                Flow::Stop
            }
        }
    }

    fn handle_stanza<H: EventHandler>(core: &DriverCore, handler: &mut H, from: &str, stanza: Stanza) {
        tracing::debug!(from = %from, stanza = stanza.name(), sid = %stanza.sid().short(), "Stanza received");

        match stanza {
            Stanza::Offer {
                sid,
                offer,
                candidates,
            } => {
                let decide_sid = sid.clone();
                let outcome = core.negotiator.receive_offer(from, sid.clone(), offer, candidates, |offer| {
                    handler.on_offer_received(core, from, &decide_sid, offer)
                });

                match outcome {
                    OfferOutcome::Accepted {
                        reply,
                        candidates,
                        dst,
                    } => {
                        if let Some(session) = core.session(&sid) {
                            core.status(&format!(
                                "accepted {} ({} bytes) from {from}",
                                session.offer().file_name,
                                session.offer().file_size
                            ));
                        }
                        core.send_stanza(from, reply);
                        core.arm_timeout(&sid);
                        core.spawn_trial(&sid, candidates, dst);
                    }
                    OfferOutcome::Rejected { reply, reason } => {
                        core.status(&format!("rejected offer from {from}: {reason}"));
                        core.send_stanza(from, reply);
                        if let Some(session) = core.session(&sid) {
                            core.release(session);
                        }
                    }
                    OfferOutcome::Duplicate => {}
                }
            }
            Stanza::Accept { sid } => match core.negotiator.handle_accept(from, &sid) {
                Ok(true) => core.status(&format!("{from} accepted the offer")),
                Ok(false) => {}
                Err(e) => tracing::debug!(sid = %sid.short(), error = %e, "Accept ignored"),
            },
            Stanza::Reject { sid, reason } => match core.negotiator.handle_reject(from, &sid, reason) {
                Ok(session) => {
                    core.status(&format!("offer rejected: {reason}"));
                    core.release(session);
                }
                Err(e) => tracing::debug!(sid = %sid.short(), error = %e, "Reject ignored"),
            },
            Stanza::StreamHostUsed { sid, host } => {
                match core.negotiator.on_stream_host_used(from, &sid, &host) {
                    Ok(HostAction::ConnectProxy { candidate, dst }) => {
                        core.spawn_proxy_leg(&sid, candidate, dst);
                    }
                    Ok(HostAction::AwaitRelay) => {}
                    Err(Error::UnknownSession(_)) => {}
                    Err(e) => {
                        core.abort_session(&sid, e);
                    }
                }
            }
            Stanza::StreamHostFailed { sid, error } => {
                match core.negotiator.on_stream_host_failed(from, &sid, &error) {
                    Ok(Some(session)) => core.release(session),
                    Ok(None) => {}
                    Err(e) => tracing::debug!(sid = %sid.short(), error = %e, "Stream host failure ignored"),
                }
            }
            Stanza::Abort { sid, reason } => {
                let from_peer = core.session(&sid).is_some_and(|session| session.peer() == from);
                if from_peer {
                    core.close_session(
                        &sid,
                        Some(Error::ConnectionLost(Cow::Owned(format!("peer aborted: {reason}")))),
                    );
                }
            }
        }
    }

    fn handle_transport<H: EventHandler>(
        core: &DriverCore,
        handler: &mut H,
        sid: SessionId,
        transport: SharedBytestream,
    ) -> Flow {
        match core.negotiator.bind_transport(&sid, transport) {
            BindOutcome::Bound { strategy, host } => {
                core.status(&format!("bytestream ready via {strategy}"));

                if let (Some(session), Some(host)) = (core.session(&sid), host) {
                    if session.role() == Role::Target {
                        core.send_stanza(
                            session.peer(),
                            Stanza::StreamHostUsed {
                                sid: sid.clone(),
                                host: host.host_identity,
                            },
                        );
                    }
                }

                handler.on_transport_ready(core, &sid)
            }
            BindOutcome::Discarded(transport) | BindOutcome::Unknown(transport) => {
                close_in_background(transport);
                Flow::Continue
            }
        }
    }

    fn notify_closed<H: EventHandler>(&self, handler: &mut H) -> Flow {
        let mut flow = Flow::Continue;
        for session in self.core.take_closed() {
            if let Some(e) = session.error() {
                if session.state() != NegotiationState::Rejected {
                    self.core.status(&format!("session {} failed: {e}", session.id().short()));
                }
            }
            if handler.on_session_closed(&self.core, &session) == Flow::Stop {
                flow = Flow::Stop;
            }
            self.core.negotiator.reap(session.id());
        }
        flow
    }

    async fn teardown<H: EventHandler>(mut self, handler: &mut H) {
        for session in self
            .core
            .negotiator
            .fail_all(&Error::connection_lost("driver shutting down"))
        {
            self.core.release(session);
        }

        self.core.manager.shutdown().await;

        if let Some(relay) = self.core.relay.take() {
            relay.shutdown().await;
        }

        self.core.signaling.disconnect().await;
        self.notify_closed(handler);

        tracing::debug!("Event loop stopped");
    }
}

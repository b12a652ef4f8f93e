//! Sender role: offer one file and stream it to the receiver.

use super::{DriverCore, EventHandler, EventLoop, ExitStatus, Flow, StatusFn, emit, stdout_status};
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::offer::{FileRange, TransferOffer};
use crate::session::{Session, SessionId};
use crate::signal::Signaling;
use crate::worker::{Job, ProgressSender, SendJob};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use wisp_transport::{Connector, LocalRelay, StreamHostCandidate};

/// Where the local relay listens and how it is advertised
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Listen address (port 0 picks a free port)
    pub bind: SocketAddr,
    /// Address published to the receiver
    pub advertise: String,
}

/// A single-file send
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// File to send
    pub file: PathBuf,
    /// Receiver identity
    pub to: String,
    /// Free-form description
    pub description: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Send only part of the file
    pub range: Option<FileRange>,
    /// Local relay, offered as the first candidate
    pub relay: Option<RelaySettings>,
    /// Third-party proxies, offered after the relay in this order
    pub proxies: Vec<StreamHostCandidate>,
    /// Transfer settings
    pub config: TransferConfig,
}

impl SendRequest {
    /// Send `file` to `to` with default settings and no stream hosts
    pub fn new(file: impl Into<PathBuf>, to: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            to: to.into(),
            description: None,
            mime_type: None,
            range: None,
            relay: None,
            proxies: Vec::new(),
            config: TransferConfig::default(),
        }
    }
}

/// Drives one send to completion
pub struct FileSender {
    request: SendRequest,
    signaling: Arc<dyn Signaling>,
    connector: Option<Arc<dyn Connector>>,
    progress: Option<ProgressSender>,
    status: Option<StatusFn>,
}

impl FileSender {
    /// Create a sender for `request` over `signaling`
    pub fn new(request: SendRequest, signaling: Arc<dyn Signaling>) -> Self {
        Self {
            request,
            signaling,
            connector: None,
            progress: None,
            status: None,
        }
    }

    /// Use `connector` for proxy connections
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Report transfer progress on `progress`
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Report status lines to `status`
    #[must_use]
    pub fn with_status(mut self, status: StatusFn) -> Self {
        self.status = Some(status);
        self
    }

    /// Offer the file and run until its session closes.
    ///
    /// The offer (size, date, and hash) is built before connecting, and the
    /// relay is bound before the offer is sent.
    ///
    /// # Errors
    ///
    /// Returns `Error::OfferInvalid` before any network activity when the
    /// offer is malformed or there are no candidates,
    /// `Error::ListenBindFailure` when the relay cannot bind and no proxy is
    /// configured, and signaling errors. A session that ran but failed is
    /// returned as `Ok` with its error recorded.
    pub async fn run(self) -> Result<Session> {
        let request = self.request;
        let identity = self.signaling.identity().to_string();

        let mut offer = TransferOffer::for_file(
            &request.file,
            identity.clone(),
            request.to.clone(),
            request.config.compute_hash,
        )
        .await?;
        if let Some(description) = &request.description {
            offer = offer.with_description(description.clone());
        }
        if let Some(mime_type) = &request.mime_type {
            offer = offer.with_mime_type(mime_type.clone());
        }
        if let Some(range) = request.range {
            offer = offer.with_range(range);
        }
        offer.validate()?;

        if request.relay.is_none() && request.proxies.is_empty() {
            return Err(Error::offer_invalid("no stream-host candidates"));
        }

        let mut candidates = Vec::with_capacity(request.proxies.len() + 1);
        let mut relay = None;
        if let Some(settings) = &request.relay {
            match LocalRelay::bind(settings.bind, request.config.relay.clone()).await {
                Ok(bound) => {
                    candidates.push(StreamHostCandidate::new(
                        identity.clone(),
                        settings.advertise.clone(),
                        bound.local_addr().port(),
                    ));
                    relay = Some(bound);
                }
                Err(e) if request.proxies.is_empty() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(error = %e, "Local relay unavailable, offering proxies only");
                }
            }
        }
        candidates.extend(request.proxies.iter().cloned());

        let mut event_loop = EventLoop::new(Arc::clone(&self.signaling), request.config.clone());
        if let Some(connector) = self.connector {
            event_loop = event_loop.with_connector(connector);
        }
        if let Some(progress) = self.progress {
            event_loop = event_loop.with_progress(progress);
        }
        if let Some(status) = self.status {
            event_loop = event_loop.with_status(status);
        }
        if let Some(relay) = relay {
            event_loop = event_loop.with_relay(relay);
        }

        let mut handler = SenderHandler {
            peer: request.to.clone(),
            path: request.file.clone(),
            offer: Some(offer),
            candidates,
            sid: None,
            outcome: None,
            error: None,
        };

        event_loop.run(&mut handler).await?;

        match (handler.outcome, handler.error) {
            (Some(session), _) => Ok(session),
            (None, Some(error)) => Err(error),
            (None, None) => Err(Error::connection_lost("stopped before the session finished")),
        }
    }

    /// Run the send and reduce it to an exit status. Failures that end the
    /// run early are reported on the status sink.
    pub async fn send(self) -> ExitStatus {
        let status = self.status.clone();
        match self.run().await {
            Ok(session) if session.succeeded() => ExitStatus::Success,
            Ok(_) => ExitStatus::Failure,
            Err(e) => {
                emit(status.as_ref(), &format!("send failed: {e}"));
                ExitStatus::Failure
            }
        }
    }
}

struct SenderHandler {
    peer: String,
    path: PathBuf,
    offer: Option<TransferOffer>,
    candidates: Vec<StreamHostCandidate>,
    sid: Option<SessionId>,
    outcome: Option<Session>,
    error: Option<Error>,
}

impl EventHandler for SenderHandler {
    fn on_connect(&mut self, core: &DriverCore) -> Flow {
        // Reconnects never re-offer
        let Some(offer) = self.offer.take() else {
            return Flow::Continue;
        };

        let file_name = offer.file_name.clone();
        let size = offer.expected_bytes();
        match core.offer(&self.peer, offer, self.candidates.clone()) {
            Ok(sid) => {
                core.status(&format!("offered {file_name} ({size} bytes) to {}", self.peer));
                self.sid = Some(sid);
                Flow::Continue
            }
            Err(e) => {
                core.status(&format!("offer failed: {e}"));
                self.error = Some(e);
                Flow::Stop
            }
        }
    }

    fn on_transport_ready(&mut self, core: &DriverCore, sid: &SessionId) -> Flow {
        if self.sid.as_ref() != Some(sid) {
            return Flow::Continue;
        }
        let Some(session) = core.session(sid) else {
            return Flow::Continue;
        };

        let job = SendJob::for_session(&session, self.path.clone(), core.config());
        if let Err(e) = core.start_transfer(sid, Job::Send(job)) {
            tracing::warn!(sid = %sid.short(), error = %e, "Could not start sending");
        }
        Flow::Continue
    }

    fn on_session_closed(&mut self, _core: &DriverCore, session: &Session) -> Flow {
        if self.sid.as_ref() == Some(session.id()) {
            self.outcome = Some(session.clone());
            Flow::Stop
        } else {
            Flow::Continue
        }
    }
}

/// Send one file, printing status lines to stdout.
pub async fn send_file(request: SendRequest, signaling: Arc<dyn Signaling>) -> ExitStatus {
    FileSender::new(request, signaling)
        .with_status(stdout_status())
        .send()
        .await
}

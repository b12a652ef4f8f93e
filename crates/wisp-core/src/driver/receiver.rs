//! Receiver role: accept offers and store the files.

use super::{DriverCore, EventHandler, EventLoop, ExitStatus, Flow, StatusFn, emit, stdout_status};
use crate::config::TransferConfig;
use crate::error::Result;
use crate::event::Event;
use crate::offer::TransferOffer;
use crate::policy::{AcceptAll, AcceptPolicy, Decision, RejectReason};
use crate::session::{NegotiationState, Role, Session, SessionId};
use crate::signal::Signaling;
use crate::worker::{Job, ProgressSender, ReceiveJob};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use wisp_transport::Connector;

/// What to accept and where to store it
#[derive(Clone)]
pub struct ReceiveRequest {
    /// Directory received files are written to
    pub output_dir: PathBuf,
    /// Accept/reject decision for each offer
    pub policy: Arc<dyn AcceptPolicy>,
    /// Stop after this many accepted sessions have finished
    pub max_transfers: Option<usize>,
    /// Transfer settings
    pub config: TransferConfig,
}

impl ReceiveRequest {
    /// Accept everything into `output_dir`, running until disconnected
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            policy: Arc::new(AcceptAll),
            max_transfers: None,
            config: TransferConfig::default(),
        }
    }
}

impl fmt::Debug for ReceiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRequest")
            .field("output_dir", &self.output_dir)
            .field("max_transfers", &self.max_transfers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Tally of a receiver run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Files stored successfully
    pub completed: usize,
    /// Accepted sessions that failed
    pub failed: usize,
    /// Offers declined
    pub rejected: usize,
    /// Closed sessions, in closing order
    pub sessions: Vec<SessionId>,
}

impl ReceiveReport {
    /// Whether no accepted session failed
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

type ShutdownFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Accepts offers until disconnected, shut down, or done
pub struct FileReceiver {
    request: ReceiveRequest,
    signaling: Arc<dyn Signaling>,
    connector: Option<Arc<dyn Connector>>,
    progress: Option<ProgressSender>,
    status: Option<StatusFn>,
    shutdown: Option<ShutdownFuture>,
}

impl FileReceiver {
    /// Create a receiver for `request` over `signaling`
    pub fn new(request: ReceiveRequest, signaling: Arc<dyn Signaling>) -> Self {
        Self {
            request,
            signaling,
            connector: None,
            progress: None,
            status: None,
            shutdown: None,
        }
    }

    /// Use `connector` for candidate trials
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

    /// Stop when `shutdown` completes
    #[must_use]
    pub fn with_shutdown<F>(mut self, shutdown: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shutdown = Some(Box::pin(shutdown));
        self
    }

    /// Receive until disconnected, shut down, or `max_transfers` sessions
    /// have finished.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the output directory cannot be created, or a
    /// signaling error if the connection fails
    pub async fn run(self) -> Result<ReceiveReport> {
        tokio::fs::create_dir_all(&self.request.output_dir).await?;

        let mut event_loop = EventLoop::new(self.signaling, self.request.config.clone());
        if let Some(connector) = self.connector {
            event_loop = event_loop.with_connector(connector);
        }
        if let Some(progress) = self.progress {
            event_loop = event_loop.with_progress(progress);
        }
        if let Some(status) = self.status {
            event_loop = event_loop.with_status(status);
        }

        let watcher = self.shutdown.map(|shutdown| {
            let events = event_loop.events();
            tokio::spawn(async move {
                shutdown.await;
                let _ = events.send(Event::Shutdown);
            })
        });

        let mut handler = ReceiverHandler {
            output_dir: self.request.output_dir,
            policy: self.request.policy,
            max_transfers: self.request.max_transfers,
            accepted: 0,
            report: ReceiveReport::default(),
        };

        let result = event_loop.run(&mut handler).await;

        if let Some(watcher) = watcher {
            watcher.abort();
        }

        result.map(|()| handler.report)
    }

    /// Run the receiver and reduce it to an exit status, reporting the tally
    /// on the status sink. Rejected offers do not count as failures.
    pub async fn receive(self) -> ExitStatus {
        let status = self.status.clone();
        match self.run().await {
            Ok(report) => {
                emit(
                    status.as_ref(),
                    &format!(
                        "received {} file(s), {} failed, {} rejected",
                        report.completed, report.failed, report.rejected
                    ),
                );
                if report.is_clean() {
                    ExitStatus::Success
                } else {
                    ExitStatus::Failure
                }
            }
            Err(e) => {
                emit(status.as_ref(), &format!("receive failed: {e}"));
                ExitStatus::Failure
            }
        }
    }
}

struct ReceiverHandler {
    output_dir: PathBuf,
    policy: Arc<dyn AcceptPolicy>,
    max_transfers: Option<usize>,
    accepted: usize,
    report: ReceiveReport,
}

impl EventHandler for ReceiverHandler {
    fn on_offer_received(
        &mut self,
        _core: &DriverCore,
        from: &str,
        sid: &SessionId,
        offer: &TransferOffer,
    ) -> Decision {
        if self.max_transfers.is_some_and(|max| self.accepted >= max) {
            return Decision::Reject(RejectReason::ShuttingDown);
        }

        let decision = self.policy.decide(from, offer);
        if decision == Decision::Accept {
            self.accepted += 1;
        }
        tracing::debug!(sid = %sid.short(), from = %from, decision = ?decision, "Policy decision");
        decision
    }

    fn on_transport_ready(&mut self, core: &DriverCore, sid: &SessionId) -> Flow {
        let Some(session) = core.session(sid) else {
            return Flow::Continue;
        };
        if session.role() != Role::Target {
            return Flow::Continue;
        }

        let job = ReceiveJob::for_session(&session, self.output_dir.clone(), core.config());
        if let Err(e) = core.start_transfer(sid, Job::Receive(job)) {
            tracing::warn!(sid = %sid.short(), error = %e, "Could not start receiving");
        }
        Flow::Continue
    }

    fn on_session_closed(&mut self, _core: &DriverCore, session: &Session) -> Flow {
        if session.role() != Role::Target {
            return Flow::Continue;
        }

        self.report.sessions.push(session.id().clone());
        if session.state() == NegotiationState::Rejected {
            self.report.rejected += 1;
            return Flow::Continue;
        }

        if session.succeeded() {
            self.report.completed += 1;
        } else {
            self.report.failed += 1;
        }

        match self.max_transfers {
            Some(max) if self.report.completed + self.report.failed >= max => Flow::Stop,
            _ => Flow::Continue,
        }
    }
}

/// Receive files until disconnected or interrupted, printing status lines
/// to stdout.
pub async fn receive_files(request: ReceiveRequest, signaling: Arc<dyn Signaling>) -> ExitStatus {
    FileReceiver::new(request, signaling)
        .with_status(stdout_status())
        .with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .receive()
        .await
}

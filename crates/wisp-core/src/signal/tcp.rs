//! Line-delimited JSON signaling over TCP.
//!
//! A small routing server ([`SignalServer`]) relays stanzas between logged-in
//! identities. Each line on the wire is one JSON [`Frame`]:
//!
//! ```text
//! Client                      Server                      Client
//!   |-- login {identity} ------->|                           |
//!   |<----------------- login_ok-|                           |
//!   |-- route {to, stanza} ----->|-- deliver {from, stanza}->|
//!   |<-- undeliverable {to, sid}-|   (recipient offline)     |
//!   |-- bye -------------------->|                           |
//! ```

use super::{Signaling, Stanza};
use crate::error::{Error, Result};
use crate::event::{Event, EventSender};
use crate::session::{SessionId, bare_identity};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Longest accepted frame line (1 MiB)
const MAX_FRAME_LEN: u64 = 1024 * 1024;

/// Time allowed for connect and login
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One line on the signaling wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    /// Client logs in
    Login {
        /// Full identity
        identity: String,
        /// Account password, if the server requires one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Login succeeded
    LoginOk,
    /// Login refused
    LoginFailed {
        /// Why
        reason: String,
    },
    /// Client asks the server to forward a stanza
    Route {
        /// Recipient identity
        to: String,
        /// Payload
        stanza: Stanza,
    },
    /// Server forwards a stanza
    Deliver {
        /// Sender identity
        from: String,
        /// Payload
        stanza: Stanza,
    },
    /// Server could not forward a stanza
    Undeliverable {
        /// Recipient identity
        to: String,
        /// Session of the lost stanza
        sid: SessionId,
        /// Why
        reason: String,
    },
    /// Orderly close
    Bye,
}

async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.take(MAX_FRAME_LEN).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && n as u64 >= MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "signaling frame too long",
        ));
    }

    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn signaling_error(context: impl std::fmt::Display) -> Error {
    Error::Signaling(Cow::Owned(context.to_string()))
}

/// Client side of the TCP signaling channel
pub struct TcpSignaling {
    server: String,
    identity: String,
    password: Option<String>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSignaling {
    /// Create a client for `identity` on the server at `server` (`host:port`)
    pub fn new(
        server: impl Into<String>,
        identity: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            server: server.into(),
            identity: identity.into(),
            password,
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn login(&self) -> Result<(BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf)> {
        let stream = TcpStream::connect(&self.server)
            .await
            .map_err(|e| signaling_error(format!("connect to {}: {e}", self.server)))?;
        stream.set_nodelay(true)?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_frame(
            &mut writer,
            &Frame::Login {
                identity: self.identity.clone(),
                password: self.password.clone(),
            },
        )
        .await?;

        match read_frame(&mut reader).await? {
            Some(Frame::LoginOk) => Ok((reader, writer)),
            Some(Frame::LoginFailed { reason }) => {
                Err(signaling_error(format!("login refused: {reason}")))
            }
            Some(other) => Err(signaling_error(format!("unexpected login reply {other:?}"))),
            None => Err(Error::Signaling(Cow::Borrowed("server closed during login"))),
        }
    }
}

#[async_trait]
impl Signaling for TcpSignaling {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn connect(&self, events: EventSender) -> Result<()> {
        let (mut reader, mut writer) = tokio::time::timeout(LOGIN_TIMEOUT, self.login())
            .await
            .map_err(|_| Error::Signaling(Cow::Borrowed("login timed out")))??;

        tracing::info!(server = %self.server, identity = %self.identity, "Signaling connected");
        let _ = events.send(Event::Connected);

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bye = frame == Frame::Bye;
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %e, "Signaling write failed");
                    break;
                }
                if bye {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_events = events.clone();
        let reader_task = tokio::spawn(async move {
            let reason = loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Deliver { from, stanza })) => {
                        let _ = reader_events.send(Event::Stanza { from, stanza });
                    }
                    Ok(Some(Frame::Undeliverable { to, sid, reason })) => {
                        // The peer is gone; surface it as an abort from the peer
                        let _ = reader_events.send(Event::Stanza {
                            from: to,
                            stanza: Stanza::Abort { sid, reason },
                        });
                    }
                    Ok(Some(Frame::Bye)) => break Some("server closed the session".to_string()),
                    Ok(Some(other)) => {
                        tracing::debug!(frame = ?other, "Ignoring unexpected signaling frame");
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                }
            };
            let _ = reader_events.send(Event::Disconnected(reason));
        });

        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([writer_task, reader_task]);

        Ok(())
    }

    fn send(&self, to: &str, stanza: Stanza) -> Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::Signaling(Cow::Borrowed("not connected")));
        };

        tracing::trace!(to = %to, stanza = stanza.name(), sid = %stanza.sid().short(), "Sending stanza");

        tx.send(Frame::Route {
            to: to.to_string(),
            stanza,
        })
        .map_err(|_| Error::Signaling(Cow::Borrowed("signaling connection closed")))
    }

    async fn disconnect(&self) {
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        // Writer first, then reader, so no Disconnected is posted for an
        // orderly close
        let mut tasks = tasks.into_iter();
        let writer = tasks.next();
        for reader in tasks {
            reader.abort();
        }

        if let Some(tx) = outbound {
            let _ = tx.send(Frame::Bye);
        }
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
        }

        tracing::debug!(identity = %self.identity, "Signaling disconnected");
    }
}

/// Routing server for [`TcpSignaling`] clients.
///
/// `accounts` maps bare identities to passwords; an empty map lets anyone
/// log in.
pub struct SignalServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    accounts: Arc<HashMap<String, String>>,
    routes: Arc<DashMap<String, mpsc::UnboundedSender<Frame>>>,
}

impl SignalServer {
    /// Bind the server
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the address cannot be bound
    pub async fn bind(addr: SocketAddr, accounts: HashMap<String, String>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!(addr = %local_addr, accounts = accounts.len(), "Signal server listening");

        Ok(Self {
            listener,
            local_addr,
            accounts: Arc::new(accounts),
            routes: Arc::new(DashMap::new()),
        })
    }

    /// Address the server is listening on
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of logged-in clients
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.routes.len()
    }

    /// Accept clients until the task is cancelled
    ///
    /// # Errors
    ///
    /// Only returns on a fatal listener error
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Signal server accept failed");
                    continue;
                }
            };

            let accounts = Arc::clone(&self.accounts);
            let routes = Arc::clone(&self.routes);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_client(stream, accounts, routes).await {
                    tracing::debug!(peer = %peer, error = %e, "Signaling client ended with error");
                }
            });
        }
    }

    async fn handle_client(
        stream: TcpStream,
        accounts: Arc<HashMap<String, String>>,
        routes: Arc<DashMap<String, mpsc::UnboundedSender<Frame>>>,
    ) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let login = tokio::time::timeout(LOGIN_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "login timed out"))??;

        let Some(Frame::Login { identity, password }) = login else {
            return Ok(());
        };

        if !accounts.is_empty() {
            let expected = accounts.get(bare_identity(&identity));
            if expected.is_none() || expected != password.as_ref() {
                tracing::info!(identity = %identity, "Signaling login refused");
                write_frame(
                    &mut writer,
                    &Frame::LoginFailed {
                        reason: "bad credentials".to_string(),
                    },
                )
                .await?;
                return Ok(());
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let registered = match routes.entry(identity.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx.clone());
                true
            }
        };
        if !registered {
            write_frame(
                &mut writer,
                &Frame::LoginFailed {
                    reason: "identity already connected".to_string(),
                },
            )
            .await?;
            return Ok(());
        }

        tracing::info!(identity = %identity, "Signaling client logged in");

        let writer_task = tokio::spawn(async move {
            let _ = write_frame(&mut writer, &Frame::LoginOk).await;
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::debug!(error = %e, "Signaling delivery failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let result = loop {
            match read_frame(&mut reader).await {
                Ok(Some(Frame::Route { to, stanza })) => {
                    tracing::debug!(from = %identity, to = %to, stanza = stanza.name(), "Routing stanza");
                    let delivered = routes.get(&to).is_some_and(|peer| {
                        peer.send(Frame::Deliver {
                            from: identity.clone(),
                            stanza: stanza.clone(),
                        })
                        .is_ok()
                    });
                    if !delivered {
                        let _ = tx.send(Frame::Undeliverable {
                            to,
                            sid: stanza.sid().clone(),
                            reason: "recipient unavailable".to_string(),
                        });
                    }
                }
                Ok(Some(Frame::Bye) | None) => break Ok(()),
                Ok(Some(other)) => {
                    tracing::debug!(identity = %identity, frame = ?other, "Ignoring client frame");
                }
                Err(e) => break Err(e),
            }
        };

        routes.remove_if(&identity, |_, route| route.same_channel(&tx));
        drop(tx);
        let _ = writer_task.await;

        tracing::info!(identity = %identity, "Signaling client left");
        result
    }
}

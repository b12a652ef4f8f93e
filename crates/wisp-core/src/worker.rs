//! Transfer workers.
//!
//! A worker moves the file bytes over an established bytestream:
//! - **Send**: read the source in `chunk_size` chunks in file order, `send()`
//!   each, stop on the first failure or at EOF, then close the channel.
//! - **Receive**: `receive()` until the channel closes, appending each chunk
//!   to the destination file in arrival order.
//!
//! Partial files are kept on failure. Nothing is retried.

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::offer::{FileRange, safe_file_name};
use crate::session::{Session, SessionId};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use wisp_transport::{Received, SharedBytestream};

/// Highest numeric suffix tried when the destination name is taken
const MAX_NAME_SUFFIX: u32 = 1000;

/// Progress of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Session id
    pub sid: SessionId,
    /// Bytes moved so far
    pub bytes: u64,
    /// Bytes expected in total
    pub total: u64,
}

/// Sending half of a progress channel
pub type ProgressSender = mpsc::UnboundedSender<TransferProgress>;

/// Send a file
#[derive(Debug, Clone)]
pub struct SendJob {
    /// Session id
    pub sid: SessionId,
    /// Source file
    pub path: PathBuf,
    /// Part of the file to send
    pub range: Option<FileRange>,
    /// Bytes expected in total
    pub total: u64,
    /// Read size per chunk
    pub chunk_size: usize,
}

/// Receive a file
#[derive(Debug, Clone)]
pub struct ReceiveJob {
    /// Session id
    pub sid: SessionId,
    /// Directory to store the file in
    pub output_dir: PathBuf,
    /// File name from the offer
    pub file_name: String,
    /// Bytes announced by the offer
    pub expected_size: u64,
    /// BLAKE3 digest to verify against, when the whole file is sent
    pub verify_hash: Option<String>,
    /// Timeout for a single `receive()`
    pub receive_timeout: Duration,
    /// Give up after this long without data
    pub idle_timeout: Duration,
}

impl SendJob {
    /// Job sending `path` for an initiator session
    #[must_use]
    pub fn for_session(session: &Session, path: PathBuf, config: &TransferConfig) -> Self {
        Self {
            sid: session.id().clone(),
            path,
            range: session.offer().range,
            total: session.offer().expected_bytes(),
            chunk_size: config.chunk_size,
        }
    }
}

impl ReceiveJob {
    /// Job storing a target session's file in `output_dir`
    #[must_use]
    pub fn for_session(session: &Session, output_dir: PathBuf, config: &TransferConfig) -> Self {
        let offer = session.offer();
        Self {
            sid: session.id().clone(),
            output_dir,
            file_name: offer.file_name.clone(),
            expected_size: offer.expected_bytes(),
            verify_hash: offer
                .is_verifiable()
                .then(|| offer.content_hash.clone())
                .flatten(),
            receive_timeout: config.receive_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Work for one transfer task
#[derive(Debug, Clone)]
pub enum Job {
    /// Send a file
    Send(SendJob),
    /// Receive a file
    Receive(ReceiveJob),
}

impl Job {
    /// Session the job belongs to
    #[must_use]
    pub fn sid(&self) -> &SessionId {
        match self {
            Job::Send(job) => &job.sid,
            Job::Receive(job) => &job.sid,
        }
    }
}

/// Result of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Session id
    pub sid: SessionId,
    /// Bytes moved
    pub bytes: u64,
    /// Source or destination file
    pub path: PathBuf,
}

/// Run a job to completion over `transport`.
///
/// The transport is closed when the job ends, whatever the outcome.
///
/// # Errors
///
/// Returns the first transport, file, or integrity error
pub async fn run_job(
    job: Job,
    transport: SharedBytestream,
    progress: Option<ProgressSender>,
) -> Result<TransferSummary> {
    let result = match job {
        Job::Send(job) => send_file(job, &transport, progress.as_ref()).await,
        Job::Receive(job) => receive_file(job, &transport, progress.as_ref()).await,
    };

    if let Err(e) = transport.close().await {
        tracing::debug!(error = %e, "Closing bytestream after transfer failed");
    }

    result
}

async fn send_file(
    job: SendJob,
    transport: &SharedBytestream,
    progress: Option<&ProgressSender>,
) -> Result<TransferSummary> {
    let mut file = File::open(&job.path).await?;

    let mut remaining = match job.range {
        Some(range) => {
            file.seek(std::io::SeekFrom::Start(range.offset)).await?;
            range.length
        }
        None => None,
    };

    let mut buf = vec![0u8; job.chunk_size.max(1)];
    let mut sent: u64 = 0;

    loop {
        let want = match remaining {
            Some(0) => break,
            Some(left) => buf.len().min(usize::try_from(left).unwrap_or(usize::MAX)),
            None => buf.len(),
        };

        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }

        transport.send(&buf[..n]).await?;
        sent += n as u64;
        if let Some(left) = remaining.as_mut() {
            *left -= n as u64;
        }

        report(progress, &job.sid, sent, job.total);
    }

    tracing::info!(sid = %job.sid.short(), bytes = sent, "File sent");

    Ok(TransferSummary {
        sid: job.sid,
        bytes: sent,
        path: job.path,
    })
}

async fn receive_file(
    job: ReceiveJob,
    transport: &SharedBytestream,
    progress: Option<&ProgressSender>,
) -> Result<TransferSummary> {
    let name = safe_file_name(&job.file_name)
        .ok_or_else(|| Error::offer_invalid("unsafe file name"))?;
    let (path, mut file) = create_unique(&job.output_dir, &name).await?;

    tracing::debug!(sid = %job.sid.short(), path = %path.display(), "Receiving file");

    let mut hasher = job.verify_hash.as_ref().map(|_| blake3::Hasher::new());
    let mut received: u64 = 0;
    let mut last_data = Instant::now();

    loop {
        match transport.receive(job.receive_timeout).await? {
            Received::Data(chunk) => {
                let room = job.expected_size - received;
                if chunk.len() as u64 > room {
                    // Never store more than the offer announced
                    let keep = usize::try_from(room).unwrap_or(chunk.len());
                    file.write_all(&chunk[..keep]).await?;
                    file.flush().await?;
                    tracing::warn!(
                        sid = %job.sid.short(),
                        expected = job.expected_size,
                        "Peer sent more bytes than offered"
                    );
                    return Err(Error::Integrity(Cow::Owned(format!(
                        "overrun: peer sent more than the {} bytes offered",
                        job.expected_size
                    ))));
                }

                file.write_all(&chunk).await?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                received += chunk.len() as u64;
                last_data = Instant::now();
                report(progress, &job.sid, received, job.expected_size);
            }
            Received::Timeout => {
                if last_data.elapsed() >= job.idle_timeout {
                    file.flush().await?;
                    return Err(Error::Transport(Cow::Owned(format!(
                        "no data for {}s",
                        job.idle_timeout.as_secs()
                    ))));
                }
            }
            Received::Closed => break,
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    if received < job.expected_size {
        return Err(Error::Integrity(Cow::Owned(format!(
            "truncated: received {received} of {} bytes",
            job.expected_size
        ))));
    }
    if let (Some(hasher), Some(expected)) = (hasher, job.verify_hash.as_deref()) {
        let actual = hasher.finalize().to_hex();
        if !actual.as_str().eq_ignore_ascii_case(expected) {
            return Err(Error::integrity("content hash mismatch"));
        }
    }

    tracing::info!(
        sid = %job.sid.short(),
        bytes = received,
        path = %path.display(),
        "File received"
    );

    Ok(TransferSummary {
        sid: job.sid,
        bytes: received,
        path,
    })
}

fn report(progress: Option<&ProgressSender>, sid: &SessionId, bytes: u64, total: u64) {
    if let Some(tx) = progress {
        let _ = tx.send(TransferProgress {
            sid: sid.clone(),
            bytes,
            total,
        });
    }
}

/// Create `dir/name`, or `dir/stem-N.ext` if the name is taken.
async fn create_unique(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    let candidate = Path::new(name);
    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string();
    let extension = candidate.extension().and_then(|e| e.to_str());

    for suffix in 0..=MAX_NAME_SUFFIX {
        let file_name = match (suffix, extension) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{stem}-{n}.{ext}"),
            (n, None) => format!("{stem}-{n}"),
        };
        let path = dir.join(file_name);

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::Io(format!(
        "no free file name for {name} in {}",
        dir.display()
    )))
}

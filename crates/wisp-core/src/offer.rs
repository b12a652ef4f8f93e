//! File offers.
//!
//! An offer describes the single file a sender proposes to transfer. It is
//! built before negotiation starts and is not modified once sent.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::Read;
use std::path::{Component, Path};

/// Read buffer for hashing files (64 KiB)
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Bytestream transport types a peer may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// SOCKS5 bytestreams (direct, local relay, or proxy)
    Socks5Bytestreams,
    /// Data carried inside signaling messages
    InBandBytestreams,
    /// Out-of-band URL
    OutOfBand,
}

impl TransportType {
    /// Whether this implementation can carry a transfer over the type
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, TransportType::Socks5Bytestreams)
    }
}

/// Part of a file to transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRange {
    /// First byte to send
    pub offset: u64,
    /// Bytes to send from `offset`; `None` means to end of file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

/// A proposed single-file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    /// Identity of the sending peer
    pub sender: String,
    /// Identity of the receiving peer
    pub receiver: String,
    /// File name (final path component only)
    pub file_name: String,
    /// Full file size in bytes
    pub file_size: u64,
    /// Lowercase hex BLAKE3 digest of the full file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Last modification time, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Requested part of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<FileRange>,
    /// Transport types the sender supports, in preference order
    pub supported_transports: Vec<TransportType>,
}

impl TransferOffer {
    /// Create an offer supporting SOCKS5 bytestreams
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            file_name: file_name.into(),
            file_size,
            content_hash: None,
            mime_type: None,
            description: None,
            date: None,
            range: None,
            supported_transports: vec![TransportType::Socks5Bytestreams],
        }
    }

    /// Build an offer for a file on disk.
    ///
    /// Reads the file size and modification time and, when `compute_hash`
    /// is set, hashes the whole file on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read, or
    /// `Error::OfferInvalid` if it is not a regular file.
    pub async fn for_file(
        path: &Path,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        compute_hash: bool,
    ) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::offer_invalid("not a regular file"));
        }

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::offer_invalid("file name is not valid UTF-8"))?;

        let mut offer = Self::new(sender, receiver, file_name, metadata.len());

        if let Ok(modified) = metadata.modified() {
            offer.date = Some(DateTime::<Utc>::from(modified).to_rfc3339());
        }

        if compute_hash {
            let owned = path.to_path_buf();
            let hash = tokio::task::spawn_blocking(move || hash_file(&owned))
                .await
                .map_err(|e| Error::Internal(Cow::Owned(e.to_string())))??;
            offer.content_hash = Some(hash);
        }

        Ok(offer)
    }

    /// Set the content hash
    #[must_use]
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Set the MIME type
    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Request only part of the file
    #[must_use]
    pub fn with_range(mut self, range: FileRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Replace the supported transport types
    #[must_use]
    pub fn with_transports(mut self, transports: Vec<TransportType>) -> Self {
        self.supported_transports = transports;
        self
    }

    /// Whether SOCKS5 bytestreams are among the supported transports
    #[must_use]
    pub fn supports_socks5(&self) -> bool {
        self.supported_transports
            .iter()
            .any(|transport| transport.is_supported())
    }

    /// Number of bytes the data phase will carry
    #[must_use]
    pub fn expected_bytes(&self) -> u64 {
        match self.range {
            None => self.file_size,
            Some(range) => {
                let remaining = self.file_size.saturating_sub(range.offset);
                range.length.map_or(remaining, |length| length.min(remaining))
            }
        }
    }

    /// Whether the receiver can verify `content_hash` (whole file sent)
    #[must_use]
    pub fn is_verifiable(&self) -> bool {
        self.content_hash.is_some() && self.expected_bytes() == self.file_size
    }

    /// Check the offer for structural problems.
    ///
    /// # Errors
    ///
    /// Returns `Error::OfferInvalid` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.supported_transports.is_empty() {
            return Err(Error::offer_invalid("no supported transport types"));
        }
        if safe_file_name(&self.file_name).is_none() {
            return Err(Error::OfferInvalid(Cow::Owned(format!(
                "unsafe file name {:?}",
                self.file_name
            ))));
        }
        if let Some(range) = self.range {
            if range.offset > self.file_size {
                return Err(Error::offer_invalid("range offset beyond end of file"));
            }
        }
        if let Some(hash) = &self.content_hash {
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(Error::offer_invalid("content hash is not a BLAKE3 hex digest"));
            }
        }
        Ok(())
    }
}

/// Reduce a peer-supplied file name to a safe final path component.
///
/// Returns `None` for empty names, absolute paths, and names containing
/// parent traversal. Both `/` and `\` are treated as separators.
#[must_use]
pub fn safe_file_name(name: &str) -> Option<String> {
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return None;
    }

    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized);
    let mut last = None;
    for component in path.components() {
        match component {
            Component::Normal(part) => last = part.to_str(),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    last.filter(|part| !part.contains(':'))
        .map(str::to_string)
}

/// BLAKE3 digest of a file, lowercase hex.
///
/// # Errors
///
/// Returns `Error::Io` if the file cannot be read
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("a.txt"), Some("a.txt".to_string()));
        assert_eq!(safe_file_name("dir/sub/a.txt"), Some("a.txt".to_string()));
        assert_eq!(safe_file_name("dir\\a.txt"), Some("a.txt".to_string()));
        assert_eq!(safe_file_name("./a.txt"), Some("a.txt".to_string()));
        assert_eq!(safe_file_name(""), None);
        assert_eq!(safe_file_name("/etc/passwd"), None);
        assert_eq!(safe_file_name("\\windows\\x"), None);
        assert_eq!(safe_file_name("../a.txt"), None);
        assert_eq!(safe_file_name("dir/../../a.txt"), None);
        assert_eq!(safe_file_name("."), None);
        assert_eq!(safe_file_name("C:evil"), None);
    }

    #[test]
    fn test_expected_bytes_with_range() {
        let offer = TransferOffer::new("a", "b", "f", 100);
        assert_eq!(offer.expected_bytes(), 100);

        let ranged = offer.clone().with_range(FileRange {
            offset: 10,
            length: Some(20),
        });
        assert_eq!(ranged.expected_bytes(), 20);

        let to_end = offer.clone().with_range(FileRange {
            offset: 90,
            length: None,
        });
        assert_eq!(to_end.expected_bytes(), 10);

        let overlong = offer.with_range(FileRange {
            offset: 90,
            length: Some(50),
        });
        assert_eq!(overlong.expected_bytes(), 10);
    }

    #[test]
    fn test_validate() {
        let offer = TransferOffer::new("a", "b", "f.bin", 10);
        assert!(offer.validate().is_ok());
        assert!(offer.supports_socks5());

        let no_transports = offer.clone().with_transports(Vec::new());
        assert!(no_transports.validate().is_err());

        let ibb_only = offer
            .clone()
            .with_transports(vec![TransportType::InBandBytestreams]);
        assert!(ibb_only.validate().is_ok());
        assert!(!ibb_only.supports_socks5());

        let bad_name = TransferOffer::new("a", "b", "../f.bin", 10);
        assert!(bad_name.validate().is_err());

        let bad_range = offer.clone().with_range(FileRange {
            offset: 11,
            length: None,
        });
        assert!(bad_range.validate().is_err());

        let bad_hash = offer.with_hash("abc");
        assert!(bad_hash.validate().is_err());
    }

    #[test]
    fn test_offer_wire_format() {
        let offer = TransferOffer::new("alice@example.org/a", "bob@example.org/b", "a.txt", 5)
            .with_description("greeting");
        let json = serde_json::to_value(&offer).unwrap();

        assert_eq!(json["file_name"], "a.txt");
        assert_eq!(json["supported_transports"][0], "socks5_bytestreams");
        assert!(json.get("content_hash").is_none());

        let back: TransferOffer = serde_json::from_value(json).unwrap();
        assert_eq!(back, offer);
    }

    #[tokio::test]
    async fn test_for_file_hashes_content() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();

        let offer = TransferOffer::for_file(file.path(), "alice", "bob", true)
            .await
            .unwrap();

        assert_eq!(offer.file_size, 5);
        assert_eq!(
            offer.content_hash.as_deref(),
            Some(blake3::hash(b"hello").to_hex().as_str())
        );
        assert!(offer.date.is_some());
        assert!(offer.validate().is_ok());
        assert!(offer.is_verifiable());
    }

    #[tokio::test]
    async fn test_for_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = TransferOffer::for_file(&dir.path().join("missing"), "a", "b", false).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_for_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = TransferOffer::for_file(dir.path(), "a", "b", false).await;
        assert!(matches!(result, Err(Error::OfferInvalid(_))));
    }
}

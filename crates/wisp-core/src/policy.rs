//! Accept/reject decisions for incoming offers.

use crate::offer::TransferOffer;
use crate::session::bare_identity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an offer was rejected. Carried on the wire in `Reject` stanzas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The receiver declined
    Declined,
    /// None of the offered transport types is supported
    UnsupportedTransport,
    /// The offer was malformed (bad file name, no candidates)
    BadRequest,
    /// The file exceeds the receiver's size limit
    TooLarge,
    /// The sender is not allowed to send to this receiver
    Forbidden,
    /// The receiver is shutting down
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::Declined => "declined",
            RejectReason::UnsupportedTransport => "unsupported transport",
            RejectReason::BadRequest => "bad request",
            RejectReason::TooLarge => "file too large",
            RejectReason::Forbidden => "sender not allowed",
            RejectReason::ShuttingDown => "receiver shutting down",
        };
        f.write_str(text)
    }
}

/// Outcome of an accept policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Accept the offer
    Accept,
    /// Reject the offer
    Reject(RejectReason),
}

/// Decides whether to accept an offer.
pub trait AcceptPolicy: Send + Sync {
    /// Decide on an offer from `from`
    fn decide(&self, from: &str, offer: &TransferOffer) -> Decision;
}

/// Accepts every offer
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
    fn decide(&self, _from: &str, _offer: &TransferOffer) -> Decision {
        Decision::Accept
    }
}

/// Rejects every offer
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl AcceptPolicy for RejectAll {
    fn decide(&self, _from: &str, _offer: &TransferOffer) -> Decision {
        Decision::Reject(RejectReason::Declined)
    }
}

/// Size and sender limits
///
/// An empty `allowed_senders` list allows everyone. Entries are compared
/// against the sender's bare identity (resource stripped).
#[derive(Debug, Clone, Default)]
pub struct LimitsPolicy {
    /// Largest acceptable file in bytes
    pub max_file_size: Option<u64>,
    /// Bare identities allowed to send
    pub allowed_senders: Vec<String>,
}

impl AcceptPolicy for LimitsPolicy {
    fn decide(&self, from: &str, offer: &TransferOffer) -> Decision {
        if !self.allowed_senders.is_empty() {
            let sender = bare_identity(from);
            if !self.allowed_senders.iter().any(|allowed| allowed == sender) {
                return Decision::Reject(RejectReason::Forbidden);
            }
        }

        if let Some(max) = self.max_file_size {
            if offer.expected_bytes() > max {
                return Decision::Reject(RejectReason::TooLarge);
            }
        }

        Decision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(size: u64) -> TransferOffer {
        TransferOffer::new("alice@example.org/a", "bob@example.org/b", "a.txt", size)
    }

    #[test]
    fn test_accept_all_and_reject_all() {
        assert_eq!(AcceptAll.decide("x", &offer(1)), Decision::Accept);
        assert_eq!(
            RejectAll.decide("x", &offer(1)),
            Decision::Reject(RejectReason::Declined)
        );
    }

    #[test]
    fn test_limits_size() {
        let policy = LimitsPolicy {
            max_file_size: Some(100),
            allowed_senders: Vec::new(),
        };
        assert_eq!(policy.decide("alice@example.org/a", &offer(100)), Decision::Accept);
        assert_eq!(
            policy.decide("alice@example.org/a", &offer(101)),
            Decision::Reject(RejectReason::TooLarge)
        );
    }

    #[test]
    fn test_limits_senders() {
        let policy = LimitsPolicy {
            max_file_size: None,
            allowed_senders: vec!["alice@example.org".to_string()],
        };
        assert_eq!(policy.decide("alice@example.org/laptop", &offer(1)), Decision::Accept);
        assert_eq!(
            policy.decide("mallory@example.org/x", &offer(1)),
            Decision::Reject(RejectReason::Forbidden)
        );
    }

    #[test]
    fn test_reject_reason_wire_format() {
        let json = serde_json::to_string(&RejectReason::UnsupportedTransport).unwrap();
        assert_eq!(json, "\"unsupported_transport\"");
    }
}

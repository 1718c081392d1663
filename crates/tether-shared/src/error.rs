use thiserror::Error;

/// Identifier parsing failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid JID: {0:?}")]
    InvalidJid(String),

    #[error("Invalid phone number: {0:?}")]
    InvalidPhone(String),

    #[error("Empty message id")]
    EmptyMessageId,

    #[error("Unknown chat kind: {0:?}")]
    UnknownChatKind(String),

    #[error("Unknown content kind: {0:?}")]
    UnknownContentKind(String),

    #[error("Unknown receipt status: {0:?}")]
    UnknownReceiptStatus(String),
}

/// Failures reported by the remote protocol client.
///
/// The variants separate permanent refusals (which propagate to the caller
/// unchanged) from transient conditions (which are retried with backoff).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Stored credentials were refused; the device must be paired again.
    #[error("Credentials rejected: {0}")]
    Unauthorized(String),

    /// A time-limited remote object (media locator) has expired.
    #[error("Remote object expired: {0}")]
    Expired(String),

    /// The remote side refused the action (blocked contact, oversized media, ...).
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No live connection to the remote service.
    #[error("Transport unavailable")]
    Unavailable,

    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unavailable | TransportError::Network(_))
    }
}

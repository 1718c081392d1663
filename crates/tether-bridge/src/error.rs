use thiserror::Error;

use tether_shared::{ParseError, TransportError};
use tether_store::StoreError;

/// Session lifecycle failures.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Nobody confirmed the pairing token in time.
    #[error("Pairing timed out")]
    PairingTimeout,

    /// The transport dropped the pairing request before it was confirmed.
    #[error("Pairing aborted by the protocol client")]
    PairingAborted,

    /// The remote side refused the stored credentials; pair again.
    #[error("Credentials expired, re-pairing required")]
    CredentialsExpired,

    /// No credentials are stored yet.
    #[error("Device is not paired")]
    NotPaired,

    /// No active connection.
    #[error("Not connected")]
    Disconnected,

    /// Reconnection gave up; operator attention needed.
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Ingestion failures. Malformed events are skipped, storage failures retried.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Storage error after {attempts} attempts: {source}")]
    Storage {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The chat worker is gone (shutdown in progress).
    #[error("Ingestion worker closed")]
    Closed,
}

impl From<ParseError> for IngestError {
    fn from(e: ParseError) -> Self {
        IngestError::Malformed(e.to_string())
    }
}

/// Media resolution failures. None of these leaves a file behind.
#[derive(Error, Debug)]
pub enum MediaError {
    /// The remote locator expired or the object is gone.
    #[error("Media unavailable: {0}")]
    Unavailable(String),

    /// Downloaded bytes did not match the advertised size or hash.
    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// The message carries no media.
    #[error("Message has no media")]
    NoMedia,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Media fetch timed out")]
    TimedOut,

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for MediaError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Expired(reason) | TransportError::NotFound(reason) => {
                MediaError::Unavailable(reason)
            }
            other => MediaError::Transport(other),
        }
    }
}

/// Outbound command failures, reported synchronously to the caller.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// No active session; nothing was sent or written.
    #[error("Bridge unavailable: no active session")]
    BridgeUnavailable,

    #[error("Send rejected: {0}")]
    Rejected(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedAudioFormat(String),

    #[error("File error: {0}")]
    File(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    /// The remote side accepted the send but the local write failed.
    #[error("Sent, but recording it locally failed: {0}")]
    Record(#[from] IngestError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Rejected(reason) => SendError::Rejected(reason),
            TransportError::Unavailable | TransportError::Unauthorized(_) => {
                SendError::BridgeUnavailable
            }
            other => SendError::Transport(other),
        }
    }
}

/// Top-level error for the bridge and its supervisor.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<ParseError> for BridgeError {
    fn from(e: ParseError) -> Self {
        BridgeError::InvalidArgument(e.to_string())
    }
}

/// External audio conversion failures.
#[derive(Error, Debug)]
pub enum TranscodeError {
    /// No transcoder binary could be started.
    #[error("Transcoder unavailable: {0}")]
    Unavailable(String),

    #[error("Transcoding failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

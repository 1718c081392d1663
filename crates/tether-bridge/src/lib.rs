//! # tether-bridge
//!
//! The synchronization bridge between the remote protocol client and the
//! local store:
//!
//! - [`session`]: pairing, connecting and reconnecting the linked device
//! - [`ingest`]: per-chat ordered, idempotent ingestion of protocol events
//! - [`media`]: content-addressed media cache with coalesced fetches
//! - [`gateway`]: outbound sends and media downloads
//! - [`query`]: read-only queries for the local consumer
//! - [`bridge`]: the supervisor wiring it all to one [`Transport`]

pub mod backoff;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod media;
pub mod query;
pub mod session;
pub mod transcode;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use bridge::Bridge;
pub use clock::{Clock, SystemClock};
pub use config::BridgeConfig;
pub use error::{BridgeError, IngestError, MediaError, SendError, SessionError, TranscodeError};
pub use gateway::{CommandGateway, SendOutcome};
pub use ingest::{IngestStats, Ingestor};
pub use media::MediaStore;
pub use query::QueryService;
pub use session::{ConnectionHandle, SessionManager, SessionState};
pub use transcode::{FfmpegTranscoder, Transcoder};
pub use transport::{EventStream, Link, PairingRequest, Transport};

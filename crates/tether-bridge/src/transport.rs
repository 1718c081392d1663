//! The seam to the remote protocol client.
//!
//! Tether never speaks the wire protocol itself. An embedder supplies a
//! [`Transport`] that performs pairing, keeps the encrypted link and turns
//! inbound traffic into [`ProtocolEvent`]s; everything above this trait is
//! protocol-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use tether_shared::protocol::{Credentials, MediaLocator, OutboundMessage, ProtocolEvent, SendReceipt};
use tether_shared::{ChatJid, TransportError};
use tether_store::SyncCursor;

/// Inbound events of one established link. The stream ends when the link
/// drops.
pub type EventStream = mpsc::Receiver<ProtocolEvent>;

/// A pending pairing: the token to show the user and the confirmation that
/// resolves once the primary device has scanned it.
#[derive(Debug)]
pub struct PairingRequest {
    pub token: String,
    pub confirmation: oneshot::Receiver<Credentials>,
}

/// An established connection.
#[derive(Debug)]
pub struct Link {
    /// The linked account, as the remote side sees it.
    pub own_jid: ChatJid,
    pub events: EventStream,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start linking a new device.
    async fn request_pairing(&self) -> Result<PairingRequest, TransportError>;

    /// Open a link with stored credentials. `Unauthorized` means they were
    /// revoked.
    async fn connect(&self, credentials: &Credentials) -> Result<Link, TransportError>;

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt, TransportError>;

    /// Download and decrypt a media object. `Expired` / `NotFound` mean the
    /// locator is no longer usable.
    async fn fetch_media(&self, locator: &MediaLocator) -> Result<Bytes, TransportError>;

    /// Ask the remote side to resume history backfill after the given
    /// committed cursors.
    async fn request_backfill(&self, cursors: &[SyncCursor]) -> Result<(), TransportError>;

    /// Unlink this device remotely.
    async fn logout(&self) -> Result<(), TransportError>;
}

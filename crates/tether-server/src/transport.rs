//! Stand-in transport used when no protocol client is attached.
//!
//! The local store stays fully queryable; pairing, sends and media fetches
//! report the bridge as unavailable.

use async_trait::async_trait;
use bytes::Bytes;

use tether_bridge::{Link, PairingRequest, Transport};
use tether_shared::protocol::{Credentials, MediaLocator, OutboundMessage, SendReceipt};
use tether_shared::TransportError;
use tether_store::SyncCursor;

#[derive(Debug, Default)]
pub struct DetachedTransport;

#[async_trait]
impl Transport for DetachedTransport {
    async fn request_pairing(&self) -> Result<PairingRequest, TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<Link, TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn send(&self, _message: OutboundMessage) -> Result<SendReceipt, TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn fetch_media(&self, _locator: &MediaLocator) -> Result<Bytes, TransportError> {
        Err(TransportError::Unavailable)
    }

    async fn request_backfill(&self, _cursors: &[SyncCursor]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

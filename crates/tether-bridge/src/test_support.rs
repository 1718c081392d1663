//! A scripted in-memory [`Transport`] for tests.
//!
//! Plays the remote protocol client: pairing is confirmed by hand, connect
//! and send outcomes can be queued up front, and every interaction is
//! counted so tests can assert on what reached the "remote" side.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use tether_shared::protocol::{
    Credentials, MediaLocator, OutboundMessage, ProtocolEvent, SendReceipt,
};
use tether_shared::{ChatJid, MessageId, TransportError};
use tether_store::{Database, SyncCursor};

use crate::backoff::BackoffConfig;
use crate::clock::ManualClock;
use crate::session::SessionManager;
use crate::transport::{Link, PairingRequest, Transport};

pub const OWN_JID: &str = "31699999999@s.whatsapp.net";

pub fn own_jid() -> ChatJid {
    ChatJid::parse(OWN_JID).expect("valid jid")
}

pub fn test_credentials() -> Credentials {
    Credentials {
        jid: own_jid(),
        device_id: 7,
        secret: serde_json::json!({ "noise": "secret" }),
    }
}

/// A session manager over `transport` that is already paired and active.
pub async fn active_session(db: &Database, transport: &Arc<ScriptedTransport>) -> Arc<SessionManager> {
    db.write_batch(|b| b.save_session(&test_credentials(), 0))
        .expect("save session");
    let session = SessionManager::new(
        db.clone(),
        transport.clone(),
        Arc::new(ManualClock::new(0)),
        Duration::from_secs(120),
        BackoffConfig::default(),
    )
    .expect("session manager");
    session.connect().await.expect("connect");
    Arc::new(session)
}

#[derive(Default)]
pub struct ScriptedTransport {
    pairing: Mutex<Option<oneshot::Sender<Credentials>>>,
    pairing_requests: AtomicUsize,
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    connects: AtomicUsize,
    events: Mutex<Option<mpsc::Sender<ProtocolEvent>>>,
    send_script: Mutex<VecDeque<TransportError>>,
    send_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<OutboundMessage>>,
    next_id: AtomicU64,
    media: Mutex<HashMap<String, Result<Bytes, TransportError>>>,
    fetch_delay: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    backfills: Mutex<Vec<Vec<SyncCursor>>>,
    logouts: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm the outstanding pairing request as if the token was scanned.
    pub fn confirm_pairing(&self, credentials: Credentials) -> bool {
        match self.pairing.lock().unwrap().take() {
            Some(tx) => tx.send(credentials).is_ok(),
            None => false,
        }
    }

    pub fn pairing_requests(&self) -> usize {
        self.pairing_requests.load(Ordering::SeqCst)
    }

    /// Queue the outcome of the next `connect` calls; unqueued calls succeed.
    pub fn script_connect(&self, outcomes: impl IntoIterator<Item = Result<(), TransportError>>) {
        self.connect_script.lock().unwrap().extend(outcomes);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push an event into the current link.
    pub async fn emit(&self, event: ProtocolEvent) -> bool {
        let tx = self.events.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// End the current link's event stream.
    pub fn drop_link(&self) {
        self.events.lock().unwrap().take();
    }

    /// Make the next send fail with `error`.
    pub fn fail_next_send(&self, error: TransportError) {
        self.send_script.lock().unwrap().push_back(error);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Serve `data` (or an error) for locators with this direct path.
    pub fn put_media(&self, direct_path: &str, outcome: Result<Bytes, TransportError>) {
        self.media.lock().unwrap().insert(direct_path.to_string(), outcome);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn backfills(&self) -> Vec<Vec<SyncCursor>> {
        self.backfills.lock().unwrap().clone()
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request_pairing(&self) -> Result<PairingRequest, TransportError> {
        let n = self.pairing_requests.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        *self.pairing.lock().unwrap() = Some(tx);
        Ok(PairingRequest {
            token: format!("2@scripted-token-{n}"),
            confirmation: rx,
        })
    }

    async fn connect(&self, _credentials: &Credentials) -> Result<Link, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.connect_script.lock().unwrap().pop_front();
        if let Some(Err(e)) = scripted {
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.events.lock().unwrap() = Some(tx);
        Ok(Link {
            own_jid: own_jid(),
            events: rx,
        })
    }

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt, TransportError> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.send_script.lock().unwrap().pop_front() {
            return Err(err);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let media = match &message.content {
            tether_shared::protocol::OutboundContent::Text { .. } => None,
            _ => Some(MediaLocator {
                direct_path: Some(format!("/sent/{n}")),
                file_length: None,
                ..Default::default()
            }),
        };
        self.sent.lock().unwrap().push(message);

        Ok(SendReceipt {
            message_id: MessageId::new(format!("SENT{n}")).expect("non-empty id"),
            timestamp: 1_700_000_000_000 + i64::try_from(n).unwrap_or(0),
            media,
        })
    }

    async fn fetch_media(&self, locator: &MediaLocator) -> Result<Bytes, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = locator.direct_path.clone().unwrap_or_default();
        self.media
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::NotFound(key)))
    }

    async fn request_backfill(&self, cursors: &[SyncCursor]) -> Result<(), TransportError> {
        self.backfills.lock().unwrap().push(cursors.to_vec());
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.drop_link();
        Ok(())
    }
}

//! Session Manager: the linked-device lifecycle.
//!
//! ```text
//! Unpaired -> AwaitingScan -> Linked -> Active <-> Disconnected
//!                                         |            |
//!                                         +-> Unpaired <+  (expired / logged out)
//! ```
//!
//! Transitions are serialized by one async mutex. The current
//! [`ConnectionHandle`] is shared read-mostly with the gateway and the media
//! store; observers follow the state through a `watch` channel.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use tether_shared::protocol::{Credentials, MediaLocator, OutboundMessage, SendReceipt};
use tether_shared::{ChatJid, TransportError};
use tether_store::Database;

use crate::backoff::BackoffConfig;
use crate::clock::Clock;
use crate::error::SessionError;
use crate::transport::{EventStream, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Unpaired,
    /// Waiting for the primary device to scan `token`.
    AwaitingScan { token: String },
    /// Credentials stored, no link yet.
    Linked,
    Active { jid: ChatJid },
    /// Link lost; `attempt` counts failed reconnects so far.
    Disconnected { attempt: u32 },
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }
}

/// Capability to act on the live link.
#[derive(Clone)]
pub struct ConnectionHandle {
    transport: Arc<dyn Transport>,
    own_jid: ChatJid,
}

impl ConnectionHandle {
    pub fn own_jid(&self) -> &ChatJid {
        &self.own_jid
    }

    pub async fn send(&self, message: OutboundMessage) -> Result<SendReceipt, TransportError> {
        self.transport.send(message).await
    }

    pub async fn fetch_media(&self, locator: &MediaLocator) -> Result<Bytes, TransportError> {
        self.transport.fetch_media(locator).await
    }
}

pub struct SessionManager {
    db: Database,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    pairing_timeout: Duration,
    backoff: BackoffConfig,
    state_tx: watch::Sender<SessionState>,
    handle: RwLock<Option<ConnectionHandle>>,
    transition: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        db: Database,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        pairing_timeout: Duration,
        backoff: BackoffConfig,
    ) -> Result<Self, SessionError> {
        let initial = if db.load_session()?.is_some() {
            SessionState::Linked
        } else {
            SessionState::Unpaired
        };
        let (state_tx, _) = watch::channel(initial);

        Ok(Self {
            db,
            transport,
            clock,
            pairing_timeout,
            backoff,
            state_tx,
            handle: RwLock::new(None),
            transition: Mutex::new(()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Whether credentials are stored (the device was paired and not revoked).
    pub fn is_paired(&self) -> Result<bool, SessionError> {
        Ok(self.db.load_session()?.is_some())
    }

    /// The live link, or `Disconnected`.
    pub fn handle(&self) -> Result<ConnectionHandle, SessionError> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::Disconnected)
    }

    /// Link a new device. Waits up to the pairing timeout for the token to
    /// be scanned, then persists the credentials and connects.
    pub async fn pair(&self) -> Result<EventStream, SessionError> {
        let _transition = self.transition.lock().await;

        let request = self.transport.request_pairing().await?;
        info!(token = %request.token, "Pairing token issued, scan it from the primary device");
        self.set_state(SessionState::AwaitingScan {
            token: request.token.clone(),
        });

        let credentials = match tokio::time::timeout(self.pairing_timeout, request.confirmation).await {
            Ok(Ok(credentials)) => credentials,
            Ok(Err(_)) => {
                warn!("Pairing request dropped by the protocol client");
                self.set_state(SessionState::Unpaired);
                return Err(SessionError::PairingAborted);
            }
            Err(_) => {
                warn!(timeout_secs = self.pairing_timeout.as_secs(), "Pairing timed out");
                self.set_state(SessionState::Unpaired);
                return Err(SessionError::PairingTimeout);
            }
        };

        let now = self.clock.now_ms();
        self.db.write_batch(|b| b.save_session(&credentials, now))?;
        info!(jid = %credentials.jid, device = credentials.device_id, "Device linked");
        self.set_state(SessionState::Linked);

        self.connect_with_backoff(&credentials).await
    }

    /// Reconnect with the stored credentials, retrying transient failures
    /// with exponential backoff.
    pub async fn connect(&self) -> Result<EventStream, SessionError> {
        let _transition = self.transition.lock().await;

        let stored = self.db.load_session()?.ok_or(SessionError::NotPaired)?;
        self.connect_with_backoff(&stored.credentials).await
    }

    async fn connect_with_backoff(&self, credentials: &Credentials) -> Result<EventStream, SessionError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match self.transport.connect(credentials).await {
                Ok(link) => {
                    let now = self.clock.now_ms();
                    self.db.write_batch(|b| b.mark_session_connected(now))?;

                    *self.handle.write().unwrap_or_else(PoisonError::into_inner) =
                        Some(ConnectionHandle {
                            transport: Arc::clone(&self.transport),
                            own_jid: link.own_jid.clone(),
                        });
                    info!(jid = %link.own_jid, attempts = attempt + 1, "Session active");
                    self.set_state(SessionState::Active { jid: link.own_jid });
                    return Ok(link.events);
                }
                Err(TransportError::Unauthorized(reason)) => {
                    warn!(reason = %reason, "Stored credentials rejected, re-pairing required");
                    self.expire()?;
                    return Err(SessionError::CredentialsExpired);
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        error!(attempts = attempt, error = %e, "Reconnect attempts exhausted");
                        self.set_state(SessionState::Disconnected { attempt });
                        return Err(SessionError::ReconnectExhausted { attempts: attempt });
                    }

                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Connect failed, retrying"
                    );
                    self.set_state(SessionState::Disconnected { attempt });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, "Connect refused");
                    self.set_state(SessionState::Disconnected { attempt });
                    return Err(SessionError::Transport(e));
                }
            }
        }
    }

    /// The link dropped. Sends fail fast until the next successful connect.
    pub async fn mark_disconnected(&self) {
        let _transition = self.transition.lock().await;

        self.clear_handle();
        if self.state().is_active() {
            info!("Session disconnected");
            self.set_state(SessionState::Disconnected { attempt: 0 });
        }
    }

    /// The remote side logged this device out.
    pub async fn logged_out(&self, reason: Option<&str>) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;

        warn!(reason = reason.unwrap_or("unspecified"), "Logged out by remote side");
        self.expire()
    }

    /// Unlink this device on request.
    pub async fn unlink(&self) -> Result<(), SessionError> {
        let _transition = self.transition.lock().await;

        if self.handle().is_ok() {
            if let Err(e) = self.transport.logout().await {
                warn!(error = %e, "Remote logout failed, forgetting credentials anyway");
            }
        }
        info!("Device unlinked");
        self.expire()
    }

    fn expire(&self) -> Result<(), SessionError> {
        self.clear_handle();
        self.db.write_batch(|b| b.invalidate_session())?;
        self.set_state(SessionState::Unpaired);
        Ok(())
    }

    fn clear_handle(&self) {
        self.handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{test_credentials, ScriptedTransport};

    fn manager(db: &Database, transport: &Arc<ScriptedTransport>, max_attempts: u32) -> SessionManager {
        SessionManager::new(
            db.clone(),
            transport.clone(),
            Arc::new(ManualClock::new(1_000)),
            Duration::from_secs(120),
            BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60), max_attempts),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_times_out_back_to_unpaired() {
        let db = Database::in_memory().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let session = manager(&db, &transport, 3);

        let started = tokio::time::Instant::now();
        let err = session.pair().await.unwrap_err();

        assert!(matches!(err, SessionError::PairingTimeout));
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(session.state(), SessionState::Unpaired);
        assert!(db.load_session().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_confirmed_goes_active() {
        let db = Database::in_memory().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let session = Arc::new(manager(&db, &transport, 3));
        let mut states = session.subscribe();

        let pairing = tokio::spawn({
            let session = session.clone();
            async move { session.pair().await }
        });

        states
            .wait_for(|s| matches!(s, SessionState::AwaitingScan { .. }))
            .await
            .unwrap();
        assert!(transport.confirm_pairing(test_credentials()));

        pairing.await.unwrap().unwrap();
        assert!(session.state().is_active());
        assert_eq!(session.handle().unwrap().own_jid(), &test_credentials().jid);
        assert_eq!(db.load_session().unwrap().unwrap().credentials, test_credentials());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_reconnects_without_pairing() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| b.save_session(&test_credentials(), 500)).unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        let session = manager(&db, &transport, 3);
        assert_eq!(session.state(), SessionState::Linked);

        session.connect().await.unwrap();
        assert!(session.state().is_active());
        assert_eq!(transport.pairing_requests(), 0);
        assert!(db.load_session().unwrap().unwrap().last_connected_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_require_pairing() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| b.save_session(&test_credentials(), 500)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.script_connect([Err(TransportError::Unauthorized("revoked".into()))]);
        let session = manager(&db, &transport, 3);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::CredentialsExpired));
        assert_eq!(session.state(), SessionState::Unpaired);
        assert!(!session.is_paired().unwrap());
        assert!(matches!(session.connect().await, Err(SessionError::NotPaired)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_connect() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| b.save_session(&test_credentials(), 500)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.script_connect([
            Err(TransportError::Network("reset".into())),
            Err(TransportError::Unavailable),
        ]);
        let session = manager(&db, &transport, 5);

        let started = tokio::time::Instant::now();
        session.connect().await.unwrap();

        assert_eq!(transport.connects(), 3);
        // 1s then 2s, each with at most 20% jitter.
        assert!(started.elapsed() >= Duration::from_millis(2_400));
        assert!(session.state().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_max_attempts() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| b.save_session(&test_credentials(), 500)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.script_connect((0..3).map(|_| Err(TransportError::Unavailable)));
        let session = manager(&db, &transport, 3);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::ReconnectExhausted { attempts: 3 }));
        assert_eq!(session.state(), SessionState::Disconnected { attempt: 3 });
        // Credentials survive; only the operator needs to look.
        assert!(session.is_paired().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_follows_link() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| b.save_session(&test_credentials(), 500)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let session = manager(&db, &transport, 3);

        assert!(matches!(session.handle(), Err(SessionError::Disconnected)));
        session.connect().await.unwrap();
        assert!(session.handle().is_ok());

        session.mark_disconnected().await;
        assert!(matches!(session.handle(), Err(SessionError::Disconnected)));
        assert_eq!(session.state(), SessionState::Disconnected { attempt: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn unlink_logs_out_and_forgets() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| b.save_session(&test_credentials(), 500)).unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let session = manager(&db, &transport, 3);
        session.connect().await.unwrap();

        session.unlink().await.unwrap();
        assert_eq!(transport.logouts(), 1);
        assert_eq!(session.state(), SessionState::Unpaired);
        assert!(db.load_session().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_logout_waits_for_pairing_to_finish() {
        let db = Database::in_memory().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let session = Arc::new(manager(&db, &transport, 3));
        let mut states = session.subscribe();

        let pairing = tokio::spawn({
            let session = session.clone();
            async move { session.pair().await }
        });
        states
            .wait_for(|s| matches!(s, SessionState::AwaitingScan { .. }))
            .await
            .unwrap();

        let logout = tokio::spawn({
            let session = session.clone();
            async move { session.logged_out(Some("stale")).await }
        });
        tokio::task::yield_now().await;
        assert!(!logout.is_finished());
        assert!(matches!(session.state(), SessionState::AwaitingScan { .. }));

        assert!(transport.confirm_pairing(test_credentials()));
        pairing.await.unwrap().unwrap();
        logout.await.unwrap().unwrap();

        assert_eq!(session.state(), SessionState::Unpaired);
        assert!(session.handle().is_err());
        assert!(!session.is_paired().unwrap());
    }
}

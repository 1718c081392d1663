//! The supervisor: owns every component and runs the link event loop.
//!
//! One background task keeps the device linked. It pairs when no session
//! is stored, otherwise connects with the stored credentials, asks the
//! remote side to resume backfill from the committed cursors and feeds
//! every inbound event to ingestion. A dropped link is reconnected; a
//! remote logout falls back to pairing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tether_shared::constants::PENDING_RECEIPT_TTL_DAYS;
use tether_shared::protocol::ProtocolEvent;
use tether_store::Database;

use crate::backoff::BackoffConfig;
use crate::clock::{Clock, SystemClock};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, SessionError};
use crate::gateway::CommandGateway;
use crate::ingest::{IngestOptions, IngestStats, Ingestor};
use crate::media::MediaStore;
use crate::query::QueryService;
use crate::session::SessionManager;
use crate::transcode::{FfmpegTranscoder, Transcoder};
use crate::transport::{EventStream, Transport};

pub struct Bridge {
    config: BridgeConfig,
    db: Database,
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    ingest: Ingestor,
    media: Arc<MediaStore>,
    gateway: Arc<CommandGateway>,
    query: QueryService,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Open (or create) the store under `config.store_dir` and wire every
    /// component to `transport`.
    pub async fn open(config: BridgeConfig, transport: Arc<dyn Transport>) -> Result<Self, BridgeError> {
        let db = Database::open_in(&config.store_dir)?;
        Self::with_database(config, db, transport, Arc::new(SystemClock)).await
    }

    pub async fn with_database(
        config: BridgeConfig,
        db: Database,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BridgeError> {
        let cutoff = clock.now_ms() - PENDING_RECEIPT_TTL_DAYS * 86_400_000;
        let pruned = db.write_batch(|b| b.prune_pending_receipts(cutoff))?;
        if pruned > 0 {
            info!(pruned, "Dropped parked receipts whose message never arrived");
        }

        let session = Arc::new(SessionManager::new(
            db.clone(),
            transport.clone(),
            clock.clone(),
            config.pairing_timeout,
            config.reconnect.clone(),
        )?);

        let ingest = Ingestor::new(
            db.clone(),
            clock.clone(),
            IngestOptions {
                queue_capacity: config.ingest_queue,
                storage_retries: config.storage_retries,
                retry_base: config.storage_retry_base,
                idle_timeout: config.ingest_idle_timeout,
            },
        );

        let media = Arc::new(
            MediaStore::new(
                config.media_dir(),
                db.clone(),
                session.clone(),
                clock.clone(),
                config.max_media_bytes,
            )
            .await?,
        );

        let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(config.ffmpeg_path.clone()));
        let gateway = Arc::new(CommandGateway::new(
            db.clone(),
            session.clone(),
            ingest.clone(),
            media.clone(),
            Some(transcoder),
            clock,
            config.max_media_bytes,
        ));

        let query = QueryService::new(db.clone());
        let (stop_tx, _) = watch::channel(false);

        info!(store = %config.store_dir.display(), "Bridge initialized");

        Ok(Self {
            config,
            db,
            transport,
            session,
            ingest,
            media,
            gateway,
            query,
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the link supervisor. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let supervisor = Supervisor {
            db: self.db.clone(),
            transport: self.transport.clone(),
            session: self.session.clone(),
            ingest: self.ingest.clone(),
            backoff: self.config.reconnect.clone(),
        };
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(supervisor.run(stop_rx)));
    }

    /// Stop the supervisor and drain ingestion.
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Link supervisor panicked");
            }
        }

        self.ingest.flush().await;
        self.ingest.shutdown().await;
        self.session.mark_disconnected().await;
        info!("Bridge stopped");
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn gateway(&self) -> &Arc<CommandGateway> {
        &self.gateway
    }

    pub fn media(&self) -> &Arc<MediaStore> {
        &self.media
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.ingest.stats()
    }
}

struct Supervisor {
    db: Database,
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    ingest: Ingestor,
    backoff: BackoffConfig,
}

/// Why an event stream stopped being read.
enum LinkEnd {
    Dropped,
    LoggedOut,
    Stop,
}

impl Supervisor {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            if *stop.borrow() {
                break;
            }

            let established = tokio::select! {
                _ = stop.changed() => break,
                result = self.establish() => result,
            };

            let events = match established {
                Ok(events) => {
                    failures = 0;
                    events
                }
                Err(e) => {
                    let pause = match e {
                        SessionError::ReconnectExhausted { .. } => Duration::from_millis(self.backoff.max_delay_ms),
                        _ => self.backoff.delay(failures),
                    };
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %e,
                        pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                        "Link not established"
                    );
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(pause) => continue,
                    }
                }
            };

            self.on_connected().await;

            match self.pump(events, &mut stop).await {
                LinkEnd::Stop => break,
                LinkEnd::Dropped => {
                    self.session.mark_disconnected().await;
                }
                LinkEnd::LoggedOut => {
                    self.ingest.set_own_jid(None);
                }
            }
        }
        debug!("Link supervisor exited");
    }

    async fn establish(&self) -> Result<EventStream, SessionError> {
        if self.session.is_paired()? {
            self.session.connect().await
        } else {
            self.session.pair().await
        }
    }

    async fn on_connected(&self) {
        let own = self.session.handle().ok().map(|h| h.own_jid().clone());
        self.ingest.set_own_jid(own);

        let cursors = match self.db.list_cursors() {
            Ok(cursors) => cursors,
            Err(e) => {
                error!(error = %e, "Failed to load sync cursors");
                return;
            }
        };
        match self.transport.request_backfill(&cursors).await {
            Ok(()) => info!(cursors = cursors.len(), "Backfill requested"),
            Err(e) => warn!(error = %e, "Backfill request failed"),
        }
    }

    async fn pump(&self, mut events: EventStream, stop: &mut watch::Receiver<bool>) -> LinkEnd {
        loop {
            let event = tokio::select! {
                _ = stop.changed() => return LinkEnd::Stop,
                event = events.recv() => event,
            };

            match event {
                None => {
                    info!("Event stream ended");
                    return LinkEnd::Dropped;
                }
                Some(ProtocolEvent::PairingCode { token }) => {
                    info!(token = %token, "Pairing token rotated");
                }
                Some(ProtocolEvent::Connected) => {
                    debug!("Remote side confirmed the connection");
                }
                Some(ProtocolEvent::Disconnected { reason }) => {
                    info!(reason = reason.as_deref().unwrap_or("unspecified"), "Link dropped");
                    return LinkEnd::Dropped;
                }
                Some(ProtocolEvent::LoggedOut { reason }) => {
                    // Queued history must land before the cursors are cleared.
                    self.ingest.flush().await;
                    if let Err(e) = self.session.logged_out(reason.as_deref()).await {
                        error!(error = %e, "Failed to forget credentials");
                    }
                    return LinkEnd::LoggedOut;
                }
                Some(event) => {
                    if let Err(e) = self.ingest.dispatch(event).await {
                        error!(error = %e, "Event not ingested");
                    }
                }
            }
        }
    }
}

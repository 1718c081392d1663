//! Event Ingestion Pipeline.
//!
//! Protocol events are validated and normalized here, then routed to the
//! worker of their chat: one bounded queue and one task per chat. Work for
//! different chats runs concurrently; work for one chat is applied strictly
//! in arrival order. Each work item is applied in a single store
//! transaction, so a storage failure never leaves part of an item behind
//! and the item can simply be retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use tether_shared::constants::GLOBAL_CURSOR_SCOPE;
use tether_shared::protocol::{
    ChatMetadataEvent, ContactEvent, HistoryBatch, MessageContent, MessageEvent, ProtocolEvent,
    ReceiptEvent,
};
use tether_shared::{ChatJid, ContentKind, MessageId, ReceiptStatus};
use tether_store::{Batch, Database, NewMessage, StoreError, UpsertOutcome};

use crate::clock::Clock;
use crate::error::IngestError;

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Work items committed.
    pub applied: u64,
    /// Events dropped because they could not be normalized.
    pub malformed: u64,
    /// History sub-ranges at or behind their chat's cursor (late or
    /// redelivered chunks). They are applied anyway; the upserts are
    /// idempotent and the cursor does not move back.
    pub history_replayed: u64,
    /// Storage attempts that failed and were retried.
    pub storage_retries: u64,
    /// Work items dropped after exhausting storage retries.
    pub fatal: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    malformed: AtomicU64,
    history_replayed: AtomicU64,
    storage_retries: AtomicU64,
    fatal: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Capacity of each chat's queue.
    pub queue_capacity: usize,
    /// Attempts per work item, the first one included.
    pub storage_retries: u32,
    /// Delay before the first retry; doubles each time.
    pub retry_base: Duration,
    /// A chat's worker stops after this long without work and is respawned
    /// on the next event.
    pub idle_timeout: Duration,
}

/// A message plus the sender's self-chosen display name, if the event had one.
#[derive(Debug, Clone)]
struct Incoming {
    message: NewMessage,
    push_name: Option<String>,
}

#[derive(Debug)]
enum Work {
    Message(Incoming),
    Receipt {
        ids: Vec<MessageId>,
        status: ReceiptStatus,
        timestamp: i64,
    },
    Metadata {
        name: Option<String>,
        participants: Option<Vec<ChatJid>>,
        timestamp: i64,
    },
    Contact {
        push_name: Option<String>,
        full_name: Option<String>,
        timestamp: i64,
    },
    History {
        chunk_index: u64,
        name: Option<String>,
        messages: Vec<Incoming>,
    },
    Barrier,
}

struct Job {
    work: Work,
    ack: Option<oneshot::Sender<Result<(), IngestError>>>,
}

/// The map holds the only long-lived sender. Senders handed out are clones
/// of the `Arc`, so a strong count of one means nobody can still enqueue.
struct Worker {
    id: u64,
    tx: Arc<mpsc::Sender<Job>>,
    task: JoinHandle<()>,
}

enum Retire {
    Stopped,
    Pending(Job),
    Busy,
}

struct Inner {
    db: Database,
    clock: Arc<dyn Clock>,
    options: IngestOptions,
    own_jid: RwLock<Option<ChatJid>>,
    workers: Mutex<HashMap<ChatJid, Worker>>,
    next_worker: AtomicU64,
    closed: AtomicBool,
    counters: Counters,
}

/// Cheap to clone; all clones feed the same workers.
#[derive(Clone)]
pub struct Ingestor {
    inner: Arc<Inner>,
}

impl Ingestor {
    pub fn new(db: Database, clock: Arc<dyn Clock>, options: IngestOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                clock,
                options,
                own_jid: RwLock::new(None),
                workers: Mutex::new(HashMap::new()),
                next_worker: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// The linked account, used as the sender of our own messages when the
    /// event leaves it blank.
    pub fn set_own_jid(&self, jid: Option<ChatJid>) {
        *self.inner.own_jid.write().unwrap_or_else(PoisonError::into_inner) = jid;
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.inner.counters;
        IngestStats {
            applied: c.applied.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            history_replayed: c.history_replayed.load(Ordering::Relaxed),
            storage_retries: c.storage_retries.load(Ordering::Relaxed),
            fatal: c.fatal.load(Ordering::Relaxed),
        }
    }

    /// Route one protocol event to its chat worker.
    ///
    /// Malformed events are logged, counted and skipped (`Ok`). Live events
    /// are queued without waiting for the commit; history batches wait for
    /// every chat sub-range and then advance the global cursor.
    pub async fn dispatch(&self, event: ProtocolEvent) -> Result<(), IngestError> {
        let routed = match event {
            ProtocolEvent::Message(ev) => self.route_message(ev).await,
            ProtocolEvent::Receipt(ev) => self.route_receipt(ev).await,
            ProtocolEvent::ChatMetadata(ev) => self.route_metadata(ev).await,
            ProtocolEvent::Contact(ev) => self.route_contact(ev).await,
            ProtocolEvent::HistorySync(batch) => self.ingest_history(batch).await,
            other => {
                debug!(event = ?other, "Session event ignored by ingestion");
                Ok(())
            }
        };

        match routed {
            Err(IngestError::Malformed(reason)) => {
                self.inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(reason = %reason, "Skipping malformed event");
                Ok(())
            }
            other => other,
        }
    }

    /// Write a locally produced message through its chat worker and wait for
    /// the commit.
    pub async fn submit(&self, message: NewMessage) -> Result<(), IngestError> {
        let chat = message.chat_jid.clone();
        let work = Work::Message(Incoming {
            message,
            push_name: None,
        });
        self.enqueue_acked(&chat, work).await?.await.map_err(|_| IngestError::Closed)?
    }

    /// Wait until everything queued so far has been applied.
    pub async fn flush(&self) {
        let senders: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|w| Arc::clone(&w.tx))
            .collect();

        let mut acks = Vec::with_capacity(senders.len());
        for tx in senders {
            let (ack_tx, ack_rx) = oneshot::channel();
            let job = Job {
                work: Work::Barrier,
                ack: Some(ack_tx),
            };
            if tx.send(job).await.is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Chats with a running worker.
    pub fn active_workers(&self) -> usize {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drain every queue and stop the workers. Later events are refused.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, w)| w)
            .collect();

        for worker in workers {
            drop(worker.tx);
            if let Err(e) = worker.task.await {
                error!(error = %e, "Ingestion worker panicked");
            }
        }
    }

    // -- routing ------------------------------------------------------------

    async fn route_message(&self, ev: MessageEvent) -> Result<(), IngestError> {
        let incoming = self.normalize_message(ev)?;
        let chat = incoming.message.chat_jid.clone();
        self.enqueue(&chat, Work::Message(incoming), None).await
    }

    async fn route_receipt(&self, ev: ReceiptEvent) -> Result<(), IngestError> {
        let chat = parse_chat(&ev.chat)?;
        let ids = ev
            .message_ids
            .into_iter()
            .map(MessageId::new)
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Err(IngestError::Malformed("receipt without message ids".into()));
        }
        let work = Work::Receipt {
            ids,
            status: ev.status,
            timestamp: ev.timestamp,
        };
        self.enqueue(&chat, work, None).await
    }

    async fn route_metadata(&self, ev: ChatMetadataEvent) -> Result<(), IngestError> {
        let chat = parse_chat(&ev.chat)?;
        let participants = ev
            .participants
            .map(|list| {
                list.iter()
                    .map(|p| ChatJid::parse(p).map(|j| j.to_non_device()))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        let work = Work::Metadata {
            name: ev.name,
            participants,
            timestamp: ev.timestamp,
        };
        self.enqueue(&chat, work, None).await
    }

    async fn route_contact(&self, ev: ContactEvent) -> Result<(), IngestError> {
        let jid = parse_chat(&ev.jid)?;
        if jid.is_group() {
            return Err(IngestError::Malformed(format!("contact event for group {jid}")));
        }
        let work = Work::Contact {
            push_name: ev.push_name,
            full_name: ev.full_name,
            timestamp: ev.timestamp,
        };
        self.enqueue(&jid, work, None).await
    }

    async fn ingest_history(&self, batch: HistoryBatch) -> Result<(), IngestError> {
        let chunk_index = batch.chunk_index;
        let mut pending = Vec::with_capacity(batch.conversations.len());

        for conversation in batch.conversations {
            let chat = match parse_chat(&conversation.chat) {
                Ok(chat) => chat,
                Err(e) => {
                    self.inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(chat = %conversation.chat, error = %e, "Skipping history conversation");
                    continue;
                }
            };

            let mut messages = Vec::with_capacity(conversation.messages.len());
            for ev in conversation.messages {
                match self.normalize_message(ev) {
                    Ok(incoming) if incoming.message.chat_jid == chat => messages.push(incoming),
                    Ok(incoming) => {
                        self.inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            chat = %chat,
                            other = %incoming.message.chat_jid,
                            "History message filed under the wrong chat, skipping"
                        );
                    }
                    Err(e) => {
                        self.inner.counters.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!(chat = %chat, error = %e, "Skipping malformed history message");
                    }
                }
            }

            let work = Work::History {
                chunk_index,
                name: conversation.name,
                messages,
            };
            pending.push(self.enqueue_acked(&chat, work).await?);
        }

        let mut first_error = None;
        for ack in pending {
            let result = ack.await.unwrap_or(Err(IngestError::Closed));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let now = self.inner.clock.now_ms();
        self.inner
            .db
            .write_batch(|b| b.advance_cursor(GLOBAL_CURSOR_SCOPE, chunk_index, None, now))
            .map_err(|source| IngestError::Storage {
                attempts: 1,
                source,
            })?;
        debug!(chunk = chunk_index, "History chunk committed");
        Ok(())
    }

    fn normalize_message(&self, ev: MessageEvent) -> Result<Incoming, IngestError> {
        let chat = parse_chat(&ev.chat)?;
        let id = MessageId::new(ev.id)?;
        if ev.timestamp <= 0 {
            return Err(IngestError::Malformed(format!(
                "message {id} has timestamp {}",
                ev.timestamp
            )));
        }

        let sender = if ev.sender.trim().is_empty() {
            if ev.is_from_me {
                self.inner
                    .own_jid
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .ok_or_else(|| IngestError::Malformed(format!("own message {id} without sender")))?
            } else if !chat.is_group() {
                chat.clone()
            } else {
                return Err(IngestError::Malformed(format!("group message {id} without sender")));
            }
        } else {
            ChatJid::parse(&ev.sender)?.to_non_device()
        };

        let (kind, content, media) = match ev.content {
            MessageContent::Text { body } => (ContentKind::Text, body, None),
            MessageContent::System { body } => (ContentKind::System, body, None),
            MessageContent::Media {
                media_kind,
                caption,
                locator,
            } => {
                if !media_kind.is_media() {
                    return Err(IngestError::Malformed(format!(
                        "message {id} has media content of kind {}",
                        media_kind.as_str()
                    )));
                }
                (media_kind, caption.unwrap_or_default(), Some(locator))
            }
            MessageContent::Unsupported { detail } => {
                return Err(IngestError::Malformed(format!(
                    "message {id} has unsupported content ({})",
                    detail.as_deref().unwrap_or("no detail")
                )));
            }
        };

        let status = ev.status.unwrap_or(if ev.is_from_me {
            ReceiptStatus::Sent
        } else {
            ReceiptStatus::Delivered
        });

        Ok(Incoming {
            message: NewMessage {
                id,
                chat_jid: chat,
                sender,
                is_from_me: ev.is_from_me,
                timestamp: ev.timestamp,
                kind,
                content,
                status,
                media,
            },
            push_name: ev.push_name.filter(|n| !n.trim().is_empty()),
        })
    }

    // -- queues -------------------------------------------------------------

    async fn enqueue_acked(
        &self,
        chat: &ChatJid,
        work: Work,
    ) -> Result<oneshot::Receiver<Result<(), IngestError>>, IngestError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(chat, work, Some(ack_tx)).await?;
        Ok(ack_rx)
    }

    async fn enqueue(
        &self,
        chat: &ChatJid,
        work: Work,
        ack: Option<oneshot::Sender<Result<(), IngestError>>>,
    ) -> Result<(), IngestError> {
        let tx = self.worker_for(chat)?;
        tx.send(Job { work, ack })
            .await
            .map_err(|_| IngestError::Closed)
    }

    fn worker_for(&self, chat: &ChatJid) -> Result<Arc<mpsc::Sender<Job>>, IngestError> {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(IngestError::Closed);
        }
        if let Some(worker) = workers.get(chat) {
            return Ok(Arc::clone(&worker.tx));
        }

        let id = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.options.queue_capacity.max(1));
        let tx = Arc::new(tx);
        let task = tokio::spawn(run_worker(chat.clone(), id, rx, Arc::clone(&self.inner)));
        debug!(chat = %chat, "Spawned ingestion worker");
        workers.insert(
            chat.clone(),
            Worker {
                id,
                tx: Arc::clone(&tx),
                task,
            },
        );
        Ok(tx)
    }
}

fn parse_chat(raw: &str) -> Result<ChatJid, IngestError> {
    Ok(ChatJid::parse(raw)?.to_non_device())
}

async fn run_worker(chat: ChatJid, id: u64, mut rx: mpsc::Receiver<Job>, inner: Arc<Inner>) {
    let idle = inner.options.idle_timeout;
    loop {
        let job = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => match inner.retire(&chat, id, &mut rx) {
                Retire::Stopped => {
                    debug!(chat = %chat, "Idle ingestion worker retired");
                    return;
                }
                Retire::Pending(job) => job,
                Retire::Busy => continue,
            },
        };

        let result = match &job.work {
            Work::Barrier => Ok(()),
            work => inner.apply_with_retry(&chat, work).await,
        };
        if let Some(ack) = job.ack {
            let _ = ack.send(result);
        }
    }
    debug!(chat = %chat, "Ingestion worker stopped");
}

impl Inner {
    /// Remove an idle worker from the map. Only succeeds while no sender is
    /// outstanding and the queue is empty, both checked under the map lock
    /// so no job can be left behind.
    fn retire(&self, chat: &ChatJid, id: u64, rx: &mut mpsc::Receiver<Job>) -> Retire {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let owned = workers
            .get(chat)
            .is_some_and(|w| w.id == id && Arc::strong_count(&w.tx) == 1);
        if !owned {
            return Retire::Busy;
        }
        match rx.try_recv() {
            Ok(job) => Retire::Pending(job),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                workers.remove(chat);
                Retire::Stopped
            }
        }
    }

    async fn apply_with_retry(&self, chat: &ChatJid, work: &Work) -> Result<(), IngestError> {
        let attempts = self.options.storage_retries.max(1);
        let mut attempt = 1;
        loop {
            let now = self.clock.now_ms();
            match self.db.write_batch(|b| apply(b, chat, work, now)) {
                Ok(advanced) => {
                    self.counters.applied.fetch_add(1, Ordering::Relaxed);
                    if let (Work::History { chunk_index, .. }, false) = (work, advanced) {
                        self.counters.history_replayed.fetch_add(1, Ordering::Relaxed);
                        debug!(chat = %chat, chunk = chunk_index, "History sub-range behind cursor applied");
                    }
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    self.counters.fatal.fetch_add(1, Ordering::Relaxed);
                    error!(chat = %chat, attempts, error = %source, "Storage failed, dropping work item");
                    return Err(IngestError::Storage { attempts, source });
                }
                Err(e) => {
                    self.counters.storage_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.options.retry_base.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(chat = %chat, attempt, error = %e, "Storage failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Apply one work item inside an open transaction. Returns `false` only for
/// a history sub-range that did not move its chat's cursor.
fn apply(batch: &Batch<'_>, chat: &ChatJid, work: &Work, now_ms: i64) -> Result<bool, StoreError> {
    match work {
        Work::Message(incoming) => {
            write_message(batch, incoming)?;
        }
        Work::Receipt {
            ids,
            status,
            timestamp,
        } => {
            for id in ids {
                let outcome = batch.apply_receipt(chat, id, *status, *timestamp)?;
                debug!(chat = %chat, id = %id, status = status.as_str(), ?outcome, "Receipt applied");
            }
        }
        Work::Metadata {
            name,
            participants,
            timestamp,
        } => {
            let applied =
                batch.apply_chat_metadata(chat, name.as_deref(), participants.as_deref(), *timestamp)?;
            if !applied {
                debug!(chat = %chat, timestamp, "Stale chat metadata ignored");
            }
        }
        Work::Contact {
            push_name,
            full_name,
            timestamp,
        } => {
            batch.upsert_contact(chat, push_name.as_deref(), full_name.as_deref(), *timestamp)?;
        }
        Work::History {
            chunk_index,
            name,
            messages,
        } => {
            batch.touch_chat(chat, name.as_deref(), None)?;

            let mut ordered: Vec<&Incoming> = messages.iter().collect();
            ordered.sort_by_key(|m| m.message.timestamp);
            for incoming in &ordered {
                write_message(batch, incoming)?;
            }

            let last_ts = ordered.last().map(|m| m.message.timestamp);
            return batch.advance_cursor(chat.as_str(), *chunk_index, last_ts, now_ms);
        }
        Work::Barrier => {}
    }
    Ok(true)
}

fn write_message(batch: &Batch<'_>, incoming: &Incoming) -> Result<UpsertOutcome, StoreError> {
    let msg = &incoming.message;
    if let (Some(name), false) = (&incoming.push_name, msg.is_from_me) {
        batch.upsert_contact(&msg.sender, Some(name), None, msg.timestamp)?;
    }
    let outcome = batch.upsert_message(msg)?;
    debug!(chat = %msg.chat_jid, id = %msg.id, ?outcome, "Message stored");
    Ok(outcome)
}

//! Command Gateway: the outbound write path.
//!
//! Each send takes its chat's lock, goes out through the live session and
//! is then written through that chat's ingestion worker before the call
//! returns, so a sent message is immediately visible to readers and sends
//! to one chat never interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use tether_shared::protocol::{MediaLocator, OutboundContent, OutboundMessage};
use tether_shared::{ChatJid, ContentKind, MessageId, ReceiptStatus};
use tether_store::{Database, NewMessage, StoreError};

use crate::clock::Clock;
use crate::error::{MediaError, SendError, TranscodeError};
use crate::ingest::Ingestor;
use crate::media::MediaStore;
use crate::session::SessionManager;
use crate::transcode::Transcoder;

/// What a successful send produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub message_id: MessageId,
    pub chat_jid: ChatJid,
    pub timestamp: DateTime<Utc>,
    pub kind: ContentKind,
}

/// Bytes of an outgoing file, kept to seed the media cache after the send.
struct LocalBlob {
    data: Bytes,
    ext: String,
    locator: MediaLocator,
}

pub struct CommandGateway {
    db: Database,
    session: Arc<SessionManager>,
    ingest: Ingestor,
    media: Arc<MediaStore>,
    transcoder: Option<Arc<dyn Transcoder>>,
    clock: Arc<dyn Clock>,
    max_media_bytes: usize,
    send_locks: Mutex<HashMap<ChatJid, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommandGateway {
    pub fn new(
        db: Database,
        session: Arc<SessionManager>,
        ingest: Ingestor,
        media: Arc<MediaStore>,
        transcoder: Option<Arc<dyn Transcoder>>,
        clock: Arc<dyn Clock>,
        max_media_bytes: usize,
    ) -> Self {
        Self {
            db,
            session,
            ingest,
            media,
            transcoder,
            clock,
            max_media_bytes,
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    /// A phone number (country code, optional `+`) or a JID. Group chats
    /// must already be known; unknown people are valid new contacts.
    pub fn resolve_recipient(&self, recipient: &str) -> Result<ChatJid, SendError> {
        let recipient = recipient.trim();
        let jid = ChatJid::parse_recipient(recipient)
            .map_err(|e| SendError::InvalidRecipient(e.to_string()))?
            .to_non_device();

        if jid.is_group() && !self.db.chat_exists(&jid)? {
            return Err(SendError::InvalidRecipient(format!("unknown group {jid}")));
        }
        Ok(jid)
    }

    pub async fn send_text(&self, recipient: &str, body: &str) -> Result<SendOutcome, SendError> {
        let chat = self.resolve_recipient(recipient)?;
        if body.trim().is_empty() {
            return Err(SendError::Rejected("message is empty".into()));
        }
        self.send(chat, OutboundContent::Text { body: body.to_string() }, body.to_string(), None)
            .await
    }

    /// Send a file. The kind is inferred from the extension unless given.
    pub async fn send_media(
        &self,
        recipient: &str,
        path: &Path,
        kind: Option<ContentKind>,
    ) -> Result<SendOutcome, SendError> {
        let chat = self.resolve_recipient(recipient)?;
        let kind = kind.unwrap_or_else(|| ContentKind::infer_from_path(path));
        if !kind.is_media() {
            return Err(SendError::Rejected(format!("{} is not a media kind", kind.as_str())));
        }

        let data = self.read_file(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_for(path).to_string();
        let blob = local_blob(data.clone(), path, Some(&file_name), &mime_type);

        let content = OutboundContent::Media {
            kind,
            file_name,
            mime_type,
            data,
        };
        self.send(chat, content, String::new(), Some(blob)).await
    }

    /// Send a voice note. Ogg/Opus goes out as is; anything else is
    /// transcoded first.
    pub async fn send_voice(&self, recipient: &str, path: &Path) -> Result<SendOutcome, SendError> {
        let chat = self.resolve_recipient(recipient)?;
        let ext = extension(path);

        let data = if matches!(ext.as_str(), "ogg" | "opus") {
            self.read_file(path).await?
        } else {
            let transcoder = self.transcoder.as_ref().ok_or_else(|| {
                SendError::UnsupportedAudioFormat(format!(
                    ".{ext} needs conversion to Ogg/Opus and no transcoder is configured"
                ))
            })?;
            // Surface a missing file as a file error, not a codec one.
            tokio::fs::metadata(path).await?;
            transcoder.to_opus_ogg(path).await.map_err(|e| match e {
                TranscodeError::Unavailable(reason) => SendError::UnsupportedAudioFormat(format!(
                    ".{ext} needs conversion to Ogg/Opus: {reason}"
                )),
                other => SendError::UnsupportedAudioFormat(other.to_string()),
            })?
        };
        if data.len() > self.max_media_bytes {
            return Err(SendError::Rejected(format!(
                "voice note is {} bytes, limit is {}",
                data.len(),
                self.max_media_bytes
            )));
        }

        let blob = local_blob(data.clone(), Path::new("voice.ogg"), None, "audio/ogg; codecs=opus");
        self.send(chat, OutboundContent::Voice { data }, String::new(), Some(blob))
            .await
    }

    /// Local path of a message's media, downloading it if needed.
    pub async fn download_media(&self, message_id: &str, chat_jid: Option<&str>) -> Result<PathBuf, MediaError> {
        let id = MessageId::new(message_id).map_err(|_| MediaError::MessageNotFound)?;
        let chat = chat_jid
            .map(|c| ChatJid::parse(c).map_err(|_| MediaError::MessageNotFound))
            .transpose()?;

        let message = match self.db.find_message(&id, chat.as_ref()) {
            Ok(message) => message,
            Err(StoreError::NotFound) => return Err(MediaError::MessageNotFound),
            Err(e) => return Err(e.into()),
        };
        self.media.resolve_message(&message.chat_jid, &message.id).await
    }

    async fn send(
        &self,
        chat: ChatJid,
        content: OutboundContent,
        text: String,
        blob: Option<LocalBlob>,
    ) -> Result<SendOutcome, SendError> {
        let lock = self.send_lock(&chat);
        let result = {
            let _ordered = lock.lock().await;
            self.send_ordered(chat.clone(), content, text, blob).await
        };
        self.release_send_lock(&chat, lock);
        result
    }

    async fn send_ordered(
        &self,
        chat: ChatJid,
        content: OutboundContent,
        text: String,
        blob: Option<LocalBlob>,
    ) -> Result<SendOutcome, SendError> {
        let handle = self.session.handle().map_err(|_| SendError::BridgeUnavailable)?;
        let kind = content.kind();

        let receipt = handle
            .send(OutboundMessage {
                chat: chat.clone(),
                content,
            })
            .await
            .map_err(|e| {
                warn!(chat = %chat, error = %e, "Send failed");
                SendError::from(e)
            })?;

        let locator = match (&blob, receipt.media) {
            (Some(blob), Some(remote)) => Some(merge_locator(remote, &blob.locator)),
            (Some(blob), None) => Some(blob.locator.clone()),
            (None, remote) => remote,
        };

        let message = NewMessage {
            id: receipt.message_id.clone(),
            chat_jid: chat.clone(),
            sender: handle.own_jid().to_non_device(),
            is_from_me: true,
            timestamp: receipt.timestamp,
            kind,
            content: text,
            status: ReceiptStatus::Sent,
            media: locator,
        };
        self.ingest.submit(message).await?;

        if let Some(blob) = blob {
            self.seed_media_cache(&chat, &receipt.message_id, blob).await;
        }

        info!(chat = %chat, id = %receipt.message_id, kind = kind.as_str(), "Message sent");
        Ok(SendOutcome {
            message_id: receipt.message_id,
            chat_jid: chat,
            timestamp: Utc
                .timestamp_millis_opt(receipt.timestamp)
                .single()
                .unwrap_or_else(Utc::now),
            kind,
        })
    }

    /// Keep our own copy of sent media so it can be downloaded without a
    /// round trip. The send already succeeded, so failures only log.
    async fn seed_media_cache(&self, chat: &ChatJid, id: &MessageId, blob: LocalBlob) {
        let stored = match self.media.adopt(blob.data, &blob.ext).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(chat = %chat, id = %id, error = %e, "Could not cache sent media");
                return;
            }
        };
        let (path, hash) = stored;
        let now = self.clock.now_ms();
        if let Err(e) = self
            .db
            .write_batch(|b| b.set_media_local_path(chat, id, &path, &hash, now))
        {
            warn!(chat = %chat, id = %id, error = %e, "Could not record sent media path");
        }
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes, SendError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(SendError::Rejected(format!("{} is not a file", path.display())));
        }
        if meta.len() > self.max_media_bytes as u64 {
            return Err(SendError::Rejected(format!(
                "file is {} bytes, limit is {}",
                meta.len(),
                self.max_media_bytes
            )));
        }
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    fn send_lock(&self, chat: &ChatJid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.send_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(chat.clone()).or_default())
    }

    /// Drop the chat's lock from the map once no other send holds or waits
    /// on it.
    fn release_send_lock(&self, chat: &ChatJid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.send_locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(chat)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(chat);
        }
    }

    /// Chats with a send in flight.
    pub fn active_send_locks(&self) -> usize {
        self.send_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn local_blob(data: Bytes, path: &Path, file_name: Option<&str>, mime_type: &str) -> LocalBlob {
    let locator = MediaLocator {
        file_sha256: Some(STANDARD.encode(Sha256::digest(&data))),
        file_length: Some(data.len() as u64),
        mime_type: Some(mime_type.to_string()),
        file_name: file_name.map(str::to_string),
        ..Default::default()
    };
    let ext = match extension(path) {
        e if e.is_empty() => "bin".to_string(),
        e => e,
    };
    LocalBlob { data, ext, locator }
}

/// Remote upload fields win; our own metadata fills the gaps.
fn merge_locator(mut remote: MediaLocator, local: &MediaLocator) -> MediaLocator {
    remote.file_sha256 = remote.file_sha256.or_else(|| local.file_sha256.clone());
    remote.file_length = remote.file_length.or(local.file_length);
    remote.mime_type = remote.mime_type.or_else(|| local.mime_type.clone());
    remote.file_name = remote.file_name.or_else(|| local.file_name.clone());
    remote
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn mime_for(path: &Path) -> &'static str {
    match extension(path).as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "3gp" => "video/3gpp",
        "ogg" | "opus" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

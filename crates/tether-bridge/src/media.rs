//! Media Store: a content-addressed cache of message media.
//!
//! Blobs live at `<root>/<aa>/<blake3>.<ext>`, where `aa` is the first byte
//! of the hash. A blob is written to a temp file in its shard directory and
//! persisted atomically, so readers never see a partial file. Concurrent
//! resolves of one reference take the same per-reference lock: at most one
//! fetch is in flight and the others reuse its result.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use tether_shared::protocol::MediaLocator;
use tether_shared::{ChatJid, MessageId};
use tether_store::{Database, MediaRef};

use crate::clock::Clock;
use crate::error::MediaError;
use crate::session::SessionManager;

type RefKey = (ChatJid, MessageId);

pub struct MediaStore {
    root: PathBuf,
    db: Database,
    session: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    max_bytes: usize,
    fetch_locks: Mutex<HashMap<RefKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl MediaStore {
    pub async fn new(
        root: PathBuf,
        db: Database,
        session: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        max_bytes: usize,
    ) -> Result<Self, MediaError> {
        fs::create_dir_all(&root).await?;
        info!(path = %root.display(), "Media store initialized");

        Ok(Self {
            root,
            db,
            session,
            clock,
            max_bytes,
            fetch_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path of a message's media, fetching it first if needed.
    pub async fn resolve_message(&self, chat_jid: &ChatJid, message_id: &MessageId) -> Result<PathBuf, MediaError> {
        let media = self
            .db
            .get_media_ref(chat_jid, message_id)?
            .ok_or(MediaError::NoMedia)?;
        self.resolve(&media).await
    }

    /// Local path of the referenced blob. A cached file is returned as is;
    /// otherwise the blob is fetched, verified and stored first.
    pub async fn resolve(&self, media: &MediaRef) -> Result<PathBuf, MediaError> {
        if let Some(path) = cached_path(media).await {
            return Ok(path);
        }

        let key = (media.chat_jid.clone(), media.message_id.clone());
        let lock = self.fetch_lock(&key);
        let result = {
            let _fetching = lock.lock().await;
            // Another resolve may have finished while we waited.
            let current = self
                .db
                .get_media_ref(&media.chat_jid, &media.message_id)?
                .unwrap_or_else(|| media.clone());
            match cached_path(&current).await {
                Some(path) => Ok(path),
                None => self.fetch_and_store(&current).await,
            }
        };
        drop(lock);
        self.release_fetch_lock(&key);
        result
    }

    /// [`resolve`](Self::resolve) bounded by `timeout`. A timed-out resolve
    /// leaves neither a partial file nor a recorded path.
    pub async fn resolve_with_timeout(&self, media: &MediaRef, timeout: Duration) -> Result<PathBuf, MediaError> {
        tokio::time::timeout(timeout, self.resolve(media))
            .await
            .map_err(|_| MediaError::TimedOut)?
    }

    /// Store bytes we produced ourselves (an outgoing file) and return the
    /// blob path and its hash.
    pub async fn adopt(&self, data: Bytes, ext: &str) -> Result<(PathBuf, String), MediaError> {
        self.write_blob(data, ext).await
    }

    /// Drop the cached copy of a reference. The file is deleted once no other
    /// reference shares it.
    pub async fn purge(&self, media: &MediaRef) -> Result<(), MediaError> {
        let Some(path) = media.local_path.clone() else {
            return Ok(());
        };

        self.db
            .write_batch(|b| b.clear_media_local_path(&media.chat_jid, &media.message_id))?;

        if self.db.media_path_users(&path)? == 0 {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed cached media"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn fetch_and_store(&self, media: &MediaRef) -> Result<PathBuf, MediaError> {
        let locator = &media.locator;
        if !locator.is_fetchable() {
            return Err(MediaError::Unavailable("no remote locator".into()));
        }

        let handle = self.session.handle()?;
        debug!(chat = %media.chat_jid, id = %media.message_id, "Fetching media");
        let data = handle.fetch_media(locator).await.map_err(|e| {
            warn!(chat = %media.chat_jid, id = %media.message_id, error = %e, "Media fetch failed");
            MediaError::from(e)
        })?;

        if data.len() > self.max_bytes {
            return Err(MediaError::Unavailable(format!(
                "media is {} bytes, limit is {}",
                data.len(),
                self.max_bytes
            )));
        }
        verify(locator, &data)?;

        let (path, hash) = self.write_blob(data, &extension_for(locator)).await?;
        let now = self.clock.now_ms();
        self.db.write_batch(|b| {
            b.set_media_local_path(&media.chat_jid, &media.message_id, &path, &hash, now)
        })?;

        info!(chat = %media.chat_jid, id = %media.message_id, path = %path.display(), "Media cached");
        Ok(path)
    }

    async fn write_blob(&self, data: Bytes, ext: &str) -> Result<(PathBuf, String), MediaError> {
        let hash = blake3::hash(&data).to_hex().to_string();
        let shard = self.root.join(&hash[..2]);
        let path = shard.join(format!("{hash}.{ext}"));

        if fs::try_exists(&path).await? {
            return Ok((path, hash));
        }
        fs::create_dir_all(&shard).await?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&shard)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| MediaError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        Ok((path, hash))
    }

    fn fetch_lock(&self, key: &RefKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.fetch_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_fetch_lock(&self, key: &RefKey) {
        let mut locks = self.fetch_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

async fn cached_path(media: &MediaRef) -> Option<PathBuf> {
    let path = media.local_path.as_ref()?;
    match fs::try_exists(path).await {
        Ok(true) => Some(path.clone()),
        _ => {
            debug!(path = %path.display(), "Cached media missing on disk, refetching");
            None
        }
    }
}

/// Check the advertised size and plaintext SHA-256 (base64) when present.
fn verify(locator: &MediaLocator, data: &[u8]) -> Result<(), MediaError> {
    if let Some(expected) = locator.file_length {
        if data.len() as u64 != expected {
            return Err(MediaError::IntegrityMismatch(format!(
                "expected {expected} bytes, got {}",
                data.len()
            )));
        }
    }

    if let Some(encoded) = locator.file_sha256.as_deref().filter(|s| !s.is_empty()) {
        let expected = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
            .map_err(|_| MediaError::IntegrityMismatch(format!("unreadable file hash {encoded:?}")))?;
        let actual = Sha256::digest(data);
        if actual.as_slice() != expected.as_slice() {
            return Err(MediaError::IntegrityMismatch("SHA-256 does not match".into()));
        }
    }
    Ok(())
}

/// File extension from the original file name, else from the MIME type.
fn extension_for(locator: &MediaLocator) -> String {
    let from_name = locator
        .file_name
        .as_deref()
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase());
    if let Some(ext) = from_name {
        return ext;
    }

    let mime = locator.mime_type.as_deref().unwrap_or_default();
    let essence = mime.split(';').next().unwrap_or_default().trim();
    match essence {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "application/pdf" => "pdf",
        _ => "bin",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{active_session, ScriptedTransport};
    use tether_shared::{ContentKind, ReceiptStatus, TransportError};
    use tether_store::NewMessage;

    const CHAT: &str = "31600000001@s.whatsapp.net";

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        transport: Arc<ScriptedTransport>,
        store: MediaStore,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let session = active_session(&db, &transport).await;
        let store = MediaStore::new(
            dir.path().join("media"),
            db.clone(),
            session,
            Arc::new(ManualClock::new(10)),
            1024,
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            db,
            transport,
            store,
        }
    }

    fn store_image(db: &Database, id: &str, locator: MediaLocator) -> MediaRef {
        let msg = NewMessage {
            id: MessageId::new(id).unwrap(),
            chat_jid: ChatJid::parse(CHAT).unwrap(),
            sender: ChatJid::parse(CHAT).unwrap(),
            is_from_me: false,
            timestamp: 1_000,
            kind: ContentKind::Image,
            content: String::new(),
            status: ReceiptStatus::Delivered,
            media: Some(locator),
        };
        db.write_batch(|b| b.upsert_message(&msg)).unwrap();
        db.get_media_ref(&msg.chat_jid, &msg.id).unwrap().unwrap()
    }

    fn locator(path: &str, data: &[u8]) -> MediaLocator {
        MediaLocator {
            direct_path: Some(path.into()),
            file_sha256: Some(STANDARD.encode(Sha256::digest(data))),
            file_length: Some(data.len() as u64),
            mime_type: Some("image/jpeg".into()),
            ..Default::default()
        }
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn resolve_fetches_once_then_serves_cache() {
        let fx = fixture().await;
        let data = b"jpeg bytes";
        fx.transport.put_media("/v/1", Ok(Bytes::from_static(data)));
        let media = store_image(&fx.db, "IMG1", locator("/v/1", data));

        let path = fx.store.resolve(&media).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(path.extension().unwrap(), "jpg");
        let hash = blake3::hash(data).to_hex().to_string();
        assert!(path.ends_with(format!("{}/{hash}.jpg", &hash[..2])));

        let again = fx.store.resolve_message(&media.chat_jid, &media.message_id).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(fx.transport.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolves_share_one_fetch() {
        let fx = fixture().await;
        let data = b"shared";
        fx.transport.put_media("/v/2", Ok(Bytes::from_static(data)));
        fx.transport.set_fetch_delay(Duration::from_secs(1));
        let media = store_image(&fx.db, "IMG2", locator("/v/2", data));

        let results = futures::future::join_all((0..5).map(|_| fx.store.resolve(&media))).await;

        assert_eq!(fx.transport.fetches(), 1);
        let first = results[0].as_ref().unwrap();
        assert!(results.iter().all(|r| r.as_ref().unwrap() == first));
    }

    #[tokio::test]
    async fn expired_locator_leaves_nothing_behind() {
        let fx = fixture().await;
        fx.transport
            .put_media("/v/old", Err(TransportError::Expired("url expired".into())));
        let media = store_image(&fx.db, "MSG7", locator("/v/old", b"gone"));

        let err = fx.store.resolve(&media).await.unwrap_err();
        assert!(matches!(err, MediaError::Unavailable(_)));
        assert!(files_under(fx.store.root()).is_empty());
        let media = fx.db.get_media_ref(&media.chat_jid, &media.message_id).unwrap().unwrap();
        assert!(media.local_path.is_none());
    }

    #[tokio::test]
    async fn corrupted_download_is_discarded() {
        let fx = fixture().await;
        fx.transport.put_media("/v/bad", Ok(Bytes::from_static(b"tampered!!")));
        let media = store_image(&fx.db, "BAD", locator("/v/bad", b"original!!"));

        let err = fx.store.resolve(&media).await.unwrap_err();
        assert!(matches!(err, MediaError::IntegrityMismatch(_)));
        assert!(files_under(fx.store.root()).is_empty());

        fx.transport.put_media("/v/short", Ok(Bytes::from_static(b"abc")));
        let mut short = locator("/v/short", b"abc");
        short.file_length = Some(4);
        let media = store_image(&fx.db, "SHORT", short);
        assert!(matches!(
            fx.store.resolve(&media).await,
            Err(MediaError::IntegrityMismatch(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_resolve_leaves_no_file() {
        let fx = fixture().await;
        fx.transport.put_media("/v/slow", Ok(Bytes::from_static(b"slow")));
        fx.transport.set_fetch_delay(Duration::from_secs(30));
        let media = store_image(&fx.db, "SLOW", locator("/v/slow", b"slow"));

        let err = fx
            .store
            .resolve_with_timeout(&media, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::TimedOut));
        assert!(files_under(fx.store.root()).is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_refetched_and_purge_deletes() {
        let fx = fixture().await;
        fx.transport.put_media("/v/3", Ok(Bytes::from_static(b"three")));
        let media = store_image(&fx.db, "IMG3", locator("/v/3", b"three"));

        let path = fx.store.resolve(&media).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        let again = fx.store.resolve_message(&media.chat_jid, &media.message_id).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(fx.transport.fetches(), 2);

        let current = fx.db.get_media_ref(&media.chat_jid, &media.message_id).unwrap().unwrap();
        fx.store.purge(&current).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn message_without_media() {
        let fx = fixture().await;
        let chat = ChatJid::parse(CHAT).unwrap();
        let err = fx
            .store
            .resolve_message(&chat, &MessageId::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NoMedia));
    }

    #[test]
    fn extension_prefers_file_name() {
        let mut locator = MediaLocator {
            mime_type: Some("application/pdf".into()),
            ..Default::default()
        };
        assert_eq!(extension_for(&locator), "pdf");
        locator.file_name = Some("Report.DOCX".into());
        assert_eq!(extension_for(&locator), "docx");
        locator.file_name = Some("../../etc".into());
        locator.mime_type = None;
        assert_eq!(extension_for(&locator), "bin");
    }
}

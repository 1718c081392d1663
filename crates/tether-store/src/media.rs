//! Media references: where a message's blob lives remotely and, once
//! fetched, where it is cached locally.

use std::path::{Path, PathBuf};

use rusqlite::{params, OptionalExtension};

use tether_shared::protocol::MediaLocator;
use tether_shared::{ChatJid, MessageId};

use crate::database::{Batch, Database};
use crate::error::{Result, StoreError};
use crate::models::MediaRef;
use crate::rows::parse_column;

impl Batch<'_> {
    /// Record a message's remote locator. Fields already stored are kept;
    /// a repeat delivery can only fill in blanks.
    pub fn insert_media_ref(
        &self,
        chat_jid: &ChatJid,
        message_id: &MessageId,
        locator: &MediaLocator,
    ) -> Result<()> {
        let file_length = locator.file_length.and_then(|n| i64::try_from(n).ok());

        self.conn().execute(
            "INSERT INTO media_refs
                (chat_jid, message_id, url, direct_path, media_key, file_sha256,
                 file_enc_sha256, file_length, mime_type, file_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(chat_jid, message_id) DO UPDATE SET
                 url             = COALESCE(media_refs.url, excluded.url),
                 direct_path     = COALESCE(media_refs.direct_path, excluded.direct_path),
                 media_key       = COALESCE(media_refs.media_key, excluded.media_key),
                 file_sha256     = COALESCE(media_refs.file_sha256, excluded.file_sha256),
                 file_enc_sha256 = COALESCE(media_refs.file_enc_sha256, excluded.file_enc_sha256),
                 file_length     = COALESCE(media_refs.file_length, excluded.file_length),
                 mime_type       = COALESCE(media_refs.mime_type, excluded.mime_type),
                 file_name       = COALESCE(media_refs.file_name, excluded.file_name)",
            params![
                chat_jid.as_str(),
                message_id.as_str(),
                locator.url,
                locator.direct_path,
                locator.media_key,
                locator.file_sha256,
                locator.file_enc_sha256,
                file_length,
                locator.mime_type,
                locator.file_name,
            ],
        )?;
        Ok(())
    }

    /// Point the reference at a verified local blob.
    pub fn set_media_local_path(
        &self,
        chat_jid: &ChatJid,
        message_id: &MessageId,
        local_path: &Path,
        content_hash: &str,
        fetched_at_ms: i64,
    ) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE media_refs SET local_path = ?3, content_hash = ?4, fetched_at = ?5
             WHERE chat_jid = ?1 AND message_id = ?2",
            params![
                chat_jid.as_str(),
                message_id.as_str(),
                local_path.to_string_lossy(),
                content_hash,
                fetched_at_ms,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Forget the cached blob; the next resolve fetches it again.
    pub fn clear_media_local_path(&self, chat_jid: &ChatJid, message_id: &MessageId) -> Result<()> {
        self.conn().execute(
            "UPDATE media_refs SET local_path = NULL, content_hash = NULL, fetched_at = NULL
             WHERE chat_jid = ?1 AND message_id = ?2",
            params![chat_jid.as_str(), message_id.as_str()],
        )?;
        Ok(())
    }
}

impl Database {
    pub fn get_media_ref(&self, chat_jid: &ChatJid, message_id: &MessageId) -> Result<Option<MediaRef>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT chat_jid, message_id, url, direct_path, media_key, file_sha256,
                            file_enc_sha256, file_length, mime_type, file_name,
                            local_path, content_hash
                     FROM media_refs
                     WHERE chat_jid = ?1 AND message_id = ?2",
                    params![chat_jid.as_str(), message_id.as_str()],
                    row_to_media_ref,
                )
                .optional()?)
        })
    }

    /// How many media references point at a cached file.
    pub fn media_path_users(&self, local_path: &Path) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM media_refs WHERE local_path = ?1",
                params![local_path.to_string_lossy()],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
    }
}

fn row_to_media_ref(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaRef> {
    let chat_str: String = row.get(0)?;
    let id_str: String = row.get(1)?;
    let file_length: Option<i64> = row.get(7)?;
    let local_path: Option<String> = row.get(10)?;

    Ok(MediaRef {
        chat_jid: parse_column(0, &chat_str)?,
        message_id: MessageId::new(id_str).map_err(|e| crate::rows::conversion_error(1, e))?,
        locator: MediaLocator {
            url: row.get(2)?,
            direct_path: row.get(3)?,
            media_key: row.get(4)?,
            file_sha256: row.get(5)?,
            file_enc_sha256: row.get(6)?,
            file_length: file_length.and_then(|n| u64::try_from(n).ok()),
            mime_type: row.get(8)?,
            file_name: row.get(9)?,
        },
        local_path: local_path.map(PathBuf::from),
        content_hash: row.get(11)?,
    })
}

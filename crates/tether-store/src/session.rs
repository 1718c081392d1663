//! The single linked-device session row.

use rusqlite::{params, OptionalExtension};

use tether_shared::protocol::Credentials;

use crate::database::{Batch, Database};
use crate::error::Result;
use crate::models::StoredSession;
use crate::rows::{conversion_error, ms_to_utc, opt_ms_to_utc};

impl Batch<'_> {
    /// Replace the stored session with freshly linked credentials.
    pub fn save_session(&self, credentials: &Credentials, linked_at_ms: i64) -> Result<()> {
        let secret = serde_json::to_string(credentials)?;
        self.conn().execute(
            "INSERT INTO session (id, jid, device_id, credentials, linked_at, last_connected_at, invalidated)
             VALUES (1, ?1, ?2, ?3, ?4, NULL, 0)
             ON CONFLICT(id) DO UPDATE SET
                 jid = excluded.jid,
                 device_id = excluded.device_id,
                 credentials = excluded.credentials,
                 linked_at = excluded.linked_at,
                 last_connected_at = NULL,
                 invalidated = 0",
            params![credentials.jid.as_str(), credentials.device_id, secret, linked_at_ms],
        )?;
        Ok(())
    }

    pub fn mark_session_connected(&self, at_ms: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE session SET last_connected_at = ?1 WHERE id = 1 AND invalidated = 0",
            params![at_ms],
        )?;
        Ok(())
    }

    /// Credentials were rejected or the device was unlinked. The row stays
    /// for diagnostics but is never loaded again. Sync cursors belong to the
    /// old link's history numbering and are cleared with it.
    pub fn invalidate_session(&self) -> Result<()> {
        self.conn()
            .execute("UPDATE session SET invalidated = 1 WHERE id = 1", [])?;
        self.conn().execute("DELETE FROM sync_cursors", [])?;
        Ok(())
    }
}

impl Database {
    /// The active session, if one is linked and still valid.
    pub fn load_session(&self) -> Result<Option<StoredSession>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT credentials, linked_at, last_connected_at
                     FROM session WHERE id = 1 AND invalidated = 0",
                    [],
                    |row| {
                        let raw: String = row.get(0)?;
                        Ok(StoredSession {
                            credentials: serde_json::from_str(&raw)
                                .map_err(|e| conversion_error(0, e))?,
                            linked_at: ms_to_utc(1, row.get(1)?)?,
                            last_connected_at: opt_ms_to_utc(2, row.get(2)?)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

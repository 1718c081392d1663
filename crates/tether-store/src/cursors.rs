//! History-sync cursors. A cursor never moves backwards.

use rusqlite::{params, OptionalExtension};

use crate::database::{Batch, Database};
use crate::error::Result;
use crate::models::SyncCursor;
use crate::rows::{ms_to_utc, opt_ms_to_utc};

impl Batch<'_> {
    /// Move `scope` forward to `position`. Returns `false` when the stored
    /// cursor is already at or past it.
    pub fn advance_cursor(
        &self,
        scope: &str,
        position: u64,
        last_timestamp_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<bool> {
        let position = i64::try_from(position).unwrap_or(i64::MAX);
        let changed = self.conn().execute(
            "INSERT INTO sync_cursors (scope, position, last_timestamp, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope) DO UPDATE SET
                 position = excluded.position,
                 last_timestamp = COALESCE(excluded.last_timestamp, sync_cursors.last_timestamp),
                 updated_at = excluded.updated_at
             WHERE excluded.position > sync_cursors.position",
            params![scope, position, last_timestamp_ms, now_ms],
        )?;
        Ok(changed > 0)
    }
}

impl Database {
    pub fn get_cursor(&self, scope: &str) -> Result<Option<SyncCursor>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT scope, position, last_timestamp, updated_at
                     FROM sync_cursors WHERE scope = ?1",
                    params![scope],
                    row_to_cursor,
                )
                .optional()?)
        })
    }

    /// Every committed cursor, used to resume backfill after a reconnect.
    pub fn list_cursors(&self) -> Result<Vec<SyncCursor>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT scope, position, last_timestamp, updated_at
                 FROM sync_cursors ORDER BY scope",
            )?;
            let rows = stmt.query_map([], row_to_cursor)?;

            let mut cursors = Vec::new();
            for row in rows {
                cursors.push(row?);
            }
            Ok(cursors)
        })
    }
}

fn row_to_cursor(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncCursor> {
    let position: i64 = row.get(1)?;
    Ok(SyncCursor {
        scope: row.get(0)?,
        position: u64::try_from(position).unwrap_or_default(),
        last_timestamp: opt_ms_to_utc(2, row.get(2)?)?,
        updated_at: ms_to_utc(3, row.get(3)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_monotonic() {
        let db = Database::in_memory().unwrap();
        let chat = "31600000001@s.whatsapp.net";

        assert!(db.write_batch(|b| b.advance_cursor(chat, 3, Some(3_000), 10)).unwrap());
        assert!(!db.write_batch(|b| b.advance_cursor(chat, 2, Some(2_000), 20)).unwrap());
        assert!(!db.write_batch(|b| b.advance_cursor(chat, 3, None, 30)).unwrap());

        let cursor = db.get_cursor(chat).unwrap().unwrap();
        assert_eq!(cursor.position, 3);
        assert_eq!(cursor.last_timestamp.map(|t| t.timestamp_millis()), Some(3_000));

        assert!(db.write_batch(|b| b.advance_cursor(chat, 5, None, 40)).unwrap());
        let cursor = db.get_cursor(chat).unwrap().unwrap();
        assert_eq!(cursor.position, 5);
        assert_eq!(cursor.last_timestamp.map(|t| t.timestamp_millis()), Some(3_000));
    }

    #[test]
    fn lists_all_scopes() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| {
            b.advance_cursor("*", 7, None, 1)?;
            b.advance_cursor("120363000000000001@g.us", 2, None, 1)?;
            Ok(())
        })
        .unwrap();

        let scopes: Vec<_> = db.list_cursors().unwrap().into_iter().map(|c| c.scope).collect();
        assert_eq!(scopes, ["*", "120363000000000001@g.us"]);
        assert!(db.get_cursor("missing").unwrap().is_none());
    }
}

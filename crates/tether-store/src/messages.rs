//! Message rows: idempotent upserts, receipts and the message read queries.
//!
//! Messages are immutable once stored. Re-ingesting a known `(chat, id)`
//! only advances its status; a body is written once and never replaced.
//! Listings are ordered by `(timestamp, seq)`, never by arrival order.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use tether_shared::constants::MAX_PAGE_SIZE;
use tether_shared::{ChatJid, ContentKind, MessageId, ReceiptStatus};

use crate::database::{Batch, Database};
use crate::error::{Result, StoreError};
use crate::models::{Message, MessageContext, MessageFilter, NewMessage, ReceiptOutcome, UpsertOutcome};
use crate::rows::{escape_like, like_pattern, ms_to_utc, parse_column};

const MESSAGE_SELECT: &str = "
    SELECT m.id, m.chat_jid, COALESCE(c.name, ct.full_name, ct.push_name), m.sender,
           m.is_from_me, m.timestamp, m.kind, m.content, m.status, m.seq
    FROM messages m
    JOIN chats c ON c.jid = m.chat_jid
    LEFT JOIN contacts ct ON ct.jid = c.jid";

impl Batch<'_> {
    /// Insert a message, or fold a repeat delivery of it into the stored row.
    pub fn upsert_message(&self, msg: &NewMessage) -> Result<UpsertOutcome> {
        self.touch_chat(&msg.chat_jid, None, Some(msg.timestamp))?;

        let conn = self.conn();
        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT status, content FROM messages WHERE chat_jid = ?1 AND id = ?2",
                params![msg.chat_jid.as_str(), msg.id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                let parked: Option<(i64, i64)> = conn
                    .query_row(
                        "SELECT status, updated_at FROM pending_receipts
                         WHERE chat_jid = ?1 AND message_id = ?2",
                        params![msg.chat_jid.as_str(), msg.id.as_str()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                let (status, status_at) = match parked {
                    Some((rank, at)) if rank > msg.status.rank() => (rank, at),
                    _ => (msg.status.rank(), msg.timestamp),
                };
                if parked.is_some() {
                    conn.execute(
                        "DELETE FROM pending_receipts WHERE chat_jid = ?1 AND message_id = ?2",
                        params![msg.chat_jid.as_str(), msg.id.as_str()],
                    )?;
                }

                conn.execute(
                    "INSERT INTO messages
                        (id, chat_jid, sender, is_from_me, timestamp, kind, content, status, status_updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        msg.id.as_str(),
                        msg.chat_jid.as_str(),
                        msg.sender.as_str(),
                        msg.is_from_me,
                        msg.timestamp,
                        msg.kind.as_str(),
                        msg.content,
                        status,
                        status_at,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
            Some((stored_status, stored_content)) => {
                let mut outcome = UpsertOutcome::Unchanged;
                if msg.status.rank() > stored_status {
                    conn.execute(
                        "UPDATE messages SET status = ?3, status_updated_at = ?4
                         WHERE chat_jid = ?1 AND id = ?2",
                        params![msg.chat_jid.as_str(), msg.id.as_str(), msg.status.rank(), msg.timestamp],
                    )?;
                    outcome = UpsertOutcome::StatusAdvanced;
                }
                // An earlier delivery without a body (e.g. a bare echo) may be completed once.
                if stored_content.is_empty() && !msg.content.is_empty() {
                    conn.execute(
                        "UPDATE messages SET content = ?3 WHERE chat_jid = ?1 AND id = ?2",
                        params![msg.chat_jid.as_str(), msg.id.as_str(), msg.content],
                    )?;
                }
                outcome
            }
        };

        if let Some(locator) = &msg.media {
            self.insert_media_ref(&msg.chat_jid, &msg.id, locator)?;
        }

        Ok(outcome)
    }

    /// Advance a message's status. A receipt for a message that has not been
    /// stored yet is parked and applied when the message arrives.
    pub fn apply_receipt(
        &self,
        chat_jid: &ChatJid,
        message_id: &MessageId,
        status: ReceiptStatus,
        timestamp_ms: i64,
    ) -> Result<ReceiptOutcome> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE messages SET status = ?3, status_updated_at = ?4
             WHERE chat_jid = ?1 AND id = ?2 AND status < ?3",
            params![chat_jid.as_str(), message_id.as_str(), status.rank(), timestamp_ms],
        )?;
        if updated > 0 {
            return Ok(ReceiptOutcome::Advanced);
        }

        let exists = conn
            .query_row(
                "SELECT 1 FROM messages WHERE chat_jid = ?1 AND id = ?2",
                params![chat_jid.as_str(), message_id.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(ReceiptOutcome::Unchanged);
        }

        conn.execute(
            "INSERT INTO pending_receipts (chat_jid, message_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_jid, message_id) DO UPDATE SET
                 status = MAX(pending_receipts.status, excluded.status),
                 updated_at = CASE WHEN excluded.status > pending_receipts.status
                                   THEN excluded.updated_at ELSE pending_receipts.updated_at END",
            params![chat_jid.as_str(), message_id.as_str(), status.rank(), timestamp_ms],
        )?;
        Ok(ReceiptOutcome::Parked)
    }

    /// Forget parked receipts last updated before `older_than_ms`; their
    /// message is not coming. Returns how many were dropped.
    pub fn prune_pending_receipts(&self, older_than_ms: i64) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM pending_receipts WHERE updated_at < ?1",
            params![older_than_ms],
        )?)
    }
}

impl Database {
    pub fn get_message(&self, chat_jid: &ChatJid, id: &MessageId) -> Result<Message> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{MESSAGE_SELECT} WHERE m.chat_jid = ?1 AND m.id = ?2"),
                params![chat_jid.as_str(), id.as_str()],
                row_to_message,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    /// Look a message up by id alone, or by id within one chat. Ids are only
    /// unique per chat; without a chat the newest match wins.
    pub fn find_message(&self, id: &MessageId, chat_jid: Option<&ChatJid>) -> Result<Message> {
        if let Some(chat) = chat_jid {
            return self.get_message(chat, id);
        }
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1 ORDER BY m.timestamp DESC, m.seq DESC LIMIT 1"),
                params![id.as_str()],
                row_to_message,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    /// Messages matching every set filter field.
    ///
    /// Pages are counted from the newest message backwards; the messages
    /// within a page are returned in ascending `(timestamp, seq)` order.
    pub fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(after) = filter.after {
            clauses.push("m.timestamp > ?");
            values.push(Value::Integer(after.timestamp_millis()));
        }
        if let Some(before) = filter.before {
            clauses.push("m.timestamp < ?");
            values.push(Value::Integer(before.timestamp_millis()));
        }
        if let Some(sender) = filter.sender.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            match ChatJid::parse(sender) {
                Ok(jid) => {
                    clauses.push("m.sender = ?");
                    values.push(Value::Text(jid.to_non_device().to_string()));
                }
                Err(_) => {
                    clauses.push("m.sender LIKE ? ESCAPE '\\'");
                    let user = sender.trim_start_matches('+');
                    values.push(Value::Text(format!("{}@%", escape_like(user))));
                }
            }
        }
        if let Some(chat) = &filter.chat_jid {
            clauses.push("m.chat_jid = ?");
            values.push(Value::Text(chat.to_string()));
        }
        if let Some(query) = filter.query.as_deref().filter(|q| !q.trim().is_empty()) {
            clauses.push("LOWER(m.content) LIKE ? ESCAPE '\\'");
            values.push(Value::Text(like_pattern(query)));
        }
        if let Some(kind) = filter.kind {
            clauses.push("m.kind = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }

        let limit = filter.limit.min(MAX_PAGE_SIZE);
        values.push(Value::Integer(i64::from(limit)));
        values.push(Value::Integer(i64::from(filter.page) * i64::from(limit)));

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "{MESSAGE_SELECT} {where_sql}
             ORDER BY m.timestamp DESC, m.seq DESC
             LIMIT ? OFFSET ?"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_message)?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            messages.reverse();
            Ok(messages)
        })
    }

    /// A message with up to `before` / `after` neighbours from the same chat.
    pub fn message_context(
        &self,
        chat_jid: &ChatJid,
        id: &MessageId,
        before: u32,
        after: u32,
    ) -> Result<MessageContext> {
        let message = self.get_message(chat_jid, id)?;
        let ts = message.timestamp.timestamp_millis();

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.chat_jid = ?1 AND (m.timestamp < ?2 OR (m.timestamp = ?2 AND m.seq < ?3))
                 ORDER BY m.timestamp DESC, m.seq DESC
                 LIMIT ?4"
            ))?;
            let mut earlier = stmt
                .query_map(params![chat_jid.as_str(), ts, message.seq, before.min(MAX_PAGE_SIZE)], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            earlier.reverse();

            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.chat_jid = ?1 AND (m.timestamp > ?2 OR (m.timestamp = ?2 AND m.seq > ?3))
                 ORDER BY m.timestamp ASC, m.seq ASC
                 LIMIT ?4"
            ))?;
            let later = stmt
                .query_map(params![chat_jid.as_str(), ts, message.seq, after.min(MAX_PAGE_SIZE)], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(MessageContext {
                message: message.clone(),
                before: earlier,
                after: later,
            })
        })
    }

    /// Most recent message in the contact's direct chat or sent by it anywhere.
    pub fn last_interaction(&self, jid: &ChatJid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "{MESSAGE_SELECT}
                         WHERE m.chat_jid = ?1 OR m.sender = ?1
                         ORDER BY m.timestamp DESC, m.seq DESC
                         LIMIT 1"
                    ),
                    params![jid.as_str()],
                    row_to_message,
                )
                .optional()?)
        })
    }

    pub fn last_message_in_chat(&self, chat_jid: &ChatJid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_last_message(conn, chat_jid))
    }
}

pub(crate) fn query_last_message(conn: &Connection, chat_jid: &ChatJid) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!(
                "{MESSAGE_SELECT}
                 WHERE m.chat_jid = ?1
                 ORDER BY m.timestamp DESC, m.seq DESC
                 LIMIT 1"
            ),
            params![chat_jid.as_str()],
            row_to_message,
        )
        .optional()?)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let chat_str: String = row.get(1)?;
    let chat_name: Option<String> = row.get(2)?;
    let sender_str: String = row.get(3)?;
    let is_from_me: bool = row.get(4)?;
    let ts_ms: i64 = row.get(5)?;
    let kind_str: String = row.get(6)?;
    let content: String = row.get(7)?;
    let status_rank: i64 = row.get(8)?;
    let seq: i64 = row.get(9)?;

    let status = ReceiptStatus::from_rank(status_rank)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(8, status_rank))?;

    Ok(Message {
        id: MessageId::new(id_str).map_err(|e| crate::rows::conversion_error(0, e))?,
        chat_jid: parse_column(1, &chat_str)?,
        chat_name,
        sender: parse_column(3, &sender_str)?,
        is_from_me,
        timestamp: ms_to_utc(5, ts_ms)?,
        kind: parse_column::<ContentKind>(6, &kind_str)?,
        content,
        status,
        seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn jid(s: &str) -> ChatJid {
        ChatJid::parse(s).unwrap()
    }

    fn text(chat: &str, id: &str, ts: i64, body: &str) -> NewMessage {
        NewMessage {
            id: MessageId::new(id).unwrap(),
            chat_jid: jid(chat),
            sender: jid("31600000009@s.whatsapp.net"),
            is_from_me: false,
            timestamp: ts,
            kind: ContentKind::Text,
            content: body.to_string(),
            status: ReceiptStatus::Delivered,
            media: None,
        }
    }

    const CHAT: &str = "31600000001@s.whatsapp.net";

    #[test]
    fn reingesting_updates_status_only() {
        let db = Database::in_memory().unwrap();
        let first = text(CHAT, "M1", 1_000, "hello");
        assert_eq!(db.write_batch(|b| b.upsert_message(&first)).unwrap(), UpsertOutcome::Inserted);

        let mut again = first.clone();
        again.content = "tampered".into();
        again.status = ReceiptStatus::Read;
        assert_eq!(db.write_batch(|b| b.upsert_message(&again)).unwrap(), UpsertOutcome::StatusAdvanced);
        assert_eq!(db.write_batch(|b| b.upsert_message(&first)).unwrap(), UpsertOutcome::Unchanged);

        let all = db.list_messages(&MessageFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "hello");
        assert_eq!(all[0].status, ReceiptStatus::Read);
    }

    #[test]
    fn listing_orders_by_timestamp_then_insertion() {
        let db = Database::in_memory().unwrap();
        // Arrival order differs from timestamp order, with a tie at 2_000.
        for (id, ts) in [("C", 3_000), ("B2", 2_000), ("A", 1_000), ("B1", 2_000)] {
            db.write_batch(|b| b.upsert_message(&text(CHAT, id, ts, id))).unwrap();
        }

        let ids: Vec<_> = db
            .list_messages(&MessageFilter::default())
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, ["A", "B2", "B1", "C"]);
    }

    #[test]
    fn receipt_before_message_is_parked() {
        let db = Database::in_memory().unwrap();
        let chat = jid(CHAT);
        let id = MessageId::new("EARLY").unwrap();

        let outcome = db
            .write_batch(|b| b.apply_receipt(&chat, &id, ReceiptStatus::Read, 5_000))
            .unwrap();
        assert_eq!(outcome, ReceiptOutcome::Parked);

        db.write_batch(|b| b.upsert_message(&text(CHAT, "EARLY", 4_000, "hi"))).unwrap();
        assert_eq!(db.get_message(&chat, &id).unwrap().status, ReceiptStatus::Read);

        let stale = db
            .write_batch(|b| b.apply_receipt(&chat, &id, ReceiptStatus::Delivered, 6_000))
            .unwrap();
        assert_eq!(stale, ReceiptOutcome::Unchanged);
    }

    #[test]
    fn stale_parked_receipts_are_pruned() {
        let db = Database::in_memory().unwrap();
        let chat = jid(CHAT);
        for (id, ts) in [("OLD", 1_000), ("FRESH", 9_000)] {
            db.write_batch(|b| b.apply_receipt(&chat, &MessageId::new(id).unwrap(), ReceiptStatus::Read, ts))
                .unwrap();
        }

        assert_eq!(db.write_batch(|b| b.prune_pending_receipts(5_000)).unwrap(), 1);

        db.write_batch(|b| {
            b.upsert_message(&text(CHAT, "OLD", 500, "late"))?;
            b.upsert_message(&text(CHAT, "FRESH", 8_000, "late"))
        })
        .unwrap();
        let status = |id: &str| db.get_message(&chat, &MessageId::new(id).unwrap()).unwrap().status;
        assert_eq!(status("OLD"), ReceiptStatus::Delivered);
        assert_eq!(status("FRESH"), ReceiptStatus::Read);
    }

    #[test]
    fn filters_combine() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| {
            b.upsert_message(&text(CHAT, "1", 1_000, "Dinner at eight?"))?;
            b.upsert_message(&text(CHAT, "2", 2_000, "sure"))?;
            b.upsert_message(&text("120363000000000001@g.us", "3", 3_000, "dinner plans"))?;
            Ok(())
        })
        .unwrap();

        let hits = db
            .list_messages(&MessageFilter { query: Some("DINNER".into()), ..Default::default() })
            .unwrap();
        assert_eq!(hits.len(), 2);

        let in_chat = db
            .list_messages(&MessageFilter {
                query: Some("dinner".into()),
                chat_jid: Some(jid(CHAT)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(in_chat.len(), 1);

        let window = db
            .list_messages(&MessageFilter {
                after: Some(Utc.timestamp_millis_opt(1_000).unwrap()),
                before: Some(Utc.timestamp_millis_opt(3_000).unwrap()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "sure");

        let by_phone = db
            .list_messages(&MessageFilter { sender: Some("+31600000009".into()), ..Default::default() })
            .unwrap();
        assert_eq!(by_phone.len(), 3);
    }

    #[test]
    fn pages_count_back_from_newest() {
        let db = Database::in_memory().unwrap();
        for i in 0..5 {
            db.write_batch(|b| b.upsert_message(&text(CHAT, &format!("m{i}"), i * 10, "x"))).unwrap();
        }
        let page = |page| {
            db.list_messages(&MessageFilter { limit: 2, page, ..Default::default() })
                .unwrap()
                .into_iter()
                .map(|m| m.id.to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(page(0), ["m3", "m4"]);
        assert_eq!(page(1), ["m1", "m2"]);
        assert_eq!(page(2), ["m0"]);
    }

    #[test]
    fn context_surrounds_message() {
        let db = Database::in_memory().unwrap();
        for i in 0..6 {
            db.write_batch(|b| b.upsert_message(&text(CHAT, &format!("m{i}"), i * 10, "x"))).unwrap();
        }
        let ctx = db
            .message_context(&jid(CHAT), &MessageId::new("m3").unwrap(), 2, 1)
            .unwrap();
        let ids = |v: &[Message]| v.iter().map(|m| m.id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids(&ctx.before), ["m1", "m2"]);
        assert_eq!(ctx.message.id.as_str(), "m3");
        assert_eq!(ids(&ctx.after), ["m4"]);
    }

    #[test]
    fn last_interaction_covers_groups() {
        let db = Database::in_memory().unwrap();
        let group = "120363000000000001@g.us";
        db.write_batch(|b| {
            b.upsert_message(&text(CHAT, "1", 1_000, "direct"))?;
            b.upsert_message(&text(group, "2", 2_000, "in group"))?;
            Ok(())
        })
        .unwrap();

        let last = db
            .last_interaction(&jid("31600000009@s.whatsapp.net"))
            .unwrap()
            .unwrap();
        assert_eq!(last.content, "in group");
        assert!(db.last_interaction(&jid("999999@s.whatsapp.net")).unwrap().is_none());
    }
}

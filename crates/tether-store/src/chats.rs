//! Chat records: creation on first sight, activity tracking, metadata
//! (last-writer-wins) and the chat-level read queries.

use rusqlite::{params, Connection, OptionalExtension};

use tether_shared::constants::{GROUP_SERVER, MAX_PAGE_SIZE};
use tether_shared::{ChatJid, ChatKind};

use crate::database::{Batch, Database};
use crate::error::{Result, StoreError};
use crate::messages::query_last_message;
use crate::models::{Chat, ChatFilter, ChatSort, ChatSummary};
use crate::rows::{conversion_error, escape_like, like_pattern, opt_ms_to_utc, parse_column};

const CHAT_SELECT: &str = "
    SELECT c.jid, COALESCE(c.name, ct.full_name, ct.push_name), c.kind,
           c.last_message_time, c.participants
    FROM chats c
    LEFT JOIN contacts ct ON ct.jid = c.jid";

impl Batch<'_> {
    /// Create the chat if needed and move its activity clock forward.
    ///
    /// `name_hint` only fills a missing name; explicit metadata events own the
    /// name afterwards.
    pub fn touch_chat(
        &self,
        jid: &ChatJid,
        name_hint: Option<&str>,
        activity_ms: Option<i64>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO chats (jid, name, kind, last_message_time)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(jid) DO UPDATE SET
                 name = COALESCE(chats.name, excluded.name),
                 last_message_time = CASE
                     WHEN chats.last_message_time IS NULL
                          OR excluded.last_message_time > chats.last_message_time
                     THEN excluded.last_message_time
                     ELSE chats.last_message_time
                 END",
            params![
                jid.as_str(),
                name_hint.filter(|n| !n.trim().is_empty()),
                jid.kind().as_str(),
                activity_ms,
            ],
        )?;
        Ok(())
    }

    /// Apply a name / participant change. Older events than the one already
    /// applied are ignored; returns whether this one took effect.
    pub fn apply_chat_metadata(
        &self,
        jid: &ChatJid,
        name: Option<&str>,
        participants: Option<&[ChatJid]>,
        timestamp_ms: i64,
    ) -> Result<bool> {
        let seen: Option<i64> = self
            .conn()
            .query_row(
                "SELECT metadata_updated_at FROM chats WHERE jid = ?1",
                params![jid.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if matches!(seen, Some(seen) if seen > timestamp_ms) {
            return Ok(false);
        }

        let participants_json = participants.map(serde_json::to_string).transpose()?;

        self.conn().execute(
            "INSERT INTO chats (jid, name, kind, participants, metadata_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(jid) DO UPDATE SET
                 name = COALESCE(excluded.name, chats.name),
                 participants = COALESCE(excluded.participants, chats.participants),
                 metadata_updated_at = excluded.metadata_updated_at",
            params![
                jid.as_str(),
                name.filter(|n| !n.trim().is_empty()),
                jid.kind().as_str(),
                participants_json,
                timestamp_ms,
            ],
        )?;
        Ok(true)
    }
}

impl Database {
    pub fn chat_exists(&self, jid: &ChatJid) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM chats WHERE jid = ?1",
                    params![jid.as_str()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn get_chat(&self, jid: &ChatJid, include_last_message: bool) -> Result<ChatSummary> {
        self.with_conn(|conn| {
            let chat = conn
                .query_row(
                    &format!("{CHAT_SELECT} WHERE c.jid = ?1"),
                    params![jid.as_str()],
                    row_to_chat,
                )
                .optional()?
                .ok_or(StoreError::NotFound)?;
            summarize(conn, chat, include_last_message)
        })
    }

    /// Chats matching the filter, most recently active first by default.
    pub fn list_chats(&self, filter: &ChatFilter) -> Result<Vec<ChatSummary>> {
        let order = match filter.sort_by {
            ChatSort::LastActive => "c.last_message_time IS NULL, c.last_message_time DESC, c.jid",
            ChatSort::Name => "COALESCE(c.name, ct.full_name, ct.push_name) IS NULL,
                               LOWER(COALESCE(c.name, ct.full_name, ct.push_name)), c.jid",
        };
        let sql = format!(
            "{CHAT_SELECT}
             WHERE ?1 IS NULL
                OR LOWER(COALESCE(c.name, ct.full_name, ct.push_name, '')) LIKE ?1 ESCAPE '\\'
                OR LOWER(c.jid) LIKE ?1 ESCAPE '\\'
             ORDER BY {order}
             LIMIT ?2 OFFSET ?3"
        );
        let pattern = filter.query.as_deref().filter(|q| !q.trim().is_empty()).map(like_pattern);
        let limit = filter.limit.min(MAX_PAGE_SIZE);
        let offset = filter.page.saturating_mul(limit);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![pattern, limit, offset], row_to_chat)?;

            let mut chats = Vec::new();
            for row in rows {
                chats.push(summarize(conn, row?, filter.include_last_message)?);
            }
            Ok(chats)
        })
    }

    /// The direct chat whose JID contains `phone`, most recently active first.
    pub fn direct_chat_by_contact(&self, phone: &str) -> Result<ChatSummary> {
        let digits = phone.trim().trim_start_matches('+');
        let pattern = format!("%{}%", escape_like(digits));
        let group_pattern = format!("%@{GROUP_SERVER}");

        self.with_conn(|conn| {
            let chat = conn
                .query_row(
                    &format!(
                        "{CHAT_SELECT}
                         WHERE c.jid LIKE ?1 ESCAPE '\\' AND c.jid NOT LIKE ?2
                         ORDER BY c.last_message_time IS NULL, c.last_message_time DESC
                         LIMIT 1"
                    ),
                    params![pattern, group_pattern],
                    row_to_chat,
                )
                .optional()?
                .ok_or(StoreError::NotFound)?;
            summarize(conn, chat, true)
        })
    }

    /// Every chat the contact takes part in: its direct chat plus any group
    /// where it has sent a message.
    pub fn contact_chats(&self, jid: &ChatJid, limit: u32, page: u32) -> Result<Vec<Chat>> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let offset = page.saturating_mul(limit);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{CHAT_SELECT}
                 WHERE c.jid = ?1
                    OR EXISTS (SELECT 1 FROM messages m WHERE m.chat_jid = c.jid AND m.sender = ?1)
                 ORDER BY c.last_message_time IS NULL, c.last_message_time DESC, c.jid
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![jid.as_str(), limit, offset], row_to_chat)?;

            let mut chats = Vec::new();
            for row in rows {
                chats.push(row?);
            }
            Ok(chats)
        })
    }
}

fn summarize(conn: &Connection, chat: Chat, include_last_message: bool) -> Result<ChatSummary> {
    let last_message = if include_last_message {
        query_last_message(conn, &chat.jid)?
    } else {
        None
    };
    Ok(ChatSummary { chat, last_message })
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let jid_str: String = row.get(0)?;
    let name: Option<String> = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let last_ms: Option<i64> = row.get(3)?;
    let participants_json: Option<String> = row.get(4)?;

    let participants: Vec<ChatJid> = match participants_json {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| conversion_error(4, e))?,
        None => Vec::new(),
    };

    Ok(Chat {
        jid: parse_column(0, &jid_str)?,
        name,
        kind: parse_column::<ChatKind>(2, &kind_str)?,
        last_message_time: opt_ms_to_utc(3, last_ms)?,
        participants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> ChatJid {
        ChatJid::parse(s).unwrap()
    }

    #[test]
    fn touch_creates_then_only_moves_forward() {
        let db = Database::in_memory().unwrap();
        let chat = jid("31600000001@s.whatsapp.net");

        db.write_batch(|b| b.touch_chat(&chat, Some("Alice"), Some(2_000))).unwrap();
        db.write_batch(|b| b.touch_chat(&chat, Some("Mallory"), Some(1_000))).unwrap();

        let summary = db.get_chat(&chat, false).unwrap();
        assert_eq!(summary.chat.name.as_deref(), Some("Alice"));
        assert_eq!(summary.chat.last_message_time.unwrap().timestamp_millis(), 2_000);
        assert_eq!(summary.chat.kind, ChatKind::Direct);
    }

    #[test]
    fn metadata_is_last_writer_wins() {
        let db = Database::in_memory().unwrap();
        let group = jid("120363000000000001@g.us");

        assert!(db
            .write_batch(|b| b.apply_chat_metadata(&group, Some("Trip 2025"), None, 200))
            .unwrap());
        // A delayed older rename must not clobber the newer one.
        assert!(!db
            .write_batch(|b| b.apply_chat_metadata(&group, Some("Trip"), None, 100))
            .unwrap());

        let chat = db.get_chat(&group, false).unwrap().chat;
        assert_eq!(chat.name.as_deref(), Some("Trip 2025"));
        assert_eq!(chat.kind, ChatKind::Group);
        assert!(chat.last_message_time.is_none());
    }

    #[test]
    fn list_chats_sorts_and_filters() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| {
            b.touch_chat(&jid("1111111@s.whatsapp.net"), Some("Zoe"), Some(10))?;
            b.touch_chat(&jid("2222222@s.whatsapp.net"), Some("Adam"), Some(30))?;
            b.touch_chat(&jid("3333333@g.us"), Some("Dance class"), Some(20))
        })
        .unwrap();

        let by_activity = db.list_chats(&ChatFilter::default()).unwrap();
        let names: Vec<_> = by_activity.iter().map(|c| c.chat.name.clone().unwrap()).collect();
        assert_eq!(names, ["Adam", "Dance class", "Zoe"]);

        let by_name = db
            .list_chats(&ChatFilter { sort_by: ChatSort::Name, ..Default::default() })
            .unwrap();
        assert_eq!(by_name[0].chat.name.as_deref(), Some("Adam"));
        assert_eq!(by_name[2].chat.name.as_deref(), Some("Zoe"));

        let filtered = db
            .list_chats(&ChatFilter { query: Some("DANCE".into()), ..Default::default() })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].chat.jid.is_group());
    }

    #[test]
    fn missing_chat_is_not_found() {
        let db = Database::in_memory().unwrap();
        let err = db.get_chat(&jid("404@s.whatsapp.net"), true).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn direct_chat_found_by_phone() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| {
            b.touch_chat(&jid("31600000001@s.whatsapp.net"), Some("Alice"), Some(10))?;
            b.touch_chat(&jid("31600000001-1600000000@g.us"), Some("Old group"), Some(20))
        })
        .unwrap();

        let found = db.direct_chat_by_contact("+31600000001").unwrap();
        assert_eq!(found.chat.jid.as_str(), "31600000001@s.whatsapp.net");
        assert!(matches!(db.direct_chat_by_contact("999"), Err(StoreError::NotFound)));
    }
}

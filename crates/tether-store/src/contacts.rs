//! Contact names learned from the protocol, and contact search.

use rusqlite::params;

use tether_shared::constants::GROUP_SERVER;
use tether_shared::ChatJid;

use crate::database::{Batch, Database};
use crate::error::Result;
use crate::models::Contact;
use crate::rows::{like_pattern, parse_column};

const SEARCH_LIMIT: u32 = 50;

impl Batch<'_> {
    /// Record a contact's names. Last writer wins by event timestamp; a
    /// missing name in a newer event keeps the older one.
    pub fn upsert_contact(
        &self,
        jid: &ChatJid,
        push_name: Option<&str>,
        full_name: Option<&str>,
        timestamp_ms: i64,
    ) -> Result<bool> {
        let jid = jid.to_non_device();
        let changed = self.conn().execute(
            "INSERT INTO contacts (jid, push_name, full_name, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(jid) DO UPDATE SET
                 push_name  = COALESCE(excluded.push_name, contacts.push_name),
                 full_name  = COALESCE(excluded.full_name, contacts.full_name),
                 updated_at = excluded.updated_at
             WHERE excluded.updated_at >= contacts.updated_at",
            params![
                jid.as_str(),
                push_name.filter(|n| !n.trim().is_empty()),
                full_name.filter(|n| !n.trim().is_empty()),
                timestamp_ms,
            ],
        )?;
        Ok(changed > 0)
    }
}

impl Database {
    /// People (never groups) whose name or number contains `query`, drawn
    /// from known contacts and direct chats.
    pub fn search_contacts(&self, query: &str) -> Result<Vec<Contact>> {
        let pattern = like_pattern(query);
        let group_pattern = format!("%@{GROUP_SERVER}");

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT jid, MAX(name) FROM (
                     SELECT c.jid AS jid, COALESCE(c.name, ct.full_name, ct.push_name) AS name
                     FROM chats c LEFT JOIN contacts ct ON ct.jid = c.jid
                     UNION ALL
                     SELECT ct.jid, COALESCE(ct.full_name, ct.push_name)
                     FROM contacts ct
                 )
                 WHERE jid NOT LIKE ?2
                   AND (LOWER(COALESCE(name, '')) LIKE ?1 ESCAPE '\\' OR LOWER(jid) LIKE ?1 ESCAPE '\\')
                 GROUP BY jid
                 ORDER BY MAX(name) IS NULL, LOWER(MAX(name)), jid
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![pattern, group_pattern, SEARCH_LIMIT], |row| {
                let jid_str: String = row.get(0)?;
                let jid: ChatJid = parse_column(0, &jid_str)?;
                Ok(Contact {
                    phone_number: jid.user().to_string(),
                    name: row.get(1)?,
                    jid,
                })
            })?;

            let mut contacts = Vec::new();
            for row in rows {
                contacts.push(row?);
            }
            Ok(contacts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> ChatJid {
        ChatJid::parse(s).unwrap()
    }

    #[test]
    fn contact_names_last_writer_wins() {
        let db = Database::in_memory().unwrap();
        let alice = jid("31600000001@s.whatsapp.net");

        assert!(db.write_batch(|b| b.upsert_contact(&alice, Some("ali"), Some("Alice A"), 2_000)).unwrap());
        assert!(!db.write_batch(|b| b.upsert_contact(&alice, Some("old"), None, 1_000)).unwrap());
        assert!(db.write_batch(|b| b.upsert_contact(&alice, Some("alice"), None, 3_000)).unwrap());

        let found = db.search_contacts("alice").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_deref(), Some("Alice A"));
        assert_eq!(found[0].phone_number, "31600000001");
    }

    #[test]
    fn search_merges_chats_and_skips_groups() {
        let db = Database::in_memory().unwrap();
        db.write_batch(|b| {
            b.touch_chat(&jid("31600000001@s.whatsapp.net"), Some("Bob"), Some(1))?;
            b.touch_chat(&jid("120363000000000001@g.us"), Some("Bob's group"), Some(1))?;
            b.upsert_contact(&jid("31600000002@s.whatsapp.net"), Some("bobby"), None, 1)?;
            b.upsert_contact(&jid("31600000001@s.whatsapp.net"), Some("b"), None, 1)?;
            Ok(())
        })
        .unwrap();

        let found = db.search_contacts("BOB").unwrap();
        let jids: Vec<_> = found.iter().map(|c| c.jid.as_str()).collect();
        assert_eq!(jids, ["31600000001@s.whatsapp.net", "31600000002@s.whatsapp.net"]);

        let by_number = db.search_contacts("0000002").unwrap();
        assert_eq!(by_number.len(), 1);
        assert_eq!(by_number[0].name.as_deref(), Some("bobby"));
    }
}

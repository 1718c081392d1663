use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS contacts (
    jid        TEXT PRIMARY KEY NOT NULL,
    push_name  TEXT,
    full_name  TEXT,
    updated_at INTEGER NOT NULL             -- last-writer-wins clock
);

CREATE INDEX IF NOT EXISTS idx_contacts_full_name ON contacts(full_name);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

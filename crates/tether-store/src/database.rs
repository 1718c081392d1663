//! Database connection management.
//!
//! [`Database`] owns one [`rusqlite::Connection`] behind a mutex and is cheap
//! to clone; every component of the bridge shares the same handle. Holding
//! the mutex for the whole lifetime of a transaction means readers can only
//! ever observe committed state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use directories::ProjectDirs;
use rusqlite::Connection;

use tether_shared::constants::DB_FILE_NAME;

use crate::error::{Result, StoreError};
use crate::migrations;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

/// Write access inside one open transaction. Obtained through
/// [`Database::write_batch`]; all writes made through it commit together.
pub struct Batch<'a> {
    conn: &'a Connection,
}

impl<'a> Batch<'a> {
    pub(crate) fn conn(&self) -> &'a Connection {
        self.conn
    }
}

impl Database {
    /// Default store directory:
    /// - Linux:   `~/.local/share/tether/store`
    /// - macOS:   `~/Library/Application Support/com.tether.tether/store`
    /// - Windows: `{FOLDERID_RoamingAppData}\tether\tether\data\store`
    pub fn default_store_dir() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "tether", "tether").ok_or(StoreError::NoDataDir)?;
        Ok(project_dirs.data_dir().join("store"))
    }

    /// Open (or create) the database inside a store directory.
    pub fn open_in(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir)?;
        let db_path = store_dir.join(DB_FILE_NAME);

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Filesystem path of the open database (`None` for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run a read-only closure against the connection.
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a single transaction. An error from `f` rolls back
    /// everything it wrote.
    pub fn write_batch<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Batch<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&Batch { conn: &*tx })?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_creates_store_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("nested").join("store");

        let db = Database::open_in(&store).expect("should open");
        assert_eq!(db.path(), Some(store.join(DB_FILE_NAME).as_path()));
    }

    #[test]
    fn failed_batch_rolls_back() {
        let db = Database::in_memory().unwrap();

        let result: Result<()> = db.write_batch(|batch| {
            batch.conn().execute(
                "INSERT INTO sync_cursors (scope, position, updated_at) VALUES ('x', 1, 0)",
                [],
            )?;
            Err(StoreError::NotFound)
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM sync_cursors", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}

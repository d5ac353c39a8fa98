//! SQLite-backed durable state: entity counters, the change queue and the audit log.
//!
//! The database lives at `~/.adpacer/adpacer.db` unless `databasePath` is set.
//! Every worker and the decision scheduler open their own connection; all
//! coordination between them happens through short write transactions here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::types::Config;

pub mod types;
pub use types::*;

pub mod changes;
pub mod entities;
pub mod history;

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PacerDb {
    conn: Connection,
}

impl PacerDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within an immediate SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so two connections can
    /// never interleave read-then-write sequences inside the closure.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(DbError::from)?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT").map_err(DbError::from)?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open the database configured for this process and apply the schema.
    pub fn open(config: &Config) -> Result<Self, DbError> {
        let path = Self::resolve_path(config)?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets readers (status, scoring) run alongside the claiming writers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// `databasePath` from config, else `~/.adpacer/adpacer.db`.
    pub fn resolve_path(config: &Config) -> Result<PathBuf, DbError> {
        match config.database_path.as_deref() {
            Some(p) if !p.trim().is_empty() => Ok(PathBuf::from(p)),
            _ => Self::default_path(),
        }
    }

    fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".adpacer").join("adpacer.db"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let tables: Vec<String> = {
            let mut stmt = db
                .conn_ref()
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .expect("prepare");
            stmt.query_map([], |row| row.get::<_, String>(0))
                .expect("query")
                .filter_map(|r| r.ok())
                .collect()
        };
        for expected in ["change_history", "entities", "pending_changes", "signal_events"] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}, got {:?}",
                tables
            );
        }
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let (db, path) = test_utils::test_db_with_path();
        drop(db);
        let again = PacerDb::open_at(&path).expect("reopen");
        let version: i32 = again
            .conn_ref()
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref().execute(
                "INSERT INTO signal_events (entity_id, kind, observed_at, applied_at)
                 VALUES ('e1', 'delivery', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')",
                [],
            )?;
            Err(DbError::EntityNotFound("e1".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM signal_events", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_resolve_path_prefers_config() {
        let config = Config {
            database_path: Some("/tmp/adpacer-test/custom.db".to_string()),
            ..Config::default()
        };
        assert_eq!(
            PacerDb::resolve_path(&config).expect("path"),
            PathBuf::from("/tmp/adpacer-test/custom.db")
        );
    }
}

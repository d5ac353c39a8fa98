//! Numbered schema migrations, embedded with `include_str!` and tracked in
//! `schema_version`. Each one runs once, inside its own transaction, after a
//! hot backup of the existing file.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "change_available_at",
        sql: include_str!("migrations/002_change_available_at.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema_version bookkeeping failed: {0}")]
    Bookkeeping(rusqlite::Error),

    #[error(
        "Database schema version ({found}) is newer than this version of adpacer supports ({supported}). \
         Upgrade adpacer before pointing it at this database."
    )]
    NewerSchema { found: i32, supported: i32 },

    #[error("Pre-migration backup to {path} failed: {source}")]
    Backup {
        path: String,
        source: rusqlite::Error,
    },

    #[error("Migration v{version} ({name}) failed: {source}")]
    Apply {
        version: i32,
        name: &'static str,
        source: rusqlite::Error,
    },
}

fn ensure_schema_version_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )
    .map_err(MigrationError::Bookkeeping)
}

fn current_version(conn: &Connection) -> Result<i32, MigrationError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(MigrationError::Bookkeeping)
}

/// Hot copy to `<db_path>.pre-migration.bak`. In-memory databases are skipped.
fn backup_before_migration(conn: &Connection) -> Result<(), MigrationError> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(MigrationError::Bookkeeping)?;
    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let path = format!("{}.pre-migration.bak", db_path);
    let copy = || -> rusqlite::Result<()> {
        let mut dest = Connection::open(&path)?;
        let backup = rusqlite::backup::Backup::new(conn, &mut dest)?;
        backup.step(-1)?;
        Ok(())
    };
    copy().map_err(|source| MigrationError::Backup {
        path: path.clone(),
        source,
    })?;

    log::info!("Pre-migration backup created at {}", path);
    Ok(())
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
    let run = || -> rusqlite::Result<()> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )?;
        tx.commit()
    };
    run().map_err(|source| MigrationError::Apply {
        version: migration.version,
        name: migration.name,
        source,
    })
}

/// Apply every migration newer than the stored version.
///
/// Returns how many ran. Refuses to touch a database written by a newer build.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let supported = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current > supported {
        return Err(MigrationError::NewerSchema {
            found: current,
            supported,
        });
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;
    for migration in &pending {
        apply(conn, migration)?;
        log::info!("Applied migration v{} ({})", migration.version, migration.name);
    }
    Ok(pending.len())
}

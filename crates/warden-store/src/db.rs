//! Shared SQLite connection and schema management.
//!
//! The schema version is tracked with SQLite's `user_version` pragma. When the
//! schema changes, increment `SCHEMA_VERSION` and add a migration step to
//! `run_migrations`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use warden_core::WardenError;

const SCHEMA_VERSION: i32 = 1;

/// SQLite database shared by the credential store and the ledger.
///
/// `rusqlite::Connection` is not `Sync`, so it lives behind a `Mutex`. The
/// lock is only ever held for a single statement or short transaction.
///
/// # Examples
///
/// ```
/// use warden_store::Database;
///
/// let db = Database::in_memory().unwrap();
/// assert_eq!(db.schema_version().unwrap(), 1);
/// ```
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Database`] if the file cannot be opened or the
    /// schema cannot be migrated.
    pub fn open(path: &Path) -> Result<Self, WardenError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WardenError::Database(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|e| {
            WardenError::Database(format!("failed to open {}: {e}", path.display()))
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, WardenError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            WardenError::Database(format!("failed to create in-memory database: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, WardenError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Lock the connection for one operation.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, WardenError> {
        self.conn
            .lock()
            .map_err(|_| WardenError::Internal("database mutex poisoned".into()))
    }

    pub fn schema_version(&self) -> Result<i32, WardenError> {
        let conn = self.conn()?;
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(db_err)
    }

    fn init_schema(&self) -> Result<(), WardenError> {
        let conn = self.conn()?;
        let current: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(db_err)?;

        if current > SCHEMA_VERSION {
            return Err(WardenError::Database(format!(
                "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        if current < SCHEMA_VERSION {
            run_migrations(&conn, current)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(db_err)?;
        }
        Ok(())
    }
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), WardenError> {
    if from_version < 1 {
        migrate_v0_to_v1(conn)?;
    }
    Ok(())
}

fn migrate_v0_to_v1(conn: &Connection) -> Result<(), WardenError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS identities (
            id TEXT PRIMARY KEY,
            login TEXT NOT NULL,
            token TEXT NOT NULL,
            selected_repo TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_identities_repo ON identities(selected_repo);

        CREATE TABLE IF NOT EXISTS jobs (
            job_key TEXT PRIMARY KEY,
            repo_owner TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            number INTEGER NOT NULL,
            url TEXT NOT NULL,
            notification TEXT NOT NULL,
            state TEXT NOT NULL CHECK(state IN (
                'received', 'credential_resolved', 'diff_fetched',
                'review_generated', 'posted', 'failed'
            )),
            attempts TEXT NOT NULL,
            failure_stage TEXT,
            failure_kind TEXT,
            failure_message TEXT,
            post_claimed_at TEXT,
            comment_url TEXT,
            created_at TEXT NOT NULL,
            last_transition_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_unfinished
        ON jobs(created_at)
        WHERE state NOT IN ('posted', 'failed');

        CREATE INDEX IF NOT EXISTS idx_jobs_recent ON jobs(last_transition_at);
        ",
    )
    .map_err(|e| WardenError::Database(format!("failed to create schema (v0 -> v1): {e}")))
}

pub(crate) fn db_err(e: rusqlite::Error) -> WardenError {
    WardenError::Database(e.to_string())
}

/// Fixed-width UTC timestamps so that text comparison orders correctly.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, WardenError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WardenError::Database(format!("invalid timestamp '{raw}': {e}")))
}

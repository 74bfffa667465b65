//! # mixclient-db
//!
//! Persistence for the mixnet client: a small key-value record store scoped
//! by account, with an in-memory implementation for tests and a SQLite
//! implementation for the daemon.
//!
//! ## Schema
//!
//! - WAL mode
//! - One `records` table keyed by `(account, key)`
//! - Timestamps are Unix epoch seconds
//! - Schema version stored in `PRAGMA user_version`
//!
//! ## Key layout
//!
//! | Prefix | Record |
//! |---|---|
//! | `pending/<message_id>` | [`records::PendingSendRecord`] |
//! | `sent/<message_id>` | [`records::SentRecord`] |
//! | `failed/<message_id>` | [`records::FailedRecord`] |
//! | `inbox/<message_id>` | [`records::InboxRecord`] |
//! | `fragment/<message_id>/<seq>` | [`records::FragmentRecord`] |

pub mod migrations;
pub mod queries;
pub mod records;
pub mod schema;
pub mod store;

pub use store::{MemoryStore, MessageStore, SqliteStore};

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

/// Schema version written by this release.
pub const SCHEMA_VERSION: u32 = 1;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the database file and bring its schema up to date.
pub fn open(path: &Path) -> Result<Connection> {
    debug!(path = %path.display(), "opening message store");
    prepare(Connection::open(path)?)
}

/// Fresh in-memory database with the current schema.
pub fn open_memory() -> Result<Connection> {
    prepare(Connection::open_in_memory()?)
}

fn prepare(conn: Connection) -> Result<Connection> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // In-memory databases report "memory" and ignore the request.
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    migrations::run(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = open_memory().expect("open in-memory db");
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("get user_version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_mode_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir.path().join("mixclient.db")).expect("open");
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("get journal_mode");
        assert_eq!(mode, "wal");
    }
}

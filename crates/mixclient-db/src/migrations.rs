//! Forward-only schema migrations.
//!
//! The applied version lives in `PRAGMA user_version`. Each step runs in its
//! own transaction together with the version bump, so an interrupted upgrade
//! leaves the database at the last complete version.

use rusqlite::Connection;
use tracing::info;

use crate::{schema, DbError, Result, SCHEMA_VERSION};

/// Migration scripts; entry `i` upgrades version `i` to `i + 1`.
const STEPS: &[&str] = &[schema::SCHEMA_V1];

fn user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// # Errors
///
/// - [`DbError::Migration`] if the file was written by a newer release or a
///   step is missing
/// - [`DbError::Sqlite`] if a script fails
pub fn run(conn: &Connection) -> Result<()> {
    let from = user_version(conn)?;
    if from > SCHEMA_VERSION {
        return Err(DbError::Migration(format!(
            "database schema v{from} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    for version in from..SCHEMA_VERSION {
        let script = STEPS.get(version as usize).ok_or_else(|| {
            DbError::Migration(format!("no migration from v{version}"))
        })?;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(script)?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        info!(from = version, to = version + 1, "database migrated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let conn = Connection::open_in_memory().expect("open");
        run(&conn).expect("migrate");
        assert_eq!(user_version(&conn).expect("version"), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'records'",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_rerun_is_noop() {
        let conn = Connection::open_in_memory().expect("open");
        run(&conn).expect("first run");
        conn.execute(
            "INSERT INTO records (account, key, value, updated_at) VALUES (x'01', 'k', x'02', 0)",
            [],
        )
        .expect("insert");
        run(&conn).expect("second run");
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM records", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let conn = Connection::open_in_memory().expect("open");
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .expect("pragma");
        assert!(matches!(run(&conn), Err(DbError::Migration(_))));
    }

    #[test]
    fn test_every_version_has_a_step() {
        assert_eq!(STEPS.len(), SCHEMA_VERSION as usize);
    }
}

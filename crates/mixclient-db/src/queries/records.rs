//! Record query functions.

use mixclient_types::AccountId;
use rusqlite::{Connection, OptionalExtension};

use crate::Result;

/// Insert or replace a record.
pub fn put(
    conn: &Connection,
    account: &AccountId,
    key: &str,
    value: &[u8],
    updated_at: u64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records (account, key, value, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![account.as_bytes().as_slice(), key, value, updated_at as i64],
    )?;
    Ok(())
}

/// Get a record value.
pub fn get(conn: &Connection, account: &AccountId, key: &str) -> Result<Option<Vec<u8>>> {
    let value = conn
        .query_row(
            "SELECT value FROM records WHERE account = ?1 AND key = ?2",
            rusqlite::params![account.as_bytes().as_slice(), key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(value)
}

/// Delete a record. Returns whether a row was removed.
pub fn delete(conn: &Connection, account: &AccountId, key: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM records WHERE account = ?1 AND key = ?2",
        rusqlite::params![account.as_bytes().as_slice(), key],
    )?;
    Ok(rows > 0)
}

/// All records of `account` whose key starts with `prefix`, ordered by key.
pub fn list_prefix(
    conn: &Connection,
    account: &AccountId,
    prefix: &str,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT key, value FROM records
         WHERE account = ?1 AND substr(key, 1, ?2) = ?3
         ORDER BY key",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![
                account.as_bytes().as_slice(),
                prefix.len() as i64,
                prefix
            ],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of records stored for `account`.
pub fn count(conn: &Connection, account: &AccountId) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT count(*) FROM records WHERE account = ?1",
        [account.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        crate::open_memory().expect("open test db")
    }

    #[test]
    fn test_put_get_delete() {
        let conn = test_db();
        let account = AccountId([1; 32]);
        put(&conn, &account, "pending/aa", b"one", 10).expect("put");
        assert_eq!(get(&conn, &account, "pending/aa").expect("get"), Some(b"one".to_vec()));

        put(&conn, &account, "pending/aa", b"two", 11).expect("replace");
        assert_eq!(get(&conn, &account, "pending/aa").expect("get"), Some(b"two".to_vec()));

        assert!(delete(&conn, &account, "pending/aa").expect("delete"));
        assert!(!delete(&conn, &account, "pending/aa").expect("delete again"));
        assert_eq!(get(&conn, &account, "pending/aa").expect("get"), None);
    }

    #[test]
    fn test_accounts_are_isolated() {
        let conn = test_db();
        let alice = AccountId([1; 32]);
        let bob = AccountId([2; 32]);
        put(&conn, &alice, "inbox/01", b"a", 1).expect("put");
        assert_eq!(get(&conn, &bob, "inbox/01").expect("get"), None);
        assert_eq!(count(&conn, &alice).expect("count"), 1);
        assert_eq!(count(&conn, &bob).expect("count"), 0);
    }

    #[test]
    fn test_list_prefix() {
        let conn = test_db();
        let account = AccountId([3; 32]);
        put(&conn, &account, "fragment/ab/00000001", b"1", 1).expect("put");
        put(&conn, &account, "fragment/ab/00000000", b"0", 1).expect("put");
        put(&conn, &account, "fragment/cd/00000000", b"x", 1).expect("put");
        put(&conn, &account, "inbox/ab", b"i", 1).expect("put");

        let rows = list_prefix(&conn, &account, "fragment/ab/").expect("list");
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["fragment/ab/00000000", "fragment/ab/00000001"]);
        assert_eq!(list_prefix(&conn, &account, "fragment/").expect("list").len(), 3);
        assert!(list_prefix(&conn, &account, "sent/").expect("list").is_empty());
    }
}

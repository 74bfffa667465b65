//! SQL schema definitions.

/// Schema for database version 1.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    account BLOB NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (account, key)
);

CREATE INDEX IF NOT EXISTS idx_records_updated ON records(account, updated_at);
"#;

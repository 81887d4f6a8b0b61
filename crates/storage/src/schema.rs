use rusqlite::Connection;

use crate::error::StorageError;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
        PRAGMA mmap_size = 268435456;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS entries (
    segment TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    expires_fresh INTEGER,
    expires_stale INTEGER,
    updated_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER)),
    PRIMARY KEY (segment, key)
);
CREATE INDEX IF NOT EXISTS idx_entries_stale ON entries (expires_stale) WHERE expires_stale IS NOT NULL;
";

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::StorageError;
use crate::traits::{
    ChangeKind, DurableStore, DurableStoreChange, DurableStoreEntries, DurableStoreEntry,
    DurableStoreOperation,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub struct SqliteDurableStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<Vec<DurableStoreChange>>,
}

impl SqliteDurableStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            changes,
        }
    }

    pub fn entry_count(&self, segment: &str) -> Result<u64, StorageError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE segment = ?1",
            [segment],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete every entry whose stale deadline is before `now_ms`. Returns the
    /// number of rows removed.
    pub fn evict_expired(&self, now_ms: i64) -> Result<usize, StorageError> {
        let changes = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let expired: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT segment, key FROM entries WHERE expires_stale IS NOT NULL AND expires_stale < ?1 ORDER BY segment, key",
                )?;
                let rows = stmt.query_map([now_ms], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<_, _>>()?
            };
            tx.execute(
                "DELETE FROM entries WHERE expires_stale IS NOT NULL AND expires_stale < ?1",
                [now_ms],
            )?;
            tx.commit()?;

            let mut changes: Vec<DurableStoreChange> = Vec::new();
            for (segment, key) in expired {
                match changes.last_mut() {
                    Some(change) if change.segment == segment => change.ids.push(key),
                    _ => changes.push(DurableStoreChange {
                        segment,
                        ids: vec![key],
                        kind: ChangeKind::Evict,
                    }),
                }
            }
            changes
        };
        let removed = changes.iter().map(|c| c.ids.len()).sum();
        if removed > 0 {
            debug!(removed, "evicted expired entries");
            let _ = self.changes.send(changes);
        }
        Ok(removed)
    }

    fn apply(
        tx: &rusqlite::Transaction,
        op: &DurableStoreOperation,
    ) -> Result<(), StorageError> {
        match op {
            DurableStoreOperation::SetEntries { segment, entries } => {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO entries (segment, key, data, checksum, expires_fresh, expires_stale)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (segment, key) DO UPDATE SET
                        data = excluded.data,
                        checksum = excluded.checksum,
                        expires_fresh = excluded.expires_fresh,
                        expires_stale = excluded.expires_stale,
                        updated_at = CAST(unixepoch('now','subsec') * 1000 AS INTEGER)",
                )?;
                for (key, entry) in entries {
                    let data = encode_entry(entry)?;
                    let checksum = blake3::hash(&data);
                    stmt.execute(rusqlite::params![
                        segment,
                        key,
                        data,
                        checksum.as_bytes().as_slice(),
                        entry.expiration.map(|e| e.fresh),
                        entry.expiration.map(|e| e.stale),
                    ])?;
                }
            }
            DurableStoreOperation::EvictEntries { segment, ids } => {
                let mut stmt =
                    tx.prepare_cached("DELETE FROM entries WHERE segment = ?1 AND key = ?2")?;
                for key in ids {
                    stmt.execute(rusqlite::params![segment, key])?;
                }
            }
        }
        Ok(())
    }
}

fn encode_entry(entry: &DurableStoreEntry) -> Result<Vec<u8>, StorageError> {
    Ok(rmp_serde::to_vec_named(entry)?)
}

fn read_entry(
    segment: &str,
    key: &str,
    data: Vec<u8>,
    checksum: Vec<u8>,
) -> Result<DurableStoreEntry, StorageError> {
    let stored = to_array::<32>(checksum, "checksum")?;
    if blake3::hash(&data).as_bytes() != &stored {
        return Err(StorageError::ChecksumMismatch {
            segment: segment.to_string(),
            key: key.to_string(),
        });
    }
    Ok(rmp_serde::from_slice(&data)?)
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn get_entries(
        &self,
        ids: &[String],
        segment: &str,
    ) -> Result<DurableStoreEntries, StorageError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT data, checksum FROM entries WHERE segment = ?1 AND key = ?2")?;
        let mut out = DurableStoreEntries::new();
        for key in ids {
            let row: Option<(Vec<u8>, Vec<u8>)> = stmt
                .query_row(rusqlite::params![segment, key], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;
            if let Some((data, checksum)) = row {
                out.insert(key.clone(), read_entry(segment, key, data, checksum)?);
            }
        }
        trace!(segment, requested = ids.len(), found = out.len(), "get_entries");
        Ok(out)
    }

    async fn get_all_entries(&self, segment: &str) -> Result<DurableStoreEntries, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT key, data, checksum FROM entries WHERE segment = ?1 ORDER BY key")?;
        let rows = stmt.query_map([segment], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut out = DurableStoreEntries::new();
        for row in rows {
            let (key, data, checksum) = row?;
            let entry = read_entry(segment, &key, data, checksum)?;
            out.insert(key, entry);
        }
        Ok(out)
    }

    async fn batch_operations(
        &self,
        operations: Vec<DurableStoreOperation>,
    ) -> Result<(), StorageError> {
        if operations.is_empty() {
            return Ok(());
        }
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for op in &operations {
                Self::apply(&tx, op)?;
            }
            tx.commit()?;
        }
        let changes: Vec<DurableStoreChange> = operations
            .iter()
            .map(DurableStoreChange::from_operation)
            .filter(|c| !c.ids.is_empty())
            .collect();
        debug!(operations = operations.len(), "committed durable batch");
        if !changes.is_empty() {
            // No subscribers is not an error.
            let _ = self.changes.send(changes);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<DurableStoreChange>> {
        self.changes.subscribe()
    }
}

impl std::fmt::Debug for SqliteDurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDurableStore").finish_non_exhaustive()
    }
}

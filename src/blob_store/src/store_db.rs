use cluster_lib::{ReplicaState, StoreError, StoreResult};
use log::{debug, warn};
use rusqlite::{params, Connection};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Location of one blob inside the replica's blob log.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobIndexEntry {
    pub blob_id: String,
    pub offset: u64,
    pub size: u64,
    pub create_time: u64,
}

impl BlobIndexEntry {
    pub fn new(blob_id: &str, offset: u64, size: u64) -> Self {
        Self {
            blob_id: blob_id.to_string(),
            offset,
            size,
            create_time: unix_timestamp(),
        }
    }
}

/// Per-replica store metadata: the blob index and the persisted replica
/// state pair.
pub struct BlobStoreDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl BlobStoreDB {
    pub fn new(db_path: String) -> StoreResult<Self> {
        debug!("BlobStoreDB: new db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("BlobStoreDB: open db failed! {}", e);
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blobs (
                blob_id TEXT PRIMARY KEY,
                offset INTEGER NOT NULL,
                size INTEGER NOT NULL,
                create_time INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("BlobStoreDB: create blobs table failed! {}", e);
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS replica_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                current_state TEXT NOT NULL,
                previous_state TEXT NOT NULL,
                update_time INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("BlobStoreDB: create replica_state table failed! {}", e);
            StoreError::DbError(e.to_string())
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn set_blob(&self, entry: &BlobIndexEntry) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (blob_id, offset, size, create_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.blob_id,
                entry.offset as i64,
                entry.size as i64,
                entry.create_time as i64
            ],
        )
        .map_err(|e| {
            warn!("BlobStoreDB: insert blob failed! {}", e);
            StoreError::DbError(e.to_string())
        })?;
        Ok(())
    }

    pub fn get_blob(&self, blob_id: &str) -> StoreResult<BlobIndexEntry> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT offset, size, create_time FROM blobs WHERE blob_id = ?1")
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        stmt.query_row(params![blob_id], |row| {
            Ok(BlobIndexEntry {
                blob_id: blob_id.to_string(),
                offset: row.get::<_, i64>(0)? as u64,
                size: row.get::<_, i64>(1)? as u64,
                create_time: row.get::<_, i64>(2)? as u64,
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound(format!("blob not found: {}", blob_id))
            }
            _ => {
                warn!("BlobStoreDB: get blob failed! {}", e);
                StoreError::DbError(e.to_string())
            }
        })
    }

    pub fn blob_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|count| count as u64)
        .map_err(|e| StoreError::DbError(e.to_string()))
    }

    /// Persisted (current, previous) replica state, if any was saved.
    pub fn load_replica_state(&self) -> StoreResult<Option<(ReplicaState, ReplicaState)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT current_state, previous_state FROM replica_state WHERE id = 0")
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        match stmt.query_row([], |row| {
            let current: ReplicaState = row.get(0)?;
            let previous: ReplicaState = row.get(1)?;
            Ok((current, previous))
        }) {
            Ok(states) => Ok(Some(states)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                warn!("BlobStoreDB: load replica state failed! {}", e);
                Err(StoreError::DbError(e.to_string()))
            }
        }
    }

    pub fn save_replica_state(
        &self,
        current: ReplicaState,
        previous: ReplicaState,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO replica_state (id, current_state, previous_state, update_time)
             VALUES (0, ?1, ?2, ?3)",
            params![current, previous, unix_timestamp() as i64],
        )
        .map_err(|e| {
            warn!("BlobStoreDB: save replica state failed! {}", e);
            StoreError::DbError(e.to_string())
        })?;
        Ok(())
    }
}

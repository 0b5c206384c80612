// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite replica store.
//!
//! Durable backend for a replica. Six tables:
//!
//! ```sql
//! CREATE TABLE entities (
//!   kind TEXT, id TEXT,            -- identity
//!   parent_id TEXT, parent_kind TEXT,
//!   version INTEGER, created_at INTEGER,
//!   snapshot TEXT,                 -- full EntitySnapshot as JSON
//!   PRIMARY KEY (kind, id)
//! );
//! CREATE TABLE change_log (seq INTEGER PRIMARY KEY AUTOINCREMENT, ...);
//! CREATE TABLE change_heads (kind TEXT, id TEXT, seq INTEGER, ...);
//! CREATE TABLE sync_checkpoints (peer_id TEXT PRIMARY KEY, local_seq, remote_seq);
//! CREATE TABLE parked_snapshots (kind TEXT, id TEXT, version INTEGER, depth, created_at, snapshot TEXT);
//! CREATE TABLE photo_blobs (hash TEXT PRIMARY KEY, data BLOB, size INTEGER);
//! ```
//!
//! An entity write, its change-log row and its head update commit in one
//! transaction. `change_heads` keeps each entity's newest sequence so the
//! "modified since" check keeps working after the log is compacted.
//!
//! ## sqlx Any Driver Quirks
//!
//! Snapshots are stored as TEXT and decoded with serde_json. Some drivers hand
//! TEXT back as bytes, so reads fall back to `Vec<u8>` before giving up.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::{
    blob_hash, BlobStore, ChangeLog, ChangeLogEntry, CheckpointStore, EntityStore, PendingStore, PutOutcome,
    StorageError,
};
use crate::checkpoint::{Checkpoint, SyncCheckpoints};
use crate::entity::{ChangeSource, EntityKind, EntitySnapshot};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        parent_id TEXT,
        parent_kind TEXT,
        version INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        snapshot TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities (parent_id, kind, created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS change_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        snapshot TEXT NOT NULL,
        local_timestamp INTEGER NOT NULL,
        source TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_change_log_entity ON change_log (kind, entity_id, version)",
    r#"
    CREATE TABLE IF NOT EXISTS change_heads (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        PRIMARY KEY (kind, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoints (
        peer_id TEXT PRIMARY KEY,
        local_seq INTEGER NOT NULL,
        remote_seq INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS parked_snapshots (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        version INTEGER NOT NULL,
        depth INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        snapshot TEXT NOT NULL,
        PRIMARY KEY (kind, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS photo_blobs (
        hash TEXT PRIMARY KEY,
        data BLOB NOT NULL,
        size INTEGER NOT NULL
    )
    "#,
];

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a TEXT column as String, tolerating drivers that return bytes.
fn text_column(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .ok_or_else(|| StorageError::Backend(format!("column '{}' is not text", column)))
}

fn decode_snapshot(row: &AnyRow) -> Result<EntitySnapshot, StorageError> {
    let raw = text_column(row, "snapshot")?;
    serde_json::from_str(&raw).map_err(|e| StorageError::Backend(format!("stored snapshot unreadable: {}", e)))
}

fn encode_snapshot(snapshot: &EntitySnapshot) -> Result<String, StorageError> {
    serde_json::to_string(snapshot).map_err(backend)
}

fn decode_entry(row: &AnyRow) -> Result<ChangeLogEntry, StorageError> {
    let seq: i64 = row.try_get("seq").map_err(backend)?;
    let source_raw = text_column(row, "source")?;
    let source = ChangeSource::parse(&source_raw)
        .ok_or_else(|| StorageError::Backend(format!("unknown change source '{}'", source_raw)))?;
    let snapshot = decode_snapshot(row)?;
    Ok(ChangeLogEntry::new(Checkpoint::from_seq(seq as u64), snapshot, source))
}

pub struct SqlStore {
    pool: AnyPool,
    /// Single mutation path
    write_lock: Mutex<()>,
}

impl SqlStore {
    /// Open (creating if needed) a SQLite replica store, e.g. `sqlite://replica.db?mode=rwc`.
    ///
    /// Uses startup-mode retry so a bad path fails fast.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        if !connection_string.starts_with("sqlite:") {
            return Err(StorageError::Backend(format!(
                "unsupported database url '{}': only sqlite is supported",
                connection_string
            )));
        }

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(8)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, write_lock: Mutex::new(()) };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Enable WAL so readers don't block the writer.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL is safe with NORMAL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in SCHEMA {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Close the pool (flushes the WAL).
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert_log_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Any>,
        snapshot: &EntitySnapshot,
        encoded: &str,
        source: ChangeSource,
    ) -> Result<Checkpoint, StorageError> {
        let result = sqlx::query(
            "INSERT INTO change_log (kind, entity_id, version, snapshot, local_timestamp, source) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(snapshot.kind.as_str())
        .bind(&snapshot.id)
        .bind(snapshot.version as i64)
        .bind(encoded)
        .bind(snapshot.local_timestamp)
        .bind(source.as_str())
        .execute(&mut **tx)
        .await
        .map_err(backend)?;

        let seq = result
            .last_insert_id()
            .ok_or_else(|| StorageError::Backend("change_log insert returned no sequence".to_string()))?;

        sqlx::query(
            "INSERT INTO change_heads (kind, id, seq) VALUES (?, ?, ?) \
             ON CONFLICT(kind, id) DO UPDATE SET seq = excluded.seq",
        )
        .bind(snapshot.kind.as_str())
        .bind(&snapshot.id)
        .bind(seq)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;

        Ok(Checkpoint::from_seq(seq as u64))
    }

    async fn put_once(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<PutOutcome, StorageError> {
        let encoded = encode_snapshot(snapshot)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let existing = sqlx::query("SELECT version FROM entities WHERE kind = ? AND id = ?")
            .bind(snapshot.kind.as_str())
            .bind(&snapshot.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

        let previous_version = match existing {
            Some(row) => {
                let stored: i64 = row.try_get("version").map_err(backend)?;
                let stored = stored as u64;
                if stored >= snapshot.version {
                    tx.rollback().await.map_err(backend)?;
                    return Ok(PutOutcome::Unchanged { stored_version: stored });
                }
                Some(stored)
            }
            None => None,
        };

        sqlx::query(
            "INSERT INTO entities (kind, id, parent_id, parent_kind, version, created_at, deleted, snapshot) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(kind, id) DO UPDATE SET \
                parent_id = excluded.parent_id, \
                parent_kind = excluded.parent_kind, \
                version = excluded.version, \
                created_at = excluded.created_at, \
                deleted = excluded.deleted, \
                snapshot = excluded.snapshot",
        )
        .bind(snapshot.kind.as_str())
        .bind(&snapshot.id)
        .bind(snapshot.parent_id.clone())
        .bind(snapshot.parent_kind.map(|k| k.as_str().to_string()))
        .bind(snapshot.version as i64)
        .bind(snapshot.created_at)
        .bind(i64::from(snapshot.deleted))
        .bind(&encoded)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        let seq = Self::insert_log_row(&mut tx, snapshot, &encoded, source).await?;
        tx.commit().await.map_err(backend)?;

        Ok(PutOutcome::Stored { previous_version, seq })
    }

    async fn append_once(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<Checkpoint, StorageError> {
        let encoded = encode_snapshot(snapshot)?;
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let seq = Self::insert_log_row(&mut tx, snapshot, &encoded, source).await?;
        tx.commit().await.map_err(backend)?;
        Ok(seq)
    }
}

#[async_trait]
impl EntityStore for SqlStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntitySnapshot>, StorageError> {
        retry("sql_get", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT snapshot FROM entities WHERE kind = ? AND id = ?")
                .bind(kind.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            row.as_ref().map(decode_snapshot).transpose()
        })
        .await
    }

    async fn put(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<PutOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;
        retry("sql_put", &RetryConfig::query(), || self.put_once(snapshot, source)).await
    }

    async fn list_children(&self, parent_id: &str, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError> {
        retry("sql_list_children", &RetryConfig::query(), || async {
            let rows = sqlx::query(
                "SELECT snapshot FROM entities WHERE parent_id = ? AND kind = ? ORDER BY created_at, id",
            )
            .bind(parent_id)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
            rows.iter().map(decode_snapshot).collect()
        })
        .await
    }

    async fn list_kind(&self, kind: EntityKind) -> Result<Vec<EntitySnapshot>, StorageError> {
        retry("sql_list_kind", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT snapshot FROM entities WHERE kind = ? ORDER BY created_at, id")
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            rows.iter().map(decode_snapshot).collect()
        })
        .await
    }
}

#[async_trait]
impl ChangeLog for SqlStore {
    async fn append(&self, snapshot: &EntitySnapshot, source: ChangeSource) -> Result<Checkpoint, StorageError> {
        let _guard = self.write_lock.lock().await;
        retry("sql_append", &RetryConfig::query(), || self.append_once(snapshot, source)).await
    }

    async fn entries_since(&self, since: Checkpoint) -> Result<Vec<ChangeLogEntry>, StorageError> {
        retry("sql_entries_since", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT seq, snapshot, source FROM change_log WHERE seq > ? ORDER BY seq")
                .bind(since.seq() as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            rows.iter().map(decode_entry).collect()
        })
        .await
    }

    async fn compact(&self, upto: Checkpoint) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        retry("sql_compact", &RetryConfig::query(), || async {
            let result = sqlx::query("DELETE FROM change_log WHERE seq <= ?")
                .bind(upto.seq() as i64)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(result.rows_affected() as usize)
        })
        .await
    }

    async fn head(&self) -> Result<Checkpoint, StorageError> {
        // AUTOINCREMENT keeps the high-water mark in sqlite_sequence even after compaction
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS head FROM sqlite_sequence WHERE name = 'change_log'")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let head: i64 = row.try_get("head").map_err(backend)?;
        Ok(Checkpoint::from_seq(head as u64))
    }

    async fn latest_seq(&self, kind: EntityKind, id: &str) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query("SELECT seq FROM change_heads WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let seq: i64 = row.try_get("seq").map_err(backend)?;
                Ok(Some(Checkpoint::from_seq(seq as u64)))
            }
            None => Ok(None),
        }
    }

    async fn snapshot_at(&self, kind: EntityKind, id: &str, version: u64) -> Result<Option<EntitySnapshot>, StorageError> {
        let row = sqlx::query(
            "SELECT snapshot FROM change_log WHERE kind = ? AND entity_id = ? AND version = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(decode_snapshot).transpose()
    }
}

#[async_trait]
impl CheckpointStore for SqlStore {
    async fn load_checkpoints(&self, peer_id: &str) -> Result<SyncCheckpoints, StorageError> {
        let row = sqlx::query("SELECT local_seq, remote_seq FROM sync_checkpoints WHERE peer_id = ?")
            .bind(peer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let local: i64 = row.try_get("local_seq").map_err(backend)?;
                let remote: i64 = row.try_get("remote_seq").map_err(backend)?;
                Ok(SyncCheckpoints {
                    local: Checkpoint::from_seq(local as u64),
                    remote: Checkpoint::from_seq(remote as u64),
                })
            }
            None => Ok(SyncCheckpoints::default()),
        }
    }

    async fn save_checkpoints(&self, peer_id: &str, checkpoints: SyncCheckpoints) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync_checkpoints (peer_id, local_seq, remote_seq) VALUES (?, ?, ?) \
             ON CONFLICT(peer_id) DO UPDATE SET local_seq = excluded.local_seq, remote_seq = excluded.remote_seq",
        )
        .bind(peer_id)
        .bind(checkpoints.local.seq() as i64)
        .bind(checkpoints.remote.seq() as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl PendingStore for SqlStore {
    async fn park(&self, snapshot: &EntitySnapshot) -> Result<(), StorageError> {
        let encoded = encode_snapshot(snapshot)?;
        sqlx::query(
            "INSERT INTO parked_snapshots (kind, id, version, depth, created_at, snapshot) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(kind, id) DO UPDATE SET version = excluded.version, snapshot = excluded.snapshot \
             WHERE excluded.version > parked_snapshots.version",
        )
        .bind(snapshot.kind.as_str())
        .bind(snapshot.id.as_str())
        .bind(snapshot.version as i64)
        .bind(i64::from(snapshot.kind.depth()))
        .bind(snapshot.created_at)
        .bind(encoded)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn parked(&self) -> Result<Vec<EntitySnapshot>, StorageError> {
        let rows = sqlx::query("SELECT snapshot FROM parked_snapshots ORDER BY depth, created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(decode_snapshot).collect()
    }

    async fn unpark(&self, kind: EntityKind, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM parked_snapshots WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for SqlStore {
    async fn put_blob(&self, data: &[u8]) -> Result<String, StorageError> {
        let hash = blob_hash(data);
        sqlx::query("INSERT INTO photo_blobs (hash, data, size) VALUES (?, ?, ?) ON CONFLICT(hash) DO NOTHING")
            .bind(&hash)
            .bind(data.to_vec())
            .bind(data.len() as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(hash)
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT data FROM photo_blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("data").map_err(backend)?)),
            None => Ok(None),
        }
    }

    async fn has_blob(&self, hash: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 AS present FROM photo_blobs WHERE hash = ? LIMIT 1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }
}

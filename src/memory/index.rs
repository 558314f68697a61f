//! Vector index adapter.
//!
//! The adapter only stores and ranks. Timeouts, pooling and failure
//! isolation are applied by [`MemoryService`](super::MemoryService).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::{
    rank_entries, Collection, MemoryEntry, MemoryFilter, MemoryId, Metadata, ScoredEntry,
};
use crate::resilience::ResourceFactory;

/// One connection to a vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Persist an entry, returning its id.
    async fn store(&self, entry: &MemoryEntry) -> Result<MemoryId>;

    /// Top `top_k` entries of `collection` by descending similarity.
    async fn search(
        &self,
        collection: &Collection,
        vector: &[f32],
        top_k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<ScoredEntry>>;

    /// Cheap liveness probe used by the pool health check.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens [`VectorIndex`] connections.
#[async_trait]
pub trait IndexBackend: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn VectorIndex>>;
}

/// Adapts an [`IndexBackend`] to the resource pool.
pub struct IndexConnector {
    backend: Arc<dyn IndexBackend>,
}

impl IndexConnector {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ResourceFactory for IndexConnector {
    type Resource = Box<dyn VectorIndex>;

    async fn create(&self) -> Result<Box<dyn VectorIndex>> {
        self.backend.connect().await
    }

    async fn is_healthy(&self, resource: &Box<dyn VectorIndex>) -> bool {
        resource.ping().await.is_ok()
    }
}

/// SQLite-backed index. Every `connect` opens a new connection to the same
/// database file.
pub struct SqliteIndexBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteIndexBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IndexBackend for SqliteIndexBackend {
    async fn connect(&self) -> Result<Box<dyn VectorIndex>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let index = tokio::task::spawn_blocking(move || SqliteVectorIndex::open(path, busy_timeout))
            .await
            .map_err(|e| Error::Internal(format!("index connect task failed: {}", e)))??;
        Ok(Box::new(index))
    }
}

/// A single SQLite connection holding memory entries.
pub struct SqliteVectorIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorIndex {
    /// Open or create an index at the given path.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::IndexUnavailable(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(|e| Error::IndexUnavailable(e.to_string()))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::IndexUnavailable(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory index (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::IndexUnavailable(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
            f(&conn).map_err(|e| Error::MemoryStorage(e.to_string()))
        })
        .await
        .map_err(|e| Error::Internal(format!("index task failed: {}", e)))?
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<MemoryEntry> {
        let id: String = row.get(0)?;
        let collection: String = row.get(1)?;
        let content: String = row.get(2)?;
        let blob: Vec<u8> = row.get(3)?;
        let metadata: String = row.get(4)?;
        let created_at: String = row.get(5)?;

        let id = MemoryId::parse(&id)
            .ok_or_else(|| corrupt_column(0, format!("invalid entry id '{}'", id)))?;
        let metadata = serde_json::from_str::<Metadata>(&metadata)
            .map_err(|e| corrupt_column(4, format!("invalid metadata for {}: {}", id, e)))?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt_column(5, format!("invalid created_at for {}: {}", id, e)))?;

        Ok(MemoryEntry {
            id,
            content,
            vector: blob_to_vector(&blob),
            metadata,
            collection: Collection::new(collection),
            created_at,
        })
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn store(&self, entry: &MemoryEntry) -> Result<MemoryId> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        let blob = vector_to_blob(&entry.vector);
        let id = entry.id;
        let collection = entry.collection.to_string();
        let content = entry.content.clone();
        let dimension = entry.vector.len() as i64;
        let created_at = entry.created_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO memory_entries (
                    id, collection, content, vector, dimension, metadata, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    collection,
                    content,
                    blob,
                    dimension,
                    metadata,
                    created_at
                ],
            )?;
            Ok(id)
        })
        .await
    }

    async fn search(
        &self,
        collection: &Collection,
        vector: &[f32],
        top_k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let collection = collection.to_string();
        let entries = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, collection, content, vector, metadata, created_at
                     FROM memory_entries WHERE collection = ?1",
                )?;
                let rows = stmt.query_map(params![collection], |row| Self::row_to_entry(row))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        Ok(rank_entries(&entries, vector, top_k, filter))
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn corrupt_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

//! Storage backend trait

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetained, StoredSession};

/// Write operation queued on the persistence manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceOp {
    SetRetained(StoredRetained),
    DeleteRetained { topic: String },
    SetSession(StoredSession),
    DeleteSession { client_id: String },
}

impl PersistenceOp {
    /// Storage key, later operations on the same key supersede earlier ones
    pub fn key(&self) -> (Partition, &str) {
        match self {
            Self::SetRetained(m) => (Partition::Retained, &m.topic),
            Self::DeleteRetained { topic } => (Partition::Retained, topic),
            Self::SetSession(s) => (Partition::Sessions, &s.client_id),
            Self::DeleteSession { client_id } => (Partition::Sessions, client_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Retained,
    Sessions,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetained>>;

    async fn list_retained(&self) -> Result<Vec<StoredRetained>>;

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;

    /// Apply a batch of operations atomically
    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    /// Flush all pending writes to disk
    async fn flush(&self) -> Result<()>;

    /// Load all data at startup
    async fn load_all(&self) -> Result<LoadedData> {
        Ok(LoadedData {
            retained: self.list_retained().await?,
            sessions: self.list_sessions().await?,
        })
    }
}

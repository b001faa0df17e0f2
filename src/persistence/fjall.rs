//! Fjall storage backend
//!
//! One LSM keyspace with a partition for retained messages (keyed by topic)
//! and one for durable sessions (keyed by client identifier).

use std::path::Path;

use async_trait::async_trait;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::models::{StoredRetained, StoredSession};

pub struct FjallBackend {
    keyspace: Keyspace,
    retained: PartitionHandle,
    sessions: PartitionHandle,
}

impl FjallBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            retained,
            sessions,
        })
    }

    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(PersistenceError::from)
    }

    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(PersistenceError::from)
    }

    fn list<T: bincode::Decode<()>>(partition: &PartitionHandle) -> Result<Vec<T>> {
        let mut result = Vec::new();
        for item in partition.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }
}

#[async_trait]
impl StorageBackend for FjallBackend {
    async fn get_retained(&self, topic: &str) -> Result<Option<StoredRetained>> {
        match self.retained.get(topic)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_retained(&self) -> Result<Vec<StoredRetained>> {
        Self::list(&self.retained)
    }

    async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        match self.sessions.get(client_id)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Self::list(&self.sessions)
    }

    async fn batch_write(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut batch = self.keyspace.batch();

        for op in ops {
            match op {
                PersistenceOp::SetRetained(message) => {
                    let bytes = Self::serialize(&message)?;
                    batch.insert(&self.retained, message.topic, bytes);
                }
                PersistenceOp::DeleteRetained { topic } => {
                    batch.remove(&self.retained, topic);
                }
                PersistenceOp::SetSession(session) => {
                    let bytes = Self::serialize(&session)?;
                    batch.insert(&self.sessions, session.client_id, bytes);
                }
                PersistenceOp::DeleteSession { client_id } => {
                    batch.remove(&self.sessions, client_id);
                }
            }
        }

        batch.commit()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

//! Durable storage for retained messages and durable sessions
//!
//! Writes are fire-and-forget from the routing path: they are queued on a
//! background task that coalesces operations per key and commits them in
//! batches. [`PersistenceManager::flush`] commits everything queued so far
//! and syncs the backend to disk.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{Partition, PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{
    LoadedData, StoredInflight, StoredPublish, StoredRetained, StoredSession, StoredWill,
};

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::retained::RetainedMessage;
use crate::session::Session;

enum Command {
    Write(PersistenceOp),
    Flush(oneshot::Sender<Result<()>>),
}

/// Pending operations, the latest per key
type Pending = AHashMap<(Partition, String), PersistenceOp>;

/// Persistence manager that handles background writes
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<Command>,
}

impl PersistenceManager {
    /// Spawn the background writer for `backend`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            flush_interval,
            max_batch_size.max(1),
        ));
        Self { backend, tx }
    }

    /// Open a fjall keyspace at `path` and spawn its writer
    pub fn open_fjall(
        path: &std::path::Path,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Result<Self> {
        let backend = FjallBackend::open(path)?;
        info!("Persistence opened at {}", path.display());
        Ok(Self::new(Arc::new(backend), flush_interval, max_batch_size))
    }

    /// Queue a write without waiting
    ///
    /// If the channel is full, the operation is dropped.
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(Command::Write(op)) {
            warn!("Persistence channel full, dropping operation: {}", e);
        }
    }

    pub fn save_retained(&self, message: &RetainedMessage) {
        self.write(PersistenceOp::SetRetained(StoredRetained::from(message)));
    }

    pub fn delete_retained(&self, topic: &str) {
        self.write(PersistenceOp::DeleteRetained {
            topic: topic.to_string(),
        });
    }

    pub fn save_session(&self, session: &Session) {
        self.write(PersistenceOp::SetSession(StoredSession::from_session(session)));
    }

    pub fn delete_session(&self, client_id: &str) {
        self.write(PersistenceOp::DeleteSession {
            client_id: client_id.to_string(),
        });
    }

    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load_all().await
    }

    /// Commit every queued write and sync to disk
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| PersistenceError::Closed)?;
        done_rx.await.map_err(|_| PersistenceError::Closed)?
    }

    async fn commit(backend: &dyn StorageBackend, pending: &mut Pending) -> Result<usize> {
        if pending.is_empty() {
            return Ok(0);
        }
        let ops: Vec<PersistenceOp> = pending.drain().map(|(_, op)| op).collect();
        let count = ops.len();
        backend.batch_write(ops).await?;
        Ok(count)
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<Command>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut pending: Pending = AHashMap::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Write(op)) => {
                        let (partition, key) = op.key();
                        let key = (partition, key.to_string());
                        pending.insert(key, op);

                        if pending.len() >= max_batch_size {
                            match Self::commit(backend.as_ref(), &mut pending).await {
                                Ok(count) => debug!("Flushed {} operations (max batch)", count),
                                Err(e) => error!("Failed to write batch: {}", e),
                            }
                        }
                    }
                    Some(Command::Flush(done)) => {
                        let result = match Self::commit(backend.as_ref(), &mut pending).await {
                            Ok(_) => backend.flush().await,
                            Err(e) => Err(e),
                        };
                        let _ = done.send(result);
                    }
                    None => {
                        if let Err(e) = Self::commit(backend.as_ref(), &mut pending).await {
                            error!("Failed to write final batch: {}", e);
                        }
                        break;
                    }
                },

                _ = interval.tick() => {
                    match Self::commit(backend.as_ref(), &mut pending).await {
                        Ok(0) => {}
                        Ok(count) => debug!("Flushed {} operations (interval)", count),
                        Err(e) => error!("Failed to write batch: {}", e),
                    }
                }
            }
        }

        debug!("Persistence writer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use crate::protocol::QoS;
    use crate::session::SessionLimits;

    fn retained(topic: &str, payload: &'static [u8]) -> RetainedMessage {
        RetainedMessage {
            topic: Arc::from(topic),
            payload: Bytes::from_static(payload),
            qos: QoS::AtLeastOnce,
            stored_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_fjall_batch_write_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();

        backend
            .batch_write(vec![
                PersistenceOp::SetRetained(StoredRetained::from(&retained("a", b"1"))),
                PersistenceOp::SetRetained(StoredRetained::from(&retained("b", b"2"))),
            ])
            .await
            .unwrap();
        assert_eq!(backend.list_retained().await.unwrap().len(), 2);

        backend
            .batch_write(vec![PersistenceOp::DeleteRetained {
                topic: "a".to_string(),
            }])
            .await
            .unwrap();
        assert!(backend.get_retained("a").await.unwrap().is_none());
        assert_eq!(
            backend.get_retained("b").await.unwrap().unwrap().payload,
            b"2".to_vec()
        );
    }

    #[tokio::test]
    async fn test_manager_coalesces_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            PersistenceManager::open_fjall(dir.path(), Duration::from_secs(60), 100).unwrap();

        manager.save_retained(&retained("t", b"old"));
        manager.save_retained(&retained("t", b"new"));
        manager.save_retained(&retained("gone", b"x"));
        manager.delete_retained("gone");
        manager.flush().await.unwrap();

        let loaded = manager.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 1);
        assert_eq!(loaded.retained[0].payload, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_session_snapshot_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            PersistenceManager::open_fjall(dir.path(), Duration::from_secs(60), 100).unwrap();
        let mut session = Session::new(Arc::from("dev"), false, SessionLimits::default());
        session
            .subscriptions
            .insert("x/y".to_string(), QoS::AtLeastOnce);
        manager.save_session(&session);
        manager.flush().await.unwrap();

        let loaded = manager.load_all().await.unwrap();
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(
            loaded.sessions[0].subscriptions,
            vec![("x/y".to_string(), QoS::AtLeastOnce)]
        );

        manager.delete_session("dev");
        manager.flush().await.unwrap();
        assert!(manager.load_all().await.unwrap().sessions.is_empty());
    }
}

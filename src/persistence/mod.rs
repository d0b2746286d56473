//! Durable storage for retained messages and non-clean sessions
//!
//! Trait-based so deployments can swap the backend; the default is a local
//! fjall LSM tree. Hot-path writes go through a batching background writer:
//! `write()` is fire-and-forget and sheds load when the channel fills, so a
//! slow disk never stalls dispatch.

mod backend;
mod error;
mod fjall;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use models::{
    LoadedState, StoredInflightMessage, StoredProperties, StoredPublish, StoredRetainedMessage,
    StoredSession, StoredSubscription,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Batching writer over a [`StorageBackend`]
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    tx: mpsc::Sender<PersistenceOp>,
    shutdown_tx: mpsc::Sender<()>,
}

impl PersistenceManager {
    /// Spawn the background writer over the given backend
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        tokio::spawn(Self::writer_loop(
            backend.clone(),
            rx,
            shutdown_rx,
            flush_interval,
            max_batch_size,
        ));

        Self {
            backend,
            tx,
            shutdown_tx,
        }
    }

    /// Queue a write without waiting; dropped with a warning when the
    /// channel is full
    pub fn write(&self, op: PersistenceOp) {
        if let Err(e) = self.tx.try_send(op) {
            warn!("persistence channel full, dropping operation: {:?}", e);
        }
    }

    /// Load all persisted state at startup
    pub async fn load_all(&self) -> Result<LoadedState> {
        self.backend.load_all().await
    }

    pub async fn get_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        self.backend.get_session(client_id).await
    }

    /// Flush outstanding writes and close the backend
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        // Let the writer drain its batch before the final flush
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.backend.flush().await?;
        self.backend.close().await?;
        info!("persistence shut down");
        Ok(())
    }

    async fn writer_loop(
        backend: Arc<dyn StorageBackend>,
        mut rx: mpsc::Receiver<PersistenceOp>,
        mut shutdown_rx: mpsc::Receiver<()>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) {
        let mut batch: Vec<PersistenceOp> = Vec::with_capacity(max_batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= max_batch_size {
                                Self::commit(&backend, &mut batch).await;
                            }
                        }
                        None => {
                            Self::commit(&backend, &mut batch).await;
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    Self::commit(&backend, &mut batch).await;
                }
                _ = shutdown_rx.recv() => {
                    Self::commit(&backend, &mut batch).await;
                    break;
                }
            }
        }

        debug!("persistence writer exited");
    }

    async fn commit(backend: &Arc<dyn StorageBackend>, batch: &mut Vec<PersistenceOp>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(e) = backend.batch_write(std::mem::take(batch)).await {
            error!("failed to write batch of {}: {}", count, e);
        } else {
            debug!("flushed {} persistence operations", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fjall_retained_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();

        let message = StoredRetainedMessage {
            topic: "s/k".to_string(),
            payload: vec![1, 2, 3],
            qos: 1,
            properties: StoredProperties::default(),
            timestamp_secs: StoredRetainedMessage::now_secs(),
        };

        backend.set_retained("s/k", &message).await.unwrap();
        let loaded = backend.get_retained("s/k").await.unwrap().unwrap();
        assert_eq!(loaded.topic, "s/k");
        assert_eq!(loaded.payload, vec![1, 2, 3]);
        assert_eq!(loaded.qos, 1);

        backend.delete_retained("s/k").await.unwrap();
        assert!(backend.get_retained("s/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fjall_batch_and_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FjallBackend::open(dir.path()).unwrap();

        let ops = vec![
            PersistenceOp::SetRetained {
                topic: "t1".to_string(),
                message: StoredRetainedMessage {
                    topic: "t1".to_string(),
                    payload: vec![1],
                    qos: 0,
                    properties: StoredProperties::default(),
                    timestamp_secs: StoredRetainedMessage::now_secs(),
                },
            },
            PersistenceOp::SetSession {
                client_id: "c1".to_string(),
                session: StoredSession {
                    client_id: "c1".to_string(),
                    session_expiry_interval: 300,
                    subscriptions: vec![StoredSubscription {
                        filter: "a/#".to_string(),
                        options: 1,
                        subscription_id: None,
                    }],
                    inflight: Vec::new(),
                    queued: Vec::new(),
                },
            },
        ];
        backend.batch_write(ops).await.unwrap();

        let loaded = backend.load_all().await.unwrap();
        assert_eq!(loaded.retained.len(), 1);
        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].1.subscriptions[0].filter, "a/#");
    }

    #[tokio::test]
    async fn test_manager_batches_writes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FjallBackend::open(dir.path()).unwrap());
        let manager =
            PersistenceManager::new(backend.clone(), Duration::from_millis(10), 100);

        manager.write(PersistenceOp::SetRetained {
            topic: "t".to_string(),
            message: StoredRetainedMessage {
                topic: "t".to_string(),
                payload: vec![9],
                qos: 0,
                properties: StoredProperties::default(),
                timestamp_secs: StoredRetainedMessage::now_secs(),
            },
        });

        // Wait past a flush interval for the writer to commit
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.get_retained("t").await.unwrap().is_some());

        manager.shutdown().await.unwrap();
    }
}

//! Process-scoped connection handle
//!
//! A connection owns a heartbeat, registers itself in the global connections
//! set, and hands out queue handles wired to its identity. Its id carries a
//! random token so a process restarting under the same name gets a fresh
//! identity; the old one is recovered by the cleaner once its heartbeat
//! expires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cleaner::recover_connection;
use crate::config::ConnectionConfig;
use crate::error::{ErrorEvent, Result, StoreResult};
use crate::heartbeat::Heartbeat;
use crate::keys;
use crate::queue::Queue;
use crate::signals::SignalBus;
use crate::store::{QueueStore, RedisStore};

/// A process-scoped handle to the queue system
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    name: String,
    id: String,
    store: Arc<dyn QueueStore>,
    err_tx: Option<mpsc::Sender<ErrorEvent>>,
    heartbeat: Heartbeat,
    stopped: Arc<AtomicBool>,
    signals: SignalBus,
    signal_sleep: Duration,
    queues: parking_lot::Mutex<HashMap<String, Queue>>,
}

impl Connection {
    /// Open a connection to the Redis server at `url`
    pub async fn open(
        name: &str,
        url: &str,
        err_tx: Option<mpsc::Sender<ErrorEvent>>,
    ) -> Result<Self> {
        Self::open_with_config(name, ConnectionConfig::with_url(url), err_tx).await
    }

    /// Open a connection with explicit tunables
    pub async fn open_with_config(
        name: &str,
        config: ConnectionConfig,
        err_tx: Option<mpsc::Sender<ErrorEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn QueueStore> = Arc::new(RedisStore::connect(&config.url).await?);
        Self::open_with_store(name, store, config, err_tx, SignalBus::new()).await
    }

    /// Open a connection over a custom store implementation.
    ///
    /// The signal bus is injected so multiple connections can share one, and
    /// so tests can run independent buses.
    pub async fn open_with_store(
        name: &str,
        store: Arc<dyn QueueStore>,
        config: ConnectionConfig,
        err_tx: Option<mpsc::Sender<ErrorEvent>>,
        signals: SignalBus,
    ) -> Result<Self> {
        config.validate()?;

        let token = uuid::Uuid::new_v4().to_string();
        let id = format!("{}-{}", name, &token[..8]);

        store.sadd(keys::CONNECTIONS_KEY, &id).await?;
        let heartbeat = Heartbeat::start(
            keys::heartbeat_key(&id),
            Arc::clone(&store),
            err_tx.clone(),
            config.heartbeat_interval,
            config.heartbeat_ttl,
        )
        .await?;

        info!(connection = %id, "Connection opened");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                name: name.to_string(),
                id,
                store,
                err_tx,
                heartbeat,
                stopped: Arc::new(AtomicBool::new(false)),
                signals,
                signal_sleep: config.signal_sleep,
                queues: parking_lot::Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The connection's unique id (`<name>-<token>`)
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The name this connection was opened under
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The signal bus wired into this connection's consumers
    pub fn signals(&self) -> &SignalBus {
        &self.inner.signals
    }

    /// Open a queue on this connection, creating it lazily.
    ///
    /// Repeat opens of the same name return the same handle.
    pub async fn open_queue(&self, name: &str) -> Result<Queue> {
        if let Some(queue) = self.inner.queues.lock().get(name) {
            return Ok(queue.clone());
        }

        self.inner.store.sadd(keys::QUEUES_KEY, name).await?;
        self.inner
            .store
            .sadd(&keys::connection_queues_key(&self.inner.id), name)
            .await?;

        let queue = Queue::new(
            name,
            &self.inner.id,
            Arc::clone(&self.inner.store),
            self.inner.err_tx.clone(),
            Arc::clone(&self.inner.stopped),
            self.inner.signals.clone(),
            self.inner.signal_sleep,
        );

        debug!(connection = %self.inner.id, queue = %name, "Queue opened");
        Ok(self
            .inner
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert(queue)
            .clone())
    }

    /// Names of all queues ever opened, across all connections
    pub async fn get_open_queues(&self) -> Result<Vec<String>> {
        Ok(self.inner.store.smembers(keys::QUEUES_KEY).await?)
    }

    /// Names of this connection's queues with an active consume loop
    pub fn get_consuming_queues(&self) -> Vec<String> {
        self.inner
            .queues
            .lock()
            .values()
            .filter(|queue| queue.is_consuming())
            .map(|queue| queue.name().to_string())
            .collect()
    }

    /// Stop consuming on every queue and wait until all handlers drained.
    ///
    /// Also flips the cancellation flag observed by deliveries, so a
    /// finalization op stuck in its retry loop returns
    /// [`crate::QueueError::ConsumingStopped`].
    pub async fn stop_all_consuming(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        let queues: Vec<Queue> = self.inner.queues.lock().values().cloned().collect();
        for queue in queues {
            if let Ok(mut finished) = queue.stop_consuming() {
                let _ = finished.wait_for(|done| *done).await;
            }
        }
    }

    /// Tear the connection down.
    ///
    /// Stops all consuming, stops the heartbeat, returns this connection's
    /// unacked payloads to their ready lists, and removes every
    /// connection-scoped key. Ready and rejected lists survive.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_all_consuming().await;
        self.inner.heartbeat.stop().await?;

        let recovered = recover_connection(&self.inner.store, &self.inner.id).await?;
        if recovered > 0 {
            debug!(
                connection = %self.inner.id,
                recovered,
                "Returned unfinalized deliveries on shutdown"
            );
        }

        info!(connection = %self.inner.id, "Connection shut down");
        Ok(())
    }

    /// Kill liveness without tearing anything down, leaving the connection
    /// registered. Crash-recovery tests use this to simulate a dying
    /// process.
    pub(crate) async fn stop_heartbeat(&self) -> StoreResult<()> {
        self.inner.heartbeat.stop().await
    }

    pub(crate) fn store(&self) -> &Arc<dyn QueueStore> {
        &self.inner.store
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn open_test_connection(store: &Arc<dyn QueueStore>, name: &str) -> Connection {
        Connection::open_with_store(
            name,
            Arc::clone(store),
            ConnectionConfig::default(),
            None,
            SignalBus::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_registers_connection() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let conn = open_test_connection(&store, "svc").await;

        assert!(conn.id().starts_with("svc-"));
        let members = store.smembers(keys::CONNECTIONS_KEY).await.unwrap();
        assert_eq!(members, vec![conn.id().to_string()]);
        assert!(store
            .exists(&keys::heartbeat_key(conn.id()))
            .await
            .unwrap());

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_name_gets_distinct_ids() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let a = open_test_connection(&store, "svc").await;
        let b = open_test_connection(&store, "svc").await;
        assert_ne!(a.id(), b.id());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_queue_registers_sets() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let conn = open_test_connection(&store, "svc").await;

        assert!(conn.get_open_queues().await.unwrap().is_empty());
        conn.open_queue("orders").await.unwrap();
        conn.open_queue("invoices").await.unwrap();

        let mut open = conn.get_open_queues().await.unwrap();
        open.sort();
        assert_eq!(open, vec!["invoices".to_string(), "orders".to_string()]);

        let owned = store
            .smembers(&keys::connection_queues_key(conn.id()))
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeat_open_returns_same_handle() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let conn = open_test_connection(&store, "svc").await;

        let first = conn.open_queue("orders").await.unwrap();
        first.publish("x").await.unwrap();
        let second = conn.open_queue("orders").await.unwrap();
        assert_eq!(second.ready_count().await.unwrap(), 1);

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_clears_connection_scoped_keys() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let conn = open_test_connection(&store, "svc").await;
        let queue = conn.open_queue("orders").await.unwrap();
        queue.publish("p1").await.unwrap();

        let cid = conn.id().to_string();
        conn.shutdown().await.unwrap();

        assert!(!store.exists(&keys::heartbeat_key(&cid)).await.unwrap());
        assert!(!store
            .exists(&keys::connection_queues_key(&cid))
            .await
            .unwrap());
        let members = store.smembers(keys::CONNECTIONS_KEY).await.unwrap();
        assert!(members.is_empty());

        // Queue-scoped state survives.
        assert_eq!(store.llen(&keys::ready_key("orders")).await.unwrap(), 1);
        assert!(store
            .smembers(keys::QUEUES_KEY)
            .await
            .unwrap()
            .contains(&"orders".to_string()));
    }

    #[tokio::test]
    async fn test_consuming_queues_listing() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let conn = open_test_connection(&store, "svc").await;
        let queue = conn.open_queue("orders").await.unwrap();
        conn.open_queue("idle").await.unwrap();

        assert!(conn.get_consuming_queues().is_empty());
        queue
            .start_consuming(2, Duration::from_millis(1))
            .unwrap();
        assert_eq!(conn.get_consuming_queues(), vec!["orders".to_string()]);

        conn.stop_all_consuming().await;
        assert!(conn.get_consuming_queues().is_empty());
        conn.shutdown().await.unwrap();
    }
}

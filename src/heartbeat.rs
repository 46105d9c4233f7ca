//! Connection liveness
//!
//! Each connection keeps a short-TTL key alive in the store. The cleaner
//! treats a registered connection without this key as dead and recovers its
//! unacked payloads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ErrorEvent, StoreResult};
use crate::store::QueueStore;

/// Periodic refresher of a connection's liveness key
pub(crate) struct Heartbeat {
    key: String,
    store: Arc<dyn QueueStore>,
    stop: Arc<AtomicBool>,
    notify: Arc<Notify>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Write the key once, then keep refreshing it in the background.
    ///
    /// The initial write is synchronous so a freshly opened connection is
    /// never observed as dead.
    pub(crate) async fn start(
        key: String,
        store: Arc<dyn QueueStore>,
        err_tx: Option<mpsc::Sender<ErrorEvent>>,
        interval: Duration,
        ttl: Duration,
    ) -> StoreResult<Self> {
        store.set_ex(&key, &beat_value(), ttl).await?;

        let stop = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let task = {
            let key = key.clone();
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            let notify = Arc::clone(&notify);

            tokio::spawn(async move {
                let mut attempt = 0u64;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = notify.notified() => {}
                    }
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }

                    match store.set_ex(&key, &beat_value(), ttl).await {
                        Ok(()) => attempt = 0,
                        Err(cause) => {
                            attempt += 1;
                            warn!(key = %key, attempt, error = %cause, "Heartbeat write failed");
                            if let Some(tx) = &err_tx {
                                let _ = tx.try_send(ErrorEvent::Heartbeat { attempt, cause });
                            }
                        }
                    }
                }
                debug!(key = %key, "Heartbeat stopped");
            })
        };

        Ok(Self {
            key,
            store,
            stop,
            notify,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    /// Stop refreshing and delete the liveness key.
    ///
    /// Idempotent; the second and later calls are no-ops.
    pub(crate) async fn stop(&self) -> StoreResult<()> {
        if self.stop.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // notify_one stores a permit, so the wakeup is not lost even when
        // the task is not parked in its select yet.
        self.notify.notify_one();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.store.del(&self.key).await?;
        Ok(())
    }
}

fn beat_value() -> String {
    chrono::Utc::now().timestamp().to_string()
}

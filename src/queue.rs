//! Queue operations: publish, consume, purge, recover rejected
//!
//! Consuming works in two stages. A prefetch task atomically moves payloads
//! from the ready list into this binding's unacked list and offers them to a
//! bounded dispatch channel; handler tasks pull deliveries off the channel
//! and invoke application consumers. The number of unfinalized deliveries is
//! bounded by the prefetch limit measured against the unacked list itself,
//! so payloads held by slow handlers still count against the budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::consumer::{
    BatchConsumer, Consumer, ConsumerContext, ConsumerKind, ContextBatchConsumer, ContextConsumer,
};
use crate::delivery::Delivery;
use crate::error::{ErrorEvent, QueueError, Result};
use crate::keys;
use crate::payload::{self, HeaderMap};
use crate::signals::{Signal, SignalBus};
use crate::store::QueueStore;

/// A handle to one named queue, scoped to the connection that opened it
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    ready_key: String,
    rejected_key: String,
    unacked_key: String,
    consumers_key: String,
    push_key: parking_lot::RwLock<Option<String>>,
    store: Arc<dyn QueueStore>,
    err_tx: Option<mpsc::Sender<ErrorEvent>>,
    conn_stopped: Arc<AtomicBool>,
    signals: SignalBus,
    signal_sleep: Duration,
    consuming: parking_lot::Mutex<Option<ConsumingState>>,
}

struct ConsumingState {
    delivery_tx: async_channel::Sender<Delivery>,
    delivery_rx: async_channel::Receiver<Delivery>,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
    finished_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
    stopping: bool,
}

/// Batch accumulation bounds for a batch consumer
#[derive(Clone, Copy)]
struct BatchSpec {
    size: usize,
    timeout: Duration,
}

impl Queue {
    pub(crate) fn new(
        name: &str,
        connection_id: &str,
        store: Arc<dyn QueueStore>,
        err_tx: Option<mpsc::Sender<ErrorEvent>>,
        conn_stopped: Arc<AtomicBool>,
        signals: SignalBus,
        signal_sleep: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                ready_key: keys::ready_key(name),
                rejected_key: keys::rejected_key(name),
                unacked_key: keys::unacked_key(connection_id, name),
                consumers_key: keys::consumers_key(connection_id, name),
                push_key: parking_lot::RwLock::new(None),
                store,
                err_tx,
                conn_stopped,
                signals,
                signal_sleep,
                consuming: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// The queue's name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a payload to the ready list.
    ///
    /// The list is consumed from the opposite end, so publish order is
    /// delivery order for a single consumer.
    pub async fn publish(&self, payload: &str) -> Result<()> {
        self.inner.store.lpush(&self.inner.ready_key, payload).await?;
        Ok(())
    }

    /// Publish raw bytes; they must form valid UTF-8
    pub async fn publish_bytes(&self, payload: &[u8]) -> Result<()> {
        let payload = std::str::from_utf8(payload)
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        self.publish(payload).await
    }

    /// Publish a payload with headers attached (see [`crate::payload`])
    pub async fn publish_with_headers(&self, body: &str, headers: &HeaderMap) -> Result<()> {
        let encoded = payload::with_headers(body, headers)?;
        self.publish(&encoded).await
    }

    /// Number of payloads awaiting a consumer
    pub async fn ready_count(&self) -> Result<i64> {
        Ok(self.inner.store.llen(&self.inner.ready_key).await?)
    }

    /// Number of payloads pulled by this binding but not yet finalized
    pub async fn unacked_count(&self) -> Result<i64> {
        Ok(self.inner.store.llen(&self.inner.unacked_key).await?)
    }

    /// Number of rejected payloads
    pub async fn rejected_count(&self) -> Result<i64> {
        Ok(self.inner.store.llen(&self.inner.rejected_key).await?)
    }

    /// Route `push()` on this queue's deliveries to `successor`'s ready list
    pub fn set_push_queue(&self, successor: &Queue) {
        *self.inner.push_key.write() = Some(successor.inner.ready_key.clone());
    }

    /// Begin the prefetch loop for this binding.
    ///
    /// At most `prefetch_limit` deliveries sit unfinalized at any time; the
    /// loop idles for `poll_duration` when the ready list is empty or the
    /// budget is exhausted. Errors with [`QueueError::AlreadyConsuming`] when
    /// a loop is already active.
    pub fn start_consuming(&self, prefetch_limit: usize, poll_duration: Duration) -> Result<()> {
        if prefetch_limit == 0 {
            return Err(QueueError::InvalidConfig(
                "prefetch limit must be at least 1".into(),
            ));
        }

        let mut guard = self.inner.consuming.lock();
        if guard.is_some() {
            return Err(QueueError::AlreadyConsuming);
        }

        let (delivery_tx, delivery_rx) = async_channel::bounded(prefetch_limit);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());
        let (finished_tx, finished_rx) = watch::channel(false);

        let prefetch = tokio::spawn(prefetch_loop(
            Arc::clone(&self.inner),
            delivery_tx.clone(),
            Arc::clone(&stop),
            Arc::clone(&stop_notify),
            prefetch_limit,
            poll_duration,
        ));

        *guard = Some(ConsumingState {
            delivery_tx,
            delivery_rx,
            stop,
            stop_notify,
            tasks: vec![prefetch],
            finished_tx,
            finished_rx,
            stopping: false,
        });

        info!(queue = %self.inner.name, prefetch_limit, "Consuming started");
        Ok(())
    }

    /// Register a single-delivery consumer; returns its uniquified tag
    pub async fn add_consumer(&self, tag: &str, consumer: Arc<dyn Consumer>) -> Result<String> {
        self.register(tag, ConsumerKind::Point(consumer), None).await
    }

    /// Register a single-delivery consumer that receives its context
    pub async fn add_context_consumer(
        &self,
        tag: &str,
        consumer: Arc<dyn ContextConsumer>,
    ) -> Result<String> {
        self.register(tag, ConsumerKind::PointWithContext(consumer), None)
            .await
    }

    /// Register a batch consumer.
    ///
    /// Batches flush when `size` deliveries have accumulated or `timeout`
    /// has elapsed since the first unflushed delivery.
    pub async fn add_batch_consumer(
        &self,
        tag: &str,
        size: usize,
        timeout: Duration,
        consumer: Arc<dyn BatchConsumer>,
    ) -> Result<String> {
        if size == 0 {
            return Err(QueueError::InvalidConfig(
                "batch size must be at least 1".into(),
            ));
        }
        self.register(
            tag,
            ConsumerKind::Batch(consumer),
            Some(BatchSpec { size, timeout }),
        )
        .await
    }

    /// Register a batch consumer that receives its context
    pub async fn add_context_batch_consumer(
        &self,
        tag: &str,
        size: usize,
        timeout: Duration,
        consumer: Arc<dyn ContextBatchConsumer>,
    ) -> Result<String> {
        if size == 0 {
            return Err(QueueError::InvalidConfig(
                "batch size must be at least 1".into(),
            ));
        }
        self.register(
            tag,
            ConsumerKind::BatchWithContext(consumer),
            Some(BatchSpec { size, timeout }),
        )
        .await
    }

    async fn register(
        &self,
        tag: &str,
        kind: ConsumerKind,
        batch: Option<BatchSpec>,
    ) -> Result<String> {
        {
            let guard = self.inner.consuming.lock();
            match guard.as_ref() {
                Some(state) if !state.stopping => {}
                _ => return Err(QueueError::NotConsuming),
            }
        }

        let unique_tag = format!(
            "{}-{}",
            tag,
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        self.inner
            .store
            .sadd(&self.inner.consumers_key, &unique_tag)
            .await?;

        let (sig_tx, sig_rx) = mpsc::unbounded_channel();

        let spawned = {
            let mut guard = self.inner.consuming.lock();
            match guard.as_mut() {
                Some(state) if !state.stopping => {
                    self.inner.signals.add(&unique_tag, sig_tx);
                    let task = tokio::spawn(handler_loop(
                        Arc::clone(&self.inner),
                        state.delivery_rx.clone(),
                        kind,
                        batch,
                        unique_tag.clone(),
                        sig_rx,
                    ));
                    state.tasks.push(task);
                    true
                }
                _ => false,
            }
        };

        if !spawned {
            // Consuming stopped while we were registering the tag.
            let _ = self
                .inner
                .store
                .srem(&self.inner.consumers_key, &unique_tag)
                .await;
            return Err(QueueError::NotConsuming);
        }

        debug!(queue = %self.inner.name, consumer = %unique_tag, "Consumer added");
        Ok(unique_tag)
    }

    /// Signal the consume loop to stop and return a completion signal.
    ///
    /// Level-triggered: repeat calls while draining return the same signal.
    /// The signal turns true once the prefetch loop has exited and every
    /// handler task has finished its in-flight work.
    pub fn stop_consuming(&self) -> Result<watch::Receiver<bool>> {
        let mut guard = self.inner.consuming.lock();
        let state = guard.as_mut().ok_or(QueueError::NotConsuming)?;
        let finished_rx = state.finished_rx.clone();

        if !state.stopping {
            state.stopping = true;
            state.stop.store(true, Ordering::SeqCst);
            // notify_one stores a permit, so the prefetch loop wakes even
            // when it has not parked in its select yet.
            state.stop_notify.notify_one();
            // Close the dispatch channel: handlers drain what was already
            // moved, then exit.
            state.delivery_tx.close();

            let tasks = std::mem::take(&mut state.tasks);
            let finished_tx = state.finished_tx.clone();
            let inner = Arc::clone(&self.inner);

            info!(queue = %self.inner.name, "Stopping consumers");
            tokio::spawn(async move {
                for task in tasks {
                    let _ = task.await;
                }
                let _ = inner.store.del(&inner.consumers_key).await;
                // Clear the slot before signalling so a caller woken by the
                // signal can immediately start consuming again.
                *inner.consuming.lock() = None;
                let _ = finished_tx.send(true);
                debug!(queue = %inner.name, "Consuming stopped");
            });
        }

        Ok(finished_rx)
    }

    /// Whether a consume loop is active (including one still draining)
    pub fn is_consuming(&self) -> bool {
        self.inner.consuming.lock().is_some()
    }

    /// Delete the ready list; returns how many payloads it held
    pub async fn purge_ready(&self) -> Result<i64> {
        self.purge(&self.inner.ready_key).await
    }

    /// Delete the rejected list; returns how many payloads it held
    pub async fn purge_rejected(&self) -> Result<i64> {
        self.purge(&self.inner.rejected_key).await
    }

    async fn purge(&self, key: &str) -> Result<i64> {
        let count = self.inner.store.llen(key).await?;
        self.inner.store.del(key).await?;
        Ok(count)
    }

    /// Move up to `max` rejected payloads back to the ready list; returns
    /// how many moved
    pub async fn return_rejected(&self, max: i64) -> Result<i64> {
        let mut moved = 0i64;
        while moved < max {
            match self
                .inner
                .store
                .rpoplpush(&self.inner.rejected_key, &self.inner.ready_key)
                .await?
            {
                Some(_) => moved += 1,
                None => break,
            }
        }
        Ok(moved)
    }

    /// Remove the queue and its lists from the store.
    ///
    /// Fails with [`QueueError::NoConsumers`] while consumers are attached.
    pub async fn destroy(&self) -> Result<()> {
        if self.is_consuming() {
            return Err(QueueError::NoConsumers);
        }
        if self.inner.store.scard(&self.inner.consumers_key).await? > 0 {
            return Err(QueueError::NoConsumers);
        }

        self.inner.store.del(&self.inner.ready_key).await?;
        self.inner.store.del(&self.inner.rejected_key).await?;
        self.inner.store.srem(keys::QUEUES_KEY, &self.inner.name).await?;
        info!(queue = %self.inner.name, "Queue destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("consuming", &self.is_consuming())
            .finish()
    }
}

/// Move payloads ready→unacked while the budget allows, offer them to the
/// dispatch channel, and idle when there is nothing to do.
async fn prefetch_loop(
    inner: Arc<QueueInner>,
    delivery_tx: async_channel::Sender<Delivery>,
    stop: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    prefetch_limit: usize,
    poll_duration: Duration,
) {
    debug!(queue = %inner.name, "Prefetch loop started");

    'outer: loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let mut moved = false;

        // The budget counts the unacked list, not the channel: a payload
        // held by a slow handler still occupies a prefetch slot until it
        // is finalized.
        match inner.store.llen(&inner.unacked_key).await {
            Ok(unacked) => {
                let mut free = prefetch_limit as i64 - unacked;
                while free > 0 && !stop.load(Ordering::Relaxed) {
                    match inner
                        .store
                        .rpoplpush(&inner.ready_key, &inner.unacked_key)
                        .await
                    {
                        Ok(Some(raw)) => {
                            let delivery = Delivery::new(
                                raw,
                                inner.name.clone(),
                                inner.ready_key.clone(),
                                inner.unacked_key.clone(),
                                inner.rejected_key.clone(),
                                inner.push_key.read().clone(),
                                Arc::clone(&inner.store),
                                inner.err_tx.clone(),
                                Arc::clone(&inner.conn_stopped),
                            );
                            if delivery_tx.send(delivery).await.is_err() {
                                break 'outer;
                            }
                            free -= 1;
                            moved = true;
                        }
                        Ok(None) => break,
                        Err(cause) => {
                            report_consume(&inner, cause);
                            break;
                        }
                    }
                }
            }
            Err(cause) => report_consume(&inner, cause),
        }

        if stop.load(Ordering::Relaxed) {
            break;
        }
        if !moved {
            tokio::select! {
                _ = tokio::time::sleep(poll_duration) => {}
                _ = stop_notify.notified() => {}
            }
        }
    }

    delivery_tx.close();
    debug!(queue = %inner.name, "Prefetch loop exited");
}

fn report_consume(inner: &QueueInner, cause: crate::error::StoreError) {
    if let Some(tx) = &inner.err_tx {
        let _ = tx.try_send(ErrorEvent::Consume {
            queue: inner.name.clone(),
            cause,
        });
    }
}

/// Drive one registered consumer until the dispatch channel closes or a
/// Stop signal arrives.
async fn handler_loop(
    inner: Arc<QueueInner>,
    delivery_rx: async_channel::Receiver<Delivery>,
    kind: ConsumerKind,
    batch: Option<BatchSpec>,
    tag: String,
    mut sig_rx: mpsc::UnboundedReceiver<Signal>,
) {
    let ctx = ConsumerContext::new(tag.clone(), Arc::clone(&inner.conn_stopped));

    match (&kind, batch) {
        (ConsumerKind::Point(_) | ConsumerKind::PointWithContext(_), _) => {
            point_loop(&inner, &delivery_rx, &kind, &ctx, &mut sig_rx).await;
        }
        (ConsumerKind::Batch(_) | ConsumerKind::BatchWithContext(_), Some(spec)) => {
            batch_loop(&inner, &delivery_rx, &kind, &ctx, spec, &mut sig_rx).await;
        }
        // Batch kinds are always registered with a spec.
        (_, None) => {}
    }

    inner.signals.remove(&tag);
    debug!(queue = %inner.name, consumer = %tag, "Consumer handler exited");
}

/// Drain pending signals without blocking. Returns false when the handler
/// should stop; `skip_next` is set when the upcoming delivery must be
/// abandoned in the unacked list.
async fn poll_signals(
    inner: &QueueInner,
    sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
    skip_next: &mut bool,
) -> bool {
    loop {
        match sig_rx.try_recv() {
            Ok(Signal::Stop) => return false,
            Ok(Signal::Skip) => *skip_next = true,
            Ok(Signal::Sleep) => tokio::time::sleep(inner.signal_sleep).await,
            Err(_) => return true,
        }
    }
}

async fn point_loop(
    inner: &QueueInner,
    delivery_rx: &async_channel::Receiver<Delivery>,
    kind: &ConsumerKind,
    ctx: &ConsumerContext,
    sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
) {
    loop {
        let mut skip_next = false;
        if !poll_signals(inner, sig_rx, &mut skip_next).await {
            break;
        }

        let delivery = match delivery_rx.recv().await {
            Ok(delivery) => delivery,
            Err(_) => break,
        };
        if skip_next {
            // Stays in unacked for the cleaner or a restart.
            continue;
        }

        match kind {
            ConsumerKind::Point(consumer) => consumer.consume(delivery).await,
            ConsumerKind::PointWithContext(consumer) => {
                consumer.consume(ctx.clone(), delivery).await
            }
            _ => unreachable!("point loop with batch consumer"),
        }
    }
}

async fn batch_loop(
    inner: &QueueInner,
    delivery_rx: &async_channel::Receiver<Delivery>,
    kind: &ConsumerKind,
    ctx: &ConsumerContext,
    spec: BatchSpec,
    sig_rx: &mut mpsc::UnboundedReceiver<Signal>,
) {
    let mut closed = false;
    while !closed {
        let mut skip_next = false;
        if !poll_signals(inner, sig_rx, &mut skip_next).await {
            break;
        }

        let first = match delivery_rx.recv().await {
            Ok(delivery) => delivery,
            Err(_) => break,
        };
        if skip_next {
            continue;
        }

        let mut batch = vec![first];
        // The flush timer runs from the first unflushed delivery.
        let deadline = tokio::time::Instant::now() + spec.timeout;
        while batch.len() < spec.size {
            match tokio::time::timeout_at(deadline, delivery_rx.recv()).await {
                Ok(Ok(delivery)) => batch.push(delivery),
                Ok(Err(_)) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        match kind {
            ConsumerKind::Batch(consumer) => consumer.consume(batch).await,
            ConsumerKind::BatchWithContext(consumer) => consumer.consume(ctx.clone(), batch).await,
            _ => unreachable!("batch loop with point consumer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{BatchConsumerFunc, ConsumerFunc};
    use crate::store::MemoryStore;

    fn test_queue(store: Arc<dyn QueueStore>) -> Queue {
        Queue::new(
            "q",
            "conn-1",
            store,
            None,
            Arc::new(AtomicBool::new(false)),
            SignalBus::new(),
            Duration::from_millis(5),
        )
    }

    async fn eventually<F, Fut>(mut probe: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if probe().await {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached in time");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    type Recorded = Arc<parking_lot::Mutex<Vec<String>>>;

    fn recording_acker(recorded: Recorded) -> Arc<dyn Consumer> {
        Arc::new(ConsumerFunc::new(move |delivery: Delivery| {
            let recorded = Arc::clone(&recorded);
            async move {
                delivery.ack().await.unwrap();
                recorded.lock().push(delivery.payload().to_string());
            }
        }))
    }

    #[tokio::test]
    async fn test_publish_and_counts() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);

        queue.publish("a").await.unwrap();
        queue.publish_bytes(b"b").await.unwrap();
        assert_eq!(queue.ready_count().await.unwrap(), 2);
        assert_eq!(queue.unacked_count().await.unwrap(), 0);
        assert_eq!(queue.rejected_count().await.unwrap(), 0);

        assert!(matches!(
            queue.publish_bytes(&[0xff, 0xfe]).await,
            Err(QueueError::InvalidPayload(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_consumer_fifo() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);

        for payload in ["a", "b", "c"] {
            queue.publish(payload).await.unwrap();
        }

        queue
            .start_consuming(2, Duration::from_millis(1))
            .unwrap();
        let recorded: Recorded = Arc::default();
        queue
            .add_consumer("fifo", recording_acker(Arc::clone(&recorded)))
            .await
            .unwrap();

        eventually(|| async { recorded.lock().len() == 3 }).await;
        assert_eq!(*recorded.lock(), vec!["a", "b", "c"]);
        eventually(|| async { queue.ready_count().await.unwrap() == 0 }).await;
        eventually(|| async { queue.unacked_count().await.unwrap() == 0 }).await;

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prefetch_budget_counts_unfinalized() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);

        for payload in ["d1", "d2", "d3", "d4", "d5", "d6"] {
            queue.publish(payload).await.unwrap();
        }
        queue
            .start_consuming(2, Duration::from_millis(1))
            .unwrap();

        eventually(|| async { queue.unacked_count().await.unwrap() == 2 }).await;
        assert_eq!(queue.ready_count().await.unwrap(), 4);

        // Without acks the budget stays exhausted.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.unacked_count().await.unwrap(), 2);
        assert_eq!(queue.ready_count().await.unwrap(), 4);

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ack_exactly_once() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);
        queue.publish("x").await.unwrap();

        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        let held: Arc<parking_lot::Mutex<Vec<Delivery>>> = Arc::default();
        let held_in = Arc::clone(&held);
        queue
            .add_consumer(
                "holder",
                Arc::new(ConsumerFunc::new(move |delivery: Delivery| {
                    let held_in = Arc::clone(&held_in);
                    async move {
                        held_in.lock().push(delivery);
                    }
                })),
            )
            .await
            .unwrap();

        eventually(|| async { !held.lock().is_empty() }).await;
        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        let delivery = held.lock().pop().unwrap();
        delivery.ack().await.unwrap();
        assert!(matches!(delivery.ack().await, Err(QueueError::NotFound)));
        assert_eq!(queue.unacked_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reject_then_return_rejected() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);
        queue.publish("y").await.unwrap();

        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        queue
            .add_consumer(
                "rejecter",
                Arc::new(ConsumerFunc::new(|delivery: Delivery| async move {
                    delivery.reject().await.unwrap();
                })),
            )
            .await
            .unwrap();

        eventually(|| async { queue.rejected_count().await.unwrap() == 1 }).await;
        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        assert_eq!(queue.return_rejected(10).await.unwrap(), 1);
        assert_eq!(queue.rejected_count().await.unwrap(), 0);
        assert_eq!(queue.ready_count().await.unwrap(), 1);

        // The returned payload is consumable again.
        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        let recorded: Recorded = Arc::default();
        queue
            .add_consumer("reader", recording_acker(Arc::clone(&recorded)))
            .await
            .unwrap();
        eventually(|| async { recorded.lock().as_slice() == ["y"] }).await;

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_graceful_stop_preserves_payloads() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);

        for i in 0..20 {
            queue.publish(&format!("p{}", i)).await.unwrap();
        }

        queue
            .start_consuming(5, Duration::from_millis(1))
            .unwrap();
        let recorded: Recorded = Arc::default();
        let in_flight = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let recorded_in = Arc::clone(&recorded);
        let in_flight_in = Arc::clone(&in_flight);
        queue
            .add_consumer(
                "slow",
                Arc::new(ConsumerFunc::new(move |delivery: Delivery| {
                    let recorded_in = Arc::clone(&recorded_in);
                    let in_flight_in = Arc::clone(&in_flight_in);
                    async move {
                        in_flight_in.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        delivery.ack().await.unwrap();
                        recorded_in.lock().push(delivery.payload().to_string());
                        in_flight_in.fetch_sub(1, Ordering::SeqCst);
                    }
                })),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        // Every in-flight handler returned before the signal fired.
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);

        let acked = recorded.lock().len() as i64;
        let ready = queue.ready_count().await.unwrap();
        let unacked = queue.unacked_count().await.unwrap();
        assert!(acked > 0);
        assert_eq!(acked + ready + unacked, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_set_payload_reroutes() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(Arc::clone(&store));
        queue.publish("old").await.unwrap();

        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        let held: Arc<parking_lot::Mutex<Vec<Delivery>>> = Arc::default();
        let held_in = Arc::clone(&held);
        queue
            .add_consumer(
                "holder",
                Arc::new(ConsumerFunc::new(move |delivery: Delivery| {
                    let held_in = Arc::clone(&held_in);
                    async move {
                        held_in.lock().push(delivery);
                    }
                })),
            )
            .await
            .unwrap();
        eventually(|| async { !held.lock().is_empty() }).await;
        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        let delivery = held.lock().pop().unwrap();
        delivery.set_payload("new").await.unwrap();

        assert_eq!(queue.unacked_count().await.unwrap(), 0);
        assert_eq!(
            store.lrange(&keys::ready_key("q"), 0, -1).await.unwrap(),
            vec!["new".to_string()]
        );
        // The original delivery is spent.
        assert!(matches!(delivery.ack().await, Err(QueueError::NotFound)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_flush_by_size() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);

        for payload in ["b1", "b2", "b3", "b4"] {
            queue.publish(payload).await.unwrap();
        }

        queue
            .start_consuming(10, Duration::from_millis(1))
            .unwrap();
        let batches: Arc<parking_lot::Mutex<Vec<usize>>> = Arc::default();
        let batches_in = Arc::clone(&batches);
        queue
            .add_batch_consumer(
                "batcher",
                2,
                Duration::from_millis(500),
                Arc::new(BatchConsumerFunc::new(move |batch: Vec<Delivery>| {
                    let batches_in = Arc::clone(&batches_in);
                    async move {
                        for delivery in &batch {
                            delivery.ack().await.unwrap();
                        }
                        batches_in.lock().push(batch.len());
                    }
                })),
            )
            .await
            .unwrap();

        eventually(|| async { batches.lock().iter().sum::<usize>() == 4 }).await;
        assert_eq!(*batches.lock(), vec![2, 2]);

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_flush_by_timeout() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);
        queue.publish("lonely").await.unwrap();

        queue
            .start_consuming(10, Duration::from_millis(1))
            .unwrap();
        let batches: Arc<parking_lot::Mutex<Vec<usize>>> = Arc::default();
        let batches_in = Arc::clone(&batches);
        queue
            .add_batch_consumer(
                "batcher",
                10,
                Duration::from_millis(30),
                Arc::new(BatchConsumerFunc::new(move |batch: Vec<Delivery>| {
                    let batches_in = Arc::clone(&batches_in);
                    async move {
                        for delivery in &batch {
                            delivery.ack().await.unwrap();
                        }
                        batches_in.lock().push(batch.len());
                    }
                })),
            )
            .await
            .unwrap();

        // A partial batch flushes once the timeout elapses.
        eventually(|| async { *batches.lock() == vec![1] }).await;

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_consume_state_errors() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(store);

        assert!(matches!(
            queue.stop_consuming(),
            Err(QueueError::NotConsuming)
        ));
        let recorded: Recorded = Arc::default();
        assert!(matches!(
            queue
                .add_consumer("early", recording_acker(Arc::clone(&recorded)))
                .await,
            Err(QueueError::NotConsuming)
        ));

        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        assert!(matches!(
            queue.start_consuming(1, Duration::from_millis(1)),
            Err(QueueError::AlreadyConsuming)
        ));

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        // A stopped queue may start again.
        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_skip_signal_abandons_next_delivery() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let bus = SignalBus::new();
        let queue = Queue::new(
            "q",
            "conn-1",
            store,
            None,
            Arc::new(AtomicBool::new(false)),
            bus.clone(),
            Duration::from_millis(5),
        );

        queue
            .start_consuming(2, Duration::from_millis(1))
            .unwrap();
        let recorded: Recorded = Arc::default();
        let tag = queue
            .add_consumer("skipper", recording_acker(Arc::clone(&recorded)))
            .await
            .unwrap();

        assert!(bus.send(&tag, Signal::Skip));
        queue.publish("a").await.unwrap();
        queue.publish("b").await.unwrap();

        // One delivery is consumed normally; the one following the Skip is
        // abandoned and stays in the unacked list.
        eventually(|| async { recorded.lock().len() == 1 }).await;
        eventually(|| async { queue.unacked_count().await.unwrap() == 1 }).await;

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
        assert_eq!(recorded.lock().len(), 1);
        assert_eq!(queue.unacked_count().await.unwrap(), 1);
        assert_eq!(queue.ready_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_signal_ends_consumer() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let bus = SignalBus::new();
        let queue = Queue::new(
            "q",
            "conn-1",
            store,
            None,
            Arc::new(AtomicBool::new(false)),
            bus.clone(),
            Duration::from_millis(5),
        );

        queue
            .start_consuming(2, Duration::from_millis(1))
            .unwrap();
        let recorded: Recorded = Arc::default();
        let tag = queue
            .add_consumer("stopper", recording_acker(Arc::clone(&recorded)))
            .await
            .unwrap();

        assert!(bus.send(&tag, Signal::Stop));
        queue.publish("x").await.unwrap();
        queue.publish("y").await.unwrap();

        // The handler observes the Stop between deliveries and exits,
        // deregistering itself; anything it did not finalize stays behind.
        eventually(|| async { bus.get(&tag).is_none() }).await;

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        let acked = recorded.lock().len() as i64;
        assert!(acked <= 1);
        assert_eq!(queue.unacked_count().await.unwrap(), 2 - acked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_push_between_queues() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(Arc::clone(&store));
        let successor = Queue::new(
            "q-next",
            "conn-1",
            Arc::clone(&store),
            None,
            Arc::new(AtomicBool::new(false)),
            SignalBus::new(),
            Duration::from_millis(5),
        );
        queue.set_push_queue(&successor);
        queue.publish("onward").await.unwrap();

        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        queue
            .add_consumer(
                "pusher",
                Arc::new(ConsumerFunc::new(|delivery: Delivery| async move {
                    delivery.push().await.unwrap();
                })),
            )
            .await
            .unwrap();

        eventually(|| async { successor.ready_count().await.unwrap() == 1 }).await;
        assert_eq!(queue.unacked_count().await.unwrap(), 0);
        assert_eq!(queue.rejected_count().await.unwrap(), 0);

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_purge_and_destroy() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryStore::new());
        let queue = test_queue(Arc::clone(&store));

        for payload in ["a", "b", "c"] {
            queue.publish(payload).await.unwrap();
        }
        assert_eq!(queue.purge_ready().await.unwrap(), 3);
        assert_eq!(queue.ready_count().await.unwrap(), 0);
        assert_eq!(queue.purge_rejected().await.unwrap(), 0);

        queue
            .start_consuming(1, Duration::from_millis(1))
            .unwrap();
        assert!(matches!(queue.destroy().await, Err(QueueError::NoConsumers)));

        let mut finished = queue.stop_consuming().unwrap();
        let _ = finished.wait_for(|done| *done).await;

        store.sadd(keys::QUEUES_KEY, "q").await.unwrap();
        queue.publish("leftover").await.unwrap();
        queue.destroy().await.unwrap();
        assert_eq!(queue.ready_count().await.unwrap(), 0);
        assert!(store.smembers(keys::QUEUES_KEY).await.unwrap().is_empty());
    }
}

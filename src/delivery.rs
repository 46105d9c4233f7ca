//! A single in-flight payload
//!
//! A delivery exists from the moment the prefetch loop moves a payload from
//! the ready list into the unacked list until one of the finalization ops
//! succeeds. The raw payload string doubles as the removal key in the
//! unacked list, so finalization never needs a separate id.
//!
//! Every blocking store op follows the same discipline: success or an
//! expected domain outcome returns immediately; any other store error is
//! reported on the error channel without blocking, then retried after a
//! fixed one-second backoff until the owning connection stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{ErrorEvent, QueueError, Result, StoreError};
use crate::payload::{self, HeaderMap};
use crate::store::QueueStore;

/// Fixed pause between retries of a failed store op
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One payload pulled from a queue, awaiting finalization
pub struct Delivery {
    payload: String,
    clear_payload: String,
    header: Option<HeaderMap>,
    queue_name: String,
    ready_key: String,
    unacked_key: String,
    rejected_key: String,
    push_key: Option<String>,
    store: Arc<dyn QueueStore>,
    err_tx: Option<mpsc::Sender<ErrorEvent>>,
    stopped: Arc<AtomicBool>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        raw_payload: String,
        queue_name: String,
        ready_key: String,
        unacked_key: String,
        rejected_key: String,
        push_key: Option<String>,
        store: Arc<dyn QueueStore>,
        err_tx: Option<mpsc::Sender<ErrorEvent>>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        let (header, clear_payload) = payload::decode(&raw_payload);
        Self {
            payload: raw_payload,
            clear_payload,
            header,
            queue_name,
            ready_key,
            unacked_key,
            rejected_key,
            push_key,
            store,
            err_tx,
            stopped,
        }
    }

    /// The payload with any header prefix removed
    pub fn payload(&self) -> &str {
        &self.clear_payload
    }

    /// Headers carried by the payload, if any
    pub fn header(&self) -> Option<&HeaderMap> {
        self.header.as_ref()
    }

    /// The queue this delivery was pulled from
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Remove this delivery from the unacked list.
    ///
    /// Returns [`QueueError::NotFound`] when no occurrence remained: the
    /// delivery was already acked, or a cleaner recovered it first.
    pub async fn ack(&self) -> Result<()> {
        let mut attempt = 0u64;
        loop {
            match self.store.lrem(&self.unacked_key, 1, &self.payload).await {
                Ok(0) => return Err(QueueError::NotFound),
                Ok(_) => return Ok(()),
                Err(cause) => {
                    attempt += 1;
                    self.report(attempt, cause);
                    if self.stopped.load(Ordering::Relaxed) {
                        return Err(QueueError::ConsumingStopped);
                    }
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Move this delivery to the rejected list
    pub async fn reject(&self) -> Result<()> {
        self.move_to(self.rejected_key.clone()).await
    }

    /// Move this delivery to the successor queue's ready list, or reject
    /// when no push queue is configured
    pub async fn push(&self) -> Result<()> {
        match &self.push_key {
            Some(key) => self.move_to(key.clone()).await,
            None => self.reject().await,
        }
    }

    /// Move this delivery back to its own ready list for redelivery
    pub async fn return_to_ready(&self) -> Result<()> {
        self.move_to(self.ready_key.clone()).await
    }

    /// Write a replacement payload to the ready list and ack the original.
    ///
    /// The replacement is an independent list entry; this delivery is
    /// finished once the call returns.
    pub async fn set_payload(&self, payload: &str) -> Result<()> {
        self.replace(payload, self.ready_key.clone()).await
    }

    /// Write a replacement payload to the rejected list and ack the original
    pub async fn set_payload_and_reject(&self, payload: &str) -> Result<()> {
        self.replace(payload, self.rejected_key.clone()).await
    }

    // The push-then-ack pair is not atomic; dying between the two steps
    // leaves a duplicate in the target list. At-least-once.
    async fn move_to(&self, target_key: String) -> Result<()> {
        self.push_with_retry(&target_key, &self.payload).await?;
        self.ack().await
    }

    async fn replace(&self, new_payload: &str, target_key: String) -> Result<()> {
        self.push_with_retry(&target_key, new_payload).await?;
        self.ack().await
    }

    async fn push_with_retry(&self, target_key: &str, value: &str) -> Result<()> {
        let mut attempt = 0u64;
        loop {
            match self.store.lpush(target_key, value).await {
                Ok(_) => return Ok(()),
                Err(cause) => {
                    attempt += 1;
                    self.report(attempt, cause);
                    if self.stopped.load(Ordering::Relaxed) {
                        return Err(QueueError::ConsumingStopped);
                    }
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    fn report(&self, attempt: u64, cause: StoreError) {
        if let Some(tx) = &self.err_tx {
            let _ = tx.try_send(ErrorEvent::Delivery {
                payload: self.clear_payload.clone(),
                queue: self.queue_name.clone(),
                attempt,
                cause,
            });
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} {}]", self.clear_payload, self.unacked_key)
    }
}

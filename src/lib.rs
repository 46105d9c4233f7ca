//! redq - durable at-least-once message queue on a Redis-compatible store
//!
//! Producers publish payloads to named queues; consumer processes attach,
//! pull batches of payloads, hand them to application handlers, and
//! acknowledge, reject, or re-enqueue each one. A payload held by a process
//! that crashes is never silently lost: it stays in that process's unacked
//! list until a cleaner notices the missing heartbeat and returns it to the
//! ready list.
//!
//! # Architecture
//!
//! Each queue is a pair of lists in the store (ready and rejected) plus one
//! unacked list per consuming connection. The moving parts:
//!
//! - A [`Connection`] is a process-scoped identity with a random token. It
//!   registers itself in a global set and keeps a short-TTL heartbeat key
//!   alive.
//! - A [`Queue`] handle publishes to the ready list and, once consuming
//!   starts, runs a prefetch task that atomically moves payloads into the
//!   connection's unacked list and dispatches them to handler tasks.
//! - A [`Delivery`] is one in-flight payload. Finalizing it (ack, reject,
//!   push, return, replace) removes it from the unacked list; transient
//!   store errors are retried with a fixed backoff.
//! - The [`Cleaner`] scans registered connections, and for any whose
//!   heartbeat key has expired, drains their unacked lists back into the
//!   ready lists and deregisters them.
//!
//! # Delivery guarantees
//!
//! At-least-once: the reject/push/return operations are a push-then-ack
//! pair, so a crash between the two steps can leave a duplicate in the
//! target list. Exactly-once and cross-consumer FIFO are out of scope; FIFO
//! holds for a single consumer on a single queue.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use redq::{Connection, ConsumerFunc, Delivery};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> redq::Result<()> {
//! let conn = Connection::open("tasks", "redis://localhost:6379", None).await?;
//! let queue = conn.open_queue("emails").await?;
//! queue.publish("send-welcome:42").await?;
//!
//! queue.start_consuming(10, Duration::from_millis(100))?;
//! queue
//!     .add_consumer(
//!         "mailer",
//!         Arc::new(ConsumerFunc::new(|delivery: Delivery| async move {
//!             println!("handling {}", delivery.payload());
//!             let _ = delivery.ack().await;
//!         })),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cleaner;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod payload;
pub mod queue;
pub mod signals;
pub mod store;

mod heartbeat;

pub use cleaner::Cleaner;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use consumer::{
    BatchConsumer, BatchConsumerFunc, Consumer, ConsumerContext, ConsumerFunc,
    ContextBatchConsumer, ContextConsumer,
};
pub use delivery::Delivery;
pub use error::{ErrorEvent, QueueError, Result, StoreError};
pub use payload::HeaderMap;
pub use queue::Queue;
pub use signals::{Signal, SignalBus};
pub use store::{MemoryStore, QueueStore, RedisStore};

//! Consumer capability traits
//!
//! Handlers come in four shapes: single-delivery or batch, each with or
//! without a context argument. Closure adapters cover the common cases
//! where defining a type is overkill.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::delivery::Delivery;

/// Runtime context handed to context-aware consumers
#[derive(Clone)]
pub struct ConsumerContext {
    tag: String,
    stopped: Arc<AtomicBool>,
}

impl ConsumerContext {
    pub(crate) fn new(tag: String, stopped: Arc<AtomicBool>) -> Self {
        Self { tag, stopped }
    }

    /// The uniquified tag this consumer was registered under
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether the owning connection has begun stopping; long-running
    /// handlers should check this and finalize early
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Handler invoked with one delivery at a time
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, delivery: Delivery);
}

/// Handler invoked with batches of deliveries
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn consume(&self, batch: Vec<Delivery>);
}

/// Single-delivery handler that also observes its runtime context
#[async_trait]
pub trait ContextConsumer: Send + Sync {
    async fn consume(&self, ctx: ConsumerContext, delivery: Delivery);
}

/// Batch handler that also observes its runtime context
#[async_trait]
pub trait ContextBatchConsumer: Send + Sync {
    async fn consume(&self, ctx: ConsumerContext, batch: Vec<Delivery>);
}

/// Adapter turning an async closure into a [`Consumer`]
pub struct ConsumerFunc<F>(F);

impl<F, Fut> ConsumerFunc<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Consumer for ConsumerFunc<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn consume(&self, delivery: Delivery) {
        (self.0)(delivery).await;
    }
}

/// Adapter turning an async closure into a [`BatchConsumer`]
pub struct BatchConsumerFunc<F>(F);

impl<F, Fut> BatchConsumerFunc<F>
where
    F: Fn(Vec<Delivery>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> BatchConsumer for BatchConsumerFunc<F>
where
    F: Fn(Vec<Delivery>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn consume(&self, batch: Vec<Delivery>) {
        (self.0)(batch).await;
    }
}

/// The registered shapes a handler task can dispatch to
pub(crate) enum ConsumerKind {
    Point(Arc<dyn Consumer>),
    PointWithContext(Arc<dyn ContextConsumer>),
    Batch(Arc<dyn BatchConsumer>),
    BatchWithContext(Arc<dyn ContextBatchConsumer>),
}

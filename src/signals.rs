//! Signal bus for external control of consumer loops
//!
//! A bus maps consumer names to channels carrying control signals. Consumer
//! handlers poll their channel non-blockingly between deliveries. The bus is
//! a value passed into connection constructors, never a process global, so
//! tests can run independent buses side by side.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Control signal for a consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Gracefully shut down the consumer
    Stop,
    /// Abandon the next delivery, leaving it in the unacked list
    Skip,
    /// Pause polling for the configured sleep interval
    Sleep,
}

/// Registry of named signal channels
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Signal>>>>,
}

impl SignalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under a consumer name, replacing any previous one
    pub fn add(&self, name: &str, sender: mpsc::UnboundedSender<Signal>) {
        self.inner.lock().insert(name.to_string(), sender);
    }

    /// Remove a consumer's channel
    pub fn remove(&self, name: &str) {
        self.inner.lock().remove(name);
    }

    /// Look up a consumer's channel
    pub fn get(&self, name: &str) -> Option<mpsc::UnboundedSender<Signal>> {
        self.inner.lock().get(name).cloned()
    }

    /// Send a signal to a named consumer. Returns false when no such
    /// consumer is registered or its handler has exited.
    pub fn send(&self, name: &str, signal: Signal) -> bool {
        match self.get(name) {
            Some(sender) => sender.send(signal).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.inner.lock().keys().cloned().collect();
        f.debug_struct("SignalBus").field("consumers", &names).finish()
    }
}

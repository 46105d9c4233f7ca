//! Recovery of payloads held by dead connections
//!
//! A connection is dead when its id is still registered but its heartbeat
//! key is gone. The cleaner drains each such connection's unacked lists back
//! into the owning queues' ready lists and deregisters it. Draining uses
//! the same tail-to-head move as consuming, so recovered payloads land
//! closest to the head of ready in reverse pull order: the most recently
//! pulled (never processed) go back first in line.
//!
//! Cleaning runs out-of-band, typically on its own schedule from any live
//! process.

use std::sync::Arc;

use tracing::info;

use crate::connection::Connection;
use crate::error::Result;
use crate::keys;
use crate::store::QueueStore;

/// Recovers unacked payloads from connections that stopped heartbeating
pub struct Cleaner {
    connection: Connection,
}

impl Cleaner {
    /// Create a cleaner running over the given connection's store
    pub fn new(connection: &Connection) -> Self {
        Self {
            connection: connection.clone(),
        }
    }

    /// Scan all registered connections and recover the dead ones.
    ///
    /// Returns the total number of deliveries moved back to ready lists.
    /// Live connections (heartbeat key present) are never touched.
    pub async fn clean(&self) -> Result<u64> {
        let store = self.connection.store();
        let mut returned = 0u64;

        for cid in store.smembers(keys::CONNECTIONS_KEY).await? {
            if store.exists(&keys::heartbeat_key(&cid)).await? {
                continue;
            }

            let recovered = recover_connection(store, &cid).await?;
            if recovered > 0 {
                info!(connection = %cid, recovered, "Recovered deliveries from dead connection");
            }
            returned += recovered;
        }

        Ok(returned)
    }
}

/// Drain one connection's unacked lists into their ready lists and remove
/// every key scoped to it. Shared between the cleaner and connection
/// shutdown.
pub(crate) async fn recover_connection(
    store: &Arc<dyn QueueStore>,
    connection_id: &str,
) -> Result<u64> {
    let mut moved = 0u64;

    for queue in store
        .smembers(&keys::connection_queues_key(connection_id))
        .await?
    {
        let unacked = keys::unacked_key(connection_id, &queue);
        let ready = keys::ready_key(&queue);

        while store.rpoplpush(&unacked, &ready).await?.is_some() {
            moved += 1;
        }
        store
            .del(&keys::consumers_key(connection_id, &queue))
            .await?;
    }

    store
        .del(&keys::connection_queues_key(connection_id))
        .await?;
    store.srem(keys::CONNECTIONS_KEY, connection_id).await?;

    Ok(moved)
}

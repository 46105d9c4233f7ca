//! Key schema for all backing-store state
//!
//! Every key derives by deterministic concatenation from the connection id,
//! queue name, and consumer tag. The templates are fixed; changing them
//! breaks compatibility with persisted lists.

/// Namespace prefix for every key the library touches
const PREFIX: &str = "redq";

/// Set of all known connection ids
pub const CONNECTIONS_KEY: &str = "redq:connections";

/// Set of all queue names ever opened
pub const QUEUES_KEY: &str = "redq:queues";

/// Liveness key for a connection; carries a TTL and vanishes when the
/// owning process dies
pub fn heartbeat_key(connection_id: &str) -> String {
    format!("{}:connection:{}:heartbeat", PREFIX, connection_id)
}

/// Set of queue names opened on a connection
pub fn connection_queues_key(connection_id: &str) -> String {
    format!("{}:connection:{}:queues", PREFIX, connection_id)
}

/// Set of consumer tags active on a connection's queue binding
pub fn consumers_key(connection_id: &str, queue: &str) -> String {
    format!(
        "{}:connection:{}:queue:{}:consumers",
        PREFIX, connection_id, queue
    )
}

/// List of payloads pulled by a connection's queue binding but not yet
/// finalized; shared by all consumers of the binding
pub fn unacked_key(connection_id: &str, queue: &str) -> String {
    format!(
        "{}:connection:{}:queue:{}:unacked",
        PREFIX, connection_id, queue
    )
}

/// List of payloads awaiting a consumer
pub fn ready_key(queue: &str) -> String {
    format!("{}:queue:{}:ready", PREFIX, queue)
}

/// List of payloads application logic refused
pub fn rejected_key(queue: &str) -> String {
    format!("{}:queue:{}:rejected", PREFIX, queue)
}

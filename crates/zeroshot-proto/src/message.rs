//! The immutable bus message record.

use crate::Topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Publisher id used for messages originating from the supervisor itself.
pub const ORCHESTRATOR_PUBLISHER: &str = "orchestrator";

/// A single entry in a cluster's message ledger.
///
/// Messages are immutable once published. Sequence numbers are assigned by
/// the bus under its lock and are gap-free and strictly increasing within a
/// cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Monotonically increasing sequence number, 1-based per cluster.
    pub seq: u64,

    /// The cluster this message belongs to.
    pub cluster_id: String,

    /// Routing topic.
    pub topic: Topic,

    /// Agent id of the publisher, or `"orchestrator"`.
    pub publisher: String,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// Assignment time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Returns the payload's `text` field if present, for prompt templating.
    pub fn payload_text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|v| v.as_str())
    }
}

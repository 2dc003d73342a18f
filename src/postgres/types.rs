use serde::{Deserialize, Serialize};

/// One decoded row image: column name to text value (or null), in the
/// relation's column order.
pub type Tuple = serde_json::Map<String, serde_json::Value>;

/// A decoded replication event, serialized for subscribers as a JSON object
/// tagged by `type`.
///
/// Begin and Relation messages update decoder state but produce no event.
/// Column values are surfaced as text exactly as they appear on the wire;
/// interpreting them against their type OIDs is left to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecodedEvent {
    Insert {
        table: String,
        data: Tuple,
    },
    Update {
        table: String,
        old: Option<Tuple>,
        new: Tuple,
    },
    Delete {
        table: String,
        old: Tuple,
    },
    Commit {
        lsn: u64,
        /// Microseconds since 2000-01-01 00:00:00 UTC.
        timestamp: i64,
    },
}

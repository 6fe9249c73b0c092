//! The transport contract every stream backend satisfies.

use async_trait::async_trait;
use std::time::Duration;

use vantage_core::ScanError;

/// One entry read from a stream: the backend-assigned id plus flat
/// field/value pairs. The transport never carries nested maps; structured
/// values (like `metadata`) travel as JSON-encoded strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A log-structured stream with consumer groups.
///
/// Guarantees required of implementations:
/// - at-least-once delivery per consumer group; `ack` removes from pending
/// - within a group, each entry is delivered to one consumer at a time
/// - entries unacked for `min_idle` may be reassigned via `auto_claim`
/// - producers observe FIFO append order per key
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry; returns the assigned id.
    async fn append(&self, key: &str, fields: &[(String, String)]) -> Result<String, ScanError>;

    /// Create a consumer group reading from the earliest entry. A
    /// pre-existing group is not an error and its cursor is left alone.
    async fn create_group(&self, key: &str, group: &str) -> Result<(), ScanError>;

    /// Read up to `max` never-delivered entries for `consumer`, blocking
    /// up to `block` when the stream is drained.
    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, ScanError>;

    /// Acknowledge one entry for the group.
    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), ScanError>;

    /// Claim up to `max` entries pending longer than `min_idle` for
    /// `consumer`, restarting their idle clocks.
    async fn auto_claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> Result<Vec<StreamEntry>, ScanError>;

    /// Arm a TTL on a stream key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ScanError>;

    /// Set a plain key with a TTL (progress and status keys).
    async fn set_key(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ScanError>;

    /// Read a plain key.
    async fn get_key(&self, key: &str) -> Result<Option<String>, ScanError>;
}

//! Group-reader helper for streaming consumers.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use vantage_core::ScanError;

use crate::transport::{StreamEntry, StreamTransport};
use crate::{DEFAULT_BLOCK, DEFAULT_MIN_IDLE};

/// Reads one stream on behalf of a named consumer within a group.
///
/// Interleaves periodic `auto_claim` calls with blocking group reads so
/// messages stranded by dead consumers get picked up.
pub struct GroupConsumer {
    transport: Arc<dyn StreamTransport>,
    key: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block: Duration,
    min_idle: Duration,
    last_claim: Instant,
}

impl GroupConsumer {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            key: key.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 100,
            block: DEFAULT_BLOCK,
            min_idle: DEFAULT_MIN_IDLE,
            last_claim: Instant::now(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Idempotently create the consumer group.
    pub async fn ensure_group(&self) -> Result<(), ScanError> {
        self.transport.create_group(&self.key, &self.group).await
    }

    /// Next batch of entries: reclaimed idle messages when the claim
    /// interval has elapsed, otherwise a blocking group read.
    pub async fn next_batch(&mut self) -> Result<Vec<StreamEntry>, ScanError> {
        if self.last_claim.elapsed() >= self.min_idle {
            self.last_claim = Instant::now();
            let claimed = self
                .transport
                .auto_claim(
                    &self.key,
                    &self.group,
                    &self.consumer,
                    self.min_idle,
                    self.batch_size,
                )
                .await?;
            if !claimed.is_empty() {
                debug!(
                    key = %self.key,
                    count = claimed.len(),
                    "claimed idle messages from the group"
                );
                return Ok(claimed);
            }
        }

        self.transport
            .read_group(
                &self.key,
                &self.group,
                &self.consumer,
                self.batch_size,
                self.block,
            )
            .await
    }

    pub async fn ack(&self, id: &str) -> Result<(), ScanError> {
        self.transport.ack(&self.key, &self.group, id).await
    }
}

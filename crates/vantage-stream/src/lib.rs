//! Stream transport for the recon pipeline.
//!
//! A thin contract over a log-structured stream with consumer groups,
//! at-least-once delivery, idle-based reclaim, and per-key TTL. The
//! production backend is Redis Streams; an in-memory backend with the
//! same semantics backs the tests.

pub mod consumer;
pub mod memory;
pub mod producer;
pub mod record;
pub mod redis;
pub mod transport;

pub use self::redis::RedisTransport;
pub use consumer::GroupConsumer;
pub use memory::MemoryTransport;
pub use producer::StreamProducer;
pub use record::{CompletionMarker, StreamRecord, COMPLETION_TYPE};
pub use transport::{StreamEntry, StreamTransport};

use std::time::Duration;
use uuid::Uuid;

/// Stream keys expire this long after completion.
pub const STREAM_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default XREADGROUP block timeout.
pub const DEFAULT_BLOCK: Duration = Duration::from_millis(5_000);

/// Messages unacked this long may be reassigned to another consumer.
pub const DEFAULT_MIN_IDLE: Duration = Duration::from_secs(5 * 60);

/// Output stream key for one producer of one scan job.
pub fn output_stream_key(scan_job_id: Uuid, module: &str) -> String {
    format!("scan:{scan_job_id}:{module}:output")
}

/// Consumer group name for a consuming module.
pub fn consumer_group(module: &str) -> String {
    format!("{module}-consumers")
}

/// Consumer name for one task of a consuming module.
pub fn consumer_name(module: &str, task_id: &str) -> String {
    format!("{module}-task-{task_id}")
}

/// Key holding a worker's progress snapshot for orchestrator polling.
pub fn progress_key(batch_id: Uuid) -> String {
    format!("batch_progress:{batch_id}")
}

/// Per-module status key for one scan job.
pub fn module_status_key(scan_job_id: Uuid, module: &str) -> String {
    format!("module_status:{scan_job_id}:{module}")
}

//! Error taxonomy shared across the pipeline, workers, and adapters.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur anywhere in the scan pipeline.
///
/// The split between transient and terminal kinds drives retry behavior:
/// transient errors are retried with backoff and degrade to `BatchFailed`
/// for the affected batch only; terminal kinds surface as row status
/// changes, never as a panic.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Required environment variables are missing. Fatal at process start.
    #[error("missing required environment variables: {}", missing.join(", "))]
    Config { missing: Vec<String> },

    /// Pipeline-level rejection before any task launches.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Input could not be parsed as an absolute URL.
    #[error("invalid URL '{0}': {1}")]
    InvalidUrl(String, String),

    /// The module dependency graph contains a cycle.
    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// Unknown or inactive module referenced in a request.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A module profile failed registry validation at load.
    #[error("invalid module profile: {0}")]
    InvalidProfile(String),

    /// Retryable store failure (connection reset, serialization conflict).
    #[error("transient store error: {0}")]
    TransientStore(String),

    /// Retryable network failure.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Non-retryable store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Non-retryable stream failure.
    #[error("stream error: {0}")]
    Stream(String),

    /// The underlying scanner hit its deadline for one domain.
    #[error("scanner timed out on {domain}")]
    ScannerTimeout { domain: String },

    /// The scanner failed outright for one domain.
    #[error("scanner failed on {domain}: {reason}")]
    ScannerFailed { domain: String, reason: String },

    /// Terminal for a batch; never fatal to the scan.
    #[error("batch {batch_id} failed: {reason}")]
    BatchFailed { batch_id: Uuid, reason: String },

    /// The global pipeline deadline fired.
    #[error("pipeline timed out after {0}s")]
    PipelineTimeout(u64),

    /// The process received SIGINT/SIGTERM.
    #[error("interrupted by {signal}")]
    Interrupted { signal: String },

    /// Cooperative cancellation observed mid-operation.
    #[error("cancelled")]
    Cancelled,

    /// Failed to spawn or poll a worker task.
    #[error("task runtime error: {0}")]
    Runtime(String),
}

impl ScanError {
    /// True for errors worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::TransientStore(_) | ScanError::TransientNetwork(_)
        )
    }

    /// Cancellation and interruption propagate; everything else is handled
    /// at the layer that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::Cancelled | ScanError::Interrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_lists_all_missing_vars() {
        let err = ScanError::Config {
            missing: vec!["SCAN_JOB_ID".to_string(), "USER_ID".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("SCAN_JOB_ID"));
        assert!(msg.contains("USER_ID"));
    }

    #[test]
    fn transient_classification() {
        assert!(ScanError::TransientStore("reset".into()).is_transient());
        assert!(ScanError::TransientNetwork("refused".into()).is_transient());
        assert!(!ScanError::Cancelled.is_transient());
        assert!(!ScanError::Store("constraint".into()).is_transient());
    }

    #[test]
    fn cancellation_is_fatal() {
        assert!(ScanError::Cancelled.is_fatal());
        assert!(ScanError::Interrupted {
            signal: "SIGTERM".into()
        }
        .is_fatal());
        assert!(!ScanError::ScannerTimeout {
            domain: "example.com".into()
        }
        .is_fatal());
    }

    #[test]
    fn cycle_message_shows_path() {
        let err = ScanError::CircularDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency: a -> b -> a");
    }
}

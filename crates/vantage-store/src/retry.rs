//! Retry wrapper for row updates.
//!
//! Progress updates must survive brief store hiccups: transient errors are
//! retried with exponential backoff, anything else propagates immediately.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use vantage_core::ScanError;

/// Transient failures tolerated per update.
pub const DEFAULT_UPDATE_ATTEMPTS: u32 = 3;

/// Run `op` until it succeeds, a non-transient error occurs, or
/// `attempts` transient failures have been burned.
pub async fn with_store_retry<T, F, Fut>(
    what: &str,
    attempts: u32,
    mut op: F,
) -> Result<T, ScanError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScanError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                attempt += 1;
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1));
                warn!(
                    what,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient store error, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

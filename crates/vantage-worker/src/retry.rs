//! Per-domain scan attempts with quadratic backoff.

use std::time::Duration;
use tracing::{debug, warn};

use vantage_core::types::Discovery;
use vantage_core::ScanError;

use crate::scanner::{DomainScanner, ScanContext};
use crate::shutdown::CancelToken;

/// Terminal status of one domain after its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Completed,
    /// The scanner timed out but yielded records; they are kept.
    PartialSuccess,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct DomainResult {
    pub status: DomainStatus,
    pub records: Vec<Discovery>,
    pub error: Option<String>,
}

/// Scan one target, retrying transient failures up to `max_retries` with
/// `attempt² × backoff_unit` sleeps between attempts. Cancellation is
/// fatal and never retried; a timeout that produced records is demoted to
/// partial success.
pub async fn scan_with_retry(
    scanner: &dyn DomainScanner,
    target: &str,
    ctx: &ScanContext,
    cancel: &CancelToken,
    max_retries: u32,
    backoff_unit: Duration,
) -> DomainResult {
    let mut last_error: Option<String> = None;

    for attempt in 0..=max_retries {
        if cancel.is_cancelled() {
            return DomainResult {
                status: DomainStatus::Cancelled,
                records: Vec::new(),
                error: last_error,
            };
        }

        // The scanner itself is a suspension point: cancellation abandons
        // the in-flight attempt (child processes die with their future).
        let mut token = cancel.clone();
        let attempt_result = tokio::select! {
            result = scanner.scan(target, ctx) => result,
            _ = token.cancelled() => {
                return DomainResult {
                    status: DomainStatus::Cancelled,
                    records: Vec::new(),
                    error: last_error,
                };
            }
        };

        match attempt_result {
            Ok(output) if !output.timed_out => {
                debug!(target, attempt, records = output.records.len(), "domain scanned");
                return DomainResult {
                    status: DomainStatus::Completed,
                    records: output.records,
                    error: None,
                };
            }
            Ok(output) if !output.records.is_empty() => {
                warn!(
                    target,
                    attempt,
                    records = output.records.len(),
                    "scanner timed out with partial output"
                );
                return DomainResult {
                    status: DomainStatus::PartialSuccess,
                    records: output.records,
                    error: Some(
                        ScanError::ScannerTimeout {
                            domain: target.to_string(),
                        }
                        .to_string(),
                    ),
                };
            }
            Ok(_) => {
                last_error = Some(
                    ScanError::ScannerTimeout {
                        domain: target.to_string(),
                    }
                    .to_string(),
                );
            }
            Err(e) if e.is_fatal() => {
                return DomainResult {
                    status: DomainStatus::Cancelled,
                    records: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
            Err(e) => {
                warn!(target, attempt, error = %e, "scan attempt failed");
                last_error = Some(e.to_string());
            }
        }

        if attempt < max_retries {
            let t = attempt + 1;
            let backoff = backoff_unit * (t * t);
            let mut token = cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = token.cancelled() => {
                    return DomainResult {
                        status: DomainStatus::Cancelled,
                        records: Vec::new(),
                        error: last_error,
                    };
                }
            }
        }
    }

    DomainResult {
        status: DomainStatus::Failed,
        records: Vec::new(),
        error: last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{FnScanner, ScannerOutput};
    use crate::shutdown::{cancel_pair, CancelReason};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn ctx() -> ScanContext {
        ScanContext {
            scan_job_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            module: "subfinder".to_string(),
        }
    }

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn success_on_first_attempt() {
        let scanner = FnScanner(|_: &str, _: &ScanContext| {
            Ok(ScannerOutput {
                records: Vec::new(),
                timed_out: false,
            })
        });
        let (_h, token) = cancel_pair();
        let result = scan_with_retry(&scanner, "example.com", &ctx(), &token, 2, FAST).await;
        assert_eq!(result.status, DomainStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let scanner = FnScanner(move |target: &str, _: &ScanContext| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ScanError::ScannerFailed {
                    domain: target.to_string(),
                    reason: "flaky".to_string(),
                })
            } else {
                Ok(ScannerOutput::default())
            }
        });
        let (_h, token) = cancel_pair();
        let result = scan_with_retry(&scanner, "example.com", &ctx(), &token, 2, FAST).await;
        assert_eq!(result.status, DomainStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_fails_the_domain() {
        let scanner = FnScanner(|target: &str, _: &ScanContext| {
            Err(ScanError::ScannerFailed {
                domain: target.to_string(),
                reason: "down".to_string(),
            })
        });
        let (_h, token) = cancel_pair();
        let result = scan_with_retry(&scanner, "example.com", &ctx(), &token, 2, FAST).await;
        assert_eq!(result.status, DomainStatus::Failed);
        assert!(result.error.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn timeout_with_records_is_partial_success() {
        let c = ctx();
        let scan_job_id = c.scan_job_id;
        let scanner = FnScanner(move |_: &str, c: &ScanContext| {
            Ok(ScannerOutput {
                records: vec![Discovery::Subdomain(vantage_core::types::Subdomain {
                    scan_job_id: c.scan_job_id,
                    asset_id: c.asset_id,
                    subdomain: "a.example.com".to_string(),
                    source: c.module.clone(),
                    discovered_at: chrono::Utc::now(),
                })],
                timed_out: true,
            })
        });
        let (_h, token) = cancel_pair();
        let result = scan_with_retry(&scanner, "example.com", &c, &token, 2, FAST).await;
        assert_eq!(result.status, DomainStatus::PartialSuccess);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].scan_job_id(), scan_job_id);
    }

    #[tokio::test]
    async fn timeout_without_records_eventually_fails() {
        let scanner = FnScanner(|_: &str, _: &ScanContext| {
            Ok(ScannerOutput {
                records: Vec::new(),
                timed_out: true,
            })
        });
        let (_h, token) = cancel_pair();
        let result = scan_with_retry(&scanner, "example.com", &ctx(), &token, 1, FAST).await;
        assert_eq!(result.status, DomainStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_is_fatal_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let scanner = FnScanner(move |_: &str, _: &ScanContext| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(ScanError::Cancelled)
        });
        let (_h, token) = cancel_pair();
        let result = scan_with_retry(&scanner, "example.com", &ctx(), &token, 5, FAST).await;
        assert_eq!(result.status, DomainStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_context_skips_scanning() {
        let scanner = FnScanner(|_: &str, _: &ScanContext| {
            panic!("scanner must not run under a cancelled context")
        });
        let (handle, token) = cancel_pair();
        handle.cancel(CancelReason::Requested);
        let result = scan_with_retry(&scanner, "example.com", &ctx(), &token, 2, FAST).await;
        assert_eq!(result.status, DomainStatus::Cancelled);
    }
}

//! Bounded-concurrency scan loop.
//!
//! A fixed pool of workers drains the domain list; every attempt first
//! takes a token from the shared bucket, so the request rate is global
//! across the pool. Cancellation stops scheduling and lets in-flight
//! domains wind down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::metrics::WorkerMetrics;
use crate::progress::ProgressReporter;
use crate::rate::TokenBucket;
use crate::results::ResultSink;
use crate::retry::{scan_with_retry, DomainStatus};
use crate::scanner::{DomainScanner, ScanContext};
use crate::shutdown::CancelToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    pub completed: u64,
    pub failed: u64,
    pub partial: u64,
    pub cancelled: u64,
}

#[allow(clippy::too_many_arguments)]
pub async fn scan_domains(
    domains: Vec<String>,
    scanner: Arc<dyn DomainScanner>,
    ctx: ScanContext,
    sink: Arc<ResultSink>,
    progress: Arc<ProgressReporter>,
    limiter: Arc<TokenBucket>,
    cancel: CancelToken,
    workers: usize,
    max_retries: u32,
    backoff_unit: Duration,
    metrics: WorkerMetrics,
) -> PoolSummary {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut join_set: JoinSet<DomainStatus> = JoinSet::new();
    let total = domains.len();
    let mut summary = PoolSummary::default();

    for domain in domains {
        if cancel.is_cancelled() {
            summary.cancelled += 1;
            continue;
        }

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let scanner = scanner.clone();
        let ctx = ctx.clone();
        let sink = sink.clone();
        let progress = progress.clone();
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        let metrics = metrics.clone();

        join_set.spawn(async move {
            let _permit = permit;

            if limiter.acquire(&cancel).await.is_err() {
                return DomainStatus::Cancelled;
            }

            metrics.domains_in_flight.inc();
            let mut result = scan_with_retry(
                scanner.as_ref(),
                &domain,
                &ctx,
                &cancel,
                max_retries,
                backoff_unit,
            )
            .await;
            metrics.domains_in_flight.dec();

            if !result.records.is_empty() {
                if let Err(e) = sink.accept(std::mem::take(&mut result.records)).await {
                    error!(domain = domain.as_str(), error = %e, "failed to sink results");
                    result.status = DomainStatus::Failed;
                }
            }

            match result.status {
                DomainStatus::Completed | DomainStatus::PartialSuccess => {
                    metrics.domains_completed.inc();
                }
                DomainStatus::Failed => {
                    metrics.domains_failed.inc();
                }
                DomainStatus::Cancelled => {}
            }
            progress.record(result.status);
            result.status
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(DomainStatus::Completed) => summary.completed += 1,
            Ok(DomainStatus::PartialSuccess) => {
                summary.completed += 1;
                summary.partial += 1;
            }
            Ok(DomainStatus::Failed) => summary.failed += 1,
            Ok(DomainStatus::Cancelled) => summary.cancelled += 1,
            Err(e) => {
                error!(error = %e, "scan task panicked");
                summary.failed += 1;
            }
        }
    }

    info!(
        total,
        completed = summary.completed,
        failed = summary.failed,
        partial = summary.partial,
        cancelled = summary.cancelled,
        "scan pool drained"
    );
    summary
}

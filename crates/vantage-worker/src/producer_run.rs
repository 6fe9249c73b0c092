//! Simple- and batch-mode execution: scan a domain list, persist, and
//! (when streaming) produce to the output stream.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use vantage_core::types::{BatchStatus, WorkerState};
use vantage_core::ScanError;
use vantage_stream::StreamProducer;

use crate::config::Mode;
use crate::pool::scan_domains;
use crate::progress::ProgressReporter;
use crate::rate::TokenBucket;
use crate::results::ResultSink;
use crate::runner::{resolve_scope, WorkerContext, WorkerSummary, FLUSH_DEADLINE};
use crate::scanner::ScanContext;
use crate::shutdown::CancelReason;

pub async fn run(ctx: &WorkerContext) -> Result<WorkerSummary, ScanError> {
    let config = &ctx.config;

    let domains: Vec<String> = match config.mode {
        Mode::Simple => config.domains.clone(),
        Mode::Batch if !config.batch_domains.is_empty() => config.batch_domains.clone(),
        Mode::Batch => {
            let asset_id = config.asset_id.ok_or_else(|| ScanError::Config {
                missing: vec!["ASSET_ID".to_string()],
            })?;
            ctx.store
                .fetch_seed_data(
                    &config.module,
                    asset_id,
                    config.batch_offset,
                    config.batch_limit,
                )
                .await?
        }
        Mode::StreamingConsumer => {
            return Err(ScanError::InvalidRequest(
                "consumer mode routed to the producer path".to_string(),
            ))
        }
    };

    let scope = resolve_scope(ctx, &domains).await;
    let producer = match (&config.stream_output_key, &ctx.transport) {
        (Some(key), Some(transport)) if config.streaming_mode => Some(StreamProducer::with_key(
            transport.clone(),
            key.clone(),
            config.scan_job_id,
            &config.module,
        )),
        _ => None,
    };

    let sink = Arc::new(ResultSink::new(
        ctx.store.clone(),
        scope,
        producer,
        ctx.metrics.clone(),
    ));
    let progress = Arc::new(ProgressReporter::new(
        ctx.store.clone(),
        ctx.transport.clone(),
        config.batch_id,
        config.scan_job_id,
        config.module.clone(),
        domains.len() as u64,
    ));
    progress.started().await?;

    info!(
        module = config.module.as_str(),
        mode = ?config.mode,
        domains = domains.len(),
        workers = config.workers,
        "worker running"
    );

    // Periodic activity: flush the buffer and touch the batch row so the
    // orchestrator sees a live last_activity_at.
    let ticker = {
        let sink = sink.clone();
        let progress = progress.clone();
        let mut cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = sink.flush().await {
                            warn!(error = %e, "periodic flush failed");
                        }
                        if let Err(e) = progress.publish(BatchStatus::Running, None).await {
                            warn!(error = %e, "periodic progress update failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let scan_ctx = ScanContext {
        scan_job_id: config.scan_job_id,
        asset_id: config.asset_id.unwrap_or(config.scan_job_id),
        module: config.module.clone(),
    };
    let limiter = Arc::new(TokenBucket::new(
        config.rate_per_sec,
        config.rate_per_sec.max(config.workers as f64),
    ));

    let summary = scan_domains(
        domains,
        ctx.scanner.clone(),
        scan_ctx,
        sink.clone(),
        progress.clone(),
        limiter,
        ctx.cancel.clone(),
        config.workers,
        config.max_retries,
        Duration::from_secs(1),
        ctx.metrics.clone(),
    )
    .await;
    ticker.abort();
    progress.set_out_of_scope(sink.out_of_scope());

    // Flushing: drain buffers; the completion marker is written only on a
    // non-cancelled exit, so an interrupted producer is detectable by its
    // missing marker.
    let state = if ctx.cancel.is_cancelled() {
        match tokio::time::timeout(FLUSH_DEADLINE, sink.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "best-effort flush after cancellation failed"),
            Err(_) => warn!("best-effort flush after cancellation timed out"),
        }
        match ctx.cancel.reason() {
            Some(CancelReason::Signal(signal)) => {
                if let Err(e) = progress.interrupted(&signal).await {
                    warn!(error = %e, "failed to write interrupted status");
                }
                WorkerState::Interrupted
            }
            _ => {
                progress
                    .completed_with(BatchStatus::Cancelled, Some("cancelled".to_string()))
                    .await
                    .ok();
                WorkerState::Cancelled
            }
        }
    } else {
        sink.finish().await?;
        let failed_everything = summary.completed == 0 && summary.failed > 0;
        let status = if failed_everything {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        progress
            .completed_with(
                status,
                failed_everything.then(|| "all domains failed".to_string()),
            )
            .await?;
        if failed_everything {
            WorkerState::Failed
        } else {
            WorkerState::Completed
        }
    };

    Ok(WorkerSummary {
        state,
        completed_domains: summary.completed,
        failed_domains: summary.failed,
        partial_domains: summary.partial,
        out_of_scope: sink.out_of_scope(),
        deduped: sink.suppressed(),
        streamed: sink.streamed(),
        consumed: 0,
    })
}

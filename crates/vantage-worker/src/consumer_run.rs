//! Streaming-consumer execution: read upstream output streams through a
//! consumer group, process each record, persist, optionally re-stream.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use vantage_core::types::{BatchStatus, WorkerState};
use vantage_core::ScanError;
use vantage_stream::record::{decode, StreamRecord};
use vantage_stream::{GroupConsumer, StreamProducer};

use crate::progress::ProgressReporter;
use crate::rate::TokenBucket;
use crate::results::ResultSink;
use crate::retry::{scan_with_retry, DomainStatus};
use crate::runner::{resolve_scope, WorkerContext, WorkerSummary, FLUSH_DEADLINE};
use crate::scanner::{target_of, ScanContext};
use crate::shutdown::CancelReason;

pub async fn run(ctx: &WorkerContext) -> Result<WorkerSummary, ScanError> {
    let config = &ctx.config;
    let transport = ctx.transport.clone().ok_or_else(|| ScanError::Config {
        missing: vec!["REDIS_HOST".to_string(), "REDIS_PORT".to_string()],
    })?;
    let group = config.consumer_group.clone().ok_or_else(|| ScanError::Config {
        missing: vec!["CONSUMER_GROUP_NAME".to_string()],
    })?;
    let consumer_name = config.consumer_name.clone().ok_or_else(|| ScanError::Config {
        missing: vec!["CONSUMER_NAME".to_string()],
    })?;

    let scope = resolve_scope(ctx, &[]).await;
    let producer = config.stream_output_key.as_ref().map(|key| {
        StreamProducer::with_key(
            transport.clone(),
            key.clone(),
            config.scan_job_id,
            &config.module,
        )
    });
    let sink = Arc::new(ResultSink::new(
        ctx.store.clone(),
        scope,
        producer,
        ctx.metrics.clone(),
    ));
    let progress = Arc::new(ProgressReporter::new(
        ctx.store.clone(),
        Some(transport.clone()),
        config.batch_id,
        config.scan_job_id,
        config.module.clone(),
        0,
    ));
    progress.started().await?;

    if config.stream_input_keys.is_empty() {
        return Err(ScanError::Config {
            missing: vec!["STREAM_INPUT_KEY".to_string()],
        });
    }

    // One group reader per upstream stream; with parallel producers the
    // consumer reads their union and tracks completion per stream.
    let mut readers: Vec<GroupConsumer> = Vec::new();
    for key in &config.stream_input_keys {
        let reader = GroupConsumer::new(
            transport.clone(),
            key.clone(),
            group.clone(),
            consumer_name.clone(),
        )
        .with_batch_size(config.batch_size)
        .with_block(config.block)
        .with_min_idle(config.min_idle);
        reader.ensure_group().await?;
        readers.push(reader);
    }

    let scan_ctx = ScanContext {
        scan_job_id: config.scan_job_id,
        asset_id: config.asset_id.unwrap_or(config.scan_job_id),
        module: config.module.clone(),
    };
    let limiter = TokenBucket::new(
        config.rate_per_sec,
        config.rate_per_sec.max(config.workers as f64),
    );

    // A shared stream key carries one marker per upstream producer task;
    // the launcher says how many to expect (default: one per stream).
    let expected_markers = config
        .expected_completions
        .unwrap_or(readers.len() as u64)
        .max(1);
    let deadline = Instant::now() + config.max_processing_time;
    let mut markers_seen: u64 = 0;
    let mut upstream_totals: u64 = 0;
    let mut consumed: u64 = 0;
    let mut last_progress = Instant::now();

    info!(
        module = config.module.as_str(),
        streams = readers.len(),
        group = group.as_str(),
        expected_markers,
        "consumer running"
    );

    'consume: while markers_seen < expected_markers {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                module = config.module.as_str(),
                "max processing time exceeded, exiting consumer loop"
            );
            break;
        }

        for reader in readers.iter_mut() {
            if ctx.cancel.is_cancelled() {
                break 'consume;
            }

            let entries = reader.next_batch().await?;
            for entry in entries {
                ctx.metrics.stream_records_consumed.inc();
                consumed += 1;

                match decode(&entry) {
                    Ok(StreamRecord::Completion(marker)) => {
                        reader.ack(&entry.id).await?;
                        ctx.metrics.stream_acks.inc();
                        info!(
                            stream = reader.key(),
                            total_results = marker.total_results,
                            "completion marker received"
                        );
                        upstream_totals += marker.total_results;
                        markers_seen += 1;
                        if markers_seen >= expected_markers {
                            // End of production: anything past this marker
                            // is not ours to process.
                            break 'consume;
                        }
                    }
                    Ok(StreamRecord::Data(input)) => {
                        if limiter.acquire(&ctx.cancel).await.is_err() {
                            break 'consume;
                        }
                        let result = scan_with_retry(
                            ctx.scanner.as_ref(),
                            target_of(&input),
                            &scan_ctx,
                            &ctx.cancel,
                            config.max_retries,
                            Duration::from_secs(1),
                        )
                        .await;

                        match result.status {
                            DomainStatus::Cancelled => {
                                // Leave unacked for another consumer.
                                break 'consume;
                            }
                            status => {
                                if !result.records.is_empty() {
                                    if let Err(e) = sink.accept(result.records).await {
                                        warn!(error = %e, "failed to sink consumer results");
                                    }
                                }
                                progress.record(status);
                                match status {
                                    DomainStatus::Failed => ctx.metrics.domains_failed.inc(),
                                    _ => ctx.metrics.domains_completed.inc(),
                                };
                            }
                        }
                        // Acked after processing, success or not; failures
                        // surface on the batch row, not as redelivery loops.
                        reader.ack(&entry.id).await?;
                        ctx.metrics.stream_acks.inc();
                    }
                    Err(e) => {
                        warn!(entry = entry.id.as_str(), error = %e, "unreadable stream entry");
                        reader.ack(&entry.id).await?;
                        ctx.metrics.stream_acks.inc();
                    }
                }
            }
        }

        if last_progress.elapsed() >= Duration::from_secs(5) {
            last_progress = Instant::now();
            sink.flush().await?;
            progress.publish(BatchStatus::Running, None).await?;
        }
    }

    progress.set_out_of_scope(sink.out_of_scope());
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
        progress.completed_with(BatchStatus::Completed, None).await?;
        WorkerState::Completed
    };

    if upstream_totals > 0 {
        info!(
            expected = upstream_totals,
            processed = progress.completed() + progress.failed(),
            "consumer finished against producer totals"
        );
    }

    Ok(WorkerSummary {
        state,
        completed_domains: progress.completed(),
        failed_domains: progress.failed(),
        partial_domains: progress.partial(),
        out_of_scope: sink.out_of_scope(),
        deduped: sink.suppressed(),
        streamed: sink.streamed(),
        consumed,
    })
}

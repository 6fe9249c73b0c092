//! vantage-worker binary — the per-module scan task.
//!
//! Reads the environment contract, routes to the right execution mode,
//! and reports progress until it reaches a terminal state. Exit codes:
//! 0 success, 78 configuration error, 130 interrupted, 1 anything else.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vantage_core::types::WorkerState;
use vantage_core::ScanError;
use vantage_store::{BatchUpdate, PgStore, ScanStore};
use vantage_stream::RedisTransport;
use vantage_worker::config::Mode;
use vantage_worker::health::{health_router, HealthState};
use vantage_worker::runner::{run, WorkerContext};
use vantage_worker::shutdown::{cancel_pair, spawn_signal_handler};
use vantage_worker::{scanner, WorkerConfig, WorkerMetrics, EXIT_CONFIG, EXIT_INTERRUPTED};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            record_config_error(&e).await;
            std::process::exit(EXIT_CONFIG);
        }
    };

    info!(
        module = config.module.as_str(),
        mode = ?config.mode,
        scan_job_id = %config.scan_job_id,
        "starting vantage-worker"
    );

    match build_and_run(config).await {
        Ok(state) => match state {
            WorkerState::Completed => std::process::exit(0),
            WorkerState::Interrupted => std::process::exit(EXIT_INTERRUPTED),
            _ => std::process::exit(1),
        },
        Err(e) => {
            error!("worker failed: {e}");
            let code = match e {
                ScanError::Config { .. } => EXIT_CONFIG,
                ScanError::Interrupted { .. } => EXIT_INTERRUPTED,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

async fn build_and_run(config: WorkerConfig) -> Result<WorkerState, ScanError> {
    let store: Arc<dyn ScanStore> = Arc::new(PgStore::connect(&config.database_url).await?);
    info!("connected to store");

    let needs_transport = config.streaming_mode || config.mode == Mode::StreamingConsumer;
    let transport = if needs_transport {
        let host = config.redis_host.clone().ok_or_else(|| ScanError::Config {
            missing: vec!["REDIS_HOST".to_string()],
        })?;
        let port = config.redis_port.ok_or_else(|| ScanError::Config {
            missing: vec!["REDIS_PORT".to_string()],
        })?;
        let transport = RedisTransport::connect(&host, port).await?;
        info!(host = host.as_str(), port, "connected to stream transport");
        Some(Arc::new(transport) as Arc<dyn vantage_stream::StreamTransport>)
    } else {
        None
    };

    let scanner: Arc<dyn scanner::DomainScanner> =
        Arc::from(scanner::for_module(&config.module, config.scan_timeout)?);

    let (cancel_handle, cancel) = cancel_pair();
    spawn_signal_handler(cancel_handle)
        .map_err(|e| ScanError::Runtime(format!("signal handler: {e}")))?;

    let metrics = WorkerMetrics::new();
    if config.metrics_port != 0 {
        let state = Arc::new(HealthState::new(metrics.clone(), config.module.clone()));
        let addr = format!("0.0.0.0:{}", config.metrics_port);
        let router = health_router(state);
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!(addr = addr.as_str(), "metrics server listening");
                    if let Err(e) = axum::serve(listener, router).await {
                        error!("metrics server failed: {e}");
                    }
                }
                Err(e) => error!(addr = addr.as_str(), "metrics server bind failed: {e}"),
            }
        });
    }

    let ctx = WorkerContext {
        config,
        store,
        transport,
        scanner,
        cancel,
        metrics,
    };

    let summary = run(&ctx).await?;
    info!(
        state = ?summary.state,
        completed = summary.completed_domains,
        failed = summary.failed_domains,
        partial = summary.partial_domains,
        out_of_scope = summary.out_of_scope,
        streamed = summary.streamed,
        consumed = summary.consumed,
        "worker finished"
    );
    Ok(summary.state)
}

/// Best-effort: before exiting with a config error, surface the missing
/// variable list on the batch row so the orchestrator can report it.
async fn record_config_error(e: &ScanError) {
    let (Ok(batch_id), Ok(database_url)) = (
        std::env::var(vantage_runtime::env::BATCH_ID),
        std::env::var(vantage_runtime::env::SUPABASE_URL),
    ) else {
        return;
    };
    let Ok(batch_id) = batch_id.parse() else {
        return;
    };
    let Ok(store) = PgStore::connect(&database_url).await else {
        return;
    };
    let update = BatchUpdate {
        status: Some(vantage_core::types::BatchStatus::Failed),
        error: Some(e.to_string()),
        ..BatchUpdate::default()
    };
    if let Err(write_err) = store.update_batch(batch_id, &update).await {
        error!("failed to record config error on batch row: {write_err}");
    }
}

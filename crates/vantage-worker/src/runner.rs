//! Mode router and the shared execution context.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use vantage_core::types::WorkerState;
use vantage_core::{ScanError, ScopeFilter};
use vantage_store::ScanStore;
use vantage_stream::StreamTransport;

use crate::config::{Mode, WorkerConfig};
use crate::metrics::WorkerMetrics;
use crate::scanner::DomainScanner;
use crate::shutdown::CancelToken;
use crate::{consumer_run, producer_run};

/// Budget for draining buffers after cancellation.
pub const FLUSH_DEADLINE: Duration = Duration::from_secs(10);

/// Everything one worker run needs, built once in `main` (or by a test
/// harness) and threaded through the execution paths.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub store: Arc<dyn ScanStore>,
    pub transport: Option<Arc<dyn StreamTransport>>,
    pub scanner: Arc<dyn DomainScanner>,
    pub cancel: CancelToken,
    pub metrics: WorkerMetrics,
}

/// Final accounting of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub state: WorkerState,
    pub completed_domains: u64,
    pub failed_domains: u64,
    pub partial_domains: u64,
    pub out_of_scope: u64,
    pub deduped: u64,
    pub streamed: u64,
    pub consumed: u64,
}

/// Dispatch on the routed mode. Simple and batch runs share the producer
/// path; streaming consumers get the group-read loop.
pub async fn run(ctx: &WorkerContext) -> Result<WorkerSummary, ScanError> {
    match ctx.config.mode {
        Mode::Simple | Mode::Batch => producer_run::run(ctx).await,
        Mode::StreamingConsumer => consumer_run::run(ctx).await,
    }
}

/// Scope comes from the asset's apex set when an asset id is present;
/// ad-hoc simple runs fall back to the target list itself.
pub async fn resolve_scope(ctx: &WorkerContext, fallback_domains: &[String]) -> ScopeFilter {
    if let Some(asset_id) = ctx.config.asset_id {
        match ctx.store.fetch_asset(asset_id).await {
            Ok(Some(asset)) => return ScopeFilter::new(asset.apex_domains),
            Ok(None) => warn!(%asset_id, "asset not found, falling back to target domains"),
            Err(e) => warn!(%asset_id, error = %e, "asset lookup failed, falling back"),
        }
    }
    ScopeFilter::new(fallback_domains.iter().cloned())
}

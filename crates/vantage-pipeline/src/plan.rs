//! Stage topology and batch planning.
//!
//! Per stage the pipeline decides one of three shapes: pure producers
//! scan their apex-domain batches in parallel; streaming-capable
//! consumers launch concurrently with their upstream producers and read
//! their output streams through a consumer group; everything else runs
//! after its upstream finishes, seeded from the store in offset/limit
//! windows.

use std::collections::HashMap;
use uuid::Uuid;

use vantage_core::ScanError;
use vantage_registry::ModuleRegistry;

/// How one stage gets its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// No upstream in this scan: scans apex-domain batches directly.
    Producer,
    /// Runs concurrently with its upstream producers, reading the union
    /// of their output streams.
    StreamConsumer { upstream: Vec<String> },
    /// Waits for upstream terminal states, then pages prior discoveries
    /// out of the store. `upstream` may be empty when the request omits
    /// the dependency entirely.
    StoreSeeded { upstream: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct StagePlan {
    pub module: String,
    pub kind: StageKind,
    /// A later stage consumes this module's output stream, so its workers
    /// run in streaming mode and must write a completion marker.
    pub streams_output: bool,
}

/// One worker task to launch.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub batch_id: Uuid,
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub domains: Vec<String>,
    pub batch_offset: u64,
    pub batch_limit: u64,
    pub cpu_units: u32,
    pub memory_mb: u32,
    pub est_duration_minutes: u64,
    /// For stream consumers: completion markers to expect across the
    /// upstream streams (one per producer task). Filled at launch time
    /// once the upstream batch count is known.
    pub expected_completions: Option<u64>,
}

/// Classify every module of the resolved order.
pub fn plan_stages(
    registry: &ModuleRegistry,
    order: &[String],
) -> Result<Vec<StagePlan>, ScanError> {
    let mut stages: Vec<StagePlan> = Vec::with_capacity(order.len());
    for module in order {
        let profile = registry.get(module)?;
        let upstream: Vec<String> = profile
            .dependencies
            .iter()
            .filter(|d| order.contains(d))
            .cloned()
            .collect();

        let kind = if upstream.is_empty() {
            if profile.optimization_hints.requires_database_fetch() {
                StageKind::StoreSeeded { upstream }
            } else {
                StageKind::Producer
            }
        } else if profile.optimization_hints.streaming_capable {
            StageKind::StreamConsumer { upstream }
        } else {
            StageKind::StoreSeeded { upstream }
        };

        stages.push(StagePlan {
            module: module.clone(),
            kind,
            streams_output: false,
        });
    }

    // A producer streams iff some stream consumer downstream reads it.
    let consumers: Vec<(usize, Vec<String>)> = stages
        .iter()
        .enumerate()
        .filter_map(|(i, s)| match &s.kind {
            StageKind::StreamConsumer { upstream } => Some((i, upstream.clone())),
            _ => None,
        })
        .collect();
    for (_, upstream) in &consumers {
        for stage in stages.iter_mut() {
            if upstream.contains(&stage.module) {
                stage.streams_output = true;
            }
        }
    }

    Ok(stages)
}

/// Split one asset's apex domains into producer batches, allocating
/// resources from each batch's own size.
pub fn producer_batches(
    registry: &ModuleRegistry,
    module: &str,
    scan_job_id: Uuid,
    asset_id: Uuid,
    domains: &[String],
) -> Result<Vec<BatchPlan>, ScanError> {
    let sizes = registry.optimal_batches(module, domains.len() as u64)?;
    let mut plans = Vec::with_capacity(sizes.len());
    let mut cursor = 0usize;
    for size in sizes {
        let end = cursor + size as usize;
        let slice = domains[cursor..end].to_vec();
        let allocation = registry.calculate_resources(module, size)?;
        plans.push(BatchPlan {
            batch_id: Uuid::new_v4(),
            scan_job_id,
            asset_id,
            domains: slice,
            batch_offset: cursor as u64,
            batch_limit: size,
            cpu_units: allocation.cpu_units,
            memory_mb: allocation.memory_mb,
            est_duration_minutes: allocation.est_duration_minutes,
            expected_completions: None,
        });
        cursor = end;
    }
    Ok(plans)
}

/// Offset/limit windows over the seed rows a store-seeded stage will
/// page through.
pub fn seeded_batches(
    registry: &ModuleRegistry,
    module: &str,
    scan_job_id: Uuid,
    asset_id: Uuid,
    seed_count: u64,
) -> Result<Vec<BatchPlan>, ScanError> {
    let sizes = registry.optimal_batches(module, seed_count)?;
    let mut plans = Vec::with_capacity(sizes.len());
    let mut offset = 0u64;
    for size in sizes {
        let allocation = registry.calculate_resources(module, size)?;
        plans.push(BatchPlan {
            batch_id: Uuid::new_v4(),
            scan_job_id,
            asset_id,
            domains: Vec::new(),
            batch_offset: offset,
            batch_limit: size,
            cpu_units: allocation.cpu_units,
            memory_mb: allocation.memory_mb,
            est_duration_minutes: allocation.est_duration_minutes,
            expected_completions: None,
        });
        offset += size;
    }
    Ok(plans)
}

/// Stream-consumer tasks for one asset job. `scale` controls horizontal
/// fan-out within the consumer group.
pub fn consumer_batches(
    registry: &ModuleRegistry,
    module: &str,
    scan_job_id: Uuid,
    asset_id: Uuid,
    expected_inputs: u64,
    scale: u32,
) -> Result<Vec<BatchPlan>, ScanError> {
    let allocation = registry.calculate_resources(module, expected_inputs.max(1))?;
    Ok((0..scale.max(1))
        .map(|_| BatchPlan {
            batch_id: Uuid::new_v4(),
            scan_job_id,
            asset_id,
            domains: Vec::new(),
            batch_offset: 0,
            batch_limit: 0,
            cpu_units: allocation.cpu_units,
            memory_mb: allocation.memory_mb,
            est_duration_minutes: allocation.est_duration_minutes,
            expected_completions: None,
        })
        .collect())
}

/// JSON snapshot of the resolved plan, stored on the scan row.
pub fn config_snapshot(
    order: &[String],
    stages: &[StagePlan],
    batch_sizes: &HashMap<String, Vec<u64>>,
    timeout_seconds: u64,
) -> serde_json::Value {
    serde_json::json!({
        "execution_order": order,
        "timeout_seconds": timeout_seconds,
        "stages": stages
            .iter()
            .map(|s| {
                let topology = match &s.kind {
                    StageKind::Producer => "producer".to_string(),
                    StageKind::StreamConsumer { upstream } => {
                        format!("stream-consumer of [{}]", upstream.join(", "))
                    }
                    StageKind::StoreSeeded { upstream } => {
                        format!("store-seeded after [{}]", upstream.join(", "))
                    }
                };
                serde_json::json!({
                    "module": s.module,
                    "topology": topology,
                    "streams_output": s.streams_output,
                    "batch_sizes": batch_sizes.get(&s.module).cloned().unwrap_or_default(),
                })
            })
            .collect::<Vec<_>>(),
    })
}

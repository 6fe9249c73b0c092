//! The pipeline driver: create rows, launch waves, poll to completion.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use vantage_core::types::{
    Asset, AssetScanJob, BatchScanJob, BatchStatus, Scan, ScanStatus,
};
use vantage_core::ScanError;
use vantage_registry::{resolve_execution_order, ModuleRegistry};
use vantage_runtime::{TaskHandle, TaskRuntime, TaskState};
use vantage_store::{BatchUpdate, ScanStore, ScanUpdate};

use crate::launch::{launch_batch, LaunchSettings};
use crate::plan::{
    config_snapshot, consumer_batches, plan_stages, producer_batches, seeded_batches, BatchPlan,
    StageKind, StagePlan,
};
use crate::request::{validate_request, ScanRequest};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub database_url: String,
    pub service_key: String,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    /// Worker-pool size override injected into every task.
    pub workers: Option<u32>,
    pub poll_interval: Duration,
    /// Stream-consumer tasks per consumer group.
    pub scale: u32,
    pub max_batch_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            service_key: String::new(),
            redis_host: None,
            redis_port: None,
            workers: None,
            poll_interval: Duration::from_secs(2),
            scale: 1,
            max_batch_retries: 2,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Final state of one batch, as reported to the CLI.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub module: String,
    pub status: BatchStatus,
    pub completed_domains: u64,
    pub failed_domains: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub status: ScanStatus,
    /// The global deadline fired and cancelled the stragglers.
    pub timed_out: bool,
    pub total_domains: u64,
    pub completed_domains: u64,
    pub elapsed: Duration,
    pub batches: Vec<BatchOutcome>,
}

struct DriverBatch {
    plan: BatchPlan,
    module: String,
    counts_toward_scan: bool,
    handle: Option<TaskHandle>,
    attempts: u32,
    next_retry_at: Option<Instant>,
    status: BatchStatus,
    completed_domains: u64,
    failed_domains: u64,
    error: Option<String>,
}

pub struct ScanPipeline {
    store: Arc<dyn ScanStore>,
    registry: Arc<ModuleRegistry>,
    runtime: Arc<dyn TaskRuntime>,
    settings: PipelineSettings,
}

impl ScanPipeline {
    pub fn new(
        store: Arc<dyn ScanStore>,
        registry: Arc<ModuleRegistry>,
        runtime: Arc<dyn TaskRuntime>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            runtime,
            settings,
        }
    }

    /// Drive one scan request to a terminal state.
    pub async fn execute(&self, request: ScanRequest) -> Result<ScanReport, ScanError> {
        let started = Instant::now();
        let assets = validate_request(&request, &self.registry, self.store.as_ref()).await?;
        let order = resolve_execution_order(&self.registry, &request.modules)?;
        let stages = plan_stages(&self.registry, &order)?;
        info!(order = ?order, "execution order resolved");

        let scan_id = Uuid::new_v4();
        let mut jobs: Vec<(Asset, Vec<String>, AssetScanJob)> = Vec::with_capacity(assets.len());
        let mut total_domains = 0u64;
        for (asset, domains) in assets {
            let job = AssetScanJob {
                id: Uuid::new_v4(),
                parent_scan_id: scan_id,
                asset_id: asset.id,
                status: ScanStatus::Pending,
                total_domains: domains.len() as u64,
                completed_domains: 0,
                created_at: Utc::now(),
                completed_at: None,
            };
            self.store.create_asset_scan_job(&job).await?;
            total_domains += domains.len() as u64;
            jobs.push((asset, domains, job));
        }

        let mut batch_sizes: HashMap<String, Vec<u64>> = HashMap::new();
        let scan = Scan {
            id: scan_id,
            user_id: request.user_id,
            asset_ids: jobs.iter().map(|(a, _, _)| a.id).collect(),
            modules: order.clone(),
            status: ScanStatus::Pending,
            total_domains,
            completed_domains: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            config: config_snapshot(&order, &stages, &batch_sizes, request.timeout.as_secs()),
            timeout_seconds: request.timeout.as_secs(),
        };
        self.store.create_scan(&scan).await?;

        let launch_settings = LaunchSettings {
            database_url: self.settings.database_url.clone(),
            service_key: self.settings.service_key.clone(),
            redis_host: self.settings.redis_host.clone(),
            redis_port: self.settings.redis_port,
            user_id: request.user_id,
            workers: self.settings.workers,
        };

        let deadline = started + request.timeout;
        let mut launched = vec![false; stages.len()];
        let mut batches: Vec<DriverBatch> = Vec::new();
        let mut scan_running = false;

        let (final_status, timed_out) = loop {
            // Launch every stage whose preconditions now hold. Stream
            // consumers go in the same wave as their producers;
            // store-seeded stages wait for upstream terminal states.
            for i in 0..stages.len() {
                if launched[i] {
                    continue;
                }
                if !self.stage_eligible(&stages, &launched, &batches, i) {
                    continue;
                }

                let mut plans = self
                    .plan_stage_batches(&stages[i], &jobs)
                    .await?;
                if let StageKind::StreamConsumer { upstream } = &stages[i].kind {
                    // One completion marker arrives per upstream producer
                    // task sharing the scan job's stream keys.
                    for plan in &mut plans {
                        let markers = batches
                            .iter()
                            .filter(|b| {
                                upstream.contains(&b.module)
                                    && b.plan.scan_job_id == plan.scan_job_id
                            })
                            .count() as u64;
                        plan.expected_completions = Some(markers.max(1));
                    }
                }
                batch_sizes.insert(
                    stages[i].module.clone(),
                    plans.iter().map(|p| p.batch_limit).collect(),
                );

                if !scan_running && !plans.is_empty() {
                    self.store
                        .update_scan(
                            scan_id,
                            &ScanUpdate {
                                status: Some(ScanStatus::Running),
                                started_at: Some(Utc::now()),
                                ..ScanUpdate::default()
                            },
                        )
                        .await?;
                    scan_running = true;
                }

                for plan in plans {
                    let driver = self
                        .create_and_launch(&stages[i], plan, &launch_settings)
                        .await?;
                    batches.push(driver);
                }
                launched[i] = true;
                info!(module = stages[i].module.as_str(), "stage launched");
            }

            self.poll_batches(&mut batches, &launch_settings, &stages)
                .await?;

            let completed = aggregate_completed(&stages, &batches, total_domains);
            self.store
                .update_scan(
                    scan_id,
                    &ScanUpdate {
                        completed_domains: Some(completed),
                        ..ScanUpdate::default()
                    },
                )
                .await?;

            let all_launched = launched.iter().all(|l| *l);
            let all_terminal = batches.iter().all(|b| b.status.is_terminal());
            if all_launched && all_terminal {
                break (finalize_status(&batches), false);
            }

            if Instant::now() >= deadline {
                warn!(scan_id = %scan_id, "pipeline timeout, cancelling remaining batches");
                self.cancel_remaining(&mut batches).await;
                break (ScanStatus::PartialFailure, true);
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        };

        let completed_domains = aggregate_completed(&stages, &batches, total_domains);
        self.store
            .update_scan(
                scan_id,
                &ScanUpdate {
                    status: Some(final_status),
                    completed_domains: Some(completed_domains),
                    completed_at: Some(Utc::now()),
                    config: Some(config_snapshot(
                        &order,
                        &stages,
                        &batch_sizes,
                        request.timeout.as_secs(),
                    )),
                    ..ScanUpdate::default()
                },
            )
            .await?;

        for (_, _, job) in &jobs {
            let job_completed: u64 = job_completed_domains(&stages, &batches, job.id);
            self.store
                .update_asset_scan_job(job.id, final_status, job_completed)
                .await?;
        }

        info!(
            scan_id = %scan_id,
            status = final_status.as_str(),
            completed = completed_domains,
            total = total_domains,
            elapsed_secs = started.elapsed().as_secs(),
            "scan finished"
        );

        Ok(ScanReport {
            scan_id,
            status: final_status,
            timed_out,
            total_domains,
            completed_domains,
            elapsed: started.elapsed(),
            batches: batches
                .iter()
                .map(|b| BatchOutcome {
                    batch_id: b.plan.batch_id,
                    module: b.module.clone(),
                    status: b.status,
                    completed_domains: b.completed_domains,
                    failed_domains: b.failed_domains,
                    error: b.error.clone(),
                })
                .collect(),
        })
    }

    fn stage_eligible(
        &self,
        stages: &[StagePlan],
        launched: &[bool],
        batches: &[DriverBatch],
        index: usize,
    ) -> bool {
        let stage_launched = |module: &str| {
            stages
                .iter()
                .position(|s| s.module == module)
                .map(|i| launched[i])
                .unwrap_or(true)
        };
        let module_done = |module: &str| {
            stage_launched(module)
                && batches
                    .iter()
                    .filter(|b| b.module == module)
                    .all(|b| b.status.is_terminal())
        };

        match &stages[index].kind {
            StageKind::Producer => true,
            StageKind::StreamConsumer { upstream } => upstream.iter().all(|u| stage_launched(u)),
            StageKind::StoreSeeded { upstream } => upstream.iter().all(|u| module_done(u)),
        }
    }

    async fn plan_stage_batches(
        &self,
        stage: &StagePlan,
        jobs: &[(Asset, Vec<String>, AssetScanJob)],
    ) -> Result<Vec<BatchPlan>, ScanError> {
        let mut plans = Vec::new();
        for (asset, domains, job) in jobs {
            match &stage.kind {
                StageKind::Producer => {
                    plans.extend(producer_batches(
                        &self.registry,
                        &stage.module,
                        job.id,
                        asset.id,
                        domains,
                    )?);
                }
                StageKind::StreamConsumer { .. } => {
                    plans.extend(consumer_batches(
                        &self.registry,
                        &stage.module,
                        job.id,
                        asset.id,
                        job.total_domains,
                        self.settings.scale,
                    )?);
                }
                StageKind::StoreSeeded { .. } => {
                    let count = self
                        .store
                        .count_seed_data(&stage.module, asset.id)
                        .await?;
                    let mut windows =
                        seeded_batches(&self.registry, &stage.module, job.id, asset.id, count)?;
                    // Pin the actual inputs so the batch row carries its
                    // domain list and the worker needs no re-count.
                    for window in &mut windows {
                        window.domains = self
                            .store
                            .fetch_seed_data(
                                &stage.module,
                                asset.id,
                                window.batch_offset,
                                window.batch_limit,
                            )
                            .await?;
                    }
                    plans.extend(windows.into_iter().filter(|w| !w.domains.is_empty()));
                }
            }
        }
        Ok(plans)
    }

    async fn create_and_launch(
        &self,
        stage: &StagePlan,
        plan: BatchPlan,
        launch_settings: &LaunchSettings,
    ) -> Result<DriverBatch, ScanError> {
        let mapping: HashMap<String, Uuid> = plan
            .domains
            .iter()
            .map(|d| (d.clone(), plan.scan_job_id))
            .collect();
        let row = BatchScanJob {
            id: plan.batch_id,
            module: stage.module.clone(),
            status: BatchStatus::Pending,
            batch_domains: plan.domains.clone(),
            asset_scan_mapping: mapping,
            total_domains: plan.domains.len() as u64,
            completed_domains: 0,
            failed_domains: 0,
            allocated_cpu: plan.cpu_units,
            allocated_memory: plan.memory_mb,
            est_duration_minutes: plan.est_duration_minutes,
            task_handle: None,
            last_activity_at: Utc::now(),
            retry_count: 0,
            max_retries: self.settings.max_batch_retries,
            error: None,
        };
        self.store.create_batch(&row).await?;

        let profile = self.registry.get(&stage.module)?;
        let handle = launch_batch(
            self.runtime.as_ref(),
            profile,
            launch_settings,
            stage,
            &plan,
        )
        .await?;
        self.store
            .update_batch(
                plan.batch_id,
                &BatchUpdate {
                    task_handle: Some(handle.to_string()),
                    ..BatchUpdate::default()
                },
            )
            .await?;

        Ok(DriverBatch {
            plan,
            module: stage.module.clone(),
            counts_toward_scan: matches!(stage.kind, StageKind::Producer),
            handle: Some(handle),
            attempts: 0,
            next_retry_at: None,
            status: BatchStatus::Pending,
            completed_domains: 0,
            failed_domains: 0,
            error: None,
        })
    }

    async fn poll_batches(
        &self,
        batches: &mut [DriverBatch],
        launch_settings: &LaunchSettings,
        stages: &[StagePlan],
    ) -> Result<(), ScanError> {
        let now = Instant::now();
        for batch in batches.iter_mut() {
            if batch.status.is_terminal() {
                continue;
            }

            if let Some(row) = self.store.fetch_batch(batch.plan.batch_id).await? {
                batch.status = row.status;
                batch.completed_domains = row.completed_domains;
                batch.failed_domains = row.failed_domains;
                batch.error = row.error;
            }
            if batch.status.is_terminal() {
                continue;
            }

            // A batch waiting out its retry backoff has no live task.
            if let Some(at) = batch.next_retry_at {
                if now >= at {
                    batch.next_retry_at = None;
                    batch.attempts += 1;
                    let stage = stages
                        .iter()
                        .find(|s| s.module == batch.module)
                        .ok_or_else(|| ScanError::UnknownModule(batch.module.clone()))?;
                    let profile = self.registry.get(&batch.module)?;
                    warn!(
                        batch_id = %batch.plan.batch_id,
                        attempt = batch.attempts,
                        "relaunching failed batch"
                    );
                    match launch_batch(
                        self.runtime.as_ref(),
                        profile,
                        launch_settings,
                        stage,
                        &batch.plan,
                    )
                    .await
                    {
                        Ok(handle) => {
                            self.store
                                .update_batch(
                                    batch.plan.batch_id,
                                    &BatchUpdate {
                                        status: Some(BatchStatus::Pending),
                                        retry_count: Some(batch.attempts),
                                        task_handle: Some(handle.to_string()),
                                        ..BatchUpdate::default()
                                    },
                                )
                                .await?;
                            batch.handle = Some(handle);
                        }
                        Err(e) => {
                            self.fail_batch(batch, format!("relaunch failed: {e}")).await?;
                        }
                    }
                }
                continue;
            }

            let Some(handle) = batch.handle.clone() else {
                continue;
            };
            match self.runtime.poll(&handle).await? {
                TaskState::Pending | TaskState::Running => {}
                TaskState::Stopped { exit_code } if exit_code == 0 => {
                    // Clean exit: the worker wrote its terminal status; if
                    // the row lagged, settle it as completed.
                    if !batch.status.is_terminal() {
                        batch.status = BatchStatus::Completed;
                        self.store
                            .update_batch(
                                batch.plan.batch_id,
                                &BatchUpdate::status(BatchStatus::Completed),
                            )
                            .await?;
                    }
                }
                TaskState::Stopped { exit_code } => {
                    let config_error = exit_code == 78;
                    if config_error || batch.attempts >= self.settings.max_batch_retries {
                        self.fail_batch(
                            batch,
                            batch
                                .error
                                .clone()
                                .unwrap_or_else(|| format!("task exited with code {exit_code}")),
                        )
                        .await?;
                    } else {
                        let backoff = self.settings.retry_backoff * 2u32.pow(batch.attempts);
                        warn!(
                            batch_id = %batch.plan.batch_id,
                            exit_code,
                            backoff_secs = backoff.as_secs(),
                            "batch task failed, scheduling retry"
                        );
                        batch.next_retry_at = Some(now + backoff);
                        batch.handle = None;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail_batch(&self, batch: &mut DriverBatch, error: String) -> Result<(), ScanError> {
        warn!(batch_id = %batch.plan.batch_id, error = error.as_str(), "batch failed permanently");
        batch.status = BatchStatus::Failed;
        batch.error = Some(error.clone());
        self.store
            .update_batch(
                batch.plan.batch_id,
                &BatchUpdate {
                    status: Some(BatchStatus::Failed),
                    error: Some(error),
                    ..BatchUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Timeout path: stop every live task and drive its row to cancelled.
    async fn cancel_remaining(&self, batches: &mut [DriverBatch]) {
        for batch in batches.iter_mut() {
            if batch.status.is_terminal() {
                continue;
            }
            if let Some(handle) = &batch.handle {
                if let Err(e) = self.runtime.stop(handle).await {
                    warn!(batch_id = %batch.plan.batch_id, error = %e, "failed to stop task");
                }
            }
            batch.status = BatchStatus::Cancelled;
            batch.error = Some("pipeline timeout".to_string());
            if let Err(e) = self
                .store
                .update_batch(
                    batch.plan.batch_id,
                    &BatchUpdate {
                        status: Some(BatchStatus::Cancelled),
                        error: Some("pipeline timeout".to_string()),
                        ..BatchUpdate::default()
                    },
                )
                .await
            {
                warn!(batch_id = %batch.plan.batch_id, error = %e, "failed to cancel batch row");
            }
        }
    }
}

/// Scan-level completed_domains: the domain count every producer stage has
/// finished (min across producers keeps the aggregate under total).
fn aggregate_completed(stages: &[StagePlan], batches: &[DriverBatch], total: u64) -> u64 {
    let mut per_stage: Vec<u64> = Vec::new();
    for stage in stages {
        if !matches!(stage.kind, StageKind::Producer) {
            continue;
        }
        let sum: u64 = batches
            .iter()
            .filter(|b| b.module == stage.module && b.counts_toward_scan)
            .map(|b| b.completed_domains)
            .sum();
        per_stage.push(sum);
    }
    per_stage.into_iter().min().unwrap_or(0).min(total)
}

fn job_completed_domains(stages: &[StagePlan], batches: &[DriverBatch], job_id: Uuid) -> u64 {
    let mut per_stage: Vec<u64> = Vec::new();
    for stage in stages {
        if !matches!(stage.kind, StageKind::Producer) {
            continue;
        }
        let sum: u64 = batches
            .iter()
            .filter(|b| {
                b.module == stage.module && b.counts_toward_scan && b.plan.scan_job_id == job_id
            })
            .map(|b| b.completed_domains)
            .sum();
        per_stage.push(sum);
    }
    per_stage.into_iter().min().unwrap_or(0)
}

fn finalize_status(batches: &[DriverBatch]) -> ScanStatus {
    if batches.is_empty() {
        return ScanStatus::Completed;
    }
    let completed = batches
        .iter()
        .filter(|b| b.status == BatchStatus::Completed)
        .count();
    let cancelled_like = batches
        .iter()
        .filter(|b| {
            matches!(
                b.status,
                BatchStatus::Cancelled | BatchStatus::Interrupted
            )
        })
        .count();

    if completed == batches.len() {
        ScanStatus::Completed
    } else if completed == 0 && cancelled_like == batches.len() {
        ScanStatus::Cancelled
    } else if completed == 0 {
        ScanStatus::Failed
    } else {
        ScanStatus::PartialFailure
    }
}

//! Worker orchestration: env injection and task launch.

use tracing::info;
use uuid::Uuid;

use vantage_core::ScanError;
use vantage_registry::ModuleProfile;
use vantage_runtime::{TaskHandle, TaskRuntime, TaskSpec, WorkerEnv};
use vantage_stream::{consumer_group, consumer_name, output_stream_key};

use crate::plan::{BatchPlan, StageKind, StagePlan};

/// Connection and shaping knobs shared by every launched task.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub database_url: String,
    pub service_key: String,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub user_id: Uuid,
    /// Override for the worker-pool size inside each task.
    pub workers: Option<u32>,
}

/// Build the environment contract for one batch of one stage.
pub fn build_env(settings: &LaunchSettings, stage: &StagePlan, batch: &BatchPlan) -> WorkerEnv {
    let mut env = WorkerEnv {
        scan_job_id: Some(batch.scan_job_id),
        user_id: Some(settings.user_id),
        asset_id: Some(batch.asset_id),
        batch_id: Some(batch.batch_id),
        module: Some(stage.module.clone()),
        supabase_url: Some(settings.database_url.clone()),
        service_key: Some(settings.service_key.clone()),
        redis_host: settings.redis_host.clone(),
        redis_port: settings.redis_port,
        batch_offset: Some(batch.batch_offset),
        batch_limit: Some(batch.batch_limit.max(1)),
        workers: settings.workers,
        ..WorkerEnv::default()
    };

    match &stage.kind {
        StageKind::Producer | StageKind::StoreSeeded { .. } => {
            if !batch.domains.is_empty() {
                env.batch_domains = Some(batch.domains.clone());
            }
        }
        StageKind::StreamConsumer { upstream } => {
            env.streaming_mode = true;
            env.stream_input_key = Some(
                upstream
                    .iter()
                    .map(|u| output_stream_key(batch.scan_job_id, u))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            env.consumer_group = Some(consumer_group(&stage.module));
            env.consumer_name = Some(consumer_name(
                &stage.module,
                &batch.batch_id.to_string(),
            ));
            env.expected_completions = batch.expected_completions;
        }
    }

    if stage.streams_output {
        env.streaming_mode = true;
        env.stream_output_key = Some(output_stream_key(batch.scan_job_id, &stage.module));
    }

    env
}

/// Launch one batch through the runtime adapter and return its handle.
pub async fn launch_batch(
    runtime: &dyn TaskRuntime,
    profile: &ModuleProfile,
    settings: &LaunchSettings,
    stage: &StagePlan,
    batch: &BatchPlan,
) -> Result<TaskHandle, ScanError> {
    let spec = TaskSpec {
        module: stage.module.clone(),
        image: profile.container_image.clone(),
        name: profile.container_name.clone(),
        cpu_units: batch.cpu_units,
        memory_mb: batch.memory_mb,
        env: build_env(settings, stage, batch).to_env(),
    };
    let handle = runtime.launch(&spec).await?;
    info!(
        module = stage.module.as_str(),
        batch_id = %batch.batch_id,
        handle = %handle,
        cpu = batch.cpu_units,
        memory_mb = batch.memory_mb,
        "launched batch task"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LaunchSettings {
        LaunchSettings {
            database_url: "postgres://localhost/vantage".to_string(),
            service_key: "svc".to_string(),
            redis_host: Some("localhost".to_string()),
            redis_port: Some(6379),
            user_id: Uuid::new_v4(),
            workers: Some(4),
        }
    }

    fn batch(domains: Vec<String>) -> BatchPlan {
        BatchPlan {
            batch_id: Uuid::new_v4(),
            scan_job_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            batch_offset: 0,
            batch_limit: domains.len().max(1) as u64,
            domains,
            cpu_units: 256,
            memory_mb: 512,
            est_duration_minutes: 1,
            expected_completions: None,
        }
    }

    fn env_map(env: &WorkerEnv) -> std::collections::HashMap<String, String> {
        env.to_env().into_iter().collect()
    }

    #[test]
    fn producer_env_pins_batch_domains_and_output_stream() {
        let stage = StagePlan {
            module: "subfinder".to_string(),
            kind: StageKind::Producer,
            streams_output: true,
        };
        let b = batch(vec!["a.com".to_string(), "b.com".to_string()]);
        let env = env_map(&build_env(&settings(), &stage, &b));

        assert_eq!(env["MODULE"], "subfinder");
        assert_eq!(env["STREAMING_MODE"], "true");
        assert_eq!(
            env["STREAM_OUTPUT_KEY"],
            format!("scan:{}:subfinder:output", b.scan_job_id)
        );
        assert_eq!(env["BATCH_DOMAINS"], r#"["a.com","b.com"]"#);
        assert_eq!(env["WORKERS"], "4");
        assert!(!env.contains_key("STREAM_INPUT_KEY"));
    }

    #[test]
    fn consumer_env_reads_the_upstream_union() {
        let stage = StagePlan {
            module: "urlfinder".to_string(),
            kind: StageKind::StreamConsumer {
                upstream: vec!["gau".to_string(), "katana".to_string()],
            },
            streams_output: false,
        };
        let b = batch(vec![]);
        let env = env_map(&build_env(&settings(), &stage, &b));

        assert_eq!(
            env["STREAM_INPUT_KEY"],
            format!(
                "scan:{job}:gau:output,scan:{job}:katana:output",
                job = b.scan_job_id
            )
        );
        assert_eq!(env["CONSUMER_GROUP_NAME"], "urlfinder-consumers");
        assert!(env["CONSUMER_NAME"].starts_with("urlfinder-task-"));
        assert!(!env.contains_key("STREAM_OUTPUT_KEY"));
    }

    #[test]
    fn store_seeded_env_carries_the_window() {
        let stage = StagePlan {
            module: "katana".to_string(),
            kind: StageKind::StoreSeeded {
                upstream: vec!["httpx".to_string()],
            },
            streams_output: false,
        };
        let mut b = batch(vec![]);
        b.batch_offset = 50;
        b.batch_limit = 50;
        let env = env_map(&build_env(&settings(), &stage, &b));

        assert_eq!(env["BATCH_OFFSET"], "50");
        assert_eq!(env["BATCH_LIMIT"], "50");
        assert!(!env.contains_key("BATCH_DOMAINS"));
        assert!(!env.contains_key("STREAMING_MODE"));
    }
}

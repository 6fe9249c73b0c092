//! The worker environment contract.
//!
//! The launcher builds this; the worker's config parser reads it back.
//! Workers that find required variables missing exit with a dedicated
//! configuration-error status instead of guessing.

use uuid::Uuid;

pub const SCAN_JOB_ID: &str = "SCAN_JOB_ID";
pub const USER_ID: &str = "USER_ID";
pub const ASSET_ID: &str = "ASSET_ID";
pub const BATCH_ID: &str = "BATCH_ID";
pub const MODULE: &str = "MODULE";
pub const SUPABASE_URL: &str = "SUPABASE_URL";
pub const SERVICE_KEY: &str = "SERVICE_KEY";
pub const REDIS_HOST: &str = "REDIS_HOST";
pub const REDIS_PORT: &str = "REDIS_PORT";
pub const STREAMING_MODE: &str = "STREAMING_MODE";
pub const STREAM_INPUT_KEY: &str = "STREAM_INPUT_KEY";
pub const STREAM_OUTPUT_KEY: &str = "STREAM_OUTPUT_KEY";
pub const CONSUMER_GROUP_NAME: &str = "CONSUMER_GROUP_NAME";
pub const CONSUMER_NAME: &str = "CONSUMER_NAME";
pub const EXPECTED_COMPLETIONS: &str = "EXPECTED_COMPLETIONS";
pub const BATCH_OFFSET: &str = "BATCH_OFFSET";
pub const BATCH_LIMIT: &str = "BATCH_LIMIT";
pub const DOMAINS: &str = "DOMAINS";
pub const BATCH_DOMAINS: &str = "BATCH_DOMAINS";
pub const WORKERS: &str = "WORKERS";
pub const LOG_LEVEL: &str = "LOG_LEVEL";
pub const SCAN_TIMEOUT: &str = "SCAN_TIMEOUT";
pub const BATCH_SIZE: &str = "BATCH_SIZE";
pub const BLOCK_MILLISECONDS: &str = "BLOCK_MILLISECONDS";
pub const MAX_PROCESSING_TIME: &str = "MAX_PROCESSING_TIME";
pub const METRICS_PORT: &str = "METRICS_PORT";

/// Environment injected into one worker task.
#[derive(Debug, Clone, Default)]
pub struct WorkerEnv {
    pub scan_job_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub asset_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub module: Option<String>,
    pub supabase_url: Option<String>,
    pub service_key: Option<String>,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub streaming_mode: bool,
    pub stream_input_key: Option<String>,
    pub stream_output_key: Option<String>,
    pub consumer_group: Option<String>,
    pub consumer_name: Option<String>,
    /// Completion markers the consumer must observe across its input
    /// streams before exiting (one per upstream producer task).
    pub expected_completions: Option<u64>,
    pub batch_offset: Option<u64>,
    pub batch_limit: Option<u64>,
    pub domains: Option<Vec<String>>,
    pub batch_domains: Option<Vec<String>>,
    pub workers: Option<u32>,
    pub log_level: Option<String>,
}

impl WorkerEnv {
    /// Flatten into `(name, value)` pairs for injection. Domain lists are
    /// JSON arrays, everything else plain strings.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        let mut push = |k: &str, v: String| env.push((k.to_string(), v));

        if let Some(v) = self.scan_job_id {
            push(SCAN_JOB_ID, v.to_string());
        }
        if let Some(v) = self.user_id {
            push(USER_ID, v.to_string());
        }
        if let Some(v) = self.asset_id {
            push(ASSET_ID, v.to_string());
        }
        if let Some(v) = self.batch_id {
            push(BATCH_ID, v.to_string());
        }
        if let Some(v) = &self.module {
            push(MODULE, v.clone());
        }
        if let Some(v) = &self.supabase_url {
            push(SUPABASE_URL, v.clone());
        }
        if let Some(v) = &self.service_key {
            push(SERVICE_KEY, v.clone());
        }
        if let Some(v) = &self.redis_host {
            push(REDIS_HOST, v.clone());
        }
        if let Some(v) = self.redis_port {
            push(REDIS_PORT, v.to_string());
        }
        if self.streaming_mode {
            push(STREAMING_MODE, "true".to_string());
        }
        if let Some(v) = &self.stream_input_key {
            push(STREAM_INPUT_KEY, v.clone());
        }
        if let Some(v) = &self.stream_output_key {
            push(STREAM_OUTPUT_KEY, v.clone());
        }
        if let Some(v) = &self.consumer_group {
            push(CONSUMER_GROUP_NAME, v.clone());
        }
        if let Some(v) = &self.consumer_name {
            push(CONSUMER_NAME, v.clone());
        }
        if let Some(v) = self.expected_completions {
            push(EXPECTED_COMPLETIONS, v.to_string());
        }
        if let Some(v) = self.batch_offset {
            push(BATCH_OFFSET, v.to_string());
        }
        if let Some(v) = self.batch_limit {
            push(BATCH_LIMIT, v.to_string());
        }
        if let Some(v) = &self.domains {
            push(DOMAINS, serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string()));
        }
        if let Some(v) = &self.batch_domains {
            push(
                BATCH_DOMAINS,
                serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string()),
            );
        }
        if let Some(v) = self.workers {
            push(WORKERS, v.to_string());
        }
        if let Some(v) = &self.log_level {
            push(LOG_LEVEL, v.clone());
        }

        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_serialize_as_json_arrays() {
        let env = WorkerEnv {
            scan_job_id: Some(Uuid::nil()),
            domains: Some(vec!["a.com".to_string(), "b.com".to_string()]),
            ..WorkerEnv::default()
        };
        let pairs = env.to_env();
        let domains = pairs.iter().find(|(k, _)| k == DOMAINS).unwrap();
        assert_eq!(domains.1, r#"["a.com","b.com"]"#);
    }

    #[test]
    fn unset_fields_are_omitted() {
        let env = WorkerEnv::default();
        let pairs = env.to_env();
        assert!(pairs.is_empty());
    }

    #[test]
    fn streaming_mode_is_the_literal_true() {
        let env = WorkerEnv {
            streaming_mode: true,
            ..WorkerEnv::default()
        };
        let pairs = env.to_env();
        assert_eq!(pairs, vec![(STREAMING_MODE.to_string(), "true".to_string())]);
    }
}

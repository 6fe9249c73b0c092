//! Module profile schema, validation, and the builtin seed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU/memory combinations the container runtime accepts, as
/// `(cpu_units, legal memory_mb values)`.
pub const CPU_MEMORY_WHITELIST: &[(u32, &[u32])] = &[
    (256, &[512, 1024, 2048]),
    (512, &[1024, 2048, 3072, 4096]),
    (1024, &[2048, 3072, 4096, 5120, 6144, 7168, 8192]),
    (2048, &[4096, 8192, 16384]),
    (4096, &[8192, 16384, 30720]),
];

/// One rung of a module's resource ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min_domains: u64,
    pub max_domains: u64,
    pub cpu_units: u32,
    pub memory_mb: u32,
    pub label: String,
}

impl ResourceRange {
    pub fn contains(&self, domain_count: u64) -> bool {
        (self.min_domains..=self.max_domains).contains(&domain_count)
    }
}

/// Tuning knobs carried on a profile. Unset boolean hints are filled by
/// convention at registry load: any module with dependencies fetches its
/// inputs from the database and therefore needs an asset id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationHints {
    #[serde(default)]
    pub requires_database_fetch: Option<bool>,
    #[serde(default)]
    pub requires_asset_id: Option<bool>,
    /// Consumer module that persists this producer's stream output;
    /// auto-included into requests that name the producer alone.
    #[serde(default)]
    pub persistence_consumer: Option<String>,
    /// Module can run concurrently with its upstream producer, reading the
    /// producer's stream through a consumer group.
    #[serde(default)]
    pub streaming_capable: bool,
}

impl OptimizationHints {
    pub fn requires_database_fetch(&self) -> bool {
        self.requires_database_fetch.unwrap_or(false)
    }

    pub fn requires_asset_id(&self) -> bool {
        self.requires_asset_id.unwrap_or(false)
    }
}

/// Registry row describing one scanner module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleProfile {
    pub name: String,
    pub version: String,
    pub supports_batching: bool,
    pub max_batch_size: u64,
    pub resource_scaling: Vec<ResourceRange>,
    pub est_seconds_per_domain: f64,
    pub container_image: String,
    pub container_name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub optimization_hints: OptimizationHints,
    pub active: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("module '{0}': max_batch_size must be at least 1")]
    ZeroBatchSize(String),

    #[error("module '{0}': est_seconds_per_domain must be positive")]
    NonPositiveEstimate(String),

    #[error("module '{0}': resource_scaling is empty")]
    NoRanges(String),

    #[error("module '{0}': range '{1}' has min_domains > max_domains")]
    InvertedRange(String, String),

    #[error("module '{0}': ranges '{1}' and '{2}' overlap or are out of order")]
    OverlappingRanges(String, String, String),

    #[error("module '{0}': range '{1}' uses cpu/memory {2}/{3} outside the runtime whitelist")]
    UnsupportedResources(String, String, u32, u32),

    #[error("module '{0}' depends on unknown or inactive module '{1}'")]
    UnknownDependency(String, String),
}

/// Validate one profile in isolation (dependency existence is checked at
/// registry load, where the whole set is known).
pub fn validate_profile(profile: &ModuleProfile) -> Result<(), Vec<ProfileError>> {
    let mut errors = Vec::new();

    if profile.max_batch_size == 0 {
        errors.push(ProfileError::ZeroBatchSize(profile.name.clone()));
    }
    if profile.est_seconds_per_domain <= 0.0 {
        errors.push(ProfileError::NonPositiveEstimate(profile.name.clone()));
    }
    if profile.resource_scaling.is_empty() {
        errors.push(ProfileError::NoRanges(profile.name.clone()));
    }

    for range in &profile.resource_scaling {
        if range.min_domains > range.max_domains {
            errors.push(ProfileError::InvertedRange(
                profile.name.clone(),
                range.label.clone(),
            ));
        }
        if !cpu_memory_allowed(range.cpu_units, range.memory_mb) {
            errors.push(ProfileError::UnsupportedResources(
                profile.name.clone(),
                range.label.clone(),
                range.cpu_units,
                range.memory_mb,
            ));
        }
    }

    for pair in profile.resource_scaling.windows(2) {
        if pair[1].min_domains <= pair[0].max_domains {
            errors.push(ProfileError::OverlappingRanges(
                profile.name.clone(),
                pair[0].label.clone(),
                pair[1].label.clone(),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn cpu_memory_allowed(cpu_units: u32, memory_mb: u32) -> bool {
    CPU_MEMORY_WHITELIST
        .iter()
        .any(|(cpu, mems)| *cpu == cpu_units && mems.contains(&memory_mb))
}

fn range(min: u64, max: u64, cpu: u32, mem: u32, label: &str) -> ResourceRange {
    ResourceRange {
        min_domains: min,
        max_domains: max,
        cpu_units: cpu,
        memory_mb: mem,
        label: label.to_string(),
    }
}

/// The six builtin scanner modules. Used when the registry table is empty
/// so a fresh deployment can scan immediately.
pub fn builtin_profiles() -> Vec<ModuleProfile> {
    vec![
        ModuleProfile {
            name: "subfinder".to_string(),
            version: "2.6".to_string(),
            supports_batching: true,
            max_batch_size: 200,
            resource_scaling: vec![
                range(1, 50, 256, 512, "small"),
                range(51, 200, 512, 1024, "medium"),
                range(201, 1000, 1024, 2048, "large"),
            ],
            est_seconds_per_domain: 2.0,
            container_image: "vantage/subfinder:latest".to_string(),
            container_name: "subfinder-worker".to_string(),
            dependencies: vec![],
            optimization_hints: OptimizationHints {
                persistence_consumer: Some("dnsx".to_string()),
                streaming_capable: true,
                ..OptimizationHints::default()
            },
            active: true,
        },
        ModuleProfile {
            name: "dnsx".to_string(),
            version: "1.2".to_string(),
            supports_batching: true,
            max_batch_size: 500,
            resource_scaling: vec![
                range(1, 100, 256, 512, "small"),
                range(101, 500, 512, 1024, "medium"),
                range(501, 5000, 1024, 2048, "large"),
            ],
            est_seconds_per_domain: 0.5,
            container_image: "vantage/dnsx:latest".to_string(),
            container_name: "dnsx-worker".to_string(),
            dependencies: vec!["subfinder".to_string()],
            optimization_hints: OptimizationHints {
                streaming_capable: true,
                ..OptimizationHints::default()
            },
            active: true,
        },
        ModuleProfile {
            name: "httpx".to_string(),
            version: "1.6".to_string(),
            supports_batching: true,
            max_batch_size: 300,
            resource_scaling: vec![
                range(1, 50, 256, 1024, "small"),
                range(51, 300, 512, 2048, "medium"),
                range(301, 2000, 1024, 4096, "large"),
            ],
            est_seconds_per_domain: 1.5,
            container_image: "vantage/httpx:latest".to_string(),
            container_name: "httpx-worker".to_string(),
            dependencies: vec!["dnsx".to_string()],
            optimization_hints: OptimizationHints {
                streaming_capable: true,
                ..OptimizationHints::default()
            },
            active: true,
        },
        ModuleProfile {
            name: "gau".to_string(),
            version: "2.2".to_string(),
            supports_batching: true,
            max_batch_size: 100,
            resource_scaling: vec![
                range(1, 20, 256, 1024, "small"),
                range(21, 100, 512, 2048, "medium"),
            ],
            est_seconds_per_domain: 5.0,
            container_image: "vantage/gau:latest".to_string(),
            container_name: "gau-worker".to_string(),
            dependencies: vec![],
            optimization_hints: OptimizationHints::default(),
            active: true,
        },
        ModuleProfile {
            name: "katana".to_string(),
            version: "1.1".to_string(),
            supports_batching: true,
            max_batch_size: 50,
            resource_scaling: vec![
                range(1, 10, 512, 2048, "small"),
                range(11, 50, 1024, 4096, "medium"),
            ],
            est_seconds_per_domain: 30.0,
            container_image: "vantage/katana:latest".to_string(),
            container_name: "katana-worker".to_string(),
            dependencies: vec!["httpx".to_string()],
            optimization_hints: OptimizationHints::default(),
            active: true,
        },
        ModuleProfile {
            name: "urlfinder".to_string(),
            version: "0.4".to_string(),
            supports_batching: true,
            max_batch_size: 200,
            resource_scaling: vec![
                range(1, 50, 256, 512, "small"),
                range(51, 200, 512, 1024, "medium"),
            ],
            est_seconds_per_domain: 1.0,
            container_image: "vantage/urlfinder:latest".to_string(),
            container_name: "urlfinder-worker".to_string(),
            dependencies: vec!["gau".to_string(), "katana".to_string()],
            optimization_hints: OptimizationHints::default(),
            active: true,
        },
    ]
}

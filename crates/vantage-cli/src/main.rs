//! Vantage CLI - trigger distributed recon scans and inspect the registry.
//!
//! Exit codes: 0 scan completed, 2 validation error, 3 pipeline timeout,
//! 4 internal error.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use vantage_core::ScanError;
use vantage_pipeline::{
    plan_stages, validate_timeout, PipelineSettings, ScanPipeline, ScanRequest, StageKind,
};
use vantage_registry::{resolve_execution_order, ModuleRegistry};
use vantage_runtime::ProcessRuntime;
use vantage_store::{PgStore, ScanStore};

const EXIT_VALIDATION: i32 = 2;
const EXIT_TIMEOUT: i32 = 3;
const EXIT_INTERNAL: i32 = 4;

#[derive(Parser)]
#[command(name = "vantage")]
#[command(about = "Distributed reconnaissance pipeline")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Service key injected into worker tasks
    #[arg(long, env = "SERVICE_KEY", global = true)]
    service_key: Option<String>,

    /// Redis host for the streaming substrate
    #[arg(long, env = "REDIS_HOST", global = true)]
    redis_host: Option<String>,

    /// Redis port for the streaming substrate
    #[arg(long, env = "REDIS_PORT", default_value = "6379", global = true)]
    redis_port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or plan scans
    Scan {
        #[command(subcommand)]
        command: ScanCommands,
    },
    /// Inspect the module registry
    Modules {
        #[command(subcommand)]
        command: ModuleCommands,
    },
}

#[derive(Subcommand)]
enum ScanCommands {
    /// Launch a scan against one or more assets
    Run {
        /// Asset ids (UUIDs) to scan
        #[arg(required = true)]
        assets: Vec<Uuid>,

        /// Comma-separated module names
        #[arg(short, long, required = true)]
        modules: String,

        /// Global pipeline timeout in seconds
        #[arg(long, default_value = "10800", env = "PIPELINE_TIMEOUT")]
        timeout: u64,

        /// Skip malformed apex domains instead of rejecting the request
        #[arg(long)]
        active_domains_only: bool,

        /// Stream-consumer tasks per consumer group
        #[arg(long, default_value = "1")]
        scale: u32,

        /// Worker-pool size inside each task
        #[arg(long)]
        workers: Option<u32>,

        /// Acting user id
        #[arg(long, env = "USER_ID")]
        user_id: Uuid,

        /// Path to the worker binary for the local process runtime
        #[arg(long, env = "WORKER_BINARY", default_value = "vantage-worker")]
        worker_binary: String,
    },

    /// Resolve the plan without launching anything
    Plan {
        /// Asset ids (UUIDs) to plan against
        #[arg(required = true)]
        assets: Vec<Uuid>,

        /// Comma-separated module names
        #[arg(short, long, required = true)]
        modules: String,
    },
}

#[derive(Subcommand)]
enum ModuleCommands {
    /// List active module profiles
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install tracing subscriber");
    }

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            classify_exit(&e)
        }
    };
    std::process::exit(code);
}

fn classify_exit(e: &ScanError) -> i32 {
    match e {
        ScanError::InvalidRequest(_)
        | ScanError::UnknownModule(_)
        | ScanError::Config { .. }
        | ScanError::InvalidProfile(_)
        | ScanError::CircularDependency { .. } => EXIT_VALIDATION,
        ScanError::PipelineTimeout(_) => EXIT_TIMEOUT,
        _ => EXIT_INTERNAL,
    }
}

async fn dispatch(cli: Cli) -> Result<i32, ScanError> {
    let database_url = cli.database_url.clone().ok_or_else(|| ScanError::Config {
        missing: vec!["DATABASE_URL".to_string()],
    })?;
    let store = Arc::new(PgStore::connect(&database_url).await?);
    let registry = Arc::new(ModuleRegistry::load_from_store(store.as_ref()).await?);

    match cli.command {
        Commands::Modules {
            command: ModuleCommands::List,
        } => {
            list_modules(&registry);
            Ok(0)
        }
        Commands::Scan {
            command: ScanCommands::Plan { assets, modules },
        } => {
            plan_only(&registry, store.as_ref(), assets, &modules).await?;
            Ok(0)
        }
        Commands::Scan {
            command:
                ScanCommands::Run {
                    assets,
                    modules,
                    timeout,
                    active_domains_only,
                    scale,
                    workers,
                    user_id,
                    worker_binary,
                },
        } => {
            let timeout = Duration::from_secs(timeout);
            validate_timeout(timeout)?;
            let service_key = cli.service_key.clone().ok_or_else(|| ScanError::Config {
                missing: vec!["SERVICE_KEY".to_string()],
            })?;

            let settings = PipelineSettings {
                database_url,
                service_key,
                redis_host: cli.redis_host.clone(),
                redis_port: Some(cli.redis_port),
                workers,
                scale,
                ..PipelineSettings::default()
            };
            let runtime = Arc::new(ProcessRuntime::new(worker_binary));
            let pipeline = ScanPipeline::new(store, registry, runtime, settings);

            let mut request = ScanRequest::new(user_id, assets, parse_modules(&modules))
                .with_timeout(timeout);
            request.active_domains_only = active_domains_only;

            let report = pipeline.execute(request).await?;

            println!("\n=== Scan Complete ===");
            println!("Scan ID: {}", report.scan_id);
            println!("Status: {}", report.status.as_str());
            println!(
                "Domains: {}/{} completed",
                report.completed_domains, report.total_domains
            );
            println!("Elapsed: {}s", report.elapsed.as_secs());
            println!("Batches:");
            for batch in &report.batches {
                let detail = batch
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default();
                println!(
                    "  - {} [{}] {}: {}/{} done, {} failed{}",
                    batch.batch_id,
                    batch.module,
                    batch.status.as_str(),
                    batch.completed_domains,
                    batch.completed_domains + batch.failed_domains,
                    batch.failed_domains,
                    detail
                );
            }

            Ok(if report.timed_out { EXIT_TIMEOUT } else { 0 })
        }
    }
}

fn parse_modules(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

fn list_modules(registry: &ModuleRegistry) {
    println!("{} active modules:", registry.len());
    for profile in registry.modules() {
        let deps = if profile.dependencies.is_empty() {
            "-".to_string()
        } else {
            profile.dependencies.join(", ")
        };
        println!(
            "  {:<12} v{:<6} batch<={:<5} deps: {:<24} image: {}",
            profile.name,
            profile.version,
            profile.max_batch_size,
            deps,
            profile.container_image
        );
    }
}

async fn plan_only(
    registry: &ModuleRegistry,
    store: &dyn ScanStore,
    assets: Vec<Uuid>,
    modules: &str,
) -> Result<(), ScanError> {
    let order = resolve_execution_order(registry, &parse_modules(modules))?;
    let stages = plan_stages(registry, &order)?;

    println!("Execution order: {}", order.join(" -> "));
    for stage in &stages {
        let topology = match &stage.kind {
            StageKind::Producer => "producer".to_string(),
            StageKind::StreamConsumer { upstream } => {
                format!("stream-consumer of [{}]", upstream.join(", "))
            }
            StageKind::StoreSeeded { upstream } => {
                format!("store-seeded after [{}]", upstream.join(", "))
            }
        };
        println!(
            "  {:<12} {}{}",
            stage.module,
            topology,
            if stage.streams_output {
                " (streams output)"
            } else {
                ""
            }
        );
    }

    for asset_id in assets {
        let Some(asset) = store.fetch_asset(asset_id).await? else {
            return Err(ScanError::InvalidRequest(format!(
                "asset {asset_id} not found"
            )));
        };
        println!(
            "\nAsset {} ({} apex domains):",
            asset.id,
            asset.apex_domains.len()
        );
        for stage in &stages {
            if !matches!(stage.kind, StageKind::Producer) {
                continue;
            }
            let sizes = registry.optimal_batches(&stage.module, asset.apex_domains.len() as u64)?;
            let detail: Vec<String> = sizes
                .iter()
                .map(|size| {
                    let allocation = registry
                        .calculate_resources(&stage.module, *size)
                        .map(|a| {
                            format!(
                                "{size} domains @ {}cpu/{}MB (~{}m)",
                                a.cpu_units, a.memory_mb, a.est_duration_minutes
                            )
                        })
                        .unwrap_or_else(|_| format!("{size} domains"));
                    allocation
                })
                .collect();
            println!("  {:<12} {} batches: {}", stage.module, sizes.len(), detail.join("; "));
        }
    }

    Ok(())
}

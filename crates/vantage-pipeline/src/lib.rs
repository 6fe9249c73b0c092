//! Scan pipeline.
//!
//! The request entry point: validates assets and modules, resolves the
//! execution order over the dependency DAG, plans per-stage topology and
//! batch splits, launches worker tasks through the runtime adapter, and
//! drives the run to a terminal state under the global timeout.

pub mod launch;
pub mod plan;
pub mod request;
pub mod run;

pub use launch::LaunchSettings;
pub use plan::{plan_stages, BatchPlan, StageKind, StagePlan};
pub use request::{
    validate_timeout, ScanRequest, DEFAULT_TIMEOUT, MAX_TIMEOUT, MIN_TIMEOUT,
};
pub use run::{BatchOutcome, PipelineSettings, ScanPipeline, ScanReport};

//! Module registry for the recon pipeline.
//!
//! Profiles describe each scanner module: dependencies, batching limits,
//! resource scaling, and container image. The registry loads them once at
//! startup (from the registry table, or the builtin seed when the table is
//! empty), validates the set, and answers resource and ordering questions.

pub mod profile;
pub mod registry;
pub mod resources;
pub mod topo;

pub use profile::{builtin_profiles, ModuleProfile, OptimizationHints, ProfileError, ResourceRange};
pub use registry::ModuleRegistry;
pub use resources::{calculate_resources, optimal_batches, ResourceAllocation};
pub use topo::{resolve_execution_order, topological_sort};

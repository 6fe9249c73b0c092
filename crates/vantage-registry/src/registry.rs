//! The loaded registry: an immutable map of validated profiles.

use std::collections::{HashMap, HashSet};
use tracing::info;

use vantage_core::ScanError;
use vantage_store::ScanStore;

use crate::profile::{builtin_profiles, validate_profile, ModuleProfile};
use crate::resources::{self, ResourceAllocation};
use crate::topo::topological_sort;

/// In-memory module registry. Built once at startup; refreshed only by a
/// full reload, never mutated.
pub struct ModuleRegistry {
    profiles: HashMap<String, ModuleProfile>,
}

impl ModuleRegistry {
    /// Validate and index a profile set. Inactive profiles are dropped;
    /// dangling dependencies and dependency cycles are load errors.
    pub fn load(profiles: Vec<ModuleProfile>) -> Result<Self, ScanError> {
        let mut active: Vec<ModuleProfile> =
            profiles.into_iter().filter(|p| p.active).collect();

        for profile in &active {
            validate_profile(profile).map_err(|errors| {
                let detail: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                ScanError::InvalidProfile(detail.join("; "))
            })?;
        }

        let names: HashSet<String> = active.iter().map(|p| p.name.clone()).collect();
        for profile in &active {
            for dep in &profile.dependencies {
                if !names.contains(dep) {
                    return Err(ScanError::InvalidProfile(format!(
                        "module '{}' depends on unknown or inactive module '{dep}'",
                        profile.name
                    )));
                }
            }
        }

        // Convention over configuration: dependent modules fetch their
        // inputs from the database unless the profile says otherwise.
        for profile in &mut active {
            if !profile.dependencies.is_empty()
                && profile.optimization_hints.requires_database_fetch.is_none()
            {
                profile.optimization_hints.requires_database_fetch = Some(true);
                profile.optimization_hints.requires_asset_id = Some(true);
            }
        }

        // The dependency graph across active modules must be a DAG.
        let node_names: Vec<String> = active.iter().map(|p| p.name.clone()).collect();
        let deps_of: HashMap<String, Vec<String>> = active
            .iter()
            .map(|p| (p.name.clone(), p.dependencies.clone()))
            .collect();
        topological_sort(&node_names, &deps_of)?;

        Ok(Self {
            profiles: active.into_iter().map(|p| (p.name.clone(), p)).collect(),
        })
    }

    /// Load from the registry table, falling back to the builtin seed when
    /// the table is empty.
    pub async fn load_from_store(store: &dyn ScanStore) -> Result<Self, ScanError> {
        let rows = store.fetch_module_profiles().await?;
        if rows.is_empty() {
            info!("module registry table is empty; using builtin profiles");
            return Self::load(builtin_profiles());
        }
        let profiles = rows
            .into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|e| ScanError::InvalidProfile(e.to_string()))
            })
            .collect::<Result<Vec<ModuleProfile>, ScanError>>()?;
        Self::load(profiles)
    }

    pub fn builtin() -> Result<Self, ScanError> {
        Self::load(builtin_profiles())
    }

    pub fn get(&self, name: &str) -> Result<&ModuleProfile, ScanError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ScanError::UnknownModule(name.to_string()))
    }

    pub fn dependencies(&self, name: &str) -> Result<&[String], ScanError> {
        Ok(&self.get(name)?.dependencies)
    }

    /// Which of the given names resolve to active profiles.
    pub fn validate_all(&self, names: &[String]) -> HashMap<String, bool> {
        names
            .iter()
            .map(|n| (n.clone(), self.profiles.contains_key(n)))
            .collect()
    }

    pub fn calculate_resources(
        &self,
        name: &str,
        domain_count: u64,
    ) -> Result<ResourceAllocation, ScanError> {
        Ok(resources::calculate_resources(self.get(name)?, domain_count))
    }

    pub fn optimal_batches(&self, name: &str, total_domains: u64) -> Result<Vec<u64>, ScanError> {
        Ok(resources::optimal_batches(self.get(name)?, total_domains))
    }

    /// All active profiles, name-ordered.
    pub fn modules(&self) -> Vec<&ModuleProfile> {
        let mut all: Vec<&ModuleProfile> = self.profiles.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{OptimizationHints, ResourceRange};
    use vantage_store::MemStore;

    fn profile(name: &str, deps: &[&str]) -> ModuleProfile {
        ModuleProfile {
            name: name.to_string(),
            version: "1.0".to_string(),
            supports_batching: true,
            max_batch_size: 100,
            resource_scaling: vec![ResourceRange {
                min_domains: 1,
                max_domains: 1000,
                cpu_units: 256,
                memory_mb: 512,
                label: "small".to_string(),
            }],
            est_seconds_per_domain: 1.0,
            container_image: "img".to_string(),
            container_name: "ctr".to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            optimization_hints: OptimizationHints::default(),
            active: true,
        }
    }

    #[test]
    fn dependent_modules_get_database_fetch_by_convention() {
        let registry =
            ModuleRegistry::load(vec![profile("a", &[]), profile("b", &["a"])]).unwrap();
        let b = registry.get("b").unwrap();
        assert!(b.optimization_hints.requires_database_fetch());
        assert!(b.optimization_hints.requires_asset_id());
        let a = registry.get("a").unwrap();
        assert!(!a.optimization_hints.requires_database_fetch());
    }

    #[test]
    fn explicit_hint_is_left_alone() {
        let mut b = profile("b", &["a"]);
        b.optimization_hints.requires_database_fetch = Some(false);
        let registry = ModuleRegistry::load(vec![profile("a", &[]), b]).unwrap();
        assert!(!registry.get("b").unwrap().optimization_hints.requires_database_fetch());
    }

    #[test]
    fn dangling_dependency_is_a_load_error() {
        let result = ModuleRegistry::load(vec![profile("b", &["ghost"])]);
        assert!(matches!(result, Err(ScanError::InvalidProfile(_))));
    }

    #[test]
    fn inactive_dependency_is_a_load_error() {
        let mut a = profile("a", &[]);
        a.active = false;
        let result = ModuleRegistry::load(vec![a, profile("b", &["a"])]);
        assert!(matches!(result, Err(ScanError::InvalidProfile(_))));
    }

    #[test]
    fn cyclic_registry_is_rejected_at_load() {
        let result = ModuleRegistry::load(vec![profile("a", &["b"]), profile("b", &["a"])]);
        assert!(matches!(result, Err(ScanError::CircularDependency { .. })));
    }

    #[test]
    fn validate_all_flags_unknown_names() {
        let registry = ModuleRegistry::builtin().unwrap();
        let checked = registry.validate_all(&[
            "subfinder".to_string(),
            "nmap".to_string(),
        ]);
        assert_eq!(checked["subfinder"], true);
        assert_eq!(checked["nmap"], false);
    }

    #[tokio::test]
    async fn empty_store_falls_back_to_builtin_seed() {
        let store = MemStore::new();
        let registry = ModuleRegistry::load_from_store(&store).await.unwrap();
        assert_eq!(registry.len(), 6);
        assert!(registry.get("subfinder").is_ok());
    }

    #[tokio::test]
    async fn store_rows_take_precedence_over_seed() {
        let store = MemStore::new();
        store.insert_module_profile(serde_json::to_value(profile("solo", &[])).unwrap());
        let registry = ModuleRegistry::load_from_store(&store).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("subfinder").is_err());
    }
}

//! Dependency ordering over module profiles.

use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use vantage_core::ScanError;

use crate::registry::ModuleRegistry;

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Visiting,
    Visited,
}

/// Depth-first topological sort. Every dependency precedes its dependents;
/// a cycle yields `CircularDependency` with the offending path. Edges to
/// nodes outside `nodes` are ignored by the caller's construction of
/// `deps_of`.
pub fn topological_sort(
    nodes: &[String],
    deps_of: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, ScanError> {
    let mut state: HashMap<String, Visit> = HashMap::new();
    let mut order: Vec<String> = Vec::with_capacity(nodes.len());
    let mut stack: Vec<String> = Vec::new();

    fn visit(
        name: &str,
        deps_of: &HashMap<String, Vec<String>>,
        state: &mut HashMap<String, Visit>,
        order: &mut Vec<String>,
        stack: &mut Vec<String>,
    ) -> Result<(), ScanError> {
        match state.get(name) {
            Some(Visit::Visited) => return Ok(()),
            Some(Visit::Visiting) => {
                let mut cycle: Vec<String> = stack
                    .iter()
                    .skip_while(|n| n.as_str() != name)
                    .cloned()
                    .collect();
                cycle.push(name.to_string());
                return Err(ScanError::CircularDependency { cycle });
            }
            None => {}
        }

        state.insert(name.to_string(), Visit::Visiting);
        stack.push(name.to_string());
        if let Some(deps) = deps_of.get(name) {
            for dep in deps {
                visit(dep, deps_of, state, order, stack)?;
            }
        }
        stack.pop();
        state.insert(name.to_string(), Visit::Visited);
        order.push(name.to_string());
        Ok(())
    }

    for name in nodes {
        visit(name, deps_of, &mut state, &mut order, &mut stack)?;
    }
    Ok(order)
}

/// Resolve the execution order for a scan request.
///
/// Auto-includes each requested producer's persistence consumer when the
/// request names the producer without it. Other missing transitive
/// dependencies are warned about but left alone; their edges simply don't
/// constrain the order.
pub fn resolve_execution_order(
    registry: &ModuleRegistry,
    requested: &[String],
) -> Result<Vec<String>, ScanError> {
    let mut selected: Vec<String> = Vec::new();
    for name in requested {
        registry.get(name)?;
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    }

    for name in requested {
        let profile = registry.get(name)?;
        if let Some(consumer) = &profile.optimization_hints.persistence_consumer {
            if !selected.contains(consumer) && registry.get(consumer).is_ok() {
                info!(
                    producer = name.as_str(),
                    consumer = consumer.as_str(),
                    "auto-including persistence consumer"
                );
                selected.push(consumer.clone());
            }
        }
    }

    let selected_set: HashSet<&String> = selected.iter().collect();
    let mut deps_of: HashMap<String, Vec<String>> = HashMap::new();
    for name in &selected {
        let profile = registry.get(name)?;
        let mut in_set = Vec::new();
        for dep in &profile.dependencies {
            if selected_set.contains(dep) {
                in_set.push(dep.clone());
            } else {
                warn!(
                    module = name.as_str(),
                    dependency = dep.as_str(),
                    "dependency not part of this scan; its output is read from the store"
                );
            }
        }
        deps_of.insert(name.clone(), in_set);
    }

    topological_sort(&selected, &deps_of)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::builtin_profiles;

    fn graph(edges: &[(&str, &[&str])]) -> (Vec<String>, HashMap<String, Vec<String>>) {
        let nodes = edges.iter().map(|(n, _)| n.to_string()).collect();
        let deps = edges
            .iter()
            .map(|(n, ds)| (n.to_string(), ds.iter().map(|d| d.to_string()).collect()))
            .collect();
        (nodes, deps)
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|m| m == name).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let (nodes, deps) = graph(&[
            ("c", &["b"]),
            ("b", &["a"]),
            ("a", &[]),
        ]);
        let order = topological_sort(&nodes, &deps).unwrap();
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "b") < position(&order, "c"));
    }

    #[test]
    fn diamond_orders_every_edge() {
        let (nodes, deps) = graph(&[
            ("d", &["b", "c"]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("a", &[]),
        ]);
        let order = topological_sort(&nodes, &deps).unwrap();
        for (node, node_deps) in [("d", vec!["b", "c"]), ("b", vec!["a"]), ("c", vec!["a"])] {
            for dep in node_deps {
                assert!(position(&order, dep) < position(&order, node));
            }
        }
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let (nodes, deps) = graph(&[("a", &["b"]), ("b", &["a"])]);
        match topological_sort(&nodes, &deps) {
            Err(ScanError::CircularDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 3);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn self_cycle_is_rejected() {
        let (nodes, deps) = graph(&[("a", &["a"])]);
        assert!(matches!(
            topological_sort(&nodes, &deps),
            Err(ScanError::CircularDependency { .. })
        ));
    }

    #[test]
    fn subfinder_alone_pulls_in_dnsx() {
        let registry = ModuleRegistry::load(builtin_profiles()).unwrap();
        let order = resolve_execution_order(&registry, &["subfinder".to_string()]).unwrap();
        assert_eq!(order, vec!["subfinder".to_string(), "dnsx".to_string()]);
    }

    #[test]
    fn explicit_consumer_is_not_duplicated() {
        let registry = ModuleRegistry::load(builtin_profiles()).unwrap();
        let order = resolve_execution_order(
            &registry,
            &["subfinder".to_string(), "dnsx".to_string()],
        )
        .unwrap();
        assert_eq!(order, vec!["subfinder".to_string(), "dnsx".to_string()]);
    }

    #[test]
    fn full_chain_is_dependency_ordered() {
        let registry = ModuleRegistry::load(builtin_profiles()).unwrap();
        let requested: Vec<String> = ["urlfinder", "katana", "httpx", "dnsx", "subfinder", "gau"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let order = resolve_execution_order(&registry, &requested).unwrap();
        assert!(position(&order, "subfinder") < position(&order, "dnsx"));
        assert!(position(&order, "dnsx") < position(&order, "httpx"));
        assert!(position(&order, "httpx") < position(&order, "katana"));
        assert!(position(&order, "katana") < position(&order, "urlfinder"));
        assert!(position(&order, "gau") < position(&order, "urlfinder"));
        assert_eq!(order.len(), 6);
    }

    #[test]
    fn unknown_module_is_rejected() {
        let registry = ModuleRegistry::load(builtin_profiles()).unwrap();
        assert!(matches!(
            resolve_execution_order(&registry, &["nmap".to_string()]),
            Err(ScanError::UnknownModule(_))
        ));
    }

    #[test]
    fn missing_transitive_dependency_is_tolerated() {
        // katana depends on httpx, which is absent: order still resolves
        // and katana seeds from the store instead.
        let registry = ModuleRegistry::load(builtin_profiles()).unwrap();
        let order = resolve_execution_order(&registry, &["katana".to_string()]).unwrap();
        assert_eq!(order, vec!["katana".to_string()]);
    }
}

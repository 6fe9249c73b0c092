//! Resource calculation and batch splitting.

use tracing::warn;

use crate::profile::ModuleProfile;

/// Resolved cpu/memory allocation plus the duration estimate for one
/// workload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub cpu_units: u32,
    pub memory_mb: u32,
    pub label: String,
    pub est_duration_minutes: u64,
}

/// Select the scaling range containing `domain_count`. A count above every
/// range falls back to the largest range with a warning; the launch still
/// proceeds.
pub fn calculate_resources(profile: &ModuleProfile, domain_count: u64) -> ResourceAllocation {
    let est_duration_minutes =
        ((domain_count as f64 * profile.est_seconds_per_domain) / 60.0).ceil() as u64;

    let containing = profile
        .resource_scaling
        .iter()
        .find(|r| r.contains(domain_count));
    let range = match containing {
        Some(range) => range,
        None => match profile.resource_scaling.iter().max_by_key(|r| r.max_domains) {
            Some(largest) => {
                warn!(
                    module = profile.name.as_str(),
                    domain_count,
                    range = largest.label.as_str(),
                    "domain count exceeds the largest resource range"
                );
                largest
            }
            // Registry validation rejects empty ladders; hand-built
            // profiles still get a usable floor.
            None => {
                warn!(
                    module = profile.name.as_str(),
                    "profile has no resource ranges, using the smallest allocation"
                );
                return ResourceAllocation {
                    cpu_units: 256,
                    memory_mb: 512,
                    label: "default".to_string(),
                    est_duration_minutes,
                };
            }
        },
    };

    ResourceAllocation {
        cpu_units: range.cpu_units,
        memory_mb: range.memory_mb,
        label: range.label.clone(),
        est_duration_minutes,
    }
}

/// Split a workload into batch sizes, each at most `max_batch_size`, that
/// sum to `total_domains`.
///
/// A lone full batch followed by a tail under 30% of the maximum is
/// rebalanced into two equal halves; with two or more full batches the
/// tail stays its own batch.
pub fn optimal_batches(profile: &ModuleProfile, total_domains: u64) -> Vec<u64> {
    if total_domains == 0 {
        return Vec::new();
    }
    let max = profile.max_batch_size.max(1);
    if !profile.supports_batching || total_domains <= max {
        return vec![total_domains];
    }

    let full = total_domains / max;
    let remainder = total_domains % max;
    if remainder == 0 {
        return vec![max; full as usize];
    }
    if full == 1 && remainder < max * 3 / 10 {
        let half = total_domains / 2;
        return vec![total_domains - half, half];
    }

    let mut sizes = vec![max; full as usize];
    sizes.push(remainder);
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{OptimizationHints, ResourceRange};
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    fn profile(max_batch_size: u64) -> ModuleProfile {
        ModuleProfile {
            name: "subfinder".to_string(),
            version: "1.0".to_string(),
            supports_batching: true,
            max_batch_size,
            resource_scaling: vec![
                ResourceRange {
                    min_domains: 1,
                    max_domains: 50,
                    cpu_units: 256,
                    memory_mb: 512,
                    label: "small".to_string(),
                },
                ResourceRange {
                    min_domains: 51,
                    max_domains: 200,
                    cpu_units: 512,
                    memory_mb: 1024,
                    label: "medium".to_string(),
                },
                ResourceRange {
                    min_domains: 201,
                    max_domains: 1000,
                    cpu_units: 1024,
                    memory_mb: 2048,
                    label: "large".to_string(),
                },
            ],
            est_seconds_per_domain: 2.0,
            container_image: "img".to_string(),
            container_name: "ctr".to_string(),
            dependencies: vec![],
            optimization_hints: OptimizationHints::default(),
            active: true,
        }
    }

    #[test]
    fn batches_split_with_plain_tail() {
        assert_eq!(optimal_batches(&profile(200), 450), vec![200, 200, 50]);
    }

    #[test]
    fn small_tail_after_single_full_batch_rebalances() {
        assert_eq!(optimal_batches(&profile(200), 230), vec![115, 115]);
        assert_eq!(optimal_batches(&profile(200), 231), vec![116, 115]);
    }

    #[test]
    fn batch_sizes_always_sum_to_the_input() {
        let p = profile(200);
        for total in [1, 57, 199, 200, 201, 230, 259, 260, 400, 450, 601, 1999] {
            let sizes = optimal_batches(&p, total);
            assert_eq!(sizes.iter().sum::<u64>(), total, "total {total}");
            assert!(sizes.iter().all(|s| *s <= 200), "total {total}: {sizes:?}");
        }
    }

    #[test]
    fn exact_multiples_have_no_tail() {
        assert_eq!(optimal_batches(&profile(200), 400), vec![200, 200]);
    }

    #[test]
    fn large_tail_is_kept_separate() {
        // 260: tail of 60 is exactly 30% of max, not below it.
        assert_eq!(optimal_batches(&profile(200), 260), vec![200, 60]);
    }

    #[test]
    fn single_batch_when_under_max() {
        assert_eq!(optimal_batches(&profile(200), 150), vec![150]);
        assert_eq!(optimal_batches(&profile(200), 200), vec![200]);
    }

    #[test]
    fn zero_domains_yields_no_batches() {
        assert!(optimal_batches(&profile(200), 0).is_empty());
    }

    #[test]
    fn non_batching_module_gets_one_batch() {
        let mut p = profile(200);
        p.supports_batching = false;
        assert_eq!(optimal_batches(&p, 450), vec![450]);
    }

    #[test]
    fn resources_select_the_containing_range() {
        let p = profile(200);
        assert_eq!(calculate_resources(&p, 1).label, "small");
        assert_eq!(calculate_resources(&p, 50).label, "small");
        assert_eq!(calculate_resources(&p, 51).label, "medium");
        assert_eq!(calculate_resources(&p, 1000).label, "large");
    }

    #[test]
    fn duration_estimate_rounds_up_to_minutes() {
        let p = profile(200);
        // 50 domains * 2s = 100s -> 2 minutes.
        assert_eq!(calculate_resources(&p, 50).est_duration_minutes, 2);
        // 10 domains * 2s = 20s -> 1 minute.
        assert_eq!(calculate_resources(&p, 10).est_duration_minutes, 1);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn overflow_falls_back_to_largest_range_and_warns() {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();

        let allocation = tracing::subscriber::with_default(subscriber, || {
            calculate_resources(&profile(200), 10_000)
        });

        assert_eq!(allocation.label, "large");
        assert_eq!(allocation.cpu_units, 1024);
        let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("exceeds the largest resource range"),
            "expected warning in logs: {logs}"
        );
    }
}

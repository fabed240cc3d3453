//! Concurrency planning module
//!
//! Derives the worker pool size and per-ffmpeg thread budget from CPU core count and
//! configuration, so that `workers * threads_per_job` stays within the target thread count.

use crate::config::Config;

/// Per-job ffmpeg thread budget used when not configured explicitly
const DEFAULT_THREADS_PER_JOB: u32 = 4;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Number of files normalised concurrently
    pub workers: u32,
    /// `-threads` value handed to every ffmpeg invocation
    pub threads_per_job: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - threads_per_job: explicit value, else min(4, target_threads)
    /// - workers: explicit value, else target_threads / threads_per_job (at least 1)
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = (((total_cores as f32) * clamped_utilization).round() as u32).max(1);

        let threads_per_job = if cfg.workers.ffmpeg_threads_per_job > 0 {
            cfg.workers.ffmpeg_threads_per_job
        } else {
            derive_threads_per_job(target_threads)
        };

        let workers = if cfg.workers.workers > 0 {
            cfg.workers.workers
        } else {
            derive_workers(target_threads, threads_per_job)
        };

        Self {
            total_cores,
            target_threads,
            workers,
            threads_per_job,
        }
    }
}

fn derive_threads_per_job(target_threads: u32) -> u32 {
    DEFAULT_THREADS_PER_JOB.min(target_threads).max(1)
}

fn derive_workers(target_threads: u32, threads_per_job: u32) -> u32 {
    (target_threads / threads_per_job.max(1)).max(1)
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CpuConfig, WorkersConfig};
    use proptest::prelude::*;

    fn config_with(cores: u32, utilization: f32, workers: WorkersConfig) -> Config {
        Config {
            cpu: CpuConfig {
                logical_cores: Some(cores),
                target_cpu_utilization: utilization,
            },
            workers,
            ..Default::default()
        }
    }

    // Property: derived plans never oversubscribe the target thread count.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_derived_plan_fits_target_threads(cores in 1u32..256) {
            let plan = derive_plan(&config_with(cores, 0.85, WorkersConfig::default()));

            prop_assert_eq!(plan.total_cores, cores);
            prop_assert!(plan.workers >= 1);
            prop_assert!(plan.threads_per_job >= 1);
            prop_assert!(plan.threads_per_job <= DEFAULT_THREADS_PER_JOB);
            prop_assert!(
                plan.workers * plan.threads_per_job <= plan.target_threads.max(1),
                "{} workers x {} threads exceeds {} target threads",
                plan.workers, plan.threads_per_job, plan.target_threads
            );
        }
    }

    // Property: explicit non-zero settings are used unchanged.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_explicit_config_override(
            cores in 1u32..256,
            explicit_workers in 1u32..64,
            explicit_threads in 1u32..16,
        ) {
            let plan = derive_plan(&config_with(
                cores,
                0.85,
                WorkersConfig {
                    workers: explicit_workers,
                    ffmpeg_threads_per_job: explicit_threads,
                },
            ));

            prop_assert_eq!(plan.workers, explicit_workers);
            prop_assert_eq!(plan.threads_per_job, explicit_threads);
        }
    }

    // Property: utilization is clamped to [0.5, 1.0] before deriving target threads.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_utilization_clamping(
            cores in 1u32..256,
            raw_utilization in -1.0f32..3.0,
        ) {
            let plan = derive_plan(&config_with(cores, raw_utilization, WorkersConfig::default()));

            let clamped = raw_utilization.clamp(0.5, 1.0);
            let expected = (((cores as f32) * clamped).round() as u32).max(1);
            prop_assert_eq!(plan.target_threads, expected);
            prop_assert!(plan.target_threads <= cores);
        }
    }

    #[test]
    fn test_twenty_thread_machine() {
        // 20 threads at 0.85 -> 17 target threads -> 4 workers of 4 threads
        let plan = derive_plan(&config_with(20, 0.85, WorkersConfig::default()));
        assert_eq!(plan.target_threads, 17);
        assert_eq!(plan.threads_per_job, 4);
        assert_eq!(plan.workers, 4);
    }

    #[test]
    fn test_single_core_machine() {
        let plan = derive_plan(&config_with(1, 0.85, WorkersConfig::default()));
        assert_eq!(plan.target_threads, 1);
        assert_eq!(plan.threads_per_job, 1);
        assert_eq!(plan.workers, 1);
    }
}

//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Library layout: which trees to scan and where state lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Root directories scanned recursively
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Path of the persisted state document (keep it outside the roots)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Extensions treated as video files, compared case-insensitively
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("normalise_state.json")
}

fn default_video_extensions() -> Vec<String> {
    [".mkv", ".mp4", ".mov", ".m4v"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            state_file: default_state_file(),
            video_extensions: default_video_extensions(),
        }
    }
}

/// Sample/trailer exclusion
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplesConfig {
    /// Skip sample-like and undersized files (default true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lowercase name fragments marking a sample/trailer
    #[serde(default = "default_sample_tokens")]
    pub name_tokens: Vec<String>,
    /// Files below this size are treated as samples
    #[serde(default = "default_sample_min_bytes")]
    pub min_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_sample_tokens() -> Vec<String> {
    ["sample", "trailer", "teaser"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_sample_min_bytes() -> u64 {
    50 * 1024 * 1024
}

impl Default for SamplesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name_tokens: default_sample_tokens(),
            min_bytes: default_sample_min_bytes(),
        }
    }
}

/// Peak target and re-encode choices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizeConfig {
    /// Sample peak target in dBFS (default -0.1)
    #[serde(default = "default_target_peak_dbfs")]
    pub target_peak_dbfs: f64,
    /// Gains at or below this many dB count as already normalised
    #[serde(default = "default_epsilon_db")]
    pub epsilon_db: f64,
    /// Bitrate passed to lossy encoders for the main audio stream
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Relocate the moov atom on mp4/m4v/mov outputs
    #[serde(default = "default_true")]
    pub faststart: bool,
    /// Outputs smaller than this are rejected as truncated
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Source codec -> replacement codec for heavy formats
    #[serde(default = "default_downgrade")]
    pub downgrade: BTreeMap<String, String>,
}

fn default_target_peak_dbfs() -> f64 {
    -0.1
}

fn default_epsilon_db() -> f64 {
    0.05
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_min_output_bytes() -> u64 {
    1024
}

fn default_downgrade() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("dts".to_string(), "ac3".to_string()),
        ("truehd".to_string(), "ac3".to_string()),
    ])
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            target_peak_dbfs: default_target_peak_dbfs(),
            epsilon_db: default_epsilon_db(),
            audio_bitrate: default_audio_bitrate(),
            faststart: true,
            min_output_bytes: default_min_output_bytes(),
            downgrade: default_downgrade(),
        }
    }
}

/// Quick fingerprint sampling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FingerprintConfig {
    /// Size of each of the three sampled blocks, in MiB
    #[serde(default = "default_block_mib")]
    pub block_mib: u64,
}

fn default_block_mib() -> u64 {
    4
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            block_mib: default_block_mib(),
        }
    }
}

impl FingerprintConfig {
    /// Block size in bytes, never zero
    pub fn block_bytes(&self) -> u64 {
        self.block_mib.max(1) * 1024 * 1024
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Files processed concurrently (0 = auto-derive)
    #[serde(default)]
    pub workers: u32,
    /// Threads handed to each ffmpeg invocation (0 = auto-derive)
    #[serde(default)]
    pub ffmpeg_threads_per_job: u32,
}

/// Subprocess time limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    /// Hard wall-clock limit for any ffprobe/ffmpeg call
    #[serde(default = "default_subprocess_secs")]
    pub subprocess_secs: u64,
}

fn default_subprocess_secs() -> u64 {
    3600
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            subprocess_secs: default_subprocess_secs(),
        }
    }
}

/// Retry behaviour of the backup-and-swap publisher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwapConfig {
    #[serde(default = "default_swap_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_swap_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_swap_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_swap_attempts() -> u32 {
    6
}

fn default_swap_base_delay_ms() -> u64 {
    500
}

fn default_swap_backoff_factor() -> f64 {
    1.5
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_swap_attempts(),
            base_delay_ms: default_swap_base_delay_ms(),
            backoff_factor: default_swap_backoff_factor(),
        }
    }
}

/// Orphaned temporary output cleanup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfig {
    /// Only remove orphans older than this many hours (0 = remove all)
    #[serde(default)]
    pub orphan_max_age_hours: u64,
}

/// Filesystem watcher timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatcherConfig {
    /// How often pending arrivals are examined
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Minimum age before an arrival is tested for stability
    #[serde(default = "default_min_wait_secs")]
    pub min_wait_secs: u64,
    /// Gap between the two size observations of a stability test
    #[serde(default = "default_stability_interval_secs")]
    pub stability_interval_secs: u64,
    /// Arrivals that never stabilise are dropped after this long
    #[serde(default = "default_max_pending_secs")]
    pub max_pending_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    3
}

fn default_min_wait_secs() -> u64 {
    5
}

fn default_stability_interval_secs() -> u64 {
    2
}

fn default_max_pending_secs() -> u64 {
    86_400
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            min_wait_secs: default_min_wait_secs(),
            stability_interval_secs: default_stability_interval_secs(),
            max_pending_secs: default_max_pending_secs(),
        }
    }
}

/// Log sinks beyond stderr
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Optional plain-text log file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub samples: SamplesConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub swap: SwapConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - PEAKNORM_ROOTS -> library.roots (platform path-list separator)
    /// - PEAKNORM_STATE_FILE -> library.state_file
    /// - PEAKNORM_TARGET_PEAK_DBFS -> normalize.target_peak_dbfs
    /// - PEAKNORM_WORKERS -> workers.workers
    /// - PEAKNORM_FFMPEG_THREADS -> workers.ffmpeg_threads_per_job
    /// - PEAKNORM_SKIP_SAMPLES -> samples.enabled
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = env::var_os("PEAKNORM_ROOTS") {
            let roots: Vec<PathBuf> = env::split_paths(&val)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !roots.is_empty() {
                self.library.roots = roots;
            }
        }

        if let Some(val) = env::var_os("PEAKNORM_STATE_FILE") {
            if !val.is_empty() {
                self.library.state_file = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("PEAKNORM_TARGET_PEAK_DBFS") {
            if let Ok(target) = val.parse::<f64>() {
                self.normalize.target_peak_dbfs = target;
            }
        }

        if let Ok(val) = env::var("PEAKNORM_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.workers = workers;
            }
        }

        if let Ok(val) = env::var("PEAKNORM_FFMPEG_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.workers.ffmpeg_threads_per_job = threads;
            }
        }

        if let Ok(val) = env::var("PEAKNORM_SKIP_SAMPLES") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.samples.enabled = true,
                "false" | "0" | "no" => self.samples.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("CPU_TARGET_UTILIZATION") {
            if let Ok(util) = val.parse::<f32>() {
                self.cpu.target_cpu_utilization = util;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("PEAKNORM_ROOTS");
        env::remove_var("PEAKNORM_STATE_FILE");
        env::remove_var("PEAKNORM_TARGET_PEAK_DBFS");
        env::remove_var("PEAKNORM_WORKERS");
        env::remove_var("PEAKNORM_FFMPEG_THREADS");
        env::remove_var("PEAKNORM_SKIP_SAMPLES");
        env::remove_var("CPU_LOGICAL_CORES");
        env::remove_var("CPU_TARGET_UTILIZATION");
    }

    // Property: every section round-trips through TOML parsing.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            logical_cores in proptest::option::of(1u32..256),
            workers in 0u32..16,
            threads in 0u32..32,
            target_tenths in -30i32..0,
            min_wait in 1u64..60,
            stability in 1u64..30,
            skip_samples in proptest::bool::ANY,
        ) {
            let target = target_tenths as f64 / 10.0;
            let toml_str = format!(
                r#"
[library]
roots = ["/media/movies", "/media/tv"]
state_file = "/var/lib/peaknorm/state.json"

[samples]
enabled = {}

[normalize]
target_peak_dbfs = {:.1}

[cpu]
{}

[workers]
workers = {}
ffmpeg_threads_per_job = {}

[watcher]
min_wait_secs = {}
stability_interval_secs = {}
"#,
                skip_samples,
                target,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                workers,
                threads,
                min_wait,
                stability,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.library.roots.len(), 2);
            prop_assert_eq!(config.library.state_file, PathBuf::from("/var/lib/peaknorm/state.json"));
            prop_assert_eq!(config.samples.enabled, skip_samples);
            prop_assert!((config.normalize.target_peak_dbfs - target).abs() < 1e-9);
            prop_assert_eq!(config.cpu.logical_cores, logical_cores);
            prop_assert_eq!(config.workers.workers, workers);
            prop_assert_eq!(config.workers.ffmpeg_threads_per_job, threads);
            prop_assert_eq!(config.watcher.min_wait_secs, min_wait);
            prop_assert_eq!(config.watcher.stability_interval_secs, stability);
        }

        #[test]
        fn prop_env_overrides_workers(
            initial in 0u32..8,
            override_workers in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[workers]\nworkers = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PEAKNORM_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.workers.workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_cpu_logical_cores(
            initial_cores in proptest::option::of(1u32..128),
            override_cores in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[cpu]\n{}\n",
                initial_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default()
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CPU_LOGICAL_CORES", override_cores.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cpu.logical_cores, Some(override_cores));
        }

        #[test]
        fn prop_env_overrides_skip_samples(
            initial in proptest::bool::ANY,
            override_enabled in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[samples]\nenabled = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PEAKNORM_SKIP_SAMPLES", override_enabled.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.samples.enabled, override_enabled);
        }
    }

    #[test]
    fn test_env_overrides_roots_and_state_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        let joined = env::join_paths([PathBuf::from("/a"), PathBuf::from("/b")]).unwrap();
        env::set_var("PEAKNORM_ROOTS", &joined);
        env::set_var("PEAKNORM_STATE_FILE", "/tmp/state.json");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(
            config.library.roots,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(config.library.state_file, PathBuf::from("/tmp/state.json"));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("PEAKNORM_WORKERS", "lots");
        env::set_var("PEAKNORM_SKIP_SAMPLES", "maybe");
        env::set_var("PEAKNORM_TARGET_PEAK_DBFS", "loud");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.workers.workers, 0);
        assert!(config.samples.enabled);
        assert!((config.normalize.target_peak_dbfs + 0.1).abs() < 1e-9);
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert!(config.library.roots.is_empty());
        assert_eq!(config.library.state_file, PathBuf::from("normalise_state.json"));
        assert_eq!(config.library.video_extensions.len(), 4);
        assert!(config.samples.enabled);
        assert_eq!(config.samples.min_bytes, 50 * 1024 * 1024);
        assert!((config.normalize.target_peak_dbfs + 0.1).abs() < 1e-9);
        assert!((config.normalize.epsilon_db - 0.05).abs() < 1e-9);
        assert_eq!(config.normalize.audio_bitrate, "192k");
        assert_eq!(config.normalize.min_output_bytes, 1024);
        assert_eq!(
            config.normalize.downgrade.get("truehd").map(String::as_str),
            Some("ac3")
        );
        assert_eq!(config.fingerprint.block_bytes(), 4 * 1024 * 1024);
        assert_eq!(config.timeouts.subprocess_secs, 3600);
        assert_eq!(config.swap.max_attempts, 6);
        assert_eq!(config.cleanup.orphan_max_age_hours, 0);
        assert_eq!(config.watcher.min_wait_secs, 5);
        assert_eq!(config.watcher.stability_interval_secs, 2);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_downgrade_table_can_be_emptied() {
        let config = Config::parse_toml("[normalize]\ndowngrade = {}\n").expect("TOML");
        assert!(config.normalize.downgrade.is_empty());
        // Other normalize fields keep their defaults
        assert_eq!(config.normalize.audio_bitrate, "192k");
    }

    #[test]
    fn test_zero_block_size_is_clamped() {
        let config = Config::parse_toml("[fingerprint]\nblock_mib = 0\n").expect("TOML");
        assert_eq!(config.fingerprint.block_bytes(), 1024 * 1024);
    }
}

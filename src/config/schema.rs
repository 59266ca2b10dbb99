//! Configuration schema definitions for dagrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files, using serde defaults for every optional knob so
//! an empty `[section]` header is always valid.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── PlatformConfig   - CPU core / accelerator device counts, oversubscription
//! ├── RunConfig         - parallelism, timeout, baseline mode
//! ├── BatchConfig       - queue adapter selection, group sizing, timeout bump
//! ├── DirectoriesConfig - results root, source root
//! └── ReportConfig      - console/progress output settings
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for dagrun.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub directories: DirectoriesConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// The resources this node (or allocation) offers to the pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    /// Total CPU cores available to the resource pool.
    #[serde(default = "default_max_cores")]
    pub max_cores: u32,

    /// Total accelerator devices available to the resource pool.
    #[serde(default)]
    pub max_devices: u32,

    /// Allow a single test that requests more cores/devices than the pool
    /// has, in total, to run alone once the pool is otherwise idle, rather
    /// than being rejected outright.
    #[serde(default = "default_true")]
    pub allow_oversubscription: bool,

    /// Compiler identity exposed to tests via the `COMPILER` utility-script
    /// variable. Purely informational from the engine's point of view.
    #[serde(default)]
    pub compiler: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            max_cores: default_max_cores(),
            max_devices: 0,
            allow_oversubscription: default_true(),
            compiler: String::new(),
        }
    }
}

fn default_max_cores() -> u32 {
    num_cpus_fallback()
}

fn num_cpus_fallback() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

fn default_true() -> bool {
    true
}

/// Direct-execution run settings: how many tests may run concurrently and
/// the default per-test timeout absent an explicit one in the test file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Upper bound on concurrently running tests, independent of the
    /// resource pool (a throttle on process count, not on cores/devices).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Default per-test timeout in seconds when the test itself specifies
    /// none. `None` means no timeout.
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Grace period between SIGINT and SIGTERM escalation when a test
    /// exceeds its timeout.
    #[serde(default = "default_interrupt_to_kill_timeout")]
    pub interrupt_to_kill_timeout_secs: u64,

    /// Run in baseline mode: tests compare against (and optionally rebase)
    /// a reference baseline rather than executing the DAG-aware run loop.
    #[serde(default)]
    pub baseline: bool,

    /// Exit status a test script returns to signal "diff" rather than a hard
    /// failure (e.g. a numerical comparison outside tolerance).
    #[serde(default = "default_diff_exit_status")]
    pub diff_exit_status: i32,

    /// Exit status a test script returns to signal it skipped itself at
    /// runtime (distinct from a skip decided before launch).
    #[serde(default = "default_skip_exit_status")]
    pub skip_exit_status: i32,

    /// Run-wide `-o`-style option names, exposed to tests via `OPTIONS`.
    #[serde(default)]
    pub options: Vec<String>,

    /// Run-wide options explicitly turned off, exposed via `OPTIONS_OFF`.
    #[serde(default)]
    pub options_off: Vec<String>,

    /// Per-test timeout used only in baseline mode, independent of each
    /// test's own configured timeout.
    #[serde(default = "default_baseline_timeout_secs")]
    pub baseline_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            default_timeout_secs: None,
            interrupt_to_kill_timeout_secs: default_interrupt_to_kill_timeout(),
            baseline: false,
            diff_exit_status: default_diff_exit_status(),
            skip_exit_status: default_skip_exit_status(),
            options: Vec::new(),
            options_off: Vec::new(),
            baseline_timeout_secs: default_baseline_timeout_secs(),
        }
    }
}

fn default_baseline_timeout_secs() -> u64 {
    30
}

fn default_diff_exit_status() -> i32 {
    64
}

fn default_skip_exit_status() -> i32 {
    63
}

fn default_max_parallel() -> usize {
    10
}

fn default_interrupt_to_kill_timeout() -> u64 {
    30
}

/// Indirect batch-queue settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Whether to submit tests as queued batch jobs instead of running them
    /// directly. When `false`, every field below is ignored.
    #[serde(default)]
    pub enabled: bool,

    /// Target number of tests to pack per batch job before the runtime-based
    /// bucketing kicks in.
    #[serde(default = "default_batch_group_size")]
    pub group_size: u32,

    /// Upper bound on a single batch job's queue-requested walltime, in
    /// seconds. Computed queue times are clamped to this.
    #[serde(default)]
    pub max_timeout_secs: Option<u64>,

    /// Polling interval for checking batch job state, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Name of the batch adapter to use (e.g. `"slurm"`, `"lsf"`, `"shell"`).
    #[serde(default = "default_batch_adapter")]
    pub adapter: String,

    /// Extra arguments passed through verbatim to the queue submission
    /// command.
    #[serde(default)]
    pub submit_args: Vec<String>,

    /// Upper bound on how many batch jobs may be in `Submitted` state at
    /// once; additional ready groups wait for a slot to free up rather than
    /// all being submitted in a single unbounded wave.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,

    /// How long, after a job is first observed `Stopped`, to wait before
    /// treating a still-incomplete member as having actually finished one
    /// way or another rather than possibly still trailing a write.
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_size: default_batch_group_size(),
            max_timeout_secs: None,
            poll_interval_secs: default_poll_interval(),
            adapter: default_batch_adapter(),
            submit_args: Vec::new(),
            max_jobs: default_max_jobs(),
            check_timeout_secs: default_check_timeout_secs(),
        }
    }
}

fn default_max_jobs() -> u32 {
    25
}

fn default_check_timeout_secs() -> u64 {
    30
}

fn default_batch_group_size() -> u32 {
    30
}

fn default_poll_interval() -> u64 {
    15
}

fn default_batch_adapter() -> String {
    "shell".to_string()
}

/// Filesystem layout settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectoriesConfig {
    /// Root directory tests execute under; each test gets a subdirectory
    /// derived from its id.
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,

    /// Root directory test sources are read from.
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,

    /// Project name exposed to tests via the `PROJECT` utility-script
    /// variable.
    #[serde(default)]
    pub project: String,

    /// Directories searched for test-suite-wide configuration, exposed to
    /// tests via `CONFIGDIR`.
    #[serde(default)]
    pub config_dirs: Vec<PathBuf>,

    /// Path to this engine's own installation, exposed to tests via
    /// `VVTESTSRC`.
    #[serde(default = "default_engine_root")]
    pub engine_root: PathBuf,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            results_root: default_results_root(),
            source_root: default_source_root(),
            project: String::new(),
            config_dirs: Vec::new(),
            engine_root: default_engine_root(),
        }
    }
}

fn default_engine_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_results_root() -> PathBuf {
    PathBuf::from("./TestResults")
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

/// Console/progress reporting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Show a live progress bar while tests run.
    #[serde(default = "default_true")]
    pub progress: bool,

    /// Print failure stdout/stderr detail inline as tests finish, rather
    /// than only in the final summary.
    #[serde(default)]
    pub stream_failures: bool,

    /// Suppress all but the final summary line.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            progress: true,
            stream_failures: false,
            quiet: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_use_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.platform.max_cores > 0);
        assert_eq!(cfg.run.max_parallel, 10);
        assert!(!cfg.batch.enabled);
        assert_eq!(cfg.directories.results_root, PathBuf::from("./TestResults"));
        assert!(cfg.report.progress);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[run]\nmax_parallel = 4\n").unwrap();
        assert_eq!(cfg.run.max_parallel, 4);
        assert_eq!(cfg.run.interrupt_to_kill_timeout_secs, 30);
    }
}

//! The explicit per-launch environment handed to a test's child process.
//!
//! An explicit, owned struct built fresh for every launch, so concurrent
//! tests never share mutable process-global state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::model::{ParamValue, ResourceAttrs, TestId};

/// Platform/build identity threaded into every test's utility scripts.
/// Constant for the whole run, not per-test, but carried on `ChildEnv` so
/// the script generator has a single source of truth to read from.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub platform_name: String,
    pub compiler: String,
    pub vvtestsrc: PathBuf,
    pub project: String,
    pub config_dirs: Vec<PathBuf>,
    pub options: Vec<String>,
    pub options_off: Vec<String>,
}

/// The exit codes a test script itself returns to signal a non-pass/fail
/// outcome. Distinct from the engine's own aggregate exit-code bitmask (see
/// `report::exit_bits`) — these are read back by the executor after the
/// child exits to pick `TestStatus::Diff`/`TestStatus::Skip`.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatusConfig {
    pub diff_exit_status: i32,
    pub skip_exit_status: i32,
}

/// Everything a single test launch needs beyond its own source file: the
/// execute directory, the resolved script to exec, resource ids, the
/// dependency-directory map, and the timeout the executor will enforce.
#[derive(Debug, Clone)]
pub struct ChildEnv {
    pub test_id: TestId,
    pub xdir: PathBuf,
    /// This test's own source directory (`SRCDIR`) — where its script file
    /// lives, and the base relative file entries are resolved against.
    pub test_source_dir: PathBuf,
    /// The global execute/results root (`TESTROOT`).
    pub results_root: PathBuf,
    /// Absolute path to the test's own script file; this is what gets exec'd.
    pub script_path: PathBuf,
    pub resources: ResourceAttrs,
    pub timeout_secs: Option<u64>,
    pub params: BTreeMap<String, ParamValue>,
    pub keywords: Vec<String>,
    /// match-pattern → matched execute directories, for `DEPDIRMAP`.
    pub dep_dir_map: BTreeMap<String, Vec<PathBuf>>,
    /// Sorted, deduplicated absolute dependency execute directories, for
    /// `DEPDIRS`.
    pub dep_dirs: Vec<PathBuf>,
    pub is_analyze: bool,
    /// For an analyze test only: parameter name → sorted distinct values
    /// taken across the siblings it depends on, used for `PARAM_<name>`.
    pub analyze_param_children: BTreeMap<String, Vec<String>>,
    pub platform: PlatformInfo,
    pub exit_status: ExitStatusConfig,
    pub extra_env: BTreeMap<String, String>,
}

impl ChildEnv {
    /// The environment variables the utility scripts read back out of the
    /// process environment. Only `VVTEST_TIMEOUT` is an actual process env
    /// var; everything else is written directly into the generated scripts
    /// rather than read from the environment, but it's still exposed here
    /// as a single source of truth the script generator pulls from.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.extra_env.clone();
        if let Some(t) = self.timeout_secs {
            vars.insert("VVTEST_TIMEOUT".to_string(), t.to_string());
        }
        vars
    }
}

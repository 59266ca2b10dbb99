//! The core data model: [`TestSpec`], [`TestId`], [`TestStatus`], [`TestCase`],
//! and the dependency edge types they're wired together with.
//!
//! This is the typed record that replaces a dynamic attribute bag: every field
//! a test case can carry is named here instead of living in a loosely-typed
//! dictionary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A typed parameter value: int, float, or string, as declared by the test
/// file (see DESIGN.md, open question 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn as_display(&self) -> String {
        match self {
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => f.to_string(),
            ParamValue::Str(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// Deterministic `(name, sorted-parameter-pairs, stage?)` identity.
///
/// Two `TestSpec`s with equal `TestId`s are the same test. This type is the
/// hash-map key used throughout the store and the DAG, and its
/// [`TestId::match_string`] is the value written into the `TESTID` utility
/// script variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestId {
    pub name: String,
    /// Sorted `(param_name, param_value_display)` pairs — sorted so that
    /// equivalent parameter assignments always hash/compare equal regardless
    /// of the order the parser discovered them in.
    pub params: Vec<(String, String)>,
    pub stage: Option<u32>,
}

impl TestId {
    pub fn new(
        name: impl Into<String>,
        params: impl IntoIterator<Item = (String, String)>,
        stage: Option<u32>,
    ) -> Self {
        let mut params: Vec<(String, String)> = params.into_iter().collect();
        params.sort();
        Self {
            name: name.into(),
            params,
            stage,
        }
    }

    /// Deterministic match-string form, e.g. `mytest.np=4.stage=2`.
    pub fn match_string(&self) -> String {
        let mut s = self.name.clone();
        for (k, v) in &self.params {
            s.push('.');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        if let Some(stage) = self.stage {
            s.push_str(&format!(".stage={stage}"));
        }
        s
    }

    /// The parameter group a staged/analyze test belongs to: same name and
    /// params, ignoring the stage index.
    pub fn group_key(&self) -> (String, Vec<(String, String)>) {
        (self.name.clone(), self.params.clone())
    }
}

impl std::fmt::Display for TestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.match_string())
    }
}

/// How a dependency pattern's expected-count criterion is expressed:
/// `+` (one or more), `*` (any number, including zero), `?` (zero or one), or
/// an exact count `N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectCriterion {
    OneOrMore,
    Any,
    ZeroOrOne,
    Exactly(u32),
}

impl ExpectCriterion {
    pub fn is_satisfied_by(&self, count: usize) -> bool {
        match self {
            ExpectCriterion::OneOrMore => count >= 1,
            ExpectCriterion::Any => true,
            ExpectCriterion::ZeroOrOne => count <= 1,
            ExpectCriterion::Exactly(n) => count as u32 == *n,
        }
    }

    /// Whether this criterion *requires* at least one match, i.e. an
    /// unmatched pattern is an error rather than a silent zero-match (§4.2.2).
    pub fn requires_minimum(&self) -> bool {
        match self {
            ExpectCriterion::OneOrMore => true,
            ExpectCriterion::Any => false,
            ExpectCriterion::ZeroOrOne => false,
            ExpectCriterion::Exactly(n) => *n > 0,
        }
    }
}

/// A boolean predicate over a dependency's terminal result word
/// (`pass`, `diff`, `fail`, `timeout`, ...). `None` means the default
/// predicate, `status ∈ {pass, diff}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultPredicate {
    Default,
    /// Satisfied iff the result word is in this explicit set.
    OneOf(Vec<String>),
    /// Satisfied by any terminal status, including skip (the `result="*"` case).
    Any,
}

impl ResultPredicate {
    pub fn is_satisfied_by(&self, result: &str) -> bool {
        match self {
            ResultPredicate::Default => matches!(result, "pass" | "diff"),
            ResultPredicate::OneOf(words) => words.iter().any(|w| w == result),
            ResultPredicate::Any => true,
        }
    }
}

/// A single `(name→value)` dependency pattern collected from a `TestSpec`
/// before resolution, plus its predicate and expected-count criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyPattern {
    pub glob: String,
    pub predicate: ResultPredicate,
    pub expect: ExpectCriterion,
}

/// A copy or link entry in a test's xdir-population list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Source path, possibly containing a glob, relative to the test's
    /// source directory unless absolute.
    pub source: String,
    /// Destination name in the execute directory; `None` means "keep the
    /// glob-matched basename".
    pub dest: Option<String>,
    pub kind: FileEntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEntryKind {
    Copy,
    Link,
    Baseline,
}

/// Immutable description of a single test, as produced by the (external)
/// parser/discovery collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: TestId,
    pub root: PathBuf,
    /// Path to the test file, relative to `root`.
    pub file: PathBuf,
    pub params: BTreeMap<String, ParamValue>,
    pub keywords: Vec<String>,
    pub dependencies: Vec<DependencyPattern>,
    pub timeout_secs: Option<u64>,
    pub files: Vec<FileEntry>,
    pub is_analyze: bool,
    pub is_staged: bool,
}

impl TestSpec {
    /// The absolute path to the test's own script file: `root` joined with
    /// `file`. This is what the executor execs (§4.5 step 4).
    pub fn script_path(&self) -> PathBuf {
        self.root.join(&self.file)
    }

    /// The directory holding this test's own source file (`SRCDIR`): `root`
    /// joined with `file`'s parent component, if `file` names a nested path.
    pub fn source_dir(&self) -> PathBuf {
        match self.file.parent() {
            Some(p) if !p.as_os_str().is_empty() => self.root.join(p),
            _ => self.root.clone(),
        }
    }

    /// The execute directory for this test, derived deterministically from
    /// its `TestId`. Staged siblings share an xdir by construction (they
    /// share `group_key`); non-staged tests get a unique path per `TestId`.
    pub fn xdir(&self, results_root: &std::path::Path) -> PathBuf {
        let (name, params) = self.id.group_key();
        let mut rel = PathBuf::from(name);
        for (k, v) in &params {
            rel.push(format!("{k}={v}"));
        }
        results_root.join(rel)
    }
}

/// The terminal (or pre-terminal) state of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    NotRun,
    Running,
    Pass,
    Fail,
    Diff,
    Timeout,
    NotDone,
    Skip,
    NotRunByDep,
}

impl TestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TestStatus::NotRun | TestStatus::Running)
    }

    pub fn word(&self) -> &'static str {
        match self {
            TestStatus::NotRun => "notrun",
            TestStatus::Running => "running",
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Diff => "diff",
            TestStatus::Timeout => "timeout",
            TestStatus::NotDone => "notdone",
            TestStatus::Skip => "skip",
            TestStatus::NotRunByDep => "notrun-by-dep",
        }
    }
}

/// Resource ids allocated to a running (or completed) test, for the utility
/// script's `RESOURCE_*` variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceAttrs {
    pub cpu_ids: Vec<u32>,
    pub total_cpus: u32,
    pub device_ids: Vec<u32>,
    pub total_devices: u32,
}

/// Mutable run-time state of a test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStatusRecord {
    pub status: TestStatus,
    #[serde(with = "opt_systemtime")]
    pub start_time: Option<SystemTime>,
    #[serde(with = "opt_systemtime")]
    pub stop_time: Option<SystemTime>,
    pub exit_value: Option<i32>,
    pub skip_reason: Option<String>,
    pub resources: ResourceAttrs,
    /// `Some(time)` once the executor has sent the process a SIGINT for
    /// exceeding its timeout.
    #[serde(with = "opt_systemtime")]
    pub timed_out_at: Option<SystemTime>,
    /// Set when the status is `NotRunByDep`: the blocking dependency's id.
    pub blocking_dependency: Option<TestId>,
}

impl Default for TestStatusRecord {
    fn default() -> Self {
        Self {
            status: TestStatus::NotRun,
            start_time: None,
            stop_time: None,
            exit_value: None,
            skip_reason: None,
            resources: ResourceAttrs::default(),
            timed_out_at: None,
            blocking_dependency: None,
        }
    }
}

impl TestStatusRecord {
    pub fn runtime(&self) -> Option<std::time::Duration> {
        match (self.start_time, self.stop_time) {
            (Some(a), Some(b)) => b.duration_since(a).ok(),
            _ => None,
        }
    }
}

mod opt_systemtime {
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(
        value: &Option<SystemTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let secs = value.map(|t| {
            t.duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64()
        });
        secs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SystemTime>, D::Error> {
        let secs: Option<f64> = Option::deserialize(deserializer)?;
        Ok(secs.map(|s| UNIX_EPOCH + Duration::from_secs_f64(s)))
    }
}

/// A resolved dependency edge: `from` requires `to` to reach a terminal
/// status satisfying `predicate` before `from` may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TestId,
    pub to: TestId,
    pub predicate: ResultPredicate,
    pub match_pattern: String,
}

/// A request for CPU cores and/or accelerator devices, already node-rounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cores: u32,
    pub devices: u32,
}

/// A test case: its immutable spec, its mutable status, and the id lists the
/// scheduler and DAG need. Lives inside [`crate::store::TestCaseStore`]'s
/// arena — dependency edges elsewhere reference a `TestCase` only by
/// [`TestId`], never by pointer, so there is no cyclic ownership.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub spec: TestSpec,
    pub status: TestStatusRecord,
    /// Ids of tests this one depends on (outgoing edges).
    pub depends_on: Vec<DependencyEdge>,
    /// Whether any other active test depends on this one.
    pub has_dependent: bool,
    /// match-pattern → matched xdirs, used to generate `DEPDIRMAP`.
    pub dep_dir_map: BTreeMap<String, Vec<PathBuf>>,
    /// For an analyze test only: parameter name → sorted distinct values
    /// taken across the non-analyze siblings it depends on, used to generate
    /// the `PARAM_<name>` utility-script variables.
    pub analyze_param_children: BTreeMap<String, Vec<String>>,
}

impl TestCase {
    pub fn new(spec: TestSpec) -> Self {
        Self {
            spec,
            status: TestStatusRecord::default(),
            depends_on: Vec::new(),
            has_dependent: false,
            dep_dir_map: BTreeMap::new(),
            analyze_param_children: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &TestId {
        &self.spec.id
    }

    pub fn resource_request(&self) -> ResourceRequest {
        let np = match self.spec.params.get("np") {
            Some(ParamValue::Int(n)) => (*n).max(0) as u32,
            Some(ParamValue::Float(n)) => n.max(0.0) as u32,
            Some(ParamValue::Str(s)) => s.parse().unwrap_or(0),
            None => 0,
        };
        let nd = match self.spec.params.get("ndevice") {
            Some(ParamValue::Int(n)) => (*n).max(0) as u32,
            Some(ParamValue::Float(n)) => n.max(0.0) as u32,
            Some(ParamValue::Str(s)) => s.parse().unwrap_or(0),
            None => 0,
        };
        ResourceRequest {
            cores: np,
            devices: nd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_match_string_is_stable_regardless_of_param_order() {
        let a = TestId::new(
            "mytest",
            [("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())],
            None,
        );
        let b = TestId::new(
            "mytest",
            [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
            None,
        );
        assert_eq!(a, b);
        assert_eq!(a.match_string(), "mytest.a=1.b=2");
    }

    #[test]
    fn group_key_ignores_stage() {
        let a = TestId::new("t", [("stage".into(), "1".into())], Some(1));
        let b = TestId::new("t", [("stage".into(), "1".into())], Some(2));
        assert_ne!(a, b);
        assert_eq!(a.group_key(), b.group_key());
    }

    #[test]
    fn default_predicate_accepts_pass_and_diff_only() {
        let p = ResultPredicate::Default;
        assert!(p.is_satisfied_by("pass"));
        assert!(p.is_satisfied_by("diff"));
        assert!(!p.is_satisfied_by("fail"));
        assert!(!p.is_satisfied_by("timeout"));
    }

    #[test]
    fn any_predicate_is_satisfied_by_skip() {
        assert!(ResultPredicate::Any.is_satisfied_by("skip"));
    }
}

//! End-to-end scenario tests exercising the dependency/resource/scheduler
//! interaction directly against the public API, without spawning real child
//! processes (process-launch behavior is covered by the in-module tests in
//! `executor::process`/`executor::forkless`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use dagrun::deps;
use dagrun::model::{
    DependencyPattern, ExpectCriterion, FileEntry, ParamValue, ResourceAttrs, ResultPredicate, TestId, TestSpec,
    TestStatus,
};
use dagrun::resources::ResourcePool;
use dagrun::scheduler::{self, NoEstimates};
use dagrun::store::TestCaseStore;

fn bare_spec(name: &str) -> TestSpec {
    TestSpec {
        id: TestId::new(name, [], None),
        root: PathBuf::from("/src"),
        file: PathBuf::from(format!("{name}.vvt")),
        params: BTreeMap::new(),
        keywords: vec![],
        dependencies: vec![],
        timeout_secs: None,
        files: vec![],
        is_analyze: false,
        is_staged: false,
    }
}

fn dep_on(glob: &str) -> DependencyPattern {
    DependencyPattern {
        glob: glob.to_string(),
        predicate: ResultPredicate::Default,
        expect: ExpectCriterion::OneOrMore,
    }
}

/// S1 (diamond dep, all pass): A has no deps; B and C depend on A; D depends
/// on both B and C. Once A is terminal-pass, B and C both become ready
/// concurrently; D only becomes ready once both finish.
#[test]
fn s1_diamond_dependency_unblocks_in_topological_waves() {
    let root = PathBuf::from("/results");
    let mut store = TestCaseStore::new();

    let mut a = bare_spec("a");
    a.id = TestId::new("a", [], None);
    let mut b = bare_spec("b");
    b.dependencies.push(dep_on("a"));
    let mut c = bare_spec("c");
    c.dependencies.push(dep_on("a"));
    let mut d = bare_spec("d");
    d.dependencies.push(dep_on("b"));
    d.dependencies.push(dep_on("c"));

    store.insert(a, &root);
    store.insert(b, &root);
    store.insert(c, &root);
    store.insert(d, &root);

    deps::resolve_dependencies(&mut store, &root).unwrap();

    let a_id = TestId::new("a", [], None);
    let b_id = TestId::new("b", [], None);
    let c_id = TestId::new("c", [], None);
    let d_id = TestId::new("d", [], None);

    assert!(deps::is_blocking(&store, &b_id));
    assert!(deps::is_blocking(&store, &d_id));

    store.get_mut(&a_id).unwrap().status.status = TestStatus::Pass;

    assert!(!deps::is_blocking(&store, &b_id));
    assert!(!deps::is_blocking(&store, &c_id));
    assert!(deps::is_blocking(&store, &d_id), "D must wait on both B and C");

    store.get_mut(&b_id).unwrap().status.status = TestStatus::Pass;
    assert!(deps::is_blocking(&store, &d_id), "D must still wait on C");

    store.get_mut(&c_id).unwrap().status.status = TestStatus::Pass;
    assert!(!deps::is_blocking(&store, &d_id));
}

/// S2 (predicate failure): when A fails, every descendant in the diamond
/// becomes permanently unrunnable and the flush marks them `NotRunByDep`.
#[test]
fn s2_predicate_failure_propagates_to_all_descendants() {
    let root = PathBuf::from("/results");
    let mut store = TestCaseStore::new();

    let a = bare_spec("a");
    let mut b = bare_spec("b");
    b.dependencies.push(dep_on("a"));
    let mut c = bare_spec("c");
    c.dependencies.push(dep_on("a"));
    let mut d = bare_spec("d");
    d.dependencies.push(dep_on("b"));
    d.dependencies.push(dep_on("c"));

    store.insert(a, &root);
    store.insert(b, &root);
    store.insert(c, &root);
    store.insert(d, &root);

    deps::resolve_dependencies(&mut store, &root).unwrap();

    let a_id = TestId::new("a", [], None);
    store.get_mut(&a_id).unwrap().status.status = TestStatus::Fail;

    let never_run = scheduler::collect_will_never_run(&store);
    let blocked: Vec<TestId> = never_run.iter().map(|(id, _)| id.clone()).collect();
    assert!(blocked.contains(&TestId::new("b", [], None)));
    assert!(blocked.contains(&TestId::new("c", [], None)));

    for (id, _) in &never_run {
        store.get_mut(id).unwrap().status.status = TestStatus::NotRunByDep;
    }
    // D's own dependencies (B, C) are now NotRunByDep, which itself
    // propagates on the next pass.
    let never_run_again = scheduler::collect_will_never_run(&store);
    assert!(never_run_again.iter().any(|(id, _)| id == &TestId::new("d", [], None)));

    store.flush_remaining_to_not_run_by_dep();
    let counts = store.count_by_status();
    assert_eq!(counts.get("fail").copied().unwrap_or(0), 1);
    assert_eq!(counts.get("notrun-by-dep").copied().unwrap_or(0), 3);
}

/// S4 (oversubscription): pool = 2 cores, a single test demands np=4. It is
/// allowed to run alone once the pool is idle, and no other ready test is
/// selected concurrently with it.
#[test]
fn s4_oversubscribed_test_runs_alone() {
    let root = PathBuf::from("/results");
    let mut store = TestCaseStore::new();

    let mut big = bare_spec("big");
    big.params.insert("np".to_string(), ParamValue::Int(4));
    store.insert(big, &root);

    let pool = ResourcePool::new(2, 0, true);
    let picked = scheduler::pop_next(&store, &pool, &NoEstimates);
    assert_eq!(picked, Some(TestId::new("big", [], None)));
}

/// S5 (staged siblings): stages 1/2/3 of the same parameter group share an
/// xdir and are tracked as an ordered sibling group.
#[test]
fn s5_staged_siblings_share_group_and_preserve_stage_order() {
    let root = PathBuf::from("/results");
    let mut store = TestCaseStore::new();

    for stage in [1u32, 2, 3] {
        let mut spec = bare_spec("staged");
        spec.id = TestId::new("staged", [], Some(stage));
        spec.is_staged = true;
        store.insert(spec, &root);
    }

    let stage1 = TestId::new("staged", [], Some(1));
    let siblings = store.siblings(&stage1);
    assert_eq!(siblings.len(), 3);

    let mut stages: Vec<u32> = siblings.iter().filter_map(|id| id.stage).collect();
    stages.sort();
    assert_eq!(stages, vec![1, 2, 3]);
}

/// S7 (analyze): an analyze test parameterized over np ∈ {1,2,4} gets an
/// implicit edge to each sibling and stays blocked until all three finish.
#[test]
fn s7_analyze_test_depends_on_every_parameterized_sibling() {
    let root = PathBuf::from("/results");
    let mut store = TestCaseStore::new();

    for np in [1i64, 2, 4] {
        let mut spec = bare_spec("sweep");
        spec.id = TestId::new("sweep", [("np".to_string(), np.to_string())], None);
        spec.params.insert("np".to_string(), ParamValue::Int(np));
        store.insert(spec, &root);
    }

    let mut analyze = bare_spec("sweep");
    analyze.id = TestId::new("sweep", [("np".to_string(), "analyze".to_string())], None);
    analyze.is_analyze = true;
    store.insert(analyze, &root);

    deps::resolve_dependencies(&mut store, &root).unwrap();

    let analyze_id = TestId::new("sweep", [("np".to_string(), "analyze".to_string())], None);
    let tc = store.get(&analyze_id).unwrap();
    assert_eq!(tc.depends_on.len(), 3, "analyze test should depend on all 3 parameterized siblings");

    assert!(deps::is_blocking(&store, &analyze_id));

    for np in [1i64, 2, 4] {
        let id = TestId::new("sweep", [("np".to_string(), np.to_string())], None);
        store.get_mut(&id).unwrap().status.status = TestStatus::Pass;
    }
    assert!(!deps::is_blocking(&store, &analyze_id));
}

/// S3 (timeout escalation): a test that ignores SIGINT must still be reached
/// by SIGTERM once the interrupt-to-kill grace period elapses, and the final
/// status is `Timeout` rather than whatever exit code the forced kill
/// happens to produce.
#[cfg(unix)]
#[tokio::test]
async fn s3_timeout_escalates_from_sigint_to_sigterm() {
    use dagrun::childenv::{ChildEnv, ExitStatusConfig, PlatformInfo};
    use dagrun::executor::process::ProcessBackend;
    use dagrun::executor::{ExecBackend, PollOutcome};

    let dir = tempfile::tempdir().unwrap();
    let xdir = dir.path().join("xdir");
    std::fs::create_dir_all(&xdir).unwrap();

    let script_path = dir.path().join("stall.sh");
    std::fs::write(
        &script_path,
        "#!/bin/sh\ntrap 'touch intr-marker' INT\ni=0\nwhile [ $i -lt 100 ]; do\n  sleep 1\n  i=$((i+1))\ndone\n",
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
    }

    let env = ChildEnv {
        test_id: TestId::new("stall", [], None),
        xdir: xdir.clone(),
        test_source_dir: dir.path().to_path_buf(),
        results_root: dir.path().to_path_buf(),
        script_path: script_path.clone(),
        resources: ResourceAttrs::default(),
        timeout_secs: Some(1),
        params: BTreeMap::new(),
        keywords: vec![],
        dep_dir_map: BTreeMap::new(),
        dep_dirs: vec![],
        is_analyze: false,
        analyze_param_children: BTreeMap::new(),
        platform: PlatformInfo {
            platform_name: "local".to_string(),
            compiler: String::new(),
            vvtestsrc: PathBuf::from("."),
            project: String::new(),
            config_dirs: vec![],
            options: vec![],
            options_off: vec![],
        },
        exit_status: ExitStatusConfig {
            diff_exit_status: 64,
            skip_exit_status: 63,
        },
        extra_env: BTreeMap::new(),
    };

    let backend = ProcessBackend::new();
    let argv = vec![script_path.display().to_string()];
    let mut handle = backend.launch(&env, &argv).await.unwrap();

    let started = std::time::Instant::now();
    let status = loop {
        assert!(started.elapsed().as_secs() < 10, "test did not escalate to termination in time");
        let elapsed = started.elapsed().as_secs();
        match backend
            .poll(&mut handle, elapsed, env.timeout_secs, 1, env.exit_status)
            .await
            .unwrap()
        {
            PollOutcome::StillRunning => tokio::time::sleep(std::time::Duration::from_millis(100)).await,
            PollOutcome::Finished { status, .. } => break status,
        }
    };

    assert_eq!(status, TestStatus::Timeout);
    assert!(
        xdir.join("intr-marker").exists(),
        "SIGINT should have been delivered and handled before SIGTERM killed the group"
    );
}

/// S6 (batch job exits without a clean journal finish): once the adapter
/// reports the job as no longer running, a member test with a `Start`
/// record but no `Finish` is reconciled to `NotDone` rather than left
/// pending forever.
#[cfg(unix)]
#[tokio::test]
async fn s6_batch_job_exits_without_journal_finish_yields_notdone() {
    use dagrun::batch::adapter::ShellAdapter;
    use dagrun::batch::{BatchGroup, BatchManager};
    use dagrun::journal::Journal;

    let scripts_dir = tempfile::tempdir().unwrap();
    let results_dir = tempfile::tempdir().unwrap();
    let journal_path = results_dir.path().join("journal.jsonl");
    let mut journal = Journal::open(&journal_path).unwrap();

    let id = TestId::new("batched", [], None);
    journal.append_start(&id).unwrap();

    let mut mgr = BatchManager::new(ShellAdapter, std::time::Duration::from_millis(50));
    let groups = vec![BatchGroup {
        members: vec![id.clone()],
        queue_time_secs: 60,
    }];
    mgr.submit_groups(groups, scripts_dir.path(), 10, |_bid, _members| {
        vec!["echo".to_string(), "hello".to_string()]
    })
    .await
    .unwrap();

    let mut stopped = Vec::new();
    for _ in 0..100 {
        stopped = mgr.poll_once().await.unwrap();
        if !stopped.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(!stopped.is_empty(), "batch job did not stop in time");
    let bid = stopped[0];

    journal.reload().unwrap();
    let unfinished = mgr
        .reconcile_against_journal(bid, &journal, std::time::Duration::from_secs(0))
        .expect("job should be reconciled immediately with a zero check timeout");

    assert_eq!(unfinished, vec![(id.clone(), TestStatus::NotDone)]);
}

/// End-to-end direct-execution pipeline: populate the execute directory,
/// generate the utility scripts, exec the test's real script, and poll it
/// through a real process exit rather than exercising scheduler/store logic
/// in isolation.
#[cfg(unix)]
#[tokio::test]
async fn end_to_end_direct_run_executes_real_script_and_reports_pass() {
    use dagrun::childenv::{ChildEnv, ExitStatusConfig, PlatformInfo};
    use dagrun::executor::process::ProcessBackend;
    use dagrun::executor::scripts::write_util_scripts;
    use dagrun::executor::{populate_xdir, ExecBackend, PollOutcome};

    let source_root = tempfile::tempdir().unwrap();
    let results_root = tempfile::tempdir().unwrap();

    std::fs::write(source_root.path().join("runtest.sh"), "#!/bin/sh\nexit 0\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        let script = source_root.path().join("runtest.sh");
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
    }

    let mut spec = bare_spec("pipeline");
    spec.root = source_root.path().to_path_buf();
    spec.file = PathBuf::from("runtest.sh");
    spec.files = vec![FileEntry {
        source: "runtest.sh".to_string(),
        dest: None,
        kind: dagrun::model::FileEntryKind::Link,
    }];

    let xdir = spec.xdir(results_root.path());
    populate_xdir(&xdir, &spec.source_dir(), &spec.files).await.unwrap();

    let env = ChildEnv {
        test_id: spec.id.clone(),
        xdir: xdir.clone(),
        test_source_dir: spec.source_dir(),
        results_root: results_root.path().to_path_buf(),
        script_path: spec.script_path(),
        resources: ResourceAttrs::default(),
        timeout_secs: None,
        params: spec.params.clone(),
        keywords: spec.keywords.clone(),
        dep_dir_map: BTreeMap::new(),
        dep_dirs: vec![],
        is_analyze: false,
        analyze_param_children: BTreeMap::new(),
        platform: PlatformInfo {
            platform_name: "local".to_string(),
            compiler: String::new(),
            vvtestsrc: PathBuf::from("."),
            project: String::new(),
            config_dirs: vec![],
            options: vec![],
            options_off: vec![],
        },
        exit_status: ExitStatusConfig {
            diff_exit_status: 64,
            skip_exit_status: 63,
        },
        extra_env: BTreeMap::new(),
    };
    write_util_scripts(&xdir, &spec.id, &env).unwrap();

    assert!(xdir.join("vvtest_util.sh").exists());
    assert!(xdir.join("vvtest_util.py").exists());
    assert!(xdir.join("runtest.sh").exists(), "linked script should be present in the execute directory");

    let backend = ProcessBackend::new();
    let argv = vec![env.script_path.display().to_string()];
    let mut handle = backend.launch(&env, &argv).await.unwrap();

    let started = std::time::Instant::now();
    let (status, exit_value) = loop {
        assert!(started.elapsed().as_secs() < 10, "real process never exited");
        let elapsed = started.elapsed().as_secs();
        match backend.poll(&mut handle, elapsed, None, 30, env.exit_status).await.unwrap() {
            PollOutcome::StillRunning => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            PollOutcome::Finished { status, exit_value } => break (status, exit_value),
        }
    };

    assert_eq!(status, TestStatus::Pass);
    assert_eq!(exit_value, Some(0));
}

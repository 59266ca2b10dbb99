//! Top-level orchestration: owns the store, dependency graph, resource
//! pool, and the direct-vs-batch mode switch, driving the ready queue until
//! nothing more can run.
//!
//! Tests launch concurrently up to a configured parallelism limit and report
//! back over a channel, so the ready queue can be re-consulted as soon as
//! any single test frees up resources rather than waiting for a whole batch
//! of launches to finish.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::{adapter::BatchAdapter, grouping, BatchManager};
use crate::childenv::{ChildEnv, ExitStatusConfig, PlatformInfo};
use crate::config::Config;
use crate::deps;
use crate::error::EngineResult;
use crate::executor::{self, ExecBackend, PollOutcome};
use crate::journal::Journal;
use crate::model::{TestId, TestStatus};
use crate::report::{ConsoleProgress, RunSummary};
use crate::resources::ResourcePool;
use crate::scheduler::{self, NoEstimates};
use crate::store::TestCaseStore;

/// Everything the orchestrator needs for a single run: the parsed tests
/// (already in the store), the active configuration, and the filesystem
/// roots it writes under.
pub struct Orchestrator {
    pub config: Config,
    pub store: TestCaseStore,
    pub journal: Journal,
    pub results_root: PathBuf,
    pub platform_name: String,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, store: TestCaseStore, journal: Journal, platform_name: impl Into<String>) -> Self {
        let results_root = config.directories.results_root.clone();
        Self {
            config,
            store,
            journal,
            results_root,
            platform_name: platform_name.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A shared flag the caller can flip from a signal handler (`SIGINT`,
    /// `SIGTERM`, `SIGHUP`) to request a clean shutdown: stop accepting new
    /// ready tests, escalate-kill active children, cancel submitted batch
    /// jobs, and exit once the final journal records are written.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Resolve the dependency DAG. Must be called once before `run_direct`
    /// or `run_batch`.
    pub fn resolve_dependencies(&mut self) -> EngineResult<()> {
        deps::resolve_dependencies(&mut self.store, &self.results_root)?;
        Ok(())
    }

    fn platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            platform_name: self.platform_name.clone(),
            compiler: self.config.platform.compiler.clone(),
            vvtestsrc: self.config.directories.engine_root.clone(),
            project: self.config.directories.project.clone(),
            config_dirs: self.config.directories.config_dirs.clone(),
            options: self.config.run.options.clone(),
            options_off: self.config.run.options_off.clone(),
        }
    }

    fn exit_status_config(&self) -> ExitStatusConfig {
        ExitStatusConfig {
            diff_exit_status: self.config.run.diff_exit_status,
            skip_exit_status: self.config.run.skip_exit_status,
        }
    }

    /// Direct-mode run loop: pop ready tests from the scheduler, launch them
    /// concurrently up to `run.max_parallel`, poll each to completion,
    /// journal terminal statuses, and repeat until nothing is left ready or
    /// running — finally flushing anything still `NotRun` to `NotRunByDep`.
    pub async fn run_direct<B: ExecBackend + Default + 'static>(&mut self) -> EngineResult<RunSummary>
    where
        B::Handle: Send + 'static,
    {
        let backend = std::sync::Arc::new(B::default());
        let pool = std::sync::Arc::new(tokio::sync::Mutex::new(ResourcePool::new(
            self.config.platform.max_cores,
            self.config.platform.max_devices,
            self.config.platform.allow_oversubscription,
        )));
        let max_parallel = self.config.run.max_parallel;
        let progress = ConsoleProgress::new(
            self.store.len() as u64,
            self.config.report.quiet,
            self.config.report.progress,
        );
        let platform = self.platform_info();
        let exit_status = self.exit_status_config();

        let start = Instant::now();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(TestId, TestStatus, Option<i32>)>();
        let mut running: usize = 0;

        loop {
            // Flush any tests that can now never run because a dependency
            // landed in a failing terminal status.
            for (id, blocker) in scheduler::collect_will_never_run(&self.store) {
                if let Some(tc) = self.store.get_mut(&id) {
                    tc.status.status = TestStatus::NotRunByDep;
                    tc.status.blocking_dependency = Some(blocker);
                }
                self.journal.append_finish(&id, TestStatus::NotRunByDep, None)?;
                progress.on_test_complete(&id, TestStatus::NotRunByDep);
            }

            let mut launched_this_pass = false;
            while !self.shutdown.load(Ordering::SeqCst) && running < max_parallel {
                let next = {
                    let pool_guard = pool.lock().await;
                    scheduler::pop_next(&self.store, &pool_guard, &NoEstimates)
                };
                let Some(id) = next else { break };

                let req = self.store.get(&id).map(|tc| tc.resource_request()).unwrap_or_default();
                let handle = {
                    let mut pool_guard = pool.lock().await;
                    pool_guard.try_obtain(req)?
                };
                let Some(handle) = handle else { break };

                launched_this_pass = true;
                running += 1;
                if let Some(tc) = self.store.get_mut(&id) {
                    tc.status.status = TestStatus::Running;
                    tc.status.start_time = Some(std::time::SystemTime::now());
                }
                self.journal.append_start(&id)?;

                let tc = self.store.get(&id).unwrap();
                let spec = tc.spec.clone();
                let dep_dir_map = tc.dep_dir_map.clone();
                let analyze_param_children = tc.analyze_param_children.clone();
                let mut dep_dirs: Vec<PathBuf> = dep_dir_map.values().flatten().cloned().collect();
                dep_dirs.sort();
                dep_dirs.dedup();

                let xdir = spec.xdir(&self.results_root);
                let test_source_dir = spec.source_dir();
                let script_path = spec.script_path();
                let timeout_secs = spec.timeout_secs.or(self.config.run.default_timeout_secs);
                let interrupt_to_kill = self.config.run.interrupt_to_kill_timeout_secs;
                let files = spec.files.clone();
                let test_id = id.clone();
                let backend = backend.clone();
                let pool = pool.clone();
                let tx = tx.clone();
                let shutdown = self.shutdown.clone();
                let results_root = self.results_root.clone();
                let platform = platform.clone();

                tokio::spawn(async move {
                    let env = ChildEnv {
                        test_id: test_id.clone(),
                        xdir: xdir.clone(),
                        test_source_dir,
                        results_root,
                        script_path,
                        resources: handle.attrs.clone(),
                        timeout_secs,
                        params: spec.params.clone(),
                        keywords: spec.keywords.clone(),
                        dep_dir_map,
                        dep_dirs,
                        is_analyze: spec.is_analyze,
                        analyze_param_children,
                        platform,
                        exit_status,
                        extra_env: BTreeMap::new(),
                    };

                    let result =
                        run_one_test::<B>(&backend, &env, &files, timeout_secs, interrupt_to_kill, &shutdown).await;
                    if let Err(e) = pool.lock().await.release(handle) {
                        tracing::error!(test = %test_id, error = %e, "resource handle release failed");
                    }

                    let (status, exit_value) = match result {
                        Ok((s, ev)) => (s, ev),
                        Err(e) => {
                            tracing::error!(test = %test_id, error = %e, "test execution failed");
                            (TestStatus::Fail, None)
                        }
                    };
                    let _ = tx.send((test_id, status, exit_value));
                });
            }

            if !launched_this_pass && running == 0 {
                break;
            }

            if let Some((id, status, exit_value)) = rx.recv().await {
                running -= 1;
                if let Some(tc) = self.store.get_mut(&id) {
                    tc.status.status = status;
                    tc.status.stop_time = Some(std::time::SystemTime::now());
                    tc.status.exit_value = exit_value;
                }
                self.journal.append_finish(&id, status, exit_value)?;
                progress.on_test_complete(&id, status);
            }
        }

        self.store.flush_remaining_to_not_run_by_dep();
        let summary = RunSummary::from_counts(self.store.count_by_status(), start.elapsed());
        progress.finish(&summary);
        Ok(summary)
    }

    /// Baseline-run mode: reruns every test's script sequentially with its
    /// own (usually shorter) `run.baseline_timeout_secs` timeout, bypassing
    /// the dependency DAG and the ready-queue scheduler entirely — a
    /// baseline pass compares (and refreshes) reference output files rather
    /// than exercising the suite's normal pass/fail semantics, so ordering
    /// and concurrency between tests don't matter the way they do for
    /// `run_direct`.
    pub async fn run_baseline<B: ExecBackend + Default>(&mut self) -> EngineResult<RunSummary> {
        let backend = B::default();
        let platform = self.platform_info();
        let exit_status = self.exit_status_config();
        let baseline_timeout = self.config.run.baseline_timeout_secs;
        let interrupt_to_kill = self.config.run.interrupt_to_kill_timeout_secs;
        let progress = ConsoleProgress::new(
            self.store.len() as u64,
            self.config.report.quiet,
            self.config.report.progress,
        );
        let start = Instant::now();

        let ids: Vec<TestId> = self.store.ids().cloned().collect();
        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            let tc = self.store.get(id).unwrap();
            let spec = &tc.spec;
            let env = ChildEnv {
                test_id: id.clone(),
                xdir: spec.xdir(&self.results_root),
                test_source_dir: spec.source_dir(),
                results_root: self.results_root.clone(),
                script_path: spec.script_path(),
                resources: Default::default(),
                timeout_secs: Some(baseline_timeout),
                params: spec.params.clone(),
                keywords: spec.keywords.clone(),
                dep_dir_map: BTreeMap::new(),
                dep_dirs: Vec::new(),
                is_analyze: spec.is_analyze,
                analyze_param_children: BTreeMap::new(),
                platform: platform.clone(),
                exit_status,
                extra_env: BTreeMap::new(),
            };
            self.journal.append_start(id)?;
            jobs.push((id.clone(), env, spec.files.clone()));
        }

        let results = executor::run_baseline(&backend, &jobs, baseline_timeout, interrupt_to_kill).await;

        for (id, status, exit_value) in results {
            if let Some(tc) = self.store.get_mut(&id) {
                tc.status.status = status;
                tc.status.stop_time = Some(std::time::SystemTime::now());
                tc.status.exit_value = exit_value;
            }
            self.journal.append_finish(&id, status, exit_value)?;
            progress.on_test_complete(&id, status);
        }

        let summary = RunSummary::from_counts(self.store.count_by_status(), start.elapsed());
        progress.finish(&summary);
        Ok(summary)
    }

    /// Batch-mode run: submit ready tests in waves as their dependencies
    /// clear (subject to `batch.max_jobs` concurrently-submitted jobs), poll
    /// outstanding jobs until every one is accounted for, and submit any
    /// newly-ready tests a stopped job's completion unblocked. Each job
    /// re-invokes this binary against a private subset of test specs
    /// (written to `scripts_dir`) and a snapshot of the resolved config,
    /// sharing this run's results journal.
    pub async fn run_batch<A: BatchAdapter>(
        &mut self,
        adapter: A,
        scripts_dir: &std::path::Path,
        self_exe: &str,
    ) -> EngineResult<RunSummary> {
        let start = Instant::now();
        let poll_interval = Duration::from_secs(self.config.batch.poll_interval_secs);
        let check_timeout = Duration::from_secs(self.config.batch.check_timeout_secs);
        let max_jobs = self.config.batch.max_jobs;
        let mut manager = BatchManager::new(adapter, poll_interval);
        let mut grouped: std::collections::BTreeSet<TestId> = std::collections::BTreeSet::new();

        let resolved_config_path = scripts_dir.join("resolved-config.toml");
        let resolved_toml = toml::to_string_pretty(&self.config)
            .map_err(|e| crate::error::EngineError::Other(anyhow::anyhow!(e)))?;
        std::fs::write(&resolved_config_path, resolved_toml).map_err(crate::error::BatchError::Io)?;

        loop {
            self.submit_ready_wave(&mut manager, &mut grouped, scripts_dir, self_exe, &resolved_config_path, max_jobs)
                .await?;

            for (id, blocker) in scheduler::collect_will_never_run(&self.store) {
                if let Some(tc) = self.store.get_mut(&id) {
                    if !tc.status.status.is_terminal() {
                        tc.status.status = TestStatus::NotRunByDep;
                        tc.status.blocking_dependency = Some(blocker);
                        self.journal.append_finish(&id, TestStatus::NotRunByDep, None)?;
                    }
                }
            }

            let nothing_left_to_submit = self
                .store
                .iter()
                .all(|(id, tc)| tc.status.status.is_terminal() || grouped.contains(id));

            if manager.is_fully_done() && nothing_left_to_submit {
                break;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                manager.cancel_all().await?;
                break;
            }

            self.journal.reload()?;
            manager.poll_once().await?;
            // Promote any still-`Todo` groups now that jobs may have
            // finished and freed up `max_jobs` slots.
            manager.submit_pending(max_jobs).await?;

            for bid in manager.stopped_job_ids() {
                if let Some(unfinished) = manager.reconcile_against_journal(bid, &self.journal, check_timeout) {
                    for (id, status) in unfinished {
                        if let Some(tc) = self.store.get_mut(&id) {
                            if !tc.status.status.is_terminal() {
                                tc.status.status = status;
                            }
                        }
                        self.journal.append_finish(&id, status, None)?;
                    }
                }
            }
            tokio::time::sleep(manager.poll_interval()).await;
        }

        self.journal.reload()?;
        for (id, tc) in self.store.iter_mut() {
            if !tc.status.status.is_terminal() {
                if let Some(status) = self.journal.terminal_status(id) {
                    tc.status.status = status;
                }
            }
        }

        self.store.flush_remaining_to_not_run_by_dep();
        let summary = RunSummary::from_counts(self.store.count_by_status(), start.elapsed());
        Ok(summary)
    }

    /// Group every currently-ready, not-yet-submitted test into batch jobs
    /// and hand them to `manager`, which submits as many as `max_jobs`
    /// allows and queues the rest. Writes each job's member-test subset to
    /// `scripts_dir/tests-<bid>.json` and points its re-invocation at that
    /// file plus the shared resolved config, so the re-entered child can
    /// run its subset directly without re-resolving the whole DAG (its
    /// dependencies were already satisfied before this wave grouped it).
    #[allow(clippy::too_many_arguments)]
    async fn submit_ready_wave<A: BatchAdapter>(
        &mut self,
        manager: &mut BatchManager<A>,
        grouped: &mut std::collections::BTreeSet<TestId>,
        scripts_dir: &std::path::Path,
        self_exe: &str,
        resolved_config_path: &std::path::Path,
        max_jobs: u32,
    ) -> EngineResult<()> {
        let groupables: Vec<grouping::Groupable> = self
            .store
            .iter()
            .filter(|(id, tc)| {
                tc.status.status == TestStatus::NotRun && !grouped.contains(*id) && !deps::is_blocking(&self.store, id)
            })
            .map(|(id, tc)| grouping::Groupable {
                id: id.clone(),
                estimated_runtime_secs: tc.spec.timeout_secs.unwrap_or(600),
                force_singleton: tc.spec.is_analyze || tc.spec.timeout_secs.is_none(),
            })
            .collect();

        if groupables.is_empty() {
            return Ok(());
        }

        let groups = grouping::process_groups(
            &groupables,
            self.config.batch.group_size,
            self.config.batch.max_timeout_secs,
        );
        for group in &groups {
            grouped.extend(group.members.iter().cloned());
        }

        let store = &self.store;
        let self_exe = self_exe.to_string();
        manager
            .submit_groups(groups, scripts_dir, max_jobs, |bid, members| {
                let tests_path = scripts_dir.join(format!("tests-{bid}.json"));
                let specs: Vec<&crate::model::TestSpec> =
                    members.iter().filter_map(|id| store.get(id).map(|tc| &tc.spec)).collect();
                if let Ok(json) = serde_json::to_string(&specs) {
                    let _ = std::fs::write(&tests_path, json);
                }
                vec![
                    self_exe.clone(),
                    "run".to_string(),
                    "--config".to_string(),
                    resolved_config_path.display().to_string(),
                    "--tests".to_string(),
                    tests_path.display().to_string(),
                    format!("--qsub-id={bid}"),
                ]
            })
            .await?;

        Ok(())
    }
}

async fn run_one_test<B: ExecBackend>(
    backend: &B,
    env: &ChildEnv,
    files: &[crate::model::FileEntry],
    timeout_secs: Option<u64>,
    interrupt_to_kill_timeout_secs: u64,
    shutdown: &AtomicBool,
) -> EngineResult<(TestStatus, Option<i32>)> {
    executor::populate_xdir(&env.xdir, &env.test_source_dir, files).await?;

    executor::scripts::write_util_scripts(&env.xdir, &env.test_id, env)?;

    let argv = vec![env.script_path.display().to_string()];
    let mut handle = backend.launch(env, &argv).await?;

    let started = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            backend.kill(&mut handle).await?;
            return Ok((TestStatus::NotDone, None));
        }

        let elapsed = started.elapsed().as_secs();
        match backend
            .poll(&mut handle, elapsed, timeout_secs, interrupt_to_kill_timeout_secs, env.exit_status)
            .await?
        {
            PollOutcome::StillRunning => {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            PollOutcome::Finished { status, exit_value } => {
                return Ok((status, exit_value));
            }
        }
    }
}

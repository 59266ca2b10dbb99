//! Direct-mode execution — populate the execute directory, generate the
//! utility scripts, launch the test, and poll it to completion.
//!
//! The launch/poll contract is a trait, [`ExecBackend`], so the process-group
//! signal-escalation backend used on Unix ([`process::ProcessBackend`]) and
//! the handle-based fallback used where process groups aren't available
//! ([`forkless::ForklessBackend`]) are interchangeable from the
//! orchestrator's point of view.

pub mod forkless;
#[cfg(unix)]
pub mod process;
pub mod scripts;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::glob;

use crate::childenv::{ChildEnv, ExitStatusConfig};
use crate::error::ExecError;
use crate::model::{FileEntry, FileEntryKind, TestId, TestStatus};

/// Outcome of polling a running test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    StillRunning,
    Finished { status: TestStatus, exit_value: Option<i32> },
}

/// A backend capable of launching a test's process (or process group) and
/// polling/killing it. Implementors own whatever child-process handle they
/// need internally.
#[async_trait]
pub trait ExecBackend: Send + Sync {
    type Handle: Send;

    async fn launch(&self, env: &ChildEnv, argv: &[String]) -> Result<Self::Handle, ExecError>;

    /// Check whether the child has exited, escalating signals if it has
    /// exceeded its timeout. `elapsed_secs` is how long the test has been
    /// running.
    async fn poll(
        &self,
        handle: &mut Self::Handle,
        elapsed_secs: u64,
        timeout_secs: Option<u64>,
        interrupt_to_kill_timeout_secs: u64,
        exit_status: ExitStatusConfig,
    ) -> Result<PollOutcome, ExecError>;

    /// Forcibly terminate the child, used on shutdown.
    async fn kill(&self, handle: &mut Self::Handle) -> Result<(), ExecError>;
}

/// Populate a test's execute directory: create it, then copy/link/glob-
/// expand each of its file entries into place. Rejects absolute source
/// paths uniformly for every entry kind, including baseline entries (see
/// DESIGN.md's open-question decision on this).
pub async fn populate_xdir(xdir: &Path, source_root: &Path, files: &[FileEntry]) -> Result<(), ExecError> {
    tokio::fs::create_dir_all(xdir)
        .await
        .map_err(|source| ExecError::XdirCreate {
            path: xdir.to_path_buf(),
            source,
        })?;

    for entry in files {
        if Path::new(&entry.source).is_absolute() {
            return Err(ExecError::AbsoluteSourcePath(PathBuf::from(&entry.source)));
        }

        let pattern = source_root.join(&entry.source);
        let pattern_str = pattern.display().to_string();
        let glob_iter = glob(&pattern_str).map_err(|e| {
            tracing::debug!(error = %e, pattern = %pattern_str, "invalid glob pattern");
            ExecError::AmbiguousGlob {
                pattern: pattern_str.clone(),
                count: 0,
            }
        })?;
        let matches: Vec<PathBuf> = glob_iter.filter_map(Result::ok).collect();

        if entry.dest.is_some() && matches.len() > 1 {
            return Err(ExecError::AmbiguousGlob {
                pattern: pattern_str,
                count: matches.len(),
            });
        }

        for src in matches {
            let dest_name = entry
                .dest
                .clone()
                .unwrap_or_else(|| src.file_name().unwrap().to_string_lossy().to_string());
            let dest = xdir.join(dest_name);
            match entry.kind {
                FileEntryKind::Copy | FileEntryKind::Baseline => {
                    tokio::fs::copy(&src, &dest).await.map_err(ExecError::Io)?;
                }
                FileEntryKind::Link => {
                    #[cfg(unix)]
                    {
                        tokio::fs::symlink(&src, &dest).await.map_err(ExecError::Io)?;
                    }
                    #[cfg(not(unix))]
                    {
                        tokio::fs::copy(&src, &dest).await.map_err(ExecError::Io)?;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Sequential baseline-run mode: reruns each test's script with a trailing
/// `--baseline` argument and its own (usually shorter) timeout, skipping the
/// dependency DAG and the normal input-file staging entirely — baseline runs
/// compare against, and then refresh, whatever reference files are already
/// checked in, rather than starting from a freshly staged directory. A test
/// that passes has its `FileEntryKind::Baseline` entries copied from the
/// execute directory back to its source directory afterward, refreshing the
/// checked-in reference output.
pub async fn run_baseline<B: ExecBackend>(
    backend: &B,
    jobs: &[(TestId, ChildEnv, Vec<FileEntry>)],
    baseline_timeout_secs: u64,
    interrupt_to_kill_timeout_secs: u64,
) -> Vec<(TestId, TestStatus, Option<i32>)> {
    let mut results = Vec::with_capacity(jobs.len());

    for (id, env, files) in jobs {
        tracing::info!(test = %id, "baselining");

        if let Err(e) = tokio::fs::create_dir_all(&env.xdir).await {
            tracing::error!(test = %id, error = %e, "failed to create baseline execute directory");
            results.push((id.clone(), TestStatus::Fail, None));
            continue;
        }
        if let Err(e) = scripts::write_util_scripts(&env.xdir, &env.test_id, env) {
            tracing::error!(test = %id, error = %e, "failed to write utility scripts for baseline run");
            results.push((id.clone(), TestStatus::Fail, None));
            continue;
        }

        let argv = vec![env.script_path.display().to_string(), "--baseline".to_string()];
        let (status, exit_value) = match backend.launch(env, &argv).await {
            Ok(mut handle) => {
                let started = std::time::Instant::now();
                loop {
                    let elapsed = started.elapsed().as_secs();
                    match backend
                        .poll(
                            &mut handle,
                            elapsed,
                            Some(baseline_timeout_secs),
                            interrupt_to_kill_timeout_secs,
                            env.exit_status,
                        )
                        .await
                    {
                        Ok(PollOutcome::StillRunning) => {
                            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                        }
                        Ok(PollOutcome::Finished { status, exit_value }) => break (status, exit_value),
                        Err(e) => {
                            tracing::error!(test = %id, error = %e, "baseline run poll failed");
                            break (TestStatus::Fail, None);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(test = %id, error = %e, "failed to launch baseline run");
                (TestStatus::Fail, None)
            }
        };

        if status == TestStatus::Pass {
            for entry in files {
                if entry.kind != FileEntryKind::Baseline {
                    continue;
                }
                let dest_name = entry
                    .dest
                    .clone()
                    .unwrap_or_else(|| Path::new(&entry.source).file_name().unwrap().to_string_lossy().to_string());
                let from = env.xdir.join(&dest_name);
                let to = env.test_source_dir.join(&entry.source);
                if let Err(e) = tokio::fs::copy(&from, &to).await {
                    tracing::warn!(test = %id, error = %e, "failed to copy baseline file back to source");
                }
            }
        }

        results.push((id.clone(), status, exit_value));
    }

    results
}

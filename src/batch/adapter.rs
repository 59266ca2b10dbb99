//! The `BatchAdapter` trait: a single pluggable seam for "how do I talk to
//! the queue" — write a submission script, submit it, query or cancel jobs
//! by id — so a real scheduler backend and the local shell-based one below
//! are interchangeable from the batch manager's point of view.

use std::path::Path;

use async_trait::async_trait;

use crate::error::BatchError;

/// An opaque identifier a `BatchAdapter` assigns to a submitted job; this
/// crate never interprets it beyond passing it back to `query`/`cancel`.
pub type JobId = String;

/// The state a batch adapter reports for a previously submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    /// The queue has no record of the job at all (lost, purged, or the
    /// adapter itself restarted) — the caller should treat this as a
    /// terminal failure rather than keep polling forever.
    Unknown,
}

/// A batch-queue backend: write the submission script, submit it, and
/// report on job state. Implementations wrap a real scheduler (Slurm, LSF,
/// PBS) or, for local testing, a plain shell-background adapter.
#[async_trait]
pub trait BatchAdapter: Send + Sync {
    /// Write the script that will be handed to the queue for job `job_name`,
    /// including the hidden re-invocation (`--qsub-id=<bid>`) that lets this
    /// binary run in "batch worker" mode inside the job. The job's stdout
    /// and stderr are redirected to `output_path`, so the manager can later
    /// tell a job that never produced any output from one that ran but
    /// never reported a clean finish.
    async fn write_script(
        &self,
        script_path: &Path,
        job_name: &str,
        queue_time_secs: u64,
        reentry_args: &[String],
        output_path: &Path,
    ) -> Result<(), BatchError>;

    async fn submit(&self, script_path: &Path) -> Result<JobId, BatchError>;

    async fn query(&self, ids: &[JobId]) -> Result<Vec<(JobId, JobState)>, BatchError>;

    async fn cancel(&self, ids: &[JobId]) -> Result<(), BatchError>;
}

/// A `BatchAdapter` that runs each "job" as a detached local shell process,
/// for development and for exercising the batch code path without a real
/// queue.
#[derive(Debug, Default)]
pub struct ShellAdapter;

#[async_trait]
impl BatchAdapter for ShellAdapter {
    async fn write_script(
        &self,
        script_path: &Path,
        job_name: &str,
        queue_time_secs: u64,
        reentry_args: &[String],
        output_path: &Path,
    ) -> Result<(), BatchError> {
        let mut body = String::new();
        body.push_str("#!/bin/sh\n");
        body.push_str(&format!("# job: {job_name}\n"));
        body.push_str(&format!("# queue_time_secs: {queue_time_secs}\n"));
        body.push_str(&format!("exec > {} 2>&1\n", output_path.display()));
        body.push_str(&reentry_args.join(" "));
        body.push('\n');

        tokio::fs::write(script_path, body)
            .await
            .map_err(|source| BatchError::ScriptWrite {
                path: script_path.to_path_buf(),
                source,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(script_path)
                .await
                .map_err(|source| BatchError::ScriptWrite {
                    path: script_path.to_path_buf(),
                    source,
                })?
                .permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(script_path, perms)
                .await
                .map_err(|source| BatchError::ScriptWrite {
                    path: script_path.to_path_buf(),
                    source,
                })?;
        }

        Ok(())
    }

    async fn submit(&self, script_path: &Path) -> Result<JobId, BatchError> {
        let child = tokio::process::Command::new(script_path)
            .spawn()
            .map_err(|e| BatchError::SubmitFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| BatchError::SubmitFailed("child exited before pid was available".into()))?;
        // Detach: we only track liveness via pid, not the tokio::process
        // handle, matching the "fire and forget, poll via the queue" model
        // a real adapter would use.
        std::mem::forget(child);
        Ok(pid.to_string())
    }

    async fn query(&self, ids: &[JobId]) -> Result<Vec<(JobId, JobState)>, BatchError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(pid) = id.parse::<i32>() else {
                out.push((id.clone(), JobState::Unknown));
                continue;
            };
            #[cfg(unix)]
            let state = if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
                JobState::Running
            } else {
                JobState::Done
            };
            #[cfg(not(unix))]
            let state = JobState::Unknown;
            out.push((id.clone(), state));
        }
        Ok(out)
    }

    async fn cancel(&self, ids: &[JobId]) -> Result<(), BatchError> {
        #[cfg(unix)]
        for id in ids {
            if let Ok(pid) = id.parse::<i32>() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }
        #[cfg(not(unix))]
        let _ = ids;
        Ok(())
    }
}

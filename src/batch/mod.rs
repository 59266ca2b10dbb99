//! Indirect batch-queue execution. Packs ready tests into batch jobs via
//! [`grouping`], submits them through a [`adapter::BatchAdapter`] subject to
//! a concurrency cap, and polls the journal plus the adapter's own job-state
//! query to decide when a job is actually finished.

pub mod adapter;
pub mod grouping;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::BatchError;
use crate::journal::Journal;
use crate::model::{TestId, TestStatus};

pub use adapter::{BatchAdapter, JobId, JobState};
pub use grouping::{apply_queue_timeout_bump_factor, process_groups, BatchGroup, Groupable};

/// Lifecycle of a single submitted batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchJobState {
    /// Grouped but not yet submitted — waiting for a `max_jobs` slot.
    Todo,
    Submitted,
    /// The adapter reports the job as no longer running, but the journal
    /// hasn't yet shown every member test finished — could still be a
    /// trailing write, or a job that died without cleanly finishing.
    Stopped,
    Done,
}

struct TrackedJob {
    job_id: Option<JobId>,
    members: Vec<TestId>,
    state: BatchJobState,
    script_path: PathBuf,
    output_path: PathBuf,
    queue_time_secs: u64,
    reentry_args: Vec<String>,
    /// When this job was first observed `Stopped`, used to gate the
    /// synthetic-status decision behind `check_timeout_secs` so a trailing
    /// write doesn't get misread as a lost test.
    stopped_at: Option<Instant>,
}

/// Drives the full batch-mode run: submit groups (subject to `max_jobs`),
/// poll until every member test has a terminal status (or its job is
/// declared lost), and report synthetic `NotRun`/`NotDone`/`Fail` statuses
/// for jobs that never checked in cleanly.
pub struct BatchManager<A: BatchAdapter> {
    adapter: A,
    poll_interval: Duration,
    jobs: BTreeMap<u32, TrackedJob>,
    next_batch_id: u32,
}

impl<A: BatchAdapter> BatchManager<A> {
    pub fn new(adapter: A, poll_interval: Duration) -> Self {
        Self {
            adapter,
            poll_interval,
            jobs: BTreeMap::new(),
            next_batch_id: 0,
        }
    }

    /// Register every group as a `Todo` job, then submit as many as
    /// `max_jobs` allows. `reentry_args_for` receives the assigned batch id
    /// and that group's member ids so the caller can stage a per-job tests
    /// subset file and build the re-invocation argv; it's called for every
    /// group immediately, whether or not the job is submitted right away.
    pub async fn submit_groups(
        &mut self,
        groups: Vec<BatchGroup>,
        scripts_dir: &std::path::Path,
        max_jobs: u32,
        reentry_args_for: impl Fn(u32, &[TestId]) -> Vec<String>,
    ) -> Result<(), BatchError> {
        for group in groups {
            let bid = self.next_batch_id;
            self.next_batch_id += 1;
            let job_name = format!("batch{bid}");
            let job_dir = scripts_dir.join(&job_name);
            // Stale directory from a prior, aborted run of the same job id;
            // tolerate it already being gone.
            if let Err(e) = std::fs::remove_dir_all(&job_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %job_dir.display(), error = %e, "failed to remove stale batch directory");
                }
            }
            std::fs::create_dir_all(&job_dir).map_err(BatchError::Io)?;

            let script_path = job_dir.join(format!("{job_name}.sh"));
            let output_path = job_dir.join(format!("{job_name}.out"));
            let args = reentry_args_for(bid, &group.members);

            self.jobs.insert(
                bid,
                TrackedJob {
                    job_id: None,
                    members: group.members,
                    state: BatchJobState::Todo,
                    script_path,
                    output_path,
                    queue_time_secs: group.queue_time_secs,
                    reentry_args: args,
                    stopped_at: None,
                },
            );
        }
        self.submit_pending(max_jobs).await
    }

    /// Submit as many `Todo` jobs as there are free slots under `max_jobs`
    /// concurrently-`Submitted` jobs. Call this again after jobs finish to
    /// let queued groups advance.
    pub async fn submit_pending(&mut self, max_jobs: u32) -> Result<(), BatchError> {
        let outstanding = self
            .jobs
            .values()
            .filter(|j| j.state == BatchJobState::Submitted)
            .count() as u32;
        let mut free_slots = max_jobs.saturating_sub(outstanding);
        if free_slots == 0 {
            return Ok(());
        }

        let todo_bids: Vec<u32> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.state == BatchJobState::Todo)
            .map(|(bid, _)| *bid)
            .collect();

        for bid in todo_bids {
            if free_slots == 0 {
                break;
            }
            let job_name = format!("batch{bid}");
            let (script_path, output_path, queue_time_secs, reentry_args) = {
                let job = self.jobs.get(&bid).expect("bid just listed from self.jobs");
                (
                    job.script_path.clone(),
                    job.output_path.clone(),
                    job.queue_time_secs,
                    job.reentry_args.clone(),
                )
            };
            self.adapter
                .write_script(&script_path, &job_name, queue_time_secs, &reentry_args, &output_path)
                .await?;
            let job_id = self.adapter.submit(&script_path).await?;

            let job = self.jobs.get_mut(&bid).expect("bid just listed from self.jobs");
            tracing::info!(batch_id = bid, job_id = %job_id, members = job.members.len(), "submitted batch job");
            job.job_id = Some(job_id);
            job.state = BatchJobState::Submitted;
            free_slots -= 1;
        }
        Ok(())
    }

    /// One polling pass: query adapter state for every outstanding job and
    /// update tracked state. Returns batch ids that transitioned to
    /// `Stopped` this pass, for the caller to cross-check against the
    /// journal.
    pub async fn poll_once(&mut self) -> Result<Vec<u32>, BatchError> {
        let outstanding: Vec<(u32, JobId)> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.state == BatchJobState::Submitted)
            .filter_map(|(bid, j)| j.job_id.clone().map(|id| (*bid, id)))
            .collect();

        if outstanding.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<JobId> = outstanding.iter().map(|(_, id)| id.clone()).collect();
        let states = self.adapter.query(&ids).await?;
        let state_by_id: BTreeMap<JobId, JobState> = states.into_iter().collect();

        let mut newly_stopped = Vec::new();
        for (bid, job_id) in outstanding {
            match state_by_id.get(&job_id) {
                Some(JobState::Done) | Some(JobState::Unknown) => {
                    if let Some(job) = self.jobs.get_mut(&bid) {
                        job.state = BatchJobState::Stopped;
                        job.stopped_at = Some(Instant::now());
                    }
                    newly_stopped.push(bid);
                }
                _ => {}
            }
        }
        Ok(newly_stopped)
    }

    /// Every batch id currently in `Stopped` state, whether newly stopped
    /// this pass or still awaiting its `check_timeout_secs` grace period —
    /// the caller should re-offer each of these to
    /// [`Self::reconcile_against_journal`] on every pass until it resolves.
    pub fn stopped_job_ids(&self) -> Vec<u32> {
        self.jobs
            .iter()
            .filter(|(_, j)| j.state == BatchJobState::Stopped)
            .map(|(bid, _)| *bid)
            .collect()
    }

    /// Cross-check a stopped job's member tests against the journal, once
    /// `check_timeout_secs` has elapsed since the job was first observed
    /// stopped (returns `None` before then — the caller should try again
    /// later rather than treat trailing writes as lost tests).
    ///
    /// For each member without a terminal journal record, picks a synthetic
    /// status: `NotRun` if the job produced no output at all (it likely
    /// never got scheduled), `NotDone` if the journal shows it started but
    /// never finished, or `Fail` if the job ran (it has output) but the
    /// test has no record in the journal whatsoever.
    pub fn reconcile_against_journal(
        &mut self,
        bid: u32,
        journal: &Journal,
        check_timeout: Duration,
    ) -> Option<Vec<(TestId, TestStatus)>> {
        let job = self.jobs.get_mut(&bid)?;
        if job.state != BatchJobState::Stopped {
            return None;
        }
        let stopped_at = *job.stopped_at.get_or_insert_with(Instant::now);
        if stopped_at.elapsed() < check_timeout {
            return None;
        }

        let output_exists = std::fs::metadata(&job.output_path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);

        let mut unfinished = Vec::new();
        for id in &job.members {
            if journal.has_terminal_record(id) {
                continue;
            }
            let status = if !output_exists {
                TestStatus::NotRun
            } else if journal.has_any_record(id) {
                TestStatus::NotDone
            } else {
                TestStatus::Fail
            };
            unfinished.push((id.clone(), status));
        }

        if unfinished.is_empty() {
            job.state = BatchJobState::Done;
        } else {
            tracing::warn!(
                batch_id = bid,
                count = unfinished.len(),
                "batch job stopped without all members finishing cleanly"
            );
            job.state = BatchJobState::Done;
        }
        Some(unfinished)
    }

    pub fn is_fully_done(&self) -> bool {
        self.jobs.values().all(|j| j.state == BatchJobState::Done)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Cancel every job that hasn't already stopped, for shutdown handling.
    pub async fn cancel_all(&mut self) -> Result<(), BatchError> {
        let ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| j.state == BatchJobState::Submitted)
            .filter_map(|j| j.job_id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.adapter.cancel(&ids).await?;
        for job in self.jobs.values_mut() {
            if job.state == BatchJobState::Submitted {
                job.state = BatchJobState::Stopped;
                job.stopped_at = Some(Instant::now());
            }
        }
        Ok(())
    }

    pub fn script_path(&self, bid: u32) -> Option<&std::path::Path> {
        self.jobs.get(&bid).map(|j| j.script_path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::adapter::ShellAdapter;

    #[tokio::test]
    async fn submit_groups_tracks_one_job_per_group() {
        let mut mgr = BatchManager::new(ShellAdapter, Duration::from_secs(1));
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![BatchGroup {
            members: vec![TestId::new("a", [], None)],
            queue_time_secs: 120,
        }];
        mgr.submit_groups(groups, dir.path(), 10, |bid, _members| vec![format!("--qsub-id={bid}")])
            .await
            .unwrap();
        assert_eq!(mgr.jobs.len(), 1);
        assert_eq!(mgr.jobs.values().next().unwrap().state, BatchJobState::Submitted);
    }

    #[tokio::test]
    async fn max_jobs_caps_how_many_submit_at_once() {
        let mut mgr = BatchManager::new(ShellAdapter, Duration::from_secs(1));
        let dir = tempfile::tempdir().unwrap();
        let groups = vec![
            BatchGroup {
                members: vec![TestId::new("a", [], None)],
                queue_time_secs: 60,
            },
            BatchGroup {
                members: vec![TestId::new("b", [], None)],
                queue_time_secs: 60,
            },
        ];
        mgr.submit_groups(groups, dir.path(), 1, |bid, _members| vec![format!("--qsub-id={bid}")])
            .await
            .unwrap();
        let submitted = mgr.jobs.values().filter(|j| j.state == BatchJobState::Submitted).count();
        let todo = mgr.jobs.values().filter(|j| j.state == BatchJobState::Todo).count();
        assert_eq!(submitted, 1);
        assert_eq!(todo, 1);
    }
}

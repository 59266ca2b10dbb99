//! Fallback execution backend for platforms without POSIX process groups
//! (Windows). Same [`super::ExecBackend`] contract as [`super::process`], but
//! timeout handling can only terminate or kill the direct child — there is
//! no process-group-wide signal to forward, so a test that forks its own
//! children can leave orphans behind on timeout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{ExecBackend, PollOutcome};
use crate::childenv::{ChildEnv, ExitStatusConfig};
use crate::error::ExecError;
use crate::model::TestStatus;

pub struct ForklessHandle {
    child: Child,
    timed_out: bool,
}

#[derive(Debug, Default)]
pub struct ForklessBackend;

impl ForklessBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecBackend for ForklessBackend {
    type Handle = ForklessHandle;

    async fn launch(&self, env: &ChildEnv, argv: &[String]) -> Result<Self::Handle, ExecError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            )));
        };

        let child = Command::new(program)
            .args(args)
            .current_dir(&env.xdir)
            .envs(env.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::LaunchFailed { attempts: 1, source })?;

        Ok(ForklessHandle {
            child,
            timed_out: false,
        })
    }

    async fn poll(
        &self,
        handle: &mut Self::Handle,
        elapsed_secs: u64,
        timeout_secs: Option<u64>,
        _interrupt_to_kill_timeout_secs: u64,
        exit_status: ExitStatusConfig,
    ) -> Result<PollOutcome, ExecError> {
        if let Some(status) = handle.child.try_wait().map_err(ExecError::Io)? {
            let exit_value = status.code();
            let out_status = if handle.timed_out {
                TestStatus::Timeout
            } else {
                match exit_value {
                    Some(0) => TestStatus::Pass,
                    Some(v) if v == exit_status.diff_exit_status => TestStatus::Diff,
                    Some(v) if v == exit_status.skip_exit_status => TestStatus::Skip,
                    Some(_) => TestStatus::Fail,
                    None => TestStatus::NotDone,
                }
            };
            return Ok(PollOutcome::Finished {
                status: out_status,
                exit_value,
            });
        }

        if let Some(timeout) = timeout_secs {
            if elapsed_secs >= timeout && !handle.timed_out {
                tracing::info!("test exceeded timeout, terminating child");
                handle.timed_out = true;
                let _ = handle.child.start_kill();
            }
        }

        Ok(PollOutcome::StillRunning)
    }

    async fn kill(&self, handle: &mut Self::Handle) -> Result<(), ExecError> {
        let _ = handle.child.start_kill();
        Ok(())
    }
}

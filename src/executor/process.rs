//! Unix process-group execution backend.
//!
//! Each test launches in its own process group so a timeout can escalate
//! across the whole subtree rather than only the direct child:
//! `setpgid`/`kill(-pid, sig)` forwarding, SIGINT at timeout, SIGTERM after
//! an `interrupt_to_kill_timeout` grace period.

use std::process::Stdio;

use std::os::unix::process::CommandExt;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::{ExecBackend, PollOutcome};
use crate::childenv::{ChildEnv, ExitStatusConfig};
use crate::error::ExecError;
use crate::model::TestStatus;

/// Number of times to retry a transient fork/exec failure before giving up.
const LAUNCH_RETRY_ATTEMPTS: u32 = 10;

pub struct ProcessHandle {
    child: Child,
    pgid: Pid,
    sent_sigint: bool,
    sent_sigterm: bool,
}

/// Launches each test in its own process group so a timeout can be
/// delivered to the whole subtree, not just the direct child.
#[derive(Debug, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }

    fn signal_group(pgid: Pid, sig: Signal) {
        // Negative pid signals the whole process group (POSIX `kill(2)`).
        let _ = signal::kill(Pid::from_raw(-pgid.as_raw()), sig);
    }
}

#[async_trait]
impl ExecBackend for ProcessBackend {
    type Handle = ProcessHandle;

    async fn launch(&self, env: &ChildEnv, argv: &[String]) -> Result<Self::Handle, ExecError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty argv",
            )));
        };

        let mut last_err = None;
        for attempt in 0..LAUNCH_RETRY_ATTEMPTS {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .current_dir(&env.xdir)
                .envs(env.env_vars())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            unsafe {
                cmd.pre_exec(|| {
                    // New process group, led by the child itself, so a
                    // signal to `-pgid` reaches every descendant it forks.
                    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                    Ok(())
                });
            }

            match cmd.spawn() {
                Ok(child) => {
                    let pgid = Pid::from_raw(child.id().ok_or_else(|| {
                        ExecError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "child exited before pid was available",
                        ))
                    })? as i32);
                    return Ok(ProcessHandle {
                        child,
                        pgid,
                        sent_sigint: false,
                        sent_sigterm: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "fork/exec failed, retrying");
                    last_err = Some(e);
                }
            }
        }

        Err(ExecError::LaunchFailed {
            attempts: LAUNCH_RETRY_ATTEMPTS,
            source: last_err.unwrap(),
        })
    }

    async fn poll(
        &self,
        handle: &mut Self::Handle,
        elapsed_secs: u64,
        timeout_secs: Option<u64>,
        interrupt_to_kill_timeout_secs: u64,
        exit_status: ExitStatusConfig,
    ) -> Result<PollOutcome, ExecError> {
        match handle.child.try_wait().map_err(ExecError::Io)? {
            Some(status) => {
                let exit_value = status.code();
                let out_status = if handle.sent_sigint || handle.sent_sigterm {
                    TestStatus::Timeout
                } else {
                    decode_exit_status(exit_value, exit_status)
                };
                return Ok(PollOutcome::Finished {
                    status: out_status,
                    exit_value,
                });
            }
            None => {}
        }

        if let Some(timeout) = timeout_secs {
            if !handle.sent_sigint && elapsed_secs >= timeout {
                tracing::info!(pgid = handle.pgid.as_raw(), "test exceeded timeout, sending SIGINT");
                Self::signal_group(handle.pgid, Signal::SIGINT);
                handle.sent_sigint = true;
            } else if handle.sent_sigint
                && !handle.sent_sigterm
                && elapsed_secs >= timeout + interrupt_to_kill_timeout_secs
            {
                tracing::warn!(pgid = handle.pgid.as_raw(), "SIGINT grace period elapsed, sending SIGTERM");
                Self::signal_group(handle.pgid, Signal::SIGTERM);
                handle.sent_sigterm = true;
            }
        }

        Ok(PollOutcome::StillRunning)
    }

    async fn kill(&self, handle: &mut Self::Handle) -> Result<(), ExecError> {
        Self::signal_group(handle.pgid, Signal::SIGTERM);
        // Give the group a short window to die from SIGTERM, then escalate.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        if handle.child.try_wait().map_err(ExecError::Io)?.is_none() {
            Self::signal_group(handle.pgid, Signal::SIGKILL);
        }
        Ok(())
    }
}

fn decode_exit_status(exit_value: Option<i32>, exit_status: ExitStatusConfig) -> TestStatus {
    match exit_value {
        Some(0) => TestStatus::Pass,
        Some(v) if v == exit_status.diff_exit_status => TestStatus::Diff,
        Some(v) if v == exit_status.skip_exit_status => TestStatus::Skip,
        Some(_) => TestStatus::Fail,
        None => TestStatus::NotDone,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXIT_STATUS: ExitStatusConfig = ExitStatusConfig {
        diff_exit_status: 64,
        skip_exit_status: 63,
    };

    #[test]
    fn zero_exit_is_pass() {
        assert_eq!(decode_exit_status(Some(0), EXIT_STATUS), TestStatus::Pass);
    }

    #[test]
    fn nonzero_exit_is_fail() {
        assert_eq!(decode_exit_status(Some(1), EXIT_STATUS), TestStatus::Fail);
    }

    #[test]
    fn missing_exit_code_is_notdone() {
        assert_eq!(decode_exit_status(None, EXIT_STATUS), TestStatus::NotDone);
    }

    #[test]
    fn configured_diff_exit_status_maps_to_diff() {
        assert_eq!(decode_exit_status(Some(64), EXIT_STATUS), TestStatus::Diff);
    }

    #[test]
    fn configured_skip_exit_status_maps_to_skip() {
        assert_eq!(decode_exit_status(Some(63), EXIT_STATUS), TestStatus::Skip);
    }
}

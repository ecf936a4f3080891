//! Child process management for one task.
//!
//! The task's shell command runs in its own process group, so killing the
//! group takes the whole subtree down, and the child asks the kernel to
//! deliver SIGKILL should the worker itself die first.

use std::process::ExitStatus;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

/// A spawned task command.
pub struct TaskProcess {
    child: Child,
    pgid: libc::pid_t,
}

impl TaskProcess {
    /// Launch `sh -c <command>` with working directory `.` as its own
    /// process group leader.
    pub fn spawn(command: &str) -> Result<TaskProcess> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(".")
            .process_group(0);

        // The subtree must not outlive the worker.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to launch task command: {command}"))?;
        let pgid = child
            .id()
            .context("spawned task has no pid")? as libc::pid_t;

        Ok(TaskProcess { child, pgid })
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the process to exit fully.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM the whole process group.
    pub fn terminate(&self) {
        let rc = unsafe { libc::killpg(self.pgid, libc::SIGTERM) };
        if rc != 0 {
            // The group may already be gone; nothing else to do.
            tracing::debug!(
                pgid = self.pgid,
                error = %std::io::Error::last_os_error(),
                "killpg failed"
            );
        }
    }
}

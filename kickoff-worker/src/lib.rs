//! Kickoff task worker.
//!
//! Long-running loop: pull a matching task, launch its command, heartbeat
//! the server while it runs, terminate on a remote cancel, and report
//! completion. Between empty pulls the worker backs off with slowly
//! growing sleeps so an idle cluster is nearly silent on the wire.

use std::time::Duration;

use anyhow::Result;
use kickoff_client::TaskClient;
use kickoff_proto::{TaskRunInfo, WORKER_HEARTBEAT_TIMEOUT_SECONDS};

mod child;
mod shutdown;

pub use child::TaskProcess;
pub use shutdown::ShutdownSignal;

/// Heartbeat at least this often while a task runs.
const MIN_SERVER_POLL_MS: u64 = 1000;

/// Ceiling for the idle between-pulls sleep.
const MAX_WAITING_POLL_INTERVAL_MS: u64 = 60 * 1000;

/// Ceiling for the process poll sleep. The upper clamp guarantees at
/// least two server polls per heartbeat-timeout window, so a healthy
/// worker can never be mistaken for a zombie.
const MAX_RUNNING_POLL_INTERVAL_MS: u64 = {
    let raw = MAX_WAITING_POLL_INTERVAL_MS;
    let hi = 1000 * WORKER_HEARTBEAT_TIMEOUT_SECONDS as u64 / 2;
    let clamped = if raw > hi { hi } else { raw };
    if clamped < 100 {
        100
    } else {
        clamped
    }
};

/// Next idle sleep after another empty pull.
fn grow_waiting_interval(current_ms: u64) -> u64 {
    (current_ms + current_ms / 4 + 1).min(MAX_WAITING_POLL_INTERVAL_MS)
}

/// Next process-poll sleep while a task runs.
fn grow_running_interval(current_ms: u64) -> u64 {
    (current_ms + current_ms / 2 + 1).min(MAX_RUNNING_POLL_INTERVAL_MS)
}

/// The worker: owns its connection to the server, the resource tags it
/// advertises, and the shutdown flag.
pub struct TaskWorker {
    server_addr: String,
    have_resources: Vec<String>,
    client: Option<TaskClient>,
    shutdown: ShutdownSignal,
}

impl TaskWorker {
    pub fn new(server_addr: String, have_resources: Vec<String>) -> TaskWorker {
        TaskWorker {
            server_addr,
            have_resources,
            client: None,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle for interrupt handlers to request a graceful stop.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Main loop: pull, execute, repeat until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(tags = ?self.have_resources, server = %self.server_addr, "starting worker");

        let mut poll_ms: u64 = 0;
        while !self.shutdown.is_triggered() {
            match self.take_task().await {
                Some(info) => {
                    poll_ms = 0;
                    self.execute_task(info).await;
                    tracing::info!("requesting next task");
                }
                None => {
                    poll_ms = grow_waiting_interval(poll_ms);
                    tracing::debug!(sleep_ms = poll_ms, "no task available, waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(poll_ms)) => {}
                        _ = self.shutdown.wait() => {}
                    }
                }
            }
        }

        tracing::info!("worker stopped");
        Ok(())
    }

    /// Pull one task. Transport trouble drops the connection so the next
    /// attempt reconnects; the caller just sees "nothing to run".
    async fn take_task(&mut self) -> Option<TaskRunInfo> {
        let tags = self.have_resources.clone();
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "cannot reach task server");
                return None;
            }
        };
        match client.take_task_to_run(&tags).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "lost connection to task server");
                self.client = None;
                None
            }
        }
    }

    /// Run one task to completion: launch, poll, heartbeat, react to
    /// cancel, report finished.
    async fn execute_task(&mut self, info: TaskRunInfo) {
        tracing::info!(task = %info.id, command = %info.command, "starting task");

        let mut process = match TaskProcess::spawn(&info.command) {
            Ok(process) => process,
            Err(e) => {
                // This attempt is over; hand the task back as finished so
                // it does not linger until the zombie reaper.
                tracing::error!(task = %info.id, error = %e, "failed to launch task");
                self.report_finished(info.id).await;
                return;
            }
        };

        let mut poll_ms: u64 = 0;
        let mut slept_since_heartbeat_ms: u64 = 0;
        loop {
            match process.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(task = %info.id, %status, "task exited");
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(task = %info.id, error = %e, "failed to poll task process");
                    break;
                }
            }

            tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            slept_since_heartbeat_ms += poll_ms;
            poll_ms = grow_running_interval(poll_ms);

            if slept_since_heartbeat_ms >= MIN_SERVER_POLL_MS {
                slept_since_heartbeat_ms = 0;
                if self.heartbeat(info.id).await {
                    tracing::warn!(task = %info.id, "task canceled remotely, killing it");
                    process.terminate();
                    break;
                }
            }
        }

        if let Err(e) = process.wait().await {
            tracing::error!(task = %info.id, error = %e, "failed to reap task process");
        }

        self.report_finished(info.id).await;
        tracing::info!(task = %info.id, "finished task");
    }

    /// Heartbeat the server; true means the task was canceled. Transport
    /// failures read as "not canceled"; the server's zombie reaper is the
    /// backstop if the outage persists.
    async fn heartbeat(&mut self, id: kickoff_core::TaskId) -> bool {
        let result = match self.client().await {
            Ok(client) => client.heartbeat_and_check_was_task_canceled(id).await,
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "cannot reach task server for heartbeat");
                return false;
            }
        };
        match result {
            Ok(Some(was_canceled)) => was_canceled,
            Ok(None) => {
                tracing::warn!(task = %id, "server no longer knows this task");
                false
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "heartbeat failed");
                self.client = None;
                false
            }
        }
    }

    async fn report_finished(&mut self, id: kickoff_core::TaskId) {
        let result = match self.client().await {
            Ok(client) => client.mark_task_finished(id).await,
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "cannot reach task server to report completion");
                return;
            }
        };
        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(task = %id, "failed to mark task as finished (already reaped?)");
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "failed to report task completion");
                self.client = None;
            }
        }
    }

    async fn client(&mut self) -> Result<&mut TaskClient, kickoff_client::ClientError> {
        if self.client.is_none() {
            self.client = Some(TaskClient::connect(&self.server_addr).await?);
        }
        Ok(self.client.as_mut().expect("client just connected"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_poll_ceiling_keeps_two_polls_per_timeout_window() {
        assert!(MAX_RUNNING_POLL_INTERVAL_MS >= 100);
        assert!(
            MAX_RUNNING_POLL_INTERVAL_MS <= 1000 * WORKER_HEARTBEAT_TIMEOUT_SECONDS as u64 / 2
        );
    }

    #[test]
    fn waiting_interval_grows_and_saturates() {
        let mut ms = 0;
        let mut last = 0;
        for _ in 0..100 {
            ms = grow_waiting_interval(ms);
            assert!(ms > last || ms == MAX_WAITING_POLL_INTERVAL_MS);
            last = ms;
        }
        assert_eq!(ms, MAX_WAITING_POLL_INTERVAL_MS);
    }

    #[test]
    fn running_interval_grows_and_saturates() {
        let mut ms = 0;
        for _ in 0..100 {
            ms = grow_running_interval(ms);
        }
        assert_eq!(ms, MAX_RUNNING_POLL_INTERVAL_MS);

        // The first few sleeps are short so quick tasks finish promptly.
        assert_eq!(grow_running_interval(0), 1);
        assert_eq!(grow_running_interval(1), 2);
        assert_eq!(grow_running_interval(2), 4);
    }
}

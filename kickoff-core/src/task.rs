//! Task types and the task state machine.

use std::fmt;

use chrono::Utc;
use serde::Serialize;

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a task.
///
/// A 64-bit value sampled uniformly at random by the database, rendered as
/// lower-case hex everywhere a human sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Parse a hex task ID as typed on the command line: up to 16 hex
    /// digits, case-insensitive, no prefix.
    pub fn parse_hex(s: &str) -> Option<TaskId> {
        if s.is_empty() || s.len() > 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(TaskId)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lifecycle state of a task, derived from its status and never stored.
///
/// There is no terminal variant: finished tasks are deleted from the
/// database rather than kept around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No worker has claimed the task yet.
    Pending,
    /// A worker claimed the task and is heartbeating it.
    Running,
    /// The task was marked for cancellation; its worker will learn via the
    /// next heartbeat reply and then report it finished.
    Canceling,
}

impl TaskState {
    pub fn as_u8(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Canceling => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<TaskState> {
        match value {
            0 => Some(TaskState::Pending),
            1 => Some(TaskState::Running),
            2 => Some(TaskState::Canceling),
            _ => None,
        }
    }

    /// All states a live task can be in.
    pub fn all() -> [TaskState; 3] {
        [TaskState::Pending, TaskState::Running, TaskState::Canceling]
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Canceling => "Canceling",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Schedule and Status
// ============================================================================

/// Where a task may run.
///
/// A worker must possess every tag in `required_resources` to be eligible.
/// `optional_resources` ("want" tags) are carried and reported back but do
/// not influence matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskSchedule {
    pub required_resources: Vec<String>,
    pub optional_resources: Vec<String>,
}

/// Runtime information present from the moment a worker claims a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskRunStatus {
    /// Marked for cancellation. Does not mean the task has stopped yet.
    pub was_canceled: bool,
    /// When the task was claimed (wall-clock seconds).
    pub start_time: i64,
    /// Last proof-of-life from the owning worker (wall-clock seconds).
    pub heartbeat_time: i64,
}

/// Full status of a task: creation time plus run status once claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub create_time: i64,
    /// Absent while the task is pending.
    pub run_status: Option<TaskRunStatus>,
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        match self.run_status {
            Some(run) if run.was_canceled => TaskState::Canceling,
            Some(_) => TaskState::Running,
            None => TaskState::Pending,
        }
    }
}

/// Everything needed to enqueue a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCreateInfo {
    /// The shell command line the worker will execute verbatim.
    pub command: String,
    pub schedule: TaskSchedule,
}

// ============================================================================
// Task
// ============================================================================

/// One row of the task database.
///
/// The database owns the authoritative copy; everything handed to callers
/// is a value snapshot of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub command: String,
    pub schedule: TaskSchedule,
    pub status: TaskStatus,
}

impl Task {
    pub(crate) fn new(id: TaskId, info: TaskCreateInfo) -> Task {
        Task {
            id,
            command: info.command,
            schedule: info.schedule,
            status: TaskStatus {
                create_time: Utc::now().timestamp(),
                run_status: None,
            },
        }
    }

    pub fn state(&self) -> TaskState {
        self.status.state()
    }

    /// Materialize the run status. Claiming an already-claimed task is a
    /// logic error upstream and leaves the existing status alone.
    pub(crate) fn mark_started(&mut self) {
        if self.status.run_status.is_none() {
            let now = Utc::now().timestamp();
            self.status.run_status = Some(TaskRunStatus {
                was_canceled: false,
                start_time: now,
                heartbeat_time: now,
            });
        }
    }

    /// Flag the task for cancellation. Returns false while still pending.
    pub(crate) fn mark_should_cancel(&mut self) -> bool {
        match self.status.run_status.as_mut() {
            Some(run) => {
                run.was_canceled = true;
                true
            }
            None => false,
        }
    }

    /// Bump the heartbeat timestamp. Ignored while still pending.
    pub(crate) fn heartbeat(&mut self) {
        if let Some(run) = self.status.run_status.as_mut() {
            run.heartbeat_time = Utc::now().timestamp();
        }
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Counters the database maintains across all mutations.
///
/// The first three partition the live tasks; `num_finished` only ever
/// grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub num_pending: i32,
    pub num_running: i32,
    pub num_canceling: i32,
    pub num_finished: i32,
}

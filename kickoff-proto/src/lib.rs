//! Kickoff wire protocol.
//!
//! One length-prefixed binary protocol couples client, server, and
//! worker: a request frame carries a single tag byte plus a
//! request-specific payload, and every request gets exactly one reply
//! frame whose first byte classifies the outcome.

mod blob;
mod framing;
mod message;

pub use blob::{BlobReader, BlobWriter, WireError, WireResult};
pub use framing::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use message::{TaskBriefInfo, TaskReplyType, TaskRequestType, TaskRunInfo, WireMessage};

/// Port the server binds when none is given.
pub const DEFAULT_TASK_SERVER_PORT: u16 = 3355;

/// `GetTasksByStates` is a debugging aid, refused outright once the
/// database holds more tasks than this.
pub const MAX_STATUS_TASKS: usize = 100;

/// Minimum seconds between the server's periodic stats log lines.
pub const SERVER_STATS_MIN_INTERVAL_SECONDS: u64 = 10;

/// A running task whose worker has been silent this long is considered
/// orphaned and reaped. Workers heartbeat far more often than this, so
/// only a dead worker (killed process, lost machine) trips it.
pub const WORKER_HEARTBEAT_TIMEOUT_SECONDS: i64 = 60 * 5;

/// Seconds between zombie-reaping sweeps.
pub const SERVER_TASK_CLEANUP_INTERVAL_SECONDS: u64 = 60;

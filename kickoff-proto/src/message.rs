//! Protocol messages and their exact wire layout.
//!
//! Field order is part of the protocol and must not change. The request
//! and reply enums carry bit-exact byte values; an out-of-range byte is a
//! decode failure, which the server answers with `BadRequest`.

use kickoff_core::{
    TaskCreateInfo, TaskId, TaskRunStatus, TaskSchedule, TaskState, TaskStats, TaskStatus,
};
use serde::Serialize;

use crate::blob::{BlobReader, BlobWriter, WireError, WireResult};

// ============================================================================
// Request / Reply Tags
// ============================================================================

/// First byte of every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRequestType {
    GetCommand = 0,
    GetSchedule = 1,
    GetStatus = 2,
    GetStats = 3,
    GetTasksByStates = 4,
    Create = 5,
    TakeToRun = 6,
    HeartbeatAndCheckWasTaskCanceled = 7,
    MarkFinished = 8,
    MarkShouldCancel = 9,
}

impl TaskRequestType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<TaskRequestType> {
        use TaskRequestType::*;
        match value {
            0 => Some(GetCommand),
            1 => Some(GetSchedule),
            2 => Some(GetStatus),
            3 => Some(GetStats),
            4 => Some(GetTasksByStates),
            5 => Some(Create),
            6 => Some(TakeToRun),
            7 => Some(HeartbeatAndCheckWasTaskCanceled),
            8 => Some(MarkFinished),
            9 => Some(MarkShouldCancel),
            _ => None,
        }
    }
}

/// First byte of every reply frame.
///
/// `Failed` means the request was well-formed but the database had no
/// answer (no such task, nothing to dequeue); `BadRequest` means the frame
/// itself was malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskReplyType {
    BadRequest = 0,
    Success = 1,
    Failed = 2,
}

impl TaskReplyType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<TaskReplyType> {
        match value {
            0 => Some(TaskReplyType::BadRequest),
            1 => Some(TaskReplyType::Success),
            2 => Some(TaskReplyType::Failed),
            _ => None,
        }
    }
}

// ============================================================================
// Wire Encoding
// ============================================================================

/// A value with a fixed position-dependent wire layout.
pub trait WireMessage: Sized {
    fn encode(&self, writer: &mut BlobWriter);
    fn decode(reader: &mut BlobReader<'_>) -> WireResult<Self>;
}

impl WireMessage for TaskId {
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_u64(self.as_u64());
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskId> {
        Ok(TaskId(reader.get_u64()?))
    }
}

impl WireMessage for TaskState {
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_u8(self.as_u8());
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskState> {
        let byte = reader.get_u8()?;
        TaskState::from_u8(byte).ok_or(WireError::InvalidByte(byte))
    }
}

impl WireMessage for TaskSchedule {
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_string_list(&self.required_resources);
        writer.put_string_list(&self.optional_resources);
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskSchedule> {
        Ok(TaskSchedule {
            required_resources: reader.get_string_list()?,
            optional_resources: reader.get_string_list()?,
        })
    }
}

impl WireMessage for TaskRunStatus {
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_bool(self.was_canceled);
        writer.put_i64(self.start_time);
        writer.put_i64(self.heartbeat_time);
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskRunStatus> {
        Ok(TaskRunStatus {
            was_canceled: reader.get_bool()?,
            start_time: reader.get_i64()?,
            heartbeat_time: reader.get_i64()?,
        })
    }
}

impl WireMessage for TaskStatus {
    /// `create_time`, then the run status as an explicit presence flag
    /// followed by the payload when present.
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_i64(self.create_time);
        match &self.run_status {
            Some(run) => {
                writer.put_bool(true);
                run.encode(writer);
            }
            None => writer.put_bool(false),
        }
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskStatus> {
        let create_time = reader.get_i64()?;
        let run_status = if reader.get_bool()? {
            Some(TaskRunStatus::decode(reader)?)
        } else {
            None
        };
        Ok(TaskStatus {
            create_time,
            run_status,
        })
    }
}

impl WireMessage for TaskCreateInfo {
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_string(&self.command);
        self.schedule.encode(writer);
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskCreateInfo> {
        Ok(TaskCreateInfo {
            command: reader.get_string()?,
            schedule: TaskSchedule::decode(reader)?,
        })
    }
}

impl WireMessage for TaskStats {
    fn encode(&self, writer: &mut BlobWriter) {
        writer.put_i32(self.num_pending);
        writer.put_i32(self.num_running);
        writer.put_i32(self.num_canceling);
        writer.put_i32(self.num_finished);
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskStats> {
        Ok(TaskStats {
            num_pending: reader.get_i32()?,
            num_running: reader.get_i32()?,
            num_canceling: reader.get_i32()?,
            num_finished: reader.get_i32()?,
        })
    }
}

// ============================================================================
// Composite Replies
// ============================================================================

/// One row of a `GetTasksByStates` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskBriefInfo {
    pub id: TaskId,
    pub status: TaskStatus,
}

impl WireMessage for TaskBriefInfo {
    fn encode(&self, writer: &mut BlobWriter) {
        self.id.encode(writer);
        self.status.encode(writer);
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskBriefInfo> {
        Ok(TaskBriefInfo {
            id: TaskId::decode(reader)?,
            status: TaskStatus::decode(reader)?,
        })
    }
}

/// Successful `TakeToRun` reply: everything a worker needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunInfo {
    pub id: TaskId,
    pub command: String,
}

impl WireMessage for TaskRunInfo {
    fn encode(&self, writer: &mut BlobWriter) {
        self.id.encode(writer);
        writer.put_string(&self.command);
    }

    fn decode(reader: &mut BlobReader<'_>) -> WireResult<TaskRunInfo> {
        Ok(TaskRunInfo {
            id: TaskId::decode(reader)?,
            command: reader.get_string()?,
        })
    }
}

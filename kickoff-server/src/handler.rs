//! Request dispatch: decode one request frame, mutate the database,
//! encode one reply frame.
//!
//! Every reply starts with a `TaskReplyType` byte. Malformed input of any
//! shape (unknown tag, short read, negative blob length, trailing bytes
//! on a payload-less request) becomes `BadRequest`; a well-formed request
//! the database cannot answer becomes `Failed`. Nothing in here panics on
//! wire input.

use bytes::Bytes;
use kickoff_core::{TaskCreateInfo, TaskDatabase, TaskId, TaskState, TaskStats};
use kickoff_proto::{
    BlobReader, BlobWriter, TaskBriefInfo, TaskReplyType, TaskRequestType, TaskRunInfo,
    WireResult, WireMessage, MAX_STATUS_TASKS,
};

/// Per-reply-type request counters, alongside the database stats the
/// other half of the server's observable state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub succeeded_requests: u64,
    pub failed_requests: u64,
    pub bad_requests: u64,
}

/// All state the request loop mutates: the task database plus request
/// counters. Exactly one request touches this at a time.
#[derive(Debug, Default)]
pub struct ServerState {
    pub db: TaskDatabase,
    pub stats: ServerStats,
}

impl ServerState {
    pub fn new() -> ServerState {
        ServerState::default()
    }

    /// Produce the reply frame for one request frame, counting the
    /// outcome.
    pub fn handle_request(&mut self, request: &[u8]) -> Bytes {
        let reply = match self.generate_reply(request) {
            Ok(reply) => reply,
            // Any decode failure bubbling up means a malformed request.
            Err(_) => bad_request(),
        };

        match reply.as_slice().first().copied() {
            Some(byte) if byte == TaskReplyType::Success.as_u8() => {
                self.stats.succeeded_requests += 1
            }
            Some(byte) if byte == TaskReplyType::Failed.as_u8() => self.stats.failed_requests += 1,
            _ => self.stats.bad_requests += 1,
        }

        reply.into_bytes()
    }

    fn generate_reply(&mut self, request: &[u8]) -> WireResult<BlobWriter> {
        let mut reader = BlobReader::new(request);

        let Ok(tag) = reader.get_u8() else {
            return Ok(bad_request());
        };
        let Some(request_type) = TaskRequestType::from_u8(tag) else {
            tracing::debug!(tag, "request with unknown tag byte");
            return Ok(bad_request());
        };

        match request_type {
            TaskRequestType::GetCommand => {
                let id = TaskId::decode(&mut reader)?;
                Ok(match self.db.get_task(id) {
                    Some(task) => success(|reply| reply.put_string(&task.command)),
                    None => failed(),
                })
            }

            TaskRequestType::GetSchedule => {
                let id = TaskId::decode(&mut reader)?;
                Ok(match self.db.get_task(id) {
                    Some(task) => success(|reply| task.schedule.encode(reply)),
                    None => failed(),
                })
            }

            TaskRequestType::GetStatus => {
                let id = TaskId::decode(&mut reader)?;
                Ok(match self.db.get_task(id) {
                    Some(task) => success(|reply| task.status.encode(reply)),
                    None => failed(),
                })
            }

            TaskRequestType::GetStats => {
                // Carries no payload; trailing bytes mean a confused peer.
                if reader.has_more() {
                    return Ok(bad_request());
                }
                let stats: TaskStats = self.db.stats();
                Ok(success(|reply| stats.encode(reply)))
            }

            TaskRequestType::GetTasksByStates => {
                if self.db.total_task_count() > MAX_STATUS_TASKS {
                    return Ok(failed());
                }

                let mut states: Vec<TaskState> = Vec::new();
                while reader.has_more() {
                    states.push(TaskState::decode(&mut reader)?);
                }

                let tasks = self.db.get_tasks_by_states(&states);
                Ok(success(|reply| {
                    for task in &tasks {
                        TaskBriefInfo {
                            id: task.id,
                            status: task.status,
                        }
                        .encode(reply);
                    }
                }))
            }

            TaskRequestType::Create => {
                let info = TaskCreateInfo::decode(&mut reader)?;
                match self.db.create_task(info) {
                    Ok(task) => {
                        tracing::info!(task = %task.id, command = %task.command, "task created");
                        Ok(success(|reply| task.id.encode(reply)))
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "task creation failed");
                        Ok(failed())
                    }
                }
            }

            TaskRequestType::TakeToRun => {
                let mut have_resources: Vec<String> = Vec::new();
                while reader.has_more() {
                    have_resources.push(reader.get_string()?);
                }

                match self.db.take_task_to_run(&have_resources) {
                    Some(task) => {
                        tracing::info!(task = %task.id, "task claimed by worker");
                        let info = TaskRunInfo {
                            id: task.id,
                            command: task.command,
                        };
                        Ok(success(|reply| info.encode(reply)))
                    }
                    None => Ok(failed()),
                }
            }

            TaskRequestType::HeartbeatAndCheckWasTaskCanceled => {
                let id = TaskId::decode(&mut reader)?;
                Ok(match self.db.heartbeat_task(id) {
                    Ok(was_canceled) => success(|reply| reply.put_bool(was_canceled)),
                    Err(_) => failed(),
                })
            }

            TaskRequestType::MarkFinished => {
                let id = TaskId::decode(&mut reader)?;
                Ok(match self.db.mark_task_finished(id) {
                    Ok(()) => {
                        tracing::info!(task = %id, "task finished");
                        success(|_| {})
                    }
                    Err(_) => failed(),
                })
            }

            TaskRequestType::MarkShouldCancel => {
                let id = TaskId::decode(&mut reader)?;
                Ok(match self.db.mark_task_should_cancel(id) {
                    Ok(()) => {
                        tracing::info!(task = %id, "task marked for cancellation");
                        success(|_| {})
                    }
                    Err(e) => {
                        tracing::debug!(task = %id, error = %e, "cancellation refused");
                        failed()
                    }
                })
            }
        }
    }
}

fn bad_request() -> BlobWriter {
    let mut reply = BlobWriter::new();
    reply.put_u8(TaskReplyType::BadRequest.as_u8());
    reply
}

fn failed() -> BlobWriter {
    let mut reply = BlobWriter::new();
    reply.put_u8(TaskReplyType::Failed.as_u8());
    reply
}

fn success(fill: impl FnOnce(&mut BlobWriter)) -> BlobWriter {
    let mut reply = BlobWriter::new();
    reply.put_u8(TaskReplyType::Success.as_u8());
    fill(&mut reply);
    reply
}

//! RPC client for the kickoff task server.
//!
//! One method per request kind, each sending a single request frame and
//! blocking for the single reply frame. The socket demands strict
//! send/recv alternation, which the `&mut self` receivers enforce at
//! compile time; callers that want concurrency must serialize externally.

use kickoff_core::{TaskCreateInfo, TaskId, TaskSchedule, TaskState, TaskStats, TaskStatus};
use kickoff_proto::{
    read_frame, write_frame, BlobReader, BlobWriter, TaskBriefInfo, TaskReplyType,
    TaskRequestType, TaskRunInfo, WireError, WireMessage,
};
use tokio::net::TcpStream;

/// Transport-level or protocol-level client failure.
///
/// A server-side `Failed` reply is *not* an error; getter methods report
/// it as `Ok(None)` and the void methods as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to task server at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o error talking to task server: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by task server")]
    ConnectionClosed,
    #[error("malformed reply from task server: {0}")]
    MalformedReply(#[from] WireError),
    #[error("task server rejected the request as malformed")]
    BadRequest,
}

/// Client handle owning one connection to the task server.
pub struct TaskClient {
    stream: TcpStream,
}

impl TaskClient {
    /// Connect to `host:port`.
    pub async fn connect(addr: &str) -> Result<TaskClient, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        tracing::debug!(%addr, "connected to task server");
        Ok(TaskClient { stream })
    }

    /// The shell command line of a task.
    pub async fn get_task_command(&mut self, id: TaskId) -> Result<Option<String>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::GetCommand.as_u8());
        id.encode(&mut request);

        self.request_optional(request, |reader| reader.get_string())
            .await
    }

    pub async fn get_task_schedule(
        &mut self,
        id: TaskId,
    ) -> Result<Option<TaskSchedule>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::GetSchedule.as_u8());
        id.encode(&mut request);

        self.request_optional(request, |reader| TaskSchedule::decode(reader))
            .await
    }

    pub async fn get_task_status(&mut self, id: TaskId) -> Result<Option<TaskStatus>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::GetStatus.as_u8());
        id.encode(&mut request);

        self.request_optional(request, |reader| TaskStatus::decode(reader))
            .await
    }

    pub async fn get_stats(&mut self) -> Result<Option<TaskStats>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::GetStats.as_u8());

        self.request_optional(request, |reader| TaskStats::decode(reader))
            .await
    }

    /// Proof-of-life for a claimed task. `Some(true)` tells the worker to
    /// terminate the task's process.
    pub async fn heartbeat_and_check_was_task_canceled(
        &mut self,
        id: TaskId,
    ) -> Result<Option<bool>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::HeartbeatAndCheckWasTaskCanceled.as_u8());
        id.encode(&mut request);

        self.request_optional(request, |reader| reader.get_bool())
            .await
    }

    /// Brief info for every task in one of `states`. The server refuses
    /// this above [`kickoff_proto::MAX_STATUS_TASKS`] live tasks.
    pub async fn get_tasks_by_states(
        &mut self,
        states: &[TaskState],
    ) -> Result<Option<Vec<TaskBriefInfo>>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::GetTasksByStates.as_u8());
        for state in states {
            state.encode(&mut request);
        }

        self.request_optional(request, |reader| {
            let mut infos = Vec::new();
            while reader.has_more() {
                infos.push(TaskBriefInfo::decode(reader)?);
            }
            Ok(infos)
        })
        .await
    }

    /// Enqueue a task; returns its freshly allocated ID.
    pub async fn create_task(
        &mut self,
        info: &TaskCreateInfo,
    ) -> Result<Option<TaskId>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::Create.as_u8());
        info.encode(&mut request);

        self.request_optional(request, |reader| TaskId::decode(reader))
            .await
    }

    /// Claim a pending task matching `have_resources`. `Ok(None)` simply
    /// means nothing matched right now.
    pub async fn take_task_to_run(
        &mut self,
        have_resources: &[String],
    ) -> Result<Option<TaskRunInfo>, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::TakeToRun.as_u8());
        for tag in have_resources {
            request.put_string(tag);
        }

        self.request_optional(request, |reader| TaskRunInfo::decode(reader))
            .await
    }

    /// Report a claimed task done, canceled or not. `Ok(false)` means the
    /// server no longer knows the task (e.g. it was reaped as a zombie).
    pub async fn mark_task_finished(&mut self, id: TaskId) -> Result<bool, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::MarkFinished.as_u8());
        id.encode(&mut request);

        self.request_void(request).await
    }

    /// Ask for a running task's cancellation. Pending tasks cannot be
    /// canceled; that case also comes back as `Ok(false)`.
    pub async fn mark_task_should_cancel(&mut self, id: TaskId) -> Result<bool, ClientError> {
        let mut request = BlobWriter::new();
        request.put_u8(TaskRequestType::MarkShouldCancel.as_u8());
        id.encode(&mut request);

        self.request_void(request).await
    }

    async fn round_trip(&mut self, request: BlobWriter) -> Result<bytes::Bytes, ClientError> {
        write_frame(&mut self.stream, request.as_slice()).await?;
        read_frame(&mut self.stream)
            .await?
            .ok_or(ClientError::ConnectionClosed)
    }

    /// Send, receive, and parse a reply that carries a payload on
    /// `Success`.
    async fn request_optional<T>(
        &mut self,
        request: BlobWriter,
        parse: impl FnOnce(&mut BlobReader<'_>) -> Result<T, WireError>,
    ) -> Result<Option<T>, ClientError> {
        let reply = self.round_trip(request).await?;
        let mut reader = BlobReader::new(&reply);
        match self.reply_type(&mut reader)? {
            TaskReplyType::Success => Ok(Some(parse(&mut reader)?)),
            TaskReplyType::Failed => Ok(None),
            TaskReplyType::BadRequest => Err(ClientError::BadRequest),
        }
    }

    async fn request_void(&mut self, request: BlobWriter) -> Result<bool, ClientError> {
        let reply = self.round_trip(request).await?;
        let mut reader = BlobReader::new(&reply);
        match self.reply_type(&mut reader)? {
            TaskReplyType::Success => Ok(true),
            TaskReplyType::Failed => Ok(false),
            TaskReplyType::BadRequest => Err(ClientError::BadRequest),
        }
    }

    fn reply_type(&self, reader: &mut BlobReader<'_>) -> Result<TaskReplyType, ClientError> {
        let byte = reader.get_u8()?;
        TaskReplyType::from_u8(byte)
            .ok_or(ClientError::MalformedReply(WireError::InvalidByte(byte)))
    }
}

//! Error types for stream task execution
//!
//! One taxonomy covers setup failures, cooperative cancellation, pipeline
//! failures and API misuse. Nothing here is fatal to the process: every
//! failure path ends with the task reaching `DONE` with a status the session
//! can inspect.

use crate::protocol::StreamId;
use crate::task::TaskState;
use std::io;
use thiserror::Error;

/// Main error type for task, adapter and session operations
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task setup failed for stream {stream_id}: {message}")]
    Setup { stream_id: StreamId, message: String },

    #[error("Stream {stream_id} was aborted")]
    Cancelled { stream_id: StreamId },

    #[error("Pipeline failed on stream {stream_id}: {message}")]
    Pipeline { stream_id: StreamId, message: String },

    #[error("No data available on stream {stream_id}")]
    WouldBlock { stream_id: StreamId },

    #[error("Timed out waiting on stream {stream_id}")]
    Timeout { stream_id: StreamId },

    #[error("Queue for stream {stream_id} is closed")]
    QueueClosed { stream_id: StreamId },

    #[error("Response for stream {stream_id} was already set")]
    ResponseAlreadySet { stream_id: StreamId },

    #[error("Stream {stream_id} has no response yet")]
    MissingResponse { stream_id: StreamId },

    #[error("Output for stream {stream_id} is already closed")]
    OutputClosed { stream_id: StreamId },

    #[error("Task for stream {stream_id} cannot execute in state {state:?}")]
    AlreadyExecuted { stream_id: StreamId, state: TaskState },

    #[error("Task for stream {stream_id} is busy in state {state:?}")]
    TaskBusy { stream_id: StreamId, state: TaskState },

    #[error("Stream {stream_id} already has a task")]
    StreamExists { stream_id: StreamId },

    #[error("Unknown stream {stream_id}")]
    UnknownStream { stream_id: StreamId },

    #[error("Readiness of stream {stream_id} was already observed")]
    ReadinessTaken { stream_id: StreamId },

    #[error("Worker for stream {stream_id} failed: {message}")]
    Worker { stream_id: StreamId, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TaskError {
    /// Create setup error
    pub fn setup<S: Into<String>>(stream_id: StreamId, message: S) -> Self {
        Self::Setup {
            stream_id,
            message: message.into(),
        }
    }

    /// Create pipeline error
    pub fn pipeline<S: Into<String>>(stream_id: StreamId, message: S) -> Self {
        Self::Pipeline {
            stream_id,
            message: message.into(),
        }
    }

    /// Create worker error
    pub fn worker<S: Into<String>>(stream_id: StreamId, message: S) -> Self {
        Self::Worker {
            stream_id,
            message: message.into(),
        }
    }

    /// True for the distinguished cancellation condition raised after `abort`
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }

    /// True for programming errors: double operations, use after close,
    /// destroying a busy task
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            TaskError::ResponseAlreadySet { .. }
                | TaskError::MissingResponse { .. }
                | TaskError::OutputClosed { .. }
                | TaskError::AlreadyExecuted { .. }
                | TaskError::TaskBusy { .. }
                | TaskError::StreamExists { .. }
                | TaskError::ReadinessTaken { .. }
        )
    }

    /// Recover a `TaskError` carried inside an `io::Error` produced by the
    /// adapters' `Read`/`Write` impls. Other I/O failures become pipeline
    /// errors for the given stream.
    pub fn from_io(stream_id: StreamId, err: io::Error) -> Self {
        let kind = err.kind();
        match err.into_inner() {
            Some(inner) => match inner.downcast::<TaskError>() {
                Ok(task_error) => *task_error,
                Err(other) => Self::pipeline(stream_id, other.to_string()),
            },
            None => match kind {
                io::ErrorKind::ConnectionAborted => Self::Cancelled { stream_id },
                io::ErrorKind::TimedOut => Self::Timeout { stream_id },
                io::ErrorKind::WouldBlock => Self::WouldBlock { stream_id },
                kind => Self::pipeline(stream_id, kind.to_string()),
            },
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            TaskError::Cancelled { .. } => io::ErrorKind::ConnectionAborted,
            TaskError::WouldBlock { .. } => io::ErrorKind::WouldBlock,
            TaskError::Timeout { .. } => io::ErrorKind::TimedOut,
            TaskError::QueueClosed { .. } | TaskError::OutputClosed { .. } => {
                io::ErrorKind::BrokenPipe
            }
            TaskError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<TaskError> for io::Error {
    fn from(err: TaskError) -> Self {
        let kind = err.io_kind();
        io::Error::new(kind, err)
    }
}

/// Result type for task operations
pub type TaskResult<T> = Result<T, TaskError>;

//! Task state machine and completion status

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a task
///
/// Transitions are monotonic: `Idle -> Started -> Ready -> Done`, with
/// `Started -> Done` when no response was produced and `Idle -> Done` when
/// the task was aborted before it ever ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TaskState {
    Idle = 0,
    Started = 1,
    Ready = 2,
    Done = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Idle,
            1 => TaskState::Started,
            2 => TaskState::Ready,
            _ => TaskState::Done,
        }
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Idle, TaskState::Started)
                | (TaskState::Idle, TaskState::Done)
                | (TaskState::Started, TaskState::Ready)
                | (TaskState::Started, TaskState::Done)
                | (TaskState::Ready, TaskState::Done)
        )
    }
}

/// State cell shared between the session thread and the worker
#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(TaskState::Idle as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if that is a legal edge from the current state.
    ///
    /// Returns the previous state, or the current state on rejection.
    pub(crate) fn advance(&self, next: TaskState) -> Result<TaskState, TaskState> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                TaskState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next as u8)
            })
            .map(TaskState::from_u8)
            .map_err(TaskState::from_u8)
    }
}

/// How a task's execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskStatus {
    /// The pipeline produced a complete response
    Completed,
    /// Execution was cut short by `abort`
    Aborted,
    /// The pipeline failed or ended without a complete response
    Failed { reason: String },
}

impl TaskStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskStatus::Aborted)
    }
}

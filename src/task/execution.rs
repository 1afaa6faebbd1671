//! The unit of work binding one stream to one synthetic request
//!
//! Ownership is fixed by type. A `Task` is owned by exactly one party: the
//! creator hands it to a worker for `execute` and takes it back to
//! `destroy` it. `Task::into_auto_destroy` turns it into an
//! `AutoDestroyTask` that frees itself after running; the creator then keeps
//! only a `TaskHandle`. Neither type can be destroyed twice.

use crate::error::{TaskError, TaskResult};
use crate::hooks;
use crate::observability::metrics::metrics;
use crate::protocol::{InboundItem, OutboundItem, StreamId};
use crate::queue::BucketQueue;
use crate::task::connection::MasterConnection;
use crate::task::context::RequestContext;
use crate::task::handle::{ReadyEvent, TaskCore, TaskHandle};
use crate::task::input::TaskInput;
use crate::task::output::TaskOutput;
use crate::task::state::{TaskState, TaskStatus};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub struct Task {
    core: Arc<TaskCore>,
    connection: MasterConnection,
    context: RequestContext,
    input: TaskInput,
    output: TaskOutput,
}

impl Task {
    /// Create a task for `stream_id` reading from `input` and writing to
    /// `output`.
    ///
    /// Fails with a setup error when the task hooks were never initialised
    /// or a queue belongs to a different connection.
    pub fn create(
        stream_id: StreamId,
        connection: &MasterConnection,
        input: Arc<BucketQueue<InboundItem>>,
        output: Arc<BucketQueue<OutboundItem>>,
    ) -> TaskResult<Self> {
        let hooks = hooks::hooks().ok_or_else(|| {
            TaskError::setup(
                stream_id,
                "task hooks are not initialized, call hooks::init_hooks() at startup",
            )
        })?;
        if input.connection_id() != connection.id() {
            return Err(TaskError::setup(
                stream_id,
                format!(
                    "input queue belongs to connection {}, not {}",
                    input.connection_id(),
                    connection.id()
                ),
            ));
        }
        if output.connection_id() != connection.id() {
            return Err(TaskError::setup(
                stream_id,
                format!(
                    "output queue belongs to connection {}, not {}",
                    output.connection_id(),
                    connection.id()
                ),
            ));
        }

        let core = Arc::new(TaskCore::new(
            stream_id,
            connection.id(),
            input.clone(),
            output.clone(),
        ));

        let mut context = RequestContext::new(stream_id, connection.id());
        hooks.run_pre_connection(&mut context, &connection.config().filters);

        let settings = &connection.config().task;
        let input = TaskInput::new(
            input,
            core.clone(),
            settings.poll_interval(),
            settings.read_timeout(),
        );
        let output = TaskOutput::new(
            output,
            core.clone(),
            settings.poll_interval(),
            settings.write_timeout(),
        );

        metrics().task_created();
        debug!(
            stream_id = stream_id,
            connection_id = %connection.id(),
            restricted_filters = context.is_restricted(),
            "Task created"
        );

        Ok(Self {
            core,
            connection: connection.clone(),
            context,
            input,
            output,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.core.stream_id()
    }

    /// Observer/abort handle usable from other threads
    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(self.core.clone())
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.core.is_aborted()
    }

    pub fn is_busy(&self) -> bool {
        self.core.state() == TaskState::Started
    }

    pub fn is_done(&self) -> bool {
        self.core.state() == TaskState::Done
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Register the readiness callback. Registering before dispatch
    /// guarantees delivery; see [`TaskHandle::set_ready_callback`].
    pub fn set_ready_callback<F>(&mut self, callback: F) -> bool
    where
        F: FnOnce(&ReadyEvent) + Send + 'static,
    {
        self.core.set_ready_callback(Box::new(callback))
    }

    /// Readiness as a one-shot channel; see [`TaskHandle::ready_signal`]
    pub fn ready_signal(&mut self) -> Option<oneshot::Receiver<ReadyEvent>> {
        self.core.ready_signal()
    }

    /// Switch to auto-destroy ownership. Consumes the task, so it can only
    /// happen before dispatch.
    pub fn into_auto_destroy(self) -> AutoDestroyTask {
        AutoDestroyTask { task: self }
    }

    /// Run the processing pipeline on the calling thread until it finishes.
    ///
    /// Drives IDLE -> STARTED -> (READY ->) DONE and fires readiness exactly
    /// once: when the response is set, or at DONE if it never was. A task
    /// aborted before this call goes straight to DONE without running the
    /// pipeline. Pipeline failures and panics end in `TaskStatus::Failed`;
    /// only a second `execute` returns `Err`.
    pub fn execute(&mut self) -> TaskResult<TaskStatus> {
        let stream_id = self.stream_id();
        let span = crate::task_span!(stream_id = stream_id, connection_id = %self.connection.id());
        let _enter = span.enter();

        let state = self.core.state();
        if state != TaskState::Idle {
            let err = TaskError::AlreadyExecuted { stream_id, state };
            error!(error = %err, "Task executed twice");
            return Err(err);
        }

        if self.core.is_aborted() {
            info!("Task aborted before start, pipeline skipped");
            self.output.reset("aborted before start");
            return Ok(self.core.finish(TaskStatus::Aborted));
        }

        self.core.start()?;
        let started = Instant::now();

        let pipeline = self.connection.pipeline().clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            pipeline.process(&mut self.context, &mut self.input, &mut self.output)
        }));

        let status = match outcome {
            Ok(Ok(())) => self.complete_output(),
            Ok(Err(e)) if e.is_cancellation() || self.core.is_aborted() => {
                debug!(error = %e, "Pipeline unwound after abort");
                TaskStatus::Aborted
            }
            Ok(Err(e)) => {
                warn!(pipeline = pipeline.name(), error = %e, "Pipeline failed");
                TaskStatus::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                error!(pipeline = pipeline.name(), "Pipeline panicked");
                TaskStatus::Failed {
                    reason: "pipeline panicked".to_string(),
                }
            }
        };

        match &status {
            TaskStatus::Completed => {}
            TaskStatus::Aborted => self.output.reset("aborted"),
            TaskStatus::Failed { reason } => self.output.reset(reason),
        }

        metrics().task_execution_time(started.elapsed());
        Ok(self.core.finish(status))
    }

    /// Close output the pipeline left open after returning normally
    fn complete_output(&mut self) -> TaskStatus {
        if self.output.is_closed() {
            return TaskStatus::Completed;
        }
        if !self.output.has_response() {
            return TaskStatus::Failed {
                reason: "pipeline finished without a response".to_string(),
            };
        }
        match self.output.close(None) {
            Ok(()) => TaskStatus::Completed,
            Err(e) if e.is_cancellation() => TaskStatus::Aborted,
            Err(e) => TaskStatus::Failed {
                reason: e.to_string(),
            },
        }
    }

    /// Release the task. A task still inside `execute` (STARTED or READY) is
    /// refused and handed back in the error.
    pub fn destroy(self) -> Result<(), DestroyError> {
        if self.core.is_running() {
            let state = self.core.state();
            error!(
                stream_id = self.stream_id(),
                state = ?state,
                "Refusing to destroy a busy task"
            );
            return Err(DestroyError {
                task: Box::new(self),
                state,
            });
        }
        debug!(
            stream_id = self.stream_id(),
            state = ?self.core.state(),
            "Task destroyed"
        );
        drop(self);
        Ok(())
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.core.mark_destroyed();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("stream_id", &self.core.stream_id())
            .field("state", &self.core.state())
            .field("aborted", &self.core.is_aborted())
            .field("connection", &self.connection)
            .finish()
    }
}

/// A refused `Task::destroy`; the task is handed back untouched
pub struct DestroyError {
    task: Box<Task>,
    state: TaskState,
}

impl DestroyError {
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn into_task(self) -> Task {
        *self.task
    }
}

impl From<DestroyError> for TaskError {
    fn from(err: DestroyError) -> Self {
        TaskError::TaskBusy {
            stream_id: err.task.stream_id(),
            state: err.state,
        }
    }
}

impl fmt::Debug for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("stream_id", &self.task.stream_id())
            .field("state", &self.state)
            .finish()
    }
}

impl fmt::Display for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task for stream {} is busy in state {:?}",
            self.task.stream_id(),
            self.state
        )
    }
}

impl std::error::Error for DestroyError {}

/// A task that frees itself once it has run
#[derive(Debug)]
pub struct AutoDestroyTask {
    task: Task,
}

impl AutoDestroyTask {
    pub fn stream_id(&self) -> StreamId {
        self.task.stream_id()
    }

    pub fn handle(&self) -> TaskHandle {
        self.task.handle()
    }

    /// Execute, then destroy the task in the same call
    pub fn run(mut self) -> TaskResult<TaskStatus> {
        let result = self.task.execute();
        debug!(stream_id = self.task.stream_id(), "Auto-destroying task");
        result
    }
}

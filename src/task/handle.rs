//! Shared task core and the cross-thread `TaskHandle`
//!
//! The core holds the only task fields touched from both the session thread
//! and the worker: the state machine, the abort flag, the readiness slot and
//! the produced response. Everything else belongs to the worker alone.

use crate::error::{TaskError, TaskResult};
use crate::observability::metrics::metrics;
use crate::protocol::{InboundItem, OutboundItem, ResponseHead, StreamId};
use crate::queue::BucketQueue;
use crate::task::state::{AtomicTaskState, TaskState, TaskStatus};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a readiness notification reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyKind {
    /// Response metadata is available; output may be drained
    Response(ResponseHead),
    /// The task finished without ever producing a response
    Done(TaskStatus),
}

/// Delivered exactly once per task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEvent {
    pub stream_id: StreamId,
    pub kind: ReadyKind,
}

impl ReadyEvent {
    pub fn response(&self) -> Option<&ResponseHead> {
        match &self.kind {
            ReadyKind::Response(head) => Some(head),
            ReadyKind::Done(_) => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(&self.kind, ReadyKind::Done(status) if status.is_aborted())
    }
}

/// Readiness callback, invoked on whichever thread reaches readiness
pub type ReadyCallback = Box<dyn FnOnce(&ReadyEvent) + Send + 'static>;

#[derive(Default)]
struct ReadySlot {
    callback: Option<ReadyCallback>,
    fired: bool,
}

pub(crate) struct TaskCore {
    stream_id: StreamId,
    connection_id: Uuid,
    state: AtomicTaskState,
    aborted: AtomicBool,
    destroyed: AtomicBool,
    response: OnceCell<ResponseHead>,
    status: OnceCell<TaskStatus>,
    ready: Mutex<ReadySlot>,
    input_queue: Arc<BucketQueue<InboundItem>>,
    output_queue: Arc<BucketQueue<OutboundItem>>,
}

impl TaskCore {
    pub(crate) fn new(
        stream_id: StreamId,
        connection_id: Uuid,
        input_queue: Arc<BucketQueue<InboundItem>>,
        output_queue: Arc<BucketQueue<OutboundItem>>,
    ) -> Self {
        Self {
            stream_id,
            connection_id,
            state: AtomicTaskState::new(),
            aborted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            response: OnceCell::new(),
            status: OnceCell::new(),
            ready: Mutex::new(ReadySlot::default()),
            input_queue,
            output_queue,
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// STARTED or READY: a worker is still inside `execute`
    pub(crate) fn is_running(&self) -> bool {
        matches!(self.state(), TaskState::Started | TaskState::Ready)
    }

    pub(crate) fn abort(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            debug!(stream_id = self.stream_id, "Abort on destroyed task ignored");
            return;
        }
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            stream_id = self.stream_id,
            state = ?self.state(),
            "Task aborted"
        );
        metrics().task_abort_requested();
        // Release a worker blocked in the adapters so it sees the flag now
        // rather than at its next poll interval.
        self.input_queue.wake_all();
        self.output_queue.wake_all();
    }

    pub(crate) fn start(&self) -> TaskResult<()> {
        self.state
            .advance(TaskState::Started)
            .map(|_| {
                debug!(stream_id = self.stream_id, "Task state IDLE -> STARTED");
                metrics().task_started();
            })
            .map_err(|state| TaskError::AlreadyExecuted {
                stream_id: self.stream_id,
                state,
            })
    }

    /// Record the response and move STARTED -> READY, firing readiness
    pub(crate) fn mark_ready(&self, head: ResponseHead) -> TaskResult<()> {
        if self.response.set(head.clone()).is_err() {
            return Err(TaskError::ResponseAlreadySet {
                stream_id: self.stream_id,
            });
        }
        match self.state.advance(TaskState::Ready) {
            Ok(_) => {
                debug!(
                    stream_id = self.stream_id,
                    status = head.status,
                    "Task state STARTED -> READY"
                );
                metrics().task_ready();
            }
            Err(state) => {
                warn!(
                    stream_id = self.stream_id,
                    state = ?state,
                    "Response produced outside STARTED"
                );
            }
        }
        self.fire_ready(ReadyEvent {
            stream_id: self.stream_id,
            kind: ReadyKind::Response(head),
        });
        Ok(())
    }

    /// Move to DONE with `status`, firing readiness if it never fired
    pub(crate) fn finish(&self, status: TaskStatus) -> TaskStatus {
        let _ = self.status.set(status.clone());
        match self.state.advance(TaskState::Done) {
            Ok(previous) => {
                debug!(
                    stream_id = self.stream_id,
                    from = ?previous,
                    status = ?status,
                    "Task state -> DONE"
                );
                metrics().task_finished(previous, &status);
            }
            Err(state) => {
                warn!(stream_id = self.stream_id, state = ?state, "Task already finished");
            }
        }
        self.fire_ready(ReadyEvent {
            stream_id: self.stream_id,
            kind: ReadyKind::Done(status.clone()),
        });
        status
    }

    fn fire_ready(&self, event: ReadyEvent) {
        let callback = {
            let mut slot = self.ready.lock();
            if slot.fired {
                return;
            }
            slot.fired = true;
            slot.callback.take()
        };
        // Run outside the lock; the callback may call back into the handle.
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    pub(crate) fn set_ready_callback(&self, callback: ReadyCallback) -> bool {
        let mut slot = self.ready.lock();
        if slot.fired {
            debug!(
                stream_id = self.stream_id,
                "Readiness already delivered, callback not registered"
            );
            return false;
        }
        slot.callback = Some(callback);
        true
    }

    pub(crate) fn ready_signal(&self) -> Option<oneshot::Receiver<ReadyEvent>> {
        let (tx, rx) = oneshot::channel();
        let registered = self.set_ready_callback(Box::new(move |event: &ReadyEvent| {
            let _ = tx.send(event.clone());
        }));
        registered.then_some(rx)
    }

    pub(crate) fn mark_destroyed(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            metrics().task_destroyed();
        }
    }
}

/// Cheap, cloneable observer and abort switch for a task
///
/// Safe to use from any thread, before, during and after execution. After
/// the task is destroyed, `abort` is a no-op and the observers keep
/// reporting the final state.
#[derive(Clone)]
pub struct TaskHandle {
    core: Arc<TaskCore>,
}

impl TaskHandle {
    pub(crate) fn new(core: Arc<TaskCore>) -> Self {
        Self { core }
    }

    pub fn stream_id(&self) -> StreamId {
        self.core.stream_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.core.connection_id
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Request cancellation. Idempotent; never interrupts the worker thread,
    /// the pipeline notices at its next adapter call.
    pub fn abort(&self) {
        self.core.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.core.is_aborted()
    }

    /// True while the task is STARTED
    pub fn is_busy(&self) -> bool {
        self.core.state() == TaskState::Started
    }

    /// True while a worker is still inside `execute` (STARTED or READY)
    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn is_done(&self) -> bool {
        self.core.state() == TaskState::Done
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.load(Ordering::Acquire)
    }

    /// Response metadata, once produced
    pub fn response(&self) -> Option<ResponseHead> {
        self.core.response.get().cloned()
    }

    /// Final status, once DONE
    pub fn status(&self) -> Option<TaskStatus> {
        self.core.status.get().cloned()
    }

    /// Register the readiness callback, replacing any earlier one.
    ///
    /// Returns `false` and drops the callback if readiness was already
    /// delivered. Only registration before dispatch guarantees delivery.
    pub fn set_ready_callback<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&ReadyEvent) + Send + 'static,
    {
        self.core.set_ready_callback(Box::new(callback))
    }

    /// Readiness as a one-shot channel; replaces any registered callback.
    ///
    /// `None` if readiness was already delivered.
    pub fn ready_signal(&self) -> Option<oneshot::Receiver<ReadyEvent>> {
        self.core.ready_signal()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("stream_id", &self.core.stream_id)
            .field("state", &self.core.state())
            .field("aborted", &self.core.is_aborted())
            .finish()
    }
}

//! Session: the per-connection registry of stream tasks
//!
//! The session runs on the async side. It turns each opened stream into a
//! `Task`, feeds the stream's input queue, dispatches the task to a bounded
//! pool of blocking workers, waits for readiness, drains the output queue
//! and finally reaps the task. Worker threads never touch the registry;
//! they only see their own task.

use crate::error::{TaskError, TaskResult};
use crate::protocol::{
    Headers, InboundItem, OutboundItem, RequestHead, ResponseHead, StreamId,
};
use crate::queue::{BucketQueue, PushError};
use crate::task::{AutoDestroyTask, MasterConnection, ReadyEvent, Task, TaskHandle, TaskStatus};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn, Instrument};

/// Who releases a task once it has run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// The session destroys the task when it is reaped
    #[default]
    Explicit,
    /// The task destroys itself when execution ends
    AutoDestroy,
}

enum Runnable {
    Explicit(Task),
    AutoDestroy(AutoDestroyTask),
}

struct StreamEntry {
    handle: TaskHandle,
    ready: Option<oneshot::Receiver<ReadyEvent>>,
    worker: JoinHandle<Result<Option<Task>, JoinError>>,
    ownership: Ownership,
}

/// Everything the session saw on one stream's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamResponse {
    pub stream_id: StreamId,
    pub status: Option<u16>,
    #[serde(skip)]
    pub head: Option<ResponseHead>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Bytes,
    #[serde(skip)]
    pub trailers: Option<Headers>,
    pub reset: Option<String>,
}

fn serialize_body<S: serde::Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl StreamResponse {
    pub fn is_reset(&self) -> bool {
        self.reset.is_some()
    }
}

pub struct Session {
    connection: MasterConnection,
    input: Arc<BucketQueue<InboundItem>>,
    output: Arc<BucketQueue<OutboundItem>>,
    workers: Arc<Semaphore>,
    streams: HashMap<StreamId, StreamEntry>,
    span: tracing::Span,
}

impl Session {
    pub fn new(connection: MasterConnection) -> Self {
        let input = connection.input_queue();
        let output = connection.output_queue();
        let max_workers = connection.config().session.max_workers;
        let span = crate::session_span!(connection_id = %connection.id());
        info!(
            parent: &span,
            max_workers = max_workers,
            pipeline = connection.pipeline().name(),
            "Session started"
        );
        Self {
            connection,
            input,
            output,
            workers: Arc::new(Semaphore::new(max_workers)),
            streams: HashMap::new(),
            span,
        }
    }

    pub fn connection(&self) -> &MasterConnection {
        &self.connection
    }

    pub fn handle(&self, stream_id: StreamId) -> Option<TaskHandle> {
        self.streams.get(&stream_id).map(|entry| entry.handle.clone())
    }

    /// Stream ids with a task that has not been reaped, in ascending order
    pub fn active_streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn entry(&self, stream_id: StreamId) -> TaskResult<&StreamEntry> {
        self.streams
            .get(&stream_id)
            .ok_or(TaskError::UnknownStream { stream_id })
    }

    fn poll_interval(&self) -> Duration {
        self.connection.config().task.poll_interval()
    }

    /// Create the stream's task, queue its request head and dispatch it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_stream(
        &mut self,
        stream_id: StreamId,
        request: &RequestHead,
        ownership: Ownership,
    ) -> TaskResult<TaskHandle> {
        let _enter = self.span.enter();
        if self.streams.contains_key(&stream_id) {
            return Err(TaskError::StreamExists { stream_id });
        }

        let request_text = request.to_http1().map_err(|e| {
            warn!(stream_id, error = %e, "Rejected request head");
            TaskError::setup(stream_id, e.to_string())
        })?;

        let mut task = Task::create(
            stream_id,
            &self.connection,
            self.input.clone(),
            self.output.clone(),
        )?;
        let handle = task.handle();
        let ready = task.ready_signal();

        if let Err(e) = self.input.try_push(stream_id, InboundItem::Data(request_text)) {
            warn!(stream_id, error = %e, "Could not queue request head");
            return Err(match e {
                PushError::Full(_) => TaskError::setup(stream_id, "input queue is full"),
                PushError::Closed(_) => TaskError::QueueClosed { stream_id },
            });
        }

        let runnable = match ownership {
            Ownership::Explicit => Runnable::Explicit(task),
            Ownership::AutoDestroy => Runnable::AutoDestroy(task.into_auto_destroy()),
        };
        let worker = self.dispatch(stream_id, runnable);

        debug!(
            stream_id,
            method = %request.method,
            path = %request.path,
            ownership = ?ownership,
            "Stream opened"
        );
        self.streams.insert(
            stream_id,
            StreamEntry {
                handle: handle.clone(),
                ready,
                worker,
                ownership,
            },
        );
        Ok(handle)
    }

    fn dispatch(
        &self,
        stream_id: StreamId,
        runnable: Runnable,
    ) -> JoinHandle<Result<Option<Task>, JoinError>> {
        let workers = self.workers.clone();
        let span = self
            .span
            .in_scope(|| crate::stream_span!(stream_id = stream_id));
        tokio::spawn(
            async move {
                // Only a closed semaphore fails here; the task must still
                // run so it reaches DONE.
                let permit = workers.acquire_owned().await.ok();
                let span = tracing::Span::current();
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let _enter = span.enter();
                    match runnable {
                        Runnable::Explicit(mut task) => {
                            if let Err(e) = task.execute() {
                                warn!(error = %e, "Task execution refused");
                            }
                            Some(task)
                        }
                        Runnable::AutoDestroy(task) => {
                            if let Err(e) = task.run() {
                                warn!(error = %e, "Task execution refused");
                            }
                            None
                        }
                    }
                })
                .await
            }
            .instrument(span),
        )
    }

    /// Queue a request body chunk, waiting while the stream's input is full.
    ///
    /// Data for a task that already finished is dropped.
    pub async fn push_data(&mut self, stream_id: StreamId, data: impl Into<Bytes>) -> TaskResult<()> {
        self.push_input(stream_id, InboundItem::Data(data.into()))
            .await
    }

    /// Mark the end of the request body
    pub async fn end_stream(&mut self, stream_id: StreamId) -> TaskResult<()> {
        self.push_input(stream_id, InboundItem::End).await
    }

    async fn push_input(&self, stream_id: StreamId, item: InboundItem) -> TaskResult<()> {
        let handle = self.entry(stream_id)?.handle.clone();
        let poll = self.poll_interval();
        let mut item = item;
        loop {
            if handle.is_aborted() {
                return Err(TaskError::Cancelled { stream_id });
            }
            if handle.is_done() {
                debug!(stream_id, "Task finished, input dropped");
                return Ok(());
            }
            match self.input.push(stream_id, item, poll).await {
                Ok(()) => return Ok(()),
                Err(PushError::Full(back)) => item = back,
                Err(PushError::Closed(_)) => return Err(TaskError::QueueClosed { stream_id }),
            }
        }
    }

    /// Wait for the stream's readiness notification.
    ///
    /// Readiness is delivered once; a second call fails with
    /// `ReadinessTaken`.
    pub async fn wait_ready(&mut self, stream_id: StreamId) -> TaskResult<ReadyEvent> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TaskError::UnknownStream { stream_id })?;
        let ready = entry
            .ready
            .take()
            .ok_or(TaskError::ReadinessTaken { stream_id })?;
        ready
            .await
            .map_err(|_| TaskError::worker(stream_id, "task dropped before readiness"))
    }

    /// Next entry of the stream's output, or `None` once the task is done
    /// and everything it produced was drained.
    pub async fn next_output(&self, stream_id: StreamId) -> TaskResult<Option<OutboundItem>> {
        let handle = self.entry(stream_id)?.handle.clone();
        let poll = self.poll_interval();
        loop {
            if let Some(item) = self.output.try_pop(stream_id) {
                return Ok(Some(item));
            }
            if handle.is_done() {
                return Ok(self.output.try_pop(stream_id));
            }
            tokio::select! {
                item = self.output.pop(stream_id) => return Ok(item),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Wait for readiness, then drain the stream's output up to its end or
    /// reset marker.
    ///
    /// Only this stream's output is drained meanwhile. A worker blocked on
    /// another stream's full output queue keeps its permit, so collecting
    /// streams one after another can stall once more streams than
    /// `max_workers` produce more than `output_capacity` entries each. Drain
    /// such streams concurrently with [`Session::next_output`], or configure
    /// an unbounded output queue.
    pub async fn collect_response(&mut self, stream_id: StreamId) -> TaskResult<StreamResponse> {
        match self.wait_ready(stream_id).await {
            Ok(_) | Err(TaskError::ReadinessTaken { .. }) => {}
            Err(e) => return Err(e),
        }

        let mut response = StreamResponse {
            stream_id,
            status: None,
            head: None,
            body: Bytes::new(),
            trailers: None,
            reset: None,
        };
        let mut body = BytesMut::new();
        while let Some(item) = self.next_output(stream_id).await? {
            match item {
                OutboundItem::Response(head) => {
                    response.status = Some(head.status);
                    response.head = Some(head);
                }
                OutboundItem::Data(data) => body.extend_from_slice(&data),
                OutboundItem::End { trailers } => {
                    response.trailers = trailers;
                    break;
                }
                OutboundItem::Reset { reason } => {
                    response.reset = Some(reason);
                    break;
                }
            }
        }
        response.body = body.freeze();
        Ok(response)
    }

    /// Reset a stream: abort its task and drop any queued request input
    pub fn reset_stream(&self, stream_id: StreamId) -> TaskResult<()> {
        let entry = self.entry(stream_id)?;
        let _enter = self.span.enter();
        info!(stream_id, "Stream reset");
        entry.handle.abort();
        let dropped = self.input.discard(stream_id);
        if dropped > 0 {
            debug!(stream_id, dropped, "Discarded queued input");
        }
        Ok(())
    }

    /// Wait for the stream's worker, destroy the task and forget the stream
    pub async fn reap(&mut self, stream_id: StreamId) -> TaskResult<TaskStatus> {
        let entry = self
            .streams
            .remove(&stream_id)
            .ok_or(TaskError::UnknownStream { stream_id })?;

        let task = entry
            .worker
            .await
            .and_then(|joined| joined)
            .map_err(|e| TaskError::worker(stream_id, e.to_string()))?;

        match (entry.ownership, task) {
            (Ownership::Explicit, Some(task)) => task.destroy()?,
            (Ownership::Explicit, None) => {
                return Err(TaskError::worker(stream_id, "worker did not return the task"));
            }
            (Ownership::AutoDestroy, _) => {}
        }

        let leftover = self.input.discard(stream_id) + self.output.discard(stream_id);
        let status = entry
            .handle
            .status()
            .ok_or_else(|| TaskError::worker(stream_id, "task ended without a status"))?;
        debug!(
            parent: &self.span,
            stream_id,
            status = ?status,
            leftover,
            "Stream reaped"
        );
        Ok(status)
    }

    /// Abort every stream, reap them all and close the queues
    pub async fn shutdown(mut self) -> Vec<(StreamId, TaskResult<TaskStatus>)> {
        let ids = self.active_streams();
        info!(parent: &self.span, streams = ids.len(), "Session shutting down");
        for entry in self.streams.values() {
            entry.handle.abort();
        }

        let mut results = Vec::with_capacity(ids.len());
        for stream_id in ids {
            let result = self.reap(stream_id).await;
            if let Err(e) = &result {
                warn!(parent: &self.span, stream_id, error = %e, "Reap failed during shutdown");
            }
            results.push((stream_id, result));
        }
        self.input.close();
        self.output.close();
        results
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for entry in self.streams.values() {
            entry.handle.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .field("streams", &self.active_streams())
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}

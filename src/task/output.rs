//! Output adapter: response metadata and body chunks onto the outbound queue
//!
//! Accepts the response once, then body chunks, then a single close. Writes
//! block while the session-side queue is full, in slices of the poll
//! interval, so an abort is noticed within one slice.

use crate::error::{TaskError, TaskResult};
use crate::observability::metrics::metrics;
use crate::protocol::{Headers, OutboundItem, ResponseHead, StreamId};
use crate::queue::{BucketQueue, PushError};
use crate::task::handle::TaskCore;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputPhase {
    AwaitingResponse,
    Streaming,
    Closed,
}

pub struct TaskOutput {
    stream_id: StreamId,
    queue: Arc<BucketQueue<OutboundItem>>,
    core: Arc<TaskCore>,
    phase: OutputPhase,
    poll_interval: Duration,
    write_timeout: Option<Duration>,
    bytes_written: u64,
}

impl TaskOutput {
    pub(crate) fn new(
        queue: Arc<BucketQueue<OutboundItem>>,
        core: Arc<TaskCore>,
        poll_interval: Duration,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream_id: core.stream_id(),
            queue,
            core,
            phase: OutputPhase::AwaitingResponse,
            poll_interval,
            write_timeout,
            bytes_written: 0,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn has_response(&self) -> bool {
        self.phase != OutputPhase::AwaitingResponse
    }

    pub fn is_closed(&self) -> bool {
        self.phase == OutputPhase::Closed
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Publish the response metadata. Moves the task to READY and fires its
    /// readiness notification once the entry is queued.
    pub fn set_response(&mut self, head: ResponseHead) -> TaskResult<()> {
        match self.phase {
            OutputPhase::AwaitingResponse => {}
            OutputPhase::Streaming => {
                return Err(self.misuse(TaskError::ResponseAlreadySet {
                    stream_id: self.stream_id,
                }))
            }
            OutputPhase::Closed => {
                return Err(self.misuse(TaskError::OutputClosed {
                    stream_id: self.stream_id,
                }))
            }
        }

        self.enqueue(OutboundItem::Response(head.clone()))?;
        self.phase = OutputPhase::Streaming;
        self.core.mark_ready(head).map_err(|e| self.misuse(e))
    }

    /// Append a body chunk. Empty chunks are ignored.
    pub fn write(&mut self, data: impl Into<Bytes>) -> TaskResult<()> {
        self.ensure_streaming()?;
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        self.enqueue(OutboundItem::Data(data))?;
        self.bytes_written += len;
        metrics().bytes_written(len);
        Ok(())
    }

    /// Mark the end of the response; later writes fail.
    pub fn close(&mut self, trailers: Option<Headers>) -> TaskResult<()> {
        self.ensure_streaming()?;
        self.enqueue(OutboundItem::End { trailers })?;
        self.phase = OutputPhase::Closed;
        debug!(
            stream_id = self.stream_id,
            bytes_written = self.bytes_written,
            "Task output closed"
        );
        Ok(())
    }

    /// Leave a reset marker for the session unless the output was closed.
    /// Never waits: a full or closed queue just drops the marker.
    pub(crate) fn reset(&mut self, reason: &str) {
        if self.phase == OutputPhase::Closed {
            return;
        }
        self.phase = OutputPhase::Closed;
        let marker = OutboundItem::Reset {
            reason: reason.to_string(),
        };
        if let Err(e) = self.queue.try_push(self.stream_id, marker) {
            debug!(stream_id = self.stream_id, error = %e, "Reset marker dropped");
        }
    }

    fn ensure_streaming(&self) -> TaskResult<()> {
        match self.phase {
            OutputPhase::Streaming => Ok(()),
            OutputPhase::AwaitingResponse => Err(self.misuse(TaskError::MissingResponse {
                stream_id: self.stream_id,
            })),
            OutputPhase::Closed => Err(self.misuse(TaskError::OutputClosed {
                stream_id: self.stream_id,
            })),
        }
    }

    fn misuse(&self, err: TaskError) -> TaskError {
        error!(stream_id = self.stream_id, error = %err, "Task output misuse");
        err
    }

    fn enqueue(&self, item: OutboundItem) -> TaskResult<()> {
        let deadline = self.write_timeout.map(|timeout| Instant::now() + timeout);
        let mut item = item;
        loop {
            if self.core.is_aborted() {
                return Err(TaskError::Cancelled {
                    stream_id: self.stream_id,
                });
            }

            let wait = match deadline {
                None => self.poll_interval,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(TaskError::Timeout {
                            stream_id: self.stream_id,
                        });
                    }
                    remaining.min(self.poll_interval)
                }
            };

            match self.queue.push_timeout(self.stream_id, item, wait) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(back)) => item = back,
                Err(PushError::Closed(_)) => {
                    return Err(TaskError::QueueClosed {
                        stream_id: self.stream_id,
                    })
                }
            }
        }
    }
}

impl io::Write for TaskOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TaskOutput::write(self, Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! Input adapter: the stream's inbound queue as a sequential blocking read
//!
//! The session produces into the queue; the adapter owns only its read
//! position (the unread tail of the current chunk) and the end-of-stream
//! flag. Chunks come out in enqueue order and may be split by `max_bytes`,
//! never merged.

use crate::error::{TaskError, TaskResult};
use crate::observability::metrics::metrics;
use crate::protocol::{InboundItem, StreamId};
use crate::queue::BucketQueue;
use crate::task::handle::TaskCore;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Whether `read` may wait for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Blocking,
    NonBlocking,
}

/// Result of one read: data, or the zero-length end marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputChunk {
    pub data: Bytes,
    pub end_of_stream: bool,
}

impl InputChunk {
    fn end() -> Self {
        Self {
            data: Bytes::new(),
            end_of_stream: true,
        }
    }
}

pub struct TaskInput {
    stream_id: StreamId,
    queue: Arc<BucketQueue<InboundItem>>,
    core: Arc<TaskCore>,
    pending: Bytes,
    eos: bool,
    poll_interval: Duration,
    read_timeout: Option<Duration>,
    bytes_read: u64,
}

impl TaskInput {
    pub(crate) fn new(
        queue: Arc<BucketQueue<InboundItem>>,
        core: Arc<TaskCore>,
        poll_interval: Duration,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream_id: core.stream_id(),
            queue,
            core,
            pending: Bytes::new(),
            eos: false,
            poll_interval,
            read_timeout,
            bytes_read: 0,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// True once the end marker was consumed and nothing is left unread
    pub fn is_eos(&self) -> bool {
        self.eos && self.pending.is_empty()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read up to `max_bytes` of the next chunk.
    ///
    /// Blocking reads wait for data in slices of the poll interval, checking
    /// the abort flag between slices. End of stream yields an empty chunk
    /// with `end_of_stream` set, as often as it is asked for. Empty data
    /// chunks from the session are skipped.
    pub fn read(&mut self, max_bytes: usize, mode: ReadMode) -> TaskResult<InputChunk> {
        if self.core.is_aborted() {
            return Err(TaskError::Cancelled {
                stream_id: self.stream_id,
            });
        }
        if !self.pending.is_empty() {
            return Ok(self.take_pending(max_bytes));
        }
        if self.eos {
            return Ok(InputChunk::end());
        }

        let deadline = self.read_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if self.core.is_aborted() {
                return Err(TaskError::Cancelled {
                    stream_id: self.stream_id,
                });
            }

            let item = match mode {
                ReadMode::NonBlocking => self.queue.try_pop(self.stream_id),
                ReadMode::Blocking => {
                    let wait = self.next_wait(deadline)?;
                    self.queue.pop_timeout(self.stream_id, wait)
                }
            };

            match item {
                Some(InboundItem::Data(data)) if data.is_empty() => continue,
                Some(InboundItem::Data(data)) => {
                    trace!(stream_id = self.stream_id, len = data.len(), "Input chunk");
                    self.pending = data;
                    return Ok(self.take_pending(max_bytes));
                }
                Some(InboundItem::End) => {
                    trace!(stream_id = self.stream_id, "Input end of stream");
                    self.eos = true;
                    return Ok(InputChunk::end());
                }
                None if self.queue.is_closed() && self.queue.is_empty(self.stream_id) => {
                    return Err(TaskError::QueueClosed {
                        stream_id: self.stream_id,
                    });
                }
                None if mode == ReadMode::NonBlocking => {
                    return Err(TaskError::WouldBlock {
                        stream_id: self.stream_id,
                    });
                }
                None => continue,
            }
        }
    }

    /// Read everything up to the end of stream
    pub fn read_to_end(&mut self) -> TaskResult<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let chunk = self.read(usize::MAX, ReadMode::Blocking)?;
            if chunk.end_of_stream {
                return Ok(body.freeze());
            }
            body.extend_from_slice(&chunk.data);
        }
    }

    fn take_pending(&mut self, max_bytes: usize) -> InputChunk {
        let len = max_bytes.min(self.pending.len());
        let data = self.pending.split_to(len);
        self.bytes_read += len as u64;
        metrics().bytes_read(len as u64);
        InputChunk {
            data,
            end_of_stream: false,
        }
    }

    fn next_wait(&self, deadline: Option<Instant>) -> TaskResult<Duration> {
        match deadline {
            None => Ok(self.poll_interval),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    Err(TaskError::Timeout {
                        stream_id: self.stream_id,
                    })
                } else {
                    Ok(remaining.min(self.poll_interval))
                }
            }
        }
    }
}

impl io::Read for TaskInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = TaskInput::read(self, buf.len(), ReadMode::Blocking)?;
        let len = chunk.data.len();
        buf[..len].copy_from_slice(&chunk.data);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;
    use uuid::Uuid;

    fn input_with(
        read_timeout: Option<Duration>,
    ) -> (TaskInput, Arc<BucketQueue<InboundItem>>, Arc<TaskCore>) {
        let connection_id = Uuid::new_v4();
        let queue = Arc::new(BucketQueue::new(connection_id, None));
        let output = Arc::new(BucketQueue::new(connection_id, None));
        let core = Arc::new(TaskCore::new(7, connection_id, queue.clone(), output));
        let input = TaskInput::new(
            queue.clone(),
            core.clone(),
            Duration::from_millis(5),
            read_timeout,
        );
        (input, queue, core)
    }

    fn data(s: &'static str) -> InboundItem {
        InboundItem::Data(Bytes::from_static(s.as_bytes()))
    }

    #[test]
    fn test_reads_chunks_then_end() {
        let (mut input, queue, _core) = input_with(None);
        queue.try_push(7, data("GET /x")).unwrap();
        queue.try_push(7, data("")).unwrap();
        queue.try_push(7, InboundItem::End).unwrap();

        let first = input.read(1024, ReadMode::Blocking).unwrap();
        assert_eq!(&first.data[..], b"GET /x");
        assert!(!first.end_of_stream);

        let end = input.read(1024, ReadMode::Blocking).unwrap();
        assert!(end.end_of_stream);
        assert!(end.data.is_empty());
        assert!(input.is_eos());

        // End of stream is sticky
        assert!(input.read(1024, ReadMode::Blocking).unwrap().end_of_stream);
    }

    #[test]
    fn test_max_bytes_splits_chunk_in_order() {
        let (mut input, queue, _core) = input_with(None);
        queue.try_push(7, data("abcdef")).unwrap();
        queue.try_push(7, InboundItem::End).unwrap();

        assert_eq!(&input.read(4, ReadMode::Blocking).unwrap().data[..], b"abcd");
        assert_eq!(&input.read(4, ReadMode::Blocking).unwrap().data[..], b"ef");
        assert!(input.read(4, ReadMode::Blocking).unwrap().end_of_stream);
        assert_eq!(input.bytes_read(), 6);
    }

    #[test]
    fn test_non_blocking_read_would_block() {
        let (mut input, _queue, _core) = input_with(None);
        let result = input.read(16, ReadMode::NonBlocking);
        assert!(matches!(result, Err(TaskError::WouldBlock { stream_id: 7 })));
    }

    #[test]
    fn test_other_streams_are_invisible() {
        let (mut input, queue, _core) = input_with(None);
        queue.try_push(8, data("not mine")).unwrap();

        let result = input.read(16, ReadMode::NonBlocking);
        assert!(matches!(result, Err(TaskError::WouldBlock { .. })));
        assert_eq!(queue.len(8), 1);
    }

    #[test]
    fn test_read_timeout() {
        let (mut input, _queue, _core) = input_with(Some(Duration::from_millis(20)));
        let started = Instant::now();
        let result = input.read(16, ReadMode::Blocking);
        assert!(matches!(result, Err(TaskError::Timeout { stream_id: 7 })));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_abort_cancels_blocked_read() {
        let (mut input, _queue, core) = input_with(None);
        let aborter = {
            let core = core.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                core.abort();
            })
        };

        let started = Instant::now();
        let result = input.read(16, ReadMode::Blocking);
        aborter.join().unwrap();

        assert!(matches!(result, Err(TaskError::Cancelled { stream_id: 7 })));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_closed_queue_fails_read() {
        let (mut input, queue, _core) = input_with(None);
        queue.close();
        let result = input.read(16, ReadMode::Blocking);
        assert!(matches!(result, Err(TaskError::QueueClosed { stream_id: 7 })));
    }

    #[test]
    fn test_io_read_to_string() {
        let (mut input, queue, _core) = input_with(None);
        queue.try_push(7, data("hello ")).unwrap();
        queue.try_push(7, data("world")).unwrap();
        queue.try_push(7, InboundItem::End).unwrap();

        let mut text = String::new();
        Read::read_to_string(&mut input, &mut text).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_io_read_maps_abort_to_connection_aborted() {
        let (mut input, _queue, core) = input_with(None);
        core.abort();

        let mut buf = [0u8; 8];
        let err = Read::read(&mut input, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(TaskError::from_io(7, err).is_cancellation());
    }
}

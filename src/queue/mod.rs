//! Per-stream tagged queues shared between a session and its tasks
//!
//! A `BucketQueue` belongs to one master connection and holds one FIFO per
//! stream id. Worker threads block on it with bounded waits (`Condvar`), the
//! session side polls it or awaits it asynchronously (`Notify`). Entries of
//! different streams never mix and each stream keeps enqueue order.

use crate::protocol::StreamId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

/// Rejected push; the item is handed back to the caller
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The stream's queue is at capacity
    Full(T),
    /// The queue was closed
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "queue is full"),
            PushError::Closed(_) => write!(f, "queue is closed"),
        }
    }
}

struct QueueInner<T> {
    streams: HashMap<StreamId, VecDeque<T>>,
    closed: bool,
}

impl<T> QueueInner<T> {
    fn len(&self, stream_id: StreamId) -> usize {
        self.streams.get(&stream_id).map_or(0, VecDeque::len)
    }

    fn pop(&mut self, stream_id: StreamId) -> Option<T> {
        let entries = self.streams.get_mut(&stream_id)?;
        let item = entries.pop_front();
        if entries.is_empty() {
            self.streams.remove(&stream_id);
        }
        item
    }
}

/// Queue of entries tagged by stream id, bound to one master connection
pub struct BucketQueue<T> {
    connection_id: Uuid,
    capacity: Option<usize>,
    inner: Mutex<QueueInner<T>>,
    changed: Condvar,
    notify: Notify,
}

impl<T> BucketQueue<T> {
    /// Create a queue for `connection_id`; `capacity` bounds each stream
    pub fn new(connection_id: Uuid, capacity: Option<usize>) -> Self {
        Self {
            connection_id,
            capacity,
            inner: Mutex::new(QueueInner {
                streams: HashMap::new(),
                closed: false,
            }),
            changed: Condvar::new(),
            notify: Notify::new(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn is_full(&self, inner: &QueueInner<T>, stream_id: StreamId) -> bool {
        self.capacity
            .is_some_and(|capacity| inner.len(stream_id) >= capacity)
    }

    fn signal(&self) {
        self.changed.notify_all();
        self.notify.notify_waiters();
    }

    /// Append without waiting
    pub fn try_push(&self, stream_id: StreamId, item: T) -> Result<(), PushError<T>> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PushError::Closed(item));
            }
            if self.is_full(&inner, stream_id) {
                return Err(PushError::Full(item));
            }
            inner.streams.entry(stream_id).or_default().push_back(item);
        }
        self.signal();
        Ok(())
    }

    /// Append, waiting up to `timeout` for space. Returns `Full` when the
    /// wait elapses so the caller can re-check its own cancellation state.
    pub fn push_timeout(
        &self,
        stream_id: StreamId,
        item: T,
        timeout: Duration,
    ) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        {
            let mut inner = self.inner.lock();
            loop {
                if inner.closed {
                    return Err(PushError::Closed(item));
                }
                if !self.is_full(&inner, stream_id) {
                    break;
                }
                if self.changed.wait_until(&mut inner, deadline).timed_out() {
                    if inner.closed {
                        return Err(PushError::Closed(item));
                    }
                    if self.is_full(&inner, stream_id) {
                        return Err(PushError::Full(item));
                    }
                    break;
                }
            }
            inner.streams.entry(stream_id).or_default().push_back(item);
        }
        self.signal();
        Ok(())
    }

    /// Take the oldest entry of a stream without waiting
    pub fn try_pop(&self, stream_id: StreamId) -> Option<T> {
        let item = self.inner.lock().pop(stream_id);
        if item.is_some() {
            self.signal();
        }
        item
    }

    /// Take the oldest entry of a stream, waiting up to `timeout`.
    ///
    /// `None` means the wait elapsed, the queue was closed and drained, or
    /// `wake_all` interrupted the wait.
    pub fn pop_timeout(&self, stream_id: StreamId, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let item = {
            let mut inner = self.inner.lock();
            loop {
                if let Some(item) = inner.pop(stream_id) {
                    break Some(item);
                }
                if inner.closed {
                    break None;
                }
                if self.changed.wait_until(&mut inner, deadline).timed_out() {
                    break inner.pop(stream_id);
                }
                // Woken without data for this stream: hand control back so
                // the caller re-checks its abort flag.
                if inner.len(stream_id) == 0 {
                    break None;
                }
            }
        };
        if item.is_some() {
            self.signal();
        }
        item
    }

    /// Await the oldest entry of a stream from async code.
    ///
    /// Returns `None` once the queue is closed and the stream is drained.
    pub async fn pop(&self, stream_id: StreamId) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.pop(stream_id) {
                    drop(inner);
                    self.signal();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Append from async code, waiting up to `timeout` for space.
    ///
    /// Like `push_timeout`, a wait that elapses hands the item back as
    /// `Full`.
    pub async fn push(
        &self,
        stream_id: StreamId,
        item: T,
        timeout: Duration,
    ) -> Result<(), PushError<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut item = item;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(stream_id, item) {
                Err(PushError::Full(back)) => item = back,
                other => return other,
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_push(stream_id, item);
            }
        }
    }

    /// Number of queued entries for a stream
    pub fn len(&self, stream_id: StreamId) -> usize {
        self.inner.lock().len(stream_id)
    }

    pub fn is_empty(&self, stream_id: StreamId) -> bool {
        self.len(stream_id) == 0
    }

    /// Drop every queued entry of a stream, returning how many were dropped
    pub fn discard(&self, stream_id: StreamId) -> usize {
        let dropped = self
            .inner
            .lock()
            .streams
            .remove(&stream_id)
            .map_or(0, |entries| entries.len());
        if dropped > 0 {
            self.signal();
        }
        dropped
    }

    /// Refuse further pushes and release all waiters
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.signal();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wake every blocked reader and writer so they re-check their state
    pub fn wake_all(&self) {
        // Taking the lock orders the wakeup after any state change the
        // waker made before calling us.
        drop(self.inner.lock());
        self.signal();
    }
}

impl<T> fmt::Debug for BucketQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BucketQueue")
            .field("connection_id", &self.connection_id)
            .field("capacity", &self.capacity)
            .field("streams", &inner.streams.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

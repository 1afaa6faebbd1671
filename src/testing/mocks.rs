//! Mock pipelines and recorders for testing
//!
//! Pipelines here cover the shapes the task has to cope with: a scripted
//! response, an echo, a failure, a panic and a pipeline that blocks until
//! it is aborted.

use crate::config::StreamTaskConfig;
use crate::error::{TaskError, TaskResult};
use crate::hooks;
use crate::pipeline::RequestPipeline;
use crate::protocol::{Headers, ResponseHead};
use crate::task::{MasterConnection, ReadMode, ReadyEvent, RequestContext, TaskInput, TaskOutput};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration with short waits so cancellation tests run quickly
pub fn fast_config() -> StreamTaskConfig {
    let mut config = StreamTaskConfig::default();
    config.session.max_workers = 4;
    config.session.input_capacity = 8;
    config.session.output_capacity = 8;
    config.task.poll_interval_ms = 5;
    config
}

/// Initialise hooks and build a connection around `pipeline`
pub fn test_connection<P: RequestPipeline + 'static>(pipeline: P) -> MasterConnection {
    test_connection_with(fast_config(), pipeline)
}

pub fn test_connection_with<P: RequestPipeline + 'static>(
    config: StreamTaskConfig,
    pipeline: P,
) -> MasterConnection {
    hooks::init_hooks();
    MasterConnection::new(config, Arc::new(pipeline))
}

/// Reads the whole request, then answers with a fixed response
#[derive(Debug, Clone)]
pub struct ScriptedPipeline {
    status: u16,
    headers: Headers,
    chunks: Vec<Bytes>,
    trailers: Option<Headers>,
    leave_open: bool,
    requests: Arc<Mutex<Vec<Bytes>>>,
    contexts: Arc<Mutex<Vec<RequestContext>>>,
}

impl ScriptedPipeline {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            chunks: Vec::new(),
            trailers: None,
            leave_open: false,
            requests: Arc::new(Mutex::new(Vec::new())),
            contexts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    pub fn with_trailers(mut self, trailers: Headers) -> Self {
        self.trailers = Some(trailers);
        self
    }

    /// Return without closing the output and let the task close it
    pub fn leaving_output_open(mut self) -> Self {
        self.leave_open = true;
        self
    }

    /// Raw request bytes seen, one entry per processed task
    pub fn requests(&self) -> Vec<Bytes> {
        self.requests.lock().clone()
    }

    pub fn contexts(&self) -> Vec<RequestContext> {
        self.contexts.lock().clone()
    }
}

impl RequestPipeline for ScriptedPipeline {
    fn name(&self) -> &str {
        "scripted"
    }

    fn process(
        &self,
        context: &mut RequestContext,
        input: &mut TaskInput,
        output: &mut TaskOutput,
    ) -> TaskResult<()> {
        let request = input.read_to_end()?;
        self.requests.lock().push(request);
        self.contexts.lock().push(context.clone());

        let mut head = ResponseHead::new(self.status);
        for (name, value) in self.headers.iter() {
            head.headers.append(name, value);
        }
        output.set_response(head)?;
        for chunk in &self.chunks {
            output.write(chunk.clone())?;
        }
        if !self.leave_open {
            output.close(self.trailers.clone())?;
        }
        Ok(())
    }
}

/// Answers 200 with the raw request bytes as the body
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoPipeline;

impl RequestPipeline for EchoPipeline {
    fn name(&self) -> &str {
        "echo"
    }

    fn process(
        &self,
        _context: &mut RequestContext,
        input: &mut TaskInput,
        output: &mut TaskOutput,
    ) -> TaskResult<()> {
        let body = input.read_to_end()?;
        output.set_response(ResponseHead::ok())?;
        output.write(body)?;
        output.close(None)
    }
}

/// Fails before producing any output, by error or by panic
#[derive(Debug, Clone)]
pub struct FailingPipeline {
    message: String,
    panic: bool,
}

impl FailingPipeline {
    pub fn error(message: &str) -> Self {
        Self {
            message: message.to_string(),
            panic: false,
        }
    }

    pub fn panicking(message: &str) -> Self {
        Self {
            message: message.to_string(),
            panic: true,
        }
    }
}

impl RequestPipeline for FailingPipeline {
    fn name(&self) -> &str {
        "failing"
    }

    fn process(
        &self,
        context: &mut RequestContext,
        _input: &mut TaskInput,
        _output: &mut TaskOutput,
    ) -> TaskResult<()> {
        if self.panic {
            panic!("{}", self.message);
        }
        Err(TaskError::pipeline(context.stream_id(), self.message.clone()))
    }
}

/// Reads forever; only an abort gets it out
#[derive(Debug, Clone, Default)]
pub struct StallingPipeline {
    respond_first: bool,
    entered: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl StallingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a 200 response before stalling, so the task is READY while
    /// blocked
    pub fn after_response() -> Self {
        Self {
            respond_first: true,
            ..Self::default()
        }
    }

    /// True once `process` was entered
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    /// True once a read returned the cancellation error
    pub fn saw_cancellation(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl RequestPipeline for StallingPipeline {
    fn name(&self) -> &str {
        "stalling"
    }

    fn process(
        &self,
        _context: &mut RequestContext,
        input: &mut TaskInput,
        output: &mut TaskOutput,
    ) -> TaskResult<()> {
        self.entered.store(true, Ordering::SeqCst);
        if self.respond_first {
            output.set_response(ResponseHead::ok())?;
        }
        loop {
            match input.read(1024, ReadMode::Blocking) {
                Ok(chunk) if chunk.end_of_stream => {
                    // Keep the task busy past the end of input
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Ok(_) => {}
                Err(e) => {
                    if e.is_cancellation() {
                        self.cancelled.store(true, Ordering::SeqCst);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Records readiness events delivered through a callback
#[derive(Debug, Clone, Default)]
pub struct ReadyRecorder {
    events: Arc<Mutex<Vec<ReadyEvent>>>,
    calls: Arc<AtomicUsize>,
}

impl ReadyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnOnce(&ReadyEvent) + Send + 'static {
        let events = self.events.clone();
        let calls = self.calls.clone();
        move |event: &ReadyEvent| {
            calls.fetch_add(1, Ordering::SeqCst);
            events.lock().push(event.clone());
        }
    }

    pub fn events(&self) -> Vec<ReadyEvent> {
        self.events.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

//! Request processing pipelines
//!
//! A pipeline is whatever turns one synthetic request into one response.
//! It runs on a worker thread, blocks freely on the task's input, and must
//! treat `TaskError::Cancelled` from either adapter as the signal to stop.

pub mod http1;

pub use http1::{Http1Pipeline, Http1Reply, Http1Request};

use crate::error::TaskResult;
use crate::task::{RequestContext, TaskInput, TaskOutput};

/// The processing stage a task executes
pub trait RequestPipeline: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Process one request to completion.
    ///
    /// Returning `Ok` without closing the output is fine when a response was
    /// set; the task closes it. Returning `Ok` with no response at all is a
    /// failure.
    fn process(
        &self,
        context: &mut RequestContext,
        input: &mut TaskInput,
        output: &mut TaskOutput,
    ) -> TaskResult<()>;
}

/// Pipeline backed by a closure
pub struct FnPipeline<F> {
    name: String,
    f: F,
}

impl<F> FnPipeline<F>
where
    F: Fn(&mut RequestContext, &mut TaskInput, &mut TaskOutput) -> TaskResult<()>
        + Send
        + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> RequestPipeline for FnPipeline<F>
where
    F: Fn(&mut RequestContext, &mut TaskInput, &mut TaskOutput) -> TaskResult<()>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        &self,
        context: &mut RequestContext,
        input: &mut TaskInput,
        output: &mut TaskOutput,
    ) -> TaskResult<()> {
        (self.f)(context, input, output)
    }
}

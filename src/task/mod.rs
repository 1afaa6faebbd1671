//! Per-stream tasks
//!
//! A [`Task`] runs one stream's request on a worker thread against a
//! private [`RequestContext`], reading the request through [`TaskInput`] and
//! publishing the response through [`TaskOutput`]. The session watches and
//! cancels it through a [`TaskHandle`].

pub mod connection;
pub mod context;
pub mod execution;
pub mod handle;
pub mod input;
pub mod output;
pub mod state;

pub use connection::MasterConnection;
pub use context::RequestContext;
pub use execution::{AutoDestroyTask, DestroyError, Task};
pub use handle::{ReadyCallback, ReadyEvent, ReadyKind, TaskHandle};
pub use input::{InputChunk, ReadMode, TaskInput};
pub use output::TaskOutput;
pub use state::{TaskState, TaskStatus};

//! streamtask - per-stream request tasks for multiplexed connections
//!
//! Each stream of a multiplexed connection becomes an independent [`Task`]
//! that a blocking worker executes as if it were a plain HTTP/1.1
//! connection: request bytes come from the stream's input queue, the
//! response goes to its output queue, and the session learns through a
//! one-shot readiness notification when the response head is available.
//!
//! # Quick Start
//!
//! ```no_run
//! use streamtask::pipeline::Http1Pipeline;
//! use streamtask::protocol::RequestHead;
//! use streamtask::session::{Ownership, Session};
//! use streamtask::task::MasterConnection;
//! use streamtask::{hooks, StreamTaskConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> streamtask::TaskResult<()> {
//! hooks::init_hooks();
//! let connection = MasterConnection::new(
//!     StreamTaskConfig::default(),
//!     Arc::new(Http1Pipeline::echo()),
//! );
//! let mut session = Session::new(connection);
//!
//! session.open_stream(7, &RequestHead::new("GET", "/x"), Ownership::Explicit)?;
//! session.end_stream(7).await?;
//! let response = session.collect_response(7).await?;
//! assert_eq!(response.status, Some(200));
//! session.reap(7).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod task;
pub mod testing;

pub use config::{ConfigError, FilterPolicy, StreamTaskConfig};
pub use error::{TaskError, TaskResult};
pub use protocol::*;
pub use session::{Ownership, Session, StreamResponse};
pub use task::{
    AutoDestroyTask, DestroyError, MasterConnection, ReadyEvent, ReadyKind, Task, TaskHandle,
    TaskState, TaskStatus,
};

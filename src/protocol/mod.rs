//! Stream-level protocol types
//!
//! Request/response metadata exchanged between the session and a task, and
//! the entries carried on the per-stream queues.

pub mod messages;

pub use messages::*;

//! Fault injection engine.
//!
//! The engine listens for one controller at a time, runs the tasks it is sent
//! at their scheduled times on a bounded worker pool, and streams status
//! events back over the same connection.

pub mod command;
pub mod events;
pub mod pool;
pub mod runtime;
pub mod server;
pub mod session;

pub use events::{EventSink, StampedEvent};
pub use pool::{SubmitError, WorkerPool};
pub use runtime::{RunPolicy, TaskState};
pub use server::Engine;
pub use session::{Mastership, SessionManager};

//! Fault injection controller.
//!
//! Drives one injection session: claims every target engine, streams the
//! workload's tasks ahead of their start times, survives transient loss of
//! engines and records every reported status event per host.

pub mod connection;
pub mod recorder;
pub mod retry;
pub mod scheduler;

pub use connection::{ConnectError, HostHandle, HostSettings, HostState, join_session, probe};
pub use recorder::{HostRecord, RecordEvent, Recorder, RecorderHandle};
pub use retry::{ReconnectPolicy, RetryFailure, RetryableError, run_with_retry};
pub use scheduler::{Dispatcher, SessionReport, probe_hosts};

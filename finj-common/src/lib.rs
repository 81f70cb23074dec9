//! Shared types, wire protocol and file formats for the fault injection
//! controller (`finj-controller`) and engine (`finj-engine`).

pub mod auxiliary;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod record;
pub mod testing;
pub mod types;
pub mod util;
pub mod workload;

pub use config::{ConfigError, ExpiredPolicy, FinjConfig};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use protocol::{
    GreetReply, Message, ProtocolError, SessionAck, SessionStart, read_frame, write_frame,
};
pub use types::{
    ERR_NOT_STARTED, EventKind, HostId, SeqNum, SessionEpoch, StatusEvent, Task, unix_now,
    unix_now_millis, until_unix,
};

//! Common types used across the controller and engine.

use serde::{Deserialize, Serialize};

/// Sequence number assigned to each task of a workload.
pub type SeqNum = u64;

/// Error code reported when a task never got to run (spawn failure, expired deadline).
pub const ERR_NOT_STARTED: i32 = -1;

/// Address of a target engine, written as `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name friendly form (`ip_port`), used for per-host result files.
    pub fn file_stem(&self) -> String {
        match self.0.rsplit_once(':') {
            Some((ip, port)) => format!("{}_{}", ip.trim_matches(|c| c == '[' || c == ']'), port),
            None => self.0.clone(),
        }
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one injection session, compared by the engine on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionEpoch(pub u64);

impl std::fmt::Display for SessionEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A described invocation of an external program.
///
/// Read from a workload with a relative `timestamp`; the controller rebases it
/// to an absolute unix time before sending it to an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Shell command string.
    pub args: String,
    /// Start time in seconds (relative in a workload, absolute on the wire).
    pub timestamp: i64,
    /// Run length in seconds; 0 runs the program to natural completion.
    pub duration: u64,
    pub is_fault: bool,
    pub seq_num: SeqNum,
    /// Optional CPU affinity list, passed to numactl as-is.
    #[serde(default)]
    pub cores: Option<String>,
}

impl Task {
    /// Copy of this task with its timestamp shifted by `base` seconds.
    pub fn rebased(&self, base: i64) -> Self {
        Self {
            timestamp: self.timestamp.saturating_add(base),
            ..self.clone()
        }
    }

    /// Absolute end of the task's window, if it has one.
    pub fn window_end(&self) -> Option<i64> {
        (self.duration > 0).then(|| {
            let duration = i64::try_from(self.duration).unwrap_or(i64::MAX);
            self.timestamp.saturating_add(duration)
        })
    }
}

/// Kind of a status event.
///
/// Engine-produced kinds travel over the wire; the `Detected*` and `Session*`
/// kinds are produced by the controller and only ever reach the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "status_start")]
    Start,
    #[serde(rename = "status_restart")]
    Restart,
    #[serde(rename = "status_end")]
    End,
    #[serde(rename = "status_err")]
    Err,
    #[serde(rename = "status_reset")]
    Reset,
    #[serde(rename = "detected_lost")]
    DetectedLost,
    #[serde(rename = "detected_restore")]
    DetectedRestore,
    #[serde(rename = "command_session_s")]
    SessionStart,
    #[serde(rename = "command_session_e")]
    SessionEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "status_start",
            Self::Restart => "status_restart",
            Self::End => "status_end",
            Self::Err => "status_err",
            Self::Reset => "status_reset",
            Self::DetectedLost => "detected_lost",
            Self::DetectedRestore => "detected_restore",
            Self::SessionStart => "command_session_s",
            Self::SessionEnd => "command_session_e",
        }
    }

    /// Whether this kind ends the life of the referenced task.
    pub fn is_task_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Err)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable status record appended to a host's execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub kind: EventKind,
    /// Absolute unix time in seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<i32>,
    /// Captured stdout/stderr, only on terminal events when capture is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl StatusEvent {
    /// Event without a task reference.
    pub fn bare(kind: EventKind, timestamp: i64) -> Self {
        Self {
            kind,
            timestamp,
            task: None,
            error: None,
            output: None,
        }
    }

    /// Event about one task.
    pub fn for_task(kind: EventKind, timestamp: i64, task: &Task) -> Self {
        Self {
            task: Some(task.clone()),
            ..Self::bare(kind, timestamp)
        }
    }

    pub fn with_error(mut self, code: i32) -> Self {
        self.error = Some(code);
        self
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = output;
        self
    }

    pub fn seq_num(&self) -> Option<SeqNum> {
        self.task.as_ref().map(|t| t.seq_num)
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in milliseconds.
pub fn unix_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Time left until the unix second `at`, zero if it has passed.
pub fn until_unix(at: i64) -> std::time::Duration {
    let millis = at.saturating_mul(1000).saturating_sub(unix_now_millis());
    std::time::Duration::from_millis(millis.max(0) as u64)
}

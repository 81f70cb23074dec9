//! Per-host execution logs and task output files.
//!
//! Each host gets one append-only log of status events in the order they were
//! produced. Columns are `timestamp;type;args;seqNum;duration;isFault;cores;error`
//! with `None` for absent values, using the same quoting as workload files.

use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{HostId, SeqNum, StatusEvent};
use crate::workload::{DELIMITER, NONE_VALUE, QUOTE};

pub const LOG_HEADER: [&str; 8] = [
    "timestamp",
    "type",
    "args",
    "seqNum",
    "duration",
    "isFault",
    "cores",
    "error",
];

#[derive(Debug, Error)]
pub enum ExecutionLogError {
    #[error("Cannot create {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write execution log: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `RESULTS_DIR/injection-<workload>-<ip>_<port>.csv`
pub fn injection_log_path(results_dir: &Path, workload: &str, host: &HostId) -> PathBuf {
    results_dir.join(format!("injection-{}-{}.csv", workload, host.file_stem()))
}

/// `RESULTS_DIR/output-<workload>-<ip>_<port>/`
pub fn output_dir(results_dir: &Path, workload: &str, host: &HostId) -> PathBuf {
    results_dir.join(format!("output-{}-{}", workload, host.file_stem()))
}

/// File name for a task's captured output: program basename without
/// `sudo`/`./`, then `_<seqNum>.log`.
pub fn task_output_name(args: &str, seq_num: SeqNum) -> String {
    let program = args
        .split_whitespace()
        .find(|word| *word != "sudo")
        .unwrap_or("task");
    let program = program.trim_start_matches("./");
    let base = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "task".to_string());
    format!("{base}_{seq_num}.log")
}

fn none_or<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| NONE_VALUE.to_string(), |v| v.to_string())
}

fn py_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Append-only writer for one host's status events.
pub struct ExecutionLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    last_timestamp: i64,
    records: u64,
}

impl ExecutionLog {
    /// Create (truncate) the log and write the header row.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ExecutionLogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ExecutionLogError::Create {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(&path).map_err(|source| ExecutionLogError::Create {
            path: path.clone(),
            source,
        })?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(DELIMITER)
            .quote(QUOTE)
            .from_writer(file);
        writer.write_record(LOG_HEADER)?;
        writer.flush()?;
        debug!("Created execution log {}", path.display());

        Ok(Self {
            path,
            writer,
            last_timestamp: i64::MIN,
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append one event and flush. Returns the timestamp actually written,
    /// which never goes below the previous record's.
    pub fn append(&mut self, event: &StatusEvent) -> Result<i64, ExecutionLogError> {
        let timestamp = event.timestamp.max(self.last_timestamp);
        if timestamp != event.timestamp {
            trace!(
                "Clamped {} timestamp {} to {} in {}",
                event.kind,
                event.timestamp,
                timestamp,
                self.path.display()
            );
        }

        let task = event.task.as_ref();
        self.writer.write_record([
            timestamp.to_string(),
            event.kind.as_str().to_string(),
            none_or(task.map(|t| t.args.as_str())),
            none_or(task.map(|t| t.seq_num)),
            none_or(task.map(|t| t.duration)),
            none_or(task.map(|t| py_bool(t.is_fault))),
            none_or(task.and_then(|t| t.cores.as_deref())),
            none_or(event.error),
        ])?;
        self.writer.flush()?;

        self.last_timestamp = timestamp;
        self.records += 1;
        Ok(timestamp)
    }
}

/// Write a task's captured output into `dir`. Returns the file path.
pub fn write_task_output(dir: &Path, event: &StatusEvent) -> Result<Option<PathBuf>, ExecutionLogError> {
    let (Some(task), Some(output)) = (event.task.as_ref(), event.output.as_ref()) else {
        return Ok(None);
    };
    std::fs::create_dir_all(dir).map_err(|source| ExecutionLogError::Create {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(task_output_name(&task.args, task.seq_num));
    std::fs::write(&path, output)?;
    Ok(Some(path))
}

/// One parsed row of an execution log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: i64,
    pub kind: String,
    pub args: Option<String>,
    pub seq_num: Option<SeqNum>,
    pub duration: Option<u64>,
    pub is_fault: Option<bool>,
    pub cores: Option<String>,
    pub error: Option<i32>,
}

/// Read an execution log back, for analysis and tests.
pub fn read_execution_log(path: &Path) -> Result<Vec<LogRecord>, ExecutionLogError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .quote(QUOTE)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |idx: usize| {
            record
                .get(idx)
                .filter(|v| *v != NONE_VALUE)
                .map(str::to_string)
        };
        rows.push(LogRecord {
            timestamp: field(0).and_then(|v| v.parse().ok()).unwrap_or_default(),
            kind: field(1).unwrap_or_default(),
            args: field(2),
            seq_num: field(3).and_then(|v| v.parse().ok()),
            duration: field(4).and_then(|v| v.parse().ok()),
            is_fault: field(5).map(|v| v == "True"),
            cores: field(6),
            error: field(7).and_then(|v| v.parse().ok()),
        });
    }
    Ok(rows)
}

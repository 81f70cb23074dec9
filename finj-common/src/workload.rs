//! Workload files.
//!
//! A workload is a `;`-delimited file (quote character `|`) whose header row
//! names the task columns: `args`, `cores`, `duration`, `isFault`, `seqNum`,
//! `timestamp`, in any order. `None` marks an absent value. Records are read
//! lazily so dispatching can begin before the whole file is parsed.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{SeqNum, Task};

/// Placeholder for absent values in workload and execution-log files.
pub const NONE_VALUE: &str = "None";
pub const DELIMITER: u8 = b';';
pub const QUOTE: u8 = b'|';

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Cannot open workload {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Workload header is missing required column '{0}'")]
    MissingColumn(&'static str),

    #[error("Workload record at line {line} is malformed: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("Workload record at line {line} reuses seqNum {seq_num}")]
    DuplicateSeqNum { line: u64, seq_num: SeqNum },

    #[error("Workload record at line {line} goes back in time ({timestamp} < {previous})")]
    OutOfOrder {
        line: u64,
        timestamp: i64,
        previous: i64,
    },

    #[error("Workload read failed: {0}")]
    Csv(#[from] csv::Error),
}

impl WorkloadError {
    /// Whether the stream can continue after this error.
    pub fn is_record_error(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. } | Self::OutOfOrder { .. } | Self::DuplicateSeqNum { .. }
        )
    }
}

/// Column positions resolved from the header row.
#[derive(Debug, Clone)]
struct Columns {
    args: usize,
    timestamp: usize,
    duration: usize,
    seq_num: usize,
    is_fault: Option<usize>,
    cores: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, WorkloadError> {
        let index: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim(), i))
            .collect();
        let required = |name: &'static str| {
            index
                .get(name)
                .copied()
                .ok_or(WorkloadError::MissingColumn(name))
        };
        Ok(Self {
            args: required("args")?,
            timestamp: required("timestamp")?,
            duration: required("duration")?,
            seq_num: required("seqNum")?,
            is_fault: index.get("isFault").copied(),
            cores: index.get("cores").copied(),
        })
    }
}

/// Lazy, restartable reader of a workload file.
///
/// Yields tasks in file order with their relative timestamps. Malformed
/// records come out as `Err` items and the stream continues after them.
pub struct WorkloadReader {
    path: PathBuf,
    max_tasks: Option<usize>,
    records: csv::StringRecordsIntoIter<File>,
    columns: Columns,
    produced: usize,
    last_timestamp: i64,
    seen: HashSet<SeqNum>,
    done: bool,
}

impl std::fmt::Debug for WorkloadReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadReader")
            .field("path", &self.path)
            .field("max_tasks", &self.max_tasks)
            .field("produced", &self.produced)
            .finish()
    }
}

impl WorkloadReader {
    /// Open a workload, reading at most `max_tasks` valid tasks.
    pub fn open(path: impl AsRef<Path>, max_tasks: Option<usize>) -> Result<Self, WorkloadError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| WorkloadError::Open {
            path: path.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(DELIMITER)
            .quote(QUOTE)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let columns = Columns::from_headers(reader.headers()?)?;
        debug!("Opened workload {} (max tasks: {:?})", path.display(), max_tasks);

        Ok(Self {
            path,
            max_tasks,
            records: reader.into_records(),
            columns,
            produced: 0,
            last_timestamp: 0,
            seen: HashSet::new(),
            done: false,
        })
    }

    /// Start over from the first record.
    pub fn restart(&mut self) -> Result<(), WorkloadError> {
        *self = Self::open(&self.path, self.max_tasks)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Workload name used in result file names (file stem).
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workload".to_string())
    }

    /// Number of valid tasks produced so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    /// Next valid task, logging and skipping malformed records.
    pub fn next_valid(&mut self) -> Option<Task> {
        loop {
            match self.next()? {
                Ok(task) => return Some(task),
                Err(e) if e.is_record_error() => warn!("Skipping workload record: {}", e),
                Err(e) => {
                    warn!("Stopping workload read: {}", e);
                    self.done = true;
                    return None;
                }
            }
        }
    }

    fn parse(&self, record: &csv::StringRecord) -> Result<Task, WorkloadError> {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let malformed = |reason: String| WorkloadError::Malformed { line, reason };
        let field = |idx: usize| record.get(idx).filter(|v| !v.is_empty() && *v != NONE_VALUE);

        let args = field(self.columns.args)
            .ok_or_else(|| malformed("empty args".into()))?
            .to_string();
        let timestamp = field(self.columns.timestamp)
            .and_then(parse_seconds)
            .filter(|t| *t >= 0)
            .ok_or_else(|| malformed("timestamp is not a non-negative number".into()))?;
        let duration = field(self.columns.duration)
            .and_then(parse_seconds)
            .filter(|d| *d >= 0)
            .ok_or_else(|| malformed("duration is not a non-negative number".into()))?
            as u64;
        let seq_num = field(self.columns.seq_num)
            .and_then(|v| v.parse::<SeqNum>().ok())
            .ok_or_else(|| malformed("seqNum is not an unsigned integer".into()))?;
        let is_fault = self
            .columns
            .is_fault
            .and_then(field)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let cores = self.columns.cores.and_then(field).map(str::to_string);

        Ok(Task {
            args,
            timestamp,
            duration,
            is_fault,
            seq_num,
            cores,
        })
    }
}

/// Whole or fractional seconds; fractions are truncated.
fn parse_seconds(value: &str) -> Option<i64> {
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
}

impl Iterator for WorkloadReader {
    type Item = Result<Task, WorkloadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.max_tasks.is_some_and(|max| self.produced >= max) {
            return None;
        }
        let record = match self.records.next()? {
            Ok(record) => record,
            Err(e) => return Some(Err(e.into())),
        };
        let task = match self.parse(&record) {
            Ok(task) => task,
            Err(e) => return Some(Err(e)),
        };
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if task.timestamp < self.last_timestamp {
            return Some(Err(WorkloadError::OutOfOrder {
                line,
                timestamp: task.timestamp,
                previous: self.last_timestamp,
            }));
        }
        if !self.seen.insert(task.seq_num) {
            return Some(Err(WorkloadError::DuplicateSeqNum {
                line,
                seq_num: task.seq_num,
            }));
        }
        self.last_timestamp = task.timestamp;
        self.produced += 1;
        Some(Ok(task))
    }
}

/// Read-ahead view of a workload on the absolute time axis.
///
/// Relative timestamps are rebased onto `base` (session start plus padding)
/// as records are pulled; at most one record is buffered.
#[derive(Debug)]
pub struct AbsoluteWorkload {
    reader: WorkloadReader,
    base: i64,
    peeked: Option<Task>,
}

impl AbsoluteWorkload {
    pub fn new(reader: WorkloadReader, base: i64) -> Self {
        Self {
            reader,
            base,
            peeked: None,
        }
    }

    /// Next task (absolute) without consuming it.
    pub fn peek(&mut self) -> Option<&Task> {
        if self.peeked.is_none() {
            self.peeked = self.reader.next_valid().map(|t| t.rebased(self.base));
        }
        self.peeked.as_ref()
    }

    /// Consume the next task.
    pub fn pop(&mut self) -> Option<Task> {
        self.peek();
        self.peeked.take()
    }

    /// Consume every task whose absolute start is at or before `horizon`.
    pub fn pull_due(&mut self, horizon: i64) -> Vec<Task> {
        let mut due = Vec::new();
        while self.peek().is_some_and(|t| t.timestamp <= horizon) {
            due.extend(self.pop());
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const README_SAMPLE: &str = "\
timestamp;duration;seqNum;isFault;cores;args
0;1719;1;False;0;./hpl lininput
587;291;2;True;0;./leak 291 l
1171;244;3;True;0;sudo ./cpufreq 244
";

    fn workload(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".csv").unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_sample_workload_in_order() {
        let file = workload(README_SAMPLE);
        let tasks: Vec<Task> = WorkloadReader::open(file.path(), None)
            .unwrap()
            .map(Result::unwrap)
            .collect();

        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].args, "./hpl lininput");
        assert!(!tasks[0].is_fault);
        assert_eq!(tasks[1].timestamp, 587);
        assert!(tasks[1].is_fault);
        assert_eq!(tasks[2].args, "sudo ./cpufreq 244");
        assert_eq!(tasks[2].cores.as_deref(), Some("0"));
    }

    #[test]
    fn test_column_order_follows_header_and_none_values() {
        let file = workload("args;cores;duration;isFault;seqNum;timestamp\n|sleep 1; echo hi|;None;0;True;7;5\n");
        let mut reader = WorkloadReader::open(file.path(), None).unwrap();
        let task = reader.next().unwrap().unwrap();
        assert_eq!(task.args, "sleep 1; echo hi");
        assert_eq!(task.cores, None);
        assert_eq!(task.duration, 0);
        assert_eq!(task.seq_num, 7);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_malformed_records_are_skipped_not_fatal() {
        let file = workload(
            "timestamp;duration;seqNum;isFault;args\n\
             0;10;1;False;./a\n\
             soon;10;2;False;./b\n\
             5;-3;3;False;./c\n\
             6;10;4;False;None\n\
             7;10;5;False;./e\n",
        );
        let mut reader = WorkloadReader::open(file.path(), None).unwrap();
        let results: Vec<_> = reader.by_ref().collect();
        assert_eq!(results.len(), 5);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 3);
        assert!(results[1].as_ref().unwrap_err().is_record_error());
        assert_eq!(reader.produced(), 2);
    }

    #[test]
    fn test_out_of_order_record_is_rejected() {
        let file = workload("timestamp;duration;seqNum;args\n10;1;1;./a\n5;1;2;./b\n12;1;3;./c\n");
        let mut reader = WorkloadReader::open(file.path(), None).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(
            reader.next().unwrap(),
            Err(WorkloadError::OutOfOrder { previous: 10, .. })
        ));
        assert_eq!(reader.next_valid().unwrap().seq_num, 3);
    }

    #[test]
    fn test_duplicate_seq_num_is_skipped() {
        let file = workload("timestamp;duration;seqNum;args\n0;1;1;./a\n3;1;1;./b\n4;1;2;./c\n");
        let mut reader = WorkloadReader::open(file.path(), None).unwrap();
        assert_eq!(reader.next_valid().unwrap().args, "./a");
        assert!(matches!(
            reader.next().unwrap(),
            Err(WorkloadError::DuplicateSeqNum { seq_num: 1, .. })
        ));
        assert_eq!(reader.next_valid().unwrap().seq_num, 2);
        assert_eq!(reader.produced(), 2);
    }

    #[test]
    fn test_max_tasks_and_restart() {
        let file = workload(README_SAMPLE);
        let mut reader = WorkloadReader::open(file.path(), Some(2)).unwrap();
        assert_eq!(reader.by_ref().count(), 2);
        assert!(reader.next().is_none());

        reader.restart().unwrap();
        assert_eq!(reader.next_valid().unwrap().seq_num, 1);
    }

    #[test]
    fn test_missing_required_column() {
        let file = workload("timestamp;duration;args\n0;1;./a\n");
        let err = WorkloadReader::open(file.path(), None).unwrap_err();
        assert!(matches!(err, WorkloadError::MissingColumn("seqNum")));
    }

    #[test]
    fn test_fractional_seconds_truncate() {
        assert_eq!(parse_seconds("12"), Some(12));
        assert_eq!(parse_seconds("12.9"), Some(12));
        assert_eq!(parse_seconds("NaN"), None);
        assert_eq!(parse_seconds("later"), None);
    }

    #[test]
    fn test_absolute_view_rebases_and_pulls_due() {
        let file = workload(README_SAMPLE);
        let reader = WorkloadReader::open(file.path(), None).unwrap();
        let mut view = AbsoluteWorkload::new(reader, 1_000);

        assert_eq!(view.peek().map(|t| t.timestamp), Some(1_000));
        let due = view.pull_due(1_600);
        assert_eq!(
            due.iter().map(|t| t.seq_num).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(view.pop().map(|t| t.timestamp), Some(2_171));
        assert!(view.peek().is_none());
    }

    #[test]
    fn test_name_is_file_stem() {
        let file = workload(README_SAMPLE);
        let reader = WorkloadReader::open(file.path(), None).unwrap();
        let stem = file.path().file_stem().unwrap().to_string_lossy();
        assert_eq!(reader.name(), stem);
    }
}

//! Execution-log writer and pending-task bookkeeping.
//!
//! A single recorder task owns every host's execution log. Host connections
//! and the dispatcher feed it [`RecordEvent`]s over one channel, so records
//! for a host land in the order they were produced. The recorder also keeps
//! the per-host set of dispatched-but-not-terminal seqNums and publishes
//! their total on a watch channel for the dispatcher's end-of-session check.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use finj_common::record::{ExecutionLog, injection_log_path, output_dir, write_task_output};
use finj_common::{EventKind, HostId, SeqNum, StatusEvent, unix_now};

/// Something that happened to a host during the session.
#[derive(Debug)]
pub enum RecordEvent {
    /// The host acknowledged the session start.
    Joined(HostId),
    /// A command was handed to the host's connection.
    Dispatched { host: HostId, seq_num: SeqNum },
    /// A status event reported by the host's engine.
    Status { host: HostId, event: StatusEvent },
    Lost(HostId),
    Restored(HostId),
    /// Commands that will never reach the engine.
    Released { host: HostId, seq_nums: Vec<SeqNum> },
    /// The host came back without the session and will never report the
    /// tasks it was running.
    Forgotten(HostId),
    /// Retrying gave up; nothing more is expected from the host.
    Disconnected(HostId),
    /// The session is over for this host.
    Ended(HostId),
    /// Answered once every earlier event has been processed.
    Sync(oneshot::Sender<()>),
}

/// Cloneable sender side of the recorder.
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<RecordEvent>,
    outstanding: watch::Receiver<usize>,
}

impl RecorderHandle {
    pub fn record(&self, event: RecordEvent) {
        if self.tx.send(event).is_err() {
            debug!("Recorder already stopped");
        }
    }

    /// Wait until everything recorded so far has been applied.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        self.record(RecordEvent::Sync(tx));
        let _ = rx.await;
    }

    /// Number of dispatched tasks not yet known to be finished.
    pub fn outstanding(&self) -> watch::Receiver<usize> {
        self.outstanding.clone()
    }
}

/// Per-host outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub host: HostId,
    pub log_path: PathBuf,
    pub records: u64,
    pub outputs: usize,
}

struct HostLog {
    log: Option<ExecutionLog>,
    output_dir: PathBuf,
    pending: HashSet<SeqNum>,
    disconnected: bool,
    outputs: usize,
    log_path: PathBuf,
}

impl HostLog {
    fn write(&mut self, host: &HostId, event: &StatusEvent) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        if let Err(e) = log.append(event) {
            warn!("Cannot record {} for {}: {}", event.kind, host, e);
        }
    }
}

pub struct Recorder {
    results_dir: PathBuf,
    workload: String,
    log_outputs: bool,
    hosts: HashMap<HostId, HostLog>,
    order: Vec<HostId>,
    outstanding: watch::Sender<usize>,
}

impl Recorder {
    /// Start the recorder task. It runs until every handle is dropped and
    /// then returns a summary per joined host.
    pub fn spawn(
        results_dir: impl Into<PathBuf>,
        workload: impl Into<String>,
        log_outputs: bool,
    ) -> (RecorderHandle, JoinHandle<Vec<HostRecord>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outstanding_tx, outstanding_rx) = watch::channel(0);
        let recorder = Recorder {
            results_dir: results_dir.into(),
            workload: workload.into(),
            log_outputs,
            hosts: HashMap::new(),
            order: Vec::new(),
            outstanding: outstanding_tx,
        };
        let handle = RecorderHandle {
            tx,
            outstanding: outstanding_rx,
        };
        (handle, tokio::spawn(recorder.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RecordEvent>) -> Vec<HostRecord> {
        while let Some(event) = rx.recv().await {
            self.apply(event);
        }
        self.summary()
    }

    fn apply(&mut self, event: RecordEvent) {
        match event {
            RecordEvent::Joined(host) => self.joined(host),
            RecordEvent::Dispatched { host, seq_num } => {
                if let Some(entry) = self.hosts.get_mut(&host)
                    && !entry.disconnected
                {
                    entry.pending.insert(seq_num);
                }
            }
            RecordEvent::Status { host, event } => self.status(&host, event),
            RecordEvent::Lost(host) => self.marker(&host, EventKind::DetectedLost),
            RecordEvent::Restored(host) => self.marker(&host, EventKind::DetectedRestore),
            RecordEvent::Released { host, seq_nums } => {
                if let Some(entry) = self.hosts.get_mut(&host) {
                    for seq_num in &seq_nums {
                        entry.pending.remove(seq_num);
                    }
                    debug!("Released {} unsent task(s) for {}", seq_nums.len(), host);
                }
            }
            RecordEvent::Forgotten(host) => self.forgotten(&host),
            RecordEvent::Disconnected(host) => {
                if let Some(entry) = self.hosts.get_mut(&host) {
                    entry.disconnected = true;
                    if !entry.pending.is_empty() {
                        info!("{} task(s) on {} will not be reported", entry.pending.len(), host);
                    }
                    entry.pending.clear();
                }
            }
            RecordEvent::Ended(host) => self.marker(&host, EventKind::SessionEnd),
            RecordEvent::Sync(done) => {
                let _ = done.send(());
            }
        }
        self.publish();
    }

    fn joined(&mut self, host: HostId) {
        if self.hosts.contains_key(&host) {
            return;
        }
        let log_path = injection_log_path(&self.results_dir, &self.workload, &host);
        let log = match ExecutionLog::create(&log_path) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("Execution log for {} disabled: {}", host, e);
                None
            }
        };
        let mut entry = HostLog {
            log,
            output_dir: output_dir(&self.results_dir, &self.workload, &host),
            pending: HashSet::new(),
            disconnected: false,
            outputs: 0,
            log_path,
        };
        entry.write(&host, &StatusEvent::bare(EventKind::SessionStart, unix_now()));
        self.order.push(host.clone());
        self.hosts.insert(host, entry);
    }

    /// Stand in for the `status_reset` a crashed engine could not send.
    fn forgotten(&mut self, host: &HostId) {
        let Some(entry) = self.hosts.get_mut(host) else {
            return;
        };
        if entry.pending.is_empty() {
            return;
        }
        info!("{} task(s) on {} were lost with the engine", entry.pending.len(), host);
        entry.pending.clear();
        entry.write(host, &StatusEvent::bare(EventKind::Reset, unix_now()));
    }

    fn status(&mut self, host: &HostId, event: StatusEvent) {
        let Some(entry) = self.hosts.get_mut(host) else {
            warn!("Status from unknown host {}", host);
            return;
        };
        entry.write(host, &event);

        match event.kind {
            EventKind::End | EventKind::Err => {
                if let Some(seq_num) = event.seq_num() {
                    entry.pending.remove(&seq_num);
                }
            }
            EventKind::Reset => {
                info!("{} reset its task pool", host);
                entry.pending.clear();
            }
            _ => {}
        }

        if self.log_outputs && event.output.is_some() {
            match write_task_output(&entry.output_dir, &event) {
                Ok(Some(path)) => {
                    entry.outputs += 1;
                    debug!("Saved task output to {}", path.display());
                }
                Ok(None) => {}
                Err(e) => warn!("Cannot save task output for {}: {}", host, e),
            }
        }
    }

    fn marker(&mut self, host: &HostId, kind: EventKind) {
        if let Some(entry) = self.hosts.get_mut(host) {
            entry.write(host, &StatusEvent::bare(kind, unix_now()));
        }
    }

    fn publish(&self) {
        let total = self.hosts.values().map(|h| h.pending.len()).sum::<usize>();
        self.outstanding.send_if_modified(|current| {
            let changed = *current != total;
            *current = total;
            changed
        });
    }

    fn summary(&self) -> Vec<HostRecord> {
        self.order
            .iter()
            .filter_map(|host| {
                let entry = self.hosts.get(host)?;
                Some(HostRecord {
                    host: host.clone(),
                    log_path: entry.log_path.clone(),
                    records: entry.log.as_ref().map_or(0, ExecutionLog::records),
                    outputs: entry.outputs,
                })
            })
            .collect()
    }
}

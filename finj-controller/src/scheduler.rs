//! Injection session driver.
//!
//! The [`Dispatcher`] claims every configured engine, streams the workload to
//! the joined ones ahead of each task's deadline and closes the session once
//! the workload is exhausted and every dispatched task has finished, or when
//! it is told to stop.

use anyhow::{Context, Result, bail};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finj_common::workload::{AbsoluteWorkload, WorkloadReader};
use finj_common::{
    FinjConfig, GreetReply, HostId, SessionEpoch, SessionStart, Task, unix_now, unix_now_millis,
    until_unix,
};

use crate::connection::{
    ConnectError, HostHandle, HostSettings, HostState, join_session, probe,
};
use crate::recorder::{HostRecord, RecordEvent, Recorder, RecorderHandle};

/// Outcome of one injection session.
#[derive(Debug)]
pub struct SessionReport {
    pub epoch: SessionEpoch,
    /// Session start, unix seconds.
    pub started_at: i64,
    pub joined: Vec<HostId>,
    /// Tasks pulled from the workload and handed to the hosts.
    pub dispatched: usize,
    /// The session was cut short by [`Dispatcher::stop_token`].
    pub stopped: bool,
    pub final_states: Vec<(HostId, HostState)>,
    pub records: Vec<HostRecord>,
}

pub struct Dispatcher {
    config: FinjConfig,
    hosts: Vec<HostId>,
    stop: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: FinjConfig, hosts: Vec<HostId>) -> Self {
        Self {
            config,
            hosts,
            stop: CancellationToken::new(),
        }
    }

    /// Cancelling this token skips the rest of the workload and ends the
    /// session right away.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// When a command for a task starting at `timestamp` goes out. `None`
    /// means immediately.
    fn send_time(&self, timestamp: i64) -> Option<i64> {
        if self.config.pre_send_interval < 0 {
            None
        } else {
            Some(timestamp.saturating_sub(self.config.pre_send_interval))
        }
    }

    /// Latest task start whose command is due at `now`.
    fn send_horizon(&self, now: i64) -> i64 {
        if self.config.pre_send_interval < 0 {
            i64::MAX
        } else {
            now.saturating_add(self.config.pre_send_interval)
        }
    }

    pub async fn run(self, workload: WorkloadReader) -> Result<SessionReport> {
        let started_ms = unix_now_millis();
        let epoch = SessionEpoch(u64::try_from(started_ms).unwrap_or_default());
        let started_at = started_ms.div_euclid(1000);
        let start = SessionStart {
            epoch,
            timestamp: started_at,
            fresh: false,
        };

        let (recorder, recorder_task) = Recorder::spawn(
            self.config.results_dir.clone(),
            workload.name(),
            self.config.log_outputs,
        );

        info!(
            "Starting session {} for workload {} on {} host(s)",
            epoch,
            workload.name(),
            self.hosts.len()
        );
        let settings = HostSettings::from_config(&self.config);
        let hosts = join_hosts(&self.hosts, &start, settings, &recorder).await;
        if hosts.is_empty() {
            drop(recorder);
            let _ = recorder_task.await;
            bail!("No host joined session {}", epoch);
        }
        let joined: Vec<HostId> = hosts.iter().map(|h| h.host().clone()).collect();
        info!("{} of {} host(s) joined", joined.len(), self.hosts.len());

        let padding = i64::try_from(self.config.workload_padding).unwrap_or(i64::MAX);
        let mut workload = AbsoluteWorkload::new(workload, started_at.saturating_add(padding));
        let mut dispatched = 0;
        let mut stopped = false;

        'workload: loop {
            let Some(send_at) = workload.peek().map(|task| self.send_time(task.timestamp)) else {
                break;
            };
            if let Some(at) = send_at
                && at > unix_now()
            {
                tokio::select! {
                    _ = tokio::time::sleep(until_unix(at)) => {}
                    _ = self.stop.cancelled() => {
                        stopped = true;
                        break;
                    }
                }
            }
            for task in workload.pull_due(self.send_horizon(unix_now())) {
                if self.stop.is_cancelled() {
                    stopped = true;
                    break 'workload;
                }
                dispatch(&hosts, &recorder, &task);
                dispatched += 1;
            }
            if hosts.iter().all(HostHandle::is_finished) {
                warn!("Every host has dropped out, abandoning the workload");
                break;
            }
        }

        if stopped {
            info!("Session {} stopped after {} task(s)", epoch, dispatched);
        } else {
            stopped = self.wait_for_completion(&recorder, dispatched).await;
        }

        for host in &hosts {
            host.end_session();
        }
        let mut final_states = Vec::with_capacity(hosts.len());
        for host in hosts {
            let id = host.host().clone();
            let state = host.join().await;
            recorder.record(RecordEvent::Ended(id.clone()));
            final_states.push((id, state));
        }

        drop(recorder);
        let records = recorder_task.await.context("recorder task failed")?;
        info!("Session {} ended", epoch);

        Ok(SessionReport {
            epoch,
            started_at,
            joined,
            dispatched,
            stopped,
            final_states,
            records,
        })
    }

    /// Wait until no dispatched task is pending. Returns true if stopped
    /// first.
    async fn wait_for_completion(&self, recorder: &RecorderHandle, dispatched: usize) -> bool {
        recorder.sync().await;
        let mut outstanding = recorder.outstanding();
        let remaining = *outstanding.borrow();
        info!(
            "Workload exhausted after {} task(s), {} still running",
            dispatched, remaining
        );

        tokio::select! {
            result = outstanding.wait_for(|n| *n == 0) => {
                if result.is_err() {
                    warn!("Recorder stopped before all tasks finished");
                }
                false
            }
            _ = self.stop.cancelled() => {
                info!("Stopped while waiting for running tasks");
                true
            }
        }
    }
}

fn dispatch(hosts: &[HostHandle], recorder: &RecorderHandle, task: &Task) {
    debug!(
        "Dispatching task {} ({}) due at {}",
        task.seq_num, task.args, task.timestamp
    );
    for host in hosts {
        recorder.record(RecordEvent::Dispatched {
            host: host.host().clone(),
            seq_num: task.seq_num,
        });
        if !host.dispatch(task.clone()) {
            recorder.record(RecordEvent::Released {
                host: host.host().clone(),
                seq_nums: vec![task.seq_num],
            });
        }
    }
}

/// Handshake with every host concurrently. Hosts that fail are logged and
/// left out; the rest keep their configured order.
async fn join_hosts(
    hosts: &[HostId],
    start: &SessionStart,
    settings: HostSettings,
    recorder: &RecorderHandle,
) -> Vec<HostHandle> {
    let mut joins = JoinSet::new();
    for host in hosts {
        let host = host.clone();
        let start = start.clone();
        let recorder = recorder.clone();
        joins.spawn(async move {
            let result = join_session(host.clone(), start, settings, recorder).await;
            (host, result)
        });
    }

    let mut joined = Vec::with_capacity(hosts.len());
    while let Some(result) = joins.join_next().await {
        match result {
            Ok((_, Ok(handle))) => joined.push(handle),
            Ok((host, Err(e))) => warn!("{} did not join the session: {}", host, e),
            Err(e) => warn!("Join task failed: {}", e),
        }
    }
    joined.sort_by_key(|handle| hosts.iter().position(|h| h == handle.host()));
    joined
}

/// Greet every host concurrently and collect the replies in host order.
pub async fn probe_hosts(
    hosts: &[HostId],
    wait: Duration,
) -> Vec<(HostId, Result<GreetReply, ConnectError>)> {
    let mut probes = JoinSet::new();
    for (index, host) in hosts.iter().enumerate() {
        let host = host.clone();
        probes.spawn(async move {
            let reply = probe(&host, wait).await;
            (index, host, reply)
        });
    }

    let mut replies = Vec::with_capacity(hosts.len());
    while let Some(result) = probes.join_next().await {
        match result {
            Ok(entry) => replies.push(entry),
            Err(e) => warn!("Probe task failed: {}", e),
        }
    }
    replies.sort_by_key(|(index, _, _)| *index);
    replies
        .into_iter()
        .map(|(_, host, reply)| (host, reply))
        .collect()
}

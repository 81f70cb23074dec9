//! Bounded pool of task workers.
//!
//! At most `MAX_REQUESTS` tasks hold a worker at once, whether they are
//! still waiting for their start time or already running. The registry holds
//! one entry per non-terminal run, keyed by sequence number, so a sequence
//! number can never run twice concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, futures::Notified};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finj_common::{ERR_NOT_STARTED, FinjConfig, SeqNum, Task};

use crate::events::EventSink;
use crate::runtime::{RunPolicy, RunReport, TaskState, run_task};

/// Why a task was not given a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("all {0} workers are busy")]
    PoolExhausted(usize),

    #[error("task {seq_num} expired at {timestamp} (now {now})")]
    Expired {
        seq_num: SeqNum,
        timestamp: i64,
        now: i64,
    },

    #[error("task {0} is already running")]
    Duplicate(SeqNum),

    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Registry entry for a non-terminal run.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: Task,
    pub state: TaskState,
    cancel: CancellationToken,
}

struct PoolInner {
    policy: RunPolicy,
    capacity: usize,
    skip_expired: bool,
    workers: Arc<Semaphore>,
    runs: Mutex<HashMap<SeqNum, TaskRun>>,
    sink: EventSink,
    freed: Notify,
    accepting: AtomicBool,
}

impl PoolInner {
    fn runs(&self) -> MutexGuard<'_, HashMap<SeqNum, TaskRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, seq_num: SeqNum, state: TaskState) {
        if let Some(run) = self.runs().get_mut(&seq_num) {
            run.state = state;
        }
    }

    /// Drop the registry entry, then report the terminal state.
    fn finish(&self, task: &Task, report: RunReport) {
        self.runs().remove(&task.seq_num);
        match report.state {
            TaskState::Completed => {
                debug!("Task {} completed after {} spawn(s)", task.seq_num, report.spawns);
                self.sink.task_end(task, report.output);
            }
            TaskState::Error(code) => {
                debug!("Task {} failed with {}", task.seq_num, code);
                self.sink.task_error(task, code, report.output);
            }
            TaskState::Killed => debug!("Task {} killed", task.seq_num),
            other => warn!("Task {} finished in non-terminal state {:?}", task.seq_num, other),
        }
    }
}

/// Cloneable handle to the worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.inner.capacity)
            .field("active", &self.active_count())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: &FinjConfig, sink: EventSink) -> Self {
        Self::with_policy(
            RunPolicy::from_config(config),
            config.max_requests,
            config.skip_expired,
            sink,
        )
    }

    pub fn with_policy(policy: RunPolicy, capacity: usize, skip_expired: bool, sink: EventSink) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                policy,
                capacity,
                skip_expired,
                workers: Arc::new(Semaphore::new(capacity)),
                runs: Mutex::new(HashMap::new()),
                sink,
                freed: Notify::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of non-terminal runs.
    pub fn active_count(&self) -> usize {
        self.inner.runs().len()
    }

    pub fn state_of(&self, seq_num: SeqNum) -> Option<TaskState> {
        self.inner.runs().get(&seq_num).map(|run| run.state)
    }

    pub fn sink(&self) -> &EventSink {
        &self.inner.sink
    }

    /// Resolves the next time a worker is released. Create it before
    /// checking for capacity so no release is missed.
    pub fn worker_freed(&self) -> Notified<'_> {
        self.inner.freed.notified()
    }

    /// With `SKIP_EXPIRED`, reject a task whose start time is already behind
    /// `now` and report it with `status_err` -1.
    pub fn check_expired(&self, task: &Task, now: i64) -> Result<(), SubmitError> {
        if !self.inner.skip_expired || now <= task.timestamp {
            return Ok(());
        }
        info!(
            "Task {} expired {}s ago, not starting",
            task.seq_num,
            now.saturating_sub(task.timestamp)
        );
        self.inner.sink.task_error(task, ERR_NOT_STARTED, None);
        Err(SubmitError::Expired {
            seq_num: task.seq_num,
            timestamp: task.timestamp,
            now,
        })
    }

    /// Hand `task` to a free worker, unless it expired (see
    /// [`check_expired`](Self::check_expired)).
    pub fn submit(&self, task: Task, now: i64) -> Result<(), SubmitError> {
        let inner = &self.inner;
        let mut runs = inner.runs();

        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        if runs.contains_key(&task.seq_num) {
            return Err(SubmitError::Duplicate(task.seq_num));
        }
        self.check_expired(&task, now)?;
        let permit = inner
            .workers
            .clone()
            .try_acquire_owned()
            .map_err(|_| SubmitError::PoolExhausted(inner.capacity))?;

        let cancel = CancellationToken::new();
        runs.insert(
            task.seq_num,
            TaskRun {
                task: task.clone(),
                state: TaskState::Queued,
                cancel: cancel.clone(),
            },
        );
        drop(runs);
        debug!("Task {} ('{}') accepted for {}", task.seq_num, task.args, task.timestamp);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let seq_num = task.seq_num;
            let report = run_task(&task, &inner.policy, &inner.sink, &cancel, |state| {
                inner.set_state(seq_num, state)
            })
            .await;
            inner.finish(&task, report);
            drop(permit);
            inner.freed.notify_waiters();
        });
        Ok(())
    }

    /// Wait until no run is left.
    pub async fn wait_idle(&self) {
        loop {
            let freed = self.worker_freed();
            if self.active_count() == 0 {
                return;
            }
            freed.await;
        }
    }

    /// Kill every run, wait for them to be gone and emit one `status_reset`.
    /// Killed runs produce no events of their own. Returns how many were killed.
    pub async fn reset(&self) -> usize {
        let killed = {
            let runs = self.inner.runs();
            for run in runs.values() {
                run.cancel.cancel();
            }
            runs.len()
        };
        self.wait_idle().await;
        self.inner.sink.reset();
        info!("Worker pool reset ({} task(s) killed)", killed);
        killed
    }

    /// Stop accepting tasks, then either kill the remaining runs or let them
    /// finish on their own.
    pub async fn shutdown(&self, abrupt: bool) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let active = self.active_count();
        if active == 0 {
            return;
        }
        if abrupt {
            info!("Killing {} running task(s)", active);
            self.reset().await;
        } else {
            info!("Waiting for {} running task(s) to finish", active);
            self.wait_idle().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::SinkItem;
    use finj_common::{EventKind, unix_now};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn task(seq_num: SeqNum, args: &str) -> Task {
        Task {
            args: args.to_string(),
            timestamp: unix_now(),
            duration: 0,
            is_fault: false,
            seq_num,
            cores: None,
        }
    }

    fn pool(capacity: usize) -> (WorkerPool, UnboundedReceiver<SinkItem>) {
        let (sink, rx) = EventSink::channel();
        let policy = RunPolicy {
            retry_tasks: true,
            ..RunPolicy::default()
        };
        (WorkerPool::with_policy(policy, capacity, true, sink), rx)
    }

    fn events(rx: &mut UnboundedReceiver<SinkItem>) -> Vec<(EventKind, Option<SeqNum>, Option<i32>)> {
        let mut out = Vec::new();
        while let Ok(SinkItem::Event(e)) = rx.try_recv() {
            out.push((e.event.kind, e.event.seq_num(), e.event.error));
        }
        out
    }

    async fn within<F: std::future::Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(10), future)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (pool, _rx) = pool(2);
        let now = unix_now();
        pool.submit(task(1, "sleep 30"), now).unwrap();
        pool.submit(task(2, "sleep 30"), now).unwrap();
        assert_eq!(pool.submit(task(3, "sleep 30"), now), Err(SubmitError::PoolExhausted(2)));
        assert_eq!(pool.active_count(), 2);
        within(pool.reset()).await;
    }

    #[tokio::test]
    async fn test_duplicate_seq_num_rejected_while_running() {
        let (pool, _rx) = pool(4);
        let now = unix_now();
        pool.submit(task(1, "sleep 30"), now).unwrap();
        assert_eq!(pool.submit(task(1, "sleep 30"), now), Err(SubmitError::Duplicate(1)));
        within(pool.reset()).await;
    }

    #[tokio::test]
    async fn test_expired_task_reported_and_never_occupies_a_worker() {
        let (pool, mut rx) = pool(1);
        let mut late = task(9, "true");
        late.timestamp = unix_now() - 10;

        let err = pool.submit(late, unix_now()).unwrap_err();
        assert!(matches!(err, SubmitError::Expired { seq_num: 9, .. }));
        assert_eq!(pool.active_count(), 0);
        assert_eq!(events(&mut rx), vec![(EventKind::Err, Some(9), Some(ERR_NOT_STARTED))]);
    }

    #[tokio::test]
    async fn test_task_at_current_second_is_not_expired() {
        let (pool, _rx) = pool(1);
        let now = unix_now();
        let mut t = task(1, "true");
        t.timestamp = now;
        assert!(pool.submit(t, now).is_ok());
        within(pool.wait_idle()).await;
    }

    #[tokio::test]
    async fn test_reset_kills_silently_then_reports_once() {
        let (pool, mut rx) = pool(4);
        let now = unix_now();
        pool.submit(task(1, "sleep 30"), now).unwrap();
        pool.submit(task(2, "sleep 30"), now).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(within(pool.reset()).await, 2);
        assert_eq!(pool.active_count(), 0);
        let after: Vec<EventKind> = events(&mut rx).into_iter().map(|e| e.0).collect();
        assert!(!after.contains(&EventKind::End));
        assert!(!after.contains(&EventKind::Err));
        assert_eq!(after.iter().filter(|k| **k == EventKind::Reset).count(), 1);
        assert_eq!(after.last(), Some(&EventKind::Reset));
    }

    #[tokio::test]
    async fn test_terminal_events_follow_registry_removal() {
        let (pool, mut rx) = pool(2);
        let now = unix_now();
        pool.submit(task(1, "true"), now).unwrap();
        pool.submit(task(2, "sh -c 'exit 4'"), now).unwrap();
        within(pool.wait_idle()).await;

        let seen = events(&mut rx);
        assert!(seen.contains(&(EventKind::End, Some(1), None)));
        assert!(seen.contains(&(EventKind::Err, Some(2), Some(4))));
        assert_eq!(pool.state_of(1), None);
    }

    #[tokio::test]
    async fn test_worker_freed_after_completion() {
        let (pool, _rx) = pool(1);
        let now = unix_now();
        let freed = pool.worker_freed();
        pool.submit(task(1, "sleep 0.2"), now).unwrap();
        assert!(pool.submit(task(2, "true"), now).is_err());

        within(freed).await;
        assert!(pool.submit(task(2, "true"), unix_now()).is_ok());
        within(pool.wait_idle()).await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_and_refuses_new_work() {
        let (pool, mut rx) = pool(2);
        pool.submit(task(1, "sleep 0.3"), unix_now()).unwrap();
        within(pool.shutdown(false)).await;

        let kinds: Vec<EventKind> = events(&mut rx).into_iter().map(|e| e.0).collect();
        assert_eq!(kinds, vec![EventKind::Start, EventKind::End]);
        assert_eq!(pool.submit(task(2, "true"), unix_now()), Err(SubmitError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_abrupt_shutdown_resets() {
        let (pool, mut rx) = pool(2);
        pool.submit(task(1, "sleep 30"), unix_now()).unwrap();
        within(pool.shutdown(true)).await;

        let kinds: Vec<EventKind> = events(&mut rx).into_iter().map(|e| e.0).collect();
        assert_eq!(kinds.last(), Some(&EventKind::Reset));
        assert_eq!(pool.active_count(), 0);
    }
}

//! Running one task to a terminal state.
//!
//! A run waits for the task's start time, spawns the program, and then races
//! three things: the child exiting, the task's window closing, and the run
//! being cancelled. Programs that exit early inside their window are respawned
//! when retries are enabled, and the run time of every segment counts against
//! the window.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use finj_common::util::CommandError;
use finj_common::{
    ERR_NOT_STARTED, EventKind, ExpiredPolicy, FinjConfig, Task, unix_now_millis, until_unix,
};

use crate::command::{CorePolicy, build_argv};
use crate::events::EventSink;

/// How long to wait for output readers after a natural exit.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Lifecycle state of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Accepted, waiting for its start time.
    Queued,
    Running,
    /// Exited early inside its window; about to be respawned.
    Restarting,
    Completed,
    Error(i32),
    /// Cancelled by a reset or an abrupt shutdown.
    Killed,
}

/// Execution knobs shared by every run on an engine.
#[derive(Debug, Clone, Default)]
pub struct RunPolicy {
    pub retry_tasks: bool,
    pub retry_on_error: bool,
    pub log_outputs: bool,
    pub enable_root: bool,
    pub expired: ExpiredPolicy,
    pub cores: CorePolicy,
}

impl RunPolicy {
    pub fn from_config(config: &FinjConfig) -> Self {
        Self {
            retry_tasks: config.retry_tasks,
            retry_on_error: config.retry_tasks_on_error,
            log_outputs: config.log_outputs,
            enable_root: config.enable_root,
            expired: config.expired_policy,
            cores: CorePolicy::from_config(config),
        }
    }
}

/// How much run time a task gets once it actually starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Duration 0: run to natural completion.
    Unbounded,
    Limited(Duration),
    /// Backdated window that closed before the task could start.
    Elapsed,
}

/// Budget for `task` if it starts at `now_ms`.
pub fn run_budget(task: &Task, expired: ExpiredPolicy, now_ms: i64) -> Budget {
    let Some(window_end) = task.window_end() else {
        return Budget::Unbounded;
    };
    let full = Duration::from_secs(task.duration);
    let late = now_ms > task.timestamp.saturating_mul(1000);
    match expired {
        ExpiredPolicy::Backdate if late => {
            let left = window_end.saturating_mul(1000).saturating_sub(now_ms);
            match u64::try_from(left) {
                Ok(left) if left > 0 => Budget::Limited(Duration::from_millis(left).min(full)),
                _ => Budget::Elapsed,
            }
        }
        _ => Budget::Limited(full),
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub state: TaskState,
    /// Captured stdout and stderr across every segment, when enabled.
    pub output: Option<String>,
    pub spawns: u32,
    pub run_time: Duration,
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Run `task` until it reaches a terminal state.
///
/// Emits `status_start` and `status_restart` through `sink`; the terminal
/// event is left to the caller so it can update its bookkeeping first.
/// `on_state` sees every non-terminal transition.
pub async fn run_task<F>(
    task: &Task,
    policy: &RunPolicy,
    sink: &EventSink,
    cancel: &CancellationToken,
    mut on_state: F,
) -> RunReport
where
    F: FnMut(TaskState),
{
    let mut report = RunReport {
        state: TaskState::Queued,
        output: None,
        spawns: 0,
        run_time: Duration::ZERO,
    };

    let wait = until_unix(task.timestamp);
    if !wait.is_zero() {
        debug!("Task {} waits {:?} for its start time", task.seq_num, wait);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => {
                report.state = TaskState::Killed;
                return report;
            }
        }
    }

    let budget = match run_budget(task, policy.expired, unix_now_millis()) {
        Budget::Elapsed => {
            debug!("Task {} window already closed, completing without a run", task.seq_num);
            report.state = TaskState::Completed;
            return report;
        }
        Budget::Unbounded => None,
        Budget::Limited(budget) => Some(budget),
    };

    let mut capture = policy.log_outputs.then(OutputCapture::default);

    loop {
        let mut child = match spawn(task, policy) {
            Ok(child) => child,
            Err(e) => {
                warn!("Task {} ('{}') could not start: {}", task.seq_num, task.args, e);
                report.state = TaskState::Error(ERR_NOT_STARTED);
                report.output = capture.map(OutputCapture::into_text);
                return report;
            }
        };
        if let Some(capture) = capture.as_mut() {
            capture.attach(&mut child);
        }

        let kind = if report.spawns == 0 {
            EventKind::Start
        } else {
            EventKind::Restart
        };
        report.spawns += 1;
        on_state(TaskState::Running);
        sink.task_event(kind, task);
        debug!("Task {} running (pid {:?}, spawn {})", task.seq_num, child.id(), report.spawns);

        let remaining = budget.map(|b| b.saturating_sub(report.run_time));
        let segment = Instant::now();
        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = sleep_for(remaining) => Exit::WindowClosed,
            _ = cancel.cancelled() => Exit::Cancelled,
        };
        report.run_time += segment.elapsed();

        let cancelled = matches!(exit, Exit::Cancelled);
        let status = match exit {
            Exit::WindowClosed | Exit::Cancelled => {
                if let Err(e) = kill_process_tree(&mut child).await {
                    warn!("Failed to kill task {}: {}", task.seq_num, e);
                }
                if let Some(capture) = capture.as_mut() {
                    capture.abort();
                }
                if cancelled {
                    debug!("Task {} killed", task.seq_num);
                    report.state = TaskState::Killed;
                } else {
                    debug!("Task {} window closed after {:?}", task.seq_num, report.run_time);
                    report.state = TaskState::Completed;
                    report.output = capture.map(OutputCapture::into_text);
                }
                return report;
            }
            Exit::Status(Ok(status)) => status,
            Exit::Status(Err(e)) => {
                warn!("Lost track of task {}: {}", task.seq_num, e);
                report.state = TaskState::Error(ERR_NOT_STARTED);
                return report;
            }
        };

        if let Some(capture) = capture.as_mut() {
            capture.drain().await;
        }
        let code = exit_code(status);
        let window_open = budget.is_some_and(|b| report.run_time < b);
        if window_open && policy.retry_tasks && (code == 0 || policy.retry_on_error) {
            debug!(
                "Task {} exited with {} after {:?}, restarting",
                task.seq_num, code, report.run_time
            );
            on_state(TaskState::Restarting);
            continue;
        }

        report.state = if code == 0 {
            TaskState::Completed
        } else {
            TaskState::Error(code)
        };
        report.output = capture.map(OutputCapture::into_text);
        return report;
    }
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    WindowClosed,
    Cancelled,
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn spawn(task: &Task, policy: &RunPolicy) -> Result<Child, SpawnError> {
    let argv = build_argv(task, &policy.cores, policy.enable_root)?;
    let output = || {
        if policy.log_outputs {
            Stdio::piped()
        } else {
            Stdio::null()
        }
    };
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(output())
        .stderr(output())
        .kill_on_drop(true);
    // Own process group, so a kill reaches everything the task forked.
    #[cfg(unix)]
    command.process_group(0);
    Ok(command.spawn()?)
}

/// SIGKILL the task's process group, then kill and reap the child itself.
async fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok())
            && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            debug!("Cannot signal process group {}: {}", pid, e);
        }
    }
    child.kill().await
}

/// Exit code, or the negated signal number for a signal death.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    ERR_NOT_STARTED
}

/// Accumulates a child's stdout and stderr across respawns.
#[derive(Default)]
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    fn attach(&mut self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(tokio::spawn(pump(stdout, self.buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(tokio::spawn(pump(stderr, self.buffer.clone())));
        }
    }

    /// Let readers hit EOF; abandon any held open by a grandchild.
    async fn drain(&mut self) {
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN, reader).await.is_err() {
                abort.abort();
            }
        }
    }

    fn abort(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }

    fn into_text(mut self) -> String {
        self.abort();
        let bytes = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn pump<R>(mut source: R, buffer: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finj_common::unix_now;

    fn task_at(timestamp: i64, duration: u64) -> Task {
        Task {
            args: "true".into(),
            timestamp,
            duration,
            is_fault: false,
            seq_num: 1,
            cores: None,
        }
    }

    #[test]
    fn test_zero_duration_is_unbounded_even_when_late() {
        let task = task_at(100, 0);
        assert_eq!(run_budget(&task, ExpiredPolicy::Backdate, 500_000), Budget::Unbounded);
        assert_eq!(
            run_budget(&task, ExpiredPolicy::StartImmediately, 500_000),
            Budget::Unbounded
        );
    }

    #[test]
    fn test_start_immediately_keeps_full_duration() {
        let task = task_at(100, 30);
        assert_eq!(
            run_budget(&task, ExpiredPolicy::StartImmediately, 120_000),
            Budget::Limited(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_backdate_keeps_window_end() {
        let task = task_at(100, 30);
        assert_eq!(
            run_budget(&task, ExpiredPolicy::Backdate, 110_500),
            Budget::Limited(Duration::from_millis(19_500))
        );
        assert_eq!(run_budget(&task, ExpiredPolicy::Backdate, 130_000), Budget::Elapsed);
        assert_eq!(
            run_budget(&task, ExpiredPolicy::Backdate, 100_000),
            Budget::Limited(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_huge_values_do_not_overflow_budget() {
        let task = task_at(i64::MAX - 5, u64::MAX);
        assert_eq!(
            run_budget(&task, ExpiredPolicy::Backdate, i64::MAX),
            Budget::Limited(Duration::from_secs(u64::MAX))
        );
        let late = task_at(100, u64::MAX);
        assert!(matches!(
            run_budget(&late, ExpiredPolicy::Backdate, 200_000),
            Budget::Limited(left) if left > Duration::from_secs(1_000_000)
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::events::SinkItem;
        use tokio::sync::mpsc::UnboundedReceiver;

        fn task(args: &str, duration: u64) -> Task {
            Task {
                args: args.to_string(),
                timestamp: unix_now() - 1,
                duration,
                is_fault: true,
                seq_num: 42,
                cores: None,
            }
        }

        fn policy() -> RunPolicy {
            RunPolicy {
                retry_tasks: true,
                log_outputs: true,
                ..RunPolicy::default()
            }
        }

        fn kinds(rx: &mut UnboundedReceiver<SinkItem>) -> Vec<EventKind> {
            let mut kinds = Vec::new();
            while let Ok(SinkItem::Event(e)) = rx.try_recv() {
                kinds.push(e.event.kind);
            }
            kinds
        }

        async fn run(task: &Task, policy: &RunPolicy) -> (RunReport, Vec<EventKind>, Vec<TaskState>) {
            let (sink, mut rx) = EventSink::channel();
            let mut states = Vec::new();
            let report = run_task(task, policy, &sink, &CancellationToken::new(), |s| states.push(s)).await;
            (report, kinds(&mut rx), states)
        }

        #[tokio::test]
        async fn test_natural_completion_without_window() {
            let (report, events, _) = run(&task("true", 0), &policy()).await;
            assert_eq!(report.state, TaskState::Completed);
            assert_eq!(report.spawns, 1);
            assert_eq!(events, vec![EventKind::Start]);
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_error_without_retry_on_error() {
            let (report, events, _) = run(&task("sh -c 'exit 3'", 10), &policy()).await;
            assert_eq!(report.state, TaskState::Error(3));
            assert_eq!(report.spawns, 1);
            assert_eq!(events, vec![EventKind::Start]);
        }

        #[tokio::test]
        async fn test_signal_death_reports_negated_signal() {
            let (report, _, _) = run(&task("sh -c 'kill -9 $$'", 0), &policy()).await;
            assert_eq!(report.state, TaskState::Error(-9));
        }

        #[tokio::test]
        async fn test_window_close_kills_and_completes() {
            let started = Instant::now();
            let (report, events, _) = run(&task("sleep 30", 1), &policy()).await;
            assert_eq!(report.state, TaskState::Completed);
            assert!(report.run_time >= Duration::from_secs(1));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert_eq!(events, vec![EventKind::Start]);
        }

        /// Whether `pid` is gone or only a zombie left for init to reap.
        #[cfg(target_os = "linux")]
        fn is_dead(pid: &str) -> bool {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => stat
                    .rsplit_once(") ")
                    .is_some_and(|(_, rest)| rest.starts_with('Z')),
                Err(_) => true,
            }
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_window_close_kills_forked_children() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("child.pid");
            let args = format!("sh -c 'sleep 30 & echo $! > {}; wait'", pid_file.display());

            let mut task = task(&args, 2);
            task.timestamp = unix_now();
            let (report, _, _) = run(&task, &policy()).await;
            assert_eq!(report.state, TaskState::Completed);

            let pid = std::fs::read_to_string(&pid_file).unwrap();
            let pid = pid.trim();
            let gone = tokio::time::timeout(Duration::from_secs(5), async {
                while !is_dead(pid) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            assert!(gone.is_ok(), "forked child {pid} outlived its task");
        }

        #[tokio::test]
        async fn test_early_exit_restarts_until_window_closes() {
            let (report, events, states) = run(&task("sleep 0.3", 1), &policy()).await;
            assert_eq!(report.state, TaskState::Completed);
            assert!(report.spawns >= 2);
            assert!(report.run_time >= Duration::from_secs(1));
            assert_eq!(events[0], EventKind::Start);
            assert!(events[1..].iter().all(|k| *k == EventKind::Restart));
            assert_eq!(events.len() as u32, report.spawns);
            assert!(states.contains(&TaskState::Restarting));
        }

        #[tokio::test]
        async fn test_early_exit_completes_when_retries_disabled() {
            let policy = RunPolicy {
                retry_tasks: false,
                ..policy()
            };
            let (report, _, _) = run(&task("sleep 0.1", 5), &policy).await;
            assert_eq!(report.state, TaskState::Completed);
            assert_eq!(report.spawns, 1);
        }

        #[tokio::test]
        async fn test_errors_restart_when_retry_on_error() {
            let policy = RunPolicy {
                retry_on_error: true,
                ..policy()
            };
            let (report, _, _) = run(&task("sh -c 'sleep 0.4; exit 1'", 1), &policy).await;
            assert_eq!(report.state, TaskState::Completed);
            assert!(report.spawns >= 2);
        }

        #[tokio::test]
        async fn test_spawn_failure_reports_not_started() {
            let (report, events, _) = run(&task("/nonexistent/finj-program", 5), &policy()).await;
            assert_eq!(report.state, TaskState::Error(ERR_NOT_STARTED));
            assert_eq!(report.spawns, 0);
            assert!(events.is_empty());
        }

        #[tokio::test]
        async fn test_cancel_kills_without_events() {
            let (sink, mut rx) = EventSink::channel();
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let report = run_task(&task("sleep 30", 0), &policy(), &sink, &cancel, |_| {}).await;
            assert_eq!(report.state, TaskState::Killed);
            assert_eq!(report.output, None);
            assert_eq!(kinds(&mut rx), vec![EventKind::Start]);
        }

        #[tokio::test]
        async fn test_cancel_while_queued() {
            let (sink, mut rx) = EventSink::channel();
            let cancel = CancellationToken::new();
            cancel.cancel();
            let mut future = task("true", 0);
            future.timestamp = unix_now() + 60;

            let report = run_task(&future, &policy(), &sink, &cancel, |_| {}).await;
            assert_eq!(report.state, TaskState::Killed);
            assert_eq!(report.spawns, 0);
            assert!(kinds(&mut rx).is_empty());
        }

        #[tokio::test]
        async fn test_output_capture_collects_both_streams() {
            let (report, _, _) = run(&task("sh -c 'echo hello; echo oops >&2'", 0), &policy()).await;
            let output = report.output.unwrap();
            assert!(output.contains("hello"));
            assert!(output.contains("oops"));
        }

        #[tokio::test]
        async fn test_no_capture_when_disabled() {
            let policy = RunPolicy {
                log_outputs: false,
                ..policy()
            };
            let (report, _, _) = run(&task("echo hello", 0), &policy).await;
            assert_eq!(report.output, None);
        }

        #[tokio::test]
        async fn test_waits_for_start_time() {
            let mut future = task("true", 0);
            future.timestamp = unix_now() + 2;
            let started = Instant::now();
            let (report, _, _) = run(&future, &policy()).await;
            assert_eq!(report.state, TaskState::Completed);
            assert!(started.elapsed() >= Duration::from_secs(1));
        }

        #[tokio::test]
        async fn test_backdated_elapsed_window_never_spawns() {
            let policy = RunPolicy {
                expired: ExpiredPolicy::Backdate,
                ..policy()
            };
            let mut late = task("sleep 30", 5);
            late.timestamp = unix_now() - 60;
            let (report, events, _) = run(&late, &policy).await;
            assert_eq!(report.state, TaskState::Completed);
            assert_eq!(report.spawns, 0);
            assert!(events.is_empty());
        }
    }
}

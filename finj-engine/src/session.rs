//! Mastership, recovery and event routing.
//!
//! An engine is mastered by at most one controller connection at a time,
//! identified by the session epoch it presented. When the master connection
//! drops, the engine either resets at once or, with
//! `RECOVER_AFTER_DISCONNECT`, holds its tasks for `RETRY_INTERVAL` waiting for
//! the same epoch to come back. Status events are routed to the connection
//! mastering the epoch they were produced under; while nobody masters it they
//! are buffered, and once a newer session takes over they are dropped.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use finj_common::{
    FinjConfig, GreetReply, Message, SeqNum, SessionAck, SessionEpoch, SessionStart, Task,
    unix_now,
};

use crate::events::{SinkItem, StampedEvent};
use crate::pool::{SubmitError, WorkerPool};

/// Events kept for a disconnected master before the oldest are dropped.
const MAX_BUFFERED_EVENTS: usize = 100_000;

pub type ConnId = u64;

/// Write side of one controller connection.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: ConnId,
    pub peer: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnHandle {
    pub fn new(id: ConnId, peer: SocketAddr, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, peer, tx }
    }

    /// Queue a message for the connection's writer. False once it is gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Observable mastership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mastership {
    Idle,
    Mastered(SessionEpoch),
    AwaitingRecovery(SessionEpoch),
}

enum State {
    Idle {
        last_epoch: Option<SessionEpoch>,
    },
    Mastered {
        epoch: SessionEpoch,
        conn: ConnHandle,
    },
    AwaitingRecovery {
        epoch: SessionEpoch,
        generation: u64,
    },
}

impl State {
    /// Epoch whose events are still wanted by someone.
    fn current_epoch(&self) -> Option<SessionEpoch> {
        match self {
            Self::Idle { last_epoch } => *last_epoch,
            Self::Mastered { epoch, .. } | Self::AwaitingRecovery { epoch, .. } => Some(*epoch),
        }
    }

    fn is_master(&self, conn: ConnId) -> bool {
        matches!(self, Self::Mastered { conn: master, .. } if master.id == conn)
    }
}

/// Outcome of a session start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Reject,
    /// Take over the existing session without touching its tasks.
    Recover,
    /// Begin a new session, resetting leftovers of any previous one.
    Fresh,
}

fn admit(state: &State, conn: ConnId, epoch: SessionEpoch, recover: bool) -> Admission {
    match state {
        State::Mastered {
            epoch: current,
            conn: master,
        } => {
            if *current == epoch {
                if recover { Admission::Recover } else { Admission::Fresh }
            } else if master.id == conn {
                Admission::Fresh
            } else {
                Admission::Reject
            }
        }
        State::AwaitingRecovery { epoch: current, .. } if *current == epoch && recover => {
            Admission::Recover
        }
        State::AwaitingRecovery { .. } | State::Idle { .. } => Admission::Fresh,
    }
}

struct Session {
    state: State,
    backlog: VecDeque<Task>,
    seen: HashSet<SeqNum>,
    buffered: VecDeque<StampedEvent>,
    generation: u64,
}

impl Session {
    fn buffer(&mut self, event: StampedEvent) {
        if self.buffered.len() >= MAX_BUFFERED_EVENTS {
            warn!("Event buffer full, dropping oldest event");
            self.buffered.pop_front();
        }
        self.buffered.push_back(event);
    }

    /// Hand `conn` every buffered event of `epoch`; drop the rest.
    fn flush_to(&mut self, conn: &ConnHandle, epoch: SessionEpoch) {
        let mut flushed = 0;
        for stamped in self.buffered.drain(..) {
            if stamped.epoch == Some(epoch) {
                conn.send(Message::Status(stamped.event));
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!("Flushed {} buffered event(s) to {}", flushed, conn.peer);
        }
    }
}

/// Engine-side session state shared by every connection.
pub struct SessionManager {
    session: Mutex<Session>,
    pool: WorkerPool,
    recover: bool,
    recovery_window: Duration,
    terminate: CancellationToken,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("pool", &self.pool)
            .field("recover", &self.recover)
            .finish()
    }
}

impl SessionManager {
    /// `terminate` is cancelled when the master asks the engine to exit.
    pub fn new(pool: WorkerPool, config: &FinjConfig, terminate: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Session {
                state: State::Idle { last_epoch: None },
                backlog: VecDeque::new(),
                seen: HashSet::new(),
                buffered: VecDeque::new(),
                generation: 0,
            }),
            pool,
            recover: config.recover_after_disconnect,
            recovery_window: config.retry_interval(),
            terminate,
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn mastership(&self) -> Mastership {
        match &self.session.lock().await.state {
            State::Idle { .. } => Mastership::Idle,
            State::Mastered { epoch, .. } => Mastership::Mastered(*epoch),
            State::AwaitingRecovery { epoch, .. } => Mastership::AwaitingRecovery(*epoch),
        }
    }

    pub async fn backlog_len(&self) -> usize {
        self.session.lock().await.backlog.len()
    }

    /// Handle one message read from `conn`.
    pub async fn handle(self: &Arc<Self>, conn: &ConnHandle, message: Message) {
        trace!("{} from {}", message.name(), conn.peer);
        match message {
            Message::SessionStart(start) => self.start_session(conn, start).await,
            Message::SessionEnd { epoch } => self.end_session(conn, epoch).await,
            Message::TaskCommand(task) => self.task_command(conn, task).await,
            Message::Greet => self.greet(conn).await,
            Message::Terminate => self.terminate(conn).await,
            other => warn!("Ignoring unexpected {} from {}", other.name(), conn.peer),
        }
    }

    async fn start_session(&self, conn: &ConnHandle, start: SessionStart) {
        let mut session = self.session.lock().await;
        let epoch = start.epoch;
        let known = session.state.current_epoch() == Some(epoch);
        let admission = admit(&session.state, conn.id, epoch, self.recover && !start.fresh);

        let ack = |accepted, recovered| {
            Message::SessionAck(SessionAck {
                epoch,
                accepted,
                recovered,
                known: accepted && known,
            })
        };

        match admission {
            Admission::Reject => {
                warn!(
                    "Rejecting session {} from {}: engine is mastered by another session",
                    epoch, conn.peer
                );
                conn.send(ack(false, false));
            }
            Admission::Recover => {
                session.generation += 1;
                session.state = State::Mastered {
                    epoch,
                    conn: conn.clone(),
                };
                info!(
                    "Session {} recovered by {} ({} task(s) kept)",
                    epoch,
                    conn.peer,
                    self.pool.active_count()
                );
                conn.send(ack(true, true));
                session.flush_to(conn, epoch);
            }
            Admission::Fresh => {
                session.generation += 1;
                self.pool.sink().set_epoch(Some(epoch));
                if self.pool.active_count() > 0 || !session.backlog.is_empty() {
                    info!("New session {} replaces leftover tasks, resetting", epoch);
                    session.backlog.clear();
                    self.pool.reset().await;
                }
                session.seen.clear();
                session.state = State::Mastered {
                    epoch,
                    conn: conn.clone(),
                };
                info!("Session {} started by {}", epoch, conn.peer);
                conn.send(ack(true, false));
                session.flush_to(conn, epoch);
            }
        }
    }

    async fn end_session(&self, conn: &ConnHandle, epoch: SessionEpoch) {
        let mut session = self.session.lock().await;
        let accepted = matches!(
            &session.state,
            State::Mastered { epoch: current, conn: master } if master.id == conn.id && *current == epoch
        );
        if accepted {
            session.generation += 1;
            session.state = State::Idle {
                last_epoch: Some(epoch),
            };
            info!("Session {} ended by {}", epoch, conn.peer);
        } else {
            warn!("Ignoring end of session {} from non-master {}", epoch, conn.peer);
        }
        conn.send(Message::SessionAck(SessionAck {
            epoch,
            accepted,
            recovered: false,
            known: accepted,
        }));
    }

    async fn task_command(&self, conn: &ConnHandle, task: Task) {
        let mut session = self.session.lock().await;
        if !session.state.is_master(conn.id) {
            warn!("Ignoring task {} from non-master {}", task.seq_num, conn.peer);
            return;
        }
        conn.send(Message::TaskAck {
            seq_num: task.seq_num,
        });
        if !session.seen.insert(task.seq_num) {
            debug!("Task {} already received, acknowledged again", task.seq_num);
            return;
        }
        if !session.backlog.is_empty() {
            if self.pool.check_expired(&task, unix_now()).is_ok() {
                session.backlog.push_back(task);
            }
            return;
        }
        if let Some(task) = self.try_submit(task) {
            debug!("Pool full, task {} waits in the backlog", task.seq_num);
            session.backlog.push_back(task);
        }
    }

    /// Submit `task`; hand it back if no worker is free.
    fn try_submit(&self, task: Task) -> Option<Task> {
        match self.pool.submit(task.clone(), unix_now()) {
            Ok(()) | Err(SubmitError::Expired { .. }) => None,
            Err(SubmitError::PoolExhausted(_)) => Some(task),
            Err(e @ (SubmitError::Duplicate(_) | SubmitError::ShuttingDown)) => {
                debug!("Dropping task {}: {}", task.seq_num, e);
                None
            }
        }
    }

    async fn greet(&self, conn: &ConnHandle) {
        let session = self.session.lock().await;
        conn.send(Message::GreetReply(GreetReply {
            active_tasks: self.pool.active_count(),
            mastered: matches!(session.state, State::Mastered { .. }),
        }));
    }

    async fn terminate(&self, conn: &ConnHandle) {
        let session = self.session.lock().await;
        if session.state.is_master(conn.id) {
            info!("Termination requested by {}", conn.peer);
            self.terminate.cancel();
        } else {
            warn!("Ignoring termination request from non-master {}", conn.peer);
        }
    }

    /// Called once the reader of connection `id` has stopped.
    pub async fn connection_closed(self: &Arc<Self>, id: ConnId) {
        let mut session = self.session.lock().await;
        let epoch = match &session.state {
            State::Mastered { epoch, conn } if conn.id == id => *epoch,
            _ => return,
        };
        session.generation += 1;
        let generation = session.generation;

        if self.recover {
            info!(
                "Master of session {} disconnected, holding {} task(s) for {:?}",
                epoch,
                self.pool.active_count(),
                self.recovery_window
            );
            session.state = State::AwaitingRecovery { epoch, generation };
            let manager = Arc::clone(self);
            let window = self.recovery_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                manager.recovery_expired(epoch, generation).await;
            });
        } else {
            info!("Master of session {} disconnected", epoch);
            session.state = State::Idle {
                last_epoch: Some(epoch),
            };
            self.reset_leftovers(&mut session).await;
        }
    }

    async fn recovery_expired(&self, epoch: SessionEpoch, generation: u64) {
        let mut session = self.session.lock().await;
        let waiting = matches!(
            session.state,
            State::AwaitingRecovery { epoch: e, generation: g } if e == epoch && g == generation
        );
        if !waiting {
            return;
        }
        info!("Session {} was not recovered in time", epoch);
        session.state = State::Idle {
            last_epoch: Some(epoch),
        };
        self.reset_leftovers(&mut session).await;
    }

    async fn reset_leftovers(&self, session: &mut Session) {
        if self.pool.active_count() == 0 && session.backlog.is_empty() {
            return;
        }
        session.backlog.clear();
        session.seen.clear();
        self.pool.reset().await;
    }

    async fn route(&self, stamped: StampedEvent) {
        let mut session = self.session.lock().await;
        match &session.state {
            State::Mastered { epoch, conn } if stamped.epoch == Some(*epoch) => {
                if conn.send(Message::Status(stamped.event.clone())) {
                    return;
                }
            }
            State::Mastered { .. } => {
                trace!("Dropping {} of a superseded session", stamped.event.kind);
                return;
            }
            state if stamped.epoch.is_some() && stamped.epoch == state.current_epoch() => {}
            _ => {
                trace!("Dropping {} with no session to deliver to", stamped.event.kind);
                return;
            }
        }
        session.buffer(stamped);
    }

    /// Deliver everything the pool emits. Runs until the sink is dropped.
    pub async fn forward_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SinkItem>) {
        while let Some(item) = events.recv().await {
            match item {
                SinkItem::Event(stamped) => self.route(stamped).await,
                SinkItem::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Move backlogged tasks into the pool as workers free up.
    pub async fn pump_backlog(self: Arc<Self>, stop: CancellationToken) {
        loop {
            let freed = self.pool.worker_freed();
            self.drain_backlog().await;
            tokio::select! {
                _ = freed => {}
                _ = stop.cancelled() => return,
            }
        }
    }

    async fn drain_backlog(&self) {
        let mut session = self.session.lock().await;
        while let Some(task) = session.backlog.pop_front() {
            if let Some(task) = self.try_submit(task) {
                session.backlog.push_front(task);
                break;
            }
        }
    }

    /// Stop taking work, let the pool wind down, and deliver its last events.
    pub async fn shutdown(&self, abrupt: bool) {
        {
            let mut session = self.session.lock().await;
            if !session.backlog.is_empty() {
                info!("Discarding {} backlogged task(s)", session.backlog.len());
                session.backlog.clear();
            }
        }
        self.pool.shutdown(abrupt).await;
        self.pool.sink().flush().await;

        let mut session = self.session.lock().await;
        session.generation += 1;
        let last_epoch = session.state.current_epoch();
        session.state = State::Idle { last_epoch };
    }
}

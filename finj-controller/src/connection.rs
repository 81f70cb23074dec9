//! One controller-to-engine connection.
//!
//! Every joined host gets its own [`HostConnection`] task. Commands reach it
//! through an unbounded queue, and a separate reader task per socket feeds
//! incoming frames back, so a stalled host never holds up the dispatcher or
//! the other hosts.
//!
//! A command stays in the connection's outbox from the moment it is queued
//! until the engine acknowledges it. When the socket fails the connection
//! goes `Lost`, keeps queuing new commands and retries on the
//! [`ReconnectPolicy`] schedule. On restore the outbox is replayed in order
//! if the engine kept the session; otherwise the outbox is dropped. An engine
//! that no longer knows the session (it crashed and came back) cannot report
//! the reset of its tasks, so the connection records one on its behalf.

use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use finj_common::{
    FinjConfig, GreetReply, HostId, Message, ProtocolError, SeqNum, SessionAck, SessionEpoch,
    SessionStart, Task, read_frame, write_frame,
};

use crate::recorder::{RecordEvent, RecorderHandle};
use crate::retry::{ReconnectPolicy, RetryableError, run_with_retry};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("No answer within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Engine is mastered by another session (ours is {0})")]
    Rejected(SessionEpoch),
}

impl RetryableError for ConnectError {
    fn is_retryable(&self) -> bool {
        !matches!(self, ConnectError::Rejected(_))
    }
}

/// Connection-level knobs shared by every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSettings {
    /// Handshake and write deadline.
    pub session_wait: Duration,
    pub reconnect: ReconnectPolicy,
    /// Replay unacknowledged commands after a recovered reconnect.
    pub recover: bool,
}

impl HostSettings {
    pub fn from_config(config: &FinjConfig) -> Self {
        Self {
            session_wait: config.session_wait(),
            reconnect: ReconnectPolicy::from_config(config),
            recover: config.recover_after_disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Connected,
    Lost,
    /// Retrying gave up; the host takes no further part in the session.
    Disconnected,
    Ended,
}

#[derive(Debug)]
enum HostCommand {
    Dispatch(Task),
    EndSession,
}

/// Dispatcher-side handle of a joined host.
pub struct HostHandle {
    host: HostId,
    commands: mpsc::UnboundedSender<HostCommand>,
    state: watch::Receiver<HostState>,
    task: JoinHandle<HostState>,
}

impl HostHandle {
    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&mut self, state: HostState) -> bool {
        self.state.wait_for(|current| *current == state).await.is_ok()
    }

    /// Queue a command. Returns false once the connection has stopped.
    pub fn dispatch(&self, task: Task) -> bool {
        self.commands.send(HostCommand::Dispatch(task)).is_ok()
    }

    pub fn end_session(&self) {
        let _ = self.commands.send(HostCommand::EndSession);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the connection task and return its final state.
    pub async fn join(self) -> HostState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!("Connection task for {} failed: {}", self.host, e);
                HostState::Disconnected
            }
        }
    }
}

/// Live socket to an engine: owned write half plus the reader task's queue.
struct Link {
    writer: OwnedWriteHalf,
    inbound: mpsc::UnboundedReceiver<Message>,
    reader: JoinHandle<()>,
    write_timeout: Duration,
}

impl Link {
    async fn send(&mut self, message: &Message) -> Result<(), ConnectError> {
        match timeout(self.write_timeout, write_frame(&mut self.writer, message)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectError::Timeout(self.write_timeout)),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn spawn_reader(
    host: HostId,
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!("{} closed the connection", host);
                    return;
                }
                Err(ProtocolError::Json(e)) => {
                    warn!("Ignoring malformed message from {}: {}", host, e)
                }
                Err(e) => {
                    debug!("Read from {} failed: {}", host, e);
                    return;
                }
            }
        }
    })
}

async fn read_session_ack(
    reader: &mut OwnedReadHalf,
    epoch: SessionEpoch,
) -> Result<SessionAck, ConnectError> {
    loop {
        match read_frame(reader).await? {
            Some(Message::SessionAck(ack)) if ack.epoch == epoch => return Ok(ack),
            Some(other) => debug!("Skipping {} before the session ack", other.name()),
            None => return Err(ConnectError::Closed),
        }
    }
}

/// Connect and claim the engine for `start.epoch`, all within `wait`.
async fn handshake(
    host: HostId,
    start: SessionStart,
    wait: Duration,
) -> Result<(Link, SessionAck), ConnectError> {
    let deadline = Instant::now() + wait;
    let stream = timeout_at(deadline, TcpStream::connect(host.as_str()))
        .await
        .map_err(|_| ConnectError::Timeout(wait))??;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Cannot set TCP_NODELAY for {}: {}", host, e);
    }
    let (mut reader, mut writer) = stream.into_split();

    let epoch = start.epoch;
    write_frame(&mut writer, &Message::SessionStart(start)).await?;
    let ack = timeout_at(deadline, read_session_ack(&mut reader, epoch))
        .await
        .map_err(|_| ConnectError::Timeout(wait))??;
    if !ack.accepted {
        return Err(ConnectError::Rejected(epoch));
    }

    let (tx, inbound) = mpsc::unbounded_channel();
    let link = Link {
        writer,
        inbound,
        reader: spawn_reader(host, reader, tx),
        write_timeout: wait,
    };
    Ok((link, ack))
}

async fn read_greet_reply(stream: &mut TcpStream) -> Result<GreetReply, ConnectError> {
    loop {
        match read_frame(stream).await? {
            Some(Message::GreetReply(reply)) => return Ok(reply),
            Some(other) => debug!("Skipping {} while probing", other.name()),
            None => return Err(ConnectError::Closed),
        }
    }
}

/// Greet an engine without touching its session.
pub async fn probe(host: &HostId, wait: Duration) -> Result<GreetReply, ConnectError> {
    let deadline = Instant::now() + wait;
    let mut stream = timeout_at(deadline, TcpStream::connect(host.as_str()))
        .await
        .map_err(|_| ConnectError::Timeout(wait))??;
    write_frame(&mut stream, &Message::Greet).await?;
    timeout_at(deadline, read_greet_reply(&mut stream))
        .await
        .map_err(|_| ConnectError::Timeout(wait))?
}

/// Claim `host` for the session and start its connection task.
///
/// With recovery off every session start, reconnects included, asks the
/// engine to drop whatever it kept for the epoch.
pub async fn join_session(
    host: HostId,
    start: SessionStart,
    settings: HostSettings,
    recorder: RecorderHandle,
) -> Result<HostHandle, ConnectError> {
    let start = SessionStart {
        fresh: !settings.recover,
        ..start
    };
    let (link, ack) = handshake(host.clone(), start.clone(), settings.session_wait).await?;
    if ack.recovered {
        info!("{} rejoined session {} with its tasks intact", host, start.epoch);
    } else {
        info!("{} joined session {}", host, start.epoch);
    }
    recorder.record(RecordEvent::Joined(host.clone()));

    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(HostState::Connected);
    let connection = HostConnection {
        host: host.clone(),
        start,
        settings,
        recorder,
        commands,
        outbox: VecDeque::new(),
        state: state_tx,
    };
    Ok(HostHandle {
        host,
        commands: commands_tx,
        state,
        task: tokio::spawn(connection.run(link)),
    })
}

enum Served {
    Ended,
    Lost(String),
}

enum Reconnect {
    Restored(Link, SessionAck),
    Ended,
    GaveUp,
}

struct HostConnection {
    host: HostId,
    start: SessionStart,
    settings: HostSettings,
    recorder: RecorderHandle,
    commands: mpsc::UnboundedReceiver<HostCommand>,
    /// Queued or sent, not yet acknowledged. In dispatch order.
    outbox: VecDeque<Task>,
    state: watch::Sender<HostState>,
}

impl HostConnection {
    async fn run(mut self, mut link: Link) -> HostState {
        let mut replay_failure = None;
        loop {
            let reason = match replay_failure.take() {
                Some(reason) => reason,
                None => match self.serve(&mut link).await {
                    Served::Ended => return self.finished(HostState::Ended),
                    Served::Lost(reason) => reason,
                },
            };
            drop(link);

            warn!("Lost connection to {}: {}", self.host, reason);
            self.state.send_replace(HostState::Lost);
            self.recorder.record(RecordEvent::Lost(self.host.clone()));

            match self.reconnect().await {
                Reconnect::Restored(restored, ack) => {
                    link = restored;
                    self.recorder.record(RecordEvent::Restored(self.host.clone()));
                    if self.settings.recover && ack.recovered {
                        if let Err(e) = self.replay(&mut link).await {
                            replay_failure = Some(e.to_string());
                            continue;
                        }
                    } else {
                        self.release_outbox();
                        if !ack.known {
                            warn!(
                                "{} lost session {} without reporting it",
                                self.host, self.start.epoch
                            );
                            self.recorder.record(RecordEvent::Forgotten(self.host.clone()));
                        }
                    }
                    self.state.send_replace(HostState::Connected);
                }
                Reconnect::Ended => {
                    self.release_outbox();
                    return self.finished(HostState::Ended);
                }
                Reconnect::GaveUp => {
                    self.recorder.record(RecordEvent::Disconnected(self.host.clone()));
                    return self.finished(HostState::Disconnected);
                }
            }
        }
    }

    fn finished(&self, state: HostState) -> HostState {
        self.state.send_replace(state);
        state
    }

    async fn serve(&mut self, link: &mut Link) -> Served {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(HostCommand::Dispatch(task)) => {
                        let message = Message::TaskCommand(task.clone());
                        self.outbox.push_back(task);
                        if let Err(e) = link.send(&message).await {
                            return Served::Lost(e.to_string());
                        }
                    }
                    Some(HostCommand::EndSession) | None => {
                        self.end_session(link).await;
                        return Served::Ended;
                    }
                },
                message = link.inbound.recv() => match message {
                    Some(message) => self.on_message(message),
                    None => return Served::Lost("connection closed".to_string()),
                },
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::TaskAck { seq_num } => {
                if let Some(index) = self.outbox.iter().position(|t| t.seq_num == seq_num) {
                    self.outbox.remove(index);
                }
            }
            Message::Status(event) => self.recorder.record(RecordEvent::Status {
                host: self.host.clone(),
                event,
            }),
            other => debug!("Ignoring {} from {}", other.name(), self.host),
        }
    }

    /// Send the session end and keep recording until it is acknowledged.
    async fn end_session(&mut self, link: &mut Link) {
        let epoch = self.start.epoch;
        if let Err(e) = link.send(&Message::SessionEnd { epoch }).await {
            warn!("Cannot end session on {}: {}", self.host, e);
            return;
        }
        let deadline = Instant::now() + self.settings.session_wait;
        loop {
            match timeout_at(deadline, link.inbound.recv()).await {
                Ok(Some(Message::SessionAck(ack))) if ack.epoch == epoch => {
                    debug!("{} released session {}", self.host, epoch);
                    return;
                }
                Ok(Some(message)) => self.on_message(message),
                Ok(None) => return,
                Err(_) => {
                    warn!("{} did not acknowledge the session end", self.host);
                    return;
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Reconnect {
        let since = Instant::now();
        let policy = self.settings.reconnect;
        let wait = self.settings.session_wait;
        let host = self.host.clone();
        let start = self.start.clone();

        let retry = run_with_retry(host.as_str(), &policy, since, || {
            handshake(host.clone(), start.clone(), wait)
        });
        tokio::pin!(retry);

        let outcome = loop {
            tokio::select! {
                outcome = &mut retry => break outcome,
                command = self.commands.recv() => match command {
                    Some(HostCommand::Dispatch(task)) => {
                        debug!("Holding task {} until {} is back", task.seq_num, self.host);
                        self.outbox.push_back(task);
                    }
                    Some(HostCommand::EndSession) | None => {
                        info!("Session ended while {} was unreachable", self.host);
                        return Reconnect::Ended;
                    }
                },
            }
        };

        match outcome {
            Ok((link, ack)) => Reconnect::Restored(link, ack),
            Err(failure) => {
                warn!("Giving up on {}: {}", self.host, failure);
                Reconnect::GaveUp
            }
        }
    }

    async fn replay(&mut self, link: &mut Link) -> Result<(), ConnectError> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        info!(
            "Replaying {} unacknowledged command(s) to {}",
            self.outbox.len(),
            self.host
        );
        for task in &self.outbox {
            link.send(&Message::TaskCommand(task.clone())).await?;
        }
        Ok(())
    }

    fn release_outbox(&mut self) {
        if self.outbox.is_empty() {
            return;
        }
        let seq_nums: Vec<SeqNum> = self.outbox.drain(..).map(|t| t.seq_num).collect();
        info!(
            "Dropping {} unacknowledged command(s) for {}",
            seq_nums.len(),
            self.host
        );
        self.recorder.record(RecordEvent::Released {
            host: self.host.clone(),
            seq_nums,
        });
    }
}

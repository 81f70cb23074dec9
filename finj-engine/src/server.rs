//! TCP front end of the engine.
//!
//! One task per controller connection reads frames and hands them to the
//! [`SessionManager`]; a companion writer task owns the socket's write half
//! and drains the connection's outbound queue.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finj_common::{FinjConfig, Message, ProtocolError, read_frame, write_frame};

use crate::events::{EventSink, SinkItem};
use crate::pool::WorkerPool;
use crate::session::{ConnHandle, ConnId, SessionManager};

/// How long a closing connection gets to flush queued frames.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// A bound, not yet running engine.
pub struct Engine {
    listener: TcpListener,
    session: Arc<SessionManager>,
    events: mpsc::UnboundedReceiver<SinkItem>,
    abrupt_shutdown: bool,
    shutdown: CancellationToken,
}

impl Engine {
    pub async fn bind(addr: SocketAddr, config: &FinjConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (sink, events) = EventSink::channel();
        let pool = WorkerPool::new(config, sink);
        let shutdown = CancellationToken::new();
        let session = SessionManager::new(pool, config, shutdown.clone());
        Ok(Self {
            listener,
            session,
            events,
            abrupt_shutdown: config.abrupt_task_kill,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn session(&self) -> Arc<SessionManager> {
        self.session.clone()
    }

    /// Cancelling this token stops the engine. The master's `command_term`
    /// cancels it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve controllers until shutdown, then wind the task pool down.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            session,
            events,
            abrupt_shutdown,
            shutdown,
        } = self;

        let forwarder = tokio::spawn(session.clone().forward_events(events));
        let pump_stop = CancellationToken::new();
        tokio::spawn(session.clone().pump_backlog(pump_stop.clone()));

        let conn_stop = CancellationToken::new();
        let mut connections = JoinSet::new();
        let mut next_id: ConnId = 0;
        info!("Engine listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        info!("Controller connected from {}", peer);
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            next_id,
                            session.clone(),
                            conn_stop.clone(),
                        ));
                    }
                    Err(e) => warn!("Accept error: {}", e),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!(
            "Engine shutting down ({})",
            if abrupt_shutdown { "killing tasks" } else { "waiting for tasks" }
        );
        drop(listener);
        pump_stop.cancel();
        session.shutdown(abrupt_shutdown).await;

        conn_stop.cancel();
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("Connection task failed: {}", e);
            }
        }
        forwarder.abort();
        info!("Engine stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnId,
    session: Arc<SessionManager>,
    stop: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Cannot set TCP_NODELAY for {}: {}", peer, e);
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();

    let broken = CancellationToken::new();
    let writer_broken = broken.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!("Write of {} to {} failed: {}", message.name(), peer, e);
                writer_broken.cancel();
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let conn = ConnHandle::new(id, peer, tx);
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = broken.cancelled() => break,
            _ = stop.cancelled() => break,
        };
        match frame {
            Ok(Some(message)) => session.handle(&conn, message).await,
            Ok(None) => {
                info!("Controller {} disconnected", peer);
                break;
            }
            Err(ProtocolError::Json(e)) => warn!("Ignoring malformed message from {}: {}", peer, e),
            Err(e) => {
                warn!("Connection to {} failed: {}", peer, e);
                break;
            }
        }
    }

    session.connection_closed(id).await;
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN, writer_task).await.is_err() {
        debug!("Writer for {} did not drain in time", peer);
    }
}

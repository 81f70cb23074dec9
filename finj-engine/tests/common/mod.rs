//! Helpers for driving a real engine over TCP.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use finj_common::{
    FinjConfig, Message, SeqNum, SessionAck, SessionEpoch, SessionStart, Task, read_frame,
    unix_now, write_frame,
};
use finj_engine::Engine;

pub use finj_common::testing::init_test_logging;

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[ctor::ctor]
fn install_test_logging() {
    init_test_logging();
}

pub struct RunningEngine {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

pub fn test_config() -> FinjConfig {
    FinjConfig {
        max_requests: 4,
        ..FinjConfig::default()
    }
}

pub async fn start_engine(config: FinjConfig) -> RunningEngine {
    let engine = Engine::bind("127.0.0.1:0".parse().unwrap(), &config)
        .await
        .expect("bind engine");
    let addr = engine.local_addr().unwrap();
    let shutdown = engine.shutdown_token();
    let handle = tokio::spawn(engine.run());
    RunningEngine {
        addr,
        shutdown,
        handle,
    }
}

pub fn task(seq_num: SeqNum, args: &str, duration: u64) -> Task {
    Task {
        args: args.to_string(),
        timestamp: unix_now(),
        duration,
        is_fault: false,
        seq_num,
        cores: None,
    }
}

/// Minimal controller side of the protocol.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect");
        Self { stream }
    }

    pub async fn send(&mut self, message: &Message) {
        write_frame(&mut self.stream, message).await.expect("send");
    }

    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(IO_TIMEOUT, read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a frame")
            .expect("read frame")
    }

    pub async fn expect(&mut self) -> Message {
        self.recv().await.expect("connection closed")
    }

    pub async fn start_session(&mut self, epoch: u64) -> SessionAck {
        self.send(&Message::SessionStart(SessionStart {
            epoch: SessionEpoch(epoch),
            timestamp: unix_now(),
            fresh: false,
        }))
        .await;
        match self.expect().await {
            Message::SessionAck(ack) => ack,
            other => panic!("expected ack_session, got {other:?}"),
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

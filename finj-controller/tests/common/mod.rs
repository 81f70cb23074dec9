//! Helpers for running sessions against in-process engines.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use finj_common::record::{LogRecord, read_execution_log};
use finj_common::{FinjConfig, HostId};
use finj_engine::Engine;

pub use finj_common::testing::init_test_logging;

#[ctor::ctor]
fn install_test_logging() {
    init_test_logging();
}

pub struct RunningEngine {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

impl RunningEngine {
    pub fn host(&self) -> HostId {
        HostId::new(self.addr.to_string())
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub fn engine_config() -> FinjConfig {
    FinjConfig {
        max_requests: 4,
        disable_numa: true,
        ..FinjConfig::default()
    }
}

pub async fn start_engine_at(addr: SocketAddr, config: FinjConfig) -> RunningEngine {
    let engine = Engine::bind(addr, &config).await.expect("bind engine");
    let addr = engine.local_addr().unwrap();
    let shutdown = engine.shutdown_token();
    let handle = tokio::spawn(engine.run());
    RunningEngine {
        addr,
        shutdown,
        handle,
    }
}

pub async fn start_engine(config: FinjConfig) -> RunningEngine {
    start_engine_at("127.0.0.1:0".parse().unwrap(), config).await
}

/// A localhost address nothing listens on right now.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Address the re-executed test binary serves an engine on.
pub const ENGINE_ADDR_ENV: &str = "FINJ_TEST_ENGINE_ADDR";

/// Test that turns the binary into an engine process when
/// [`ENGINE_ADDR_ENV`] is set. Every test file using [`EngineProcess`]
/// defines it and calls [`serve_engine_process`].
pub const ENGINE_PROCESS_TEST: &str = "engine_process_main";

/// Serve an engine until the process is killed. Returns at once in a
/// normal test run.
pub async fn serve_engine_process() {
    let Ok(addr) = std::env::var(ENGINE_ADDR_ENV) else {
        return;
    };
    let engine = start_engine_at(addr.parse().expect("engine address"), engine_config()).await;
    let _ = engine.handle.await;
}

/// An engine in a process of its own, so it can die without cleaning up.
pub struct EngineProcess {
    pub addr: SocketAddr,
    child: Child,
}

impl EngineProcess {
    pub async fn spawn(addr: SocketAddr) -> Self {
        let child = Command::new(std::env::current_exe().unwrap())
            .args([ENGINE_PROCESS_TEST, "--exact", "--nocapture"])
            .env(ENGINE_ADDR_ENV, addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn engine process");

        let host = HostId::new(addr.to_string());
        tokio::time::timeout(Duration::from_secs(30), async {
            while finj_controller::probe(&host, Duration::from_millis(500))
                .await
                .is_err()
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("engine process did not come up");
        Self { addr, child }
    }

    pub fn host(&self) -> HostId {
        HostId::new(self.addr.to_string())
    }

    /// SIGKILL the engine: no `status_reset`, no session end.
    pub async fn kill(mut self) {
        self.child.kill().await.expect("kill engine process");
    }
}

/// Controller settings scaled down to seconds.
pub fn controller_config(results_dir: &Path) -> FinjConfig {
    FinjConfig {
        results_dir: results_dir.to_path_buf(),
        pre_send_interval: -1,
        workload_padding: 1,
        session_wait: 5,
        retry_interval: 10,
        retry_period: 1,
        ..FinjConfig::default()
    }
}

/// Write a workload file. Rows are `(timestamp, duration, seqNum, args)`.
pub fn write_workload(dir: &Path, name: &str, rows: &[(u64, u64, u64, &str)]) -> PathBuf {
    let mut text = String::from("timestamp;duration;seqNum;isFault;cores;args\n");
    for (timestamp, duration, seq_num, args) in rows {
        text.push_str(&format!("{timestamp};{duration};{seq_num};False;None;{args}\n"));
    }
    let path = dir.join(format!("{name}.csv"));
    std::fs::write(&path, text).unwrap();
    path
}

pub fn log_kinds(records: &[LogRecord]) -> Vec<(String, Option<u64>)> {
    records
        .iter()
        .map(|r| (r.kind.clone(), r.seq_num))
        .collect()
}

pub fn read_log(path: &Path) -> Vec<LogRecord> {
    read_execution_log(path).expect("read execution log")
}

/// TCP forwarder whose live connections can be cut on demand.
pub struct Proxy {
    pub addr: SocketAddr,
    generation: Arc<Mutex<CancellationToken>>,
    task: JoinHandle<()>,
}

impl Proxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let generation = Arc::new(Mutex::new(CancellationToken::new()));
        let current = generation.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let cut = current.lock().unwrap().clone();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = cut.cancelled() => {}
                    }
                });
            }
        });
        Self {
            addr,
            generation,
            task,
        }
    }

    pub fn host(&self) -> HostId {
        HostId::new(self.addr.to_string())
    }

    /// Drop every forwarded connection. Later connections are forwarded again.
    pub fn cut(&self) {
        let mut generation = self.generation.lock().unwrap();
        generation.cancel();
        *generation = CancellationToken::new();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

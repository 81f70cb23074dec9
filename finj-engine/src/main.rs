//! Fault injection engine
//!
//! Runs on every node under test. A controller connects, claims the engine for
//! its session and streams tasks; the engine starts them at their scheduled
//! times and reports back.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::info;

use finj_common::auxiliary::AuxProcesses;
use finj_common::{FinjConfig, LogConfig, init_logging};
use finj_engine::Engine;

#[derive(Parser)]
#[command(name = "finj-engine")]
#[command(author, version, about = "Fault injection engine - runs tasks for a controller")]
struct Cli {
    /// Configuration file (TOML, or JSON for any other extension)
    #[arg(short, long, env = "FINJ_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides SERVER_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let mut config = FinjConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.server_port = port;
    }

    let mut aux = AuxProcesses::start(&config.aux_commands);
    if !aux.is_empty() {
        info!("Started {} auxiliary process(es)", aux.len());
    }

    let addr = SocketAddr::new(cli.bind, config.server_port);
    let engine = Engine::bind(addr, &config)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, shutting down");
        shutdown.cancel();
    });

    let result = engine.run().await;
    aux.stop().await;
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

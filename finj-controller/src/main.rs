//! Fault injection controller
//!
//! Runs one injection session: connects to the configured engines, sends them
//! the workload's tasks on schedule and writes one execution log per engine.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use finj_common::auxiliary::AuxProcesses;
use finj_common::config::validate_host;
use finj_common::workload::WorkloadReader;
use finj_common::{FinjConfig, HostId, LogConfig, init_logging};
use finj_controller::{Dispatcher, probe_hosts};

#[derive(Parser)]
#[command(name = "finj-controller")]
#[command(author, version, about = "Fault injection controller - schedules workload tasks across engines")]
struct Cli {
    /// Configuration file (TOML, or JSON for any other extension)
    #[arg(short, long, env = "FINJ_CONFIG")]
    config: Option<PathBuf>,

    /// Workload file to inject
    #[arg(short, long, required_unless_present = "probe")]
    workload: Option<PathBuf>,

    /// Read at most this many tasks from the workload
    #[arg(short, long)]
    max_tasks: Option<usize>,

    /// Target engines as ip:port, comma separated (overrides HOSTS)
    #[arg(short = 'a', long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Greet the engines and report their state instead of running a session
    #[arg(short, long)]
    probe: bool,

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
    if !cli.hosts.is_empty() {
        for host in &cli.hosts {
            validate_host(host)?;
        }
        config.hosts = cli.hosts.clone();
    }

    let mut hosts: Vec<HostId> = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        let host = HostId::new(host.trim());
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    if hosts.is_empty() {
        bail!("No target hosts configured (set HOSTS or pass -a)");
    }

    if cli.probe {
        for (host, reply) in probe_hosts(&hosts, config.session_wait()).await {
            match reply {
                Ok(reply) => info!(
                    "{}: {} active task(s), {}",
                    host,
                    reply.active_tasks,
                    if reply.mastered { "in a session" } else { "idle" }
                ),
                Err(e) => warn!("{}: unreachable ({})", host, e),
            }
        }
        return Ok(());
    }

    let Some(workload_path) = cli.workload else {
        bail!("A workload file is required");
    };
    let workload = WorkloadReader::open(&workload_path, cli.max_tasks)
        .with_context(|| format!("opening workload {}", workload_path.display()))?;

    let mut aux = AuxProcesses::start(&config.aux_commands);
    if !aux.is_empty() {
        info!("Started {} auxiliary process(es)", aux.len());
    }

    let dispatcher = Dispatcher::new(config, hosts);
    let stop = dispatcher.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, ending the session");
            stop.cancel();
        }
    });

    let result = dispatcher.run(workload).await;
    aux.stop().await;

    let report = result?;
    for record in &report.records {
        info!(
            "{}: {} record(s) in {}",
            record.host,
            record.records,
            record.log_path.display()
        );
    }
    for (host, state) in &report.final_states {
        if *state == finj_controller::HostState::Disconnected {
            warn!("{} was lost during the session", host);
        }
    }
    Ok(())
}

//! Auxiliary processes started alongside the controller or engine.
//!
//! `AUX_COMMANDS` lists monitoring helpers (samplers, collectors) that live
//! for as long as the binary does. Spawn failures are logged and skipped.

use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::util::{split_command, terminate_gracefully};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Set of running auxiliary processes.
#[derive(Debug, Default)]
pub struct AuxProcesses {
    children: Vec<(String, Child)>,
}

impl AuxProcesses {
    /// Spawn every command. Commands that cannot be started are skipped.
    pub fn start(commands: &[String]) -> Self {
        let mut children = Vec::with_capacity(commands.len());
        for command in commands {
            let argv = match split_command(command) {
                Ok(argv) => argv,
                Err(e) => {
                    warn!("Skipping auxiliary command: {}", e);
                    continue;
                }
            };
            match Command::new(&argv[0]).args(&argv[1..]).kill_on_drop(true).spawn() {
                Ok(child) => {
                    info!("Started auxiliary process '{}' (pid {:?})", command, child.id());
                    children.push((command.clone(), child));
                }
                Err(e) => warn!("Cannot start auxiliary process '{}': {}", command, e),
            }
        }
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Terminate and reap every process.
    pub async fn stop(&mut self) {
        for (command, mut child) in self.children.drain(..) {
            if let Err(e) = terminate_gracefully(&mut child, STOP_GRACE).await {
                warn!("Failed to stop auxiliary process '{}': {}", command, e);
            } else {
                info!("Stopped auxiliary process '{}'", command);
            }
        }
    }
}

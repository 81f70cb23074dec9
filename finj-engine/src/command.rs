//! Turning a task's `args` into the argv the engine actually spawns.
//!
//! Two rewrites happen here: a leading `sudo` is dropped unless root is
//! enabled, and the program is pinned to CPU cores through `numactl` when a
//! core list applies to the task.

use finj_common::util::{CommandError, split_command};
use finj_common::{FinjConfig, Task};

/// Core list value meaning "no binding".
pub const ALL_CORES: &str = "all";

/// CPU binding rules, resolved once from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorePolicy {
    pub disabled: bool,
    pub faults: Option<String>,
    pub benchmarks: Option<String>,
}

impl CorePolicy {
    pub fn from_config(config: &FinjConfig) -> Self {
        Self {
            disabled: config.disable_numa,
            faults: config.numa_cores_faults.clone(),
            benchmarks: config.numa_cores_benchmarks.clone(),
        }
    }

    /// Core list to bind `task` to, if any.
    ///
    /// `DISABLE_NUMA` wins over everything. Otherwise the engine-wide list for
    /// the task's class (fault or benchmark) wins over the task's own `cores`.
    pub fn resolve<'a>(&'a self, task: &'a Task) -> Option<&'a str> {
        if self.disabled {
            return None;
        }
        let engine_wide = if task.is_fault {
            self.faults.as_deref()
        } else {
            self.benchmarks.as_deref()
        };
        engine_wide
            .or(task.cores.as_deref())
            .map(str::trim)
            .filter(|cores| !cores.is_empty() && !cores.eq_ignore_ascii_case(ALL_CORES))
    }
}

/// Build the argv for one run of `task`.
pub fn build_argv(
    task: &Task,
    cores: &CorePolicy,
    enable_root: bool,
) -> Result<Vec<String>, CommandError> {
    let mut argv = split_command(&task.args)?;
    if !enable_root && argv[0] == "sudo" {
        argv.remove(0);
        if argv.is_empty() {
            return Err(CommandError::Empty);
        }
    }

    if let Some(list) = cores.resolve(task) {
        let mut bound = Vec::with_capacity(argv.len() + 2);
        bound.push("numactl".to_string());
        bound.push(format!("--physcpubind={list}"));
        bound.append(&mut argv);
        argv = bound;
    }
    Ok(argv)
}

//! Configuration shared by the controller and the engine.
//!
//! Values are layered: built-in defaults, then an optional config file
//! (TOML when the extension is `.toml`, JSON otherwise), then `FINJ_*`
//! environment overrides. Command-line flags are applied by the binaries.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid TOML config {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{} invalid environment override(s): {}", .0.len(), join_errors(.0))]
    Env(Vec<EnvError>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// What the engine does with a task whose start time has already passed
/// when `SKIP_EXPIRED` is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredPolicy {
    /// Start now and run for the full duration.
    #[default]
    StartImmediately,
    /// Start now but keep the original window end.
    Backdate,
}

impl std::str::FromStr for ExpiredPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start_immediately" | "immediate" => Ok(Self::StartImmediately),
            "backdate" => Ok(Self::Backdate),
            other => Err(format!("unknown expired policy '{other}'")),
        }
    }
}

/// Complete configuration surface of both binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct FinjConfig {
    // Controller
    pub results_dir: PathBuf,
    /// Lead time in seconds; negative sends every command immediately.
    pub pre_send_interval: i64,
    pub workload_padding: u64,
    pub session_wait: u64,
    pub retry_interval: u64,
    pub retry_period: u64,
    pub hosts: Vec<String>,

    // Engine
    pub server_port: u16,
    pub max_requests: usize,
    pub skip_expired: bool,
    pub expired_policy: ExpiredPolicy,
    pub retry_tasks: bool,
    pub retry_tasks_on_error: bool,
    pub abrupt_task_kill: bool,
    pub enable_root: bool,
    pub log_outputs: bool,
    pub numa_cores_faults: Option<String>,
    pub numa_cores_benchmarks: Option<String>,
    pub disable_numa: bool,

    // Both
    pub recover_after_disconnect: bool,
    pub aux_commands: Vec<String>,
}

impl Default for FinjConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            pre_send_interval: 600,
            workload_padding: 20,
            session_wait: 60,
            retry_interval: 600,
            retry_period: 30,
            hosts: Vec::new(),
            server_port: 30000,
            max_requests: 20,
            skip_expired: true,
            expired_policy: ExpiredPolicy::StartImmediately,
            retry_tasks: true,
            retry_tasks_on_error: false,
            abrupt_task_kill: true,
            enable_root: false,
            log_outputs: true,
            numa_cores_faults: None,
            numa_cores_benchmarks: None,
            disable_numa: false,
            recover_after_disconnect: false,
            aux_commands: Vec::new(),
        }
    }
}

impl FinjConfig {
    /// Load defaults, the optional file, and environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a config file. Keys missing from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            toml::from_str(&raw).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?
        };
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `FINJ_*` overrides on top of the current values. Returns the
    /// variables that were applied.
    pub fn apply_env(&mut self, env: &mut EnvParser) -> Vec<String> {
        let mut applied = Vec::new();
        let results_dir = self.results_dir.to_string_lossy().into_owned();
        self.results_dir = env.get_path("RESULTS_DIR", &results_dir).noted(&mut applied);
        self.pre_send_interval = env
            .get_range("PRE_SEND_INTERVAL", self.pre_send_interval, i64::MIN, i64::MAX)
            .noted(&mut applied);
        self.workload_padding = env
            .get_range("WORKLOAD_PADDING", self.workload_padding, 0, u64::MAX)
            .noted(&mut applied);
        self.session_wait = env
            .get_range("SESSION_WAIT", self.session_wait, 1, 86_400)
            .noted(&mut applied);
        self.retry_interval = env
            .get_range("RETRY_INTERVAL", self.retry_interval, 0, u64::MAX)
            .noted(&mut applied);
        self.retry_period = env
            .get_range("RETRY_PERIOD", self.retry_period, 0, u64::MAX)
            .noted(&mut applied);
        self.hosts = env
            .get_string_list("HOSTS", std::mem::take(&mut self.hosts))
            .noted(&mut applied);

        self.server_port = env
            .get_range("SERVER_PORT", self.server_port, 0, u16::MAX)
            .noted(&mut applied);
        self.max_requests = env
            .get_range("MAX_REQUESTS", self.max_requests, 1, 65_536)
            .noted(&mut applied);
        self.skip_expired = env.get_bool("SKIP_EXPIRED", self.skip_expired).noted(&mut applied);
        self.expired_policy = env
            .get_parsed("EXPIRED_POLICY", self.expired_policy, "start_immediately or backdate")
            .noted(&mut applied);
        self.retry_tasks = env.get_bool("RETRY_TASKS", self.retry_tasks).noted(&mut applied);
        self.retry_tasks_on_error = env
            .get_bool("RETRY_TASKS_ON_ERROR", self.retry_tasks_on_error)
            .noted(&mut applied);
        self.abrupt_task_kill = env
            .get_bool("ABRUPT_TASK_KILL", self.abrupt_task_kill)
            .noted(&mut applied);
        self.enable_root = env.get_bool("ENABLE_ROOT", self.enable_root).noted(&mut applied);
        self.log_outputs = env.get_bool("LOG_OUTPUTS", self.log_outputs).noted(&mut applied);
        self.numa_cores_faults = env
            .get_optional_string("NUMA_CORES_FAULTS", self.numa_cores_faults.take())
            .noted(&mut applied);
        self.numa_cores_benchmarks = env
            .get_optional_string("NUMA_CORES_BENCHMARKS", self.numa_cores_benchmarks.take())
            .noted(&mut applied);
        self.disable_numa = env.get_bool("DISABLE_NUMA", self.disable_numa).noted(&mut applied);

        self.recover_after_disconnect = env
            .get_bool("RECOVER_AFTER_DISCONNECT", self.recover_after_disconnect)
            .noted(&mut applied);
        self.aux_commands = env
            .get_string_list("AUX_COMMANDS", std::mem::take(&mut self.aux_commands))
            .noted(&mut applied);
    
        if !applied.is_empty() {
            debug!("Environment overrides: {}", applied.join(", "));
        }
        applied
    }

    /// Reject combinations no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::Invalid("MAX_REQUESTS must be at least 1".into()));
        }
        if self.session_wait == 0 {
            return Err(ConfigError::Invalid("SESSION_WAIT must be at least 1 second".into()));
        }
        if self.retry_interval > 0 && self.retry_period == 0 {
            return Err(ConfigError::Invalid(
                "RETRY_PERIOD must be positive when RETRY_INTERVAL is set".into(),
            ));
        }
        for host in &self.hosts {
            validate_host(host)?;
        }
        Ok(())
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_secs(self.session_wait)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period)
    }
}

/// Check that a host string has the `address:port` shape.
pub fn validate_host(host: &str) -> Result<(), ConfigError> {
    let valid = host
        .rsplit_once(':')
        .is_some_and(|(addr, port)| !addr.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "host '{host}' is not of the form address:port"
        )))
    }
}

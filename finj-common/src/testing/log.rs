//! Test logging shared by the workspace's unit and integration tests.
//!
//! Call [`init_test_logging`] at the top of a test (it is idempotent), or
//! once from a `#[ctor::ctor]` hook. Events go to the libtest capture writer;
//! set `FINJ_TEST_LOG_FILE` to also get a JSONL copy of every event.

use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a test subscriber once per test binary.
///
/// `FINJ_TEST_LOG_LEVEL` sets the level for the finj crates (default `debug`).
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let file_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let capture_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("FINJ_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "finj_common={level},finj_engine={level},finj_controller={level},test={level},warn"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(capture_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn open_log_file() -> Option<std::fs::File> {
    let path = PathBuf::from(std::env::var("FINJ_TEST_LOG_FILE").ok()?);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

/// Log a line under the `test` target, visible with `--nocapture`.
#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}

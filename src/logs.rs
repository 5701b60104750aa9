//! Logging setup and per-service log file locations.
use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Local;
use tracing::warn;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{cli::LogLevelArg, service::ServiceName};

/// Resolves the file capturing a service's combined stdout and stderr.
pub fn service_log_path(logs_dir: &Path, service: ServiceName) -> PathBuf {
    logs_dir.join(format!("{service}.log"))
}

/// Daily JSON log of lokikit's own activity, e.g. `lokikit_20240131.log`.
pub fn app_log_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(format!("lokikit_{}.log", Local::now().format("%Y%m%d")))
}

/// Picks the verbosity: an explicit `--log-level` wins, then `RUST_LOG`, then `--verbose`.
pub fn build_filter(level: Option<LogLevelArg>, verbose: bool) -> EnvFilter {
    if let Some(level) = level {
        return EnvFilter::new(level.filter().to_string());
    }

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    })
}

/// Runs `f` with a console-only subscriber, for work done before the log directory is known.
pub fn with_console_logging<R>(
    level: Option<LogLevelArg>,
    verbose: bool,
    f: impl FnOnce() -> R,
) -> R {
    let subscriber = tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_env_filter(build_filter(level, verbose))
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

/// Installs the global subscriber: console output plus, when `logs_dir` is given, a JSON
/// file layer.
///
/// Falls back to console-only output when the log file cannot be opened.
pub fn init_logging(logs_dir: Option<&Path>, level: Option<LogLevelArg>, verbose: bool) {
    let console = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_filter(build_filter(level, verbose));

    let Some(logs_dir) = logs_dir else {
        let _ = tracing_subscriber::registry().with(console).try_init();
        return;
    };

    match open_app_log(logs_dir) {
        Ok(file) => {
            let json = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_filter(build_filter(level, verbose));
            let _ = tracing_subscriber::registry()
                .with(console)
                .with(json)
                .try_init();
        }
        Err(err) => {
            let _ = tracing_subscriber::registry().with(console).try_init();
            warn!(
                "File logging disabled, cannot open log in {}: {err}",
                logs_dir.display()
            );
        }
    }
}

fn open_app_log(logs_dir: &Path) -> io::Result<fs::File> {
    fs::create_dir_all(logs_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(app_log_path(logs_dir))
}

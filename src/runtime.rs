//! Runtime paths under the base directory and the interrupt flag shared by wait loops.
use std::{
    env,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::service::ServiceName;

/// File name of the PID registry inside the base directory.
pub const PID_FILE_NAME: &str = "lokikit.pid";

/// Where lokikit keeps binaries, configs, logs and the PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    base_dir: PathBuf,
}

impl RuntimeLayout {
    /// Creates a layout rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding one log file per service plus lokikit's own logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// PID registry location.
    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join(PID_FILE_NAME)
    }

    /// Generated loki configuration.
    pub fn loki_config(&self) -> PathBuf {
        self.base_dir.join("loki-config.yaml")
    }

    /// Generated promtail configuration.
    pub fn promtail_config(&self) -> PathBuf {
        self.base_dir.join("promtail-config.yaml")
    }

    /// Combined stdout/stderr capture for a service.
    pub fn service_log(&self, service: ServiceName) -> PathBuf {
        crate::logs::service_log_path(&self.logs_dir(), service)
    }
}

/// Expands a leading `~` using `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    let home = env::var_os("HOME").map(PathBuf::from);
    match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

/// Cooperative interrupt flag.
///
/// Installed once per invocation; every wait loop checks it between short sleeps so an
/// interrupt reaches the shutdown path promptly.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    const SLICE: Duration = Duration::from_millis(50);

    /// Creates a flag that is not wired to any OS signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a flag raised by Ctrl+C.
    pub fn install() -> Result<Self, ctrlc::Error> {
        let signal = Self::new();
        let requested = Arc::clone(&signal.requested);
        ctrlc::set_handler(move || {
            requested.store(true, Ordering::SeqCst);
        })?;
        Ok(signal)
    }

    /// Raises the flag.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Whether an interrupt has been requested.
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, returning `true` early if the flag is raised.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(Self::SLICE.min(deadline - now));
        }
    }

    /// Blocks until the flag is raised.
    pub fn wait(&self) {
        while !self.is_triggered() {
            thread::sleep(Self::SLICE);
        }
    }
}

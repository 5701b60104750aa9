//! Spawning service processes with their output captured to a log file.
use std::{
    fmt,
    fs::{self, File},
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use tracing::{debug, error, info};

use crate::{
    error::ProcessManagerError,
    service::{ServiceDescriptor, ServiceName},
};

/// Observed state of a launched child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited {
        /// Exit code, when the process exited normally.
        code: Option<i32>,
        /// Terminating signal number, when it was killed.
        signal: Option<i32>,
    },
}

impl From<ExitStatus> for ChildStatus {
    fn from(status: ExitStatus) -> Self {
        ChildStatus::Exited {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Running => write!(f, "running"),
            ChildStatus::Exited {
                code: Some(code), ..
            } => write!(f, "exit code {code}"),
            ChildStatus::Exited {
                signal: Some(signal),
                ..
            } => match Signal::try_from(*signal) {
                Ok(sig) => write!(f, "killed by {sig}"),
                Err(_) => write!(f, "killed by signal {signal}"),
            },
            ChildStatus::Exited { .. } => write!(f, "exited"),
        }
    }
}

/// A child process started by this invocation.
#[derive(Debug)]
pub struct ProcessHandle {
    service: ServiceName,
    child: Child,
    log_path: PathBuf,
}

impl ProcessHandle {
    pub fn service(&self) -> ServiceName {
        self.service
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking exit check.
    pub fn poll(&mut self) -> io::Result<ChildStatus> {
        Ok(match self.child.try_wait()? {
            Some(status) => status.into(),
            None => ChildStatus::Running,
        })
    }

    /// Sends `signal` to the child.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        let pid = i32::try_from(self.pid()).map_err(|_| nix::errno::Errno::ESRCH)?;
        signal::kill(Pid::from_raw(pid), signal)
    }

    /// Waits up to `timeout` for the child to exit and collects its status.
    pub fn reap(&mut self, timeout: Duration) -> Option<ChildStatus> {
        const INTERVAL: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status.into()),
                Ok(None) if Instant::now() < deadline => thread::sleep(INTERVAL),
                Ok(None) => return None,
                Err(err) => {
                    debug!(service = %self.service, "Could not reap child: {err}");
                    return None;
                }
            }
        }
    }
}

/// Starts the process described by `descriptor` in its own session.
///
/// The log file is truncated and receives both stdout and stderr; stdin is `/dev/null`.
pub fn launch(descriptor: &ServiceDescriptor) -> Result<ProcessHandle, ProcessManagerError> {
    let service = descriptor.name;
    let start_error = |source: io::Error| ProcessManagerError::ServiceStartError { service, source };

    if let Some(parent) = descriptor.log_file_path.parent() {
        fs::create_dir_all(parent).map_err(start_error)?;
    }
    let stdout = File::create(&descriptor.log_file_path).map_err(start_error)?;
    let stderr = stdout.try_clone().map_err(start_error)?;

    debug!(service = %service, "Launching `{}`", descriptor.command_line());

    let mut cmd = Command::new(&descriptor.executable_path);
    cmd.args(&descriptor.launch_args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    unsafe {
        cmd.pre_exec(|| {
            unistd::setsid().map(drop).map_err(io::Error::from)
        });
    }

    match cmd.spawn() {
        Ok(child) => {
            info!(
                service = %service,
                pid = child.id(),
                "Started {}, logging to {}",
                service.title(),
                descriptor.log_file_path.display()
            );
            Ok(ProcessHandle {
                service,
                child,
                log_path: descriptor.log_file_path.clone(),
            })
        }
        Err(source) => {
            error!("Failed to start service '{service}': {source}");
            Err(start_error(source))
        }
    }
}

//! Graceful termination with escalation to SIGKILL.
use std::{collections::BTreeMap, thread, time::Duration};

use nix::{errno::Errno, sys::signal::Signal};
use tracing::{debug, error, info, warn};

use crate::{probe::ProcessTable, registry::PidFile, service::ServiceName};

/// How stopping one process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running under the id.
    AlreadyStopped,
    /// Exited after SIGTERM.
    Terminated,
    /// Exited after SIGKILL.
    Killed,
    /// Still alive, or could not be signalled.
    Failed(String),
}

impl StopOutcome {
    pub fn is_stopped(&self) -> bool {
        !matches!(self, StopOutcome::Failed(_))
    }
}

/// Per-service outcomes of [`Terminator::stop_services`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub outcomes: BTreeMap<ServiceName, StopOutcome>,
}

impl StopReport {
    pub fn all_stopped(&self) -> bool {
        self.outcomes.values().all(StopOutcome::is_stopped)
    }

    pub fn stopped(&self) -> Vec<ServiceName> {
        self.filter(true)
    }

    pub fn failed(&self) -> Vec<ServiceName> {
        self.filter(false)
    }

    fn filter(&self, stopped: bool) -> Vec<ServiceName> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_stopped() == stopped)
            .map(|(service, _)| *service)
            .collect()
    }

    /// Logs the aggregate "stopped" and "failed to stop" lines.
    pub fn log_summary(&self) {
        let stopped = self.stopped();
        if !stopped.is_empty() {
            info!("Successfully stopped: {}", titles(&stopped));
        }
        let failed = self.failed();
        if !failed.is_empty() {
            error!("Failed to stop: {}", titles(&failed));
        }
    }
}

fn titles(services: &[ServiceName]) -> String {
    services
        .iter()
        .map(ServiceName::title)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Sends SIGTERM, waits a bounded time, then escalates to SIGKILL.
#[derive(Debug, Clone)]
pub struct Terminator<T> {
    table: T,
    graceful_checks: u32,
    kill_checks: u32,
    interval: Duration,
}

impl<T: ProcessTable> Terminator<T> {
    pub const GRACEFUL_CHECKS: u32 = 20;
    pub const KILL_CHECKS: u32 = 10;
    pub const INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(table: T) -> Self {
        Self {
            table,
            graceful_checks: Self::GRACEFUL_CHECKS,
            kill_checks: Self::KILL_CHECKS,
            interval: Self::INTERVAL,
        }
    }

    /// Overrides the polling windows.
    pub fn with_windows(mut self, graceful_checks: u32, kill_checks: u32, interval: Duration) -> Self {
        self.graceful_checks = graceful_checks;
        self.kill_checks = kill_checks;
        self.interval = interval;
        self
    }

    /// Stops every process tracked in `pid_file`.
    pub fn stop_services(&self, pid_file: &PidFile, force: bool) -> StopReport {
        let outcomes = pid_file
            .services()
            .iter()
            .map(|(service, pid)| (*service, self.stop_pid(*service, *pid, force)))
            .collect();
        let report = StopReport { outcomes };
        report.log_summary();
        report
    }

    /// Stops a single process.
    pub fn stop_pid(&self, service: ServiceName, pid: u32, force: bool) -> StopOutcome {
        let outcome = if force {
            self.kill_now(service, pid)
        } else {
            self.terminate_gracefully(service, pid)
        };

        match &outcome {
            StopOutcome::AlreadyStopped => info!(service = %service, pid, "{} was not running", service.title()),
            StopOutcome::Terminated => info!(service = %service, pid, "Stopped {}", service.title()),
            StopOutcome::Killed => info!(service = %service, pid, "Killed {}", service.title()),
            StopOutcome::Failed(reason) => error!(service = %service, pid, "Failed to stop {}: {reason}", service.title()),
        }
        outcome
    }

    fn kill_now(&self, service: ServiceName, pid: u32) -> StopOutcome {
        debug!(service = %service, pid, "Sending SIGKILL");
        match self.table.signal(pid, Signal::SIGKILL) {
            Ok(()) => StopOutcome::Killed,
            Err(Errno::ESRCH) => StopOutcome::AlreadyStopped,
            Err(err) => StopOutcome::Failed(format!("SIGKILL failed: {err}")),
        }
    }

    fn terminate_gracefully(&self, service: ServiceName, pid: u32) -> StopOutcome {
        debug!(service = %service, pid, "Sending SIGTERM");
        match self.table.signal(pid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return StopOutcome::AlreadyStopped,
            Err(err) => return StopOutcome::Failed(format!("SIGTERM failed: {err}")),
        }

        if self.wait_for_exit(pid, self.graceful_checks) {
            return StopOutcome::Terminated;
        }

        warn!(
            service = %service,
            pid,
            "{} did not exit after SIGTERM; sending SIGKILL",
            service.title()
        );
        match self.table.signal(pid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return StopOutcome::Terminated,
            Err(err) => return StopOutcome::Failed(format!("SIGKILL failed: {err}")),
        }

        if self.wait_for_exit(pid, self.kill_checks) {
            StopOutcome::Killed
        } else {
            StopOutcome::Failed("process survived SIGKILL".to_string())
        }
    }

    fn wait_for_exit(&self, pid: u32, checks: u32) -> bool {
        for _ in 0..checks {
            thread::sleep(self.interval);
            if !self.table.is_alive(pid) {
                return true;
            }
        }
        false
    }
}

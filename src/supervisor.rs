//! Lifecycle orchestration: start, stop, status, clean and force-quit.
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    time::Duration,
};

use nix::{errno::Errno, sys::signal::Signal};
use tracing::{debug, error, info, warn};

use crate::{
    binaries::{Platform, locate_binaries},
    config::Config,
    error::ProcessManagerError,
    launcher::{ChildStatus, ProcessHandle, launch},
    probe::{
        PortProbe, ProcessTable, check_services_running, find_service_processes, probe_host,
        service_liveness,
    },
    readiness::{ReadinessOutcome, ReadinessReport, ReadinessWaiter},
    registry::PidFile,
    runtime::{RuntimeLayout, ShutdownSignal},
    service::{ServiceDescriptor, ServiceName},
    setup::ensure_datasource,
    terminate::{StopOutcome, StopReport, Terminator},
};

/// Flags accepted by [`Supervisor::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    /// Return once services are launched instead of blocking.
    pub background: bool,
    /// Restart even if the tracked services are alive.
    pub force: bool,
    /// Upper bound on the readiness wait.
    pub timeout: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            background: false,
            force: false,
            timeout: Duration::from_secs(20),
        }
    }
}

/// How [`Supervisor::start`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The tracked services were already alive; nothing was launched.
    AlreadyRunning,
    /// Services were launched and the registry written.
    Started { readiness: ReadinessReport },
    /// Interrupted during startup; launched children were terminated.
    Interrupted,
}

/// Agreement between the registry and the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// Every tracked service is alive.
    Running,
    /// No usable registry, but matching processes exist.
    OutOfSync,
    NotRunning,
}

/// Result of [`Supervisor::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub kind: StatusKind,
    /// Registry contents with stale ids corrected in memory.
    pub tracked: Option<PidFile>,
    /// Processes found by command-line pattern.
    pub discovered: BTreeMap<ServiceName, Vec<u32>>,
    /// Port reachability, only probed when something is running.
    pub reachable: BTreeMap<ServiceName, bool>,
}

/// Result of [`Supervisor::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopSummary {
    /// Outcomes for registry entries, when a registry existed.
    pub tracked: Option<StopReport>,
    /// Outcomes for processes found by pattern.
    pub swept: Vec<(ServiceName, u32, StopOutcome)>,
    pub pid_file_removed: bool,
}

impl StopSummary {
    pub fn all_stopped(&self) -> bool {
        let swept_ok = self.swept.iter().all(|(_, _, outcome)| outcome.is_stopped());
        match &self.tracked {
            Some(report) if !report.all_stopped() => swept_ok && !self.swept.is_empty(),
            _ => swept_ok,
        }
    }
}

/// Result of [`Supervisor::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanOutcome {
    Removed,
    NothingToClean,
}

/// Sequences launching, readiness, registry and termination for the three services.
pub struct Supervisor<T, P> {
    config: Config,
    layout: RuntimeLayout,
    shutdown: ShutdownSignal,
    table: T,
    probe: P,
    poll_interval: Duration,
    graceful_checks: u32,
    kill_checks: u32,
    check_interval: Duration,
}

impl<T: ProcessTable, P: PortProbe + Clone> Supervisor<T, P> {
    pub fn new(config: Config, shutdown: ShutdownSignal, table: T, probe: P) -> Self {
        let layout = RuntimeLayout::new(&config.base_dir);
        Self {
            config,
            layout,
            shutdown,
            table,
            probe,
            poll_interval: Duration::from_secs(1),
            graceful_checks: Terminator::<T>::GRACEFUL_CHECKS,
            kill_checks: Terminator::<T>::KILL_CHECKS,
            check_interval: Terminator::<T>::INTERVAL,
        }
    }

    /// Overrides the readiness and foreground polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides the termination windows.
    pub fn with_termination_windows(
        mut self,
        graceful_checks: u32,
        kill_checks: u32,
        interval: Duration,
    ) -> Self {
        self.graceful_checks = graceful_checks;
        self.kill_checks = kill_checks;
        self.check_interval = interval;
        self
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    fn terminator(&self) -> Terminator<&T> {
        Terminator::new(&self.table).with_windows(
            self.graceful_checks,
            self.kill_checks,
            self.check_interval,
        )
    }

    fn log_access_urls(&self) {
        let host = probe_host(&self.config.host);
        info!("- Grafana: http://{host}:{}", self.config.grafana_port);
        info!("  (Default credentials: admin/admin)");
        info!("- Loki API: http://{host}:{}/loki/api/v1/labels", self.config.loki_port);
        info!("  (Loki has no UI - access through Grafana or use API endpoints)");
        info!("- Promtail: http://{host}:{}", self.config.promtail_port);
    }

    fn port_for(&self, service: ServiceName) -> u16 {
        match service {
            ServiceName::Loki => self.config.loki_port,
            ServiceName::Promtail => self.config.promtail_port,
            ServiceName::Grafana => self.config.grafana_port,
        }
    }

    /// Launches the stack unless the tracked services are already alive.
    pub fn start(&self, options: StartOptions) -> Result<StartOutcome, ProcessManagerError> {
        let base_dir = self.layout.base_dir();
        debug!(
            host = %self.config.host,
            loki = self.config.loki_port,
            promtail = self.config.promtail_port,
            grafana = self.config.grafana_port,
            "Starting services"
        );

        if let Some(mut existing) = PidFile::load(base_dir)?.filter(|pid_file| !pid_file.is_empty()) {
            // Corrects stale ids before either branch uses them.
            let running = check_services_running(&mut existing, &self.table);
            if !options.force && running {
                info!("Services are already running with PIDs: {}", describe_pids(&existing));
                self.log_access_urls();
                info!("Use --force to start anyway.");
                if !options.background {
                    info!("Press Ctrl+C to exit or run 'lokikit stop' from another terminal to stop the services.");
                    self.shutdown.wait();
                    info!("Exiting without stopping services. Run 'lokikit stop' to stop them.");
                }
                return Ok(StartOutcome::AlreadyRunning);
            }

            if options.force {
                info!("Stopping existing services first...");
                self.terminator().stop_services(&existing, false);
                PidFile::remove(base_dir)?;
            }
        }

        let platform = Platform::detect()?;
        let binaries = locate_binaries(base_dir, platform).map_err(|services| {
            let err = ProcessManagerError::MissingBinaries { services };
            error!("{err}");
            err
        })?;

        let logs_dir = self.layout.logs_dir();
        fs::create_dir_all(&logs_dir)?;
        ensure_datasource(&binaries.grafana, &self.config.host, self.config.loki_port)?;

        let host = self.config.host.as_str();
        let descriptors = [
            ServiceDescriptor::loki(
                &binaries.loki,
                &self.layout.loki_config(),
                self.layout.service_log(ServiceName::Loki),
                host,
                self.config.loki_port,
            ),
            ServiceDescriptor::promtail(
                &binaries.promtail,
                &self.layout.promtail_config(),
                self.layout.service_log(ServiceName::Promtail),
                host,
                self.config.promtail_port,
            ),
            ServiceDescriptor::grafana(
                &binaries.grafana,
                self.layout.service_log(ServiceName::Grafana),
                host,
                self.config.grafana_port,
            ),
        ];

        let mut handles = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            match launch(descriptor) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    if !handles.is_empty() {
                        warn!("Stopping services launched before the failure...");
                        self.terminate_handles(&mut handles);
                    }
                    return Err(err);
                }
            }
        }

        let ports: BTreeMap<ServiceName, u16> = descriptors
            .iter()
            .map(|descriptor| (descriptor.name, descriptor.port))
            .collect();
        let readiness = ReadinessWaiter::new(self.probe.clone(), self.shutdown.clone())
            .with_poll_interval(self.poll_interval)
            .wait_for_services(host, &ports, &mut handles, options.timeout);

        if readiness.outcome == ReadinessOutcome::Interrupted {
            info!("Stopping services...");
            self.terminate_handles(&mut handles);
            return Ok(StartOutcome::Interrupted);
        }

        let pid_file: PidFile = handles
            .iter()
            .map(|handle| (handle.service(), handle.pid()))
            .collect();
        let pid_path = pid_file.save(base_dir)?;
        debug!("Wrote PID file with PIDs: {}", describe_pids(&pid_file));

        if readiness.is_ready() {
            info!("All services started:");
        } else {
            warn!("Services launched, but not all are reachable yet:");
        }
        self.log_access_urls();
        info!("Log files are located in: {}", logs_dir.display());

        if options.background {
            info!("Running in background mode. PIDs stored in {}", pid_path.display());
            info!("To check status: lokikit status");
            info!("To stop the services: lokikit stop");
            return Ok(StartOutcome::Started { readiness });
        }

        info!("Press Ctrl+C to stop the services.");
        self.watch_foreground(&mut handles);
        Ok(StartOutcome::Started { readiness })
    }

    /// Blocks until interrupted or until every child has exited, then cleans up.
    fn watch_foreground(&self, handles: &mut [ProcessHandle]) {
        let mut reported = BTreeSet::new();
        loop {
            if self.shutdown.sleep(self.poll_interval) {
                info!("Stopping services...");
                self.terminate_handles(handles);
                break;
            }

            for handle in handles.iter_mut() {
                let service = handle.service();
                if reported.contains(&service) {
                    continue;
                }
                if let Ok(status @ ChildStatus::Exited { .. }) = handle.poll() {
                    warn!(
                        service = %service,
                        pid = handle.pid(),
                        "{} exited unexpectedly ({status}); check {}",
                        service.title(),
                        handle.log_path().display()
                    );
                    reported.insert(service);
                }
            }

            if reported.len() == handles.len() {
                warn!("All services have terminated.");
                info!("Check the log files in {} for details.", self.layout.logs_dir().display());
                break;
            }
        }

        if let Err(err) = PidFile::remove(self.layout.base_dir()) {
            error!("Failed to remove PID file: {err}");
        }
    }

    /// Gracefully stops and reaps children launched by this invocation.
    ///
    /// Children already reaped are skipped: their ids may belong to another process by now.
    fn terminate_handles(&self, handles: &mut [ProcessHandle]) -> StopReport {
        let pid_file: PidFile = handles
            .iter_mut()
            .filter_map(|handle| match handle.poll() {
                Ok(status @ ChildStatus::Exited { .. }) => {
                    debug!(service = %handle.service(), "Already exited ({status}), not signalling");
                    None
                }
                _ => Some((handle.service(), handle.pid())),
            })
            .collect();
        let report = self.terminator().stop_services(&pid_file, false);
        for handle in handles.iter_mut() {
            if let Some(status) = handle.reap(Duration::from_secs(1)) {
                debug!(service = %handle.service(), "Reaped child ({status})");
            }
        }
        report
    }

    /// Stops tracked services, sweeping the process table when the registry is missing or
    /// termination fell short. The registry is always removed.
    pub fn stop(&self, force: bool) -> Result<StopSummary, ProcessManagerError> {
        let base_dir = self.layout.base_dir();
        debug!("Stopping lokikit services...");

        let mut summary = StopSummary::default();
        let needs_sweep = match PidFile::load(base_dir)?.filter(|pid_file| !pid_file.is_empty()) {
            Some(mut pid_file) => {
                service_liveness(&mut pid_file, &self.table);
                let report = self.terminator().stop_services(&pid_file, force);
                let all_stopped = report.all_stopped();
                if !all_stopped {
                    error!("Failed to stop one or more services. Try using --force to terminate them.");
                }
                summary.tracked = Some(report);
                !all_stopped
            }
            None => {
                warn!("No PID file found, searching for running processes by pattern...");
                true
            }
        };

        if needs_sweep {
            let found = find_service_processes(&self.table);
            if found.is_empty() {
                info!("No running lokikit processes found.");
            }
            let terminator = self.terminator();
            for (service, pids) in found {
                info!("Found {service} processes: {pids:?}");
                for pid in pids {
                    let outcome = terminator.stop_pid(service, pid, force);
                    summary.swept.push((service, pid, outcome));
                }
            }
        }

        summary.pid_file_removed = PidFile::remove(base_dir)?;
        if summary.pid_file_removed {
            info!("Removed PID file.");
        }
        info!("Operation completed.");
        Ok(summary)
    }

    /// Reports whether services are running. Never modifies the registry on disk.
    pub fn status(&self) -> Result<StatusReport, ProcessManagerError> {
        debug!("Checking status of lokikit services...");

        let mut tracked = PidFile::load(self.layout.base_dir())?;
        let running_from_registry = tracked
            .as_mut()
            .is_some_and(|pid_file| check_services_running(pid_file, &self.table));
        let discovered = find_service_processes(&self.table);

        let kind = if running_from_registry {
            StatusKind::Running
        } else if !discovered.is_empty() {
            StatusKind::OutOfSync
        } else {
            StatusKind::NotRunning
        };

        match (kind, &tracked) {
            (StatusKind::Running, Some(pid_file)) => {
                info!("Services are running according to PID file:");
                for (service, pid) in pid_file.services() {
                    info!("- {}: PID {pid}", service.title());
                }
            }
            (StatusKind::OutOfSync, _) => {
                info!("Services are running but the PID file may be out of sync:");
                for (service, pids) in &discovered {
                    let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                    info!("- {}: PIDs {}", service.title(), pids.join(", "));
                }
                info!("Consider running 'lokikit stop' and then 'lokikit start' to synchronize the PID file.");
            }
            _ => {
                info!("No services appear to be running.");
            }
        }

        let mut reachable = BTreeMap::new();
        if kind != StatusKind::NotRunning {
            let host = probe_host(&self.config.host);
            for service in ServiceName::ALL {
                let port = self.port_for(service);
                let up = self.probe.is_reachable(host, port);
                info!(
                    "- {} port {port}: {}",
                    service.title(),
                    if up { "reachable" } else { "not reachable" }
                );
                reachable.insert(service, up);
            }
            info!("Access URLs:");
            self.log_access_urls();
        }

        Ok(StatusReport {
            kind,
            tracked,
            discovered,
            reachable,
        })
    }

    /// Removes the whole base directory, refusing while tracked services are alive.
    pub fn clean(&self) -> Result<CleanOutcome, ProcessManagerError> {
        let base_dir = self.layout.base_dir();
        debug!("Cleaning up lokikit files from {}...", base_dir.display());

        if let Some(mut pid_file) = PidFile::load(base_dir)?
            && check_services_running(&mut pid_file, &self.table)
        {
            warn!("Services are still running. Please stop them first using 'lokikit stop'.");
            info!("Operation aborted.");
            return Err(ProcessManagerError::ServicesStillRunning);
        }

        if !base_dir.exists() {
            info!("Nothing to clean: directory {} does not exist.", base_dir.display());
            return Ok(CleanOutcome::NothingToClean);
        }

        fs::remove_dir_all(base_dir).map_err(|source| ProcessManagerError::CleanError {
            path: base_dir.to_path_buf(),
            source,
        })?;
        info!("Cleaned up all files.");
        Ok(CleanOutcome::Removed)
    }

    /// SIGKILLs registry entries and every pattern match, then removes the registry.
    ///
    /// Returns the ids that received SIGKILL.
    pub fn force_quit(&self) -> Result<Vec<(ServiceName, u32)>, ProcessManagerError> {
        let base_dir = self.layout.base_dir();
        info!("Force-quitting all lokikit processes...");
        let mut killed = Vec::new();

        match PidFile::load(base_dir)? {
            Some(pid_file) => {
                for (service, pid) in pid_file.services() {
                    info!("Killing {service} (PID: {pid}) with SIGKILL...");
                    match self.table.signal(*pid, Signal::SIGKILL) {
                        Ok(()) => killed.push((*service, *pid)),
                        Err(Errno::ESRCH) => info!("Process {service} (PID: {pid}) was not running"),
                        Err(err) => error!("Error killing {service}: {err}"),
                    }
                }
                PidFile::remove(base_dir)?;
                info!("Removed PID file");
            }
            None => info!("No PID file found"),
        }

        for service in ServiceName::ALL {
            let mut swept = Vec::new();
            for pid in self.table.find_matching(service.process_pattern()) {
                info!("Force killing {service} (PID: {pid})...");
                match self.table.signal(pid, Signal::SIGKILL) {
                    Ok(()) => swept.push(pid),
                    Err(err) => error!("Error killing {service} (PID: {pid}): {err}"),
                }
            }
            if swept.is_empty() {
                info!("No running {service} processes found");
            } else {
                info!("Killed {service} processes with PIDs: {swept:?}");
                killed.extend(swept.into_iter().map(|pid| (service, pid)));
            }
        }

        info!("All lokikit processes have been terminated");
        info!("You can now start services with a clean state using: lokikit start");
        Ok(killed)
    }
}

fn describe_pids(pid_file: &PidFile) -> String {
    pid_file
        .services()
        .iter()
        .map(|(service, pid)| format!("{service}={pid}"))
        .collect::<Vec<_>>()
        .join(", ")
}

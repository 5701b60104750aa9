//! Waiting for launched services to accept TCP connections.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    launcher::{ChildStatus, ProcessHandle},
    probe::{PortProbe, probe_host},
    runtime::ShutdownSignal,
    service::ServiceName,
};

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    AllReady,
    TimedOut,
    /// A launched process died before every service became reachable.
    ProcessExited {
        service: ServiceName,
        status: ChildStatus,
    },
    Interrupted,
}

/// Result of [`ReadinessWaiter::wait_for_services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub statuses: BTreeMap<ServiceName, bool>,
    pub outcome: ReadinessOutcome,
}

impl ReadinessReport {
    /// True only when every service answered.
    pub fn is_ready(&self) -> bool {
        self.outcome == ReadinessOutcome::AllReady
    }

    pub fn ready(&self) -> Vec<ServiceName> {
        self.partition(true)
    }

    pub fn not_ready(&self) -> Vec<ServiceName> {
        self.partition(false)
    }

    fn partition(&self, wanted: bool) -> Vec<ServiceName> {
        self.statuses
            .iter()
            .filter(|(_, ready)| **ready == wanted)
            .map(|(service, _)| *service)
            .collect()
    }
}

/// Polls launched processes and their ports until all are reachable.
#[derive(Debug, Clone)]
pub struct ReadinessWaiter<P> {
    probe: P,
    poll_interval: Duration,
    shutdown: ShutdownSignal,
}

impl<P: PortProbe> ReadinessWaiter<P> {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(probe: P, shutdown: ShutdownSignal) -> Self {
        Self {
            probe,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            shutdown,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Blocks until every port in `ports` is reachable on `host`, a handle exits, `timeout`
    /// elapses or the shutdown signal fires.
    pub fn wait_for_services(
        &self,
        host: &str,
        ports: &BTreeMap<ServiceName, u16>,
        handles: &mut [ProcessHandle],
        timeout: Duration,
    ) -> ReadinessReport {
        let target = probe_host(host);
        let mut statuses: BTreeMap<ServiceName, bool> =
            ports.keys().map(|service| (*service, false)).collect();
        let started = Instant::now();

        info!(
            "Waiting up to {}s for services to become reachable...",
            timeout.as_secs_f32()
        );

        while started.elapsed() < timeout {
            for handle in handles.iter_mut() {
                match handle.poll() {
                    Ok(ChildStatus::Running) => {}
                    Ok(status) => {
                        let service = handle.service();
                        error!(
                            service = %service,
                            pid = handle.pid(),
                            "{} exited during startup ({status}); see {}",
                            service.title(),
                            handle.log_path().display()
                        );
                        return ReadinessReport {
                            statuses,
                            outcome: ReadinessOutcome::ProcessExited { service, status },
                        };
                    }
                    Err(err) => {
                        debug!(service = %handle.service(), "Could not poll child: {err}");
                    }
                }
            }

            for (service, ready) in statuses.iter_mut().filter(|(_, ready)| !**ready) {
                let port = ports[service];
                if self.probe.is_reachable(target, port) {
                    *ready = true;
                    info!(service = %service, "{} is ready on {target}:{port}", service.title());
                }
            }

            if statuses.values().all(|ready| *ready) {
                return ReadinessReport {
                    statuses,
                    outcome: ReadinessOutcome::AllReady,
                };
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if self.shutdown.sleep(self.poll_interval.min(remaining)) {
                warn!("Interrupted while waiting for services");
                return ReadinessReport {
                    statuses,
                    outcome: ReadinessOutcome::Interrupted,
                };
            }
        }

        let report = ReadinessReport {
            statuses,
            outcome: ReadinessOutcome::TimedOut,
        };
        warn!(
            "Timed out after {}s: ready [{}], not ready [{}]",
            timeout.as_secs_f32(),
            join(&report.ready()),
            join(&report.not_ready())
        );
        report
    }
}

fn join(services: &[ServiceName]) -> String {
    services
        .iter()
        .map(|service| service.as_ref())
        .collect::<Vec<_>>()
        .join(", ")
}

//! Liveness and reachability checks.
//!
//! Process checks go through [`ProcessTable`] so supervision logic can run against a scripted
//! table; reachability goes through [`PortProbe`].
use std::{
    collections::BTreeMap,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use crate::{registry::PidFile, service::ServiceName};

/// Access to the operating system's processes.
pub trait ProcessTable {
    /// Signal-0 existence check. Permission errors count as alive; zombies do not.
    fn is_alive(&self, pid: u32) -> bool;

    /// Delivers `signal` to `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()>;

    /// Live processes whose command line contains `token`, ascending by pid.
    fn find_matching(&self, token: &str) -> Vec<u32>;
}

impl<T: ProcessTable + ?Sized> ProcessTable for &T {
    fn is_alive(&self, pid: u32) -> bool {
        (**self).is_alive(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()> {
        (**self).signal(pid, signal)
    }

    fn find_matching(&self, token: &str) -> Vec<u32> {
        (**self).find_matching(token)
    }
}

/// [`ProcessTable`] backed by `kill(2)` and a `sysinfo` snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    fn is_zombie(pid: u32) -> bool {
        let mut system = System::new();
        let target = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system
            .process(target)
            .is_some_and(|process| matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }
}

/// Converts a registry id to a `pid_t`, rejecting values `kill(2)` would treat as groups.
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = to_pid(pid) else {
            return false;
        };
        match signal::kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => !Self::is_zombie(pid),
            Err(_) => false,
        }
    }

    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()> {
        let target = to_pid(pid).ok_or(Errno::ESRCH)?;
        signal::kill(target, signal)
    }

    fn find_matching(&self, token: &str) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let mut matches: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, process)| {
                pid.as_u32() != own_pid
                    && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                    && process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ")
                        .contains(token)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();
        matches.sort_unstable();
        matches
    }
}

/// Per-service liveness, replacing stale ids with the first pattern match.
pub fn service_liveness<T: ProcessTable>(
    pid_file: &mut PidFile,
    table: &T,
) -> BTreeMap<ServiceName, bool> {
    let tracked: Vec<(ServiceName, u32)> = pid_file
        .services()
        .iter()
        .map(|(service, pid)| (*service, *pid))
        .collect();

    let mut liveness = BTreeMap::new();
    for (service, pid) in tracked {
        if table.is_alive(pid) {
            liveness.insert(service, true);
            continue;
        }

        match table.find_matching(service.process_pattern()).first() {
            Some(&found) => {
                debug!(service = %service, pid, found, "Recorded PID is stale; found running instance by pattern");
                pid_file.insert(service, found);
                liveness.insert(service, true);
            }
            None => {
                debug!(service = %service, pid, "Service is not running");
                liveness.insert(service, false);
            }
        }
    }
    liveness
}

/// True when the registry is non-empty and every tracked service resolves to a live process.
///
/// Every entry is probed so that all stale ids are corrected.
pub fn check_services_running<T: ProcessTable>(pid_file: &mut PidFile, table: &T) -> bool {
    let liveness = service_liveness(pid_file, table);
    !liveness.is_empty() && liveness.values().all(|alive| *alive)
}

/// Pattern sweep of the process table for every managed service.
pub fn find_service_processes<T: ProcessTable>(table: &T) -> BTreeMap<ServiceName, Vec<u32>> {
    ServiceName::ALL
        .into_iter()
        .filter_map(|service| {
            let pids = table.find_matching(service.process_pattern());
            (!pids.is_empty()).then_some((service, pids))
        })
        .collect()
}

/// TCP reachability check.
pub trait PortProbe {
    fn is_reachable(&self, host: &str, port: u16) -> bool;
}

impl<F> PortProbe for F
where
    F: Fn(&str, u16) -> bool,
{
    fn is_reachable(&self, host: &str, port: u16) -> bool {
        self(host, port)
    }
}

/// [`PortProbe`] that attempts a TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl PortProbe for TcpProbe {
    fn is_reachable(&self, host: &str, port: u16) -> bool {
        let Ok(addrs) = (host, port).to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok())
    }
}

/// Address to probe for a service bound to `bind_host`.
///
/// Wildcard binds are reached through loopback.
pub fn probe_host(bind_host: &str) -> &str {
    match bind_host {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    }
}

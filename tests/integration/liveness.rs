#[path = "common/mod.rs"]
mod common;

use std::{net::TcpListener, time::Duration};

use common::{ScriptedTable, is_process_alive, process_lock, spawn_sleeper};
use lokikit::{
    probe::{
        PortProbe, ProcessTable, SystemProcessTable, TcpProbe, check_services_running,
        find_service_processes, probe_host, service_liveness,
    },
    registry::PidFile,
    service::ServiceName,
};
use nix::sys::signal::Signal;

fn full_registry() -> PidFile {
    [
        (ServiceName::Loki, 1000),
        (ServiceName::Promtail, 2000),
        (ServiceName::Grafana, 3000),
    ]
    .into_iter()
    .collect()
}

#[test]
fn one_dead_service_means_not_running() {
    let table = ScriptedTable::with_alive(&[1000]);
    let mut pid_file = full_registry();

    assert!(!check_services_running(&mut pid_file, &table));
    assert_eq!(pid_file.pid_for(ServiceName::Loki), Some(1000));
    assert_eq!(pid_file.pid_for(ServiceName::Promtail), Some(2000));
}

#[test]
fn stale_ids_are_replaced_by_pattern_matches() {
    let table = ScriptedTable {
        patterns: [
            ("promtail-", vec![2200, 2100]),
            ("grafana-server", vec![3300]),
        ]
        .into_iter()
        .collect(),
        ..ScriptedTable::with_alive(&[1000, 2100, 2200, 3300])
    };
    let mut pid_file = full_registry();

    assert!(check_services_running(&mut pid_file, &table));
    assert_eq!(pid_file.pid_for(ServiceName::Loki), Some(1000));
    assert_eq!(pid_file.pid_for(ServiceName::Promtail), Some(2200));
    assert_eq!(pid_file.pid_for(ServiceName::Grafana), Some(3300));
}

#[test]
fn liveness_is_reported_per_service() {
    let table = ScriptedTable::with_alive(&[2000]);
    let mut pid_file = full_registry();

    let liveness = service_liveness(&mut pid_file, &table);
    assert!(!liveness[&ServiceName::Loki]);
    assert!(liveness[&ServiceName::Promtail]);
    assert!(!liveness[&ServiceName::Grafana]);
}

#[test]
fn empty_registry_is_never_running() {
    let table = ScriptedTable::with_alive(&[1]);
    assert!(!check_services_running(&mut PidFile::default(), &table));
}

#[test]
fn sweeps_group_matches_by_service() {
    let table = ScriptedTable {
        patterns: [("loki-", vec![11, 12]), ("grafana-server", vec![31])]
            .into_iter()
            .collect(),
        ..ScriptedTable::with_alive(&[11, 12, 31])
    };

    let found = find_service_processes(&table);
    assert_eq!(found.len(), 2);
    assert_eq!(found[&ServiceName::Loki], vec![11, 12]);
    assert!(!found.contains_key(&ServiceName::Promtail));
}

#[test]
fn system_table_tracks_a_real_child() {
    let _lock = process_lock();
    let mut child = spawn_sleeper(30);
    let pid = child.id();
    let table = SystemProcessTable;

    assert!(table.is_alive(pid));
    assert!(is_process_alive(pid));

    table.signal(pid, Signal::SIGKILL).expect("failed to kill child");
    child.wait().expect("failed to reap child");
    assert!(!table.is_alive(pid));
}

#[test]
fn unused_pid_is_dead() {
    assert!(!SystemProcessTable.is_alive(i32::MAX as u32));
    assert!(!SystemProcessTable.is_alive(0));
}

#[test]
fn tcp_probe_distinguishes_open_and_closed_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = listener.local_addr().unwrap().port();
    let probe = TcpProbe::new(Duration::from_millis(200));

    assert!(probe.is_reachable(probe_host("0.0.0.0"), port));
    drop(listener);
    assert!(!probe.is_reachable("127.0.0.1", port));
}

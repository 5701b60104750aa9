#[path = "common/mod.rs"]
mod common;

use std::{
    process::Command,
    time::{Duration, Instant},
};

use common::{ScriptedTable, is_process_alive, process_lock, spawn_sleeper, wait_for_process_exit};
use lokikit::{
    probe::SystemProcessTable,
    registry::PidFile,
    service::ServiceName,
    terminate::{StopOutcome, Terminator},
};
use nix::sys::signal::Signal;

#[test]
fn unkillable_process_is_escalated_and_reported_failed() {
    let table = ScriptedTable {
        immortal: vec![1000],
        ..ScriptedTable::with_alive(&[1000])
    };
    let pid_file: PidFile = [(ServiceName::Loki, 1000)].into_iter().collect();

    let report = Terminator::new(&table)
        .with_windows(5, 3, Duration::from_millis(20))
        .stop_services(&pid_file, false);

    assert!(matches!(report.outcomes[&ServiceName::Loki], StopOutcome::Failed(_)));
    assert_eq!(report.failed(), vec![ServiceName::Loki]);
    assert_eq!(table.signals_for(1000), vec![Signal::SIGTERM, Signal::SIGKILL]);
}

#[test]
fn kill_is_sent_only_after_the_graceful_window() {
    let table = ScriptedTable {
        immortal: vec![7],
        ..ScriptedTable::with_alive(&[7])
    };
    let interval = Duration::from_millis(20);
    let terminator = Terminator::new(&table).with_windows(10, 2, interval);

    terminator.stop_pid(ServiceName::Grafana, 7, false);

    let sent = table.sent.borrow();
    assert_eq!(sent.len(), 2);
    let (_, first, term_at) = sent[0];
    let (_, second, kill_at) = sent[1];
    assert_eq!(first, Signal::SIGTERM);
    assert_eq!(second, Signal::SIGKILL);
    assert!(kill_at.duration_since(term_at) >= interval * 10);
}

#[test]
fn force_skips_the_graceful_signal() {
    let table = ScriptedTable::with_alive(&[9]);
    let outcome = Terminator::new(&table).stop_pid(ServiceName::Promtail, 9, true);

    assert_eq!(outcome, StopOutcome::Killed);
    assert_eq!(table.signals_for(9), vec![Signal::SIGKILL]);
}

#[test]
fn mixed_registry_reports_each_service() {
    let table = ScriptedTable {
        immortal: vec![30],
        ..ScriptedTable::with_alive(&[10, 30])
    };
    let pid_file: PidFile = [
        (ServiceName::Loki, 10),
        (ServiceName::Promtail, 20),
        (ServiceName::Grafana, 30),
    ]
    .into_iter()
    .collect();

    let report = Terminator::new(&table)
        .with_windows(2, 2, Duration::from_millis(5))
        .stop_services(&pid_file, false);

    assert_eq!(report.outcomes[&ServiceName::Loki], StopOutcome::Terminated);
    assert_eq!(report.outcomes[&ServiceName::Promtail], StopOutcome::AlreadyStopped);
    assert!(matches!(report.outcomes[&ServiceName::Grafana], StopOutcome::Failed(_)));
    assert!(!report.all_stopped());
    assert_eq!(report.failed(), vec![ServiceName::Grafana]);
}

#[test]
fn real_process_stops_on_sigterm() {
    let _lock = process_lock();
    let mut child = spawn_sleeper(30);
    let pid = child.id();
    let reaper = std::thread::spawn(move || child.wait());

    let started = Instant::now();
    let outcome = Terminator::new(SystemProcessTable).stop_pid(ServiceName::Loki, pid, false);

    assert_eq!(outcome, StopOutcome::Terminated);
    assert!(started.elapsed() < Duration::from_secs(2));
    reaper.join().unwrap().expect("failed to reap child");
    assert!(!is_process_alive(pid));
}

#[test]
fn real_process_ignoring_sigterm_is_killed() {
    let _lock = process_lock();
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg("trap '' TERM; while :; do sleep 1; done")
        .spawn()
        .expect("failed to spawn shell");
    let pid = child.id();
    std::thread::sleep(Duration::from_millis(200));

    let outcome = Terminator::new(SystemProcessTable)
        .with_windows(5, 20, Duration::from_millis(100))
        .stop_pid(ServiceName::Grafana, pid, false);

    assert_eq!(outcome, StopOutcome::Killed);
    child.wait().expect("failed to reap shell");
    wait_for_process_exit(pid);
}

#[path = "common/mod.rs"]
mod common;

use std::{
    cell::RefCell,
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use common::{
    RecordingTable, ScriptedTable, install_binaries_with, install_fake_binaries,
    is_process_alive, process_lock, wait_for_process_exit, write_script,
};
use lokikit::{
    config::Config,
    error::ProcessManagerError,
    probe::{ProcessTable, SystemProcessTable},
    readiness::ReadinessOutcome,
    registry::PidFile,
    runtime::ShutdownSignal,
    service::ServiceName,
    supervisor::{StartOptions, StartOutcome, StatusKind, Supervisor},
    terminate::StopOutcome,
};
use tempfile::tempdir;

type Probe = fn(&str, u16) -> bool;

fn always_up(_: &str, _: u16) -> bool {
    true
}

fn never_up(_: &str, _: u16) -> bool {
    false
}

fn supervisor(
    base: &Path,
    probe: Probe,
    shutdown: ShutdownSignal,
) -> Supervisor<SystemProcessTable, Probe> {
    supervisor_with(base, SystemProcessTable, probe, shutdown)
}

fn supervisor_with<T: ProcessTable>(
    base: &Path,
    table: T,
    probe: Probe,
    shutdown: ShutdownSignal,
) -> Supervisor<T, Probe> {
    let config = Config {
        base_dir: base.to_path_buf(),
        loki_port: 43100,
        promtail_port: 49080,
        grafana_port: 43000,
        ..Config::default()
    };
    Supervisor::new(config, shutdown, table, probe)
        .with_poll_interval(Duration::from_millis(50))
        .with_termination_windows(20, 10, Duration::from_millis(50))
}

fn background(timeout: Duration) -> StartOptions {
    StartOptions {
        background: true,
        force: false,
        timeout,
    }
}

/// Raises `shutdown` once the registry appears, returning the pids it listed.
fn interrupt_once_registered(base: &Path, shutdown: ShutdownSignal) -> thread::JoinHandle<Vec<u32>> {
    let base = base.to_path_buf();
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut pids = Vec::new();
        while Instant::now() < deadline {
            pids = tracked_pids(&base);
            if pids.len() == ServiceName::ALL.len() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        thread::sleep(Duration::from_millis(300));
        shutdown.trigger();
        pids
    })
}

fn tracked_pids(base: &Path) -> Vec<u32> {
    PidFile::load(base)
        .unwrap()
        .map(|pid_file| pid_file.services().values().copied().collect())
        .unwrap_or_default()
}

#[test]
fn background_start_status_and_stop() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    install_fake_binaries(base);
    let sup = supervisor(base, always_up, ShutdownSignal::new());

    let outcome = sup.start(background(Duration::from_secs(5))).unwrap();
    match outcome {
        StartOutcome::Started { readiness } => {
            assert_eq!(readiness.outcome, ReadinessOutcome::AllReady)
        }
        other => panic!("expected a fresh start, got {other:?}"),
    }

    let pids = tracked_pids(base);
    assert_eq!(pids.len(), 3);
    assert!(pids.iter().all(|pid| is_process_alive(*pid)));
    assert!(base.join("logs").join("grafana.log").exists());
    assert!(
        base.join("grafana-v11.0.0/conf/provisioning/datasources/lokikit.yaml")
            .exists()
    );

    let status = sup.status().unwrap();
    assert_eq!(status.kind, StatusKind::Running);
    assert!(status.reachable.values().all(|up| *up));

    let again = sup.start(background(Duration::from_secs(5))).unwrap();
    assert_eq!(again, StartOutcome::AlreadyRunning);
    assert_eq!(tracked_pids(base), pids);

    let summary = sup.stop(false).unwrap();
    let report = summary.tracked.clone().expect("registry should have been used");
    assert!(
        report
            .outcomes
            .values()
            .all(|outcome| *outcome == StopOutcome::Terminated)
    );
    assert!(summary.all_stopped());
    assert!(summary.pid_file_removed);
    for pid in pids {
        wait_for_process_exit(pid);
    }
    assert_eq!(sup.status().unwrap().kind, StatusKind::NotRunning);
}

#[test]
fn readiness_timeout_still_records_the_launched_services() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    install_fake_binaries(base);
    let sup = supervisor(base, never_up, ShutdownSignal::new());

    match sup.start(background(Duration::from_millis(300))).unwrap() {
        StartOutcome::Started { readiness } => {
            assert_eq!(readiness.outcome, ReadinessOutcome::TimedOut);
            assert_eq!(readiness.not_ready(), ServiceName::ALL.to_vec());
        }
        other => panic!("expected a started outcome, got {other:?}"),
    }

    let pids = tracked_pids(base);
    assert_eq!(pids.len(), 3);

    assert!(sup.stop(false).unwrap().all_stopped());
    for pid in pids {
        wait_for_process_exit(pid);
    }
}

#[test]
fn forced_start_replaces_running_services() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    install_fake_binaries(base);
    let sup = supervisor(base, always_up, ShutdownSignal::new());

    sup.start(background(Duration::from_secs(5))).unwrap();
    let first = tracked_pids(base);

    let options = StartOptions {
        force: true,
        ..background(Duration::from_secs(5))
    };
    assert!(matches!(sup.start(options).unwrap(), StartOutcome::Started { .. }));
    let second = tracked_pids(base);

    assert_eq!(second.len(), 3);
    for pid in &first {
        assert!(!second.contains(pid));
        wait_for_process_exit(*pid);
    }

    sup.stop(true).unwrap();
    for pid in second {
        wait_for_process_exit(pid);
    }
}

#[test]
fn launch_failure_stops_already_launched_services() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    let marker = base.join("loki.started");
    let binaries = install_binaries_with(
        base,
        &format!("echo $$ > {}; exec sleep 30", marker.display()),
    );
    // Present but not executable, so spawning promtail fails.
    fs::set_permissions(
        &binaries[&ServiceName::Promtail],
        fs::Permissions::from_mode(0o644),
    )
    .unwrap();

    let err = supervisor(base, always_up, ShutdownSignal::new())
        .start(background(Duration::from_secs(5)))
        .unwrap_err();

    match err {
        ProcessManagerError::ServiceStartError { service, .. } => {
            assert_eq!(service, ServiceName::Promtail)
        }
        other => panic!("expected a start error, got {other:?}"),
    }
    assert!(!PidFile::path(base).exists());
    if let Ok(pid) = fs::read_to_string(&marker) {
        wait_for_process_exit(pid.trim().parse().unwrap());
    }
}

#[test]
fn interrupt_during_readiness_stops_everything() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    install_fake_binaries(base);
    let shutdown = ShutdownSignal::new();
    shutdown.trigger();

    let outcome = supervisor(base, never_up, shutdown)
        .start(background(Duration::from_secs(30)))
        .unwrap();

    assert_eq!(outcome, StartOutcome::Interrupted);
    assert!(!PidFile::path(base).exists());
}

#[test]
fn foreground_returns_once_every_service_has_exited() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    install_binaries_with(base, "exit 2");

    let options = StartOptions {
        background: false,
        ..background(Duration::from_secs(5))
    };
    let outcome = supervisor(base, never_up, ShutdownSignal::new())
        .start(options)
        .unwrap();

    match outcome {
        StartOutcome::Started { readiness } => assert!(matches!(
            readiness.outcome,
            ReadinessOutcome::ProcessExited { .. }
        )),
        other => panic!("expected a started outcome, got {other:?}"),
    }
    assert!(!PidFile::path(base).exists());
}

#[test]
fn interrupt_in_foreground_stops_every_child_and_clears_the_registry() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    install_fake_binaries(base);
    let shutdown = ShutdownSignal::new();
    let watcher = interrupt_once_registered(base, shutdown.clone());

    let options = StartOptions {
        background: false,
        ..background(Duration::from_secs(5))
    };
    let outcome = supervisor(base, always_up, shutdown).start(options).unwrap();
    let pids = watcher.join().unwrap();

    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert_eq!(pids.len(), 3);
    for pid in pids {
        wait_for_process_exit(pid);
    }
    assert!(!PidFile::path(base).exists());
}

#[test]
fn interrupt_while_already_running_leaves_services_alone() {
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    let table = ScriptedTable {
        alive: RefCell::new(vec![10, 20, 30]),
        ..ScriptedTable::default()
    };
    let registry: PidFile = [
        (ServiceName::Loki, 10),
        (ServiceName::Promtail, 20),
        (ServiceName::Grafana, 30),
    ]
    .into_iter()
    .collect();
    registry.save(base).unwrap();

    let shutdown = ShutdownSignal::new();
    let remote = shutdown.clone();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        remote.trigger();
    });

    let options = StartOptions {
        background: false,
        ..background(Duration::from_secs(5))
    };
    let outcome = supervisor_with(base, &table, always_up, shutdown)
        .start(options)
        .unwrap();
    trigger.join().unwrap();

    assert_eq!(outcome, StartOutcome::AlreadyRunning);
    assert!(table.sent.borrow().is_empty());
    assert_eq!(*table.alive.borrow(), vec![10, 20, 30]);
    assert_eq!(PidFile::load(base).unwrap(), Some(registry));
}

#[test]
fn interrupt_after_a_child_exited_only_signals_live_children() {
    let _lock = process_lock();
    let dir = tempdir().expect("failed to create tempdir");
    let base = dir.path();
    let binaries = install_fake_binaries(base);
    let marker = base.join("loki.pid.out");
    write_script(
        &binaries[&ServiceName::Loki],
        &format!("echo $$ > {}; exit 2", marker.display()),
    );

    let table = RecordingTable::default();
    let shutdown = ShutdownSignal::new();
    let watcher = interrupt_once_registered(base, shutdown.clone());

    let options = StartOptions {
        background: false,
        ..background(Duration::from_secs(5))
    };
    let outcome = supervisor_with(base, &table, never_up, shutdown)
        .start(options)
        .unwrap();
    let registered = watcher.join().unwrap();

    match outcome {
        StartOutcome::Started { readiness } => assert!(matches!(
            readiness.outcome,
            ReadinessOutcome::ProcessExited {
                service: ServiceName::Loki,
                ..
            }
        )),
        other => panic!("expected a started outcome, got {other:?}"),
    }

    let loki_pid: u32 = fs::read_to_string(&marker)
        .expect("loki stand-in should have recorded its pid")
        .trim()
        .parse()
        .unwrap();
    let signalled = table.signalled_pids();
    assert!(!signalled.contains(&loki_pid));
    assert_eq!(signalled.len(), 2);
    for pid in registered.into_iter().filter(|pid| *pid != loki_pid) {
        wait_for_process_exit(pid);
    }
    assert!(!PidFile::path(base).exists());
}

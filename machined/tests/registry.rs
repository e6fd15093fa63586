//! Registration rules, stats refresh, spawning and the on-disk process table.

mod common;

use common::{process, FakeLauncher, FakeProcesses};
use machined::launcher::SpawnError;
use machined::registry::{
    launch_spec, ProcessFilter, ProcessRegistry, RestoreReport, SpawnRequest, TIMING_METHOD_ENV,
};
use machined::users::UserEnv;
use machined::wire::{param, Category, ProcessAction, ProcessMessage};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

fn registry_with(probe: &mut FakeProcesses, procs: &[(u32, u16, &str)]) -> ProcessRegistry {
    let mut reg = ProcessRegistry::new();
    for &(pid, port, name) in procs {
        probe.spawn(pid, 1000 + pid as u64);
        reg.register(process(pid, port, name), probe);
    }
    reg
}

#[test]
fn same_port_evicts_the_earlier_registrant() {
    let mut probe = FakeProcesses::default();
    let mut reg = registry_with(&mut probe, &[(100, 7000, "cellapp")]);

    probe.spawn(200, 5);
    let outcome = reg.register(process(200, 7000, "baseapp"), &mut probe);
    assert!(!outcome.reregistered);
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(outcome.evicted[0].msg.pid, 100);
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.records()[0].msg.pid, 200);
}

#[test]
fn port_zero_never_clashes() {
    let mut probe = FakeProcesses::default();
    let reg = registry_with(&mut probe, &[(100, 0, "a"), (200, 0, "b")]);
    assert_eq!(reg.len(), 2);
}

#[test]
fn same_pid_with_a_new_name_replaces_the_record() {
    let mut probe = FakeProcesses::default();
    let mut reg = registry_with(&mut probe, &[(100, 7000, "cellapp")]);
    let outcome = reg.register(process(100, 7001, "baseapp"), &mut probe);
    assert_eq!(outcome.evicted.len(), 1);
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.records()[0].msg.name, "baseapp");
}

#[test]
fn identical_registration_updates_in_place() {
    let mut probe = FakeProcesses::default();
    let mut reg = registry_with(&mut probe, &[(100, 7000, "cellapp"), (200, 7001, "baseapp")]);
    let mut again = process(100, 7000, "cellapp");
    again.id = 9;
    again.param = ProcessAction::Register.param();
    let outcome = reg.register(again, &mut probe);
    assert!(outcome.reregistered);
    assert!(outcome.evicted.is_empty());
    assert_eq!(reg.len(), 2);
    let rec = &reg.records()[0];
    assert_eq!(rec.msg.id, 9);
    // the stored copy is a plain record, not a command
    assert_eq!(rec.msg.param, 0);
}

#[test]
fn registration_samples_the_process() {
    let mut probe = FakeProcesses::default();
    let reg = registry_with(&mut probe, &[(100, 7000, "cellapp")]);
    let rec = &reg.records()[0];
    assert_eq!(rec.start_time, 1100);
    assert_eq!(rec.cpu.cur(), 10);
    assert_eq!(rec.cpu.prev(), 10);
    assert_eq!(rec.mem.cur(), 256);
}

#[test]
fn refresh_drops_dead_and_reused_pids() {
    let mut probe = FakeProcesses::default();
    let mut reg = registry_with(
        &mut probe,
        &[(100, 7000, "a"), (200, 7001, "b"), (300, 7002, "c")],
    );
    probe.kill(100);
    // pid 200 now belongs to something started later
    probe.spawn(200, 99_999);
    probe.burn(300, 40);

    let gone = reg.refresh_stats(&mut probe);
    let mut gone_pids: Vec<u32> = gone.iter().map(|r| r.msg.pid).collect();
    gone_pids.sort_unstable();
    assert_eq!(gone_pids, vec![100, 200]);
    assert_eq!(reg.len(), 1);
    assert_eq!(reg.records()[0].cpu.delta(), 40);
}

#[test]
fn deregister_by_pid() {
    let mut probe = FakeProcesses::default();
    let mut reg = registry_with(&mut probe, &[(100, 7000, "a"), (200, 7001, "b")]);
    assert_eq!(reg.deregister(100).map(|r| r.msg.name), Some("a".to_string()));
    assert!(reg.deregister(100).is_none());
    assert_eq!(reg.len(), 1);
}

#[test]
fn query_bits_select_filters() {
    let q = ProcessMessage {
        param: param::USE_UID | param::USE_NAME,
        uid: 1000,
        name: "cellapp".into(),
        pid: 5,
        ..Default::default()
    };
    let f = ProcessFilter::from_query(&q);
    assert_eq!(f.uid, Some(1000));
    assert_eq!(f.name.as_deref(), Some("cellapp"));
    assert_eq!(f.pid, None);
    assert!(f.matches(&process(1, 0, "cellapp")));
    assert!(!f.matches(&process(1, 0, "baseapp")));

    // a command message is not a query and selects everything
    let cmd = ProcessMessage {
        param: ProcessAction::Find.param() | param::USE_UID,
        uid: 1,
        ..Default::default()
    };
    assert_eq!(ProcessFilter::from_query(&cmd), ProcessFilter::default());

    let cat = ProcessFilter {
        category: Some(Category::WatcherNub),
        ..Default::default()
    };
    assert!(!cat.matches(&process(1, 0, "x")));
}

#[test]
fn signal_goes_to_matching_processes_only() {
    let mut probe = FakeProcesses::default();
    let reg = registry_with(&mut probe, &[(100, 7000, "a"), (200, 7001, "b")]);
    let mut launcher = FakeLauncher::default();
    let filter = ProcessFilter {
        name: Some("b".into()),
        ..Default::default()
    };
    assert_eq!(reg.signal(&filter, 15, &mut launcher), vec![200]);
    assert_eq!(*launcher.signals.borrow(), vec![(200, 15)]);
}

#[test]
fn save_then_restore_keeps_live_processes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("machined.state");
    let mut probe = FakeProcesses::default();
    let reg = registry_with(
        &mut probe,
        &[(100, 7000, "a"), (200, 7001, "b"), (300, 7002, "c")],
    );
    assert_eq!(reg.save(&path).unwrap(), 3);
    assert!(path.exists());

    probe.kill(100);
    probe.spawn(200, 1); // pid reused
    let mut restored = ProcessRegistry::new();
    let report = restored
        .restore(&path, Duration::from_secs(600), &mut probe)
        .unwrap();
    assert_eq!(
        report,
        RestoreReport {
            restored: 1,
            dropped: 2
        }
    );
    assert_eq!(restored.records()[0], reg.records()[2]);
    // consumed either way
    assert!(!path.exists());
}

#[test]
fn stale_state_file_is_discarded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("machined.state");
    let mut probe = FakeProcesses::default();
    let reg = registry_with(&mut probe, &[(100, 7000, "a")]);
    reg.save(&path).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let mut restored = ProcessRegistry::new();
    let report = restored.restore(&path, Duration::ZERO, &mut probe).unwrap();
    assert_eq!(report, RestoreReport::default());
    assert!(restored.is_empty());
    assert!(!path.exists());
}

#[test]
fn missing_state_file_restores_nothing() {
    let dir = tempdir().unwrap();
    let mut reg = ProcessRegistry::new();
    let report = reg
        .restore(
            &dir.path().join("absent"),
            Duration::from_secs(600),
            &mut FakeProcesses::default(),
        )
        .unwrap();
    assert_eq!(report, RestoreReport::default());
}

#[test]
fn corrupt_state_file_is_an_error_and_removed() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("machined.state");
    std::fs::write(&path, [50, 0, 0, 0, 1, 2]).unwrap();
    let mut reg = ProcessRegistry::new();
    assert!(reg
        .restore(&path, Duration::from_secs(600), &mut FakeProcesses::default())
        .is_err());
    assert!(!path.exists());
}

fn alice() -> UserEnv {
    UserEnv {
        uid: 1000,
        gid: 100,
        username: "alice".into(),
        full_name: "Alice".into(),
        home: "/home/alice".into(),
        fsroot: "/home/alice/mf".into(),
        respath: "/home/alice/res".into(),
    }
}

fn spawn_request<'a>(user: &'a UserEnv, exe: &'a str, config: &'a str) -> SpawnRequest<'a> {
    SpawnRequest {
        user,
        exe,
        config,
        architecture: "64",
        timing_method: "gettime",
        args: vec!["-machined".into()],
    }
}

#[test]
fn launch_spec_resolves_paths_args_and_env() {
    let user = alice();
    let spec = launch_spec(&spawn_request(&user, "cellapp", "Hybrid")).unwrap();
    assert_eq!(spec.exe, PathBuf::from("/home/alice/mf/bin/Hybrid64/cellapp"));
    assert_eq!(spec.cwd, PathBuf::from("/home/alice/mf/bin/Hybrid64"));
    assert_eq!(spec.args, vec!["-machined", "--res", "/home/alice/res"]);
    assert_eq!((spec.uid, spec.gid), (1000, 100));
    assert!(spec
        .env
        .contains(&(TIMING_METHOD_ENV.to_string(), "gettime".to_string())));
    assert!(spec
        .env
        .contains(&("HOME".to_string(), "/home/alice".to_string())));
}

#[test]
fn launch_spec_rejects_escapes_and_missing_environments() {
    let user = alice();
    assert!(matches!(
        launch_spec(&spawn_request(&user, "../../bin/sh", "Hybrid")),
        Err(SpawnError::IllegalPath(_))
    ));
    assert!(matches!(
        launch_spec(&spawn_request(&user, "cellapp", "..")),
        Err(SpawnError::IllegalPath(_))
    ));
    let bare = UserEnv {
        fsroot: String::new(),
        ..alice()
    };
    assert!(matches!(
        launch_spec(&spawn_request(&bare, "cellapp", "Hybrid")),
        Err(SpawnError::NoEnvironment(_))
    ));
}

#[test]
fn spawn_hands_the_spec_to_the_launcher() {
    let user = alice();
    let mut launcher = FakeLauncher::default();
    let reg = ProcessRegistry::new();
    let pid = reg
        .spawn(&mut launcher, &spawn_request(&user, "cellapp", "Debug"))
        .unwrap();
    assert_eq!(pid, 4001);
    assert_eq!(
        launcher.spawned.borrow()[0].exe,
        PathBuf::from("/home/alice/mf/bin/Debug64/cellapp")
    );
}

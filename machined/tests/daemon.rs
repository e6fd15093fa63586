//! Request handling, driven through `Daemon::handle_datagram` with fakes.

mod common;

use common::{account, broadcasts, ip, packet_bytes, process, sent_to, Fakes};
use machined::config::MachinedConfig;
use machined::daemon::{Daemon, SocketKind};
use machined::wire::{
    flags, param, user_param, Body, CreateMessage, ListenerKind, Message, Packet, ProcessAction,
    ProcessMessage, UserMessage, WireWriter, UID_NOT_FOUND,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

const ME: u8 = 1;

fn local() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40_000)
}

fn remote() -> SocketAddrV4 {
    SocketAddrV4::new(ip(2), 40_000)
}

fn started(fakes: &Fakes, config: MachinedConfig) -> Daemon {
    let mut d = fakes.daemon(ip(ME), config);
    d.start(0);
    d.drain_outbox();
    d
}

/// Send one request and return the decoded reply messages sent back to `from`.
fn ask(d: &mut Daemon, body: Body, from: SocketAddrV4) -> Vec<Message> {
    let bytes = packet_bytes(vec![Message::request(42, body)]);
    d.handle_datagram(10, &bytes, from, SocketKind::Internal);
    let out = d.drain_outbox();
    sent_to(&out, from)
        .into_iter()
        .flat_map(|p| p.messages)
        .collect()
}

fn register(pm: ProcessMessage) -> Body {
    Body::Process(ProcessMessage {
        param: ProcessAction::Register.param(),
        ..pm
    })
}

#[test]
fn unknown_kind_is_echoed_back_not_understood() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    let mut w = WireWriter::new();
    w.u8(0); // flags
    w.addr(Ipv4Addr::UNSPECIFIED);
    w.u16(6);
    w.u8(200);
    w.u8(0);
    w.u16(0x0505);
    w.bytes(&[1, 2]);
    d.handle_datagram(10, w.as_slice(), remote(), SocketKind::Internal);

    let out = d.drain_outbox();
    let replies = sent_to(&out, remote());
    assert_eq!(replies.len(), 1);
    let echo = &replies[0].messages[0];
    assert_eq!(echo.flags, flags::NOT_UNDERSTOOD | flags::OUTGOING);
    assert_eq!(echo.seq, 0x0505);
    assert_eq!(
        echo.body,
        Body::Unknown {
            kind: 200,
            data: vec![1, 2]
        }
    );
}

#[test]
fn not_understood_replies_are_never_echoed_again() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    let msg = Message::request(1, Body::Unknown { kind: 200, data: vec![] })
        .into_not_understood()
        .unwrap();
    d.handle_datagram(10, &packet_bytes(vec![msg]), remote(), SocketKind::Internal);
    assert!(d.drain_outbox().is_empty());
}

#[test]
fn malformed_packets_are_dropped() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    d.handle_datagram(10, &[0, 1, 2], remote(), SocketKind::Internal);
    assert!(d.drain_outbox().is_empty());
}

#[test]
fn registration_from_another_machine_is_refused() {
    let fakes = Fakes::default();
    fakes.processes.spawn(300, 1);
    let mut d = started(&fakes, MachinedConfig::default());
    let replies = ask(&mut d, register(process(300, 7000, "cellapp")), remote());
    assert!(replies[0].is_not_understood());
    assert!(d.registry().is_empty());
}

#[test]
fn local_registration_is_acked_and_broadcast() {
    let fakes = Fakes {
        accounts: common::FakeAccounts(vec![account(1000, "alice", "/nonexistent/alice")]),
        ..Fakes::default()
    };
    fakes.processes.spawn(300, 1);
    let mut d = started(&fakes, MachinedConfig::default());

    let bytes = packet_bytes(vec![Message::request(
        42,
        register(process(300, 7000, "cellapp")),
    )]);
    d.handle_datagram(10, &bytes, local(), SocketKind::Local);
    let out = d.drain_outbox();

    let ack = &sent_to(&out, local())[0].messages[0];
    assert!(ack.is_outgoing());
    let Body::Process(acked) = &ack.body else {
        panic!("expected a process ack");
    };
    assert_eq!(acked.pid, 300);
    // filled in from the account database
    assert_eq!(acked.username(), Some("alice"));
    assert_eq!(out.iter().find(|d| d.dest == local()).map(|d| d.via), Some(SocketKind::Local));

    let notified = broadcasts(&out);
    let Body::Process(birth) = &notified[0].messages[0].body else {
        panic!("expected a birth notification");
    };
    assert_eq!(birth.action(), Some(ProcessAction::NotifyBirth));
    assert_eq!(d.registry().len(), 1);
}

#[test]
fn port_clash_announces_the_evicted_process_dead() {
    let fakes = Fakes::default();
    fakes.processes.spawn(300, 1);
    fakes.processes.spawn(301, 1);
    let mut d = started(&fakes, MachinedConfig::default());
    ask(&mut d, register(process(300, 7000, "cellapp")), local());

    let bytes = packet_bytes(vec![Message::request(
        43,
        register(process(301, 7000, "cellapp")),
    )]);
    d.handle_datagram(20, &bytes, local(), SocketKind::Local);
    let out = d.drain_outbox();
    let actions: Vec<(Option<ProcessAction>, u32)> = common::bodies(&broadcasts(&out))
        .into_iter()
        .filter_map(|b| match b {
            Body::Process(p) => Some((p.action(), p.pid)),
            _ => None,
        })
        .collect();
    assert_eq!(
        actions,
        vec![
            (Some(ProcessAction::NotifyDeath), 300),
            (Some(ProcessAction::NotifyBirth), 301)
        ]
    );
}

#[test]
fn deregistration_is_acked_and_announced() {
    let fakes = Fakes::default();
    fakes.processes.spawn(300, 1);
    let mut d = started(&fakes, MachinedConfig::default());
    ask(&mut d, register(process(300, 7000, "cellapp")), local());

    let dereg = Body::Process(ProcessMessage {
        param: ProcessAction::Deregister.param(),
        ..process(300, 7000, "cellapp")
    });
    let bytes = packet_bytes(vec![Message::request(44, dereg)]);
    d.handle_datagram(20, &bytes, local(), SocketKind::Local);
    let out = d.drain_outbox();
    assert_eq!(sent_to(&out, local()).len(), 1);
    assert!(d.registry().is_empty());
    let Body::Process(death) = &broadcasts(&out)[0].messages[0].body else {
        panic!("expected a death notification");
    };
    assert_eq!(death.action(), Some(ProcessAction::NotifyDeath));
}

#[test]
fn birth_notifications_are_relayed_to_local_listeners() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    let listener = Body::Listener {
        process: ProcessMessage {
            param: ListenerKind::Birth.param(),
            uid: machined::wire::ANY_UID,
            port: 9100,
            ..Default::default()
        },
        pre_addr: b"hi".to_vec(),
        post_addr: Vec::new(),
    };
    let acked = ask(&mut d, listener, local());
    assert_eq!(acked.len(), 1);
    assert_eq!(d.listeners().len(), 1);

    // a process on another machine was born
    let notify = Body::Process(ProcessMessage {
        param: ProcessAction::NotifyBirth.param(),
        ..process(555, 0x2233, "cellapp")
    });
    let bytes = packet_bytes(vec![Message::request(1, notify)]);
    d.handle_datagram(30, &bytes, SocketAddrV4::new(ip(3), 20018), SocketKind::Broadcast);
    let out = d.drain_outbox();
    let to_listener: Vec<_> = out
        .iter()
        .filter(|g| g.dest == SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9100))
        .collect();
    assert_eq!(to_listener.len(), 1);
    assert_eq!(to_listener[0].bytes, vec![b'h', b'i', 10, 0, 0, 3, 0x22, 0x33]);
}

#[test]
fn process_stats_with_no_match_reply_with_pid_zero() {
    let fakes = Fakes::default();
    fakes.processes.spawn(300, 1);
    let mut d = started(&fakes, MachinedConfig::default());
    ask(&mut d, register(process(300, 7000, "cellapp")), local());

    let query = |name: &str| Body::ProcessStats {
        process: ProcessMessage {
            param: param::USE_NAME,
            name: name.into(),
            ..Default::default()
        },
        cpu: 0,
        mem: 0,
    };
    let hit = ask(&mut d, query("cellapp"), remote());
    assert!(matches!(&hit[0].body, Body::ProcessStats { process, .. } if process.pid == 300));

    let miss = ask(&mut d, query("baseapp"), remote());
    assert_eq!(miss.len(), 1);
    assert!(matches!(&miss[0].body, Body::ProcessStats { process, .. } if process.pid == 0));
}

#[test]
fn find_echoes_the_query_with_pid_zero_on_no_match() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    let q = ProcessMessage {
        param: param::USE_NAME,
        name: "dbmgr".into(),
        ..Default::default()
    };
    let replies = ask(&mut d, Body::Process(q), remote());
    assert!(matches!(&replies[0].body, Body::Process(p) if p.pid == 0 && p.name == "dbmgr"));
}

fn tagged_config() -> MachinedConfig {
    MachinedConfig::parse(
        "alice;/srv/alice/mf;/srv/alice/res\n\
         [machined]\narchitecture=64\ntiming_method=rdtsc\n\
         [Components]\ncellapp\nbaseapp\n",
    )
    .unwrap()
}

#[test]
fn tags_query_needs_exactly_one_tag() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, tagged_config());

    let r = ask(
        &mut d,
        Body::Tags {
            tags: vec!["Components".into()],
            exists: false,
        },
        remote(),
    );
    assert_eq!(
        r[0].body,
        Body::Tags {
            tags: vec!["cellapp".into(), "baseapp".into()],
            exists: true
        }
    );

    let r = ask(
        &mut d,
        Body::Tags {
            tags: vec!["Nope".into()],
            exists: false,
        },
        remote(),
    );
    assert_eq!(
        r[0].body,
        Body::Tags {
            tags: vec![],
            exists: false
        }
    );

    let r = ask(
        &mut d,
        Body::Tags {
            tags: vec!["a".into(), "b".into()],
            exists: false,
        },
        remote(),
    );
    assert!(r[0].is_not_understood());
}

fn create(uid: u16) -> Body {
    Body::Create(CreateMessage {
        name: "cellapp".into(),
        config: "Hybrid".into(),
        uid,
        recover: true,
        forward_ip: Ipv4Addr::new(10, 0, 0, 9),
        forward_port: 5000,
    })
}

#[test]
fn create_spawns_from_the_users_build_directory() {
    let fakes = Fakes {
        accounts: common::FakeAccounts(vec![account(1000, "alice", "/nonexistent/alice")]),
        ..Fakes::default()
    };
    let mut d = started(&fakes, tagged_config());
    let r = ask(&mut d, create(1000), remote());
    assert_eq!(
        r[0].body,
        Body::Pid {
            pid: 4001,
            running: true
        }
    );
    let spawned = fakes.launcher.spawned.borrow();
    let spec = &spawned[0];
    assert_eq!(spec.exe, PathBuf::from("/srv/alice/mf/bin/Hybrid64/cellapp"));
    assert_eq!(
        spec.args,
        vec![
            "-machined",
            "-recover",
            "-forward",
            "10.0.0.9:5000",
            "--res",
            "/srv/alice/res"
        ]
    );
    assert!(spec
        .env
        .contains(&("MACHINED_TIMING_METHOD".to_string(), "rdtsc".to_string())));
}

#[test]
fn create_for_an_unknown_user_replies_pid_zero() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, tagged_config());
    let r = ask(&mut d, create(4242), remote());
    assert_eq!(
        r[0].body,
        Body::Pid {
            pid: 0,
            running: false
        }
    );
    assert!(fakes.launcher.spawned.borrow().is_empty());
}

#[test]
fn signal_has_no_reply() {
    let fakes = Fakes::default();
    fakes.processes.spawn(300, 1);
    let mut d = started(&fakes, MachinedConfig::default());
    ask(&mut d, register(process(300, 7000, "cellapp")), local());
    let r = ask(
        &mut d,
        Body::Signal {
            process: ProcessMessage::default(),
            signal: 15,
        },
        remote(),
    );
    assert!(r.is_empty());
    assert_eq!(*fakes.launcher.signals.borrow(), vec![(300, 15)]);
}

#[test]
fn user_lookup_misses_report_uid_not_found() {
    let fakes = Fakes {
        accounts: common::FakeAccounts(vec![account(1000, "alice", "/nonexistent/alice")]),
        ..Fakes::default()
    };
    let mut d = started(&fakes, tagged_config());
    let by_name = |name: &str| {
        Body::User(UserMessage {
            param: user_param::USE_NAME,
            username: name.into(),
            ..Default::default()
        })
    };
    let r = ask(&mut d, by_name("alice"), remote());
    let Body::User(u) = &r[0].body else {
        panic!("expected a user reply");
    };
    assert_eq!((u.uid, u.fsroot.as_str()), (1000, "/srv/alice/mf"));

    let r = ask(&mut d, by_name("mallory"), remote());
    let Body::User(u) = &r[0].body else {
        panic!("expected a user reply");
    };
    assert_eq!(u.uid, UID_NOT_FOUND);
    assert_eq!(u.username, "mallory");
}

#[test]
fn pid_query_reports_liveness() {
    let fakes = Fakes::default();
    fakes.processes.spawn(77, 1);
    let mut d = started(&fakes, MachinedConfig::default());
    let r = ask(&mut d, Body::Pid { pid: 77, running: false }, remote());
    assert_eq!(r[0].body, Body::Pid { pid: 77, running: true });
    let r = ask(&mut d, Body::Pid { pid: 78, running: true }, remote());
    assert_eq!(r[0].body, Body::Pid { pid: 78, running: false });
}

#[test]
fn query_interface_answers_with_our_address() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    let r = ask(
        &mut d,
        Body::QueryInterface {
            address: Ipv4Addr::UNSPECIFIED,
        },
        local(),
    );
    assert_eq!(r[0].body, Body::QueryInterface { address: ip(ME) });

    let r = ask(
        &mut d,
        Body::QueryInterface {
            address: Ipv4Addr::new(1, 2, 3, 4),
        },
        local(),
    );
    assert!(r[0].is_not_understood());
}

#[test]
fn machine_queries_report_current_stats() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    d.fire_timers(2_000);
    d.drain_outbox();
    let r = ask(
        &mut d,
        Body::HighPrecisionMachine {
            machine: Default::default(),
            io_wait: 0,
        },
        remote(),
    );
    let Body::HighPrecisionMachine { machine, .. } = &r[0].body else {
        panic!("expected machine stats");
    };
    assert_eq!(machine.hostname, "testhost");
    assert_eq!(machine.cpu_loads.len(), 2);
    assert_eq!(machine.version, machined::stats::MACHINED_VERSION);
}

#[test]
fn replies_to_one_packet_share_one_datagram() {
    let fakes = Fakes::default();
    let mut d = started(&fakes, MachinedConfig::default());
    let bytes = Packet {
        messages: vec![
            Message::request(1, Body::Pid { pid: 1, running: false }),
            Message::request(2, Body::Reset),
        ],
        ..Packet::default()
    }
    .encode()
    .unwrap();
    d.handle_datagram(10, &bytes, remote(), SocketKind::Internal);
    let out = d.drain_outbox();
    let replies = sent_to(&out, remote());
    assert_eq!(replies.len(), 1);
    let seqs: Vec<u16> = replies[0].messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}

//! Shared fakes for driving a `Daemon` without touching the OS.
#![allow(dead_code)]

use machined::config::MachinedConfig;
use machined::daemon::{Daemon, Datagram, Host, SocketKind};
use machined::launcher::{LaunchSpec, ProcessLauncher, SpawnError};
use machined::probe::{CpuTimes, MachineProbe, MachineSample, ProcessProbe, ProcessSample};
use machined::users::{Account, AccountLookup};
use machined::wire::{Body, Message, Packet, ProcessMessage, PORT_MACHINED};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

pub fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

pub struct FakeMachine {
    ticks: u64,
}

impl MachineProbe for FakeMachine {
    fn sample(&mut self) -> MachineSample {
        self.ticks += 1;
        MachineSample {
            hostname: "testhost".into(),
            cpu_mhz: 2400,
            cpus: vec![
                CpuTimes {
                    busy: self.ticks * 50,
                    total: self.ticks * 100,
                };
                2
            ],
            mem_used: 512,
            mem_total: 1024,
            ..Default::default()
        }
    }
}

/// Process table shared between a test and the daemon it drives.
#[derive(Clone, Default)]
pub struct FakeProcesses(pub Rc<RefCell<HashMap<u32, ProcessSample>>>);

impl FakeProcesses {
    pub fn spawn(&self, pid: u32, start_time: u64) {
        self.0.borrow_mut().insert(
            pid,
            ProcessSample {
                cpu_time: 10,
                vsize: 256,
                cpu: 0,
                start_time,
            },
        );
    }

    pub fn kill(&self, pid: u32) {
        self.0.borrow_mut().remove(&pid);
    }

    /// Advance a process's cpu counter.
    pub fn burn(&self, pid: u32, jiffies: u64) {
        if let Some(s) = self.0.borrow_mut().get_mut(&pid) {
            s.cpu_time += jiffies;
        }
    }
}

impl ProcessProbe for FakeProcesses {
    fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        self.0.borrow().get(&pid).copied()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.0.borrow().contains_key(&pid)
    }
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    pub spawned: Rc<RefCell<Vec<LaunchSpec>>>,
    pub signals: Rc<RefCell<Vec<(u32, i32)>>>,
    pub fail: bool,
}

impl ProcessLauncher for FakeLauncher {
    fn spawn(&mut self, spec: &LaunchSpec) -> Result<u32, SpawnError> {
        if self.fail {
            return Err(SpawnError::MissingExecutable(spec.exe.clone()));
        }
        let mut spawned = self.spawned.borrow_mut();
        spawned.push(spec.clone());
        Ok(4000 + spawned.len() as u32)
    }

    fn signal(&mut self, pid: u32, signal: i32) -> Result<(), SpawnError> {
        self.signals.borrow_mut().push((pid, signal));
        Ok(())
    }

    fn reap(&mut self) -> usize {
        0
    }
}

#[derive(Clone, Default)]
pub struct FakeAccounts(pub Vec<Account>);

impl AccountLookup for FakeAccounts {
    fn by_uid(&self, uid: u32) -> Option<Account> {
        self.0.iter().find(|a| a.uid == uid).cloned()
    }

    fn by_name(&self, name: &str) -> Option<Account> {
        self.0.iter().find(|a| a.name == name).cloned()
    }

    fn all(&self) -> Vec<Account> {
        self.0.clone()
    }
}

pub fn account(uid: u32, name: &str, home: &str) -> Account {
    Account {
        uid,
        gid: uid,
        name: name.into(),
        full_name: format!("{name} user"),
        home: home.into(),
    }
}

/// Fakes plus handles to inspect them after the daemon has taken ownership.
#[derive(Clone, Default)]
pub struct Fakes {
    pub processes: FakeProcesses,
    pub launcher: FakeLauncher,
    pub accounts: FakeAccounts,
}

impl Fakes {
    pub fn host(&self) -> Host {
        Host {
            machine: Box::new(FakeMachine { ticks: 0 }),
            processes: Box::new(self.processes.clone()),
            launcher: Box::new(self.launcher.clone()),
            accounts: Box::new(self.accounts.clone()),
        }
    }

    pub fn daemon(&self, addr: Ipv4Addr, config: MachinedConfig) -> Daemon {
        Daemon::new(
            addr,
            PORT_MACHINED,
            config,
            self.host(),
            StdRng::seed_from_u64(u32::from(addr) as u64),
        )
    }
}

pub fn process(pid: u32, port: u16, name: &str) -> ProcessMessage {
    ProcessMessage {
        uid: 1000,
        pid,
        port,
        id: 1,
        name: name.into(),
        ..Default::default()
    }
}

pub fn packet_bytes(messages: Vec<Message>) -> Vec<u8> {
    Packet {
        messages,
        ..Packet::default()
    }
    .encode()
    .unwrap()
}

/// Decoded packets the daemon sent to `dest`.
pub fn sent_to(out: &[Datagram], dest: SocketAddrV4) -> Vec<Packet> {
    out.iter()
        .filter(|d| d.dest == dest)
        .map(|d| Packet::decode(&d.bytes).unwrap())
        .collect()
}

/// Decoded broadcasts.
pub fn broadcasts(out: &[Datagram]) -> Vec<Packet> {
    out.iter()
        .filter(|d| d.dest.ip().is_broadcast())
        .map(|d| Packet::decode(&d.bytes).unwrap())
        .collect()
}

pub fn bodies(packets: &[Packet]) -> Vec<&Body> {
    packets
        .iter()
        .flat_map(|p| p.messages.iter().map(|m| &m.body))
        .collect()
}

/// Several daemons on one simulated broadcast segment with instant delivery.
pub struct SimNet {
    pub nodes: Vec<Daemon>,
    pub down: BTreeSet<Ipv4Addr>,
    /// One-way unicast links that lose everything: (from, to).
    pub cut: BTreeSet<(Ipv4Addr, Ipv4Addr)>,
    pub now: u64,
    /// Datagrams addressed outside the simulated cluster.
    pub external: Vec<Datagram>,
}

impl SimNet {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            down: BTreeSet::new(),
            cut: BTreeSet::new(),
            now: 0,
            external: Vec::new(),
        }
    }

    pub fn add(&mut self, mut node: Daemon) {
        node.start(self.now);
        self.nodes.push(node);
        self.deliver();
    }

    pub fn node(&self, addr: Ipv4Addr) -> &Daemon {
        self.nodes
            .iter()
            .find(|n| n.addr() == addr)
            .expect("no such node")
    }

    fn deliver(&mut self) {
        let mut queue: VecDeque<(Ipv4Addr, Datagram)> = VecDeque::new();
        for n in &mut self.nodes {
            let from = n.addr();
            queue.extend(n.drain_outbox().into_iter().map(|d| (from, d)));
        }
        while let Some((from, d)) = queue.pop_front() {
            if self.down.contains(&from) {
                continue;
            }
            let src = SocketAddrV4::new(from, PORT_MACHINED);
            let broadcast = d.dest.ip().is_broadcast();
            let mut delivered = false;
            for n in &mut self.nodes {
                let to = n.addr();
                if self.down.contains(&to) || (!broadcast && to != *d.dest.ip()) {
                    continue;
                }
                if !broadcast && self.cut.contains(&(from, to)) {
                    delivered = true;
                    continue;
                }
                let via = if broadcast {
                    SocketKind::Broadcast
                } else {
                    SocketKind::Internal
                };
                n.handle_datagram(self.now, &d.bytes, src, via);
                queue.extend(n.drain_outbox().into_iter().map(|o| (to, o)));
                delivered = true;
            }
            if !delivered && !broadcast {
                self.external.push(d);
            }
        }
    }

    /// Advance the clock in 10 ms steps, firing timers and delivering traffic.
    pub fn run_for(&mut self, ms: u64) {
        let end = self.now + ms;
        while self.now < end {
            self.now += 10;
            for n in &mut self.nodes {
                if !self.down.contains(&n.addr()) {
                    n.fire_timers(self.now);
                }
            }
            self.deliver();
        }
    }
}

//! The daemon core: one dispatch switch over incoming messages plus the
//! timers that drive housekeeping and cluster membership.
//!
//! Sans-IO. The service loop hands in datagrams and the current time and
//! drains [`Daemon::drain_outbox`] onto its sockets.

use crate::cluster::{
    BirthCheck, ClusterMembership, DeathReport, FloodStep, BIRTH_CHECK_INTERVAL_MS,
    FLOOD_ROUND_MS, STAGGER_REPLY_PERIOD_MS,
};
use crate::config::MachinedConfig;
use crate::launcher::{OsLauncher, ProcessLauncher, SpawnError};
use crate::listeners::{ListenerTable, Subscription};
use crate::probe::{MachineProbe, ProcessProbe, SystemMachineProbe, SystemProcessProbe};
use crate::registry::{
    ProcessFilter, ProcessRecord, ProcessRegistry, RestoreReport, SpawnRequest, StateFileError,
    STATE_FILE_MAX_AGE,
};
use crate::stats::SystemStats;
use crate::timer::{TimerHandle, TimerQueue};
use crate::users::{scan_coredumps, AccountLookup, SystemAccounts, UserEnvironmentCache};
use crate::wire::{
    param, user_param, Announce, Body, CreateMessage, ListenerKind, Message, Packet,
    ProcessAction, ProcessExtension, ProcessMessage, SeqTicker, UserMessage, UID_NOT_FOUND,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Machine stats, process stats, listener sweep and zombie reaping.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Bound to the internal interface address.
    Internal,
    /// Bound to 127.0.0.1.
    Local,
    /// Bound to the broadcast address; receive only.
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub via: SocketKind,
    pub dest: SocketAddrV4,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Housekeeping,
    BirthCheck,
    FloodTrigger,
    FloodRound,
    Staggered(u64),
}

/// The OS-facing pieces the daemon drives. Tests substitute fakes.
pub struct Host {
    pub machine: Box<dyn MachineProbe>,
    pub processes: Box<dyn ProcessProbe>,
    pub launcher: Box<dyn ProcessLauncher>,
    pub accounts: Box<dyn AccountLookup>,
}

impl Host {
    pub fn system() -> Self {
        Self {
            machine: Box::new(SystemMachineProbe::new()),
            processes: Box::new(SystemProcessProbe::new()),
            launcher: Box::new(OsLauncher),
            accounts: Box::new(SystemAccounts),
        }
    }
}

#[derive(Debug, Error)]
enum Rejected {
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("{0} may only be sent from this machine, not {1}")]
    NotLocal(&'static str, Ipv4Addr),
    #[error("{0}")]
    Invalid(&'static str),
}

struct Pending {
    packet: Packet,
    from: SocketAddrV4,
}

pub struct Daemon {
    addr: Ipv4Addr,
    port: u16,
    config_path: Option<PathBuf>,
    config: MachinedConfig,
    architecture: String,
    host: Host,
    rng: StdRng,
    seq: SeqTicker,
    timers: TimerQueue<Timer>,
    cluster: ClusterMembership,
    registry: ProcessRegistry,
    listeners: ListenerTable,
    users: UserEnvironmentCache,
    stats: SystemStats,
    staggered: HashMap<u64, Pending>,
    next_staggered: u64,
    birth_timer: Option<TimerHandle>,
    outbox: Vec<Datagram>,
}

impl Daemon {
    pub fn new(addr: Ipv4Addr, port: u16, config: MachinedConfig, host: Host, mut rng: StdRng) -> Self {
        let seq = SeqTicker::new(&mut rng);
        Self {
            addr,
            port,
            config_path: None,
            architecture: config.architecture(),
            users: UserEnvironmentCache::new(config.users().to_vec()),
            config,
            host,
            rng,
            seq,
            timers: TimerQueue::new(),
            cluster: ClusterMembership::new(addr),
            registry: ProcessRegistry::new(),
            listeners: ListenerTable::new(),
            stats: SystemStats::new(),
            staggered: HashMap::new(),
            next_staggered: 0,
            birth_timer: None,
            outbox: Vec::new(),
        }
    }

    /// File re-read when a reset is requested.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cluster(&self) -> &ClusterMembership {
        &self.cluster
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    pub fn users(&self) -> &UserEnvironmentCache {
        &self.users
    }

    pub fn stats(&self) -> &SystemStats {
        &self.stats
    }

    /// Take a first machine sample, warm the user cache and announce our birth.
    pub fn start(&mut self, now: u64) {
        self.stats.update(self.host.machine.sample());
        self.users.refresh_all(self.host.accounts.as_ref());
        self.timers.schedule(
            now,
            HOUSEKEEPING_INTERVAL_MS,
            HOUSEKEEPING_INTERVAL_MS,
            Timer::Housekeeping,
        );
        self.begin_bootstrap(now);
        let delay = self.cluster.flood_delay(&mut self.rng);
        self.timers.schedule(now, delay, 0, Timer::FloodTrigger);
        info!(addr = %self.addr, port = self.port, "machined started");
    }

    pub fn next_timeout(&self, now: u64) -> Option<u64> {
        self.timers.next_timeout(now)
    }

    pub fn drain_outbox(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.outbox)
    }

    pub fn save_state(&self, path: &Path) -> Result<usize, StateFileError> {
        self.registry.save(path)
    }

    pub fn restore_state(&mut self, path: &Path) -> Result<RestoreReport, StateFileError> {
        self.registry
            .restore(path, STATE_FILE_MAX_AGE, self.host.processes.as_mut())
    }

    pub fn reap_children(&mut self) -> usize {
        self.host.launcher.reap()
    }

    pub fn handle_datagram(&mut self, now: u64, bytes: &[u8], from: SocketAddrV4, via: SocketKind) {
        let packet = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(%from, ?via, error = %e, "dropping malformed packet");
                return;
            }
        };
        if packet.is_staggered() {
            let delay = self.rng.gen_range(0..STAGGER_REPLY_PERIOD_MS);
            let id = self.next_staggered;
            self.next_staggered += 1;
            self.staggered.insert(id, Pending { packet, from });
            self.timers.schedule(now, delay, 0, Timer::Staggered(id));
            return;
        }
        self.process_packet(now, packet, from);
    }

    /// Run every timer due at `now`.
    pub fn fire_timers(&mut self, now: u64) {
        while let Some((handle, timer)) = self.timers.pop_due(now) {
            self.on_timer(now, handle, timer);
        }
    }

    fn on_timer(&mut self, now: u64, handle: TimerHandle, timer: Timer) {
        match timer {
            Timer::Housekeeping => self.housekeeping(),
            Timer::BirthCheck => match self.cluster.check_birth() {
                BirthCheck::Rebroadcast(msg) => self.broadcast(Packet::single(msg).staggered()),
                BirthCheck::Converged | BirthCheck::GaveUp | BirthCheck::Idle => {
                    self.timers.cancel(handle);
                    self.birth_timer = None;
                }
            },
            Timer::FloodTrigger => {
                let msg = self.cluster.start_flood(self.seq.next_seq());
                self.broadcast(Packet::single(msg).staggered());
                self.timers.schedule(now, FLOOD_ROUND_MS, 0, Timer::FloodRound);
            }
            Timer::FloodRound => match self.cluster.end_flood_round() {
                FloodStep::Retry(msg) => {
                    self.broadcast(Packet::single(msg).staggered());
                    self.timers.schedule(now, FLOOD_ROUND_MS, 0, Timer::FloodRound);
                }
                FloodStep::Finished { announce, .. } => {
                    if !announce.is_empty() {
                        let mut packet = Packet::new();
                        for mut msg in announce {
                            msg.seq = self.seq.next_seq();
                            packet.push(msg);
                        }
                        self.broadcast(packet);
                    }
                    self.schedule_flood(now);
                }
                FloodStep::Idle => self.schedule_flood(now),
            },
            Timer::Staggered(id) => {
                if let Some(p) = self.staggered.remove(&id) {
                    self.process_packet(now, p.packet, p.from);
                }
            }
        }
    }

    fn schedule_flood(&mut self, now: u64) {
        let delay = self.cluster.flood_delay(&mut self.rng);
        self.timers.schedule(now, delay, 0, Timer::FloodTrigger);
    }

    fn begin_bootstrap(&mut self, now: u64) {
        let msg = self.cluster.start_birth(self.seq.next_seq());
        self.broadcast(Packet::single(msg).staggered());
        if let Some(h) = self.birth_timer.take() {
            self.timers.cancel(h);
        }
        self.birth_timer = Some(self.timers.schedule(
            now,
            BIRTH_CHECK_INTERVAL_MS,
            BIRTH_CHECK_INTERVAL_MS,
            Timer::BirthCheck,
        ));
    }

    fn housekeeping(&mut self) {
        self.stats.update(self.host.machine.sample());
        for gone in self.registry.refresh_stats(self.host.processes.as_mut()) {
            self.broadcast_notify(ProcessAction::NotifyDeath, &gone.msg);
        }
        let processes = &self.host.processes;
        self.listeners.sweep(|pid| processes.is_alive(pid));
        self.host.launcher.reap();
    }

    fn process_packet(&mut self, now: u64, packet: Packet, from: SocketAddrV4) {
        let mut reply = Packet::new();
        for msg in packet.messages {
            self.dispatch(now, msg, from, &mut reply);
        }
        if !reply.is_empty() {
            self.send(reply, from);
        }
    }

    fn dispatch(&mut self, now: u64, msg: Message, from: SocketAddrV4, reply: &mut Packet) {
        if msg.is_not_understood() {
            warn!(%from, kind = msg.kind(), seq = msg.seq, "peer did not understand our message");
            return;
        }
        if msg.is_outgoing() {
            self.handle_reply(&msg, from);
            return;
        }
        if let Err(e) = self.handle_request(now, &msg, from, reply) {
            warn!(%from, kind = msg.kind(), error = %e, "not understood");
            match msg.into_not_understood() {
                Ok(echo) => reply.push(echo),
                Err(e) => error!(error = %e, "could not build not-understood echo"),
            }
        }
    }

    fn handle_reply(&mut self, msg: &Message, from: SocketAddrV4) {
        match &msg.body {
            Body::Announce(Announce::Birth { count }) => {
                self.cluster.on_birth_reply(*from.ip(), *count)
            }
            Body::WholeMachine(_) => {
                if !self.cluster.on_flood_reply(msg.seq, *from.ip()) {
                    debug!(%from, seq = msg.seq, "stale machine reply");
                }
            }
            other => debug!(%from, kind = other.name(), "ignoring reply"),
        }
    }

    fn is_local(&self, from: &SocketAddrV4) -> bool {
        *from.ip() == self.addr || from.ip().is_loopback()
    }

    fn handle_request(
        &mut self,
        now: u64,
        msg: &Message,
        from: SocketAddrV4,
        reply: &mut Packet,
    ) -> Result<(), Rejected> {
        match &msg.body {
            Body::WholeMachine(_) => {
                let m = self.stats.whole_machine().clone();
                reply.push(Message::reply_to(msg, Body::WholeMachine(m)));
            }
            Body::HighPrecisionMachine { .. } => {
                let (m, io_wait) = self.stats.high_precision();
                let body = Body::HighPrecisionMachine {
                    machine: m.clone(),
                    io_wait,
                };
                reply.push(Message::reply_to(msg, body));
            }
            Body::Process(pm) => self.handle_process(msg, pm, from, reply)?,
            Body::ProcessStats { process, .. } => {
                let filter = ProcessFilter::from_query(process);
                let before = reply.len();
                for r in self.registry.find(&filter) {
                    let (cpu, mem) = r.load(&self.stats);
                    let body = Body::ProcessStats {
                        process: r.msg.clone(),
                        cpu,
                        mem,
                    };
                    reply.push(Message::reply_to(msg, body));
                }
                if reply.len() == before {
                    let body = Body::ProcessStats {
                        process: ProcessMessage {
                            pid: 0,
                            ..process.clone()
                        },
                        cpu: 0,
                        mem: 0,
                    };
                    reply.push(Message::reply_to(msg, body));
                }
            }
            Body::Listener {
                process,
                pre_addr,
                post_addr,
            } => {
                let kind = if process.param == ListenerKind::Birth.param() {
                    ListenerKind::Birth
                } else if process.param == ListenerKind::Death.param() {
                    ListenerKind::Death
                } else {
                    return Err(Rejected::Invalid("unknown listener type"));
                };
                self.listeners.subscribe(Subscription {
                    kind,
                    category: process.category,
                    uid: process.uid,
                    name: process.name.clone(),
                    owner_pid: process.pid,
                    host: *from.ip(),
                    port: process.port,
                    pre_addr: pre_addr.clone(),
                    post_addr: post_addr.clone(),
                });
                reply.push(Message::reply_to(msg, msg.body.clone()));
            }
            Body::Create(c) => {
                let mut args = vec!["-machined".to_string()];
                if c.recover {
                    args.push("-recover".into());
                }
                if c.forward_port != 0 {
                    args.push("-forward".into());
                    args.push(format!("{}:{}", c.forward_ip, c.forward_port));
                }
                let body = self.create(c, args);
                reply.push(Message::reply_to(msg, body));
            }
            Body::CreateWithArgs { create, args } => {
                let mut args = args.clone();
                if create.recover {
                    args.push("-recover".into());
                }
                let body = self.create(create, args);
                reply.push(Message::reply_to(msg, body));
            }
            Body::Signal { process, signal } => {
                let filter = ProcessFilter::from_query(process);
                self.registry
                    .signal(&filter, *signal as i32, self.host.launcher.as_mut());
            }
            Body::Tags { tags, .. } => {
                let [tag] = tags.as_slice() else {
                    return Err(Rejected::Invalid("tags query must carry exactly one tag"));
                };
                let (tags, exists) = if tag.is_empty() {
                    (self.config.section_names().map(String::from).collect(), true)
                } else {
                    match self.config.tags(tag) {
                        Some(lines) => (lines.to_vec(), true),
                        None => (Vec::new(), false),
                    }
                };
                reply.push(Message::reply_to(msg, Body::Tags { tags, exists }));
            }
            Body::User(u) => {
                for body in self.handle_user(u) {
                    reply.push(Message::reply_to(msg, Body::User(body)));
                }
            }
            Body::Pid { pid, .. } => {
                let running = self.host.processes.is_alive(*pid);
                reply.push(Message::reply_to(
                    msg,
                    Body::Pid {
                        pid: *pid,
                        running,
                    },
                ));
            }
            Body::Reset => {
                self.reload_config();
                reply.push(Message::reply_to(msg, Body::Reset));
            }
            Body::Error { severity, message } => {
                warn!(%from, severity, message = %message, "error reported by peer");
            }
            Body::QueryInterface { address } => {
                if !address.is_unspecified() {
                    return Err(Rejected::Invalid("only the internal interface can be queried"));
                }
                reply.push(Message::reply_to(
                    msg,
                    Body::QueryInterface { address: self.addr },
                ));
            }
            Body::Announce(a) => match *a {
                Announce::Birth { .. } => {
                    let count = self.cluster.on_birth_request(*from.ip());
                    reply.push(Message::reply_to(
                        msg,
                        Body::Announce(Announce::Birth { count }),
                    ));
                }
                Announce::Death { addr } => match self.cluster.on_announce_death(addr) {
                    DeathReport::Removed => info!(machine = %addr, reporter = %from, "machine died"),
                    DeathReport::Unknown => debug!(machine = %addr, "death of unknown machine"),
                    DeathReport::Refuted => {
                        warn!(reporter = %from, "we were announced dead, re-announcing birth");
                        self.begin_bootstrap(now);
                    }
                },
                Announce::Exists { addr } => {
                    if self.cluster.on_announce_exists(addr) {
                        info!(machine = %addr, reporter = %from, "learned of machine");
                    }
                }
            },
            Body::Unknown { kind, .. } => return Err(Rejected::UnknownKind(*kind)),
        }
        Ok(())
    }

    fn handle_process(
        &mut self,
        msg: &Message,
        pm: &ProcessMessage,
        from: SocketAddrV4,
        reply: &mut Packet,
    ) -> Result<(), Rejected> {
        let action = match pm.action() {
            Some(a) => a,
            None if pm.param & param::IS_MSGTYPE != 0 => {
                return Err(Rejected::Invalid("unknown process message type"))
            }
            None => ProcessAction::Find,
        };
        match action {
            ProcessAction::Register => {
                if !self.is_local(&from) {
                    return Err(Rejected::NotLocal("registration", *from.ip()));
                }
                let mut pm = pm.clone();
                if pm.extension.is_none() {
                    if let Some(u) = self.users.lookup_uid(pm.uid, self.host.accounts.as_ref()) {
                        pm.extension = Some(ProcessExtension {
                            username: u.username.clone(),
                            ..Default::default()
                        });
                    }
                }
                let reg = self.registry.register(pm.clone(), self.host.processes.as_mut());
                for old in &reg.evicted {
                    self.broadcast_notify(ProcessAction::NotifyDeath, &old.msg);
                }
                self.broadcast_notify(ProcessAction::NotifyBirth, &pm);
                reply.push(Message::reply_to(msg, Body::Process(pm)));
            }
            ProcessAction::Deregister => {
                if !self.is_local(&from) {
                    return Err(Rejected::NotLocal("deregistration", *from.ip()));
                }
                match self.registry.deregister(pm.pid) {
                    Some(ProcessRecord { msg: old, .. }) => {
                        info!(process = %old, "removed process");
                        self.broadcast_notify(ProcessAction::NotifyDeath, &old);
                    }
                    None => warn!(pid = pm.pid, "deregistration of unknown process"),
                }
                reply.push(Message::reply_to(msg, msg.body.clone()));
            }
            ProcessAction::NotifyBirth | ProcessAction::NotifyDeath => {
                let kind = if action == ProcessAction::NotifyBirth {
                    ListenerKind::Birth
                } else {
                    ListenerKind::Death
                };
                let at = SocketAddrV4::new(*from.ip(), pm.port);
                for (dest, bytes) in self.listeners.notify(kind, pm, at) {
                    self.push(dest, bytes);
                }
            }
            ProcessAction::Find => {
                let filter = ProcessFilter::from_query(pm);
                let before = reply.len();
                for r in self.registry.find(&filter) {
                    reply.push(Message::reply_to(msg, Body::Process(r.msg.clone())));
                }
                if reply.len() == before {
                    let none = ProcessMessage {
                        pid: 0,
                        ..pm.clone()
                    };
                    reply.push(Message::reply_to(msg, Body::Process(none)));
                }
            }
        }
        Ok(())
    }

    /// Spawn as the requested user; the reply is a pid message, pid 0 on failure.
    fn create(&mut self, c: &CreateMessage, args: Vec<String>) -> Body {
        match self.try_create(c, args) {
            Ok(pid) => Body::Pid { pid, running: true },
            Err(e) => {
                error!(name = %c.name, config = %c.config, uid = c.uid, error = %e, "could not start process");
                Body::Pid {
                    pid: 0,
                    running: false,
                }
            }
        }
    }

    fn try_create(&mut self, c: &CreateMessage, args: Vec<String>) -> Result<u32, SpawnError> {
        let user = self
            .users
            .lookup_uid(c.uid, self.host.accounts.as_ref())
            .cloned()
            .ok_or(SpawnError::UnknownUser(c.uid))?;
        if !user.has_env() {
            return Err(SpawnError::NoEnvironment(user.username));
        }
        let req = SpawnRequest {
            user: &user,
            exe: &c.name,
            config: &c.config,
            architecture: &self.architecture,
            timing_method: self.config.timing_method(),
            args,
        };
        self.registry.spawn(self.host.launcher.as_mut(), &req)
    }

    fn handle_user(&mut self, u: &UserMessage) -> Vec<UserMessage> {
        let accounts = self.host.accounts.as_ref();
        if u.param & user_param::REFRESH_ENV != 0 {
            self.users.refresh(u.uid, accounts);
        }
        let found = if u.param & user_param::USE_UID != 0 {
            self.users.lookup_uid(u.uid, accounts).cloned()
        } else if u.param & user_param::USE_NAME != 0 {
            self.users.lookup_name(&u.username, accounts).cloned()
        } else {
            return self.users.all().map(|e| e.to_message(u.param)).collect();
        };
        let reply = match found {
            Some(env) => {
                let mut m = env.to_message(u.param);
                if u.param & user_param::CHECK_COREDUMPS != 0 {
                    m.coredumps = scan_coredumps(&env.fsroot);
                }
                m
            }
            None => UserMessage {
                param: u.param,
                uid: UID_NOT_FOUND,
                username: u.username.clone(),
                ..Default::default()
            },
        };
        vec![reply]
    }

    fn reload_config(&mut self) {
        if let Some(path) = &self.config_path {
            self.config = MachinedConfig::load_or_default(path);
            self.architecture = self.config.architecture();
            info!(path = %path.display(), "reloaded configuration");
        }
        self.users.set_global_table(self.config.users().to_vec());
        self.users.flush();
    }

    fn broadcast_notify(&mut self, action: ProcessAction, process: &ProcessMessage) {
        let pm = ProcessMessage {
            param: action.param(),
            ..process.clone()
        };
        let msg = Message::request(self.seq.next_seq(), Body::Process(pm));
        self.broadcast(Packet::single(msg));
    }

    fn broadcast(&mut self, packet: Packet) {
        self.send(packet, SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port));
    }

    fn send(&mut self, mut packet: Packet, dest: SocketAddrV4) {
        packet.buddy = self.cluster.buddy().unwrap_or(Ipv4Addr::UNSPECIFIED);
        match packet.encode() {
            Ok(bytes) => self.push(dest, bytes),
            Err(e) => error!(%dest, messages = packet.len(), error = %e, "packet not sent"),
        }
    }

    fn push(&mut self, dest: SocketAddrV4, bytes: Vec<u8>) {
        let via = if dest.ip().is_loopback() {
            SocketKind::Local
        } else {
            SocketKind::Internal
        };
        self.outbox.push(Datagram { via, dest, bytes });
    }
}

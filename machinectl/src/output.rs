//! Views of daemon replies for printing, as text or JSON.

use chrono::{DateTime, Utc};
use machined::wire::{Body, CoreDump, MachineMessage, Message, ProcessMessage, UserMessage};
use serde::Serialize;
use std::net::SocketAddrV4;

fn pct(v: u8) -> f32 {
    v as f32 * 100.0 / 255.0
}

#[derive(Debug, Serialize, Clone)]
pub struct InterfaceView {
    pub name: String,
    pub bits_in: u32,
    pub bits_out: u32,
    pub packets_in: u32,
    pub packets_out: u32,
}

#[derive(Debug, Serialize, Clone)]
pub struct MachineView {
    pub addr: String,
    pub hostname: String,
    pub cpu_mhz: u16,
    pub cpu_pct: Vec<f32>,
    pub mem_pct: f32,
    pub io_wait_pct: f32,
    pub version: u8,
    pub interfaces: Vec<InterfaceView>,
}

impl MachineView {
    pub fn new(from: SocketAddrV4, m: &MachineMessage<u32>, io_wait: u8) -> Self {
        Self {
            addr: from.ip().to_string(),
            hostname: m.hostname.clone(),
            cpu_mhz: m.cpu_speed,
            cpu_pct: m.cpu_loads.iter().map(|&l| pct(l)).collect(),
            mem_pct: pct(m.mem),
            io_wait_pct: pct(io_wait),
            version: m.version,
            interfaces: m
                .interfaces
                .iter()
                .map(|i| InterfaceView {
                    name: i.name.clone(),
                    bits_in: i.bits_in,
                    bits_out: i.bits_out,
                    packets_in: i.packets_in,
                    packets_out: i.packets_out,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct ProcessView {
    pub addr: String,
    pub name: String,
    pub category: String,
    pub pid: u32,
    pub uid: u16,
    pub port: u16,
    pub id: u16,
    pub username: Option<String>,
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

impl ProcessView {
    pub fn new(from: SocketAddrV4, p: &ProcessMessage, cpu: u8, mem: u8) -> Self {
        Self {
            addr: from.ip().to_string(),
            name: p.name.clone(),
            category: p.category.to_string(),
            pid: p.pid,
            uid: p.uid,
            port: p.port,
            id: p.id,
            username: p.username().map(String::from),
            cpu_pct: pct(cpu),
            mem_pct: pct(mem),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct CoreDumpView {
    pub filename: String,
    pub time: Option<DateTime<Utc>>,
    pub assert_log: String,
}

impl From<&CoreDump> for CoreDumpView {
    fn from(c: &CoreDump) -> Self {
        Self {
            filename: c.filename.clone(),
            time: DateTime::from_timestamp(c.time as i64, 0),
            assert_log: c.assert_log.clone(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct UserView {
    pub found: bool,
    pub uid: u16,
    pub username: String,
    pub full_name: String,
    pub home: String,
    pub fsroot: String,
    pub respath: String,
    pub coredumps: Vec<CoreDumpView>,
}

impl From<&UserMessage> for UserView {
    fn from(u: &UserMessage) -> Self {
        Self {
            found: u.uid != machined::wire::UID_NOT_FOUND,
            uid: u.uid,
            username: u.username.clone(),
            full_name: u.full_name.clone(),
            home: u.home.clone(),
            fsroot: u.fsroot.clone(),
            respath: u.respath.clone(),
            coredumps: u.coredumps.iter().map(CoreDumpView::from).collect(),
        }
    }
}

/// Everything a command can print.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum View {
    Machine(MachineView),
    Process(ProcessView),
    User(UserView),
    Tags { addr: String, exists: bool, tags: Vec<String> },
    Pid { addr: String, pid: u32, running: bool },
    Interface { addr: String, internal: String },
    Ack { addr: String },
}

/// Convert one reply into a view; `None` for replies with nothing to show.
pub fn view(from: SocketAddrV4, msg: &Message) -> Option<View> {
    let addr = from.ip().to_string();
    Some(match &msg.body {
        Body::HighPrecisionMachine { machine, io_wait } => {
            View::Machine(MachineView::new(from, machine, *io_wait))
        }
        // pid 0 marks "no match"
        Body::ProcessStats { process, .. } if process.pid == 0 => return None,
        Body::ProcessStats { process, cpu, mem } => {
            View::Process(ProcessView::new(from, process, *cpu, *mem))
        }
        Body::User(u) => View::User(UserView::from(u)),
        Body::Tags { tags, exists } => View::Tags {
            addr,
            exists: *exists,
            tags: tags.clone(),
        },
        Body::Pid { pid, running } => View::Pid {
            addr,
            pid: *pid,
            running: *running,
        },
        Body::QueryInterface { address } => View::Interface {
            addr,
            internal: address.to_string(),
        },
        Body::Reset => View::Ack { addr },
        _ => return None,
    })
}

pub fn render_text(v: &View) -> String {
    match v {
        View::Machine(m) => {
            let cpus: Vec<String> = m.cpu_pct.iter().map(|c| format!("{c:.0}%")).collect();
            format!(
                "{:<15} {:<20} {:>5}MHz mem {:>3.0}% iowait {:>3.0}% cpus [{}]",
                m.addr,
                m.hostname,
                m.cpu_mhz,
                m.mem_pct,
                m.io_wait_pct,
                cpus.join(" ")
            )
        }
        View::Process(p) => format!(
            "{:<15} {:<24} pid {:>7} uid {:>5} port {:>5} cpu {:>5.1}% mem {:>5.1}%",
            p.addr, p.name, p.pid, p.uid, p.port, p.cpu_pct, p.mem_pct
        ),
        View::User(u) if !u.found => format!("{}: no such user", u.username),
        View::User(u) => {
            let mut s = format!(
                "{:>5} {:<12} {} fsroot={} respath={}",
                u.uid, u.username, u.full_name, u.fsroot, u.respath
            );
            for c in &u.coredumps {
                let when = c
                    .time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                s.push_str(&format!("\n      core {} ({when})", c.filename));
            }
            s
        }
        View::Tags { addr, exists: false, .. } => format!("{addr}: no such tag"),
        View::Tags { addr, tags, .. } => format!("{addr}: {}", tags.join(", ")),
        View::Pid { addr, pid, running } => {
            let state = if *running { "running" } else { "not running" };
            format!("{addr}: pid {pid} {state}")
        }
        View::Interface { addr, internal } => format!("{addr}: internal interface {internal}"),
        View::Ack { addr } => format!("{addr}: ok"),
    }
}

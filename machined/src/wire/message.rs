//! Message kinds and their frozen body layouts.
//!
//! Every message starts with `[kind:u8][flags:u8][seq:u16]`. Bodies are
//! encoded by one pure function per kind; a body that cannot be parsed is
//! kept as raw bytes so it can be echoed back untouched.

use super::stream::{WireReader, WireWriter};
use super::{WireError, LOGGER_ID_STRING_VERSION, PROTOCOL_VERSION};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

pub mod kind {
    pub const WHOLE_MACHINE: u8 = 1;
    pub const PROCESS: u8 = 2;
    pub const PROCESS_STATS: u8 = 3;
    pub const LISTENER: u8 = 4;
    pub const CREATE: u8 = 5;
    pub const SIGNAL: u8 = 6;
    pub const TAGS: u8 = 7;
    pub const USER: u8 = 8;
    pub const PID: u8 = 9;
    pub const RESET: u8 = 10;
    pub const ERROR: u8 = 11;
    pub const QUERY_INTERFACE: u8 = 12;
    pub const CREATE_WITH_ARGS: u8 = 13;
    pub const HIGH_PRECISION_MACHINE: u8 = 14;
    pub const MACHINED_ANNOUNCE: u8 = 64;
}

/// Message header flag bits.
pub mod flags {
    /// Set on replies.
    pub const OUTGOING: u8 = 0x1;
    pub const NOT_UNDERSTOOD: u8 = 0x2;
}

/// Process message `param` bits. Low bits select query filters; with
/// `IS_MSGTYPE` set the remaining bits carry a [`ProcessAction`] or listener type.
pub mod param {
    pub const USE_CATEGORY: u8 = 0x1;
    pub const USE_UID: u8 = 0x2;
    pub const USE_PID: u8 = 0x4;
    pub const USE_PORT: u8 = 0x8;
    pub const USE_ID: u8 = 0x10;
    pub const USE_NAME: u8 = 0x20;
    pub const IS_MSGTYPE: u8 = 0x80;
}

/// User message `param` bits.
pub mod user_param {
    pub const USE_UID: u8 = 0x1;
    pub const USE_NAME: u8 = 0x2;
    pub const CHECK_COREDUMPS: u8 = 0x4;
    pub const REFRESH_ENV: u8 = 0x8;
}

/// uid value meaning "any user" in listener filters.
pub const ANY_UID: u16 = 0xffff;
/// uid value carried by a user reply when the lookup failed.
pub const UID_NOT_FOUND: u16 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessAction {
    Find = 0,
    Register = 1,
    Deregister = 2,
    NotifyBirth = 3,
    NotifyDeath = 4,
}

impl ProcessAction {
    pub fn param(self) -> u8 {
        param::IS_MSGTYPE | self as u8
    }

    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Find,
            1 => Self::Register,
            2 => Self::Deregister,
            3 => Self::NotifyBirth,
            4 => Self::NotifyDeath,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerKind {
    Birth = 0,
    Death = 1,
}

impl ListenerKind {
    pub fn param(self) -> u8 {
        param::IS_MSGTYPE | self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ServerComponent,
    WatcherNub,
    Other(u8),
}

impl From<u8> for Category {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::ServerComponent,
            1 => Self::WatcherNub,
            other => Self::Other(other),
        }
    }
}

impl From<Category> for u8 {
    fn from(c: Category) -> u8 {
        match c {
            Category::ServerComponent => 0,
            Category::WatcherNub => 1,
            Category::Other(v) => v,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerComponent => f.write_str("SERVER_COMPONENT"),
            Self::WatcherNub => f.write_str("WATCHER_NUB"),
            Self::Other(_) => f.write_str("UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExtension {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub interface: u16,
    pub username: String,
    pub def_digest: String,
    pub logger_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMessage {
    pub param: u8,
    pub category: Category,
    pub uid: u16,
    pub pid: u32,
    pub port: u16,
    pub id: u16,
    pub name: String,
    pub extension: Option<ProcessExtension>,
}

impl Default for ProcessMessage {
    fn default() -> Self {
        Self {
            param: 0,
            category: Category::ServerComponent,
            uid: 0,
            pid: 0,
            port: 0,
            id: 0,
            name: String::new(),
            extension: None,
        }
    }
}

impl ProcessMessage {
    /// The action encoded in `param`, if this message is a command rather than a query.
    pub fn action(&self) -> Option<ProcessAction> {
        if self.param & param::IS_MSGTYPE == 0 {
            return None;
        }
        ProcessAction::from_bits(self.param & !param::IS_MSGTYPE)
    }

    /// Same process and same role: pid, category and name all agree.
    pub fn same_identity(&self, other: &ProcessMessage) -> bool {
        self.pid == other.pid && self.category == other.category && self.name == other.name
    }

    pub fn username(&self) -> Option<&str> {
        self.extension.as_ref().map(|e| e.username.as_str())
    }
}

impl fmt::Display for ProcessMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) (pid:{})", self.name, self.category, self.pid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceStats<C> {
    pub name: String,
    pub bits_in: C,
    pub bits_out: C,
    pub packets_in: C,
    pub packets_out: C,
}

/// Machine-wide telemetry. `C` is the interface counter width: `u8` for the
/// whole-machine reply, `u32` for the high-precision one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineMessage<C> {
    pub hostname: String,
    /// MHz
    pub cpu_speed: u16,
    /// Per-cpu load scaled to 0..=255.
    pub cpu_loads: Vec<u8>,
    pub mem: u8,
    pub version: u8,
    pub in_discards: u8,
    pub out_discards: u8,
    pub interfaces: Vec<InterfaceStats<C>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMessage {
    pub name: String,
    pub config: String,
    pub uid: u16,
    pub recover: bool,
    pub forward_ip: Ipv4Addr,
    pub forward_port: u16,
}

impl Default for CreateMessage {
    fn default() -> Self {
        Self {
            name: String::new(),
            config: String::new(),
            uid: 0,
            recover: false,
            forward_ip: Ipv4Addr::UNSPECIFIED,
            forward_port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreDump {
    pub filename: String,
    pub assert_log: String,
    pub time: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMessage {
    pub param: u8,
    pub uid: u16,
    pub username: String,
    pub full_name: String,
    pub home: String,
    pub fsroot: String,
    pub respath: String,
    pub coredumps: Vec<CoreDump>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announce {
    /// Sent with `count == 0` by a starting daemon; replies carry the
    /// replier's belief of the cluster size.
    Birth { count: u32 },
    Death { addr: Ipv4Addr },
    Exists { addr: Ipv4Addr },
}

mod announce_type {
    pub const BIRTH: u8 = 0;
    pub const DEATH: u8 = 1;
    pub const EXISTS: u8 = 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    WholeMachine(MachineMessage<u8>),
    HighPrecisionMachine {
        machine: MachineMessage<u32>,
        /// Percent of cpu time spent waiting for io, scaled to 0..=255.
        io_wait: u8,
    },
    Process(ProcessMessage),
    ProcessStats {
        process: ProcessMessage,
        cpu: u8,
        mem: u8,
    },
    Listener {
        process: ProcessMessage,
        pre_addr: Vec<u8>,
        post_addr: Vec<u8>,
    },
    Create(CreateMessage),
    CreateWithArgs {
        create: CreateMessage,
        args: Vec<String>,
    },
    Signal {
        process: ProcessMessage,
        signal: u8,
    },
    Tags {
        tags: Vec<String>,
        exists: bool,
    },
    User(UserMessage),
    Pid {
        pid: u32,
        running: bool,
    },
    Reset,
    Error {
        severity: u8,
        message: String,
    },
    QueryInterface {
        address: Ipv4Addr,
    },
    Announce(Announce),
    /// Unrecognised kind, or a known kind whose body did not parse.
    Unknown {
        kind: u8,
        data: Vec<u8>,
    },
}

impl Body {
    pub fn kind(&self) -> u8 {
        match self {
            Body::WholeMachine(_) => kind::WHOLE_MACHINE,
            Body::HighPrecisionMachine { .. } => kind::HIGH_PRECISION_MACHINE,
            Body::Process(_) => kind::PROCESS,
            Body::ProcessStats { .. } => kind::PROCESS_STATS,
            Body::Listener { .. } => kind::LISTENER,
            Body::Create(_) => kind::CREATE,
            Body::CreateWithArgs { .. } => kind::CREATE_WITH_ARGS,
            Body::Signal { .. } => kind::SIGNAL,
            Body::Tags { .. } => kind::TAGS,
            Body::User(_) => kind::USER,
            Body::Pid { .. } => kind::PID,
            Body::Reset => kind::RESET,
            Body::Error { .. } => kind::ERROR,
            Body::QueryInterface { .. } => kind::QUERY_INTERFACE,
            Body::Announce(_) => kind::MACHINED_ANNOUNCE,
            Body::Unknown { kind, .. } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Body::WholeMachine(_) => "WholeMachine",
            Body::HighPrecisionMachine { .. } => "HighPrecisionMachine",
            Body::Process(_) => "Process",
            Body::ProcessStats { .. } => "ProcessStats",
            Body::Listener { .. } => "Listener",
            Body::Create(_) => "Create",
            Body::CreateWithArgs { .. } => "CreateWithArgs",
            Body::Signal { .. } => "Signal",
            Body::Tags { .. } => "Tags",
            Body::User(_) => "User",
            Body::Pid { .. } => "Pid",
            Body::Reset => "Reset",
            Body::Error { .. } => "Error",
            Body::QueryInterface { .. } => "QueryInterface",
            Body::Announce(_) => "MachinedAnnounce",
            Body::Unknown { .. } => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub flags: u8,
    pub seq: u16,
    pub body: Body,
}

impl Message {
    pub fn request(seq: u16, body: Body) -> Self {
        Self {
            flags: 0,
            seq,
            body,
        }
    }

    /// A reply to `request`: same sequence number, outgoing flag set.
    pub fn reply_to(request: &Message, body: Body) -> Self {
        Self {
            flags: flags::OUTGOING,
            seq: request.seq,
            body,
        }
    }

    pub fn kind(&self) -> u8 {
        self.body.kind()
    }

    pub fn is_outgoing(&self) -> bool {
        self.flags & flags::OUTGOING != 0
    }

    pub fn is_not_understood(&self) -> bool {
        self.flags & flags::NOT_UNDERSTOOD != 0
    }

    /// Convert into the echo sent back for a message this node cannot act
    /// on: the original body bytes with the not-understood and outgoing bits set.
    pub fn into_not_understood(self) -> Result<Message, WireError> {
        let kind = self.kind();
        let data = match self.body {
            Body::Unknown { data, .. } => data,
            body => {
                let mut w = WireWriter::new();
                write_body(&mut w, &body)?;
                w.into_vec()
            }
        };
        Ok(Message {
            flags: self.flags | flags::NOT_UNDERSTOOD | flags::OUTGOING,
            seq: self.seq,
            body: Body::Unknown { kind, data },
        })
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<(), WireError> {
        w.u8(self.kind());
        w.u8(self.flags);
        w.u16(self.seq);
        write_body(w, &self.body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::new();
        self.encode(&mut w)?;
        Ok(w.into_vec())
    }

    /// Decode one message occupying all of `bytes`. Only a truncated header is
    /// an error; an unparseable body yields [`Body::Unknown`].
    pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
        let mut r = WireReader::new(bytes);
        let kind = r.u8()?;
        let flags = r.u8()?;
        let seq = r.u16()?;
        let raw = r.rest();
        let body = match read_body(kind, raw) {
            Ok(Some(body)) => body,
            Ok(None) => Body::Unknown {
                kind,
                data: raw.to_vec(),
            },
            Err(err) => {
                debug!(kind, %err, "keeping undecodable message body opaque");
                Body::Unknown {
                    kind,
                    data: raw.to_vec(),
                }
            }
        };
        Ok(Message { flags, seq, body })
    }
}

fn count_u8(field: &'static str, count: usize) -> Result<u8, WireError> {
    u8::try_from(count).map_err(|_| WireError::TooManyItems {
        field,
        count,
        max: u8::MAX as usize,
    })
}

fn count_u32(field: &'static str, count: usize) -> Result<u32, WireError> {
    u32::try_from(count).map_err(|_| WireError::TooManyItems {
        field,
        count,
        max: u32::MAX as usize,
    })
}

trait Counter: Sized {
    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError>;
    fn write(self, w: &mut WireWriter);
}

impl Counter for u8 {
    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u8()
    }
    fn write(self, w: &mut WireWriter) {
        w.u8(self)
    }
}

impl Counter for u32 {
    fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.u32()
    }
    fn write(self, w: &mut WireWriter) {
        w.u32(self)
    }
}

fn write_machine<C: Counter + Copy>(
    w: &mut WireWriter,
    m: &MachineMessage<C>,
    io_wait: Option<u8>,
) -> Result<(), WireError> {
    w.string(&m.hostname)?;
    w.u16(m.cpu_speed);
    w.u8(count_u8("cpu_loads", m.cpu_loads.len())?);
    w.u8(count_u8("interfaces", m.interfaces.len())?);
    w.u8(m.mem);
    w.u8(m.version);
    w.u8(m.in_discards);
    w.u8(m.out_discards);
    w.bytes(&m.cpu_loads);
    if let Some(io_wait) = io_wait {
        w.u8(io_wait);
    }
    for ifs in &m.interfaces {
        w.string(&ifs.name)?;
        ifs.bits_in.write(w);
        ifs.bits_out.write(w);
        ifs.packets_in.write(w);
        ifs.packets_out.write(w);
    }
    Ok(())
}

fn read_machine<C: Counter>(
    r: &mut WireReader<'_>,
    with_io_wait: bool,
) -> Result<(MachineMessage<C>, u8), WireError> {
    let hostname = r.string()?;
    let cpu_speed = r.u16()?;
    let n_cpus = r.u8()? as usize;
    let n_ifs = r.u8()? as usize;
    let mem = r.u8()?;
    let version = r.u8()?;
    let in_discards = r.u8()?;
    let out_discards = r.u8()?;
    let cpu_loads = r.bytes(n_cpus)?.to_vec();
    let io_wait = if with_io_wait { r.u8()? } else { 0 };
    let mut interfaces = Vec::with_capacity(n_ifs);
    for _ in 0..n_ifs {
        interfaces.push(InterfaceStats {
            name: r.string()?,
            bits_in: C::read(r)?,
            bits_out: C::read(r)?,
            packets_in: C::read(r)?,
            packets_out: C::read(r)?,
        });
    }
    Ok((
        MachineMessage {
            hostname,
            cpu_speed,
            cpu_loads,
            mem,
            version,
            in_discards,
            out_discards,
            interfaces,
        },
        io_wait,
    ))
}

fn write_process(w: &mut WireWriter, p: &ProcessMessage) -> Result<(), WireError> {
    w.u8(p.param);
    w.u8(p.category.into());
    w.u16(p.uid);
    w.u32(p.pid);
    w.u16(p.port);
    w.u16(p.id);
    w.string(&p.name)
}

fn read_process(r: &mut WireReader<'_>) -> Result<ProcessMessage, WireError> {
    Ok(ProcessMessage {
        param: r.u8()?,
        category: Category::from(r.u8()?),
        uid: r.u16()?,
        pid: r.u32()?,
        port: r.u16()?,
        id: r.u16()?,
        name: r.string()?,
        extension: None,
    })
}

/// The trailing extension block shared by every process-derived message.
fn write_extension(w: &mut WireWriter, ext: Option<&ProcessExtension>) -> Result<(), WireError> {
    let Some(ext) = ext else {
        return Ok(());
    };
    let len_at = w.reserve_i32();
    let start = w.len();
    w.u8(PROTOCOL_VERSION);
    w.u16(ext.major);
    w.u16(ext.minor);
    w.u16(ext.patch);
    w.u16(ext.interface);
    w.string(&ext.username)?;
    w.string(&ext.def_digest)?;
    w.string(&ext.logger_id)?;
    let len = w.len() - start;
    w.patch_i32(len_at, len as i32);
    Ok(())
}

fn read_extension(r: &mut WireReader<'_>) -> Result<Option<ProcessExtension>, WireError> {
    if r.is_empty() {
        return Ok(None);
    }
    let len = r.i32()?;
    if len < 0 {
        return Err(WireError::BadExtension(len));
    }
    let start = r.remaining();
    let version = r.u8()?;
    let major = r.u16()?;
    let minor = r.u16()?;
    let patch = r.u16()?;
    let interface = r.u16()?;
    let username = r.string()?;
    let def_digest = r.string()?;
    let logger_id = if version < LOGGER_ID_STRING_VERSION {
        // older senders carried a numeric logger index
        r.u8()?.to_string()
    } else {
        r.string()?
    };
    let consumed = start - r.remaining();
    let Some(unread) = (len as usize).checked_sub(consumed) else {
        return Err(WireError::BadExtension(len));
    };
    // newer senders may append fields we do not know yet
    r.bytes(unread)?;
    Ok(Some(ProcessExtension {
        major,
        minor,
        patch,
        interface,
        username,
        def_digest,
        logger_id,
    }))
}

fn write_create(w: &mut WireWriter, c: &CreateMessage) -> Result<(), WireError> {
    w.string(&c.name)?;
    w.string(&c.config)?;
    w.u16(c.uid);
    w.bool(c.recover);
    w.addr(c.forward_ip);
    w.u16(c.forward_port);
    Ok(())
}

fn read_create(r: &mut WireReader<'_>) -> Result<CreateMessage, WireError> {
    Ok(CreateMessage {
        name: r.string()?,
        config: r.string()?,
        uid: r.u16()?,
        recover: r.bool()?,
        forward_ip: r.addr()?,
        forward_port: r.u16()?,
    })
}

fn write_body(w: &mut WireWriter, body: &Body) -> Result<(), WireError> {
    match body {
        Body::WholeMachine(m) => write_machine(w, m, None)?,
        Body::HighPrecisionMachine { machine, io_wait } => {
            write_machine(w, machine, Some(*io_wait))?
        }
        Body::Process(p) => {
            write_process(w, p)?;
            write_extension(w, p.extension.as_ref())?;
        }
        Body::ProcessStats { process, cpu, mem } => {
            write_process(w, process)?;
            w.u8(*cpu);
            w.u8(*mem);
            write_extension(w, process.extension.as_ref())?;
        }
        Body::Listener {
            process,
            pre_addr,
            post_addr,
        } => {
            write_process(w, process)?;
            w.blob(pre_addr)?;
            w.blob(post_addr)?;
            write_extension(w, process.extension.as_ref())?;
        }
        Body::Signal { process, signal } => {
            write_process(w, process)?;
            w.u8(*signal);
            write_extension(w, process.extension.as_ref())?;
        }
        Body::Create(c) => write_create(w, c)?,
        Body::CreateWithArgs { create, args } => {
            write_create(w, create)?;
            w.u32(count_u32("args", args.len())?);
            for arg in args {
                w.string(arg)?;
            }
        }
        Body::Tags { tags, exists } => {
            w.u8(count_u8("tags", tags.len())?);
            w.bool(*exists);
            for tag in tags {
                w.string(tag)?;
            }
        }
        Body::User(u) => {
            w.u8(u.param);
            w.u16(u.uid);
            w.string(&u.username)?;
            w.string(&u.full_name)?;
            w.string(&u.home)?;
            w.string(&u.fsroot)?;
            w.string(&u.respath)?;
            w.u32(count_u32("coredumps", u.coredumps.len())?);
            for cd in &u.coredumps {
                w.string(&cd.filename)?;
                w.string(&cd.assert_log)?;
                w.u32(cd.time);
            }
        }
        Body::Pid { pid, running } => {
            w.u32(*pid);
            w.bool(*running);
        }
        Body::Reset => {}
        Body::Error { severity, message } => {
            w.u8(*severity);
            w.string(message)?;
        }
        Body::QueryInterface { address } => w.addr(*address),
        Body::Announce(a) => match *a {
            Announce::Birth { count } => {
                w.u8(announce_type::BIRTH);
                w.u32(count);
            }
            Announce::Death { addr } => {
                w.u8(announce_type::DEATH);
                w.addr(addr);
            }
            Announce::Exists { addr } => {
                w.u8(announce_type::EXISTS);
                w.addr(addr);
            }
        },
        Body::Unknown { data, .. } => w.bytes(data),
    }
    Ok(())
}

/// `Ok(None)` for kinds this build does not know.
fn read_body(kind: u8, raw: &[u8]) -> Result<Option<Body>, WireError> {
    let r = &mut WireReader::new(raw);
    let body = match kind {
        kind::WHOLE_MACHINE => Body::WholeMachine(read_machine::<u8>(r, false)?.0),
        kind::HIGH_PRECISION_MACHINE => {
            let (machine, io_wait) = read_machine::<u32>(r, true)?;
            Body::HighPrecisionMachine { machine, io_wait }
        }
        kind::PROCESS => {
            let mut process = read_process(r)?;
            process.extension = read_extension(r)?;
            Body::Process(process)
        }
        kind::PROCESS_STATS => {
            let mut process = read_process(r)?;
            let cpu = r.u8()?;
            let mem = r.u8()?;
            process.extension = read_extension(r)?;
            Body::ProcessStats { process, cpu, mem }
        }
        kind::LISTENER => {
            let mut process = read_process(r)?;
            let pre_addr = r.blob()?;
            let post_addr = r.blob()?;
            process.extension = read_extension(r)?;
            Body::Listener {
                process,
                pre_addr,
                post_addr,
            }
        }
        kind::SIGNAL => {
            let mut process = read_process(r)?;
            let signal = r.u8()?;
            process.extension = read_extension(r)?;
            Body::Signal { process, signal }
        }
        kind::CREATE => Body::Create(read_create(r)?),
        kind::CREATE_WITH_ARGS => {
            let create = read_create(r)?;
            let n = r.u32()? as usize;
            // every string costs at least one byte, so a count beyond that is bogus
            if n > r.remaining() {
                return Err(WireError::BadValue {
                    field: "args count",
                    value: n as u32,
                });
            }
            let mut args = Vec::with_capacity(n);
            for _ in 0..n {
                args.push(r.string()?);
            }
            Body::CreateWithArgs { create, args }
        }
        kind::TAGS => {
            let n = r.u8()?;
            let exists = r.bool()?;
            let mut tags = Vec::with_capacity(n as usize);
            for _ in 0..n {
                tags.push(r.string()?);
            }
            Body::Tags { tags, exists }
        }
        kind::USER => {
            let param = r.u8()?;
            let uid = r.u16()?;
            let username = r.string()?;
            let full_name = r.string()?;
            let home = r.string()?;
            let fsroot = r.string()?;
            let respath = r.string()?;
            let n = r.u32()? as usize;
            if n > r.remaining() {
                return Err(WireError::BadValue {
                    field: "coredump count",
                    value: n as u32,
                });
            }
            let mut coredumps = Vec::with_capacity(n);
            for _ in 0..n {
                coredumps.push(CoreDump {
                    filename: r.string()?,
                    assert_log: r.string()?,
                    time: r.u32()?,
                });
            }
            Body::User(UserMessage {
                param,
                uid,
                username,
                full_name,
                home,
                fsroot,
                respath,
                coredumps,
            })
        }
        kind::PID => Body::Pid {
            pid: r.u32()?,
            running: r.bool()?,
        },
        kind::RESET => Body::Reset,
        kind::ERROR => Body::Error {
            severity: r.u8()?,
            message: r.string()?,
        },
        kind::QUERY_INTERFACE => Body::QueryInterface { address: r.addr()? },
        kind::MACHINED_ANNOUNCE => {
            let announce = match r.u8()? {
                announce_type::BIRTH => Announce::Birth { count: r.u32()? },
                announce_type::DEATH => Announce::Death { addr: r.addr()? },
                announce_type::EXISTS => Announce::Exists { addr: r.addr()? },
                other => {
                    return Err(WireError::BadValue {
                        field: "announce type",
                        value: other as u32,
                    })
                }
            };
            Body::Announce(announce)
        }
        _ => return Ok(None),
    };
    Ok(Some(body))
}

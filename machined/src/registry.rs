//! Locally registered processes: registration, lookup, stats refresh,
//! spawning, signalling, and persistence across a daemon restart.

use crate::launcher::{LaunchSpec, ProcessLauncher, SpawnError};
use crate::probe::ProcessProbe;
use crate::stats::{scale_u8, Sample, SystemStats};
use crate::users::UserEnv;
use crate::wire::{param, Body, Category, Message, ProcessMessage, WireError, WireReader, WireWriter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_STATE_FILE: &str = "/var/run/machined.state";
/// Older state files are assumed to belong to a previous boot or a long outage.
pub const STATE_FILE_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("state file io: {0}")]
    Io(#[from] io::Error),
    #[error("state file entry {index} is corrupt: {source}")]
    Corrupt {
        index: usize,
        #[source]
        source: WireError,
    },
    #[error("state file entry {0} does not hold a process record")]
    NotAProcess(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub msg: ProcessMessage,
    pub cpu: Sample,
    pub mem: Sample,
    /// Core the process last ran on.
    pub affinity: u32,
    /// 0 until first sampled.
    pub start_time: u64,
}

impl ProcessRecord {
    pub fn new(msg: ProcessMessage) -> Self {
        Self {
            msg,
            cpu: Sample::default(),
            mem: Sample::default(),
            affinity: 0,
            start_time: 0,
        }
    }

    /// Cpu share of its core over the last tick and memory share of the
    /// machine, both on a 0..=255 scale.
    pub fn load(&self, stats: &SystemStats) -> (u8, u8) {
        (
            scale_u8(self.cpu.delta(), stats.core_capacity(self.affinity)),
            scale_u8(self.mem.cur(), stats.mem_total()),
        )
    }

    fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::new();
        w.u64(self.cpu.cur());
        w.u64(self.cpu.prev());
        w.u64(self.mem.cur());
        w.u64(self.mem.prev());
        w.u32(self.affinity);
        w.u64(self.start_time);
        Message::request(0, Body::Process(self.msg.clone())).encode(&mut w)?;
        Ok(w.into_vec())
    }

    fn decode(bytes: &[u8], index: usize) -> Result<Self, StateFileError> {
        let corrupt = |source| StateFileError::Corrupt { index, source };
        let mut r = WireReader::new(bytes);
        let cpu = Sample::new(r.u64().map_err(corrupt)?, r.u64().map_err(corrupt)?);
        let mem = Sample::new(r.u64().map_err(corrupt)?, r.u64().map_err(corrupt)?);
        let affinity = r.u32().map_err(corrupt)?;
        let start_time = r.u64().map_err(corrupt)?;
        match Message::decode(r.rest()).map_err(corrupt)?.body {
            Body::Process(msg) => Ok(Self {
                msg,
                cpu,
                mem,
                affinity,
                start_time,
            }),
            _ => Err(StateFileError::NotAProcess(index)),
        }
    }
}

/// Which records a query selects. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFilter {
    pub category: Option<Category>,
    pub uid: Option<u16>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub id: Option<u16>,
    pub name: Option<String>,
}

impl ProcessFilter {
    /// The filters selected by a query message's `param` bits. Command
    /// messages (with the message-type bit) select everything.
    pub fn from_query(q: &ProcessMessage) -> Self {
        let p = q.param;
        if p & param::IS_MSGTYPE != 0 {
            return Self::default();
        }
        let on = |bit: u8| p & bit != 0;
        Self {
            category: on(param::USE_CATEGORY).then_some(q.category),
            uid: on(param::USE_UID).then_some(q.uid),
            pid: on(param::USE_PID).then_some(q.pid),
            port: on(param::USE_PORT).then_some(q.port),
            id: on(param::USE_ID).then_some(q.id),
            name: on(param::USE_NAME).then(|| q.name.clone()),
        }
    }

    pub fn matches(&self, m: &ProcessMessage) -> bool {
        self.category.map_or(true, |c| c == m.category)
            && self.uid.map_or(true, |u| u == m.uid)
            && self.pid.map_or(true, |p| p == m.pid)
            && self.port.map_or(true, |p| p == m.port)
            && self.id.map_or(true, |i| i == m.id)
            && self.name.as_ref().map_or(true, |n| *n == m.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// True when an identical (pid, category, name) record was updated in place.
    pub reregistered: bool,
    /// Records pushed out because they held the same port or pid.
    pub evicted: Vec<ProcessRecord>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub dropped: usize,
}

/// What a spawn needs beyond the user's environment.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub user: &'a UserEnv,
    pub exe: &'a str,
    pub config: &'a str,
    /// Appended to the config directory, e.g. `64`.
    pub architecture: &'a str,
    pub timing_method: &'a str,
    pub args: Vec<String>,
}

pub const TIMING_METHOD_ENV: &str = "MACHINED_TIMING_METHOD";

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: Vec<ProcessRecord>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    /// Add `msg`, evicting whatever held its port or pid. An identical
    /// registration refreshes the existing record instead.
    pub fn register(&mut self, mut msg: ProcessMessage, probe: &mut dyn ProcessProbe) -> Registration {
        msg.param = 0;
        let mut evicted = Vec::new();
        let mut i = 0;
        while i < self.records.len() {
            let r = &self.records[i];
            let port_clash = msg.port != 0 && r.msg.port == msg.port;
            if !r.msg.same_identity(&msg) && (port_clash || r.msg.pid == msg.pid) {
                error!(
                    pid = msg.pid,
                    port = msg.port,
                    previous_pid = r.msg.pid,
                    "registration clashes with an existing process, evicting it"
                );
                evicted.push(self.records.remove(i));
            } else {
                i += 1;
            }
        }

        let existing = self.records.iter().position(|r| r.msg.same_identity(&msg));
        let reregistered = existing.is_some();
        let idx = match existing {
            Some(idx) => {
                warn!(process = %msg, "received re-registration");
                self.records[idx].msg = msg;
                idx
            }
            None => {
                self.records.push(ProcessRecord::new(msg));
                self.records.len() - 1
            }
        };
        let record = &mut self.records[idx];
        // twice so both generations hold real readings
        for _ in 0..2 {
            sample_into(record, probe);
        }
        info!(process = %record.msg, "added process");
        Registration {
            reregistered,
            evicted,
        }
    }

    pub fn deregister(&mut self, pid: u32) -> Option<ProcessRecord> {
        let pos = self.records.iter().position(|r| r.msg.pid == pid)?;
        Some(self.records.remove(pos))
    }

    pub fn find<'a>(&'a self, filter: &'a ProcessFilter) -> impl Iterator<Item = &'a ProcessRecord> + 'a {
        self.records.iter().filter(move |r| filter.matches(&r.msg))
    }

    /// Re-sample every record; records whose process vanished or whose pid
    /// was reused are removed and returned.
    pub fn refresh_stats(&mut self, probe: &mut dyn ProcessProbe) -> Vec<ProcessRecord> {
        let mut gone = Vec::new();
        let mut i = 0;
        while i < self.records.len() {
            if sample_into(&mut self.records[i], probe) {
                i += 1;
            } else {
                let r = self.records.remove(i);
                error!(process = %r.msg, "process died without deregistering");
                gone.push(r);
            }
        }
        gone
    }

    /// Send `signal` to every matching process; returns the pids signalled.
    pub fn signal(
        &self,
        filter: &ProcessFilter,
        signal: i32,
        launcher: &mut dyn ProcessLauncher,
    ) -> Vec<u32> {
        let mut sent = Vec::new();
        for r in self.find(filter) {
            match launcher.signal(r.msg.pid, signal) {
                Ok(()) => {
                    info!(signal, pid = r.msg.pid, uid = r.msg.uid, "sent signal");
                    sent.push(r.msg.pid);
                }
                Err(e) => warn!(error = %e, "signal failed"),
            }
        }
        sent
    }

    /// Start `req.exe` as `req.user` from the user's `bin/<config><arch>/` directory.
    pub fn spawn(&self, launcher: &mut dyn ProcessLauncher, req: &SpawnRequest<'_>) -> Result<u32, SpawnError> {
        launcher.spawn(&launch_spec(req)?)
    }

    /// Write every record to `path`, replacing it atomically. Returns the
    /// number of records written.
    pub fn save(&self, path: &Path) -> Result<usize, StateFileError> {
        let mut w = WireWriter::new();
        for (index, r) in self.records.iter().enumerate() {
            let bytes = r.encode().map_err(|source| StateFileError::Corrupt { index, source })?;
            w.u32(bytes.len() as u32);
            w.bytes(&bytes);
        }
        let tmp = tmp_path(path);
        fs::write(&tmp, w.as_slice())?;
        fs::rename(&tmp, path)?;
        if !self.records.is_empty() {
            info!(entries = self.records.len(), path = %path.display(), "wrote process table");
        }
        Ok(self.records.len())
    }

    /// Reload a table written by [`save`](Self::save), keeping only records
    /// whose process still runs with the same start time. The file is
    /// removed afterwards whatever its contents.
    pub fn restore(
        &mut self,
        path: &Path,
        max_age: Duration,
        probe: &mut dyn ProcessProbe,
    ) -> Result<RestoreReport, StateFileError> {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RestoreReport::default()),
            Err(e) => return Err(e.into()),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age > max_age {
            info!(path = %path.display(), age_secs = age.as_secs(), "ignoring out-of-date state file");
            fs::remove_file(path)?;
            return Ok(RestoreReport::default());
        }

        let data = fs::read(path);
        let removed = fs::remove_file(path);
        let data = data?;
        removed?;

        let mut r = WireReader::new(&data);
        let mut report = RestoreReport::default();
        let mut index = 0;
        while !r.is_empty() {
            let corrupt = |source| StateFileError::Corrupt { index, source };
            let len = r.u32().map_err(corrupt)? as usize;
            let mut rec = ProcessRecord::decode(r.bytes(len).map_err(corrupt)?, index)?;
            index += 1;
            let pid = rec.msg.pid;
            let known_start = rec.start_time;
            match probe.sample(pid) {
                Some(s) if known_start == 0 || s.start_time == known_start => {
                    rec.affinity = s.cpu;
                    info!(name = %rec.msg.name, pid, uid = rec.msg.uid, "restored process");
                    self.records.push(rec);
                    report.restored += 1;
                }
                Some(s) => {
                    warn!(name = %rec.msg.name, pid, old = known_start, current = s.start_time, "pid was reused, not restoring");
                    report.dropped += 1;
                }
                None => {
                    warn!(name = %rec.msg.name, pid, uid = rec.msg.uid, "process is gone, not restoring");
                    report.dropped += 1;
                }
            }
        }
        info!(restored = report.restored, total = index, path = %path.display(), "restored process table");
        Ok(report)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Returns false when the process is gone or its pid now belongs to something else.
fn sample_into(record: &mut ProcessRecord, probe: &mut dyn ProcessProbe) -> bool {
    let Some(s) = probe.sample(record.msg.pid) else {
        return false;
    };
    if record.start_time != 0 && record.start_time != s.start_time {
        warn!(
            pid = record.msg.pid,
            old = record.start_time,
            current = s.start_time,
            "process start time changed"
        );
        return false;
    }
    record.cpu.update(s.cpu_time);
    record.mem.update(s.vsize);
    record.affinity = s.cpu;
    record.start_time = s.start_time;
    true
}

/// Resolve a spawn request into an exec spec. Rejects anything that could
/// escape the user's bin directory.
pub fn launch_spec(req: &SpawnRequest<'_>) -> Result<LaunchSpec, SpawnError> {
    if req.exe.contains("..") || req.config.contains("..") {
        return Err(SpawnError::IllegalPath(format!("{}/{}", req.config, req.exe)));
    }
    if req.user.fsroot.is_empty() {
        return Err(SpawnError::NoEnvironment(req.user.username.clone()));
    }
    let dir = Path::new(&req.user.fsroot)
        .join("bin")
        .join(format!("{}{}", req.config, req.architecture));
    let mut args = req.args.clone();
    args.push("--res".into());
    args.push(req.user.respath.clone());
    Ok(LaunchSpec {
        exe: dir.join(req.exe),
        args,
        cwd: dir,
        uid: req.user.uid as u32,
        gid: req.user.gid,
        env: vec![
            ("HOME".into(), req.user.home.clone()),
            (TIMING_METHOD_ENV.into(), req.timing_method.into()),
        ],
    })
}

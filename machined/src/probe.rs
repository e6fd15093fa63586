//! Reading machine and per-process counters from the OS.
//!
//! On Linux cpu time comes straight from /proc so machine and process
//! figures share the jiffy unit. Elsewhere sysinfo supplies everything.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(not(target_os = "linux"))]
use std::time::Instant;
use sysinfo::{Networks, System};
use tracing::debug;

/// Cumulative busy and total time for one cpu (or for io-wait).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Cumulative traffic counters for one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineSample {
    pub hostname: String,
    pub cpu_mhz: u16,
    pub cpus: Vec<CpuTimes>,
    pub io_wait: CpuTimes,
    pub mem_used: u64,
    pub mem_total: u64,
    /// Loopback excluded.
    pub interfaces: Vec<InterfaceCounters>,
    pub in_discards: u64,
    pub out_discards: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSample {
    /// Cumulative user + system time, in the same unit as [`CpuTimes`].
    pub cpu_time: u64,
    /// Virtual size in bytes.
    pub vsize: u64,
    /// Core the process last ran on.
    pub cpu: u32,
    /// Opaque start stamp; a different value for the same pid means the pid was reused.
    pub start_time: u64,
}

pub trait MachineProbe {
    fn sample(&mut self) -> MachineSample;
}

pub trait ProcessProbe {
    /// `None` once the process is gone.
    fn sample(&mut self, pid: u32) -> Option<ProcessSample>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Whether `pid` names a live process. Pid 0 never does: signalling it
/// would target our own process group.
pub fn pid_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

pub struct SystemMachineProbe {
    sys: System,
    nets: Networks,
    #[cfg(not(target_os = "linux"))]
    synthetic: Vec<CpuTimes>,
    #[cfg(not(target_os = "linux"))]
    last: Instant,
}

impl Default for SystemMachineProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMachineProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        Self {
            sys,
            nets: Networks::new_with_refreshed_list(),
            #[cfg(not(target_os = "linux"))]
            synthetic: Vec::new(),
            #[cfg(not(target_os = "linux"))]
            last: Instant::now(),
        }
    }

    #[cfg(target_os = "linux")]
    fn cpu_times(&mut self) -> (Vec<CpuTimes>, CpuTimes) {
        match fs::read_to_string("/proc/stat") {
            Ok(s) => parse_proc_stat(&s),
            Err(e) => {
                debug!(error = %e, "reading /proc/stat");
                (Vec::new(), CpuTimes::default())
            }
        }
    }

    // sysinfo only reports usage since the previous refresh, so accumulate
    // it into counters that behave like jiffies.
    #[cfg(not(target_os = "linux"))]
    fn cpu_times(&mut self) -> (Vec<CpuTimes>, CpuTimes) {
        let elapsed = self.last.elapsed().as_millis() as u64;
        self.last = Instant::now();
        let cpus = self.sys.cpus();
        self.synthetic.resize(cpus.len(), CpuTimes::default());
        for (acc, cpu) in self.synthetic.iter_mut().zip(cpus) {
            let usage = cpu.cpu_usage().clamp(0.0, 100.0) as f64 / 100.0;
            acc.total = acc.total.saturating_add(elapsed);
            acc.busy = acc
                .busy
                .saturating_add((usage * elapsed as f64) as u64);
        }
        (self.synthetic.clone(), CpuTimes::default())
    }
}

impl MachineProbe for SystemMachineProbe {
    fn sample(&mut self) -> MachineSample {
        self.sys.refresh_cpu_all();
        self.sys.refresh_memory();
        self.nets.refresh(true);

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        let cpu_mhz = self
            .sys
            .cpus()
            .first()
            .map(|c| c.frequency().min(u16::MAX as u64) as u16)
            .unwrap_or(0);
        let (cpus, io_wait) = self.cpu_times();

        let mut interfaces: Vec<InterfaceCounters> = self
            .nets
            .iter()
            .filter(|(name, _)| !is_loopback_name(name))
            .map(|(name, data)| InterfaceCounters {
                name: name.clone(),
                bytes_in: data.total_received(),
                bytes_out: data.total_transmitted(),
                packets_in: data.total_packets_received(),
                packets_out: data.total_packets_transmitted(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        let (in_discards, out_discards) = ip_discards();

        MachineSample {
            hostname,
            cpu_mhz,
            cpus,
            io_wait,
            mem_used: self.sys.used_memory(),
            mem_total: self.sys.total_memory(),
            interfaces,
            in_discards,
            out_discards,
        }
    }
}

fn is_loopback_name(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0")
}

/// Per-cpu busy/total jiffies plus the machine-wide io-wait share.
#[cfg(target_os = "linux")]
pub fn parse_proc_stat(s: &str) -> (Vec<CpuTimes>, CpuTimes) {
    let mut cpus = Vec::new();
    let mut io_wait = CpuTimes::default();
    for line in s.lines() {
        let mut it = line.split_whitespace();
        let Some(label) = it.next() else { continue };
        if !label.starts_with("cpu") {
            continue;
        }
        // user nice system idle iowait irq softirq steal
        let f: Vec<u64> = it.take(8).filter_map(|t| t.parse().ok()).collect();
        if f.len() < 4 {
            continue;
        }
        let total: u64 = f.iter().sum();
        let idle = f[3] + f.get(4).copied().unwrap_or(0);
        if label == "cpu" {
            io_wait = CpuTimes {
                busy: f.get(4).copied().unwrap_or(0),
                total,
            };
        } else {
            cpus.push(CpuTimes {
                busy: total.saturating_sub(idle),
                total,
            });
        }
    }
    (cpus, io_wait)
}

/// IP-level InDiscards/OutDiscards from /proc/net/snmp.
#[cfg(target_os = "linux")]
fn ip_discards() -> (u64, u64) {
    fs::read_to_string("/proc/net/snmp")
        .ok()
        .and_then(|s| parse_snmp_discards(&s))
        .unwrap_or((0, 0))
}

#[cfg(not(target_os = "linux"))]
fn ip_discards() -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
pub fn parse_snmp_discards(s: &str) -> Option<(u64, u64)> {
    let mut ip_lines = s.lines().filter(|l| l.starts_with("Ip:"));
    let header: Vec<&str> = ip_lines.next()?.split_whitespace().collect();
    let values: Vec<&str> = ip_lines.next()?.split_whitespace().collect();
    let field = |name: &str| -> Option<u64> {
        let i = header.iter().position(|h| *h == name)?;
        values.get(i)?.parse().ok()
    };
    Some((field("InDiscards")?, field("OutDiscards")?))
}

/// Process counters: /proc on Linux, sysinfo elsewhere.
#[derive(Default)]
pub struct SystemProcessProbe {
    #[cfg(not(target_os = "linux"))]
    sys: System,
}

impl SystemProcessProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(target_os = "linux")]
impl ProcessProbe for SystemProcessProbe {
    fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        let s = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_proc_pid_stat(&s)
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_exists(pid)
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessProbe for SystemProcessProbe {
    fn sample(&mut self, pid: u32) -> Option<ProcessSample> {
        use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessesToUpdate};
        let spid = SysPid::from_u32(pid);
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[spid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let p = self.sys.process(spid)?;
        Some(ProcessSample {
            cpu_time: p.accumulated_cpu_time(),
            vsize: p.virtual_memory(),
            cpu: 0,
            start_time: p.start_time(),
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_exists(pid)
    }
}

/// Pull utime+stime, vsize, start time and last cpu out of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub fn parse_proc_pid_stat(s: &str) -> Option<ProcessSample> {
    // comm may contain spaces and parens; fields resume after the last ')'
    let rpar = s.rfind(')')?;
    let fields: Vec<&str> = s.get(rpar + 2..)?.split_whitespace().collect();
    // index 0 is field 3 ("state")
    let num = |field: usize| -> Option<u64> { fields.get(field - 3)?.parse().ok() };
    Some(ProcessSample {
        cpu_time: num(14)?.saturating_add(num(15)?),
        start_time: num(22)?,
        vsize: num(23)?,
        cpu: num(39).unwrap_or(0) as u32,
    })
}

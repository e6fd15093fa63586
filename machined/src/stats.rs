//! Two-generation counters and the machine-wide telemetry built from them.

use crate::probe::MachineSample;
use crate::wire::{InterfaceStats, MachineMessage};

/// Version byte advertised in machine replies.
pub const MACHINED_VERSION: u8 = 43;

// One unit of the 8-bit interface counters, per housekeeping tick.
const BIT_INCREMENT: u64 = 1 << 20;
const PACKET_INCREMENT: u64 = 1 << 8;

/// A monotonically sampled counter holding the current and previous reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sample {
    cur: u64,
    prev: u64,
}

impl Sample {
    pub fn new(cur: u64, prev: u64) -> Self {
        Self { cur, prev }
    }

    pub fn update(&mut self, v: u64) {
        self.prev = self.cur;
        self.cur = v;
    }

    /// Set both generations, so the next delta is measured from `v`.
    pub fn prime(&mut self, v: u64) {
        self.prev = v;
        self.cur = v;
    }

    pub fn cur(&self) -> u64 {
        self.cur
    }

    pub fn prev(&self) -> u64 {
        self.prev
    }

    pub fn delta(&self) -> u64 {
        self.cur.saturating_sub(self.prev)
    }
}

/// `part / whole` on a 0..=255 scale.
pub fn scale_u8(part: u64, whole: u64) -> u8 {
    let whole = whole.max(1) as u128;
    ((part as u128 * 0xff) / whole).min(0xff) as u8
}

#[derive(Debug, Default)]
struct CpuCounters {
    busy: Sample,
    total: Sample,
}

#[derive(Debug, Default)]
struct InterfaceCounters {
    name: String,
    bits_in: Sample,
    bits_out: Sample,
    packets_in: Sample,
    packets_out: Sample,
}

#[derive(Debug, Default)]
pub struct SystemStats {
    cpus: Vec<CpuCounters>,
    io_wait: CpuCounters,
    mem_total: u64,
    interfaces: Vec<InterfaceCounters>,
    whole: MachineMessage<u8>,
    high: MachineMessage<u32>,
    io_wait_load: u8,
}

impl SystemStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a fresh sample and rebuild both telemetry replies.
    pub fn update(&mut self, s: MachineSample) {
        let first = self.cpus.is_empty();
        if self.cpus.len() != s.cpus.len() {
            self.cpus.resize_with(s.cpus.len(), CpuCounters::default);
        }
        for (c, t) in self.cpus.iter_mut().zip(&s.cpus) {
            advance(&mut c.busy, t.busy, first);
            advance(&mut c.total, t.total, first);
        }
        advance(&mut self.io_wait.busy, s.io_wait.busy, first);
        advance(&mut self.io_wait.total, s.io_wait.total, first);
        self.mem_total = s.mem_total;

        for ifs in &s.interfaces {
            let pos = self.interfaces.iter().position(|c| c.name == ifs.name);
            let (c, fresh) = match pos {
                Some(i) => (&mut self.interfaces[i], false),
                None => {
                    self.interfaces.push(InterfaceCounters {
                        name: ifs.name.clone(),
                        ..Default::default()
                    });
                    let last = self.interfaces.len() - 1;
                    (&mut self.interfaces[last], true)
                }
            };
            advance(&mut c.bits_in, ifs.bytes_in.saturating_mul(8), fresh);
            advance(&mut c.bits_out, ifs.bytes_out.saturating_mul(8), fresh);
            advance(&mut c.packets_in, ifs.packets_in, fresh);
            advance(&mut c.packets_out, ifs.packets_out, fresh);
        }
        self.interfaces
            .retain(|c| s.interfaces.iter().any(|i| i.name == c.name));

        let cpu_loads: Vec<u8> = self
            .cpus
            .iter()
            .take(u8::MAX as usize)
            .map(|c| scale_u8(c.busy.delta(), c.total.delta()))
            .collect();
        let mem = scale_u8(s.mem_used, s.mem_total);
        let in_discards = s.in_discards.min(0xff) as u8;
        let out_discards = s.out_discards.min(0xff) as u8;
        let interfaces = &self.interfaces[..self.interfaces.len().min(u8::MAX as usize)];

        self.io_wait_load = scale_u8(self.io_wait.busy.delta(), self.io_wait.total.delta());
        self.whole = MachineMessage {
            hostname: s.hostname.clone(),
            cpu_speed: s.cpu_mhz,
            cpu_loads: cpu_loads.clone(),
            mem,
            version: MACHINED_VERSION,
            in_discards,
            out_discards,
            interfaces: interfaces
                .iter()
                .map(|c| InterfaceStats {
                    name: c.name.clone(),
                    bits_in: (c.bits_in.delta() / BIT_INCREMENT).min(0xff) as u8,
                    bits_out: (c.bits_out.delta() / BIT_INCREMENT).min(0xff) as u8,
                    packets_in: (c.packets_in.delta() / PACKET_INCREMENT).min(0xff) as u8,
                    packets_out: (c.packets_out.delta() / PACKET_INCREMENT).min(0xff) as u8,
                })
                .collect(),
        };
        self.high = MachineMessage {
            hostname: s.hostname,
            cpu_speed: s.cpu_mhz,
            cpu_loads,
            mem,
            version: MACHINED_VERSION,
            in_discards,
            out_discards,
            interfaces: interfaces
                .iter()
                .map(|c| InterfaceStats {
                    name: c.name.clone(),
                    bits_in: clamp_u32(c.bits_in.delta()),
                    bits_out: clamp_u32(c.bits_out.delta()),
                    packets_in: clamp_u32(c.packets_in.delta()),
                    packets_out: clamp_u32(c.packets_out.delta()),
                })
                .collect(),
        };
    }

    pub fn whole_machine(&self) -> &MachineMessage<u8> {
        &self.whole
    }

    pub fn high_precision(&self) -> (&MachineMessage<u32>, u8) {
        (&self.high, self.io_wait_load)
    }

    /// Capacity of the core a process last ran on, over the last tick.
    pub fn core_capacity(&self, cpu: u32) -> u64 {
        if self.cpus.is_empty() {
            return 1;
        }
        let c = &self.cpus[cpu as usize % self.cpus.len()];
        c.total.delta().max(1)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn mem_total(&self) -> u64 {
        self.mem_total
    }
}

fn advance(s: &mut Sample, v: u64, first: bool) {
    if first {
        s.prime(v);
    } else {
        s.update(v);
    }
}

fn clamp_u32(v: u64) -> u32 {
    v.min(u32::MAX as u64) as u32
}

//! Cluster membership: the known-peer set, the buddy pointer, and the
//! bootstrap and flood state machines.
//!
//! Nothing here touches sockets or clocks. The daemon feeds in replies and
//! timer expiries and broadcasts whatever messages come back.

use crate::wire::{Announce, Body, MachineMessage, Message};
use rand::Rng;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, info, warn};

/// Window receivers use to stagger replies to broadcast packets.
pub const STAGGER_REPLY_PERIOD_MS: u64 = 100;
/// How often a bootstrapping node re-checks whether replies have converged.
pub const BIRTH_CHECK_INTERVAL_MS: u64 = 2 * STAGGER_REPLY_PERIOD_MS;
/// Re-broadcasts of the birth announcement before settling for what we have.
pub const BIRTH_MAX_REBROADCASTS: u32 = 5;
/// Mean flood interval per cluster member.
pub const FLOOD_AVERAGE_INTERVAL_MS: u64 = 2000;
/// Re-broadcasts of a flood poll while some known peer stays silent.
pub const FLOOD_RETRIES: u32 = 3;
/// Wait after each flood broadcast before judging the replies.
pub const FLOOD_ROUND_MS: u64 = 500;

/// Ring successor of `me` in address order, wrapping to the lowest peer.
/// `None` when `me` is alone.
pub fn buddy_of(me: Ipv4Addr, peers: &BTreeSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    peers
        .range((Excluded(me), Unbounded))
        .next()
        .or_else(|| peers.iter().find(|&&p| p != me))
        .copied()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloodOutcome {
    /// Known peers that did not reply.
    pub deaths: Vec<Ipv4Addr>,
    /// Repliers we did not know about.
    pub births: Vec<Ipv4Addr>,
}

impl FloodOutcome {
    pub fn is_empty(&self) -> bool {
        self.deaths.is_empty() && self.births.is_empty()
    }
}

/// Compare a flood's repliers against the known set. `me` is never
/// reported dead even if our own reply was lost.
pub fn flood_outcome(
    me: Ipv4Addr,
    known: &BTreeSet<Ipv4Addr>,
    replied: &BTreeSet<Ipv4Addr>,
) -> FloodOutcome {
    FloodOutcome {
        deaths: known
            .difference(replied)
            .copied()
            .filter(|&a| a != me)
            .collect(),
        births: replied.difference(known).copied().collect(),
    }
}

#[derive(Debug)]
struct BirthRound {
    seq: u16,
    max_count: u32,
    rebroadcasts: u32,
}

#[derive(Debug)]
struct FloodRound {
    seq: u16,
    replied: BTreeSet<Ipv4Addr>,
    retries_left: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BirthCheck {
    /// Our peer count matches the largest count any peer asserted.
    Converged,
    /// Still short; broadcast this again.
    Rebroadcast(Message),
    /// Out of retries; the known set stands as is.
    GaveUp,
    /// No bootstrap in progress.
    Idle,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FloodStep {
    /// Some peers stayed silent; broadcast the poll again and wait another round.
    Retry(Message),
    /// The round is over and the outcome applied. `announce` holds the
    /// death/exists messages to broadcast, empty when nothing changed.
    Finished {
        outcome: FloodOutcome,
        announce: Vec<Message>,
    },
    Idle,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeathReport {
    Removed,
    Unknown,
    /// Someone announced our own death.
    Refuted,
}

pub struct ClusterMembership {
    me: Ipv4Addr,
    known: BTreeSet<Ipv4Addr>,
    buddy: Option<Ipv4Addr>,
    birth: Option<BirthRound>,
    flood: Option<FloodRound>,
}

impl ClusterMembership {
    pub fn new(me: Ipv4Addr) -> Self {
        Self {
            me,
            known: BTreeSet::from([me]),
            buddy: None,
            birth: None,
            flood: None,
        }
    }

    pub fn me(&self) -> Ipv4Addr {
        self.me
    }

    pub fn known(&self) -> &BTreeSet<Ipv4Addr> {
        &self.known
    }

    pub fn size(&self) -> usize {
        self.known.len()
    }

    pub fn buddy(&self) -> Option<Ipv4Addr> {
        self.buddy
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.birth.is_some()
    }

    pub fn flood_seq(&self) -> Option<u16> {
        self.flood.as_ref().map(|f| f.seq)
    }

    fn choose_buddy(&mut self) {
        let buddy = buddy_of(self.me, &self.known);
        if buddy != self.buddy {
            match buddy {
                Some(b) => info!(buddy = %b, "buddy changed"),
                None => info!("no buddy, this is the only known machine"),
            }
            self.buddy = buddy;
        }
    }

    pub fn insert(&mut self, addr: Ipv4Addr) -> bool {
        if !self.known.insert(addr) {
            return false;
        }
        self.choose_buddy();
        true
    }

    pub fn remove(&mut self, addr: Ipv4Addr) -> bool {
        if addr == self.me || !self.known.remove(&addr) {
            return false;
        }
        self.choose_buddy();
        true
    }

    /// Begin (or restart) bootstrap. Returns the birth announcement to
    /// broadcast with staggered replies.
    pub fn start_birth(&mut self, seq: u16) -> Message {
        self.birth = Some(BirthRound {
            seq,
            max_count: 0,
            rebroadcasts: 0,
        });
        birth_request(seq)
    }

    /// A peer answered our birth announcement with its view of the cluster size.
    pub fn on_birth_reply(&mut self, from: Ipv4Addr, count: u32) {
        let Some(round) = self.birth.as_mut() else {
            debug!(%from, count, "birth reply outside bootstrap");
            return;
        };
        round.max_count = round.max_count.max(count);
        self.insert(from);
    }

    /// A peer announced its own birth. It joins the known set; the return
    /// value is the count to reply with.
    pub fn on_birth_request(&mut self, from: Ipv4Addr) -> u32 {
        if self.insert(from) {
            info!(machine = %from, "machine joined");
        }
        self.known.len() as u32
    }

    pub fn check_birth(&mut self) -> BirthCheck {
        let Some(round) = self.birth.as_mut() else {
            return BirthCheck::Idle;
        };
        if round.max_count as usize == self.known.len() {
            info!(machines = self.known.len(), "bootstrap converged");
            self.birth = None;
            return BirthCheck::Converged;
        }
        if round.rebroadcasts >= BIRTH_MAX_REBROADCASTS {
            warn!(
                known = self.known.len(),
                asserted = round.max_count,
                "bootstrap did not converge, keeping best-known machine set"
            );
            self.birth = None;
            return BirthCheck::GaveUp;
        }
        round.rebroadcasts += 1;
        debug!(
            known = self.known.len(),
            asserted = round.max_count,
            attempt = round.rebroadcasts,
            "re-broadcasting birth"
        );
        BirthCheck::Rebroadcast(birth_request(round.seq))
    }

    /// Randomised delay until the next flood, growing with the cluster so the
    /// aggregate broadcast rate stays flat.
    pub fn flood_delay<R: Rng>(&self, rng: &mut R) -> u64 {
        let avg = FLOOD_AVERAGE_INTERVAL_MS * self.known.len().max(1) as u64;
        rng.gen_range(avg / 2..avg + avg / 2)
    }

    /// Begin a flood round. Returns the poll to broadcast with staggered replies.
    pub fn start_flood(&mut self, seq: u16) -> Message {
        if self.flood.is_some() {
            debug!("flood already running, restarting it");
        }
        self.flood = Some(FloodRound {
            seq,
            replied: BTreeSet::new(),
            retries_left: FLOOD_RETRIES,
        });
        flood_request(seq)
    }

    /// Record a machine reply. False if it does not belong to the running flood.
    pub fn on_flood_reply(&mut self, seq: u16, from: Ipv4Addr) -> bool {
        match self.flood.as_mut() {
            Some(round) if round.seq == seq => {
                round.replied.insert(from);
                true
            }
            _ => false,
        }
    }

    /// Judge the replies gathered since the last round started.
    pub fn end_flood_round(&mut self) -> FloodStep {
        let Some(round) = self.flood.as_mut() else {
            return FloodStep::Idle;
        };
        let outcome = flood_outcome(self.me, &self.known, &round.replied);
        if !outcome.deaths.is_empty() && round.retries_left > 0 {
            round.retries_left -= 1;
            debug!(
                silent = outcome.deaths.len(),
                retries_left = round.retries_left,
                "flood retry"
            );
            return FloodStep::Retry(flood_request(round.seq));
        }
        self.flood = None;

        let mut announce = Vec::with_capacity(outcome.deaths.len() + outcome.births.len());
        for &addr in &outcome.deaths {
            warn!(machine = %addr, "machine stopped responding");
            self.known.remove(&addr);
            announce.push(Message::request(0, Body::Announce(Announce::Death { addr })));
        }
        for &addr in &outcome.births {
            info!(machine = %addr, "found new machine");
            self.known.insert(addr);
            announce.push(Message::request(0, Body::Announce(Announce::Exists { addr })));
        }
        if !outcome.is_empty() {
            self.choose_buddy();
        }
        FloodStep::Finished { outcome, announce }
    }

    pub fn on_announce_death(&mut self, addr: Ipv4Addr) -> DeathReport {
        if addr == self.me {
            return DeathReport::Refuted;
        }
        if self.remove(addr) {
            DeathReport::Removed
        } else {
            DeathReport::Unknown
        }
    }

    pub fn on_announce_exists(&mut self, addr: Ipv4Addr) -> bool {
        self.insert(addr)
    }
}

fn birth_request(seq: u16) -> Message {
    Message::request(seq, Body::Announce(Announce::Birth { count: 0 }))
}

fn flood_request(seq: u16) -> Message {
    Message::request(seq, Body::WholeMachine(MachineMessage::default()))
}

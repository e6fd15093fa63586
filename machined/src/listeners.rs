//! Birth/death subscriptions and the datagrams fanned out to subscribers.

use crate::wire::{Category, ListenerKind, ProcessMessage, ANY_UID};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub kind: ListenerKind,
    pub category: Category,
    /// [`ANY_UID`] matches every user.
    pub uid: u16,
    /// Empty matches every name.
    pub name: String,
    /// Process that asked; the subscription lapses when it exits. 0 never lapses.
    pub owner_pid: u32,
    pub host: Ipv4Addr,
    pub port: u16,
    pub pre_addr: Vec<u8>,
    pub post_addr: Vec<u8>,
}

impl Subscription {
    pub fn matches(&self, kind: ListenerKind, p: &ProcessMessage) -> bool {
        self.kind == kind
            && self.category == p.category
            && (self.uid == ANY_UID || self.uid == p.uid)
            && (self.name.is_empty() || self.name == p.name)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }

    /// `pre ++ ip ++ port(big-endian) ++ post`
    pub fn splice(&self, addr: SocketAddrV4) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pre_addr.len() + 6 + self.post_addr.len());
        out.extend_from_slice(&self.pre_addr);
        out.extend_from_slice(&addr.ip().octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
        out.extend_from_slice(&self.post_addr);
        out
    }
}

#[derive(Debug, Default)]
pub struct ListenerTable {
    subs: Vec<Subscription>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subs
    }

    /// Add a subscription; an identical one already present is kept as is.
    pub fn subscribe(&mut self, sub: Subscription) {
        if self.subs.contains(&sub) {
            debug!(host = %sub.host, port = sub.port, "duplicate listener ignored");
            return;
        }
        info!(
            kind = ?sub.kind,
            category = %sub.category,
            host = %sub.host,
            port = sub.port,
            "added listener"
        );
        self.subs.push(sub);
    }

    /// Datagrams telling every matching subscriber that `process` was born
    /// or died at `addr`.
    pub fn notify(
        &self,
        kind: ListenerKind,
        process: &ProcessMessage,
        addr: SocketAddrV4,
    ) -> Vec<(SocketAddrV4, Vec<u8>)> {
        self.subs
            .iter()
            .filter(|s| s.matches(kind, process))
            .map(|s| (s.destination(), s.splice(addr)))
            .collect()
    }

    /// Drop subscriptions whose owning process has exited.
    pub fn sweep(&mut self, is_alive: impl Fn(u32) -> bool) -> usize {
        let before = self.subs.len();
        self.subs.retain(|s| s.owner_pid == 0 || is_alive(s.owner_pid));
        let dropped = before - self.subs.len();
        if dropped > 0 {
            info!(dropped, "removed listeners of exited processes");
        }
        dropped
    }
}

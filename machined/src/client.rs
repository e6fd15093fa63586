//! Request/reply helper for tools that query daemons.

use crate::cluster::STAGGER_REPLY_PERIOD_MS;
use crate::transport::bind_udp;
use crate::wire::{Body, Message, Packet, SeqTicker, WireError, MAX_PACKET_SIZE};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub const CLIENT_ATTEMPTS: u32 = 3;
pub const CLIENT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket: {0}")]
    Io(#[from] io::Error),
    #[error("encoding request: {0}")]
    Wire(#[from] WireError),
    #[error("no reply from {target} after {attempts} attempts")]
    Timeout { target: SocketAddrV4, attempts: u32 },
}

/// Collects the replies to one request. For broadcasts it also tracks the
/// buddies that repliers advertise, so the caller can keep waiting until
/// every advertised machine has answered.
///
/// A machine may split its replies over several packets within one attempt;
/// once an attempt is over, its later packets are answers to our resends and
/// are skipped.
#[derive(Debug)]
pub struct ReplyCollector {
    seq: u16,
    attempt: u32,
    replies: Vec<(SocketAddrV4, Message)>,
    /// Machine -> attempt during which it first replied.
    replied: BTreeMap<Ipv4Addr, u32>,
    waiting: BTreeSet<Ipv4Addr>,
}

impl ReplyCollector {
    pub fn new(seq: u16) -> Self {
        Self {
            seq,
            attempt: 1,
            replies: Vec::new(),
            replied: BTreeMap::new(),
            waiting: BTreeSet::new(),
        }
    }

    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// The request is about to be sent again.
    pub fn next_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Take one reply packet. Returns how many replies it contributed.
    pub fn accept(&mut self, packet: Packet, from: SocketAddrV4) -> usize {
        let ip = *from.ip();
        if matches!(self.replied.get(&ip), Some(&first) if first != self.attempt) {
            debug!(%from, "reply to a resent request");
            return 0;
        }
        let mut taken = 0;
        for msg in packet.messages {
            if msg.seq != self.seq {
                debug!(%from, seq = msg.seq, want = self.seq, "reply for another request");
                continue;
            }
            if msg.is_not_understood() {
                warn!(%from, kind = msg.kind(), "daemon did not understand the request");
                continue;
            }
            self.replies.push((from, msg));
            taken += 1;
        }
        if taken == 0 {
            return 0;
        }
        self.replied.entry(ip).or_insert(self.attempt);
        self.waiting.remove(&ip);
        let buddy = packet.buddy;
        if !buddy.is_unspecified() && !self.replied.contains_key(&buddy) {
            self.waiting.insert(buddy);
        }
        taken
    }

    pub fn replied(&self) -> &BTreeMap<Ipv4Addr, u32> {
        &self.replied
    }

    /// Machines named as a buddy that have not replied yet.
    pub fn waiting(&self) -> &BTreeSet<Ipv4Addr> {
        &self.waiting
    }

    /// At least one reply, and nobody advertised is still outstanding.
    pub fn is_complete(&self) -> bool {
        !self.replied.is_empty() && self.waiting.is_empty()
    }

    pub fn into_replies(self) -> Vec<(SocketAddrV4, Message)> {
        self.replies
    }
}

/// Fire-and-forget, for requests the daemon never answers (signals).
pub async fn send_only(target: SocketAddrV4, body: Body) -> Result<(), ClientError> {
    let std_sock = bind_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), true)?;
    let sock = UdpSocket::from_std(std_sock)?;
    let seq = SeqTicker::new(&mut rand::thread_rng()).next_seq();
    let bytes = Packet::single(Message::request(seq, body)).encode()?;
    sock.send_to(&bytes, SocketAddr::V4(target)).await?;
    Ok(())
}

/// Send `body` to `target` and gather the replies. A unicast request is
/// done at its first reply; a broadcast one once every advertised buddy has
/// answered too.
pub async fn send_and_recv(
    target: SocketAddrV4,
    body: Body,
) -> Result<Vec<(SocketAddrV4, Message)>, ClientError> {
    let std_sock = bind_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), true)?;
    let sock = UdpSocket::from_std(std_sock)?;
    let seq = SeqTicker::new(&mut rand::thread_rng()).next_seq();
    let bytes = Packet::single(Message::request(seq, body))
        .staggered()
        .encode()?;
    let broadcast = target.ip().is_broadcast();
    let mut collector = ReplyCollector::new(seq);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    for attempt in 1..=CLIENT_ATTEMPTS {
        if attempt > 1 {
            collector.next_attempt();
        }
        sock.send_to(&bytes, SocketAddr::V4(target)).await?;
        let deadline = tokio::time::Instant::now()
            + CLIENT_WINDOW
            + Duration::from_millis(STAGGER_REPLY_PERIOD_MS);
        loop {
            let Ok(r) = tokio::time::timeout_at(deadline, sock.recv_from(&mut buf)).await else {
                debug!(attempt, %target, "receive window closed");
                break;
            };
            let (n, from) = r?;
            let SocketAddr::V4(from) = from else { continue };
            let packet = match Packet::decode(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    warn!(%from, error = %e, "malformed reply");
                    continue;
                }
            };
            collector.accept(packet, from);
            let done = if broadcast {
                collector.is_complete()
            } else {
                !collector.replied().is_empty()
            };
            if done {
                return Ok(collector.into_replies());
            }
        }
    }
    if collector.replied().is_empty() {
        return Err(ClientError::Timeout {
            target,
            attempts: CLIENT_ATTEMPTS,
        });
    }
    warn!(missing = collector.waiting().len(), "some machines never replied");
    Ok(collector.into_replies())
}

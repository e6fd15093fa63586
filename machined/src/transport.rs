//! The three daemon sockets and startup discovery of the internal interface.

use crate::daemon::{Datagram, SocketKind};
use crate::wire::{MAX_PACKET_SIZE, PORT_BROADCAST_DISCOVERY};
use anyhow::{bail, Context, Result};
use nix::ifaddrs::getifaddrs;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);
const DISCOVERY_ATTEMPTS: u32 = 3;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Bind a UDP socket, retrying while the address is still held by a
/// previous instance. Sockets are close-on-exec so spawned children never
/// inherit them.
pub fn bind_udp(addr: SocketAddrV4, broadcast: bool) -> io::Result<std::net::UdpSocket> {
    let mut attempt = 1;
    loop {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_broadcast(broadcast)?;
        sock.set_nonblocking(true)?;
        match sock.bind(&SocketAddr::V4(addr).into()) {
            Ok(()) => return Ok(sock.into()),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(%addr, attempt, "address in use, retrying bind");
                attempt += 1;
                std::thread::sleep(BIND_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct Transport {
    addr: Ipv4Addr,
    internal: UdpSocket,
    local: UdpSocket,
    broadcast: UdpSocket,
}

impl Transport {
    /// Must be called inside a tokio runtime.
    pub fn bind(addr: Ipv4Addr, port: u16) -> Result<Self> {
        let open = |ip: Ipv4Addr, bcast: bool| -> Result<UdpSocket> {
            let sock = bind_udp(SocketAddrV4::new(ip, port), bcast)
                .with_context(|| format!("binding {ip}:{port}"))?;
            UdpSocket::from_std(sock).with_context(|| format!("registering {ip}:{port}"))
        };
        let t = Self {
            addr,
            internal: open(addr, true)?,
            local: open(Ipv4Addr::LOCALHOST, false)?,
            broadcast: open(Ipv4Addr::BROADCAST, true)?,
        };
        info!(%addr, port, "sockets bound");
        Ok(t)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn socket(&self, kind: SocketKind) -> &UdpSocket {
        match kind {
            SocketKind::Internal => &self.internal,
            SocketKind::Local => &self.local,
            SocketKind::Broadcast => &self.broadcast,
        }
    }

    /// Wait for a datagram on any socket.
    pub async fn recv_any(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4, SocketKind)> {
        loop {
            let kind = tokio::select! {
                r = self.internal.readable() => { r?; SocketKind::Internal }
                r = self.local.readable() => { r?; SocketKind::Local }
                r = self.broadcast.readable() => { r?; SocketKind::Broadcast }
            };
            match self.socket(kind).try_recv_from(buf) {
                Ok((n, SocketAddr::V4(from))) => return Ok((n, from, kind)),
                Ok((_, SocketAddr::V6(from))) => debug!(%from, "ignoring IPv6 datagram"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking send; a full socket buffer drops the datagram.
    pub fn send(&self, d: &Datagram) -> io::Result<usize> {
        let sock = match d.via {
            SocketKind::Local => &self.local,
            SocketKind::Internal | SocketKind::Broadcast => &self.internal,
        };
        sock.try_send_to(&d.bytes, SocketAddr::V4(d.dest))
    }
}

/// IPv4 addresses of the local interfaces, by interface name.
pub fn local_ipv4_interfaces() -> Vec<(String, Ipv4Addr)> {
    let Ok(addrs) = getifaddrs() else {
        return Vec::new();
    };
    addrs
        .filter_map(|ifa| {
            let sin = *ifa.address?.as_sockaddr_in()?;
            Some((ifa.interface_name, *SocketAddrV4::from(sin).ip()))
        })
        .collect()
}

/// Pick the internal interface: the configured address or interface name if
/// it exists here, otherwise whichever interface our own broadcast arrives from.
pub async fn resolve_internal(configured: Option<&str>) -> Result<Ipv4Addr> {
    let interfaces = local_ipv4_interfaces();
    if let Some(want) = configured {
        let found = match want.parse::<Ipv4Addr>() {
            Ok(ip) => interfaces.iter().find(|(_, a)| *a == ip),
            Err(_) => interfaces.iter().find(|(name, _)| name == want),
        };
        match found {
            Some((name, ip)) => {
                info!(interface = %name, addr = %ip, "using configured internal interface");
                return Ok(*ip);
            }
            None => warn!(
                internal_interface = want,
                "configured internal interface not found, discovering"
            ),
        }
    }

    match discover_broadcast_interface(&interfaces).await {
        Ok(ip) => return Ok(ip),
        Err(e) => warn!(error = %e, "broadcast discovery failed"),
    }
    match interfaces.iter().find(|(_, a)| !a.is_loopback()) {
        Some((name, ip)) => {
            warn!(interface = %name, addr = %ip, "falling back to first non-loopback interface");
            Ok(*ip)
        }
        None => bail!("no usable IPv4 interface"),
    }
}

async fn discover_broadcast_interface(interfaces: &[(String, Ipv4Addr)]) -> Result<Ipv4Addr> {
    let std_sock = bind_udp(
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT_BROADCAST_DISCOVERY),
        true,
    )
    .context("binding discovery socket")?;
    let sock = UdpSocket::from_std(std_sock)?;
    let token: u64 = rand::thread_rng().gen();
    let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, PORT_BROADCAST_DISCOVERY);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    for attempt in 1..=DISCOVERY_ATTEMPTS {
        sock.send_to(&token.to_le_bytes(), dest).await?;
        let deadline = tokio::time::Instant::now() + DISCOVERY_TIMEOUT;
        loop {
            let recv = tokio::time::timeout_at(deadline, sock.recv_from(&mut buf)).await;
            let Ok(r) = recv else {
                debug!(attempt, "no discovery reply");
                break;
            };
            let (n, from) = r?;
            let SocketAddr::V4(from) = from else { continue };
            if buf[..n] != token.to_le_bytes() {
                continue;
            }
            if let Some((name, ip)) = interfaces.iter().find(|(_, a)| a == from.ip()) {
                info!(interface = %name, addr = %ip, "discovered broadcast interface");
                return Ok(*ip);
            }
        }
    }
    bail!("own broadcast never came back")
}

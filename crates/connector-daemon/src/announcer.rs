//! UDP endpoint for master claims.
//!
//! The announcer owns two sockets:
//! - A unicast socket bound to the node's own address and port. Every claim
//!   is sent from it, so peers can reply to the sender address directly.
//! - For multicast and broadcast targets, a cast listener bound to the
//!   wildcard address on the target port with address reuse, so several
//!   nodes on one host can share it.
//!
//! Datagrams from the local unicast address are dropped before they reach
//! the connector.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest datagram we read. Claims are a few hundred bytes.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Empty broadcast target")]
    Empty,
    #[error("Invalid broadcast address: {0}")]
    Address(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    /// A multicast group, joined by the cast listener
    Multicast,
    /// A broadcast address (`*` prefix)
    Broadcast,
    /// Any other address: a relay that forwards claims to the cluster
    Relay,
}

/// Where claims without an explicit recipient go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastTarget {
    pub address: IpAddr,
    /// Defaults to the node's own port
    pub port: Option<u16>,
    pub kind: CastKind,
}

impl BroadcastTarget {
    pub fn socket_addr(&self, local_port: u16) -> SocketAddr {
        SocketAddr::new(self.address, self.port.unwrap_or(local_port))
    }
}

impl FromStr for BroadcastTarget {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (broadcast, rest) = match s.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if rest.is_empty() {
            return Err(TargetError::Empty);
        }

        let (address, port) = if let Ok(addr) = rest.parse::<SocketAddr>() {
            (addr.ip(), Some(addr.port()))
        } else if let Ok(ip) = rest.parse::<IpAddr>() {
            (ip, None)
        } else {
            return Err(TargetError::Address(rest.to_string()));
        };

        let kind = if broadcast {
            CastKind::Broadcast
        } else if address.is_multicast() {
            CastKind::Multicast
        } else {
            CastKind::Relay
        };
        Ok(Self {
            address,
            port,
            kind,
        })
    }
}

impl fmt::Display for BroadcastTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == CastKind::Broadcast {
            write!(f, "*")?;
        }
        match (self.port, self.address) {
            (Some(port), IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, port),
            (Some(port), ip) => write!(f, "{}:{}", ip, port),
            (None, ip) => write!(f, "{}", ip),
        }
    }
}

/// A datagram not sent by this node.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

pub struct Announcer {
    local: SocketAddr,
    cast: SocketAddr,
    socket: Arc<UdpSocket>,
    receivers: Vec<JoinHandle<()>>,
    datagram_tx: mpsc::UnboundedSender<Datagram>,
}

impl Announcer {
    /// Bind to `local` and start delivering inbound datagrams to `datagram_tx`.
    pub fn bind(
        local: SocketAddr,
        target: &BroadcastTarget,
        datagram_tx: mpsc::UnboundedSender<Datagram>,
    ) -> Result<Self> {
        let (socket, cast, receivers) = Self::open(local, target, &datagram_tx)?;
        Ok(Self {
            local,
            cast,
            socket,
            receivers,
            datagram_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn cast_addr(&self) -> SocketAddr {
        self.cast
    }

    /// Send to `target`, or to the broadcast target when `None`.
    pub async fn send(&self, data: &[u8], target: Option<SocketAddr>) -> Result<()> {
        let dest = target.unwrap_or(self.cast);
        self.socket
            .send_to(data, dest)
            .await
            .with_context(|| format!("Failed to send {} bytes to {}", data.len(), dest))?;
        Ok(())
    }

    /// Rebind to a new address and target.
    ///
    /// The new sockets are opened before the old ones are released, so on
    /// error the announcer keeps working on its previous binding.
    pub fn reconfigure(&mut self, local: SocketAddr, target: &BroadcastTarget) -> Result<()> {
        let (socket, cast, receivers) = Self::open(local, target, &self.datagram_tx)?;
        for task in self.receivers.drain(..) {
            task.abort();
        }
        self.local = local;
        self.cast = cast;
        self.socket = socket;
        self.receivers = receivers;
        info!("Announcer rebound to {} (cast {})", local, cast);
        Ok(())
    }

    fn open(
        local: SocketAddr,
        target: &BroadcastTarget,
        datagram_tx: &mpsc::UnboundedSender<Datagram>,
    ) -> Result<(Arc<UdpSocket>, SocketAddr, Vec<JoinHandle<()>>)> {
        let cast = target.socket_addr(local.port());

        let unicast = reusable_socket(local, false)
            .with_context(|| format!("Failed to bind announcer to {}", local))?;
        unicast.set_broadcast(true)?;
        let socket = Arc::new(UdpSocket::from_std(unicast.into())?);
        let mut sockets = vec![socket.clone()];

        if target.kind != CastKind::Relay {
            let listener = cast_listener(local, cast, target.kind)
                .with_context(|| format!("Failed to listen for claims on {}", cast))?;
            sockets.push(Arc::new(listener));
        }

        let receivers = sockets
            .into_iter()
            .map(|s| spawn_receiver(s, local, datagram_tx.clone()))
            .collect();

        debug!("Announcer bound to {} (cast {} {:?})", local, cast, target.kind);
        Ok((socket, cast, receivers))
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        for task in &self.receivers {
            task.abort();
        }
    }
}

/// A non-blocking UDP socket with address reuse, bound to `addr`.
fn reusable_socket(addr: SocketAddr, reuse_port: bool) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        set_reuse_port(&socket)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> std::io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}

fn cast_listener(local: SocketAddr, cast: SocketAddr, kind: CastKind) -> std::io::Result<UdpSocket> {
    let wildcard = match cast.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = reusable_socket(SocketAddr::new(wildcard, cast.port()), true)?;

    if kind == CastKind::Multicast {
        match (cast.ip(), local.ip()) {
            (IpAddr::V4(group), IpAddr::V4(iface)) => socket.join_multicast_v4(&group, &iface)?,
            (IpAddr::V4(group), IpAddr::V6(_)) => {
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?
            }
            (IpAddr::V6(group), _) => socket.join_multicast_v6(&group, 0)?,
        }
    } else {
        socket.set_broadcast(true)?;
    }

    UdpSocket::from_std(socket.into())
}

fn spawn_receiver(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    datagram_tx: mpsc::UnboundedSender<Datagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    if from == local {
                        continue;
                    }
                    let datagram = Datagram {
                        data: buf[..len].to_vec(),
                        from,
                    };
                    if datagram_tx.send(datagram).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    warn!("Announcer receive error on {}: {}", local, e);
                }
            }
        }
    })
}

//! Send/receive UDP beacon datagrams over multicast or broadcast.
//!
//! Requires an OS kernel with IP multicast support.  A beacon is a short
//! datagram carrying one encoded address-advertisement message; receivers
//! also pick up broadcast datagrams on the same port.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use thiserror::Error;

use crate::config::config;

/// Local-network multicast TTL (< 32).
pub const TTL_LOCALNET: u32 = 31;

/// Receive buffer size; beacons are short.
pub const BUFSIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("invalid multicast address {0}")]
    InvalidGroup(String),
    #[error("beacon receive timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The configured multicast group.
pub fn configured_mc_group() -> String {
    config().mc_group
}

fn configured_ttl() -> u32 {
    std::env::var("POSTTROLL_MC_TTL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(TTL_LOCALNET)
}

/// Resolve a group name to an IPv4 address.
fn resolve_group(group: &str) -> Result<Ipv4Addr, BeaconError> {
    if let Ok(addr) = group.parse() {
        return Ok(addr);
    }
    (group, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| {
            addrs.find_map(|a| match a {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
        })
        .ok_or_else(|| BeaconError::InvalidGroup(group.to_owned()))
}

/// `true` when `group` selects plain broadcast rather than a multicast group.
fn is_broadcast_group(group: &str) -> Result<bool, BeaconError> {
    if group.is_empty() {
        return Ok(true);
    }
    let addr = resolve_group(group)?;
    Ok(addr == Ipv4Addr::UNSPECIFIED || addr == Ipv4Addr::BROADCAST)
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Beacon sender toward a multicast group (or broadcast) on a fixed port.
pub struct BeaconSender {
    socket: UdpSocket,
    target: SocketAddrV4,
}

impl BeaconSender {
    /// Set up a sender toward `mcgroup` (configured group when `None`).
    ///
    /// Broadcast groups (`0.0.0.0` / `255.255.255.255`) get `SO_BROADCAST`;
    /// anything else must fall in `224.0.0.0/4`.
    pub fn new(port: u16, mcgroup: Option<&str>) -> Result<Self, BeaconError> {
        let group = match mcgroup {
            Some(g) => g.to_owned(),
            None => configured_mc_group(),
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        let target_ip = if is_broadcast_group(&group)? {
            socket.set_broadcast(true)?;
            Ipv4Addr::BROADCAST
        } else {
            let addr = resolve_group(&group)?;
            if !addr.is_multicast() {
                return Err(BeaconError::InvalidGroup(group));
            }
            socket.set_multicast_ttl_v4(configured_ttl())?;
            if let Some(iface) = config().multicast_interface {
                socket.set_multicast_if_v4(&iface)?;
            }
            addr
        };

        let socket: UdpSocket = socket.into();
        let target = SocketAddrV4::new(target_ip, port);
        tracing::debug!(%target, "beacon sender started");
        Ok(BeaconSender { socket, target })
    }

    /// Send one datagram to the group.
    pub fn send(&self, data: &str) -> io::Result<()> {
        self.socket.send_to(data.as_bytes(), self.target)?;
        Ok(())
    }

    /// The group/port this sender targets.
    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    pub fn close(self) {
        set_close_linger(&self.socket);
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Beacon receiver bound on `0.0.0.0:<port>`, joined to a multicast group
/// unless the group selects broadcast.
pub struct BeaconReceiver {
    socket: UdpSocket,
    group: Option<Ipv4Addr>,
}

impl BeaconReceiver {
    pub fn new(port: u16, mcgroup: Option<&str>) -> Result<Self, BeaconError> {
        let group_name = match mcgroup {
            Some(g) => g.to_owned(),
            None => configured_mc_group(),
        };
        let group = if is_broadcast_group(&group_name)? {
            None
        } else {
            Some(resolve_group(&group_name)?)
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // Allow several receivers on one machine.
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;

        if let Some(group) = group {
            socket.set_multicast_loop_v4(true)?;
            let iface = config().multicast_interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &iface)?;
        }

        tracing::info!(
            group = %group.map_or_else(|| "<broadcast>".to_owned(), |g| g.to_string()),
            port,
            "beacon receiver initialized"
        );
        Ok(BeaconReceiver {
            socket: socket.into(),
            group,
        })
    }

    /// Set the blocking timeout for [`recv`](Self::recv); `None` blocks
    /// forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Receive one datagram as text, with its source address.
    pub fn recv(&self) -> Result<(String, SocketAddr), BeaconError> {
        let mut buf = [0u8; BUFSIZE];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => Ok((String::from_utf8_lossy(&buf[..len]).into_owned(), from)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Err(BeaconError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The joined group, `None` for broadcast reception.
    pub fn group(&self) -> Option<Ipv4Addr> {
        self.group
    }

    pub fn close(&self) {
        set_close_linger(&self.socket);
    }
}

fn set_close_linger(socket: &UdpSocket) {
    let _ = SockRef::from(socket).set_linger(Some(Duration::from_secs(1)));
}

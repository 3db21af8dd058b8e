//! Listener set.
//!
//! Built once at startup. The wildcard address is tried first; when the
//! platform cannot report destination addresses on it, one UDP+TCP pair is
//! bound per permitted interface address instead.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::errors::DnsError;
use crate::interfaces::Interface;
use crate::pktinfo;

const TCP_BACKLOG: i32 = 32;

/// A UDP socket and TCP listener serving one address.
#[derive(Debug)]
pub struct Listener {
    /// Query socket.
    pub udp: UdpSocket,

    /// TCP listening socket.
    pub tcp: TcpListener,

    /// Bound address.
    pub addr: SocketAddr,
}

impl Listener {
    /// Descriptors this listener keeps open.
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.udp.as_raw_fd(), self.tcp.as_raw_fd()]
    }
}

/// Every listener, plus how they were bound.
#[derive(Debug)]
pub struct ListenerSet {
    pub listeners: Vec<Listener>,

    /// Listeners are bound to the wildcard address and need the allow-list.
    pub wildcard: bool,

    /// Wildcard binding was wanted but not possible.
    pub bind_fallback: bool,
}

impl ListenerSet {
    /// Build the listeners.
    ///
    /// # Arguments
    /// * `port` - DNS port.
    /// * `bind_interfaces` - Skip the wildcard attempt.
    /// * `interfaces` - Permitted interfaces, used in bound mode.
    ///
    /// # Returns
    /// The listener set, or the first bind error in bound mode.
    pub fn create(
        port: u16,
        bind_interfaces: bool,
        interfaces: &[Interface],
    ) -> Result<Self, DnsError> {
        Self::create_with(port, bind_interfaces, interfaces, create_wildcard_listener)
    }

    /// [`ListenerSet::create`] with the wildcard attempt supplied by the
    /// caller.
    pub fn create_with<F>(
        port: u16,
        bind_interfaces: bool,
        interfaces: &[Interface],
        wildcard: F,
    ) -> Result<Self, DnsError>
    where
        F: FnOnce(u16) -> io::Result<Listener>,
    {
        if !bind_interfaces {
            match wildcard(port) {
                Ok(listener) => {
                    return Ok(Self {
                        listeners: vec![listener],
                        wildcard: true,
                        bind_fallback: false,
                    })
                }
                Err(e) => debug!("wildcard bind on port {} unavailable: {}", port, e),
            }
        }

        Ok(Self {
            listeners: create_bound_listeners(interfaces)?,
            wildcard: false,
            bind_fallback: !bind_interfaces,
        })
    }
}

fn udp_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    Ok(socket)
}

fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(TCP_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind `0.0.0.0:port` with destination-address reporting.
pub fn create_wildcard_listener(port: u16) -> io::Result<Listener> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = udp_socket(addr)?;
    pktinfo::enable_pktinfo(&socket)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let udp: UdpSocket = socket.into();
    let addr = udp.local_addr()?;
    let tcp = tcp_listener(addr)?;
    Ok(Listener { udp, tcp, addr })
}

/// Bind one pair per interface address.
///
/// IPv6 link-local addresses are skipped since they need a scope.
pub fn create_bound_listeners(interfaces: &[Interface]) -> Result<Vec<Listener>, DnsError> {
    let mut listeners = Vec::with_capacity(interfaces.len());
    for iface in interfaces {
        if let IpAddr::V6(v6) = iface.addr.ip() {
            if v6.segments()[0] & 0xffc0 == 0xfe80 {
                debug!("skipping link-local {} on {}", v6, iface.name);
                continue;
            }
        }
        let bind = |addr: SocketAddr| -> io::Result<Listener> {
            let socket = udp_socket(addr)?;
            socket.bind(&addr.into())?;
            socket.set_nonblocking(true)?;
            let udp: UdpSocket = socket.into();
            let tcp = tcp_listener(udp.local_addr()?)?;
            let addr = udp.local_addr()?;
            Ok(Listener { udp, tcp, addr })
        };
        match bind(iface.addr) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                warn!("failed to bind {} on {}: {}", iface.addr, iface.name, e);
                return Err(DnsError::Io(e));
            }
        }
    }
    Ok(listeners)
}

//! Upstream server pool.
//!
//! The pool is replaced wholesale on every rebuild, never patched, and the
//! affinity hint is an index into the current pool only.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use log::{info, warn};
use metrics::counter;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::NAMESERVER_PORT;
use crate::errors::DnsError;

/// One upstream resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamServer {
    pub addr: SocketAddr,
}

/// Ordered upstream resolvers. Order is the default trial sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPool {
    servers: Vec<UpstreamServer>,
}

impl ServerPool {
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            servers: addrs.into_iter().map(|addr| UpstreamServer { addr }).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&UpstreamServer> {
        self.servers.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpstreamServer> {
        self.servers.iter()
    }

    /// Position of the server with this address.
    pub fn position(&self, addr: SocketAddr) -> Option<usize> {
        self.servers.iter().position(|s| s.addr == addr)
    }

    /// Copy for a TCP worker. Every connection starts unconnected.
    pub fn session_copy(&self) -> SessionPool {
        SessionPool {
            servers: self.servers.iter().map(|s| s.addr).collect(),
            conns: self.servers.iter().map(|_| None).collect(),
        }
    }
}

/// A worker's private view of the pool.
#[derive(Debug, Default)]
pub struct SessionPool {
    pub servers: Vec<SocketAddr>,

    /// Upstream TCP connection per server, opened on demand.
    pub conns: Vec<Option<tokio::net::TcpStream>>,
}

impl SessionPool {
    /// Whether any upstream connection is open.
    pub fn any_connected(&self) -> bool {
        self.conns.iter().any(Option::is_some)
    }
}

/// Parse resolver-list contents.
///
/// Only `nameserver` lines are used; every server gets the standard port.
pub fn parse_resolv(contents: &str) -> Vec<SocketAddr> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.split(['#', ';']).next()?;
            let mut fields = line.split_whitespace();
            if fields.next()? != "nameserver" {
                return None;
            }
            let addr: IpAddr = fields.next()?.parse().ok()?;
            Some(SocketAddr::new(addr, NAMESERVER_PORT))
        })
        .collect()
}

/// Re-read a resolver-list file.
///
/// # Arguments
/// * `path` - The file to read.
/// * `statics` - Configured servers, kept ahead of the file's servers.
/// * `previous` - Returned unchanged when the file cannot be read.
///
/// # Returns
/// A fresh pool.
pub fn reload_servers(path: &Path, statics: &[SocketAddr], previous: &ServerPool) -> ServerPool {
    match fs::read_to_string(path) {
        Ok(contents) => {
            info!("reading {}", path.display());
            counter!("nx9_pool_rebuilds_total", 1);
            ServerPool::new(statics.iter().copied().chain(parse_resolv(&contents)))
        }
        Err(e) => {
            warn!("failed to read {}: {}", path.display(), e);
            previous.clone()
        }
    }
}

/// Drop servers we cannot or must not use.
///
/// # Arguments
/// * `pool` - Candidate servers.
/// * `local` - Our own listening addresses, port included.
/// * `sockets` - Query sockets; a server needs one of its family.
pub fn check_servers(pool: ServerPool, local: &[SocketAddr], sockets: &QuerySockets) -> ServerPool {
    let kept = pool.servers.into_iter().filter(|server| {
        if local.contains(&server.addr) {
            warn!("ignoring nameserver {} - local interface", server.addr.ip());
            return false;
        }
        if sockets.socket_for(server.addr).is_none() {
            warn!("ignoring nameserver {} - no socket of its family", server.addr.ip());
            return false;
        }
        if server.addr.port() == NAMESERVER_PORT {
            info!("using nameserver {}", server.addr.ip());
        } else {
            info!("using nameserver {}#{}", server.addr.ip(), server.addr.port());
        }
        true
    });
    ServerPool {
        servers: kept.collect(),
    }
}

/// Sockets upstream queries are sent from and answers arrive on.
#[derive(Debug)]
pub struct QuerySockets {
    pub v4: UdpSocket,
    pub v6: Option<UdpSocket>,
}

impl QuerySockets {
    /// Bind both families on `port`, zero meaning ephemeral.
    ///
    /// IPv6 is optional: a host without it gets a warning and IPv4 only.
    pub fn bind(port: u16) -> Result<Self, DnsError> {
        let v4 = bind_query_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        let v6 = match bind_query_socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
        {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("no IPv6 query socket: {}", e);
                None
            }
        };
        Ok(Self { v4, v6 })
    }

    pub fn socket_for(&self, server: SocketAddr) -> Option<&UdpSocket> {
        match server {
            SocketAddr::V4(_) => Some(&self.v4),
            SocketAddr::V6(_) => self.v6.as_ref(),
        }
    }

    /// All sockets, IPv4 first.
    pub fn all(&self) -> impl Iterator<Item = &UdpSocket> {
        std::iter::once(&self.v4).chain(self.v6.as_ref())
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.all().map(AsRawFd::as_raw_fd).collect()
    }
}

fn bind_query_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_nameserver_lines_only() {
        let servers = parse_resolv(
            "# generated\nsearch lan\nnameserver 192.0.2.1\nnameserver  2001:db8::53 # v6\n\
             nameserver bogus\noptions ndots:2\n",
        );
        assert_eq!(
            servers,
            vec![
                "192.0.2.1:53".parse().unwrap(),
                "[2001:db8::53]:53".parse().unwrap()
            ]
        );
    }

    #[test]
    fn unreadable_file_keeps_previous_pool() {
        let previous = ServerPool::new(["192.0.2.1:53".parse().unwrap()]);
        let pool = reload_servers(Path::new("/nonexistent/nx9/resolv.conf"), &[], &previous);
        assert_eq!(pool, previous);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 198.51.100.7").unwrap();
        let statics: [SocketAddr; 1] = ["203.0.113.1:5353".parse().unwrap()];
        let pool = reload_servers(file.path(), &statics, &previous);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(0).unwrap().addr, statics[0]);
        assert_eq!(pool.get(1).unwrap().addr, "198.51.100.7:53".parse().unwrap());
    }

    #[test]
    fn check_drops_our_own_addresses() {
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::new([
            "127.0.0.1:53".parse().unwrap(),
            "192.0.2.1:53".parse().unwrap(),
        ]);
        let checked = check_servers(pool, &["127.0.0.1:53".parse().unwrap()], &sockets);
        assert_eq!(checked.len(), 1);
        assert_eq!(checked.position("192.0.2.1:53".parse().unwrap()), Some(0));
    }

    #[test]
    fn session_copy_starts_unconnected() {
        let pool = ServerPool::new(["192.0.2.1:53".parse().unwrap(), "192.0.2.2:53".parse().unwrap()]);
        let copy = pool.session_copy();
        assert_eq!(copy.servers.len(), 2);
        assert!(!copy.any_connected());
    }
}

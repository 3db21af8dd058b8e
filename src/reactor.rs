//! The service reactor.
//!
//! One loop owns every socket, the cache, the server pool and the lease
//! store. Each iteration runs in a fixed order:
//!
//! 1. drain signal flags (terminate > reload > dump > alarm)
//! 2. wait for readiness, signals or worker exits (skipped the first time)
//! 3. read the clock once
//! 4. at most once per second, poll resolver files and the lease file
//! 5. dispatch: upstream replies, DHCP, then each listener's UDP and TCP
//!
//! Dispatch is synchronous, so a reload never lands in the middle of it.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use futures::future::{self, FutureExt};
use log::{debug, error, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::cache::DnsCache;
use crate::config::ServerConfig;
use crate::dhcp::DhcpServer;
use crate::errors::DnsError;
use crate::forward::{send_reply, Forwarder, Origin, SessionContext, Upstream};
use crate::leases::LeaseStore;
use crate::lifecycle::{arm_alarm, log_shutdown, unix_now};
use crate::listeners::ListenerSet;
use crate::pktinfo;
use crate::servers::{check_servers, reload_servers, QuerySockets, ServerPool};
use crate::signals::{drain_pipe, ChildReaper, Drain, SignalFlags, WorkerExit};
use crate::tcp::TcpSupervisor;
use crate::watcher::{Debounce, ResolvWatcher};

/// Everything built during startup that the reactor takes over.
#[derive(Debug)]
pub struct Services {
    pub listeners: ListenerSet,
    pub query_sockets: QuerySockets,
    pub dhcp: Option<(DhcpServer, UdpSocket)>,
    pub leases: Option<LeaseStore>,
    pub cache: DnsCache,
    pub forwarder: Forwarder,
    pub supervisor: TcpSupervisor,

    /// Our own DNS addresses, never accepted as upstream servers.
    pub local_addrs: Vec<SocketAddr>,
}

impl Services {
    /// Descriptors that must survive daemonizing.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self
            .listeners
            .listeners
            .iter()
            .flat_map(|l| l.raw_fds())
            .collect();
        fds.extend(self.query_sockets.raw_fds());
        if let Some((_, socket)) = &self.dhcp {
            fds.push(socket.as_raw_fd());
        }
        fds
    }
}

/// A readable descriptor and what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Upstream(usize),
    Dhcp,
    Udp(usize),
    Tcp(usize),
}

/// Readiness registrations, in dispatch order.
struct Registrations {
    signal: AsyncFd<RawFd>,
    sources: Vec<(Source, AsyncFd<RawFd>)>,
}

enum Wake {
    Signal,
    Exit(Option<WorkerExit>),
    Io,
}

pub struct Reactor {
    config: ServerConfig,
    flags: Arc<SignalFlags>,
    signal_pipe: UnixStream,
    reaper: ChildReaper,
    services: Services,
    pool: ServerPool,

    /// Index into `pool` of the server that answered last.
    affinity: Option<usize>,

    watcher: ResolvWatcher,
    debounce: Debounce,
    buf: Vec<u8>,
}

impl Reactor {
    /// Take over the started services.
    ///
    /// The initial pool holds the configured servers only; resolver files
    /// are read by the first iteration.
    pub fn new(
        config: ServerConfig,
        flags: Arc<SignalFlags>,
        signal_pipe: UnixStream,
        services: Services,
    ) -> Self {
        let pool = check_servers(
            ServerPool::new(config.servers.iter().copied()),
            &services.local_addrs,
            &services.query_sockets,
        );
        let watched = if config.poll_resolv() {
            config.resolv_files.clone()
        } else {
            Vec::new()
        };
        Self {
            buf: vec![0u8; config.edns_packet_max.max(crate::config::PACKETSZ)],
            watcher: ResolvWatcher::new(&watched),
            debounce: Debounce::default(),
            reaper: ChildReaper::new(),
            affinity: None,
            pool,
            config,
            flags,
            signal_pipe,
            services,
        }
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    /// Run until terminated.
    pub async fn run(mut self) -> Result<(), DnsError> {
        let io = self.register()?;
        let mut now = unix_now();
        let mut first = true;

        loop {
            let pending = match self.flags.drain() {
                Drain::Terminate => break,
                Drain::Continue(pending) => pending,
            };
            if pending.reload {
                self.reload(now);
            }
            if pending.dump {
                self.services.cache.dump(now);
            }
            if pending.alarm {
                self.alarm(now);
            }

            if !first {
                self.wait(&io).await;
            }
            first = false;

            now = unix_now();

            if self.debounce.ready(now) {
                self.maintenance(now);
            }

            self.dispatch(&io, now);
        }

        log_shutdown();
        if self.config.lease_dump_interval.is_some() {
            if let Some(leases) = self.services.leases.as_mut() {
                if let Err(e) = leases.persist(true, now) {
                    error!("failed to write lease file: {}", e);
                }
            }
        }
        Ok(())
    }

    fn register(&self) -> io::Result<Registrations> {
        let watch = |fd: RawFd| AsyncFd::with_interest(fd, Interest::READABLE);
        let mut sources = Vec::new();
        for (idx, socket) in self.services.query_sockets.all().enumerate() {
            sources.push((Source::Upstream(idx), watch(socket.as_raw_fd())?));
        }
        if let Some((_, socket)) = &self.services.dhcp {
            sources.push((Source::Dhcp, watch(socket.as_raw_fd())?));
        }
        for (idx, listener) in self.services.listeners.listeners.iter().enumerate() {
            sources.push((Source::Udp(idx), watch(listener.udp.as_raw_fd())?));
            sources.push((Source::Tcp(idx), watch(listener.tcp.as_raw_fd())?));
        }
        Ok(Registrations {
            signal: watch(self.signal_pipe.as_raw_fd())?,
            sources,
        })
    }

    /// Block until a descriptor is readable, a signal arrives or a worker
    /// exits.
    async fn wait(&mut self, io: &Registrations) {
        let any_ready = async {
            if io.sources.is_empty() {
                future::pending::<()>().await;
            }
            let readable = io.sources.iter().map(|(_, fd)| Box::pin(fd.readable()));
            let _ = future::select_all(readable).await;
        };

        let wake = tokio::select! {
            biased;
            ready = io.signal.readable() => {
                if let Ok(mut guard) = ready {
                    guard.clear_ready();
                }
                Wake::Signal
            }
            exit = self.reaper.exited() => Wake::Exit(exit),
            _ = any_ready => Wake::Io,
        };

        match wake {
            Wake::Signal => drain_pipe(&self.signal_pipe),
            Wake::Exit(exit) => {
                let reaped = self.reaper.reap(&self.flags, exit);
                debug!("reaped {} TCP sessions, {} live", reaped, self.flags.live_children());
            }
            Wake::Io => {}
        }
    }

    /// Re-read hosts and leases, and rebuild the pool when not polling.
    fn reload(&mut self, now: u64) {
        self.services.cache.reload(&self.config);
        if let Some(leases) = self.services.leases.as_mut() {
            if self.services.dhcp.is_some() {
                if let Err(e) = leases.persist(false, now) {
                    error!("failed to write lease file: {}", e);
                }
            }
            self.services.cache.set_lease_hosts(leases.hosts());
        }
        if self.config.no_poll && !self.config.no_resolv {
            if let Some(path) = self.config.resolv_files.first() {
                let candidate = reload_servers(path, &self.config.servers, &self.pool);
                self.replace_pool(candidate);
            }
        }
        self.affinity = None;
    }

    fn alarm(&mut self, now: u64) {
        if self.services.dhcp.is_some() {
            if let Some(leases) = self.services.leases.as_mut() {
                if let Err(e) = leases.persist(true, now) {
                    error!("failed to write lease file: {}", e);
                }
            }
        }
        if let Some(interval) = self.config.lease_dump_interval {
            arm_alarm(interval);
        }
    }

    /// Once-per-second work.
    fn maintenance(&mut self, now: u64) {
        if self.services.dhcp.is_none() {
            if let Some(leases) = self.services.leases.as_mut() {
                if leases.reload_if_changed(now) {
                    self.services.cache.set_lease_hosts(leases.hosts());
                }
            }
        }
        if self.config.poll_resolv() {
            if let Some(path) = self.watcher.poll().rebuild {
                let candidate = reload_servers(&path, &self.config.servers, &self.pool);
                self.replace_pool(candidate);
            }
        }
    }

    fn replace_pool(&mut self, candidate: ServerPool) {
        self.pool = check_servers(
            candidate,
            &self.services.local_addrs,
            &self.services.query_sockets,
        );
        self.affinity = None;
    }

    /// Serve every descriptor that is ready now.
    fn dispatch(&mut self, io: &Registrations, now: u64) {
        for (source, fd) in &io.sources {
            let Some(Ok(mut guard)) = fd.readable().now_or_never() else {
                continue;
            };
            match self.handle(*source, now) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("{:?}: {}", source, e);
                    guard.clear_ready();
                }
            }
        }
    }

    fn handle(&mut self, source: Source, now: u64) -> io::Result<()> {
        match source {
            Source::Upstream(idx) => self.upstream_reply(idx, now),
            Source::Dhcp => self.dhcp_packet(now),
            Source::Udp(idx) => self.client_query(idx, now),
            Source::Tcp(idx) => self.tcp_connection(idx),
        }
    }

    fn upstream_reply(&mut self, idx: usize, now: u64) -> io::Result<()> {
        let Some(socket) = self.services.query_sockets.all().nth(idx) else {
            return Ok(());
        };
        let (n, from) = socket.recv_from(&mut self.buf)?;
        let dispatch = self.services.forwarder.reply_query(
            &self.buf[..n],
            from,
            Upstream {
                cache: &mut self.services.cache,
                pool: &self.pool,
                sockets: &self.services.query_sockets,
                affinity: self.affinity,
            },
            now,
        );
        self.affinity = dispatch.affinity;
        if let Some(reply) = dispatch.reply {
            if let Some(listener) = self.services.listeners.listeners.get(reply.origin.listener) {
                if let Err(e) = send_reply(&listener.udp, self.services.listeners.wildcard, &reply) {
                    debug!("reply to {} failed: {}", reply.origin.client, e);
                }
            }
        }
        Ok(())
    }

    fn dhcp_packet(&mut self, now: u64) -> io::Result<()> {
        let Some((server, socket)) = &self.services.dhcp else {
            return Ok(());
        };
        let Some(leases) = self.services.leases.as_mut() else {
            return Ok(());
        };
        let (n, _) = socket.recv_from(&mut self.buf)?;
        let (reply, changed) = server.handle_packet(&self.buf[..n], leases, now);
        if let Some((packet, dest)) = reply {
            if let Err(e) = socket.send_to(&packet, dest) {
                warn!("DHCP reply to {} failed: {}", dest, e);
            }
        }
        if changed {
            if let Err(e) = leases.persist(false, now) {
                error!("failed to write lease file: {}", e);
            }
            self.services.cache.set_lease_hosts(leases.hosts());
        }
        Ok(())
    }

    fn client_query(&mut self, idx: usize, now: u64) -> io::Result<()> {
        let wildcard = self.services.listeners.wildcard;
        let Some(listener) = self.services.listeners.listeners.get(idx) else {
            return Ok(());
        };
        let (n, client, dst) = if wildcard {
            pktinfo::recv_with_pktinfo(&listener.udp, &mut self.buf)?
        } else {
            let (n, client) = listener.udp.recv_from(&mut self.buf)?;
            (n, client, listener.addr.ip())
        };
        let origin = Origin {
            listener: idx,
            client,
            dst: normalise(dst),
        };
        let dispatch = self.services.forwarder.receive_query(
            &self.buf[..n],
            origin,
            Upstream {
                cache: &mut self.services.cache,
                pool: &self.pool,
                sockets: &self.services.query_sockets,
                affinity: self.affinity,
            },
            now,
        );
        self.affinity = dispatch.affinity;
        if let Some(reply) = dispatch.reply {
            if let Err(e) = send_reply(&listener.udp, wildcard, &reply) {
                debug!("reply to {} failed: {}", client, e);
            }
        }
        Ok(())
    }

    fn tcp_connection(&mut self, idx: usize) -> io::Result<()> {
        let Some(listener) = self.services.listeners.listeners.get(idx) else {
            return Ok(());
        };
        let cache = &self.services.cache;
        let pool = &self.pool;
        let affinity = self.affinity;
        let filters = self.services.forwarder.filters();
        let config = &self.config;
        self.services.supervisor.accept(&listener.tcp, &self.flags, &self.reaper, || SessionContext {
            hosts: cache.hosts(),
            pool: pool.session_copy(),
            affinity,
            filters,
            local_ttl: config.local_ttl,
            edns_size: u16::try_from(config.edns_packet_max).unwrap_or(u16::MAX),
        })?;
        Ok(())
    }
}

fn normalise(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("pool", &self.pool)
            .field("affinity", &self.affinity)
            .field("live_children", &self.flags.live_children())
            .finish()
    }
}

//! Query forwarding.
//!
//! UDP queries are answered locally when possible and otherwise relayed to an
//! upstream server under a fresh transaction id. Replies are matched back to
//! the waiting client, filtered, cached and returned through the listener the
//! query arrived on.
//!
//! Everything here is synchronous: the reactor hands over one datagram at a
//! time and gets back what to send to the client, if anything.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use log::{debug, info, warn};
use metrics::counter;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::cache::{CacheKey, DnsCache, HostsTable};
use crate::config::{AddressAlias, ServerConfig};
use crate::dns::{build_a_response, build_error_response, nxdomain_from, read_tcp_message, write_tcp_message};
use crate::errors::DnsError;
use crate::interfaces::AccessList;
use crate::pktinfo;
use crate::servers::{QuerySockets, ServerPool, SessionPool};
use crate::utils::{
    extract_domain, extract_query_type, is_response, opcode, packet_id, rcode, records,
    set_packet_id, HEADER_LEN, RCODE_NOTIMP, RCODE_REFUSED, RCODE_SERVFAIL, TYPE_A,
};

/// Seconds a forwarded query waits for its answer.
pub const FORWARD_TIMEOUT: u64 = 40;

/// Most forwards in flight. When full the oldest is dropped for a new one.
pub const MAX_PENDING: usize = 150;

/// Rewrites applied to every upstream answer.
#[derive(Debug, Clone, Default)]
pub struct AnswerFilters {
    /// A record values that mean the upstream is hiding an NXDOMAIN.
    pub bogus_nxdomain: Vec<Ipv4Addr>,

    pub aliases: Vec<AddressAlias>,
}

impl AnswerFilters {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            bogus_nxdomain: config.bogus_nxdomain.clone(),
            aliases: config.aliases.clone(),
        }
    }

    /// Filter one upstream answer.
    ///
    /// An A record matching the bogus list turns the whole answer into
    /// NXDOMAIN. Otherwise every A record matching an alias is rewritten.
    pub fn apply(&self, mut answer: Vec<u8>) -> Vec<u8> {
        let offsets: Vec<usize> = records(&answer)
            .into_iter()
            .filter(|r| r.rtype == TYPE_A && r.rdlength == 4)
            .map(|r| r.rdata_offset)
            .collect();

        let addr_at = |packet: &[u8], off: usize| {
            Ipv4Addr::new(packet[off], packet[off + 1], packet[off + 2], packet[off + 3])
        };

        if offsets
            .iter()
            .any(|&off| self.bogus_nxdomain.contains(&addr_at(&answer, off)))
        {
            return match nxdomain_from(&answer) {
                Some(nx) => nx,
                None => answer,
            };
        }

        for off in offsets {
            let addr = u32::from(addr_at(&answer, off));
            let rewrite = self.aliases.iter().find_map(|alias| {
                let mask = u32::from(alias.mask);
                (addr & mask == u32::from(alias.from)).then(|| u32::from(alias.to) | (addr & !mask))
            });
            if let Some(rewritten) = rewrite {
                answer[off..off + 4].copy_from_slice(&rewritten.to_be_bytes());
            }
        }
        answer
    }
}

/// Where a query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Index of the listener the query arrived on.
    pub listener: usize,

    pub client: SocketAddr,

    /// Local address the query was sent to.
    pub dst: IpAddr,
}

/// A datagram for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub origin: Origin,
    pub packet: Vec<u8>,
}

/// What one dispatched datagram produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub reply: Option<Reply>,

    /// Affinity hint after handling.
    pub affinity: Option<usize>,
}

/// A query waiting for its upstream answer.
#[derive(Debug, Clone)]
struct Forward {
    origin: Origin,
    orig_id: u16,
    server: SocketAddr,
    tried: usize,
    sent_at: u64,
    key: CacheKey,
    query: Vec<u8>,
}

/// Borrowed state the forwarder works against.
pub struct Upstream<'a> {
    pub cache: &'a mut DnsCache,
    pub pool: &'a ServerPool,
    pub sockets: &'a QuerySockets,
    pub affinity: Option<usize>,
}

#[derive(Debug)]
pub struct Forwarder {
    pending: HashMap<u16, Forward>,
    filters: Arc<AnswerFilters>,
    acl: Option<AccessList>,
    local_ttl: u32,
    edns_size: u16,
    log_queries: bool,
}

impl Forwarder {
    /// Create a forwarder.
    ///
    /// # Arguments
    /// * `config` - TTL, EDNS size, filters and logging.
    /// * `acl` - Allow-list checked against query destinations, for
    ///   wildcard listeners only.
    pub fn new(config: &ServerConfig, acl: Option<AccessList>) -> Self {
        Self {
            pending: HashMap::new(),
            filters: Arc::new(AnswerFilters::from_config(config)),
            acl,
            local_ttl: config.local_ttl,
            edns_size: u16::try_from(config.edns_packet_max).unwrap_or(u16::MAX),
            log_queries: config.log_queries,
        }
    }

    pub fn filters(&self) -> Arc<AnswerFilters> {
        Arc::clone(&self.filters)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Handle a datagram from a client.
    ///
    /// # Returns
    /// The reply to send, if any. The affinity hint is passed through.
    pub fn receive_query(
        &mut self,
        packet: &[u8],
        origin: Origin,
        mut up: Upstream<'_>,
        now: u64,
    ) -> Dispatch {
        let mut dispatch = Dispatch {
            reply: None,
            affinity: up.affinity,
        };
        if packet.len() < HEADER_LEN || is_response(packet) {
            return dispatch;
        }
        if let Some(acl) = &self.acl {
            if !acl.allows(origin.dst) {
                debug!("ignoring query to {} from {}", origin.dst, origin.client);
                return dispatch;
            }
        }
        counter!("nx9_queries_total", 1);

        let reply = |packet: Vec<u8>| Some(Reply { origin, packet });

        if opcode(packet) != 0 {
            dispatch.reply = build_error_response(packet, RCODE_NOTIMP).and_then(reply);
            return dispatch;
        }
        let (Some(name), Some(qtype)) = (extract_domain(packet), extract_query_type(packet)) else {
            return dispatch;
        };
        if self.log_queries {
            info!("query[{}] {} from {}", qtype, name, origin.client.ip());
        }

        if qtype == TYPE_A {
            if let Some(addrs) = up.cache.hosts().lookup(&name) {
                if self.log_queries {
                    info!("config {} is {:?}", name, addrs);
                }
                match build_a_response(packet, addrs, self.local_ttl, self.edns_size) {
                    Ok(resp) => dispatch.reply = reply(resp),
                    Err(e) => debug!("local answer for {} failed: {}", name, e),
                }
                return dispatch;
            }
        }

        let key = CacheKey { name, qtype };
        if let Some(mut cached) = up.cache.get(&key, now) {
            set_packet_id(&mut cached, packet_id(packet).unwrap_or_default());
            dispatch.reply = reply(cached);
            return dispatch;
        }

        if self.forward_query(packet, origin, key, &up, now).is_none() {
            dispatch.reply = build_error_response(packet, RCODE_SERVFAIL).and_then(reply);
        }
        dispatch
    }

    /// Relay a query upstream.
    ///
    /// # Returns
    /// `Some(())` when the query is now pending.
    fn forward_query(
        &mut self,
        packet: &[u8],
        origin: Origin,
        key: CacheKey,
        up: &Upstream<'_>,
        now: u64,
    ) -> Option<()> {
        self.expire(now);
        if up.pool.is_empty() {
            warn!("no servers to forward {} to", key.name);
            return None;
        }
        let orig_id = packet_id(packet)?;

        // A retransmission from the client moves on to the next server.
        let retry = self
            .pending
            .iter()
            .find(|(_, f)| f.origin.client == origin.client && f.orig_id == orig_id)
            .map(|(id, f)| (*id, next_server(up.pool, f.server)));
        if let Some((id, next)) = retry {
            let forward = self.pending.get_mut(&id)?;
            let server = up.pool.get(next)?.addr;
            forward.server = server;
            forward.tried += 1;
            forward.sent_at = now;
            let query = forward.query.clone();
            return send_upstream(up.sockets, &query, server).ok();
        }

        let start = up.affinity.filter(|&i| i < up.pool.len()).unwrap_or(0);
        let mut query = packet.to_vec();
        if self.pending.len() >= MAX_PENDING {
            self.evict_oldest();
        }
        let id = self.fresh_id()?;
        set_packet_id(&mut query, id);

        for tried in 1..=up.pool.len() {
            let server = up.pool.get((start + tried - 1) % up.pool.len())?.addr;
            match send_upstream(up.sockets, &query, server) {
                Ok(()) => {
                    counter!("nx9_forwarded_total", 1);
                    if self.log_queries {
                        info!("forwarded {} to {}", key.name, server.ip());
                    }
                    self.pending.insert(
                        id,
                        Forward {
                            origin,
                            orig_id,
                            server,
                            tried,
                            sent_at: now,
                            key,
                            query,
                        },
                    );
                    return Some(());
                }
                Err(e) => debug!("send to {} failed: {}", server, e),
            }
        }
        None
    }

    /// Handle a datagram from an upstream server.
    ///
    /// # Returns
    /// The reply for the waiting client and the server that answered as the
    /// new affinity hint.
    pub fn reply_query(
        &mut self,
        packet: &[u8],
        from: SocketAddr,
        mut up: Upstream<'_>,
        now: u64,
    ) -> Dispatch {
        let mut dispatch = Dispatch {
            reply: None,
            affinity: up.affinity,
        };
        if packet.len() < HEADER_LEN || !is_response(packet) {
            return dispatch;
        }
        let Some(id) = packet_id(packet) else {
            return dispatch;
        };
        match self.pending.get(&id) {
            Some(forward) if forward.server == from => {}
            _ => {
                debug!("unexpected reply {} from {}", id, from);
                return dispatch;
            }
        }

        if matches!(rcode(packet), RCODE_SERVFAIL | RCODE_REFUSED) {
            if let Some(forward) = self.pending.get_mut(&id) {
                if forward.tried < up.pool.len() {
                    let server = match up.pool.get(next_server(up.pool, forward.server)) {
                        Some(server) => server.addr,
                        None => return dispatch,
                    };
                    forward.server = server;
                    forward.tried += 1;
                    forward.sent_at = now;
                    if let Err(e) = send_upstream(up.sockets, &forward.query, server) {
                        debug!("failover to {} failed: {}", server, e);
                    }
                    return dispatch;
                }
            }
        }

        let Some(forward) = self.pending.remove(&id) else {
            return dispatch;
        };
        let mut answer = self.filters.apply(packet.to_vec());
        if self.log_queries {
            info!("reply {} from {}", forward.key.name, from.ip());
        }
        up.cache.insert(forward.key, &answer, now);
        set_packet_id(&mut answer, forward.orig_id);

        dispatch.affinity = up.pool.position(from);
        dispatch.reply = Some(Reply {
            origin: forward.origin,
            packet: answer,
        });
        dispatch
    }

    /// An id no pending forward uses, or `None` when all are taken.
    fn fresh_id(&self) -> Option<u16> {
        let start = fastrand::u16(..);
        (0..=u16::MAX)
            .map(|step| start.wrapping_add(step))
            .find(|id| !self.pending.contains_key(id))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, f)| f.sent_at)
            .map(|(id, _)| *id);
        if let Some(forward) = oldest.and_then(|id| self.pending.remove(&id)) {
            debug!("forward table full, dropping query for {}", forward.key.name);
        }
    }

    fn expire(&mut self, now: u64) {
        self.pending.retain(|_, f| f.sent_at + FORWARD_TIMEOUT > now);
    }
}

fn next_server(pool: &ServerPool, current: SocketAddr) -> usize {
    match pool.position(current) {
        Some(i) => (i + 1) % pool.len(),
        None => 0,
    }
}

fn send_upstream(sockets: &QuerySockets, query: &[u8], server: SocketAddr) -> io::Result<()> {
    let socket = sockets
        .socket_for(server)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no socket for family"))?;
    socket.send_to(query, server).map(|_| ())
}

/// Send a reply out of the listener it belongs to.
///
/// Wildcard listeners answer from the address the query was sent to.
pub fn send_reply(socket: &UdpSocket, wildcard: bool, reply: &Reply) -> io::Result<()> {
    if wildcard {
        pktinfo::send_from(socket, &reply.packet, reply.origin.client, reply.origin.dst)
    } else {
        socket.send_to(&reply.packet, reply.origin.client).map(|_| ())
    }
}

/// Everything a TCP worker gets. Nothing else of the reactor is reachable.
#[derive(Debug)]
pub struct SessionContext {
    pub hosts: Arc<HostsTable>,
    pub pool: SessionPool,
    pub affinity: Option<usize>,
    pub filters: Arc<AnswerFilters>,
    pub local_ttl: u32,
    pub edns_size: u16,
}

/// Serve one length-prefixed exchange.
///
/// Local names are answered directly. Otherwise the query is relayed over
/// TCP starting at the affinity server, moving on when a server fails or
/// answers SERVFAIL/REFUSED.
///
/// # Arguments
/// * `ctx` - The worker's private state.
/// * `stream` - The accepted client connection.
pub async fn tcp_request<S>(mut ctx: SessionContext, stream: &mut S) -> Result<(), DnsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let query = read_tcp_message(stream).await?;
    if query.len() < HEADER_LEN || is_response(&query) {
        return Err(DnsError::Protocol("short or misdirected TCP query".into()));
    }
    if opcode(&query) != 0 {
        if let Some(resp) = build_error_response(&query, RCODE_NOTIMP) {
            write_tcp_message(stream, &resp).await?;
        }
        return Ok(());
    }

    if extract_query_type(&query) == Some(TYPE_A) {
        if let Some(addrs) = extract_domain(&query).and_then(|n| ctx.hosts.lookup(&n)) {
            let resp = build_a_response(&query, addrs, ctx.local_ttl, ctx.edns_size)?;
            write_tcp_message(stream, &resp).await?;
            return Ok(());
        }
    }

    let count = ctx.pool.servers.len();
    let start = ctx.affinity.filter(|&i| i < count).unwrap_or(0);
    for step in 0..count {
        let idx = (start + step) % count;
        match exchange(&mut ctx.pool, idx, &query).await {
            Ok(answer) if !matches!(rcode(&answer), RCODE_SERVFAIL | RCODE_REFUSED) => {
                let answer = ctx.filters.apply(answer);
                write_tcp_message(stream, &answer).await?;
                return Ok(());
            }
            Ok(_) => debug!("{} refused TCP query", ctx.pool.servers[idx]),
            Err(e) => {
                debug!("TCP to {} failed: {}", ctx.pool.servers[idx], e);
                ctx.pool.conns[idx] = None;
            }
        }
    }

    if let Some(resp) = build_error_response(&query, RCODE_SERVFAIL) {
        write_tcp_message(stream, &resp).await?;
    }
    Ok(())
}

async fn exchange(pool: &mut SessionPool, idx: usize, query: &[u8]) -> io::Result<Vec<u8>> {
    if pool.conns[idx].is_none() {
        pool.conns[idx] = Some(TcpStream::connect(pool.servers[idx]).await?);
    }
    let conn = pool.conns[idx]
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
    write_tcp_message(conn, query).await?;
    read_tcp_message(conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::{answer, query};
    use crate::utils::RCODE_NXDOMAIN;

    fn filters() -> AnswerFilters {
        AnswerFilters {
            bogus_nxdomain: vec![Ipv4Addr::new(198, 51, 100, 1)],
            aliases: vec![AddressAlias {
                from: Ipv4Addr::new(1, 2, 3, 0),
                to: Ipv4Addr::new(10, 0, 0, 0),
                mask: Ipv4Addr::new(255, 255, 255, 0),
            }],
        }
    }

    fn upstream_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn origin() -> Origin {
        Origin {
            listener: 0,
            client: "127.0.0.1:40000".parse().unwrap(),
            dst: "127.0.0.1".parse().unwrap(),
        }
    }

    fn recv(socket: &UdpSocket) -> Vec<u8> {
        socket
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 512];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn bogus_answer_becomes_nxdomain() {
        let q = query(1, "ads.example", TYPE_A);
        let a = filters().apply(answer(&q, 0, &[[198, 51, 100, 1]], 300));
        assert_eq!(rcode(&a), RCODE_NXDOMAIN);
        assert!(records(&a).is_empty());
    }

    #[test]
    fn alias_rewrites_masked_prefix() {
        let q = query(1, "host.example", TYPE_A);
        let a = filters().apply(answer(&q, 0, &[[1, 2, 3, 77], [1, 2, 4, 5]], 300));
        let spans = records(&a);
        assert_eq!(&a[spans[0].rdata_offset..spans[0].rdata_offset + 4], &[10, 0, 0, 77]);
        assert_eq!(&a[spans[1].rdata_offset..spans[1].rdata_offset + 4], &[1, 2, 4, 5]);
    }

    #[test]
    fn notimp_for_other_opcodes() {
        let mut fwd = Forwarder::new(&ServerConfig::default(), None);
        let mut cache = DnsCache::new(10, false);
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::default();
        let mut q = query(5, "example.com", TYPE_A);
        q[2] |= 0x10; // opcode 2, STATUS

        let out = fwd.receive_query(
            &q,
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            0,
        );
        assert_eq!(rcode(&out.reply.unwrap().packet), RCODE_NOTIMP);
    }

    #[test]
    fn no_servers_is_servfail() {
        let mut fwd = Forwarder::new(&ServerConfig::default(), None);
        let mut cache = DnsCache::new(10, false);
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::default();
        let out = fwd.receive_query(
            &query(5, "example.com", TYPE_A),
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            0,
        );
        assert_eq!(rcode(&out.reply.unwrap().packet), RCODE_SERVFAIL);
        assert_eq!(fwd.pending(), 0);
    }

    #[test]
    fn forwards_then_replies_and_sets_affinity() {
        let (upstream, addr) = upstream_socket();
        let mut fwd = Forwarder::new(&ServerConfig::default(), None);
        let mut cache = DnsCache::new(10, false);
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::new([addr]);
        let q = query(77, "example.com", TYPE_A);

        let out = fwd.receive_query(
            &q,
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            100,
        );
        assert!(out.reply.is_none());
        assert_eq!(fwd.pending(), 1);

        let relayed = recv(&upstream);
        let resp = answer(&relayed, 0, &[[93, 184, 216, 34]], 300);
        let out = fwd.reply_query(
            &resp,
            addr,
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            101,
        );
        let reply = out.reply.unwrap();
        assert_eq!(packet_id(&reply.packet), Some(77));
        assert_eq!(out.affinity, Some(0));
        assert_eq!(fwd.pending(), 0);

        // Second query is a cache hit with its own id.
        let out = fwd.receive_query(
            &query(78, "example.com", TYPE_A),
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: Some(0) },
            102,
        );
        assert_eq!(packet_id(&out.reply.unwrap().packet), Some(78));
    }

    fn stale_forward(id: u16, sent_at: u64, server: SocketAddr) -> Forward {
        Forward {
            origin: origin(),
            orig_id: id,
            server,
            tried: 1,
            sent_at,
            key: CacheKey {
                name: format!("host{id}.example"),
                qtype: TYPE_A,
            },
            query: query(id, "stale.example", TYPE_A),
        }
    }

    #[test]
    fn full_table_drops_oldest_and_still_forwards() {
        let (upstream, addr) = upstream_socket();
        let mut fwd = Forwarder::new(&ServerConfig::default(), None);
        let mut cache = DnsCache::new(10, false);
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::new([addr]);
        for i in 0..MAX_PENDING as u16 {
            fwd.pending.insert(i, stale_forward(i, 100 + u64::from(i), addr));
        }

        let out = fwd.receive_query(
            &query(4242, "fresh.example", TYPE_A),
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            120,
        );
        assert!(out.reply.is_none());
        assert_eq!(fwd.pending(), MAX_PENDING);
        assert!(!fwd.pending.values().any(|f| f.sent_at == 100));
        assert!(fwd.pending.values().any(|f| f.orig_id == 4242));
        assert_eq!(extract_domain(&recv(&upstream)).as_deref(), Some("fresh.example"));
    }

    #[test]
    fn exhausted_id_space_yields_no_id() {
        let mut fwd = Forwarder::new(&ServerConfig::default(), None);
        let server = "192.0.2.1:53".parse().unwrap();
        for id in 0..=u16::MAX {
            fwd.pending.insert(id, stale_forward(id, 0, server));
        }
        assert_eq!(fwd.fresh_id(), None);
        fwd.pending.remove(&7);
        assert_eq!(fwd.fresh_id(), Some(7));
    }

    #[test]
    fn servfail_fails_over_to_next_server() {
        let (first, first_addr) = upstream_socket();
        let (second, second_addr) = upstream_socket();
        let mut fwd = Forwarder::new(&ServerConfig::default(), None);
        let mut cache = DnsCache::new(10, false);
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::new([first_addr, second_addr]);

        fwd.receive_query(
            &query(9, "example.com", TYPE_A),
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            0,
        );
        let relayed = recv(&first);
        let out = fwd.reply_query(
            &answer(&relayed, RCODE_SERVFAIL, &[], 0),
            first_addr,
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            0,
        );
        assert!(out.reply.is_none());

        let retried = recv(&second);
        assert_eq!(packet_id(&retried), packet_id(&relayed));
        let out = fwd.reply_query(
            &answer(&retried, 0, &[[1, 1, 1, 1]], 60),
            second_addr,
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            0,
        );
        assert_eq!(out.affinity, Some(1));
        assert!(out.reply.is_some());
    }

    #[test]
    fn wildcard_acl_drops_denied_destination() {
        let config = ServerConfig {
            interfaces: vec!["eth0".into()],
            ..ServerConfig::default()
        };
        let system = vec![("eth0".to_string(), "192.168.1.1".parse().unwrap(), false)];
        let mut fwd = Forwarder::new(&config, Some(AccessList::new(&config, &system)));
        let mut cache = DnsCache::new(10, false);
        let sockets = QuerySockets::bind(0).unwrap();
        let pool = ServerPool::default();
        let out = fwd.receive_query(
            &query(5, "example.com", TYPE_A),
            origin(),
            Upstream { cache: &mut cache, pool: &pool, sockets: &sockets, affinity: None },
            0,
        );
        assert!(out.reply.is_none());
    }

    #[tokio::test]
    async fn tcp_request_answers_from_hosts() {
        let mut hosts = HostsTable::default();
        hosts.insert("router.lan", Ipv4Addr::new(192, 168, 0, 1), None);
        let ctx = SessionContext {
            hosts: Arc::new(hosts),
            pool: ServerPool::default().session_copy(),
            affinity: None,
            filters: Arc::new(AnswerFilters::default()),
            local_ttl: 0,
            edns_size: 1280,
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_tcp_message(&mut client, &query(4, "router.lan", TYPE_A))
            .await
            .unwrap();
        tcp_request(ctx, &mut server).await.unwrap();
        let resp = read_tcp_message(&mut client).await.unwrap();
        assert_eq!(packet_id(&resp), Some(4));
        assert_eq!(records(&resp).len(), 1);
    }

    #[tokio::test]
    async fn tcp_request_without_servers_is_servfail() {
        let ctx = SessionContext {
            hosts: Arc::new(HostsTable::default()),
            pool: ServerPool::default().session_copy(),
            affinity: Some(3),
            filters: Arc::new(AnswerFilters::default()),
            local_ttl: 0,
            edns_size: 1280,
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_tcp_message(&mut client, &query(4, "example.com", TYPE_A))
            .await
            .unwrap();
        tcp_request(ctx, &mut server).await.unwrap();
        let resp = read_tcp_message(&mut client).await.unwrap();
        assert_eq!(rcode(&resp), RCODE_SERVFAIL);
    }
}

//! DHCP server.
//!
//! Handles DISCOVER, REQUEST and RELEASE for the configured address ranges.
//! Replies go out by broadcast, or back to the relay when one forwarded the
//! request.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::DhcpRange;
use crate::errors::DnsError;
use crate::leases::{format_mac, LeaseStore, Mac};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const FIXED_LEN: usize = 236;

const OPT_PAD: u8 = 0;
const OPT_NETMASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_HOSTNAME: u8 = 12;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

/// Subnet mask assumed for every range.
const RANGE_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// The parts of a BOOTP/DHCP message we use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: Mac,
    pub options: HashMap<u8, Vec<u8>>,
}

impl DhcpPacket {
    /// Parse a message.
    pub fn parse(buf: &[u8]) -> Result<Self, DnsError> {
        if buf.len() < FIXED_LEN + MAGIC_COOKIE.len() {
            return Err(DnsError::Protocol("short DHCP packet".into()));
        }
        if buf[FIXED_LEN..FIXED_LEN + 4] != MAGIC_COOKIE {
            return Err(DnsError::Protocol("missing DHCP magic cookie".into()));
        }
        let addr = |off: usize| Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3]);
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&buf[28..34]);

        let mut options = HashMap::new();
        let mut pos = FIXED_LEN + 4;
        while pos < buf.len() {
            match buf[pos] {
                OPT_PAD => pos += 1,
                OPT_END => break,
                code => {
                    let len = *buf
                        .get(pos + 1)
                        .ok_or_else(|| DnsError::Protocol("truncated DHCP option".into()))?
                        as usize;
                    let value = buf
                        .get(pos + 2..pos + 2 + len)
                        .ok_or_else(|| DnsError::Protocol("truncated DHCP option".into()))?;
                    options.insert(code, value.to_vec());
                    pos += 2 + len;
                }
            }
        }

        Ok(Self {
            op: buf[0],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: addr(12),
            giaddr: addr(24),
            chaddr,
            options,
        })
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options
            .get(&OPT_MESSAGE_TYPE)
            .and_then(|v| v.first())
            .and_then(|&t| MessageType::from_u8(t))
    }

    fn option_addr(&self, code: u8) -> Option<Ipv4Addr> {
        let v = self.options.get(&code)?;
        (v.len() == 4).then(|| Ipv4Addr::new(v[0], v[1], v[2], v[3]))
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option_addr(OPT_REQUESTED_IP)
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.option_addr(OPT_SERVER_ID)
    }

    /// Client hostname, first label only, lowercased.
    pub fn hostname(&self) -> Option<String> {
        let raw = self.options.get(&OPT_HOSTNAME)?;
        let name = String::from_utf8_lossy(raw);
        let label = name.split('.').next()?.trim_end_matches('\0').to_ascii_lowercase();
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        valid.then_some(label)
    }
}

/// Bind the DHCP socket on `0.0.0.0:port` with broadcast enabled.
pub fn bind_socket(port: u16) -> Result<UdpSocket, DnsError> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// A served range and our address on its subnet.
#[derive(Debug, Clone)]
struct Scope {
    range: DhcpRange,
    server: Ipv4Addr,
}

impl Scope {
    fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(self.range.start)..=u32::from(self.range.end)).contains(&u32::from(addr))
    }

    fn in_subnet(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(RANGE_NETMASK);
        u32::from(addr) & mask == u32::from(self.server) & mask
    }
}

#[derive(Debug)]
pub struct DhcpServer {
    scopes: Vec<Scope>,
}

impl DhcpServer {
    /// Match each range to a local address on its subnet.
    ///
    /// # Arguments
    /// * `ranges` - Configured ranges.
    /// * `local` - IPv4 addresses of our interfaces.
    ///
    /// # Returns
    /// The server, or an error when a range is on no local subnet.
    pub fn new(ranges: &[DhcpRange], local: &[Ipv4Addr]) -> Result<Self, DnsError> {
        let mask = u32::from(RANGE_NETMASK);
        let scopes = ranges
            .iter()
            .map(|range| {
                local
                    .iter()
                    .find(|a| u32::from(**a) & mask == u32::from(range.start) & mask)
                    .map(|&server| Scope {
                        range: range.clone(),
                        server,
                    })
                    .ok_or_else(|| {
                        DnsError::Config(format!(
                            "no interface on the subnet of DHCP range {} -- {}",
                            range.start, range.end
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { scopes })
    }

    /// Handle one request.
    ///
    /// # Returns
    /// The reply and where to send it, and whether the leases changed.
    pub fn handle_packet(
        &self,
        buf: &[u8],
        leases: &mut LeaseStore,
        now: u64,
    ) -> (Option<(Vec<u8>, SocketAddr)>, bool) {
        let packet = match DhcpPacket::parse(buf) {
            Ok(p) if p.op == BOOTREQUEST => p,
            Ok(_) => return (None, false),
            Err(e) => {
                debug!("ignoring DHCP packet: {}", e);
                return (None, false);
            }
        };
        let Some(kind) = packet.message_type() else {
            return (None, false);
        };
        let mac = packet.chaddr;
        let Some(scope) = self.scope_for(&packet) else {
            warn!("DHCP packet from {} on no served subnet", format_mac(&mac));
            return (None, false);
        };

        match kind {
            MessageType::Discover => {
                let Some(addr) = self.pick_address(scope, &packet, leases, now) else {
                    warn!("DHCPDISCOVER({}) no address available", format_mac(&mac));
                    return (None, false);
                };
                info!("DHCPOFFER {} {}", addr, format_mac(&mac));
                (Some(self.reply(&packet, scope, MessageType::Offer, addr)), false)
            }
            MessageType::Request => {
                if packet.server_id().is_some_and(|id| id != scope.server) {
                    // The client picked another server's offer.
                    return (None, false);
                }
                let requested = packet.requested_ip().unwrap_or(packet.ciaddr);
                let owner_ok = leases.by_addr(requested, now).map_or(true, |l| l.mac == mac);
                if !scope.contains(requested) || !owner_ok {
                    info!("DHCPNAK {} {}", requested, format_mac(&mac));
                    let nak = self.reply(&packet, scope, MessageType::Nak, Ipv4Addr::UNSPECIFIED);
                    return (Some(nak), false);
                }
                let expires = match scope.range.lease_time {
                    0 => 0,
                    secs => now + u64::from(secs),
                };
                if !leases.upsert(mac, requested, packet.hostname(), expires, now) {
                    warn!("DHCPREQUEST({}) lease table full", format_mac(&mac));
                    return (None, false);
                }
                info!("DHCPACK {} {}", requested, format_mac(&mac));
                (Some(self.reply(&packet, scope, MessageType::Ack, requested)), true)
            }
            MessageType::Release | MessageType::Decline => {
                let released = leases.release(&mac).is_some();
                if released {
                    info!("DHCPRELEASE {}", format_mac(&mac));
                }
                (None, released)
            }
            _ => (None, false),
        }
    }

    fn scope_for(&self, packet: &DhcpPacket) -> Option<&Scope> {
        if !packet.giaddr.is_unspecified() {
            return self.scopes.iter().find(|s| s.in_subnet(packet.giaddr));
        }
        self.scopes.first()
    }

    /// Existing lease, then the requested address, then the first free one.
    fn pick_address(
        &self,
        scope: &Scope,
        packet: &DhcpPacket,
        leases: &LeaseStore,
        now: u64,
    ) -> Option<Ipv4Addr> {
        if let Some(lease) = leases.by_mac(&packet.chaddr, now) {
            if scope.contains(lease.addr) {
                return Some(lease.addr);
            }
        }
        let free = |addr: Ipv4Addr| scope.contains(addr) && leases.by_addr(addr, now).is_none();
        if let Some(addr) = packet.requested_ip().filter(|a| free(*a)) {
            return Some(addr);
        }
        if leases.len() >= leases.max_leases() {
            return None;
        }
        (u32::from(scope.range.start)..=u32::from(scope.range.end))
            .map(Ipv4Addr::from)
            .find(|a| free(*a) && *a != scope.server)
    }

    fn reply(
        &self,
        request: &DhcpPacket,
        scope: &Scope,
        kind: MessageType,
        yiaddr: Ipv4Addr,
    ) -> (Vec<u8>, SocketAddr) {
        let mut out = vec![0u8; FIXED_LEN];
        out[0] = BOOTREPLY;
        out[1] = 1; // ethernet
        out[2] = 6;
        out[4..8].copy_from_slice(&request.xid.to_be_bytes());
        out[10..12].copy_from_slice(&request.flags.to_be_bytes());
        out[16..20].copy_from_slice(&yiaddr.octets());
        out[20..24].copy_from_slice(&scope.server.octets());
        out[24..28].copy_from_slice(&request.giaddr.octets());
        out[28..34].copy_from_slice(&request.chaddr);
        out.extend_from_slice(&MAGIC_COOKIE);

        let mut option = |code: u8, value: &[u8]| {
            out.push(code);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        };
        option(OPT_MESSAGE_TYPE, &[kind as u8]);
        option(OPT_SERVER_ID, &scope.server.octets());
        if kind != MessageType::Nak {
            let lease_time = match scope.range.lease_time {
                0 => u32::MAX,
                secs => secs,
            };
            option(OPT_LEASE_TIME, &lease_time.to_be_bytes());
            option(OPT_NETMASK, &RANGE_NETMASK.octets());
            option(OPT_ROUTER, &scope.server.octets());
            option(OPT_DNS, &scope.server.octets());
        }
        out.push(OPT_END);

        let dest = if request.giaddr.is_unspecified() {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT))
        } else {
            SocketAddr::V4(SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT))
        };
        (out, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: Mac = [0x02, 0, 0, 0, 0, 0x01];

    fn server() -> DhcpServer {
        DhcpServer::new(
            &[DhcpRange {
                start: Ipv4Addr::new(192, 168, 0, 50),
                end: Ipv4Addr::new(192, 168, 0, 52),
                lease_time: 3600,
            }],
            &[Ipv4Addr::new(192, 168, 0, 1)],
        )
        .unwrap()
    }

    fn request(kind: MessageType, mac: Mac, extra: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut buf = vec![0u8; FIXED_LEN];
        buf[0] = BOOTREQUEST;
        buf[4..8].copy_from_slice(&0xdead_beef_u32.to_be_bytes());
        buf[28..34].copy_from_slice(&mac);
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, kind as u8]);
        for (code, value) in extra {
            buf.push(*code);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        }
        buf.push(OPT_END);
        buf
    }

    fn reply_type(reply: &[u8]) -> Option<MessageType> {
        let mut with_op = reply.to_vec();
        with_op[0] = BOOTREQUEST;
        DhcpPacket::parse(&with_op).unwrap().message_type()
    }

    fn yiaddr(reply: &[u8]) -> Ipv4Addr {
        Ipv4Addr::new(reply[16], reply[17], reply[18], reply[19])
    }

    #[test]
    fn range_needs_a_local_subnet() {
        let err = DhcpServer::new(
            &[DhcpRange {
                start: Ipv4Addr::new(10, 9, 9, 1),
                end: Ipv4Addr::new(10, 9, 9, 9),
                lease_time: 0,
            }],
            &[Ipv4Addr::new(192, 168, 0, 1)],
        )
        .unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[test]
    fn discover_request_release() {
        let dhcp = server();
        let mut leases = LeaseStore::init(None, Some("lan"), 0, 10).unwrap();

        let (offer, changed) = dhcp.handle_packet(&request(MessageType::Discover, MAC, &[]), &mut leases, 100);
        let (offer, dest) = offer.unwrap();
        assert!(!changed);
        assert_eq!(reply_type(&offer), Some(MessageType::Offer));
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(192, 168, 0, 50));
        assert_eq!(dest, "255.255.255.255:68".parse().unwrap());

        let req = request(
            MessageType::Request,
            MAC,
            &[
                (OPT_REQUESTED_IP, vec![192, 168, 0, 50]),
                (OPT_SERVER_ID, vec![192, 168, 0, 1]),
                (OPT_HOSTNAME, b"Laptop".to_vec()),
            ],
        );
        let (ack, changed) = dhcp.handle_packet(&req, &mut leases, 100);
        assert!(changed);
        assert_eq!(reply_type(&ack.unwrap().0), Some(MessageType::Ack));
        let lease = leases.by_mac(&MAC, 100).unwrap();
        assert_eq!(lease.expires, 3700);
        assert_eq!(leases.hosts()[0].0, "laptop.lan");

        let (_, changed) = dhcp.handle_packet(&request(MessageType::Release, MAC, &[]), &mut leases, 200);
        assert!(changed);
        assert!(leases.is_empty());
    }

    #[test]
    fn request_for_taken_address_is_naked() {
        let dhcp = server();
        let mut leases = LeaseStore::init(None, None, 0, 10).unwrap();
        leases.upsert([9; 6], Ipv4Addr::new(192, 168, 0, 50), None, 0, 0);

        let req = request(MessageType::Request, MAC, &[(OPT_REQUESTED_IP, vec![192, 168, 0, 50])]);
        let (nak, changed) = dhcp.handle_packet(&req, &mut leases, 0);
        assert!(!changed);
        let (nak, _) = nak.unwrap();
        assert_eq!(reply_type(&nak), Some(MessageType::Nak));
        assert_eq!(yiaddr(&nak), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn exhausted_range_gets_no_offer() {
        let dhcp = server();
        let mut leases = LeaseStore::init(None, None, 0, 10).unwrap();
        for (i, last) in (50..=52).enumerate() {
            leases.upsert([i as u8; 6], Ipv4Addr::new(192, 168, 0, last), None, 0, 0);
        }
        let (offer, _) = dhcp.handle_packet(&request(MessageType::Discover, MAC, &[]), &mut leases, 0);
        assert!(offer.is_none());
    }

    #[test]
    fn hostname_is_sanitised() {
        let mut packet = DhcpPacket::parse(&request(MessageType::Request, MAC, &[])).unwrap();
        packet.options.insert(OPT_HOSTNAME, b"My-PC.home\0".to_vec());
        assert_eq!(packet.hostname().as_deref(), Some("my-pc"));
        packet.options.insert(OPT_HOSTNAME, b"bad name".to_vec());
        assert_eq!(packet.hostname(), None);
    }
}

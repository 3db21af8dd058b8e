//! End-to-end tests driving a reactor over loopback sockets.

use std::fs;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use nx9_gateway_dns::{
    cache::DnsCache,
    config::ServerConfig,
    forward::Forwarder,
    interfaces::Interface,
    leases::LeaseStore,
    listeners::ListenerSet,
    reactor::{Reactor, Services},
    servers::QuerySockets,
    signals::SignalFlags,
    tcp::TcpSupervisor,
    utils::encode_dns_name,
};

const WAIT: Duration = Duration::from_secs(5);

fn query(id: u16, name: &str) -> Vec<u8> {
    let mut q = Vec::new();
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    q.extend_from_slice(&encode_dns_name(name));
    q.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    q
}

fn answer(query: &[u8], addr: [u8; 4]) -> Vec<u8> {
    let mut r = query.to_vec();
    r[2] |= 0x80;
    r[3] = 0x80;
    r[6..8].copy_from_slice(&1u16.to_be_bytes());
    r.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2c, 0x00, 0x04]);
    r.extend_from_slice(&addr);
    r
}

fn services(config: &ServerConfig, leases: Option<LeaseStore>) -> Services {
    let lo = Interface {
        name: "lo".into(),
        addr: "127.0.0.1:0".parse().unwrap(),
        is_loopback: true,
    };
    let listeners = ListenerSet::create(0, true, &[lo]).unwrap();
    Services {
        local_addrs: vec![listeners.listeners[0].addr],
        listeners,
        query_sockets: QuerySockets::bind(0).unwrap(),
        dhcp: None,
        leases,
        cache: DnsCache::new(config.cache_size, false),
        forwarder: Forwarder::new(config, None),
        supervisor: TcpSupervisor::new(4, WAIT, None),
    }
}

fn base_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        no_resolv: true,
        no_hosts: true,
        resolv_files: Vec::new(),
        foreground: true,
        pid_file: None,
        user: None,
        ..ServerConfig::default()
    }
}

/// Wake the reactor with a terminate request.
fn terminate(flags: &SignalFlags, pipe: &mut UnixStream) {
    flags.request_terminate();
    pipe.write_all(&[1]).unwrap();
}

async fn udp_exchange(server: SocketAddr, packet: &[u8]) -> Vec<u8> {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sock.send_to(packet, server).await.unwrap();
    let mut buf = [0u8; 512];
    let (n, _) = timeout(WAIT, sock.recv_from(&mut buf)).await.unwrap().unwrap();
    buf[..n].to_vec()
}

#[tokio::test]
async fn forwards_udp_and_answers_tcp_from_hosts() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let hosts = dir.path().join("hosts");
    fs::write(&hosts, "192.168.1.1 router.lan\n").unwrap();

    let config = ServerConfig {
        servers: vec![upstream.local_addr().unwrap()],
        addn_hosts: Some(hosts),
        ..base_config()
    };
    let services = services(&config, None);
    let dns = services.listeners.listeners[0].addr;
    let flags = Arc::new(SignalFlags::new(false));
    let (reader, mut writer) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    let reactor = Reactor::new(config, Arc::clone(&flags), reader, services);

    let client = async {
        let mock = async {
            let mut buf = [0u8; 512];
            let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
            upstream
                .send_to(&answer(&buf[..n], [93, 184, 216, 34]), from)
                .await
                .unwrap();
        };
        let forwarded = query(0x1234, "example.com");
        let ((), reply) = tokio::join!(mock, udp_exchange(dns, &forwarded));
        assert_eq!(&reply[..2], &0x1234u16.to_be_bytes());
        assert_eq!(reply[3] & 0x0f, 0);
        assert_eq!(&reply[reply.len() - 4..], &[93, 184, 216, 34]);

        let mut stream = TcpStream::connect(dns).await.unwrap();
        let q = query(0x4321, "router.lan");
        stream.write_all(&(q.len() as u16).to_be_bytes()).await.unwrap();
        stream.write_all(&q).await.unwrap();
        let len = timeout(WAIT, stream.read_u16()).await.unwrap().unwrap();
        let mut reply = vec![0u8; len as usize];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &0x4321u16.to_be_bytes());
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 1, 1]);

        terminate(&flags, &mut writer);
    };

    let (result, ()) = tokio::join!(reactor.run(), client);
    result.unwrap();
}

#[tokio::test]
async fn reload_rereads_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let hosts = dir.path().join("hosts");
    fs::write(&hosts, "10.0.0.1 nas.lan\n").unwrap();

    let config = ServerConfig {
        addn_hosts: Some(hosts.clone()),
        ..base_config()
    };
    let services = services(&config, None);
    let dns = services.listeners.listeners[0].addr;
    let flags = Arc::new(SignalFlags::new(false));
    let (reader, mut writer) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    let reactor = Reactor::new(config, Arc::clone(&flags), reader, services);

    let client = async {
        let reply = udp_exchange(dns, &query(1, "nas.lan")).await;
        assert_eq!(&reply[reply.len() - 4..], &[10, 0, 0, 1]);

        fs::write(&hosts, "10.0.0.2 nas.lan\n").unwrap();
        flags.request_reload();
        writer.write_all(&[1]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply = udp_exchange(dns, &query(2, "nas.lan")).await;
        assert_eq!(&reply[reply.len() - 4..], &[10, 0, 0, 2]);

        terminate(&flags, &mut writer);
    };

    let (result, ()) = tokio::join!(reactor.run(), client);
    result.unwrap();
}

#[tokio::test]
async fn lease_names_resolve_and_leases_are_written_on_exit() {
    let dir = tempfile::tempdir().unwrap();
    let lease_file = dir.path().join("leases");
    let mut store = LeaseStore::init(Some(&lease_file), Some("lan"), 0, 10).unwrap();
    let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    assert!(store.upsert(mac, Ipv4Addr::new(10, 0, 0, 50), Some("laptop".into()), 0, 0));

    let config = ServerConfig {
        lease_file: Some(lease_file.clone()),
        lease_dump_interval: Some(Duration::from_secs(3600)),
        ..base_config()
    };
    let services = services(&config, Some(store));
    let dns = services.listeners.listeners[0].addr;
    // Alarm starts clear so the test process never arms SIGALRM.
    let flags = Arc::new(SignalFlags::new(false));
    let (reader, mut writer) = UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    let reactor = Reactor::new(config, Arc::clone(&flags), reader, services);

    let client = async {
        let reply = udp_exchange(dns, &query(9, "laptop.lan")).await;
        assert_eq!(&reply[reply.len() - 4..], &[10, 0, 0, 50]);
        terminate(&flags, &mut writer);
    };

    let (result, ()) = tokio::join!(reactor.run(), client);
    result.unwrap();
    assert_eq!(
        fs::read_to_string(&lease_file).unwrap(),
        "0 00:11:22:33:44:55 10.0.0.50 laptop\n"
    );
}

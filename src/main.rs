//! NX9 gateway DNS
//!
//! Caching DNS forwarder and DHCP server for small networks.
//!
//! Author: Sunil Purushottam Thakare

use std::fs::OpenOptions;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use nx9_gateway_dns::{
    cache::DnsCache,
    config::ServerConfig,
    dhcp::{bind_socket, DhcpServer, DHCP_SERVER_PORT},
    errors::DnsError,
    forward::Forwarder,
    interfaces::{enumerate_interfaces, system_interfaces, AccessList},
    leases::LeaseStore,
    lifecycle::{close_unused_descriptors, daemonize, drop_privileges, log_startup, unix_now},
    listeners::ListenerSet,
    reactor::{Reactor, Services},
    servers::QuerySockets,
    signals::{self, SignalFlags},
    tcp::TcpSupervisor,
};

/// Initialize the logger, returning the log file's descriptor if any.
fn init_logging(config: &ServerConfig) -> Result<Option<RawFd>, DnsError> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_micros();
    let mut log_fd = None;
    if let Some(path) = &config.log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log_fd = Some(file.as_raw_fd());
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(log_fd)
}

fn main() -> Result<(), DnsError> {
    // Handlers go in first so no signal sent during startup is lost.
    let flags = Arc::new(SignalFlags::new(false));
    let pipe = signals::register(&flags)?;

    let config = ServerConfig::from_env()?;
    let log_fd = init_logging(&config)?;
    if config.lease_dump_interval.is_some() {
        flags.request_alarm();
    }

    let system = system_interfaces()?;
    let interfaces = enumerate_interfaces(&config, &system)?;

    let listeners = ListenerSet::create(config.port, config.bind_interfaces, &interfaces)?;
    let acl = listeners.wildcard.then(|| AccessList::new(&config, &system));

    let cache = DnsCache::new(config.cache_size, config.log_queries);
    let forwarder = Forwarder::new(&config, acl.clone());
    let supervisor = TcpSupervisor::new(config.max_tcp_sessions, config.tcp_session_lifetime, acl);

    let dhcp = if config.dhcp_enabled() {
        let local: Vec<_> = interfaces
            .iter()
            .filter_map(|iface| match iface.addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        let server = DhcpServer::new(&config.dhcp_ranges, &local)?;
        Some((server, bind_socket(DHCP_SERVER_PORT)?))
    } else {
        None
    };

    let leases = if config.dhcp_enabled() || config.lease_file.is_some() {
        Some(LeaseStore::init(
            config.lease_file.as_deref(),
            config.domain_suffix.as_deref(),
            unix_now(),
            config.max_leases,
        )?)
    } else {
        None
    };

    let query_sockets = QuerySockets::bind(config.query_port)?;

    let services = Services {
        local_addrs: interfaces.iter().map(|iface| iface.addr).collect(),
        listeners,
        query_sockets,
        dhcp,
        leases,
        cache,
        forwarder,
        supervisor,
    };

    if !config.foreground {
        daemonize(config.pid_file.as_deref())?;
        let mut keep = services.raw_fds();
        keep.push(pipe.reader.as_raw_fd());
        keep.extend(&pipe.writer_fds);
        keep.extend(log_fd);
        close_unused_descriptors(&keep)?;
        drop_privileges(config.user.as_deref(), config.group.as_deref())?;
    }

    log_startup(&config, services.listeners.bind_fallback);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if let Some(addr) = config.metrics_addr {
        let _guard = runtime.enter();
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => info!("metrics exporter listening on {}", addr),
            Err(e) => warn!("failed to start metrics exporter on {}: {}", addr, e),
        }
    }

    let reactor = Reactor::new(config, flags, pipe.reader, services);
    runtime.block_on(reactor.run())
}
